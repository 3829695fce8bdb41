//! Deterministic, pure logic for stack orchestration.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! stack records and return deterministic outputs suitable for tests.

pub mod changes;
pub mod data;
pub mod env;
pub mod graph;
pub mod hierarchy;
pub mod order;
pub mod path;
pub mod selection;
pub mod stack;
pub mod state;
pub mod tags;
