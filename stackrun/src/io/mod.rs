//! I/O adapters: filesystem, git and process execution.

pub mod config;
pub mod events;
pub mod git;
pub mod loader;
pub mod modules;
pub mod process;
pub mod project;
pub mod runner;
pub mod status;
pub mod triggers;
