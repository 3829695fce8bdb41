//! Stack orchestration for infrastructure-as-code monorepos.
//!
//! A project is a directory tree in which every directory holding a
//! `stack.toml` is a stack. stackrun detects which stacks changed, selects
//! stacks through tags and data dependencies, and runs a command in each of
//! them in a parallel, dependency-respecting order. The architecture keeps a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (paths, graphs, selection algebra,
//!   change classification, run state). No I/O.
//! - **[`io`]**: Side-effecting operations (filesystem, git, process execution,
//!   event sinks). Isolated behind traits where tests need to substitute them.
//!
//! Orchestration modules ([`changed`], [`selection`], [`schedule`], [`run`],
//! [`list`], [`trigger`]) coordinate core logic with I/O to implement CLI
//! commands.

pub mod changed;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod list;
pub mod logging;
pub mod run;
pub mod schedule;
pub mod selection;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod trigger;
