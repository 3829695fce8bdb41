//! Command runner abstraction for per-stack execution.
//!
//! The [`CommandRunner`] trait decouples the scheduler from process spawning.
//! Tests use recording runners that return scripted results without spawning
//! processes.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument};

use crate::core::env::EnvOverlay;
use crate::core::path::ProjectPath;
use crate::io::process::{OutputMode, run_command};

/// Parameters for running the user command in one stack.
#[derive(Debug, Clone)]
pub struct RunRequest<'a> {
    pub stack: &'a ProjectPath,
    /// Host directory of the stack.
    pub workdir: PathBuf,
    /// Program followed by its arguments.
    pub command: &'a [String],
    pub env: &'a EnvOverlay,
    pub mode: OutputMode,
}

/// Result of a command that was started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Abstraction over how a stack's command is executed.
///
/// `Err` means the command could not be started at all (for example a missing
/// executable); a non-zero exit is an `Ok` outcome with `success == false`.
pub trait CommandRunner: Sync {
    fn run(&self, request: &RunRequest<'_>) -> Result<RunOutcome>;
}

/// Runner that spawns real processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    #[instrument(skip_all, fields(stack = %request.stack))]
    fn run(&self, request: &RunRequest<'_>) -> Result<RunOutcome> {
        let (program, args) = request
            .command
            .split_first()
            .ok_or_else(|| anyhow!("no command given"))?;

        let path = request.env.effective("PATH", std::env::var_os("PATH"));
        let executable = resolve_executable(program, path, &request.workdir)?;
        debug!(executable = %executable.display(), "resolved executable");

        let mut cmd = Command::new(&executable);
        cmd.args(args).current_dir(&request.workdir);
        for key in &request.env.unset {
            cmd.env_remove(key);
        }
        cmd.envs(&request.env.set);

        let output = run_command(cmd, request.mode)?;
        Ok(RunOutcome {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Look `program` up on the effective `PATH`, relative to `workdir` when it
/// contains a path separator.
pub fn resolve_executable(
    program: &str,
    path: Option<OsString>,
    workdir: &std::path::Path,
) -> Result<PathBuf> {
    which::which_in(program, path, workdir)
        .map_err(|_| anyhow!("{program}: executable file not found in $PATH"))
}
