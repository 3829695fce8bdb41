//! Helpers for running child processes with streamed or captured output.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument};

/// Where a child's stdout/stderr go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Inherit the parent's stdout/stderr.
    Stream,
    /// Collect into buffers, returned in [`CommandOutput`].
    Capture,
}

/// Child process result. Buffers are empty in [`OutputMode::Stream`].
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Run a command to completion without risking pipe deadlocks.
///
/// In capture mode both pipes are drained concurrently while the child runs.
#[instrument(skip_all, fields(mode = ?mode))]
pub fn run_command(mut cmd: Command, mode: OutputMode) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null());
    match mode {
        OutputMode::Stream => {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
        OutputMode::Capture => {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let (stdout, stderr) = match mode {
        OutputMode::Stream => (Vec::new(), Vec::new()),
        OutputMode::Capture => {
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| anyhow!("stdout was not piped"))?;
            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| anyhow!("stderr was not piped"))?;
            let stdout_handle = thread::spawn(move || read_stream(stdout));
            let stderr_handle = thread::spawn(move || read_stream(stderr));
            let stdout = join_output(stdout_handle).context("join stdout")?;
            let stderr = join_output(stderr_handle).context("join stderr")?;
            (stdout, stderr)
        }
    };

    let status = child.wait().context("wait for command")?;
    debug!(exit_code = ?status.code(), "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
    })
}

fn join_output(handle: thread::JoinHandle<Result<Vec<u8>>>) -> Result<Vec<u8>> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream<R: Read>(mut reader: R) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).context("read output")?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_stderr_separately() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo err >&2; exit 3");
        let output = run_command(cmd, OutputMode::Capture).expect("run");
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(String::from_utf8_lossy(&output.stdout), "out\n");
        assert_eq!(String::from_utf8_lossy(&output.stderr), "err\n");
    }

    #[test]
    fn large_output_does_not_deadlock() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("yes x | head -c 200000; yes y | head -c 200000 >&2");
        let output = run_command(cmd, OutputMode::Capture).expect("run");
        assert!(output.status.success());
        assert_eq!(output.stdout.len(), 200_000);
        assert_eq!(output.stderr.len(), 200_000);
    }

    #[test]
    fn stream_mode_returns_empty_buffers() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("true");
        let output = run_command(cmd, OutputMode::Stream).expect("run");
        assert!(output.status.success());
        assert!(output.stdout.is_empty());
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let cmd = Command::new("definitely-not-a-real-binary-xyz");
        assert!(run_command(cmd, OutputMode::Capture).is_err());
    }
}
