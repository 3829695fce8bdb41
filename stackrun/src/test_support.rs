//! Test-only helpers: git sandboxes, stack manifests, and scripted collaborators.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::env::EnvOverlay;
use crate::core::path::ProjectPath;
use crate::io::events::{EventKind, EventSink, StackEvent};
use crate::io::git::{Git, GitSource};
use crate::io::loader::STACK_MANIFEST;
use crate::io::process::OutputMode;
use crate::io::runner::{CommandRunner, RunOutcome, RunRequest};

/// Shorthand for a project path literal.
pub fn pp(raw: &str) -> ProjectPath {
    ProjectPath::new(raw).expect("project path")
}

/// Write `contents` to `root/rel`, creating parent directories.
pub fn write_file(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel.trim_start_matches('/'));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    fs::write(&path, contents).expect("write file");
}

/// Write a `stack.toml` for the stack at project path `stack`.
///
/// `body` is appended verbatim after an empty `[stack]` header unless it
/// already declares one.
pub fn write_stack(root: &Path, stack: &str, body: &str) {
    let manifest = if body.contains("[stack]") {
        body.to_string()
    } else {
        format!("[stack]\n{body}")
    };
    let rel = format!("{}/{STACK_MANIFEST}", stack.trim_matches('/'));
    write_file(root, rel.trim_start_matches('/'), &manifest);
}

/// Temporary git repository on branch `main` with a local identity.
pub struct TestRepo {
    _dir: TempDir,
    root: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().canonicalize().expect("canonicalize tempdir");
        let repo = Self { _dir: dir, root };
        repo.run_git(&["init", "--quiet"]);
        repo.run_git(&["symbolic-ref", "HEAD", "refs/heads/main"]);
        repo.run_git(&["config", "user.email", "stackrun@example.com"]);
        repo.run_git(&["config", "user.name", "stackrun tests"]);
        repo.run_git(&["config", "commit.gpgsign", "false"]);
        repo
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn git(&self) -> Git {
        Git::new(&self.root)
    }

    pub fn write(&self, rel: &str, contents: &str) {
        write_file(&self.root, rel, contents);
    }

    pub fn write_stack(&self, stack: &str, body: &str) {
        write_stack(&self.root, stack, body);
    }

    /// Stage everything and commit, even when nothing changed.
    pub fn commit_all(&self, message: &str) {
        self.run_git(&["add", "--all"]);
        self.run_git(&["commit", "--quiet", "--allow-empty", "-m", message]);
    }

    pub fn run_git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .expect("spawn git");
        assert!(
            output.status.success(),
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// Canned [`GitSource`] answers.
#[derive(Debug, Clone, Default)]
pub struct FakeGit {
    pub branch: Option<String>,
    pub revisions: BTreeMap<String, String>,
    pub diff: Vec<String>,
    pub untracked: Vec<String>,
    pub uncommitted: Vec<String>,
    pub fail_diff: bool,
}

impl FakeGit {
    pub fn on_branch(branch: &str) -> Self {
        Self {
            branch: Some(branch.to_string()),
            ..Self::default()
        }
    }

    pub fn with_rev(mut self, rev: &str, sha: &str) -> Self {
        self.revisions.insert(rev.to_string(), sha.to_string());
        self
    }

    pub fn with_diff(mut self, files: &[&str]) -> Self {
        self.diff = files.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_untracked(mut self, files: &[&str]) -> Self {
        self.untracked = files.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_uncommitted(mut self, files: &[&str]) -> Self {
        self.uncommitted = files.iter().map(|f| f.to_string()).collect();
        self
    }
}

impl GitSource for FakeGit {
    fn rev_parse(&self, rev: &str) -> Result<String> {
        self.revisions
            .get(rev)
            .cloned()
            .ok_or_else(|| anyhow!("unknown revision {rev:?}"))
    }

    fn current_branch(&self) -> Result<String> {
        self.branch
            .clone()
            .ok_or_else(|| anyhow!("detached HEAD has no branch"))
    }

    fn diff_files(&self, _from: &str, _to: &str) -> Result<Vec<String>> {
        if self.fail_diff {
            return Err(anyhow!("git diff failed: bad object"));
        }
        Ok(self.diff.clone())
    }

    fn untracked_files(&self) -> Result<Vec<String>> {
        Ok(self.untracked.clone())
    }

    fn uncommitted_files(&self) -> Result<Vec<String>> {
        Ok(self.uncommitted.clone())
    }
}

/// One call observed by [`RecordingRunner`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub stack: ProjectPath,
    pub command: Vec<String>,
    pub env: EnvOverlay,
    pub mode: OutputMode,
}

/// [`CommandRunner`] that records calls and returns scripted results.
///
/// Every stack succeeds and prints its own path on stdout unless scripted
/// otherwise. The log holds `start <path>` / `end <path>` entries in the
/// order they happened across worker threads.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    exit_codes: BTreeMap<ProjectPath, i32>,
    start_errors: BTreeMap<ProjectPath, String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<RecordedCall>>,
    log: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `stack` exit with `code`.
    pub fn exit_with(mut self, stack: &str, code: i32) -> Self {
        self.exit_codes.insert(pp(stack), code);
        self
    }

    /// Make `stack` fail to start with `message`.
    pub fn fail_to_start(mut self, stack: &str, message: &str) -> Self {
        self.start_errors.insert(pp(stack), message.to_string());
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Stacks in the order their calls started.
    pub fn started(&self) -> Vec<String> {
        self.calls().iter().map(|c| c.stack.to_string()).collect()
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().expect("log lock").clone()
    }

    /// Position of `entry` in the log; panics when absent.
    pub fn position(&self, entry: &str) -> usize {
        self.log()
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("{entry:?} not in log {:?}", self.log()))
    }

    /// Highest number of calls observed running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, request: &RunRequest<'_>) -> Result<RunOutcome> {
        self.calls.lock().expect("calls lock").push(RecordedCall {
            stack: request.stack.clone(),
            command: request.command.to_vec(),
            env: request.env.clone(),
            mode: request.mode,
        });
        if let Some(message) = self.start_errors.get(request.stack) {
            return Err(anyhow!("{message}"));
        }

        self.log
            .lock()
            .expect("log lock")
            .push(format!("start {}", request.stack));
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.log
            .lock()
            .expect("log lock")
            .push(format!("end {}", request.stack));

        let code = self.exit_codes.get(request.stack).copied().unwrap_or(0);
        Ok(RunOutcome {
            success: code == 0,
            exit_code: Some(code),
            stdout: format!("{}\n", request.stack).into_bytes(),
            stderr: Vec::new(),
        })
    }
}

/// [`EventSink`] that keeps `(stack, kind)` pairs; clones share the log.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<(String, EventKind)>>>);

impl EventLog {
    pub fn events(&self) -> Vec<(String, EventKind)> {
        self.0.lock().expect("event log lock").clone()
    }

    /// Kinds recorded for one stack, in order.
    pub fn kinds_for(&self, stack: &str) -> Vec<EventKind> {
        self.events()
            .into_iter()
            .filter(|(s, _)| s == stack)
            .map(|(_, kind)| kind)
            .collect()
    }
}

impl EventSink for EventLog {
    fn emit(&mut self, event: &StackEvent<'_>) {
        self.0
            .lock()
            .expect("event log lock")
            .push((event.stack.to_string(), event.kind));
    }
}

/// In-memory writer whose clones share one buffer.
#[derive(Debug, Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().expect("buffer lock")).to_string()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("buffer lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Set of project paths from literals.
pub fn path_set(paths: &[&str]) -> BTreeSet<ProjectPath> {
    paths.iter().map(|p| pp(p)).collect()
}
