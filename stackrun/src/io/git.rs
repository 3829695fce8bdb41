//! Git adapter for change detection and repository safeguards.
//!
//! A small, explicit wrapper around `git` subprocess calls. Orchestration code
//! depends on the [`GitSource`] trait so tests can substitute canned answers.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Git queries needed by change detection.
///
/// File lists are relative to the project root, `/`-separated, as git prints them.
pub trait GitSource {
    /// Resolve a revision to a full commit SHA.
    fn rev_parse(&self, rev: &str) -> Result<String>;
    /// Current branch name; errors on detached HEAD.
    fn current_branch(&self) -> Result<String>;
    /// Files that differ between two commits.
    fn diff_files(&self, from: &str, to: &str) -> Result<Vec<String>>;
    /// Untracked files not ignored by `.gitignore`.
    fn untracked_files(&self) -> Result<Vec<String>>;
    /// Tracked files with uncommitted modifications.
    fn uncommitted_files(&self) -> Result<Vec<String>>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True if the working directory is inside a git work tree.
    pub fn is_repository(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Run a `-z` listing command and split its output on NUL.
    ///
    /// NUL-separated output is never quoted, so non-ASCII paths come back verbatim.
    fn run_paths(&self, args: &[&str]) -> Result<Vec<String>> {
        let output = self.run_checked(args)?;
        output
            .stdout
            .split(|byte| *byte == 0)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                String::from_utf8(entry.to_vec())
                    .with_context(|| format!("git {} printed a non-UTF-8 path", args.join(" ")))
            })
            .collect()
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl GitSource for Git {
    fn rev_parse(&self, rev: &str) -> Result<String> {
        let commit = format!("{rev}^{{commit}}");
        let out = self
            .run_capture(&["rev-parse", "--verify", "--quiet", &commit])
            .with_context(|| format!("resolve revision {rev:?}"))?;
        Ok(out.trim().to_string())
    }

    #[instrument(skip_all)]
    fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            return Err(anyhow!("detached HEAD has no branch"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    #[instrument(skip_all, fields(from = %from, to = %to))]
    fn diff_files(&self, from: &str, to: &str) -> Result<Vec<String>> {
        let range = format!("{from}..{to}");
        let files = self.run_paths(&["diff", "--name-only", "--relative", "-z", &range])?;
        debug!(count = files.len(), "diff files");
        Ok(files)
    }

    fn untracked_files(&self) -> Result<Vec<String>> {
        self.run_paths(&["ls-files", "-z", "--others", "--exclude-standard"])
    }

    fn uncommitted_files(&self) -> Result<Vec<String>> {
        self.run_paths(&["ls-files", "-z", "--modified", "--exclude-standard"])
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn lists_diff_untracked_and_uncommitted() {
        let repo = TestRepo::new();
        repo.write("a/main.tf", "# a\n");
        repo.commit_all("first");
        let base = repo.git().rev_parse("HEAD").expect("rev-parse");

        repo.write("b/main.tf", "# b\n");
        repo.commit_all("second");
        repo.write("a/main.tf", "# changed\n");
        repo.write("c/new.tf", "# new\n");

        let git = repo.git();
        let head = git.rev_parse("HEAD").expect("rev-parse");
        assert_ne!(base, head);
        assert_eq!(git.diff_files(&base, &head).expect("diff"), vec!["b/main.tf"]);
        assert_eq!(git.uncommitted_files().expect("modified"), vec!["a/main.tf"]);
        assert_eq!(git.untracked_files().expect("untracked"), vec!["c/new.tf"]);
        assert_eq!(git.current_branch().expect("branch"), "main");
        assert!(git.is_repository());
    }

    #[test]
    fn non_ascii_paths_are_not_quoted() {
        let repo = TestRepo::new();
        repo.write("café/main.tf", "# a\n");
        repo.commit_all("first");
        let base = repo.git().rev_parse("HEAD").expect("rev-parse");
        repo.write("café/main.tf", "# b\n");
        repo.commit_all("second");
        repo.write("café/main.tf", "# c\n");
        repo.write("naïve dir/new.tf", "# new\n");

        let git = repo.git();
        let head = git.rev_parse("HEAD").expect("rev-parse");
        assert_eq!(git.diff_files(&base, &head).expect("diff"), vec!["café/main.tf"]);
        assert_eq!(git.uncommitted_files().expect("modified"), vec!["café/main.tf"]);
        assert_eq!(git.untracked_files().expect("untracked"), vec!["naïve dir/new.tf"]);
    }

    #[test]
    fn rev_parse_rejects_unknown_revisions() {
        let repo = TestRepo::new();
        repo.commit_all("first");
        assert!(repo.git().rev_parse("no-such-ref").is_err());
    }

    #[test]
    fn plain_directory_is_not_a_repository() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("x")).expect("mkdir");
        assert!(!Git::new(temp.path().join("x")).is_repository());
    }
}
