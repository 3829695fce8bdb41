//! `stackrun trigger`: mark a stack as changed (or ignored) for the next
//! change detection.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use tracing::instrument;

use crate::core::changes::TriggerKind;
use crate::core::path::ProjectPath;
use crate::io::loader::load_project;
use crate::io::project::ProjectPaths;
use crate::io::triggers::create_trigger;

#[derive(Debug, Clone)]
pub struct TriggerArgs {
    /// Stack path, relative to the working directory or project-absolute.
    pub stack: String,
    pub kind: TriggerKind,
    pub reason: String,
}

/// Create the marker and return its host path.
#[instrument(skip_all, fields(stack = %args.stack))]
pub fn trigger_stack(cwd: &Path, args: &TriggerArgs) -> Result<PathBuf> {
    let paths = ProjectPaths::discover(cwd)?;
    let cwd = cwd
        .canonicalize()
        .with_context(|| format!("resolve {}", cwd.display()))?;
    let scope = ProjectPath::from_host(&paths.root, &cwd)
        .ok_or_else(|| anyhow!("{} is outside the project", cwd.display()))?;
    let stack = scope
        .resolve(&args.stack)
        .with_context(|| format!("{}: invalid stack path", args.stack))?;

    let project = load_project(&paths.root)?;
    if project.stack(&stack).is_none() {
        bail!("{stack}: no stack at this path");
    }
    create_trigger(&paths, &stack, args.kind, &args.reason)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::io::triggers::load_snapshot;
    use crate::test_support::{pp, write_stack};

    #[test]
    fn writes_a_marker_for_an_existing_stack() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join(".stackrun")).expect("control dir");
        write_stack(temp.path(), "/envs/prod", "");

        let args = TriggerArgs {
            stack: "prod".to_string(),
            kind: TriggerKind::Changed,
            reason: "rotate credentials".to_string(),
        };
        let created = trigger_stack(&temp.path().join("envs"), &args).expect("trigger");
        assert!(created.exists());

        let snapshot = load_snapshot(&ProjectPaths::new(
            temp.path().canonicalize().expect("canonicalize"),
        ))
        .expect("snapshot");
        let triggers = snapshot.for_stack(&pp("/envs/prod"));
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].reason, "rotate credentials");
    }

    #[test]
    fn unknown_stack_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join(".stackrun")).expect("control dir");
        let args = TriggerArgs {
            stack: "/missing".to_string(),
            kind: TriggerKind::Ignored,
            reason: String::new(),
        };
        let err = trigger_stack(temp.path(), &args).expect_err("missing stack");
        assert_eq!(err.to_string(), "/missing: no stack at this path");
    }
}
