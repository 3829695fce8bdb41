//! Trigger markers under `.stackrun/triggers/<stack path>/`.
//!
//! A marker is a small TOML file (`kind`, `reason`, `ctime`). Markers are read
//! once per invocation into an immutable [`TriggerSnapshot`]; whether a marker
//! is active is decided later against the changed paths.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::core::changes::{Trigger, TriggerKind, TriggerSnapshot};
use crate::core::path::ProjectPath;
use crate::io::project::ProjectPaths;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct TriggerFile {
    kind: TriggerKind,
    #[serde(default)]
    reason: String,
    ctime: i64,
}

/// Read every marker currently on disk. Malformed files are skipped with a warning.
#[instrument(skip_all)]
pub fn load_snapshot(paths: &ProjectPaths) -> Result<TriggerSnapshot> {
    if !paths.triggers_dir.is_dir() {
        return Ok(TriggerSnapshot::default());
    }

    let mut triggers = Vec::new();
    for entry in WalkDir::new(&paths.triggers_dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk {}", paths.triggers_dir.display()))?;
        if !entry.file_type().is_file()
            || entry.path().extension().and_then(|e| e.to_str()) != Some("toml")
        {
            continue;
        }
        match read_trigger(paths, entry.path()) {
            Ok(trigger) => triggers.push(trigger),
            Err(err) => warn!(file = %entry.path().display(), "skipping trigger: {err:#}"),
        }
    }
    debug!(count = triggers.len(), "trigger snapshot loaded");
    Ok(TriggerSnapshot::new(triggers))
}

fn read_trigger(paths: &ProjectPaths, file: &Path) -> Result<Trigger> {
    let dir = file
        .parent()
        .ok_or_else(|| anyhow!("trigger file has no parent"))?;
    let stack = ProjectPath::from_host(&paths.triggers_dir, dir)
        .ok_or_else(|| anyhow!("trigger outside {}", paths.triggers_dir.display()))?;
    let location = ProjectPath::from_host(&paths.root, file)
        .ok_or_else(|| anyhow!("trigger outside project root"))?;
    let contents = fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let parsed: TriggerFile =
        toml::from_str(&contents).with_context(|| format!("parse {}", file.display()))?;
    Ok(Trigger {
        stack,
        kind: parsed.kind,
        reason: parsed.reason,
        file: location,
    })
}

/// Write a new marker for `stack` and return its host path.
#[instrument(skip_all, fields(stack = %stack, kind = kind.as_str()))]
pub fn create_trigger(
    paths: &ProjectPaths,
    stack: &ProjectPath,
    kind: TriggerKind,
    reason: &str,
) -> Result<PathBuf> {
    let ctime = Utc::now().timestamp();
    let dir = stack.to_host(&paths.triggers_dir);
    fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;

    let mut path = dir.join(format!("{}-{ctime}.toml", kind.as_str()));
    let mut suffix = 1;
    while path.exists() {
        path = dir.join(format!("{}-{ctime}-{suffix}.toml", kind.as_str()));
        suffix += 1;
    }

    let body = toml::to_string(&TriggerFile {
        kind,
        reason: reason.to_string(),
        ctime,
    })
    .context("serialize trigger")?;
    fs::write(&path, body).with_context(|| format!("write {}", path.display()))?;
    debug!(path = %path.display(), "trigger created");
    Ok(path)
}
