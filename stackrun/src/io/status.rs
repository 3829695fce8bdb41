//! Cloud status snapshot (`.stackrun/status.json`).
//!
//! The file maps stack paths to their last known status. It is produced by an
//! external sync process; stackrun only reads it.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

use crate::core::path::ProjectPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackStatus {
    Ok,
    Failed,
    Drifted,
    Unknown,
}

/// Value of `--status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Ok,
    Failed,
    Drifted,
    Unknown,
    /// Failed or drifted.
    Unhealthy,
    /// Ok.
    Healthy,
}

impl FromStr for StatusFilter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ok" => Ok(Self::Ok),
            "failed" => Ok(Self::Failed),
            "drifted" => Ok(Self::Drifted),
            "unknown" => Ok(Self::Unknown),
            "unhealthy" => Ok(Self::Unhealthy),
            "healthy" => Ok(Self::Healthy),
            other => Err(anyhow!(
                "invalid status {other:?} (expected ok, failed, drifted, unknown, unhealthy or healthy)"
            )),
        }
    }
}

impl StatusFilter {
    pub fn matches(self, status: StackStatus) -> bool {
        match self {
            Self::Ok | Self::Healthy => status == StackStatus::Ok,
            Self::Failed => status == StackStatus::Failed,
            Self::Drifted => status == StackStatus::Drifted,
            Self::Unknown => status == StackStatus::Unknown,
            Self::Unhealthy => matches!(status, StackStatus::Failed | StackStatus::Drifted),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    statuses: BTreeMap<ProjectPath, StackStatus>,
}

impl StatusSnapshot {
    /// Read the snapshot. A missing file means every stack is unknown.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let raw: BTreeMap<String, StackStatus> =
            serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
        let mut statuses = BTreeMap::new();
        for (stack, status) in raw {
            let stack = ProjectPath::new(&stack)
                .with_context(|| format!("{}: invalid stack path", path.display()))?;
            statuses.insert(stack, status);
        }
        Ok(Self { statuses })
    }

    pub fn status_of(&self, stack: &ProjectPath) -> StackStatus {
        self.statuses
            .get(stack)
            .copied()
            .unwrap_or(StackStatus::Unknown)
    }

    /// Stacks among `stacks` whose status matches `filter`.
    pub fn select<'a>(
        &self,
        stacks: impl IntoIterator<Item = &'a ProjectPath>,
        filter: StatusFilter,
    ) -> BTreeSet<ProjectPath> {
        stacks
            .into_iter()
            .filter(|stack| filter.matches(self.status_of(stack)))
            .cloned()
            .collect()
    }
}
