//! Project root discovery and the canonical paths under `.stackrun/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::core::changes::CONTROL_DIR;

/// All canonical paths for a project root.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub control_dir: PathBuf,
    pub config_path: PathBuf,
    pub triggers_dir: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let control_dir = root.join(CONTROL_DIR);
        Self {
            root: root.clone(),
            config_path: control_dir.join("config.toml"),
            triggers_dir: control_dir.join("triggers"),
            control_dir,
        }
    }

    /// Nearest ancestor of `start` (inclusive) holding `.stackrun/` or `.git`.
    pub fn discover(start: &Path) -> Result<Self> {
        let start = start
            .canonicalize()
            .with_context(|| format!("resolve {}", start.display()))?;
        start
            .ancestors()
            .find(|dir| dir.join(CONTROL_DIR).is_dir() || dir.join(".git").exists())
            .map(Self::new)
            .ok_or_else(|| {
                anyhow!(
                    "no project root found from {} (expected a {CONTROL_DIR}/ or .git directory)",
                    start.display()
                )
            })
    }
}
