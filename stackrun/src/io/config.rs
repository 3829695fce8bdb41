//! Project configuration stored under `.stackrun/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

use crate::core::env::EnvLayer;
use crate::core::stack::EnvValue;

/// Project configuration (TOML).
///
/// Edited by humans; every field is optional and missing fields take the
/// defaults below.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    pub git: GitConfig,
    pub change_detection: ChangeDetectionConfig,
    pub run: RunConfig,
    pub cloud: CloudConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct GitConfig {
    pub default_branch: String,
    pub default_remote: String,
    /// Refuse to run with untracked files present.
    pub check_untracked: bool,
    /// Refuse to run with uncommitted changes present.
    pub check_uncommitted: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            default_branch: "main".to_string(),
            default_remote: "origin".to_string(),
            check_untracked: true,
            check_uncommitted: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnGitError {
    #[default]
    Fail,
    Warn,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ChangeDetectionConfig {
    pub git_untracked: bool,
    pub git_uncommitted: bool,
    /// Follow local module sources in `.tf` files.
    pub terraform_modules: bool,
    pub on_git_error: OnGitError,
}

impl Default for ChangeDetectionConfig {
    fn default() -> Self {
        Self {
            git_untracked: true,
            git_uncommitted: true,
            terraform_modules: true,
            on_git_error: OnGitError::Fail,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Worker count when `--parallel` is not given.
    pub parallel: usize,
    pub env: BTreeMap<String, EnvEntry>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            parallel: 1,
            env: BTreeMap::new(),
        }
    }
}

impl RunConfig {
    pub fn env_layer(&self) -> EnvLayer {
        env_layer(&self.env)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CloudConfig {
    /// Status snapshot, relative to the project root.
    pub status_file: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            status_file: ".stackrun/status.json".to_string(),
        }
    }
}

/// An `[env]` entry: a plain string, or `{ unset = true }`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum EnvEntry {
    Value(String),
    Unset { unset: bool },
}

/// Reject `[env]` keys that cannot name a process environment variable.
pub fn validate_env_keys(entries: &BTreeMap<String, EnvEntry>) -> Result<()> {
    for key in entries.keys() {
        if key.is_empty() || key.contains(['=', '\0']) {
            return Err(anyhow!("invalid variable name {key:?}"));
        }
    }
    Ok(())
}

/// Convert parsed `[env]` entries into an overlay layer.
/// `{ unset = false }` is treated as absent.
pub fn env_layer(entries: &BTreeMap<String, EnvEntry>) -> EnvLayer {
    entries
        .iter()
        .filter_map(|(key, entry)| match entry {
            EnvEntry::Value(value) => Some((key.clone(), EnvValue::Set(value.clone()))),
            EnvEntry::Unset { unset: true } => Some((key.clone(), EnvValue::Unset)),
            EnvEntry::Unset { unset: false } => None,
        })
        .collect()
}

impl ProjectConfig {
    pub fn validate(&self) -> Result<()> {
        if self.run.parallel == 0 {
            return Err(anyhow!("run.parallel must be > 0"));
        }
        if self.git.default_branch.trim().is_empty() {
            return Err(anyhow!("git.default_branch must not be empty"));
        }
        if self.git.default_remote.trim().is_empty() {
            return Err(anyhow!("git.default_remote must not be empty"));
        }
        if self.cloud.status_file.trim().is_empty() {
            return Err(anyhow!("cloud.status_file must not be empty"));
        }
        validate_env_keys(&self.run.env).context("run.env")
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ProjectConfig::default()`.
pub fn load_config(path: &Path) -> Result<ProjectConfig> {
    if !path.exists() {
        let cfg = ProjectConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ProjectConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ProjectConfig::default());
        assert_eq!(cfg.run.parallel, 1);
        assert_eq!(cfg.git.default_branch, "main");
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            r#"
[change_detection]
git_untracked = false
on_git_error = "warn"

[run]
parallel = 4

[run.env]
REGION = "eu-west-1"
TF_LOG = { unset = true }
"#,
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert!(!cfg.change_detection.git_untracked);
        assert!(cfg.change_detection.git_uncommitted);
        assert_eq!(cfg.change_detection.on_git_error, OnGitError::Warn);
        assert_eq!(cfg.run.parallel, 4);
        let layer = cfg.run.env_layer();
        assert_eq!(layer["REGION"], EnvValue::Set("eu-west-1".to_string()));
        assert_eq!(layer["TF_LOG"], EnvValue::Unset);
        assert_eq!(cfg.git, GitConfig::default());
    }

    #[test]
    fn rejects_zero_parallelism_and_unknown_keys() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[run]\nparallel = 0\n").expect("write");
        assert!(load_config(&path).is_err());

        fs::write(&path, "[git]\nbranch = \"dev\"\n").expect("write");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn rejects_unusable_env_keys() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[run.env]\n\"A=B\" = \"x\"\n").expect("write");
        let err = load_config(&path).expect_err("bad key");
        assert!(format!("{err:#}").contains("run.env: invalid variable name \"A=B\""));

        fs::write(&path, "[run.env]\n\"\" = \"x\"\n").expect("write");
        assert!(load_config(&path).is_err());
    }
}
