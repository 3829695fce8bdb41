//! Stack records produced by the manifest loader.
//!
//! A [`Stack`] is immutable for the duration of one invocation. Ordering
//! references (`after`, `before`, `ordering_paths`) are kept as raw strings and
//! resolved by the graph builder, which is where dangling references turn into
//! warnings.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::core::path::ProjectPath;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid stack id {0:?}: ids must match ^[a-zA-Z0-9_-]{{1,64}}$")]
pub struct InvalidStackId(pub String);

/// Validate a stack ID.
pub fn validate_id(id: &str) -> Result<(), InvalidStackId> {
    static ID_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]{1,64}$").expect("id regex compiles"));
    if ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(InvalidStackId(id.to_string()))
    }
}

/// How a data dependency names its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Target is a stack ID (`[[input]] from_stack_id`).
    SharingInput,
    /// Target is a path relative to the stack (`[[dependency]] config_path`).
    ModuleDependency,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDependency {
    pub target: String,
    pub kind: DependencyKind,
}

impl DataDependency {
    pub fn input(stack_id: impl Into<String>) -> Self {
        Self {
            target: stack_id.into(),
            kind: DependencyKind::SharingInput,
        }
    }

    pub fn module(config_path: impl Into<String>) -> Self {
        Self {
            target: config_path.into(),
            kind: DependencyKind::ModuleDependency,
        }
    }
}

/// One entry of an environment overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvValue {
    Set(String),
    Unset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stack {
    pub path: ProjectPath,
    pub id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub tags: BTreeSet<String>,
    pub after: Vec<String>,
    pub before: Vec<String>,
    pub wants: Vec<String>,
    pub wanted_by: Vec<String>,
    pub watch: Vec<ProjectPath>,
    pub ordering_paths: Vec<String>,
    pub data_dependencies: Vec<DataDependency>,
    pub env: BTreeMap<String, EnvValue>,
}

impl Stack {
    /// Bare stack at `path` with every optional field empty.
    pub fn new(path: ProjectPath) -> Self {
        Self {
            path,
            id: None,
            name: None,
            description: None,
            tags: BTreeSet::new(),
            after: Vec::new(),
            before: Vec::new(),
            wants: Vec::new(),
            wanted_by: Vec::new(),
            watch: Vec::new(),
            ordering_paths: Vec::new(),
            data_dependencies: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Display name: the declared name, else the directory name.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or_else(|| self.path.file_name())
            .unwrap_or("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_ids() {
        assert!(validate_id("vpc").is_ok());
        assert!(validate_id("Net_01-a").is_ok());
        assert!(validate_id(&"x".repeat(64)).is_ok());
        assert!(validate_id(&"x".repeat(65)).is_err());
        assert!(validate_id("").is_err());
        assert!(validate_id("a.b").is_err());
    }

    #[test]
    fn display_name_falls_back_to_directory() {
        let mut stack = Stack::new(ProjectPath::new("/envs/prod").expect("path"));
        assert_eq!(stack.display_name(), "prod");
        stack.name = Some("Production".to_string());
        assert_eq!(stack.display_name(), "Production");
        assert_eq!(Stack::new(ProjectPath::root()).display_name(), "/");
    }
}
