//! Stack manifest loader.
//!
//! Every directory holding a `stack.toml` is a stack. Directory-level
//! `stackrun.toml` files contribute `[env]` layers. Hidden directories are
//! skipped, which keeps `.git/` and `.stackrun/` out of the walk.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::core::env::EnvLayer;
use crate::core::path::ProjectPath;
use crate::core::stack::{DataDependency, Stack, validate_id};
use crate::core::tags::validate_tag;
use crate::io::config::{EnvEntry, env_layer, validate_env_keys};

pub const STACK_MANIFEST: &str = "stack.toml";
pub const DIRECTORY_CONFIG: &str = "stackrun.toml";

/// Stacks plus directory env layers, as read from disk.
#[derive(Debug, Clone, Default)]
pub struct LoadedProject {
    /// Sorted by path.
    pub stacks: Vec<Stack>,
    pub directory_env: BTreeMap<ProjectPath, EnvLayer>,
}

impl LoadedProject {
    pub fn stack(&self, path: &ProjectPath) -> Option<&Stack> {
        self.stacks
            .binary_search_by(|s| s.path.cmp(path))
            .ok()
            .map(|idx| &self.stacks[idx])
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct StackManifest {
    stack: StackSection,
    input: Vec<InputBlock>,
    dependency: Vec<DependencyBlock>,
    dependencies: DependenciesSection,
    env: BTreeMap<String, EnvEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct StackSection {
    id: Option<String>,
    name: Option<String>,
    description: Option<String>,
    tags: Vec<String>,
    after: Vec<String>,
    before: Vec<String>,
    wants: Vec<String>,
    wanted_by: Vec<String>,
    watch: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InputBlock {
    #[allow(dead_code)]
    name: String,
    from_stack_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DependencyBlock {
    config_path: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DependenciesSection {
    paths: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DirectoryConfig {
    env: BTreeMap<String, EnvEntry>,
}

/// Walk `root` and load every stack manifest and directory config.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn load_project(root: &Path) -> Result<LoadedProject> {
    let mut project = LoadedProject::default();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()));

    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(dir) = entry.path().parent() else {
            continue;
        };
        let Some(dir_path) = ProjectPath::from_host(root, dir) else {
            continue;
        };
        match entry.file_name().to_str() {
            Some(STACK_MANIFEST) => {
                let stack = load_stack(entry.path(), dir_path)?;
                debug!(stack = %stack.path, "loaded stack");
                project.stacks.push(stack);
            }
            Some(DIRECTORY_CONFIG) => {
                let layer = load_directory_env(entry.path())?;
                if !layer.is_empty() {
                    project.directory_env.insert(dir_path, layer);
                }
            }
            _ => {}
        }
    }

    project.stacks.sort_by(|a, b| a.path.cmp(&b.path));
    debug!(count = project.stacks.len(), "project loaded");
    Ok(project)
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|n| n.starts_with('.'))
}

fn load_stack(manifest: &Path, path: ProjectPath) -> Result<Stack> {
    let contents =
        fs::read_to_string(manifest).with_context(|| format!("read {}", manifest.display()))?;
    let parsed: StackManifest =
        toml::from_str(&contents).with_context(|| format!("parse {}", manifest.display()))?;
    stack_from_manifest(path, parsed).with_context(|| format!("invalid {}", manifest.display()))
}

fn stack_from_manifest(path: ProjectPath, manifest: StackManifest) -> Result<Stack> {
    let section = manifest.stack;
    let mut stack = Stack::new(path);

    if let Some(id) = &section.id {
        validate_id(id)?;
    }
    let mut tags = BTreeSet::new();
    for tag in section.tags {
        validate_tag(&tag)?;
        tags.insert(tag);
    }
    let mut watch = Vec::with_capacity(section.watch.len());
    for entry in &section.watch {
        let file = stack
            .path
            .resolve(entry)
            .map_err(|e| anyhow!("watch entry {entry:?}: {e}"))?;
        watch.push(file);
    }

    let mut data_dependencies = Vec::new();
    for input in manifest.input {
        data_dependencies.push(DataDependency::input(input.from_stack_id));
    }
    for dependency in manifest.dependency {
        data_dependencies.push(DataDependency::module(dependency.config_path));
    }

    stack.id = section.id;
    stack.name = section.name;
    stack.description = section.description;
    stack.tags = tags;
    stack.after = section.after;
    stack.before = section.before;
    stack.wants = section.wants;
    stack.wanted_by = section.wanted_by;
    stack.watch = watch;
    stack.ordering_paths = manifest.dependencies.paths;
    stack.data_dependencies = data_dependencies;
    validate_env_keys(&manifest.env).context("env")?;
    stack.env = env_layer(&manifest.env);
    Ok(stack)
}

fn load_directory_env(path: &Path) -> Result<EnvLayer> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let parsed: DirectoryConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    validate_env_keys(&parsed.env).with_context(|| format!("invalid {}", path.display()))?;
    Ok(env_layer(&parsed.env))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stack::{DependencyKind, EnvValue};

    fn p(raw: &str) -> ProjectPath {
        ProjectPath::new(raw).expect("path")
    }

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, contents).expect("write");
    }

    #[test]
    fn loads_full_manifest() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(
            temp.path(),
            "envs/app/stack.toml",
            r#"
[stack]
id = "app"
name = "App"
tags = ["web", "prod"]
after = ["../vpc", "tag:base"]
wants = ["/monitoring"]
watch = ["../../shared/versions.tf"]

[[input]]
name = "vpc_id"
from_stack_id = "vpc"

[[dependency]]
config_path = "../db"

[dependencies]
paths = ["../bootstrap"]

[env]
REGION = "eu-west-1"
TF_LOG = { unset = true }
"#,
        );

        let project = load_project(temp.path()).expect("load");
        assert_eq!(project.stacks.len(), 1);
        let stack = &project.stacks[0];
        assert_eq!(stack.path, p("/envs/app"));
        assert_eq!(stack.id.as_deref(), Some("app"));
        assert_eq!(stack.display_name(), "App");
        assert!(stack.tags.contains("web"));
        assert_eq!(stack.after, vec!["../vpc", "tag:base"]);
        assert_eq!(stack.watch, vec![p("/shared/versions.tf")]);
        assert_eq!(stack.ordering_paths, vec!["../bootstrap"]);
        let kinds: Vec<DependencyKind> = stack.data_dependencies.iter().map(|d| d.kind).collect();
        assert_eq!(
            kinds,
            vec![DependencyKind::SharingInput, DependencyKind::ModuleDependency]
        );
        assert_eq!(stack.env["TF_LOG"], EnvValue::Unset);
    }

    #[test]
    fn skips_hidden_directories_and_sorts() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "b/stack.toml", "");
        write(temp.path(), "a/stack.toml", "[stack]\n");
        write(temp.path(), "a/nested/stack.toml", "");
        write(temp.path(), ".hidden/stack.toml", "");
        write(temp.path(), "stackrun.toml", "[env]\nROOT = \"1\"\n");

        let project = load_project(temp.path()).expect("load");
        let paths: Vec<&str> = project.stacks.iter().map(|s| s.path.as_str()).collect();
        assert_eq!(paths, vec!["/a", "/a/nested", "/b"]);
        assert!(project.stack(&p("/a/nested")).is_some());
        assert!(project.stack(&p("/c")).is_none());
        assert_eq!(
            project.directory_env[&ProjectPath::root()]["ROOT"],
            EnvValue::Set("1".to_string())
        );
    }

    #[test]
    fn invalid_tags_and_ids_are_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "a/stack.toml", "[stack]\ntags = [\"Bad\"]\n");
        let err = load_project(temp.path()).expect_err("bad tag");
        assert!(format!("{err:#}").contains("invalid tag"));

        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "a/stack.toml", "[stack]\nid = \"has space\"\n");
        assert!(load_project(temp.path()).is_err());
    }

    #[test]
    fn invalid_env_keys_are_fatal_in_every_layer() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "a/stack.toml", "[env]\n\"A=B\" = \"x\"\n");
        let err = load_project(temp.path()).expect_err("bad stack env");
        let message = format!("{err:#}");
        assert!(message.contains("stack.toml"), "{message}");
        assert!(message.contains("invalid variable name \"A=B\""), "{message}");

        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "a/stack.toml", "");
        write(temp.path(), "stackrun.toml", "[env]\n\"\" = \"x\"\n");
        let err = load_project(temp.path()).expect_err("bad directory env");
        assert!(format!("{err:#}").contains("stackrun.toml"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "a/stack.toml", "[stack]\nafterr = []\n");
        assert!(load_project(temp.path()).is_err());
    }
}
