//! Local Terraform module discovery.
//!
//! Scans `.tf` files for `source = "./..."` / `source = "../..."` and follows
//! the referenced directories transitively. Remote sources are ignored.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, warn};

use crate::core::path::ProjectPath;
use crate::core::stack::Stack;

static SOURCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*source\s*=\s*"(\.\.?/[^"]*)""#).expect("source regex compiles")
});

/// Map each stack to every local module directory it references, directly or
/// through other modules.
pub fn local_modules(
    root: &Path,
    stacks: &[Stack],
) -> Result<BTreeMap<ProjectPath, BTreeSet<ProjectPath>>> {
    let mut direct_cache: BTreeMap<ProjectPath, BTreeSet<ProjectPath>> = BTreeMap::new();
    let mut out = BTreeMap::new();
    for stack in stacks {
        let mut seen = BTreeSet::new();
        let mut pending = direct_sources(root, &stack.path, &mut direct_cache)?;
        while let Some(module) = pending.pop_first() {
            if module == stack.path || !seen.insert(module.clone()) {
                continue;
            }
            pending.extend(direct_sources(root, &module, &mut direct_cache)?);
        }
        if !seen.is_empty() {
            debug!(stack = %stack.path, modules = seen.len(), "local modules");
            out.insert(stack.path.clone(), seen);
        }
    }
    Ok(out)
}

fn direct_sources(
    root: &Path,
    dir: &ProjectPath,
    cache: &mut BTreeMap<ProjectPath, BTreeSet<ProjectPath>>,
) -> Result<BTreeSet<ProjectPath>> {
    if let Some(found) = cache.get(dir) {
        return Ok(found.clone());
    }
    let host = dir.to_host(root);
    let mut found = BTreeSet::new();
    if host.is_dir() {
        let mut files: Vec<_> = fs::read_dir(&host)
            .with_context(|| format!("read directory {}", host.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "tf") && path.is_file())
            .collect();
        files.sort();
        for file in files {
            let contents =
                fs::read_to_string(&file).with_context(|| format!("read {}", file.display()))?;
            for source in parse_sources(&contents) {
                match dir.resolve(source) {
                    Ok(module) => {
                        found.insert(module);
                    }
                    Err(_) => warn!(
                        file = %file.display(),
                        source,
                        "module source points outside the project; ignoring"
                    ),
                }
            }
        }
    }
    cache.insert(dir.clone(), found.clone());
    Ok(found)
}

/// Local module sources referenced by one `.tf` file.
pub fn parse_sources(contents: &str) -> Vec<&str> {
    SOURCE_RE
        .captures_iter(contents)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect()
}
