//! Per-stack environment overlay.
//!
//! Layers are applied farthest first: project config `[run.env]`, then every
//! directory `stackrun.toml [env]` from the root down to the stack directory,
//! then the stack's own `[env]`. The nearest declaration wins, and an unset
//! entry removes whatever an outer layer (or the host) provided.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;

use crate::core::path::ProjectPath;
use crate::core::stack::{EnvValue, Stack};

pub type EnvLayer = BTreeMap<String, EnvValue>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverlay {
    pub set: BTreeMap<String, String>,
    pub unset: BTreeSet<String>,
}

impl EnvOverlay {
    fn apply(&mut self, layer: &EnvLayer) {
        for (key, value) in layer {
            match value {
                EnvValue::Set(value) => {
                    self.unset.remove(key);
                    self.set.insert(key.clone(), value.clone());
                }
                EnvValue::Unset => {
                    self.set.remove(key);
                    self.unset.insert(key.clone());
                }
            }
        }
    }

    /// Value of `key` after applying the overlay on top of `host`.
    pub fn effective(&self, key: &str, host: Option<OsString>) -> Option<OsString> {
        if let Some(value) = self.set.get(key) {
            return Some(OsString::from(value));
        }
        if self.unset.contains(key) {
            return None;
        }
        host
    }
}

pub fn resolve(
    stack: &Stack,
    project: &EnvLayer,
    directories: &BTreeMap<ProjectPath, EnvLayer>,
) -> EnvOverlay {
    let mut overlay = EnvOverlay::default();
    overlay.apply(project);

    let mut dirs: Vec<ProjectPath> = stack.path.ancestors().collect();
    dirs.reverse();
    dirs.push(stack.path.clone());
    for dir in &dirs {
        if let Some(layer) = directories.get(dir) {
            overlay.apply(layer);
        }
    }

    overlay.apply(&stack.env);
    overlay
}
