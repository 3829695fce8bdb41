//! Containment between stack directories.
//!
//! Used for change attribution and reference expansion; never consulted by
//! the scheduler.

use std::collections::BTreeSet;

use crate::core::path::ProjectPath;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hierarchy {
    stacks: BTreeSet<ProjectPath>,
}

impl Hierarchy {
    pub fn new<'a>(paths: impl IntoIterator<Item = &'a ProjectPath>) -> Self {
        Self {
            stacks: paths.into_iter().cloned().collect(),
        }
    }

    pub fn contains(&self, path: &ProjectPath) -> bool {
        self.stacks.contains(path)
    }

    /// Nearest stack enclosing `path` (a stack directory encloses itself).
    pub fn owner_of(&self, path: &ProjectPath) -> Option<&ProjectPath> {
        if let Some(own) = self.stacks.get(path) {
            return Some(own);
        }
        path.ancestors().find_map(|a| self.stacks.get(&a))
    }

    /// All stacks at or below `path`, sorted.
    pub fn stacks_within(&self, path: &ProjectPath) -> Vec<&ProjectPath> {
        self.stacks.iter().filter(|s| s.is_within(path)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProjectPath> {
        self.stacks.iter()
    }
}
