//! Data-dependency graph.
//!
//! An edge `A depends-on B` records that A consumes B's outputs. This is the
//! only graph the dependency/dependent selection operators walk.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::path::ProjectPath;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataGraph {
    dependencies: BTreeMap<ProjectPath, BTreeSet<ProjectPath>>,
    dependents: BTreeMap<ProjectPath, BTreeSet<ProjectPath>>,
}

impl DataGraph {
    pub fn new<'a>(nodes: impl IntoIterator<Item = &'a ProjectPath>) -> Self {
        let mut graph = Self::default();
        for node in nodes {
            graph.dependencies.entry(node.clone()).or_default();
            graph.dependents.entry(node.clone()).or_default();
        }
        graph
    }

    /// Record `stack depends-on target`. Self-edges are ignored.
    pub fn add_dependency(&mut self, stack: &ProjectPath, target: &ProjectPath) {
        if stack == target {
            return;
        }
        self.dependencies
            .entry(stack.clone())
            .or_default()
            .insert(target.clone());
        self.dependents
            .entry(target.clone())
            .or_default()
            .insert(stack.clone());
    }

    pub fn contains(&self, stack: &ProjectPath) -> bool {
        self.dependencies.contains_key(stack)
    }

    pub fn direct_dependencies(&self, stack: &ProjectPath) -> impl Iterator<Item = &ProjectPath> {
        self.dependencies.get(stack).into_iter().flatten()
    }

    pub fn direct_dependents(&self, stack: &ProjectPath) -> impl Iterator<Item = &ProjectPath> {
        self.dependents.get(stack).into_iter().flatten()
    }

    /// Transitive dependencies of `stack`, excluding `stack` itself even when
    /// it sits on a cycle.
    pub fn all_dependencies(&self, stack: &ProjectPath) -> BTreeSet<ProjectPath> {
        closure(stack, &self.dependencies)
    }

    /// Transitive dependents of `stack`, excluding `stack` itself.
    pub fn all_dependents(&self, stack: &ProjectPath) -> BTreeSet<ProjectPath> {
        closure(stack, &self.dependents)
    }

    /// Stacks lying on at least one dependency cycle, sorted.
    pub fn cyclic_stacks(&self) -> BTreeSet<ProjectPath> {
        self.dependencies
            .keys()
            .filter(|stack| {
                self.direct_dependencies(stack)
                    .any(|dep| dep == *stack || self.all_dependencies(dep).contains(*stack))
            })
            .cloned()
            .collect()
    }
}

fn closure(
    start: &ProjectPath,
    edges: &BTreeMap<ProjectPath, BTreeSet<ProjectPath>>,
) -> BTreeSet<ProjectPath> {
    let neighbors = |s: &ProjectPath| edges.get(s).into_iter().flatten();
    let mut seen: BTreeSet<ProjectPath> = BTreeSet::new();
    let mut pending: Vec<&ProjectPath> = neighbors(start).collect();
    while let Some(next) = pending.pop() {
        if next == start || !seen.insert(next.clone()) {
            continue;
        }
        pending.extend(neighbors(next));
    }
    seen
}
