//! Execution-order graph.
//!
//! An edge `A after B` means A must not start before B reaches a terminal
//! state. The graph only ever drives scheduling; selection operators never
//! traverse it.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::path::ProjectPath;

/// Ordering edges between every loaded stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderGraph {
    /// `after[a]` holds the stacks `a` runs after.
    after: BTreeMap<ProjectPath, BTreeSet<ProjectPath>>,
    /// `before[b]` holds the stacks that run after `b`.
    before: BTreeMap<ProjectPath, BTreeSet<ProjectPath>>,
}

impl OrderGraph {
    pub fn new<'a>(nodes: impl IntoIterator<Item = &'a ProjectPath>) -> Self {
        let mut graph = Self::default();
        for node in nodes {
            graph.after.entry(node.clone()).or_default();
            graph.before.entry(node.clone()).or_default();
        }
        graph
    }

    /// Record `stack after dependency`. Self-edges are ignored.
    pub fn add_after(&mut self, stack: &ProjectPath, dependency: &ProjectPath) {
        if stack == dependency {
            return;
        }
        self.after
            .entry(stack.clone())
            .or_default()
            .insert(dependency.clone());
        self.before
            .entry(dependency.clone())
            .or_default()
            .insert(stack.clone());
        self.after.entry(dependency.clone()).or_default();
        self.before.entry(stack.clone()).or_default();
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ProjectPath> {
        self.after.keys()
    }

    /// Stacks that must finish before `stack` starts.
    pub fn predecessors(&self, stack: &ProjectPath) -> impl Iterator<Item = &ProjectPath> {
        self.after.get(stack).into_iter().flatten()
    }

    /// Stacks that wait for `stack`.
    pub fn successors(&self, stack: &ProjectPath) -> impl Iterator<Item = &ProjectPath> {
        self.before.get(stack).into_iter().flatten()
    }

    pub fn edge_count(&self) -> usize {
        self.after.values().map(BTreeSet::len).sum()
    }

    /// First cycle found by a white/gray/black DFS over `after` edges, as the
    /// member list in traversal order with the start repeated at the end.
    pub fn find_cycle(&self) -> Option<Vec<ProjectPath>> {
        let mut marks: BTreeMap<&ProjectPath, Mark> = BTreeMap::new();
        let mut trail = Vec::new();
        for node in self.after.keys() {
            if marks.get(node).is_none()
                && let Some(cycle) = self.visit(node, &mut marks, &mut trail)
            {
                return Some(cycle);
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        node: &'a ProjectPath,
        marks: &mut BTreeMap<&'a ProjectPath, Mark>,
        trail: &mut Vec<&'a ProjectPath>,
    ) -> Option<Vec<ProjectPath>> {
        marks.insert(node, Mark::Gray);
        trail.push(node);
        for next in self.predecessors(node) {
            match marks.get(next) {
                Some(Mark::Black) => {}
                Some(Mark::Gray) => {
                    let start = trail.iter().position(|n| *n == next).unwrap_or(0);
                    let mut cycle: Vec<ProjectPath> =
                        trail[start..].iter().map(|n| (*n).clone()).collect();
                    cycle.push(next.clone());
                    return Some(cycle);
                }
                None => {
                    if let Some(cycle) = self.visit(next, marks, trail) {
                        return Some(cycle);
                    }
                }
            }
        }
        trail.pop();
        marks.insert(node, Mark::Black);
        None
    }

    /// Restrict the graph to `selection`, keeping order transitively through
    /// unselected stacks. With `reverse` every edge is flipped.
    pub fn induced(&self, selection: &BTreeSet<ProjectPath>, reverse: bool) -> InducedOrder {
        let mut predecessors: BTreeMap<ProjectPath, BTreeSet<ProjectPath>> = selection
            .iter()
            .map(|s| (s.clone(), BTreeSet::new()))
            .collect();
        let mut successors = predecessors.clone();

        for stack in selection {
            for dependency in self.selected_predecessors(stack, selection) {
                let (first, then) = if reverse {
                    (stack.clone(), dependency)
                } else {
                    (dependency, stack.clone())
                };
                successors
                    .entry(first.clone())
                    .or_default()
                    .insert(then.clone());
                predecessors.entry(then).or_default().insert(first);
            }
        }

        InducedOrder {
            predecessors,
            successors,
        }
    }

    /// Selected stacks reachable from `stack` over `after` edges, walking
    /// through unselected stacks but stopping at selected ones.
    fn selected_predecessors(
        &self,
        stack: &ProjectPath,
        selection: &BTreeSet<ProjectPath>,
    ) -> BTreeSet<ProjectPath> {
        let mut found = BTreeSet::new();
        let mut seen = BTreeSet::new();
        let mut pending: Vec<&ProjectPath> = self.predecessors(stack).collect();
        while let Some(next) = pending.pop() {
            if !seen.insert(next) {
                continue;
            }
            if selection.contains(next) {
                found.insert(next.clone());
            } else {
                pending.extend(self.predecessors(next));
            }
        }
        found
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Gray,
    Black,
}

/// Ordering restricted to a selection; the scheduler's input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InducedOrder {
    predecessors: BTreeMap<ProjectPath, BTreeSet<ProjectPath>>,
    successors: BTreeMap<ProjectPath, BTreeSet<ProjectPath>>,
}

impl InducedOrder {
    pub fn nodes(&self) -> impl Iterator<Item = &ProjectPath> {
        self.predecessors.keys()
    }

    pub fn len(&self) -> usize {
        self.predecessors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predecessors.is_empty()
    }

    pub fn predecessors(&self, stack: &ProjectPath) -> impl Iterator<Item = &ProjectPath> {
        self.predecessors.get(stack).into_iter().flatten()
    }

    pub fn successors(&self, stack: &ProjectPath) -> impl Iterator<Item = &ProjectPath> {
        self.successors.get(stack).into_iter().flatten()
    }

    /// Topological waves (Kahn); each wave is sorted by path.
    pub fn waves(&self) -> Vec<Vec<ProjectPath>> {
        let mut in_degree: BTreeMap<&ProjectPath, usize> = self
            .predecessors
            .iter()
            .map(|(node, preds)| (node, preds.len()))
            .collect();
        let mut current: Vec<&ProjectPath> = in_degree
            .iter()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(node, _)| *node)
            .collect();
        let mut waves = Vec::new();

        while !current.is_empty() {
            let mut next = Vec::new();
            for node in &current {
                for successor in self.successors(node) {
                    if let Some(degree) = in_degree.get_mut(successor) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(successor);
                        }
                    }
                }
            }
            next.sort();
            waves.push(current.into_iter().cloned().collect());
            current = next;
        }
        waves
    }

    /// Flattened wave order.
    pub fn linear(&self) -> Vec<ProjectPath> {
        self.waves().into_iter().flatten().collect()
    }
}
