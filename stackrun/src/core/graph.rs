//! Builds the order graph, data graph and hierarchy from loaded stacks.
//!
//! Dangling references never produce nodes: they are dropped with a
//! [`GraphWarning`], or, for unresolvable stack IDs, recorded as a local issue
//! on the referencing stack so it fails at run time without executing.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use thiserror::Error;

use crate::core::data::DataGraph;
use crate::core::hierarchy::Hierarchy;
use crate::core::order::OrderGraph;
use crate::core::path::ProjectPath;
use crate::core::stack::{DependencyKind, Stack};
use crate::core::tags::{TagError, TagFilter};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("cycle detected: {}", render_cycle(.0))]
    Cycle(Vec<ProjectPath>),

    #[error("duplicate stack at {0}")]
    DuplicateStack(ProjectPath),

    #[error("stack {stack}: invalid order entry {entry:?}")]
    InvalidTagQuery {
        stack: ProjectPath,
        entry: String,
        #[source]
        source: TagError,
    },

    #[error("stack {stack}: tag:<query> is not allowed in {field} (entry {entry:?})")]
    TagQueryNotAllowed {
        stack: ProjectPath,
        field: &'static str,
        entry: String,
    },
}

fn render_cycle(members: &[ProjectPath]) -> String {
    members
        .iter()
        .map(ProjectPath::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Non-fatal problem found while resolving references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphWarning {
    pub stack: ProjectPath,
    pub message: String,
}

impl fmt::Display for GraphWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stack {}: {}", self.stack, self.message)
    }
}

/// Everything derived from the stack list for one invocation.
#[derive(Debug, Clone, Default)]
pub struct Graphs {
    pub order: OrderGraph,
    pub data: DataGraph,
    pub hierarchy: Hierarchy,
    /// Stack -> stacks it pulls into a selection (`wants` plus inverted `wanted_by`).
    pub wants: BTreeMap<ProjectPath, BTreeSet<ProjectPath>>,
    pub warnings: Vec<GraphWarning>,
    /// Stack -> problems that make it fail without executing.
    pub issues: BTreeMap<ProjectPath, Vec<String>>,
}

impl Graphs {
    pub fn issues_for(&self, stack: &ProjectPath) -> &[String] {
        self.issues.get(stack).map(Vec::as_slice).unwrap_or(&[])
    }
}

pub fn build(stacks: &[Stack]) -> Result<Graphs, GraphError> {
    let mut seen = BTreeSet::new();
    for stack in stacks {
        if !seen.insert(&stack.path) {
            return Err(GraphError::DuplicateStack(stack.path.clone()));
        }
    }

    let hierarchy = Hierarchy::new(stacks.iter().map(|s| &s.path));
    let mut builder = Builder {
        stacks,
        hierarchy: &hierarchy,
        warnings: Vec::new(),
    };

    let order = builder.order_graph()?;
    let (data, issues) = builder.data_graph();
    let wants = builder.wants();

    for stack in data.cyclic_stacks() {
        builder.warn(&stack, "data dependency cycle; traversal continues".to_string());
    }

    Ok(Graphs {
        order,
        data,
        wants,
        warnings: builder.warnings,
        issues,
        hierarchy,
    })
}

struct Builder<'a> {
    stacks: &'a [Stack],
    hierarchy: &'a Hierarchy,
    warnings: Vec<GraphWarning>,
}

impl Builder<'_> {
    fn warn(&mut self, stack: &ProjectPath, message: String) {
        tracing::warn!(stack = %stack, "{message}");
        self.warnings.push(GraphWarning {
            stack: stack.clone(),
            message,
        });
    }

    fn order_graph(&mut self) -> Result<OrderGraph, GraphError> {
        let mut graph = OrderGraph::new(self.hierarchy.iter());
        for stack in self.stacks {
            for entry in &stack.after {
                for target in self.order_targets(stack, "after", entry, true)? {
                    graph.add_after(&stack.path, &target);
                }
            }
            for entry in &stack.before {
                for target in self.order_targets(stack, "before", entry, true)? {
                    graph.add_after(&target, &stack.path);
                }
            }
            for entry in &stack.ordering_paths {
                for target in self.order_targets(stack, "dependencies.paths", entry, false)? {
                    graph.add_after(&stack.path, &target);
                }
            }
        }
        if let Some(cycle) = graph.find_cycle() {
            return Err(GraphError::Cycle(cycle));
        }
        Ok(graph)
    }

    fn order_targets(
        &mut self,
        stack: &Stack,
        field: &'static str,
        entry: &str,
        allow_tags: bool,
    ) -> Result<Vec<ProjectPath>, GraphError> {
        if let Some(query) = entry.strip_prefix("tag:") {
            if !allow_tags {
                return Err(GraphError::TagQueryNotAllowed {
                    stack: stack.path.clone(),
                    field,
                    entry: entry.to_string(),
                });
            }
            let filter = TagFilter::parse_all(&[query]).map_err(|source| {
                GraphError::InvalidTagQuery {
                    stack: stack.path.clone(),
                    entry: entry.to_string(),
                    source,
                }
            })?;
            let Some(filter) = filter else {
                return Ok(Vec::new());
            };
            return Ok(self
                .stacks
                .iter()
                .filter(|other| filter.matches(&other.tags))
                .map(|other| other.path.clone())
                .collect());
        }

        let target = match stack.path.resolve(entry) {
            Ok(target) => target,
            Err(_) => {
                self.warn(
                    &stack.path,
                    format!("{field} entry {entry:?} points outside the project; ignoring"),
                );
                return Ok(Vec::new());
            }
        };
        let targets: Vec<ProjectPath> = self
            .hierarchy
            .stacks_within(&target)
            .into_iter()
            .cloned()
            .collect();
        if targets.is_empty() {
            self.warn(
                &stack.path,
                format!("{field} entry {entry:?} does not match any stack; ignoring"),
            );
        }
        Ok(targets)
    }

    fn data_graph(&mut self) -> (DataGraph, BTreeMap<ProjectPath, Vec<String>>) {
        let mut by_id: BTreeMap<String, Vec<&ProjectPath>> = BTreeMap::new();
        for stack in self.stacks {
            if let Some(id) = &stack.id {
                by_id.entry(id.to_lowercase()).or_default().push(&stack.path);
            }
        }

        let mut graph = DataGraph::new(self.hierarchy.iter());
        let mut issues: BTreeMap<ProjectPath, Vec<String>> = BTreeMap::new();
        for stack in self.stacks {
            for dependency in &stack.data_dependencies {
                match dependency.kind {
                    DependencyKind::SharingInput => {
                        match by_id.get(&dependency.target.to_lowercase()).map(Vec::as_slice) {
                            Some([target]) => graph.add_dependency(&stack.path, target),
                            Some(targets) if targets.len() > 1 => {
                                issues.entry(stack.path.clone()).or_default().push(format!(
                                    "input references ambiguous stack id {:?} ({} stacks)",
                                    dependency.target,
                                    targets.len()
                                ));
                            }
                            _ => {
                                issues.entry(stack.path.clone()).or_default().push(format!(
                                    "input references unknown stack id {:?}",
                                    dependency.target
                                ));
                            }
                        }
                    }
                    DependencyKind::ModuleDependency => {
                        let Ok(target) = stack.path.resolve(&dependency.target) else {
                            self.warn(
                                &stack.path,
                                format!(
                                    "dependency {:?} points outside the project; ignoring",
                                    dependency.target
                                ),
                            );
                            continue;
                        };
                        if self.hierarchy.contains(&target) {
                            graph.add_dependency(&stack.path, &target);
                        } else {
                            self.warn(
                                &stack.path,
                                format!(
                                    "dependency {:?} names no stack (deleted or renamed?); ignoring",
                                    dependency.target
                                ),
                            );
                        }
                    }
                }
            }
        }
        (graph, issues)
    }

    fn wants(&mut self) -> BTreeMap<ProjectPath, BTreeSet<ProjectPath>> {
        let mut wants: BTreeMap<ProjectPath, BTreeSet<ProjectPath>> = BTreeMap::new();
        for stack in self.stacks {
            for entry in &stack.wants {
                if let Some(target) = self.exact_stack(stack, "wants", entry) {
                    wants.entry(stack.path.clone()).or_default().insert(target);
                }
            }
            for entry in &stack.wanted_by {
                if let Some(target) = self.exact_stack(stack, "wanted_by", entry) {
                    wants.entry(target).or_default().insert(stack.path.clone());
                }
            }
        }
        wants
    }

    fn exact_stack(&mut self, stack: &Stack, field: &str, entry: &str) -> Option<ProjectPath> {
        match stack.path.resolve(entry) {
            Ok(target) if self.hierarchy.contains(&target) => Some(target),
            Ok(_) => {
                self.warn(
                    &stack.path,
                    format!("{field} entry {entry:?} does not name a stack; ignoring"),
                );
                None
            }
            Err(_) => {
                self.warn(
                    &stack.path,
                    format!("{field} entry {entry:?} points outside the project; ignoring"),
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stack::DataDependency;

    fn p(raw: &str) -> ProjectPath {
        ProjectPath::new(raw).expect("path")
    }

    fn stack(path: &str) -> Stack {
        Stack::new(p(path))
    }

    #[test]
    fn after_before_and_tag_references() {
        let mut a = stack("/a");
        a.tags.insert("base".to_string());
        let mut b = stack("/b");
        b.after.push("tag:base".to_string());
        let mut c = stack("/c");
        c.before.push("../b".to_string());
        let graphs = build(&[a, b, c]).expect("build");

        let preds: Vec<&ProjectPath> = graphs.order.predecessors(&p("/b")).collect();
        assert_eq!(preds, vec![&p("/a"), &p("/c")]);
        assert!(graphs.warnings.is_empty());
        assert_eq!(graphs.data.direct_dependencies(&p("/b")).count(), 0);
    }

    #[test]
    fn directory_reference_selects_nested_stacks() {
        let mut app = stack("/app");
        app.after.push("/infra".to_string());
        let graphs = build(&[
            app,
            stack("/infra/vpc"),
            stack("/infra/dns"),
            stack("/other"),
        ])
        .expect("build");
        let preds: Vec<&ProjectPath> = graphs.order.predecessors(&p("/app")).collect();
        assert_eq!(preds, vec![&p("/infra/dns"), &p("/infra/vpc")]);
    }

    #[test]
    fn cycle_is_fatal_and_names_members() {
        let mut a = stack("/a");
        a.after.push("/b".to_string());
        let mut b = stack("/b");
        b.after.push("/a".to_string());
        let err = build(&[a, b]).expect_err("cycle");
        assert_eq!(err.to_string(), "cycle detected: /a -> /b -> /a");
    }

    #[test]
    fn dangling_order_references_warn() {
        let mut a = stack("/a");
        a.after.push("../../outside".to_string());
        a.after.push("/missing".to_string());
        let graphs = build(&[a]).expect("build");
        assert_eq!(graphs.warnings.len(), 2);
        assert_eq!(graphs.order.edge_count(), 0);
        assert!(graphs.warnings[0].message.contains("outside the project"));
        assert!(graphs.warnings[1].message.contains("does not match any stack"));
    }

    #[test]
    fn tag_query_rejected_in_dependency_paths() {
        let mut a = stack("/a");
        a.ordering_paths.push("tag:x".to_string());
        assert!(matches!(
            build(&[a]),
            Err(GraphError::TagQueryNotAllowed { .. })
        ));
    }

    #[test]
    fn input_ids_resolve_case_insensitively() {
        let mut vpc = stack("/vpc");
        vpc.id = Some("VPC".to_string());
        let mut app = stack("/app");
        app.data_dependencies.push(DataDependency::input("vpc"));
        let graphs = build(&[vpc, app]).expect("build");
        assert_eq!(
            graphs.data.direct_dependencies(&p("/app")).collect::<Vec<_>>(),
            vec![&p("/vpc")]
        );
        assert_eq!(graphs.order.edge_count(), 0);
        assert!(graphs.issues.is_empty());
    }

    #[test]
    fn unknown_and_duplicate_ids_are_local_issues() {
        let mut one = stack("/one");
        one.id = Some("dup".to_string());
        let mut two = stack("/two");
        two.id = Some("DUP".to_string());
        let mut app = stack("/app");
        app.data_dependencies.push(DataDependency::input("dup"));
        app.data_dependencies.push(DataDependency::input("nope"));
        let graphs = build(&[one, two, app]).expect("build");
        let issues = graphs.issues_for(&p("/app"));
        assert_eq!(issues.len(), 2);
        assert!(issues[0].contains("ambiguous"));
        assert!(issues[1].contains("unknown stack id \"nope\""));
        assert!(graphs.issues_for(&p("/one")).is_empty());
    }

    #[test]
    fn module_dependencies_resolve_paths_and_warn_on_dangling() {
        let mut app = stack("/envs/app");
        app.data_dependencies.push(DataDependency::module("../vpc"));
        app.data_dependencies.push(DataDependency::module("../gone"));
        app.data_dependencies.push(DataDependency::module("../../../x"));
        let graphs = build(&[app, stack("/envs/vpc")]).expect("build");
        assert_eq!(
            graphs.data.direct_dependencies(&p("/envs/app")).collect::<Vec<_>>(),
            vec![&p("/envs/vpc")]
        );
        assert_eq!(graphs.warnings.len(), 2);
    }

    #[test]
    fn data_cycles_only_warn() {
        let mut a = stack("/a");
        a.data_dependencies.push(DataDependency::module("../b"));
        let mut b = stack("/b");
        b.data_dependencies.push(DataDependency::module("../a"));
        let graphs = build(&[a, b]).expect("build");
        assert_eq!(graphs.warnings.len(), 2);
        assert!(graphs.warnings[0].message.contains("cycle"));
    }

    #[test]
    fn wanted_by_is_inverted_into_wants() {
        let mut a = stack("/a");
        a.wants.push("/b".to_string());
        let mut c = stack("/c");
        c.wanted_by.push("/a".to_string());
        let graphs = build(&[a, stack("/b"), c]).expect("build");
        let wanted: Vec<&ProjectPath> = graphs.wants[&p("/a")].iter().collect();
        assert_eq!(wanted, vec![&p("/b"), &p("/c")]);
    }

    #[test]
    fn duplicate_paths_are_rejected() {
        assert_eq!(
            build(&[stack("/a"), stack("/a")]).expect_err("dup"),
            GraphError::DuplicateStack(p("/a"))
        );
    }
}
