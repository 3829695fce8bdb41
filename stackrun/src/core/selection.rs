//! Selection algebra over the data-dependency graph.
//!
//! A selection starts from a base set (explicit paths, tags, changed stacks,
//! cloud status, all intersected, then widened by `wants`) and is threaded
//! through dependency operators. Every stage yields a fresh set; exclude
//! operators always run after includes/onlys, in a fixed order.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::core::data::DataGraph;
use crate::core::graph::Graphs;
use crate::core::path::ProjectPath;
use crate::core::stack::Stack;
use crate::core::tags::TagFilter;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("--stack {0}: no stack at this path")]
    UnknownStack(ProjectPath),
}

/// Dependency operators, named after their CLI flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operator {
    IncludeAllDependents,
    OnlyAllDependents,
    IncludeDirectDependents,
    OnlyDirectDependents,
    IncludeAllDependencies,
    OnlyAllDependencies,
    IncludeDirectDependencies,
    OnlyDirectDependencies,
    /// Deprecated alias of `IncludeDirectDependencies`.
    IncludeOutputDependencies,
    /// Deprecated alias of `OnlyDirectDependencies`.
    OnlyOutputDependencies,
    ExcludeAllDependencies,
    ExcludeAllDependents,
}

impl Operator {
    pub const ALL: [Operator; 12] = [
        Self::IncludeAllDependents,
        Self::OnlyAllDependents,
        Self::IncludeDirectDependents,
        Self::OnlyDirectDependents,
        Self::IncludeAllDependencies,
        Self::OnlyAllDependencies,
        Self::IncludeDirectDependencies,
        Self::OnlyDirectDependencies,
        Self::IncludeOutputDependencies,
        Self::OnlyOutputDependencies,
        Self::ExcludeAllDependencies,
        Self::ExcludeAllDependents,
    ];

    pub fn flag(self) -> &'static str {
        match self {
            Self::IncludeAllDependents => "include-all-dependents",
            Self::OnlyAllDependents => "only-all-dependents",
            Self::IncludeDirectDependents => "include-direct-dependents",
            Self::OnlyDirectDependents => "only-direct-dependents",
            Self::IncludeAllDependencies => "include-all-dependencies",
            Self::OnlyAllDependencies => "only-all-dependencies",
            Self::IncludeDirectDependencies => "include-direct-dependencies",
            Self::OnlyDirectDependencies => "only-direct-dependencies",
            Self::IncludeOutputDependencies => "include-output-dependencies",
            Self::OnlyOutputDependencies => "only-output-dependencies",
            Self::ExcludeAllDependencies => "exclude-all-dependencies",
            Self::ExcludeAllDependents => "exclude-all-dependents",
        }
    }

    pub fn from_flag(flag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.flag() == flag)
    }

    pub fn is_exclude(self) -> bool {
        matches!(self, Self::ExcludeAllDependencies | Self::ExcludeAllDependents)
    }

    /// Replacement for a deprecated alias.
    fn replacement(self) -> Option<Self> {
        match self {
            Self::IncludeOutputDependencies => Some(Self::IncludeDirectDependencies),
            Self::OnlyOutputDependencies => Some(Self::OnlyDirectDependencies),
            _ => None,
        }
    }
}

/// Final set plus one-line notices (deprecations, tolerated wants cycles).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub set: BTreeSet<ProjectPath>,
    pub notices: Vec<String>,
}

/// Sources of the base set; every source that is present narrows it.
#[derive(Debug, Clone, Default)]
pub struct BaseFilter {
    pub paths: Option<Vec<ProjectPath>>,
    pub tags: Option<TagFilter>,
    pub changed: Option<BTreeSet<ProjectPath>>,
    pub status: Option<BTreeSet<ProjectPath>>,
}

/// Compute the base set and expand it over `wants`.
pub fn base_set(
    stacks: &[Stack],
    graphs: &Graphs,
    filter: &BaseFilter,
) -> Result<Selection, SelectionError> {
    let mut set: BTreeSet<ProjectPath> = stacks.iter().map(|s| s.path.clone()).collect();

    if let Some(paths) = &filter.paths {
        let mut explicit = BTreeSet::new();
        for path in paths {
            if !graphs.hierarchy.contains(path) {
                return Err(SelectionError::UnknownStack(path.clone()));
            }
            explicit.insert(path.clone());
        }
        set = set.intersection(&explicit).cloned().collect();
    }
    if let Some(tags) = &filter.tags {
        set = stacks
            .iter()
            .filter(|s| set.contains(&s.path) && tags.matches(&s.tags))
            .map(|s| s.path.clone())
            .collect();
    }
    if let Some(changed) = &filter.changed {
        set = set.intersection(changed).cloned().collect();
    }
    if let Some(status) = &filter.status {
        set = set.intersection(status).cloned().collect();
    }

    Ok(expand_wants(set, &graphs.wants))
}

fn expand_wants(
    base: BTreeSet<ProjectPath>,
    wants: &BTreeMap<ProjectPath, BTreeSet<ProjectPath>>,
) -> Selection {
    let mut notices = Vec::new();
    let mut set = base.clone();
    let mut pending: Vec<&ProjectPath> = base.iter().collect();
    let mut reported = BTreeSet::new();
    while let Some(stack) = pending.pop() {
        for wanted in wants.get(stack).into_iter().flatten() {
            if set.insert(wanted.clone()) {
                pending.push(wanted);
            } else if wanted_reaches(wants, wanted, stack) && reported.insert(stack.clone()) {
                notices.push(format!("wants cycle through {stack}; continuing"));
            }
        }
    }
    Selection { set, notices }
}

fn wanted_reaches(
    wants: &BTreeMap<ProjectPath, BTreeSet<ProjectPath>>,
    from: &ProjectPath,
    target: &ProjectPath,
) -> bool {
    let mut seen = BTreeSet::new();
    let mut pending = vec![from];
    while let Some(next) = pending.pop() {
        if next == target {
            return true;
        }
        if seen.insert(next) {
            pending.extend(wants.get(next).into_iter().flatten());
        }
    }
    false
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Direction {
    Dependents,
    Dependencies,
}

/// Per-call memo of transitive traversals, keyed by source stack.
struct Traversals<'g> {
    data: &'g DataGraph,
    cache: BTreeMap<(Direction, ProjectPath), BTreeSet<ProjectPath>>,
}

impl<'g> Traversals<'g> {
    fn new(data: &'g DataGraph) -> Self {
        Self {
            data,
            cache: BTreeMap::new(),
        }
    }

    fn all(&mut self, direction: Direction, stack: &ProjectPath) -> &BTreeSet<ProjectPath> {
        let data = self.data;
        self.cache
            .entry((direction, stack.clone()))
            .or_insert_with(|| match direction {
                Direction::Dependents => data.all_dependents(stack),
                Direction::Dependencies => data.all_dependencies(stack),
            })
    }

    fn direct(&self, direction: Direction, stack: &ProjectPath) -> BTreeSet<ProjectPath> {
        match direction {
            Direction::Dependents => self.data.direct_dependents(stack).cloned().collect(),
            Direction::Dependencies => self.data.direct_dependencies(stack).cloned().collect(),
        }
    }

    fn reach(
        &mut self,
        set: &BTreeSet<ProjectPath>,
        direction: Direction,
        transitive: bool,
    ) -> BTreeSet<ProjectPath> {
        let mut out = BTreeSet::new();
        for stack in set {
            if transitive {
                out.extend(self.all(direction, stack).iter().cloned());
            } else {
                out.extend(self.direct(direction, stack));
            }
        }
        out
    }
}

/// Apply `ops` to `base`. Excludes run last regardless of their position.
pub fn select(base: &BTreeSet<ProjectPath>, ops: &[Operator], data: &DataGraph) -> Selection {
    let mut notices = Vec::new();
    let mut warned = BTreeSet::new();
    let mut traversals = Traversals::new(data);
    let mut set = base.clone();

    for &op in ops.iter().filter(|op| !op.is_exclude()) {
        let op = match op.replacement() {
            Some(replacement) => {
                if warned.insert(op) {
                    notices.push(format!(
                        "--{} is deprecated, use --{} instead",
                        op.flag(),
                        replacement.flag()
                    ));
                }
                replacement
            }
            None => op,
        };
        set = match op {
            Operator::IncludeAllDependents => {
                include(&set, traversals.reach(&set, Direction::Dependents, true))
            }
            Operator::OnlyAllDependents => traversals.reach(&set, Direction::Dependents, true),
            Operator::IncludeDirectDependents => {
                include(&set, traversals.reach(&set, Direction::Dependents, false))
            }
            Operator::OnlyDirectDependents => traversals.reach(&set, Direction::Dependents, false),
            Operator::IncludeAllDependencies => {
                include(&set, traversals.reach(&set, Direction::Dependencies, true))
            }
            Operator::OnlyAllDependencies => traversals.reach(&set, Direction::Dependencies, true),
            Operator::IncludeDirectDependencies => {
                include(&set, traversals.reach(&set, Direction::Dependencies, false))
            }
            Operator::OnlyDirectDependencies => {
                traversals.reach(&set, Direction::Dependencies, false)
            }
            Operator::IncludeOutputDependencies
            | Operator::OnlyOutputDependencies
            | Operator::ExcludeAllDependencies
            | Operator::ExcludeAllDependents => set,
        };
    }

    if ops.contains(&Operator::ExcludeAllDependencies) {
        set = exclude(&set, Direction::Dependencies, &mut traversals);
    }
    if ops.contains(&Operator::ExcludeAllDependents) {
        set = exclude(&set, Direction::Dependents, &mut traversals);
    }

    Selection { set, notices }
}

fn include(set: &BTreeSet<ProjectPath>, extra: BTreeSet<ProjectPath>) -> BTreeSet<ProjectPath> {
    let mut out = set.clone();
    out.extend(extra);
    out
}

/// Drop, in path order, each member that is reachable in `direction` from
/// another member still present.
///
/// `Dependencies` removes stacks some remaining member depends on, so the
/// traversal looks at each other member's transitive dependencies.
fn exclude(
    set: &BTreeSet<ProjectPath>,
    direction: Direction,
    traversals: &mut Traversals<'_>,
) -> BTreeSet<ProjectPath> {
    let mut out = set.clone();
    for member in set {
        let others: Vec<ProjectPath> = out.iter().filter(|o| *o != member).cloned().collect();
        let covered = others
            .iter()
            .any(|other| traversals.all(direction, other).contains(member));
        if covered {
            out.remove(member);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(raw: &str) -> ProjectPath {
        ProjectPath::new(raw).expect("path")
    }

    fn set(paths: &[&str]) -> BTreeSet<ProjectPath> {
        paths.iter().map(|s| p(s)).collect()
    }

    fn names(set: &BTreeSet<ProjectPath>) -> Vec<&str> {
        set.iter().map(ProjectPath::as_str).collect()
    }

    /// `/b` depends on `/a`, `/c` depends on `/b`, `/x` depends on `/a`.
    fn chain() -> DataGraph {
        let nodes = set(&["/a", "/b", "/c", "/x", "/lone"]);
        let mut g = DataGraph::new(nodes.iter());
        g.add_dependency(&p("/b"), &p("/a"));
        g.add_dependency(&p("/c"), &p("/b"));
        g.add_dependency(&p("/x"), &p("/a"));
        g
    }

    #[test]
    fn include_all_dependents_is_transitive() {
        let out = select(&set(&["/a"]), &[Operator::IncludeAllDependents], &chain());
        assert_eq!(names(&out.set), vec!["/a", "/b", "/c", "/x"]);
        assert!(out.notices.is_empty());
    }

    #[test]
    fn only_operators_drop_the_origin() {
        let out = select(&set(&["/a"]), &[Operator::OnlyAllDependents], &chain());
        assert_eq!(names(&out.set), vec!["/b", "/c", "/x"]);

        let out = select(&set(&["/a"]), &[Operator::OnlyDirectDependents], &chain());
        assert_eq!(names(&out.set), vec!["/b", "/x"]);
    }

    #[test]
    fn only_keeps_members_reachable_from_others() {
        let out = select(&set(&["/a", "/b"]), &[Operator::OnlyAllDependents], &chain());
        assert_eq!(names(&out.set), vec!["/b", "/c", "/x"]);
    }

    #[test]
    fn direct_vs_transitive_dependencies() {
        let direct = select(&set(&["/c"]), &[Operator::IncludeDirectDependencies], &chain());
        assert_eq!(names(&direct.set), vec!["/b", "/c"]);
        let all = select(&set(&["/c"]), &[Operator::IncludeAllDependencies], &chain());
        assert_eq!(names(&all.set), vec!["/a", "/b", "/c"]);
        let only = select(&set(&["/c"]), &[Operator::OnlyAllDependencies], &chain());
        assert_eq!(names(&only.set), vec!["/a", "/b"]);
    }

    #[test]
    fn excludes_run_last_regardless_of_flag_order() {
        let g = chain();
        let first = select(
            &set(&["/a"]),
            &[Operator::ExcludeAllDependencies, Operator::IncludeAllDependents],
            &g,
        );
        let last = select(
            &set(&["/a"]),
            &[Operator::IncludeAllDependents, Operator::ExcludeAllDependencies],
            &g,
        );
        assert_eq!(first.set, last.set);
        assert_eq!(names(&first.set), vec!["/c", "/x"]);
    }

    #[test]
    fn both_excludes_commute() {
        let g = chain();
        let base = set(&["/a", "/b", "/c", "/lone"]);
        let one = select(
            &base,
            &[Operator::ExcludeAllDependents, Operator::ExcludeAllDependencies],
            &g,
        );
        let two = select(
            &base,
            &[Operator::ExcludeAllDependencies, Operator::ExcludeAllDependents],
            &g,
        );
        assert_eq!(one.set, two.set);
        assert_eq!(names(&one.set), vec!["/c", "/lone"]);
    }

    #[test]
    fn exclude_on_a_cycle_keeps_one_member() {
        let nodes = set(&["/a", "/b"]);
        let mut g = DataGraph::new(nodes.iter());
        g.add_dependency(&p("/a"), &p("/b"));
        g.add_dependency(&p("/b"), &p("/a"));
        let out = select(&nodes, &[Operator::ExcludeAllDependents], &g);
        assert_eq!(out.set.len(), 1);
    }

    #[test]
    fn deprecated_alias_warns_once() {
        let out = select(
            &set(&["/b"]),
            &[
                Operator::IncludeOutputDependencies,
                Operator::IncludeOutputDependencies,
            ],
            &chain(),
        );
        assert_eq!(names(&out.set), vec!["/a", "/b"]);
        assert_eq!(
            out.notices,
            vec![
                "--include-output-dependencies is deprecated, use --include-direct-dependencies instead"
                    .to_string()
            ]
        );
    }

    #[test]
    fn flags_round_trip() {
        for op in Operator::ALL {
            assert_eq!(Operator::from_flag(op.flag()), Some(op));
        }
        assert_eq!(Operator::from_flag("include-everything"), None);
    }

    mod base {
        use super::*;
        use crate::core::graph::build;

        fn stacks() -> Vec<Stack> {
            let mut app = Stack::new(p("/app"));
            app.tags.insert("app".to_string());
            app.wants.push("/monitor".to_string());
            let mut db = Stack::new(p("/db"));
            db.tags.insert("data".to_string());
            let mut monitor = Stack::new(p("/monitor"));
            monitor.wants.push("/app".to_string());
            vec![app, db, monitor]
        }

        #[test]
        fn sources_intersect() {
            let stacks = stacks();
            let graphs = build(&stacks).expect("build");
            let filter = BaseFilter {
                tags: TagFilter::parse_all(&["app,data"]).expect("tags"),
                changed: Some(set(&["/db", "/monitor"])),
                ..BaseFilter::default()
            };
            let out = base_set(&stacks, &graphs, &filter).expect("base");
            assert_eq!(names(&out.set), vec!["/db"]);
        }

        #[test]
        fn wants_pull_companions_and_tolerate_cycles() {
            let stacks = stacks();
            let graphs = build(&stacks).expect("build");
            let filter = BaseFilter {
                paths: Some(vec![p("/app")]),
                ..BaseFilter::default()
            };
            let out = base_set(&stacks, &graphs, &filter).expect("base");
            assert_eq!(names(&out.set), vec!["/app", "/monitor"]);
            assert_eq!(out.notices.len(), 1);
            assert!(out.notices[0].contains("wants cycle"));
        }

        #[test]
        fn unknown_stack_path_is_an_error() {
            let stacks = stacks();
            let graphs = build(&stacks).expect("build");
            let filter = BaseFilter {
                paths: Some(vec![p("/nope")]),
                ..BaseFilter::default()
            };
            assert_eq!(
                base_set(&stacks, &graphs, &filter),
                Err(SelectionError::UnknownStack(p("/nope")))
            );
        }
    }
}
