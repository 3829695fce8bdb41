//! Pure change classification.
//!
//! Given the paths git reports and an immutable snapshot of trigger markers,
//! decide which stacks changed and why. The same inputs always produce the
//! same [`ChangeReport`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::hierarchy::Hierarchy;
use crate::core::path::ProjectPath;
use crate::core::stack::Stack;

/// Directory (below the project root) that holds control files.
pub const CONTROL_DIR: &str = ".stackrun";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Changed,
    Ignored,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Changed => "changed",
            Self::Ignored => "ignored",
        }
    }
}

/// A marker file found on disk at invocation start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub stack: ProjectPath,
    pub kind: TriggerKind,
    pub reason: String,
    /// Location of the marker file itself.
    pub file: ProjectPath,
}

/// Marker state read once per invocation; never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerSnapshot {
    by_stack: BTreeMap<ProjectPath, Vec<Trigger>>,
}

impl TriggerSnapshot {
    pub fn new(triggers: impl IntoIterator<Item = Trigger>) -> Self {
        let mut by_stack: BTreeMap<ProjectPath, Vec<Trigger>> = BTreeMap::new();
        for trigger in triggers {
            by_stack.entry(trigger.stack.clone()).or_default().push(trigger);
        }
        for triggers in by_stack.values_mut() {
            triggers.sort_by(|a, b| a.file.cmp(&b.file));
        }
        Self { by_stack }
    }

    pub fn for_stack(&self, stack: &ProjectPath) -> &[Trigger] {
        self.by_stack.get(stack).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.by_stack.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_stack.is_empty()
    }
}

/// Why a stack was classified as changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeReason {
    /// An active `changed` marker.
    Triggered { reason: String },
    /// Files inside the stack's own directory.
    Files,
    /// An explicitly watched file.
    Watched,
    /// A local module the stack references.
    Module { module: ProjectPath },
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Triggered { reason } if reason.is_empty() => f.write_str("triggered"),
            Self::Triggered { reason } => write!(f, "triggered: {reason}"),
            Self::Files => f.write_str("stack files changed"),
            Self::Watched => f.write_str("watched file changed"),
            Self::Module { module } => write!(f, "module {module} changed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackDiff {
    pub path: ProjectPath,
    pub reason: ChangeReason,
    pub files: Vec<ProjectPath>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeReport {
    pub stacks: Vec<StackDiff>,
    pub untracked_files: Vec<ProjectPath>,
    pub uncommitted_files: Vec<ProjectPath>,
}

impl ChangeReport {
    pub fn changed_paths(&self) -> BTreeSet<ProjectPath> {
        self.stacks.iter().map(|s| s.path.clone()).collect()
    }

    pub fn reason_for(&self, stack: &ProjectPath) -> Option<&ChangeReason> {
        self.stacks
            .iter()
            .find(|s| &s.path == stack)
            .map(|s| &s.reason)
    }
}

/// Paths reported by git for one invocation, already filtered by the
/// enabled detection toggles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitChanges {
    pub diff: Vec<ProjectPath>,
    pub untracked: Vec<ProjectPath>,
    pub uncommitted: Vec<ProjectPath>,
}

impl GitChanges {
    fn considered(&self) -> BTreeSet<&ProjectPath> {
        self.diff
            .iter()
            .chain(&self.untracked)
            .chain(&self.uncommitted)
            .collect()
    }
}

/// Classify every stack against `changes`.
///
/// `modules` maps a stack to the local module directories it references,
/// transitively. Active `ignored` markers win over everything else.
pub fn classify(
    stacks: &[Stack],
    hierarchy: &Hierarchy,
    modules: &BTreeMap<ProjectPath, BTreeSet<ProjectPath>>,
    triggers: &TriggerSnapshot,
    changes: &GitChanges,
) -> ChangeReport {
    let considered = changes.considered();
    let control = ProjectPath::root().join(CONTROL_DIR);

    let mut owned: BTreeMap<&ProjectPath, Vec<ProjectPath>> = BTreeMap::new();
    for file in &considered {
        if file.is_within(&control) {
            continue;
        }
        if let Some(owner) = hierarchy.owner_of(file) {
            owned.entry(owner).or_default().push((*file).clone());
        }
    }

    let mut sorted: Vec<&Stack> = stacks.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let mut diffs = Vec::new();
    for stack in sorted {
        let active: Vec<&Trigger> = triggers
            .for_stack(&stack.path)
            .iter()
            .filter(|t| considered.contains(&t.file))
            .collect();
        if active.iter().any(|t| t.kind == TriggerKind::Ignored) {
            continue;
        }
        if let Some(trigger) = active.iter().find(|t| t.kind == TriggerKind::Changed) {
            diffs.push(StackDiff {
                path: stack.path.clone(),
                reason: ChangeReason::Triggered {
                    reason: trigger.reason.clone(),
                },
                files: vec![trigger.file.clone()],
            });
            continue;
        }

        if let Some(files) = owned.get(&stack.path) {
            diffs.push(StackDiff {
                path: stack.path.clone(),
                reason: ChangeReason::Files,
                files: files.clone(),
            });
            continue;
        }

        let watched: Vec<ProjectPath> = stack
            .watch
            .iter()
            .filter(|w| considered.contains(w))
            .cloned()
            .collect();
        if !watched.is_empty() {
            diffs.push(StackDiff {
                path: stack.path.clone(),
                reason: ChangeReason::Watched,
                files: watched,
            });
            continue;
        }

        for module in modules.get(&stack.path).into_iter().flatten() {
            let files: Vec<ProjectPath> = considered
                .iter()
                .filter(|f| f.is_within(module))
                .map(|f| (*f).clone())
                .collect();
            if !files.is_empty() {
                diffs.push(StackDiff {
                    path: stack.path.clone(),
                    reason: ChangeReason::Module {
                        module: module.clone(),
                    },
                    files,
                });
                break;
            }
        }
    }

    ChangeReport {
        stacks: diffs,
        untracked_files: sorted_unique(&changes.untracked),
        uncommitted_files: sorted_unique(&changes.uncommitted),
    }
}

fn sorted_unique(paths: &[ProjectPath]) -> Vec<ProjectPath> {
    let set: BTreeSet<&ProjectPath> = paths.iter().collect();
    set.into_iter().cloned().collect()
}
