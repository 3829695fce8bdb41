//! Per-stack run state and the end-of-run report.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::core::path::ProjectPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StackState {
    Pending,
    Running,
    Ok,
    Failed,
    Canceled,
}

impl StackState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ok | Self::Failed | Self::Canceled)
    }

    /// Legal transitions: `Pending -> Running -> {Ok, Failed, Canceled}`,
    /// plus `Pending -> {Canceled, Failed}` directly.
    pub fn can_become(self, next: StackState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Canceled | Self::Failed)
                | (Self::Running, Self::Ok | Self::Failed | Self::Canceled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Ok => "ok",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for StackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackOutcome {
    pub state: StackState,
    pub exit_code: Option<i32>,
    /// Failure or cancellation cause.
    pub error: Option<String>,
}

impl StackOutcome {
    pub fn pending() -> Self {
        Self {
            state: StackState::Pending,
            exit_code: None,
            error: None,
        }
    }
}

/// Final state table of one run, in scheduler order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub order: Vec<ProjectPath>,
    pub outcomes: BTreeMap<ProjectPath, StackOutcome>,
}

impl RunReport {
    pub fn state_of(&self, stack: &ProjectPath) -> Option<StackState> {
        self.outcomes.get(stack).map(|o| o.state)
    }

    pub fn count(&self, state: StackState) -> usize {
        self.outcomes.values().filter(|o| o.state == state).count()
    }

    /// Anything failed or was canceled.
    pub fn has_failures(&self) -> bool {
        self.outcomes
            .values()
            .any(|o| matches!(o.state, StackState::Failed | StackState::Canceled))
    }

    /// Rows in scheduler order, for the summary table.
    pub fn rows(&self) -> impl Iterator<Item = (&ProjectPath, &StackOutcome)> {
        self.order
            .iter()
            .filter_map(|path| self.outcomes.get(path).map(|o| (path, o)))
    }
}
