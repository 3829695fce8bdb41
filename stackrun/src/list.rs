//! `stackrun list`: print the selected stacks.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::core::path::ProjectPath;
use crate::selection::{SelectionArgs, plan};

#[derive(Debug, Clone, Default)]
pub struct ListArgs {
    pub selection: SelectionArgs,
    /// Append the change reason (with `--changed`).
    pub why: bool,
    /// Print in scheduler order instead of by path.
    pub run_order: bool,
    pub reverse: bool,
}

/// Write one line per selected stack to `out`, notices to `diagnostics`.
pub fn list_stacks(
    cwd: &Path,
    args: &ListArgs,
    out: &mut dyn Write,
    diagnostics: &mut dyn Write,
) -> Result<()> {
    let plan = plan(cwd, &args.selection)?;
    plan.write_notices(diagnostics).context("write notices")?;

    let stacks: Vec<ProjectPath> = if args.run_order {
        plan.order(args.reverse).linear()
    } else {
        plan.selected.iter().cloned().collect()
    };

    for stack in &stacks {
        let reason = plan
            .changes
            .as_ref()
            .filter(|_| args.why)
            .and_then(|changes| changes.reason_for(stack));
        let written = match reason {
            Some(reason) => writeln!(out, "{stack}  ({reason})"),
            None => writeln!(out, "{stack}"),
        };
        written.context("write stack list")?;
    }
    Ok(())
}
