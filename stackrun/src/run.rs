//! `stackrun run`: execute a command in every selected stack.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, instrument};

use crate::core::env;
use crate::core::order::InducedOrder;
use crate::core::path::ProjectPath;
use crate::core::state::RunReport;
use crate::io::config::GitConfig;
use crate::io::events::{EventSink, JsonlSink, Sinks};
use crate::io::git::{Git, GitSource};
use crate::io::project::ProjectPaths;
use crate::io::runner::CommandRunner;
use crate::schedule::{CancelToken, ScheduleOptions, StackJob, execute};
use crate::selection::{Plan, SelectionArgs, plan};

#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    pub selection: SelectionArgs,
    /// Overrides `run.parallel` from the project config.
    pub parallel: Option<usize>,
    pub continue_on_error: bool,
    pub dry_run: bool,
    pub reverse: bool,
    pub timeout: Option<Duration>,
    pub disable_safeguards: bool,
    /// JSONL lifecycle events, relative to the working directory.
    pub events_file: Option<PathBuf>,
    /// Abort before scheduling when a selected stack has no ID and events are recorded.
    pub strict_ids: bool,
    /// Program followed by its arguments.
    pub command: Vec<String>,
}

/// Select, check, and execute. Notices and fatal-precondition messages go to
/// `diagnostics`; per-stack progress goes to `console`.
#[instrument(skip_all, fields(cwd = %cwd.display()))]
pub fn run_stacks(
    cwd: &Path,
    args: &RunArgs,
    runner: &dyn CommandRunner,
    console: Box<dyn EventSink>,
    diagnostics: &mut dyn Write,
) -> Result<RunReport> {
    if args.command.is_empty() {
        bail!("no command given (pass it after --)");
    }

    let plan = plan(cwd, &args.selection)?;
    plan.write_notices(diagnostics).context("write notices")?;

    let parallel = args.parallel.unwrap_or(plan.config.run.parallel);
    if parallel == 0 {
        bail!("--parallel must be > 0");
    }

    if !args.disable_safeguards {
        check_safeguards(&plan.paths, &plan.config.git)?;
    }

    let order = plan.order(args.reverse);
    let jobs = prepare_jobs(&plan, &order);

    let mut sinks = vec![console];
    if let Some(events_file) = &args.events_file {
        check_ids(&jobs, args.strict_ids, diagnostics)?;
        let path = cwd.join(events_file);
        sinks.push(Box::new(JsonlSink::append(&path)?));
    }
    let mut sinks = Sinks(sinks);

    let cancel = match args.timeout {
        Some(timeout) => CancelToken::with_timeout(timeout),
        None => CancelToken::new(),
    };
    let options = ScheduleOptions {
        parallel,
        continue_on_error: args.continue_on_error,
        dry_run: args.dry_run,
    };
    info!(stacks = order.len(), parallel, "running");
    Ok(execute(
        &order,
        &jobs,
        &args.command,
        runner,
        &mut sinks,
        options,
        &cancel,
    ))
}

fn prepare_jobs(plan: &Plan, order: &InducedOrder) -> BTreeMap<ProjectPath, StackJob> {
    let project_env = plan.config.run.env_layer();
    order
        .nodes()
        .filter_map(|path| plan.project.stack(path))
        .map(|stack| {
            let job = StackJob {
                stack: stack.path.clone(),
                id: stack.id.clone(),
                workdir: stack.path.to_host(&plan.paths.root),
                env: env::resolve(stack, &project_env, &plan.project.directory_env),
                issues: plan.graphs.issues_for(&stack.path).to_vec(),
            };
            (stack.path.clone(), job)
        })
        .collect()
}

/// Refuse to run on a dirty repository. Skipped outside git.
fn check_safeguards(paths: &ProjectPaths, config: &GitConfig) -> Result<()> {
    let git = Git::new(&paths.root);
    if !git.is_repository() {
        debug!("not a git repository; safeguards skipped");
        return Ok(());
    }
    if config.check_untracked {
        let files = git.untracked_files().context("list untracked files")?;
        if !files.is_empty() {
            bail!(
                "repository has untracked files: {} (commit them or pass --disable-safeguards)",
                files.join(", ")
            );
        }
    }
    if config.check_uncommitted {
        let files = git.uncommitted_files().context("list uncommitted files")?;
        if !files.is_empty() {
            bail!(
                "repository has uncommitted changes: {} (commit them or pass --disable-safeguards)",
                files.join(", ")
            );
        }
    }
    Ok(())
}

/// The events file is keyed by stack ID.
fn check_ids(
    jobs: &BTreeMap<ProjectPath, StackJob>,
    strict: bool,
    diagnostics: &mut dyn Write,
) -> Result<()> {
    let missing: Vec<&ProjectPath> = jobs
        .values()
        .filter(|job| job.id.is_none())
        .map(|job| &job.stack)
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    if strict {
        let list: Vec<&str> = missing.iter().map(|p| p.as_str()).collect();
        bail!(
            "stacks without an id cannot be recorded in the events file: {}",
            list.join(", ")
        );
    }
    for stack in missing {
        writeln!(
            diagnostics,
            "stackrun: warning: stack {stack} has no id; its events are not recorded"
        )
        .context("write notices")?;
    }
    Ok(())
}
