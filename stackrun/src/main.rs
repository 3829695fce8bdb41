//! Change-aware, dependency-ordered command runner for IaC stacks.
//!
//! Finds the project root from the working directory, selects stacks (by
//! path, tags, git changes, cloud status and data dependencies) and runs a
//! command in each of them, in parallel where the order graph allows.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::parser::ValueSource;
use clap::{ArgMatches, Args, CommandFactory, FromArgMatches, Parser, Subcommand, ValueEnum};
use stackrun::changed::ToggleFlags;
use stackrun::core::changes::TriggerKind;
use stackrun::core::selection::Operator;
use stackrun::exit_codes;
use stackrun::io::events::{ConsoleSink, write_summary};
use stackrun::io::runner::ProcessRunner;
use stackrun::io::status::StatusFilter;
use stackrun::list::{ListArgs, list_stacks};
use stackrun::logging;
use stackrun::run::{RunArgs, run_stacks};
use stackrun::selection::SelectionArgs;
use stackrun::trigger::{TriggerArgs, trigger_stack};

#[derive(Parser)]
#[command(
    name = "stackrun",
    version,
    about = "Change-aware, dependency-ordered command runner for IaC stacks"
)]
struct Cli {
    /// Run as if started in this directory.
    #[arg(short = 'C', long = "chdir", global = true, value_name = "DIR")]
    chdir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a command in every selected stack, honoring the stack order.
    Run {
        #[command(flatten)]
        selection: SelectionFlags,
        /// Number of stacks to run at the same time (default: run.parallel).
        #[arg(long, value_name = "N")]
        parallel: Option<usize>,
        /// Keep running dependents of failed stacks.
        #[arg(long)]
        continue_on_error: bool,
        /// Print what would run without executing anything.
        #[arg(long)]
        dry_run: bool,
        /// Run in reverse order (dependents first).
        #[arg(long)]
        reverse: bool,
        /// Stop starting new stacks after this many seconds.
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
        /// Run even with untracked or uncommitted files in the repository.
        #[arg(long)]
        disable_safeguards: bool,
        /// Append lifecycle events as JSON lines to this file.
        #[arg(long, value_name = "PATH")]
        events_file: Option<PathBuf>,
        /// Fail before running when a selected stack has no ID.
        #[arg(long, requires = "events_file")]
        strict_ids: bool,
        /// Program and arguments, after `--`.
        #[arg(last = true, value_name = "COMMAND")]
        command: Vec<String>,
    },
    /// List the selected stacks.
    List {
        #[command(flatten)]
        selection: SelectionFlags,
        /// Show why each stack is considered changed (with --changed).
        #[arg(long)]
        why: bool,
        /// Print stacks in execution order.
        #[arg(long)]
        run_order: bool,
        /// Reverse the execution order (with --run-order).
        #[arg(long)]
        reverse: bool,
    },
    /// Mark a stack as changed, or as ignored, for change detection.
    Trigger {
        /// Stack path, relative to the working directory or absolute in the project.
        stack: String,
        /// Suppress change detection for the stack instead of forcing it.
        #[arg(long)]
        ignore_change: bool,
        /// Free-form reason stored in the marker.
        #[arg(long, default_value = "")]
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DetectionKind {
    GitUntracked,
    GitUncommitted,
}

impl DetectionKind {
    fn name(self) -> &'static str {
        match self {
            Self::GitUntracked => "git-untracked",
            Self::GitUncommitted => "git-uncommitted",
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
struct SelectionFlags {
    /// Select this stack (repeatable).
    #[arg(long = "stack", value_name = "PATH")]
    stacks: Vec<String>,
    /// Tag filter: `a:b` is AND, `a,b` is OR, `~a` is NOT (repeatable, OR'ed).
    #[arg(long, value_name = "FILTER")]
    tags: Vec<String>,
    /// Drop stacks carrying any of these tags.
    #[arg(long = "no-tags", value_name = "TAGS")]
    no_tags: Vec<String>,
    /// Only stacks changed since the base revision.
    #[arg(long)]
    changed: bool,
    /// Base revision for --changed.
    #[arg(long, value_name = "REF")]
    git_change_base: Option<String>,
    /// Consider these change sources even if the config disables them.
    #[arg(long, value_enum, value_delimiter = ',', value_name = "KIND")]
    enable_change_detection: Vec<DetectionKind>,
    /// Ignore these change sources even if the config enables them.
    #[arg(long, value_enum, value_delimiter = ',', value_name = "KIND")]
    disable_change_detection: Vec<DetectionKind>,
    /// Cloud status: ok, failed, drifted, unknown, unhealthy or healthy.
    #[arg(long, value_name = "STATUS")]
    status: Option<StatusFilter>,

    /// Add every stack that depends on a selected stack.
    #[arg(long)]
    include_all_dependents: bool,
    /// Replace the selection with everything that depends on it.
    #[arg(long)]
    only_all_dependents: bool,
    /// Add stacks that directly depend on a selected stack.
    #[arg(long)]
    include_direct_dependents: bool,
    /// Replace the selection with its direct dependents.
    #[arg(long)]
    only_direct_dependents: bool,
    /// Add every stack a selected stack depends on.
    #[arg(long)]
    include_all_dependencies: bool,
    /// Replace the selection with everything it depends on.
    #[arg(long)]
    only_all_dependencies: bool,
    /// Add the direct dependencies of selected stacks.
    #[arg(long)]
    include_direct_dependencies: bool,
    /// Replace the selection with its direct dependencies.
    #[arg(long)]
    only_direct_dependencies: bool,
    #[arg(long, hide = true)]
    include_output_dependencies: bool,
    #[arg(long, hide = true)]
    only_output_dependencies: bool,
    /// Drop stacks that another selected stack depends on.
    #[arg(long)]
    exclude_all_dependencies: bool,
    /// Drop stacks that depend on another selected stack.
    #[arg(long)]
    exclude_all_dependents: bool,
}

impl SelectionFlags {
    /// `matches` must be the subcommand's matches; operator order comes from them.
    fn into_args(self, matches: &ArgMatches) -> Result<SelectionArgs> {
        let toggles = ToggleFlags {
            untracked: toggle(
                DetectionKind::GitUntracked,
                &self.enable_change_detection,
                &self.disable_change_detection,
            )?,
            uncommitted: toggle(
                DetectionKind::GitUncommitted,
                &self.enable_change_detection,
                &self.disable_change_detection,
            )?,
        };
        Ok(SelectionArgs {
            stacks: self.stacks,
            tags: self.tags,
            no_tags: self.no_tags,
            changed: self.changed,
            git_change_base: self.git_change_base,
            toggles,
            status: self.status,
            operators: operators_in_order(matches),
        })
    }
}

fn toggle(
    kind: DetectionKind,
    enable: &[DetectionKind],
    disable: &[DetectionKind],
) -> Result<Option<bool>> {
    match (enable.contains(&kind), disable.contains(&kind)) {
        (true, true) => bail!(
            "{} is both enabled and disabled for change detection",
            kind.name()
        ),
        (true, false) => Ok(Some(true)),
        (false, true) => Ok(Some(false)),
        (false, false) => Ok(None),
    }
}

/// Operator flags in the order they appeared on the command line.
fn operators_in_order(matches: &ArgMatches) -> Vec<Operator> {
    let mut found: Vec<(usize, Operator)> = Vec::new();
    for op in Operator::ALL {
        let id = op.flag().replace('-', "_");
        if matches.value_source(&id) != Some(ValueSource::CommandLine) {
            continue;
        }
        if let Some(index) = matches.index_of(&id) {
            found.push((index, op));
        }
    }
    found.sort();
    found.into_iter().map(|(_, op)| op).collect()
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::FAILED);
        }
    }
}

fn run() -> Result<i32> {
    let matches = Cli::command().get_matches();
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(err) => err.exit(),
    };
    let sub_matches = matches
        .subcommand()
        .map(|(_, sub)| sub)
        .context("missing subcommand")?;
    let cwd = match cli.chdir {
        Some(dir) => dir,
        None => std::env::current_dir().context("read current directory")?,
    };

    match cli.command {
        Command::Run {
            selection,
            parallel,
            continue_on_error,
            dry_run,
            reverse,
            timeout,
            disable_safeguards,
            events_file,
            strict_ids,
            command,
        } => {
            let args = RunArgs {
                selection: selection.into_args(sub_matches)?,
                parallel,
                continue_on_error,
                dry_run,
                reverse,
                timeout: timeout.map(Duration::from_secs),
                disable_safeguards,
                events_file,
                strict_ids,
                command,
            };
            cmd_run(&cwd, &args)
        }
        Command::List {
            selection,
            why,
            run_order,
            reverse,
        } => {
            let args = ListArgs {
                selection: selection.into_args(sub_matches)?,
                why,
                run_order,
                reverse,
            };
            list_stacks(
                &cwd,
                &args,
                &mut std::io::stdout(),
                &mut std::io::stderr(),
            )?;
            Ok(exit_codes::OK)
        }
        Command::Trigger {
            stack,
            ignore_change,
            reason,
        } => {
            let kind = if ignore_change {
                TriggerKind::Ignored
            } else {
                TriggerKind::Changed
            };
            let created = trigger_stack(&cwd, &TriggerArgs { stack, kind, reason })?;
            println!("{}", created.display());
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_run(cwd: &std::path::Path, args: &RunArgs) -> Result<i32> {
    let console = ConsoleSink::stdio(&args.command, args.dry_run);
    let mut stderr = std::io::stderr();
    let report = run_stacks(cwd, args, &ProcessRunner, Box::new(console), &mut stderr)?;
    write_summary(&mut stderr, &report).context("write run summary")?;
    if report.has_failures() {
        Ok(exit_codes::FAILED)
    } else {
        Ok(exit_codes::OK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub_matches(argv: &[&str]) -> (Cli, ArgMatches) {
        let matches = Cli::command().get_matches_from(argv);
        let cli = Cli::from_arg_matches(&matches).expect("cli");
        let sub = matches.subcommand().expect("subcommand").1.clone();
        (cli, sub)
    }

    #[test]
    fn parses_run_with_trailing_command() {
        let cli = Cli::parse_from([
            "stackrun",
            "-C",
            "/repo",
            "run",
            "--parallel=5",
            "--dry-run",
            "--",
            "terraform",
            "apply",
            "-auto-approve",
        ]);
        assert_eq!(cli.chdir, Some(PathBuf::from("/repo")));
        match cli.command {
            Command::Run {
                parallel,
                dry_run,
                command,
                ..
            } => {
                assert_eq!(parallel, Some(5));
                assert!(dry_run);
                assert_eq!(command, vec!["terraform", "apply", "-auto-approve"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn operators_keep_command_line_order() {
        let (_, sub) = sub_matches(&[
            "stackrun",
            "list",
            "--exclude-all-dependents",
            "--only-direct-dependencies",
            "--include-all-dependents",
        ]);
        assert_eq!(
            operators_in_order(&sub),
            vec![
                Operator::ExcludeAllDependents,
                Operator::OnlyDirectDependencies,
                Operator::IncludeAllDependents,
            ]
        );
    }

    #[test]
    fn selection_flags_convert() {
        let (cli, sub) = sub_matches(&[
            "stackrun",
            "list",
            "--tags",
            "app:prod",
            "--no-tags",
            "legacy",
            "--changed",
            "--disable-change-detection",
            "git-untracked",
            "--status",
            "unhealthy",
            "--include-output-dependencies",
        ]);
        let Command::List { selection, .. } = cli.command else {
            panic!("expected list");
        };
        let args = selection.into_args(&sub).expect("args");
        assert_eq!(args.tags, vec!["app:prod"]);
        assert_eq!(args.no_tags, vec!["legacy"]);
        assert!(args.changed);
        assert_eq!(args.toggles.untracked, Some(false));
        assert_eq!(args.toggles.uncommitted, None);
        assert_eq!(args.status, Some(StatusFilter::Unhealthy));
        assert_eq!(args.operators, vec![Operator::IncludeOutputDependencies]);
    }

    #[test]
    fn conflicting_toggles_are_rejected() {
        assert!(
            toggle(
                DetectionKind::GitUncommitted,
                &[DetectionKind::GitUncommitted],
                &[DetectionKind::GitUncommitted],
            )
            .is_err()
        );
    }

    #[test]
    fn invalid_status_is_a_usage_error() {
        assert!(Cli::try_parse_from(["stackrun", "list", "--status", "sick"]).is_err());
    }

    #[test]
    fn strict_ids_require_an_events_file() {
        assert!(Cli::try_parse_from(["stackrun", "run", "--strict-ids", "--", "make"]).is_err());
    }

    #[test]
    fn trigger_parses_kind_and_reason() {
        let cli = Cli::parse_from([
            "stackrun",
            "trigger",
            "envs/prod",
            "--ignore-change",
            "--reason",
            "cosmetic",
        ]);
        match cli.command {
            Command::Trigger {
                stack,
                ignore_change,
                reason,
            } => {
                assert_eq!(stack, "envs/prod");
                assert!(ignore_change);
                assert_eq!(reason, "cosmetic");
            }
            _ => panic!("expected trigger"),
        }
    }
}
