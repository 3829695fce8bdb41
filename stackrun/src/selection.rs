//! Loads a project and resolves which stacks an invocation targets.
//!
//! Shared by `run` and `list`. The precedence is fixed: explicit paths, tags,
//! changed stacks and cloud status form the base set, `wants` widens it,
//! dependency operators post-process it, and the working-directory scope is
//! applied last.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::changed::{DetectionToggles, ToggleFlags, default_base_ref, list_changed};
use crate::core::changes::ChangeReport;
use crate::core::graph::{Graphs, build};
use crate::core::order::InducedOrder;
use crate::core::path::ProjectPath;
use crate::core::selection::{BaseFilter, Operator, base_set, select};
use crate::core::tags::TagFilter;
use crate::io::config::{OnGitError, ProjectConfig, load_config};
use crate::io::git::Git;
use crate::io::loader::{LoadedProject, load_project};
use crate::io::project::ProjectPaths;
use crate::io::status::{StatusFilter, StatusSnapshot};

/// Selection flags shared by every command that targets stacks.
#[derive(Debug, Clone, Default)]
pub struct SelectionArgs {
    /// `--stack` values, relative to the working directory or project-absolute.
    pub stacks: Vec<String>,
    pub tags: Vec<String>,
    pub no_tags: Vec<String>,
    pub changed: bool,
    pub git_change_base: Option<String>,
    pub toggles: ToggleFlags,
    pub status: Option<StatusFilter>,
    /// Operators in the order they were given on the command line.
    pub operators: Vec<Operator>,
}

/// Everything a command needs after selection.
#[derive(Debug, Clone)]
pub struct Plan {
    pub paths: ProjectPaths,
    pub config: ProjectConfig,
    pub project: LoadedProject,
    pub graphs: Graphs,
    /// Working directory as a project path.
    pub scope: ProjectPath,
    pub selected: BTreeSet<ProjectPath>,
    /// Present when `--changed` was given.
    pub changes: Option<ChangeReport>,
    /// Warnings and notices for the user, in the order they arose.
    pub notices: Vec<String>,
}

impl Plan {
    /// Execution order over the selection.
    pub fn order(&self, reverse: bool) -> InducedOrder {
        self.graphs.order.induced(&self.selected, reverse)
    }

    pub fn write_notices(&self, w: &mut dyn Write) -> std::io::Result<()> {
        for notice in &self.notices {
            writeln!(w, "stackrun: {notice}")?;
        }
        Ok(())
    }
}

#[instrument(skip_all, fields(cwd = %cwd.display()))]
pub fn plan(cwd: &Path, args: &SelectionArgs) -> Result<Plan> {
    let paths = ProjectPaths::discover(cwd)?;
    let config = load_config(&paths.config_path)?;
    let project = load_project(&paths.root)?;
    let graphs = build(&project.stacks)?;
    debug!(
        stacks = project.stacks.len(),
        order_edges = graphs.order.edge_count(),
        "graphs built"
    );

    let cwd = cwd
        .canonicalize()
        .with_context(|| format!("resolve {}", cwd.display()))?;
    let scope = ProjectPath::from_host(&paths.root, &cwd)
        .ok_or_else(|| anyhow!("{} is outside the project", cwd.display()))?;

    let mut notices: Vec<String> = graphs
        .warnings
        .iter()
        .map(|w| format!("warning: {w}"))
        .collect();

    let mut filter = BaseFilter::default();
    if !args.stacks.is_empty() {
        let resolved = args
            .stacks
            .iter()
            .map(|raw| {
                scope
                    .resolve(raw)
                    .with_context(|| format!("--stack {raw}: invalid path"))
            })
            .collect::<Result<Vec<_>>>()?;
        filter.paths = Some(resolved);
    }
    filter.tags = tag_filter(args)?;

    let changes = if args.changed {
        let report = detect_changes(&paths, &config, &project, args, &mut notices)?;
        filter.changed = Some(report.changed_paths());
        Some(report)
    } else {
        None
    };

    if let Some(status) = args.status {
        let file = paths.root.join(&config.cloud.status_file);
        let snapshot = StatusSnapshot::load(&file)?;
        filter.status = Some(snapshot.select(project.stacks.iter().map(|s| &s.path), status));
    }

    let base = base_set(&project.stacks, &graphs, &filter)?;
    notices.extend(base.notices);
    let selection = select(&base.set, &args.operators, &graphs.data);
    notices.extend(selection.notices);

    let selected: BTreeSet<ProjectPath> = selection
        .set
        .into_iter()
        .filter(|stack| stack.is_within(&scope))
        .collect();
    debug!(selected = selected.len(), scope = %scope, "selection resolved");

    Ok(Plan {
        paths,
        config,
        project,
        graphs,
        scope,
        selected,
        changes,
        notices,
    })
}

fn tag_filter(args: &SelectionArgs) -> Result<Option<TagFilter>> {
    let included = TagFilter::parse_all(&args.tags).context("--tags")?;
    let excluded = TagFilter::parse_excluded(&args.no_tags).context("--no-tags")?;
    Ok(match (included, excluded) {
        (Some(included), Some(excluded)) => Some(included.and(excluded)),
        (included, excluded) => included.or(excluded),
    })
}

fn detect_changes(
    paths: &ProjectPaths,
    config: &ProjectConfig,
    project: &LoadedProject,
    args: &SelectionArgs,
    notices: &mut Vec<String>,
) -> Result<ChangeReport> {
    let git = Git::new(&paths.root);
    let base_ref = match &args.git_change_base {
        Some(base_ref) => base_ref.clone(),
        None => default_base_ref(&git, &config.git),
    };
    let toggles = DetectionToggles::resolve(&config.change_detection, args.toggles);

    match list_changed(project, paths, &git, &base_ref, toggles) {
        Ok(report) => Ok(report),
        Err(err) if config.change_detection.on_git_error == OnGitError::Warn => {
            let err = anyhow::Error::new(err);
            warn!("change detection failed: {err:#}");
            notices.push(format!(
                "warning: change detection failed, no stack is considered changed: {err:#}"
            ));
            Ok(ChangeReport::default())
        }
        Err(err) => Err(anyhow::Error::new(err).context("change detection")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestRepo, write_file, write_stack};

    fn selected(plan: &Plan) -> Vec<String> {
        plan.selected.iter().map(|s| s.to_string()).collect()
    }

    fn project_with_dependencies() -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        std::fs::create_dir_all(root.join(".stackrun")).expect("control dir");
        write_stack(root, "/net", "id = \"net\"\ntags = [\"network\"]\n");
        write_stack(
            root,
            "/apps/api",
            "id = \"api\"\ntags = [\"app\"]\n\n[[input]]\nname = \"vpc\"\nfrom_stack_id = \"net\"\n",
        );
        write_stack(
            root,
            "/apps/web",
            "id = \"web\"\ntags = [\"app\", \"public\"]\nafter = [\"/apps/api\"]\n",
        );
        temp
    }

    #[test]
    fn selects_everything_under_the_working_directory() {
        let temp = project_with_dependencies();
        let plan = plan(temp.path(), &SelectionArgs::default()).expect("plan");
        assert_eq!(selected(&plan), vec!["/apps/api", "/apps/web", "/net"]);

        let plan = plan_in(&temp.path().join("apps"), &SelectionArgs::default());
        assert_eq!(selected(&plan), vec!["/apps/api", "/apps/web"]);
    }

    fn plan_in(dir: &Path, args: &SelectionArgs) -> Plan {
        plan(dir, args).expect("plan")
    }

    #[test]
    fn tags_and_no_tags_combine() {
        let temp = project_with_dependencies();
        let args = SelectionArgs {
            tags: vec!["app".to_string()],
            no_tags: vec!["public".to_string()],
            ..SelectionArgs::default()
        };
        assert_eq!(selected(&plan_in(temp.path(), &args)), vec!["/apps/api"]);
    }

    #[test]
    fn operators_follow_data_edges_only() {
        let temp = project_with_dependencies();
        let args = SelectionArgs {
            stacks: vec!["/apps/api".to_string()],
            operators: vec![Operator::IncludeAllDependencies],
            ..SelectionArgs::default()
        };
        assert_eq!(
            selected(&plan_in(temp.path(), &args)),
            vec!["/apps/api", "/net"]
        );

        let args = SelectionArgs {
            stacks: vec!["/apps/web".to_string()],
            operators: vec![Operator::IncludeAllDependencies],
            ..SelectionArgs::default()
        };
        assert_eq!(selected(&plan_in(temp.path(), &args)), vec!["/apps/web"]);
    }

    #[test]
    fn relative_stack_paths_resolve_against_the_working_directory() {
        let temp = project_with_dependencies();
        let args = SelectionArgs {
            stacks: vec!["web".to_string()],
            ..SelectionArgs::default()
        };
        let plan = plan_in(&temp.path().join("apps"), &args);
        assert_eq!(selected(&plan), vec!["/apps/web"]);
    }

    #[test]
    fn unknown_stack_is_fatal() {
        let temp = project_with_dependencies();
        let args = SelectionArgs {
            stacks: vec!["/nope".to_string()],
            ..SelectionArgs::default()
        };
        let err = plan(temp.path(), &args).expect_err("unknown");
        assert!(format!("{err:#}").contains("--stack /nope: no stack at this path"));
    }

    #[test]
    fn invalid_tag_filter_is_fatal() {
        let temp = project_with_dependencies();
        let args = SelectionArgs {
            tags: vec!["Bad Tag".to_string()],
            ..SelectionArgs::default()
        };
        assert!(plan(temp.path(), &args).is_err());
    }

    #[test]
    fn status_filter_reads_the_snapshot() {
        let temp = project_with_dependencies();
        write_file(
            temp.path(),
            ".stackrun/status.json",
            r#"{"/net": "drifted", "/apps/api": "ok"}"#,
        );
        let args = SelectionArgs {
            status: Some(StatusFilter::Unhealthy),
            ..SelectionArgs::default()
        };
        assert_eq!(selected(&plan_in(temp.path(), &args)), vec!["/net"]);
    }

    #[test]
    fn changed_selection_is_not_widened_by_ordering() {
        let repo = TestRepo::new();
        repo.write_stack("/a", "");
        repo.write_stack("/b", "after = [\"/a\"]\n");
        repo.commit_all("initial");
        repo.write("b/main.tf", "# edit\n");
        repo.commit_all("edit b");

        let args = SelectionArgs {
            changed: true,
            ..SelectionArgs::default()
        };
        let plan = plan_in(repo.path(), &args);
        assert_eq!(selected(&plan), vec!["/b"]);
        assert!(plan.changes.is_some());
    }

    #[test]
    fn git_errors_fail_unless_downgraded() {
        let repo = TestRepo::new();
        repo.write_stack("/a", "");
        repo.commit_all("only commit");
        let args = SelectionArgs {
            changed: true,
            ..SelectionArgs::default()
        };
        let err = plan(repo.path(), &args).expect_err("HEAD^ missing");
        assert!(format!("{err:#}").contains("cannot resolve base revision \"HEAD^\""));

        repo.write(
            ".stackrun/config.toml",
            "[change_detection]\non_git_error = \"warn\"\n",
        );
        let plan = plan_in(repo.path(), &args);
        assert!(plan.selected.is_empty());
        assert!(
            plan.notices
                .iter()
                .any(|n| n.contains("change detection failed"))
        );
    }

    #[test]
    fn order_cycles_are_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join(".stackrun")).expect("control dir");
        write_stack(temp.path(), "/a", "after = [\"/b\"]\n");
        write_stack(temp.path(), "/b", "after = [\"/a\"]\n");
        let err = plan(temp.path(), &SelectionArgs::default()).expect_err("cycle");
        assert!(err.to_string().starts_with("cycle detected: "));
    }
}
