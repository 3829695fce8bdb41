//! Change detection for `--changed`.
//!
//! Resolves the base revision, asks git for the changed, untracked and
//! uncommitted paths, and classifies every stack against them together with
//! the trigger markers and local module references.

use std::error::Error as StdError;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::changes::{ChangeReport, GitChanges, classify};
use crate::core::hierarchy::Hierarchy;
use crate::core::path::ProjectPath;
use crate::io::config::{ChangeDetectionConfig, GitConfig};
use crate::io::git::GitSource;
use crate::io::loader::LoadedProject;
use crate::io::modules::local_modules;
use crate::io::project::ProjectPaths;
use crate::io::triggers::load_snapshot;

type Source = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum ChangeDetectionError {
    #[error("cannot resolve base revision {rev:?}")]
    BaseRef {
        rev: String,
        #[source]
        source: Source,
    },

    #[error("git {step} failed")]
    Git {
        step: &'static str,
        #[source]
        source: Source,
    },

    #[error("read trigger markers")]
    Triggers(#[source] Source),

    #[error("scan local modules")]
    Modules(#[source] Source),
}

/// Per-invocation overrides; `None` falls back to the project config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ToggleFlags {
    pub untracked: Option<bool>,
    pub uncommitted: Option<bool>,
}

/// Which sources of change are considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionToggles {
    pub untracked: bool,
    pub uncommitted: bool,
    pub terraform_modules: bool,
}

impl DetectionToggles {
    /// Flags win over config, config wins over the built-in defaults.
    pub fn resolve(config: &ChangeDetectionConfig, flags: ToggleFlags) -> Self {
        Self {
            untracked: flags.untracked.unwrap_or(config.git_untracked),
            uncommitted: flags.uncommitted.unwrap_or(config.git_uncommitted),
            terraform_modules: config.terraform_modules,
        }
    }
}

impl Default for DetectionToggles {
    fn default() -> Self {
        Self::resolve(&ChangeDetectionConfig::default(), ToggleFlags::default())
    }
}

/// `HEAD^` on the default branch, `<remote>/<default branch>` anywhere else
/// (including a detached HEAD).
pub fn default_base_ref(git: &dyn GitSource, config: &GitConfig) -> String {
    match git.current_branch() {
        Ok(branch) if branch == config.default_branch => "HEAD^".to_string(),
        Ok(branch) => {
            debug!(%branch, "not on the default branch");
            format!("{}/{}", config.default_remote, config.default_branch)
        }
        Err(err) => {
            debug!("no current branch: {err:#}");
            format!("{}/{}", config.default_remote, config.default_branch)
        }
    }
}

/// Classify the project's stacks against the changes since `base_ref`.
///
/// Pure with respect to its inputs: the same repository state and marker
/// files always give the same report.
#[instrument(skip_all, fields(base_ref = %base_ref))]
pub fn list_changed(
    project: &LoadedProject,
    paths: &ProjectPaths,
    git: &dyn GitSource,
    base_ref: &str,
    toggles: DetectionToggles,
) -> Result<ChangeReport, ChangeDetectionError> {
    let base = git
        .rev_parse(base_ref)
        .map_err(|err| ChangeDetectionError::BaseRef {
            rev: base_ref.to_string(),
            source: err.into(),
        })?;
    let head = git.rev_parse("HEAD").map_err(|err| ChangeDetectionError::Git {
        step: "rev-parse HEAD",
        source: err.into(),
    })?;

    let diff = if base == head {
        Vec::new()
    } else {
        git.diff_files(&base, &head)
            .map_err(|err| ChangeDetectionError::Git {
                step: "diff",
                source: err.into(),
            })?
    };
    let untracked = if toggles.untracked {
        git.untracked_files()
            .map_err(|err| ChangeDetectionError::Git {
                step: "ls-files --others",
                source: err.into(),
            })?
    } else {
        Vec::new()
    };
    let uncommitted = if toggles.uncommitted {
        git.uncommitted_files()
            .map_err(|err| ChangeDetectionError::Git {
                step: "ls-files --modified",
                source: err.into(),
            })?
    } else {
        Vec::new()
    };

    let changes = GitChanges {
        diff: to_project_paths(diff),
        untracked: to_project_paths(untracked),
        uncommitted: to_project_paths(uncommitted),
    };
    debug!(
        diff = changes.diff.len(),
        untracked = changes.untracked.len(),
        uncommitted = changes.uncommitted.len(),
        "git changes"
    );

    let modules = if toggles.terraform_modules {
        local_modules(&paths.root, &project.stacks)
            .map_err(|err| ChangeDetectionError::Modules(err.into()))?
    } else {
        Default::default()
    };
    let triggers =
        load_snapshot(paths).map_err(|err| ChangeDetectionError::Triggers(err.into()))?;
    let hierarchy = Hierarchy::new(project.stacks.iter().map(|s| &s.path));

    let report = classify(&project.stacks, &hierarchy, &modules, &triggers, &changes);
    debug!(changed = report.stacks.len(), "change detection done");
    Ok(report)
}

fn to_project_paths(files: Vec<String>) -> Vec<ProjectPath> {
    let mut out: Vec<ProjectPath> = files
        .into_iter()
        .filter_map(|file| match ProjectPath::from_repo_relative(&file) {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(file, "ignoring changed path: {err}");
                None
            }
        })
        .collect();
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::changes::{ChangeReason, TriggerKind};
    use crate::io::loader::load_project;
    use crate::io::triggers::create_trigger;
    use crate::test_support::{FakeGit, TestRepo, pp, write_file, write_stack};

    fn changed(report: &ChangeReport) -> Vec<String> {
        report.stacks.iter().map(|s| s.path.to_string()).collect()
    }

    fn project(root: &std::path::Path) -> (LoadedProject, ProjectPaths) {
        (load_project(root).expect("load"), ProjectPaths::new(root))
    }

    #[test]
    fn base_ref_follows_the_current_branch() {
        let config = GitConfig::default();
        assert_eq!(default_base_ref(&FakeGit::on_branch("main"), &config), "HEAD^");
        assert_eq!(
            default_base_ref(&FakeGit::on_branch("feature"), &config),
            "origin/main"
        );
        assert_eq!(default_base_ref(&FakeGit::default(), &config), "origin/main");
    }

    #[test]
    fn flags_override_config() {
        let config = ChangeDetectionConfig {
            git_untracked: false,
            ..ChangeDetectionConfig::default()
        };
        let toggles = DetectionToggles::resolve(
            &config,
            ToggleFlags {
                untracked: None,
                uncommitted: Some(false),
            },
        );
        assert!(!toggles.untracked);
        assert!(!toggles.uncommitted);

        let toggles = DetectionToggles::resolve(
            &config,
            ToggleFlags {
                untracked: Some(true),
                uncommitted: None,
            },
        );
        assert!(toggles.untracked);
        assert!(toggles.uncommitted);
    }

    #[test]
    fn classifies_diff_untracked_and_uncommitted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        write_stack(root, "/a", "");
        write_stack(root, "/b", "");
        write_stack(root, "/c", "");
        write_stack(root, "/d", "");
        let (project, paths) = project(root);

        let git = FakeGit::on_branch("main")
            .with_rev("HEAD^", "c1")
            .with_rev("HEAD", "c2")
            .with_diff(&["a/main.tf"])
            .with_untracked(&["b/new.tf"])
            .with_uncommitted(&["c/main.tf"]);

        let report =
            list_changed(&project, &paths, &git, "HEAD^", DetectionToggles::default())
                .expect("detect");
        assert_eq!(changed(&report), vec!["/a", "/b", "/c"]);
        assert_eq!(report.untracked_files, vec![pp("/b/new.tf")]);

        let toggles = DetectionToggles {
            untracked: false,
            uncommitted: false,
            terraform_modules: true,
        };
        let report = list_changed(&project, &paths, &git, "HEAD^", toggles).expect("detect");
        assert_eq!(changed(&report), vec!["/a"]);
    }

    #[test]
    fn same_base_and_head_skips_the_diff() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_stack(temp.path(), "/a", "");
        let (project, paths) = project(temp.path());
        let git = FakeGit {
            fail_diff: true,
            ..FakeGit::on_branch("main")
                .with_rev("HEAD^", "c1")
                .with_rev("HEAD", "c1")
        };
        let report = list_changed(&project, &paths, &git, "HEAD^", DetectionToggles::default())
            .expect("detect");
        assert!(report.stacks.is_empty());
    }

    #[test]
    fn unknown_base_ref_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (project, paths) = project(temp.path());
        let git = FakeGit::on_branch("main").with_rev("HEAD", "c1");
        let err = list_changed(&project, &paths, &git, "origin/main", DetectionToggles::default())
            .expect_err("missing base");
        assert!(matches!(err, ChangeDetectionError::BaseRef { .. }));
        assert_eq!(err.to_string(), "cannot resolve base revision \"origin/main\"");
    }

    #[test]
    fn diff_failure_is_reported_with_its_step() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (project, paths) = project(temp.path());
        let git = FakeGit {
            fail_diff: true,
            ..FakeGit::on_branch("main")
                .with_rev("HEAD^", "c1")
                .with_rev("HEAD", "c2")
        };
        let err = list_changed(&project, &paths, &git, "HEAD^", DetectionToggles::default())
            .expect_err("diff fails");
        assert_eq!(err.to_string(), "git diff failed");
        assert!(err.source().is_some());
    }

    #[test]
    fn detection_is_idempotent_in_a_real_repository() {
        let repo = TestRepo::new();
        repo.write_stack("/net", "");
        repo.write_stack("/app", "watch = [\"/shared/versions.tf\"]\n");
        repo.write("modules/db/main.tf", "# db\n");
        repo.write("db/main.tf", "module \"db\" {\n  source = \"../modules/db\"\n}\n");
        repo.write_stack("/db", "");
        repo.commit_all("initial");

        repo.write("modules/db/main.tf", "# db v2\n");
        repo.write("shared/versions.tf", "# pin\n");
        repo.commit_all("change module and watched file");

        let (project, paths) = project(repo.path());
        let git = repo.git();
        let first = list_changed(&project, &paths, &git, "HEAD^", DetectionToggles::default())
            .expect("detect");
        let second = list_changed(&project, &paths, &git, "HEAD^", DetectionToggles::default())
            .expect("detect");
        assert_eq!(first, second);
        assert_eq!(changed(&first), vec!["/app", "/db"]);
        assert_eq!(first.reason_for(&pp("/app")), Some(&ChangeReason::Watched));
        assert_eq!(
            first.reason_for(&pp("/db")),
            Some(&ChangeReason::Module {
                module: pp("/modules/db")
            })
        );
    }

    #[test]
    fn committed_markers_drive_classification() {
        let repo = TestRepo::new();
        repo.write_stack("/a", "");
        repo.write_stack("/b", "");
        repo.commit_all("initial");

        let paths = ProjectPaths::new(repo.path());
        create_trigger(&paths, &pp("/a"), TriggerKind::Changed, "rotate keys").expect("trigger");
        repo.write("b/main.tf", "# edit\n");
        create_trigger(&paths, &pp("/b"), TriggerKind::Ignored, "cosmetic").expect("trigger");
        repo.commit_all("markers");

        let (project, _) = project(repo.path());
        let report = list_changed(
            &project,
            &paths,
            &repo.git(),
            "HEAD^",
            DetectionToggles::default(),
        )
        .expect("detect");
        assert_eq!(changed(&report), vec!["/a"]);
        assert_eq!(
            report.reason_for(&pp("/a")),
            Some(&ChangeReason::Triggered {
                reason: "rotate keys".to_string()
            })
        );
    }

    #[test]
    fn stale_markers_are_inactive() {
        let repo = TestRepo::new();
        repo.write_stack("/a", "");
        repo.commit_all("initial");
        let paths = ProjectPaths::new(repo.path());
        create_trigger(&paths, &pp("/a"), TriggerKind::Changed, "old").expect("trigger");
        repo.commit_all("marker");
        write_file(repo.path(), "README.md", "docs\n");
        repo.commit_all("unrelated");

        let (project, _) = project(repo.path());
        let report = list_changed(
            &project,
            &paths,
            &repo.git(),
            "HEAD^",
            DetectionToggles::default(),
        )
        .expect("detect");
        assert!(report.stacks.is_empty());
    }
}
