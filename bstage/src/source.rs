//! Deterministic source preparation.
//!
//! pin → revert → patch → submodules, each step aborting the whole
//! preparation on its first failure. The working tree lives in a registered
//! temporary directory, so a failed preparation leaves nothing behind.

use crate::command_runner::CommandRunner;
use crate::environment::{CleanupRegistry, ScopedTempDir};
use crate::tools::{Git, ToolError};
use bstage_common::cache_key::BuildSpec;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("failed to set up source workspace: {message}")]
    Workspace { message: String },

    #[error("failed to clone {url}")]
    Clone {
        url: String,
        #[source]
        source: ToolError,
    },

    #[error("failed to check out {commit}")]
    Checkout {
        commit: String,
        #[source]
        source: ToolError,
    },

    #[error("checked out {head}, which is not the pinned commit {commit}")]
    PinMismatch { commit: String, head: String },

    #[error("revert of {commit} did not apply cleanly")]
    Revert {
        commit: String,
        #[source]
        source: ToolError,
    },

    #[error("patch {name} does not apply")]
    Patch {
        name: String,
        #[source]
        source: ToolError,
    },

    #[error("failed to initialize submodules")]
    Submodules(#[source] ToolError),
}

/// A fully prepared tree. Dropping it removes the workspace.
pub struct PreparedSource {
    _workspace: ScopedTempDir,
    tree: PathBuf,
}

impl PreparedSource {
    /// The working tree (the repository root).
    pub fn path(&self) -> &Path {
        &self.tree
    }
}

/// Whether `head` is the commit `pinned` names. Only hex ids can be checked
/// locally; anything else is trusted to git.
fn matches_pin(pinned: &str, head: &str) -> bool {
    let pinned = pinned.to_ascii_lowercase();
    !pinned.chars().all(|c| c.is_ascii_hexdigit()) || head.starts_with(&pinned)
}

pub struct SourcePreparer<'a> {
    runner: &'a dyn CommandRunner,
    registry: &'a CleanupRegistry,
    url: String,
    submodules: bool,
}

impl<'a> SourcePreparer<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        registry: &'a CleanupRegistry,
        url: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            registry,
            url: url.into(),
            submodules: true,
        }
    }

    pub fn submodules(mut self, enabled: bool) -> Self {
        self.submodules = enabled;
        self
    }

    pub fn prepare(&self, spec: &BuildSpec) -> Result<PreparedSource, PrepareError> {
        let workspace = ScopedTempDir::new(self.registry, "bstage-source-").map_err(|err| {
            PrepareError::Workspace {
                message: format!("{err:#}"),
            }
        })?;
        let tree = workspace.path().join("src");
        let git = Git::new(self.runner);

        tracing::info!(url = %self.url, commit = %spec.commit, "Cloning source");
        git.clone_repo(&self.url, &tree)
            .map_err(|source| PrepareError::Clone {
                url: self.url.clone(),
                source,
            })?;
        git.checkout(&tree, &spec.commit)
            .map_err(|source| PrepareError::Checkout {
                commit: spec.commit.clone(),
                source,
            })?;
        let head = git.head(&tree).map_err(|source| PrepareError::Checkout {
            commit: spec.commit.clone(),
            source,
        })?;
        if !matches_pin(&spec.commit, &head) {
            return Err(PrepareError::PinMismatch {
                commit: spec.commit.clone(),
                head,
            });
        }
        tracing::debug!(%head, "Checked out pinned commit");

        for commit in &spec.reverts {
            tracing::info!(%commit, "Reverting");
            git.revert(&tree, commit)
                .map_err(|source| PrepareError::Revert {
                    commit: commit.clone(),
                    source,
                })?;
        }

        if !spec.patches.is_empty() {
            // Apply the exact bytes that went into the cache key, not whatever
            // is on disk by now.
            let patch_dir = workspace.path().join("patches");
            std::fs::create_dir_all(&patch_dir).map_err(|err| PrepareError::Workspace {
                message: format!("{}: {err}", patch_dir.display()),
            })?;

            for patch in spec.patches.iter() {
                let path = patch_dir.join(&patch.name);
                std::fs::write(&path, &patch.contents).map_err(|err| {
                    PrepareError::Workspace {
                        message: format!("{}: {err}", path.display()),
                    }
                })?;
                tracing::info!(patch = %patch.name, "Applying patch");
                git.apply(&tree, &path)
                    .map_err(|source| PrepareError::Patch {
                        name: patch.name.clone(),
                        source,
                    })?;
            }
        }

        if self.submodules {
            tracing::info!("Initializing submodules");
            git.update_submodules(&tree)
                .map_err(PrepareError::Submodules)?;
        }

        Ok(PreparedSource {
            _workspace: workspace,
            tree,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_runner::{MockCommandRunner, MockResponse};
    use bstage_common::cache_key::{Patch, PatchSet};
    use std::sync::{Arc, Mutex};

    fn spec(reverts: &[&str], patches: Vec<Patch>) -> BuildSpec {
        BuildSpec {
            commit: "0123abcd".to_string(),
            reverts: reverts.iter().map(|s| s.to_string()).collect(),
            patches: PatchSet::from_patches(patches),
        }
    }

    const HEAD: &str = "0123abcd00000000000000000000000000000000";

    /// A runner whose checkout lands on the pinned commit.
    fn pinned_mock() -> MockCommandRunner {
        let mock = MockCommandRunner::new();
        mock.on("git rev-parse HEAD", MockResponse::Success(format!("{HEAD}\n")));
        mock
    }

    fn git_subcommands(mock: &MockCommandRunner) -> Vec<String> {
        mock.calls()
            .iter()
            .filter(|call| call.program == "git")
            .map(|call| {
                call.args
                    .iter()
                    .find(|arg| !arg.starts_with('-') && !arg.contains('='))
                    .cloned()
                    .unwrap_or_default()
            })
            .collect()
    }

    #[test]
    fn steps_run_in_order() {
        let mock = pinned_mock();
        let registry = CleanupRegistry::with_invocation("test");
        let preparer = SourcePreparer::new(&mock, &registry, "https://example.invalid/repo");

        let prepared = preparer
            .prepare(&spec(
                &["r1", "r2"],
                vec![Patch::new("b.patch", "B"), Patch::new("a.patch", "A")],
            ))
            .unwrap();

        assert_eq!(
            git_subcommands(&mock),
            vec![
                "clone", "checkout", "rev-parse", "revert", "revert", "apply", "apply",
                "submodule"
            ]
        );
        let lines = mock.command_lines();
        assert!(lines[3].ends_with("revert --no-edit r1"));
        assert!(lines[4].ends_with("revert --no-edit r2"));
        assert!(lines[5].ends_with("a.patch"));
        assert!(lines[6].ends_with("b.patch"));
        assert!(prepared.path().ends_with("src"));
        assert_eq!(registry.live_directories().len(), 1);
        drop(prepared);
        assert!(registry.is_empty());
    }

    #[test]
    fn git_runs_with_fixed_identity() {
        let mock = pinned_mock();
        let registry = CleanupRegistry::with_invocation("test");
        SourcePreparer::new(&mock, &registry, "u")
            .submodules(false)
            .prepare(&spec(&["r1"], vec![]))
            .unwrap();

        for call in mock.calls() {
            let env: std::collections::HashMap<_, _> = call.env.iter().cloned().collect();
            assert_eq!(env.get("GIT_CONFIG_NOSYSTEM").map(String::as_str), Some("1"));
            assert_eq!(
                env.get("GIT_COMMITTER_DATE").map(String::as_str),
                Some("2000-01-01T00:00:00+0000")
            );
            assert_eq!(env.get("LC_ALL").map(String::as_str), Some("C"));
        }
        assert!(!mock.was_called("git submodule"));
    }

    #[test]
    fn revert_conflict_aborts_before_patches() {
        let mock = pinned_mock();
        mock.on("git revert --no-edit r2", MockResponse::Failure {
            code: 1,
            stderr: "CONFLICT (content)".into(),
        });
        let registry = CleanupRegistry::with_invocation("test");

        let err = SourcePreparer::new(&mock, &registry, "u")
            .prepare(&spec(&["r1", "r2", "r3"], vec![Patch::new("a.patch", "A")]))
            .err()
            .unwrap();

        assert!(matches!(&err, PrepareError::Revert { commit, .. } if commit == "r2"));
        assert!(!mock.was_called("git revert --no-edit r3"));
        assert!(!mock.was_called("git apply"));
        assert!(registry.is_empty());
    }

    #[test]
    fn failing_patch_is_named_and_workspace_removed() {
        let mock = pinned_mock();
        mock.on("git apply", MockResponse::Failure {
            code: 1,
            stderr: "error: patch failed".into(),
        });
        let registry = CleanupRegistry::with_invocation("test");

        let err = SourcePreparer::new(&mock, &registry, "u")
            .prepare(&spec(&[], vec![Patch::new("01-fix.patch", "x")]))
            .err()
            .unwrap();

        assert!(matches!(&err, PrepareError::Patch { name, .. } if name == "01-fix.patch"));
        assert!(err.to_string().contains("01-fix.patch"));
        assert!(registry.live_directories().is_empty());
    }

    #[test]
    fn applied_bytes_match_patch_contents() {
        let mock = pinned_mock();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        mock.on(
            "git apply",
            MockResponse::handler(move |call| {
                let path = call.args.last().cloned().unwrap_or_default();
                captured.lock().unwrap().push(std::fs::read(path).unwrap());
                MockResponse::Success(String::new())
            }),
        );
        let registry = CleanupRegistry::with_invocation("test");

        SourcePreparer::new(&mock, &registry, "u")
            .prepare(&spec(&[], vec![Patch::new("a.patch", b"\x00diff".to_vec())]))
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![b"\x00diff".to_vec()]);
    }

    #[test]
    fn checkout_off_the_pin_is_rejected() {
        let mock = pinned_mock();
        mock.on(
            "git rev-parse HEAD",
            MockResponse::Success("ffffffff00000000000000000000000000000000\n".into()),
        );
        let registry = CleanupRegistry::with_invocation("test");

        let err = SourcePreparer::new(&mock, &registry, "u")
            .prepare(&spec(&["r1"], vec![]))
            .err()
            .unwrap();

        assert!(matches!(err, PrepareError::PinMismatch { .. }));
        assert!(!mock.was_called("git revert"));
        assert!(registry.is_empty());
    }

    #[test]
    fn pin_matching() {
        assert!(matches_pin("0123ABCD", HEAD));
        assert!(matches_pin(HEAD, HEAD));
        assert!(!matches_pin("0123abce", HEAD));
        // Named refs are resolved by git itself.
        assert!(matches_pin("v1.2", HEAD));
    }
}
