//! `bstage envs`: environments left behind by interrupted runs.
//!
//! Normal runs remove their environments themselves; this finds the ones a
//! `kill -9` or a crash left alive, by their management label.

use crate::command_runner::{CommandRunner, RealCommandRunner};
use crate::output::Output;
use crate::tools::ContainerRuntime;
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Args)]
pub struct EnvsArgs {
    /// Remove every listed environment
    #[arg(long)]
    pub prune: bool,
}

pub fn run(args: EnvsArgs, config_path: &Path) -> Result<()> {
    // A broken config should not stop cleanup.
    let program = super::load_config(config_path)
        .map(|config| config.container_runtime)
        .unwrap_or_else(|_| "podman".to_string());
    let runner: Arc<dyn CommandRunner> = Arc::new(RealCommandRunner);
    let runtime = ContainerRuntime::new(runner, program);

    let names = list_or_prune(&runtime, args.prune)?;
    if names.is_empty() {
        Output::success("No managed environments");
        return Ok(());
    }
    for name in &names {
        if args.prune {
            Output::step(format!("Removed {name}"));
        } else {
            Output::list_item(name);
        }
    }
    if !args.prune {
        Output::hint("Remove them with: bstage envs --prune");
    }
    Ok(())
}

/// Managed environment names, removing each one when `prune` is set.
pub fn list_or_prune(runtime: &ContainerRuntime, prune: bool) -> Result<Vec<String>> {
    let names = runtime
        .list_managed()
        .context("Failed to list managed environments")?;
    if prune {
        for name in &names {
            tracing::info!(environment = %name, "Pruning environment");
            runtime
                .remove(name)
                .with_context(|| format!("Failed to remove {name}"))?;
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_runner::{MockCommandRunner, MockResponse};

    #[test]
    fn prune_removes_each_listed_environment() {
        let mock = Arc::new(MockCommandRunner::new());
        mock.on(
            "podman ps",
            MockResponse::Success("bstage-build-1-2-0\nbstage-deps-1-2-1\n".into()),
        );
        let runtime = ContainerRuntime::new(mock.clone(), "podman");

        let names = list_or_prune(&runtime, true).unwrap();

        assert_eq!(names, ["bstage-build-1-2-0", "bstage-deps-1-2-1"]);
        assert!(mock.was_called("podman rm --force --ignore bstage-build-1-2-0"));
        assert!(mock.was_called("podman rm --force --ignore bstage-deps-1-2-1"));
    }

    #[test]
    fn listing_does_not_remove() {
        let mock = Arc::new(MockCommandRunner::new());
        mock.on("podman ps", MockResponse::Success("bstage-build-1-2-0\n".into()));
        let runtime = ContainerRuntime::new(mock.clone(), "podman");

        list_or_prune(&runtime, false).unwrap();

        assert!(mock.was_called("podman ps --all --filter label=bstage.managed=true"));
        assert!(!mock.was_called("podman rm"));
    }
}
