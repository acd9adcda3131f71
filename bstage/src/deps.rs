//! Runtime shared-library resolution and staging.
//!
//! Runs in its own environment built from the runtime distribution image, so
//! the libraries copied out are the ones that distribution ships rather than
//! whatever the build image happened to contain.

use crate::environment::{CleanupRegistry, EnvironmentGuard};
use crate::extract::{Artifact, BinaryExtractor};
use crate::output::Output;
use crate::staging::OutputTree;
use crate::tools::ContainerRuntime;
use anyhow::{bail, Context, Result};
use bstage_common::config::RuntimeConfig;
use bstage_common::ldd::parse_ldd_output;
use bstage_common::policy::{basename, PolicyTable};
use serde::Serialize;
use std::path::PathBuf;

/// Scratch location inside the runtime environment.
pub const STAGING_ROOT: &str = "/opt/bstage";

/// What one resolution pass found and staged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DependencyReport {
    /// Binaries whose dependencies were resolved, primary first.
    pub binaries: Vec<String>,
    /// Basenames copied into `lib/`, sorted.
    pub staged: Vec<String>,
    /// Basenames left to the host, sorted.
    pub host_provided: Vec<String>,
}

pub struct DependencyResolver<'a> {
    runtime: &'a ContainerRuntime,
    registry: &'a CleanupRegistry,
    config: &'a RuntimeConfig,
    policy: &'a PolicyTable,
    tree: &'a OutputTree,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(
        runtime: &'a ContainerRuntime,
        registry: &'a CleanupRegistry,
        config: &'a RuntimeConfig,
        policy: &'a PolicyTable,
        tree: &'a OutputTree,
    ) -> Self {
        Self {
            runtime,
            registry,
            config,
            policy,
            tree,
        }
    }

    /// Extract auxiliary binaries, then stage every non-host library needed by
    /// `primary` or any auxiliary binary.
    pub fn resolve(&self, primary: &str) -> Result<DependencyReport> {
        let primary_host = self.tree.binary_path(primary);
        if !self.tree.has_binary(primary) {
            bail!(
                "Primary binary {} is missing or not executable",
                primary_host.display()
            );
        }

        let environment = EnvironmentGuard::acquire(
            self.runtime,
            self.registry,
            "deps",
            &self.config.image,
            &[],
        )
        .context("Failed to start runtime environment")?;
        let name = environment.name();

        let manager = self.config.package_manager;
        for command in manager.install_commands(&self.config.packages) {
            self.runtime
                .exec_streaming(name, &command, &manager.env(), None)
                .context("Failed to install runtime packages")?;
        }

        let bin_dir = format!("{STAGING_ROOT}/bin");
        let lib_dir = format!("{STAGING_ROOT}/lib");
        self.runtime
            .exec(
                name,
                &["mkdir".into(), "-p".into(), bin_dir.clone(), lib_dir.clone()],
            )
            .context("Failed to create staging directories")?;

        // Packaged binaries may be symlinks; copy the target out, not the link.
        let mut aux = Vec::with_capacity(self.config.binaries.len());
        for binary in &self.config.binaries {
            let scratch = format!("{bin_dir}/{}", binary.name);
            self.runtime
                .exec(
                    name,
                    &["cp".into(), "-L".into(), binary.path.clone(), scratch.clone()],
                )
                .with_context(|| format!("Failed to dereference {}", binary.path))?;
            aux.push(Artifact::from_environment(&binary.name, name, &scratch));
        }
        BinaryExtractor::new(self.runtime, self.tree).install(&aux)?;

        let primary_guest = format!("{bin_dir}/{primary}");
        self.runtime
            .copy_in(&primary_host, name, &primary_guest)
            .with_context(|| format!("Failed to copy {primary} into runtime environment"))?;

        let mut targets = vec![(primary.to_string(), primary_guest)];
        targets.extend(
            self.config
                .binaries
                .iter()
                .map(|binary| (binary.name.clone(), binary.path.clone())),
        );

        let spinner = Output::spinner("Resolving shared libraries...");
        let mut resolved: Vec<PathBuf> = Vec::new();
        for (binary, guest_path) in &targets {
            spinner.set_message(format!("Resolving libraries of {binary}..."));
            let libraries = self
                .ldd(name, guest_path)
                .with_context(|| format!("Failed to resolve libraries of {binary}"))?;
            tracing::debug!(%binary, count = libraries.len(), "Resolved libraries");
            resolved.extend(libraries);
        }
        spinner.finish_clear();

        let plan = self.policy.plan(resolved.iter().map(PathBuf::as_path));
        let mut staged = Vec::with_capacity(plan.staged.len());
        for library in &plan.staged {
            let Some(file) = basename(library) else {
                continue;
            };
            let scratch = format!("{lib_dir}/{file}");
            self.runtime
                .exec(
                    name,
                    &[
                        "cp".into(),
                        "-L".into(),
                        library.to_string_lossy().into_owned(),
                        scratch.clone(),
                    ],
                )
                .with_context(|| format!("Failed to dereference {}", library.display()))?;
            self.runtime
                .copy_out(name, &scratch, &self.tree.library_path(file))
                .with_context(|| format!("Failed to copy {file}"))?;
            Output::step(format!("Staged {file}"));
            staged.push(file.to_string());
        }

        environment
            .release()
            .context("Failed to remove runtime environment")?;

        Ok(DependencyReport {
            binaries: targets.into_iter().map(|(binary, _)| binary).collect(),
            staged,
            host_provided: plan.host_provided.into_iter().collect(),
        })
    }

    fn ldd(&self, environment: &str, path: &str) -> Result<Vec<PathBuf>> {
        let output = self
            .runtime
            .exec_unchecked(environment, &["ldd".into(), path.to_string()])?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not a dynamic executable")
                || stdout.contains("not a dynamic executable")
            {
                return Ok(Vec::new());
            }
            bail!("ldd {path} exited with {}: {}", output.status, stderr.trim());
        }
        Ok(parse_ldd_output(&stdout)?)
    }
}
