//! Release build of the primary binary inside a disposable environment.

use crate::environment::{CleanupRegistry, EnvironmentGuard};
use crate::tools::{ContainerRuntime, Mount};
use anyhow::{Context, Result};
use bstage_common::config::BuildConfig;
use std::path::Path;

/// Where the prepared tree is mounted inside the build environment.
pub const SOURCE_MOUNT: &str = "/src";

/// A finished build whose environment is still alive for extraction.
pub struct BuiltPrimary {
    environment: EnvironmentGuard,
    path: String,
}

impl BuiltPrimary {
    pub fn environment(&self) -> &EnvironmentGuard {
        &self.environment
    }

    /// Location of the binary inside the environment.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Tear the build environment down.
    pub fn finish(self) -> Result<()> {
        self.environment
            .release()
            .context("Failed to remove build environment")
    }
}

pub struct ContainerBuildExecutor<'a> {
    runtime: &'a ContainerRuntime,
    registry: &'a CleanupRegistry,
    config: &'a BuildConfig,
}

impl<'a> ContainerBuildExecutor<'a> {
    pub fn new(
        runtime: &'a ContainerRuntime,
        registry: &'a CleanupRegistry,
        config: &'a BuildConfig,
    ) -> Self {
        Self {
            runtime,
            registry,
            config,
        }
    }

    /// The build invocation, run from [`SOURCE_MOUNT`].
    pub fn build_command(&self) -> Vec<String> {
        let mut command: Vec<String> = ["cargo", "build", "--release", "--locked"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if !self.config.features.is_empty() {
            command.push("--features".to_string());
            command.push(self.config.features.join(","));
        }
        command
    }

    pub fn output_path(&self) -> String {
        format!("{SOURCE_MOUNT}/target/release/{}", self.config.primary)
    }

    pub fn build(&self, source: &Path) -> Result<BuiltPrimary> {
        let mount = Mount {
            host: source.to_path_buf(),
            guest: SOURCE_MOUNT.to_string(),
        };
        let environment = EnvironmentGuard::acquire(
            self.runtime,
            self.registry,
            "build",
            &self.config.image,
            &[mount],
        )
        .context("Failed to start build environment")?;

        let manager = self.config.package_manager;
        for command in manager.install_commands(&self.config.packages) {
            self.runtime
                .exec_streaming(environment.name(), &command, &manager.env(), None)
                .context("Failed to install build packages")?;
        }

        tracing::info!(primary = %self.config.primary, "Building");
        self.runtime
            .exec_streaming(
                environment.name(),
                &self.build_command(),
                &[],
                Some(SOURCE_MOUNT),
            )
            .with_context(|| format!("Failed to build {}", self.config.primary))?;

        let path = self.output_path();
        let check = ["test".to_string(), "-x".to_string(), path.clone()];
        self.runtime
            .exec(environment.name(), &check)
            .with_context(|| format!("Build finished but produced no executable at {path}"))?;

        Ok(BuiltPrimary { environment, path })
    }
}
