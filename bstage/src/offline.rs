//! Offline dependency manifest (`cargo-sources.json`).
//!
//! The manifest lists every crate source a network-isolated rebuild needs.
//! Its existence is the whole cache: a present manifest is never regenerated.
//! Delete it to force regeneration after changing the lock file.

use crate::environment::{CleanupRegistry, EnvironmentGuard, ScopedTempDir};
use crate::output::Output;
use crate::staging::OutputTree;
use crate::tools::ContainerRuntime;
use anyhow::{bail, Context, Result};
use bstage_common::checksum::verify_sha256;
use bstage_common::config::OfflineConfig;
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Working directory inside the generator environment.
pub const WORK_DIR: &str = "/work";

/// Source of the generator script.
pub trait ScriptFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Fetches over HTTPS.
pub struct HttpFetcher;

impl ScriptFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        tracing::debug!(url, "Downloading generator");
        bstage_common::http::download(url).with_context(|| format!("Failed to download {url}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManifestOutcome {
    /// The manifest already existed; nothing was fetched or run.
    AlreadyPresent { stale: bool },
    Generated,
}

/// Whether the lock file changed after the manifest was written.
pub fn is_stale(manifest: &Path, lock_file: &Path) -> bool {
    let modified = |path: &Path| std::fs::metadata(path).and_then(|meta| meta.modified()).ok();
    match (modified(manifest), modified(lock_file)) {
        (Some(manifest), Some(lock)) => lock > manifest,
        _ => false,
    }
}

pub struct OfflineManifestGenerator<'a> {
    runtime: &'a ContainerRuntime,
    registry: &'a CleanupRegistry,
    config: &'a OfflineConfig,
    tree: &'a OutputTree,
    fetcher: &'a dyn ScriptFetcher,
}

impl<'a> OfflineManifestGenerator<'a> {
    pub fn new(
        runtime: &'a ContainerRuntime,
        registry: &'a CleanupRegistry,
        config: &'a OfflineConfig,
        tree: &'a OutputTree,
        fetcher: &'a dyn ScriptFetcher,
    ) -> Self {
        Self {
            runtime,
            registry,
            config,
            tree,
            fetcher,
        }
    }

    pub fn ensure(&self) -> Result<ManifestOutcome> {
        let dest = self.tree.manifest_path(&self.config.manifest);
        if dest.exists() {
            let stale = is_stale(&dest, &self.config.lock_file);
            if stale {
                tracing::warn!(
                    manifest = %dest.display(),
                    lock_file = %self.config.lock_file.display(),
                    "Lock file is newer than the offline manifest; delete the manifest to regenerate it"
                );
            }
            return Ok(ManifestOutcome::AlreadyPresent { stale });
        }

        let lock_file = &self.config.lock_file;
        if !lock_file.is_file() {
            bail!("Lock file {} not found", lock_file.display());
        }

        let spinner = Output::spinner("Fetching manifest generator...");
        let script = self.fetcher.fetch(&self.config.generator_url)?;
        if let Some(expected) = &self.config.generator_sha256 {
            verify_sha256(&script, expected).context("Generator script failed verification")?;
        }
        spinner.finish_clear();

        let scratch = ScopedTempDir::new(self.registry, "bstage-offline-")?;
        let script_path = scratch.path().join("generator.py");
        std::fs::write(&script_path, &script)
            .with_context(|| format!("Failed to write {}", script_path.display()))?;

        let environment = EnvironmentGuard::acquire(
            self.runtime,
            self.registry,
            "offline",
            &self.config.image,
            &[],
        )
        .context("Failed to start generator environment")?;
        let name = environment.name();

        let manager = self.config.package_manager;
        for command in manager.install_commands(&self.config.packages) {
            self.runtime
                .exec_streaming(name, &command, &manager.env(), None)
                .context("Failed to install generator packages")?;
        }

        self.runtime
            .exec(name, &["mkdir".into(), "-p".into(), WORK_DIR.into()])
            .context("Failed to create work directory")?;
        let guest_lock = format!("{WORK_DIR}/Cargo.lock");
        let guest_script = format!("{WORK_DIR}/generator.py");
        let guest_manifest = format!("{WORK_DIR}/{}", self.config.manifest);
        self.runtime
            .copy_in(lock_file, name, &guest_lock)
            .context("Failed to copy lock file into generator environment")?;
        self.runtime
            .copy_in(&script_path, name, &guest_script)
            .context("Failed to copy generator into environment")?;

        tracing::info!(manifest = %self.config.manifest, "Generating offline manifest");
        let command = vec![
            "python3".to_string(),
            guest_script,
            guest_lock,
            "-o".to_string(),
            guest_manifest.clone(),
        ];
        self.runtime
            .exec_streaming(name, &command, &[], Some(WORK_DIR))
            .context("Manifest generator failed")?;

        let produced = scratch.path().join(&self.config.manifest);
        self.runtime
            .copy_out(name, &guest_manifest, &produced)
            .context("Failed to copy manifest out of generator environment")?;
        environment
            .release()
            .context("Failed to remove generator environment")?;

        let content = std::fs::read(&produced)
            .with_context(|| format!("Failed to read {}", produced.display()))?;
        serde_json::from_slice::<serde_json::Value>(&content)
            .context("Generated manifest is not valid JSON")?;

        // Write beside the destination and rename, so readers never observe a
        // partial manifest.
        let mut staged = tempfile::NamedTempFile::new_in(self.tree.root())
            .context("Failed to create temporary manifest")?;
        staged
            .write_all(&content)
            .context("Failed to write temporary manifest")?;
        staged
            .persist(&dest)
            .with_context(|| format!("Failed to write {}", dest.display()))?;

        Output::success(format!("Generated {}", self.config.manifest));
        Ok(ManifestOutcome::Generated)
    }
}
