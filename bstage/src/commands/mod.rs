//! CLI command implementations.

pub mod completions;
pub mod doctor;
pub mod envs;
pub mod key;
pub mod plan;
pub mod run;
pub mod schema;

use anyhow::{Context, Result};
use bstage_common::config::StageConfig;
use std::path::Path;

/// Load the configuration file, resolving its relative paths against the
/// directory that holds it.
pub fn load_config(path: &Path) -> Result<StageConfig> {
    let mut config = StageConfig::load_from(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    let base = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    config.rebase(base);
    tracing::debug!(config = %path.display(), output = %config.output_dir.display(), "Loaded configuration");
    Ok(config)
}
