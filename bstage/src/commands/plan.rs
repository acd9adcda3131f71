//! `bstage plan`: report the decisions `run` would make.

use crate::command_runner::RealCommandRunner;
use crate::environment::CleanupRegistry;
use crate::extract::primary_override_from_env;
use crate::offline::is_stale;
use crate::output::Output;
use crate::pipeline::{BuildPath, Pipeline};
use crate::tools::ContainerRuntime;
use anyhow::Result;
use bstage_common::policy::LibraryPolicy;
use clap::Args;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Args)]
pub struct PlanArgs {
    /// Plan as if this prebuilt primary binary were given
    #[arg(long = "override", value_name = "PATH")]
    pub primary_override: Option<PathBuf>,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table")]
    pub format: String,
}

#[derive(Debug, Serialize)]
struct PlanSummary {
    output_dir: PathBuf,
    build_path: String,
    cache_key: Option<String>,
    recorded_key: Option<String>,
    override_path: Option<PathBuf>,
    reverts: Vec<String>,
    patches: Vec<String>,
    manifest_present: bool,
    manifest_stale: bool,
    host_provided_patterns: Vec<String>,
}

pub fn run(args: PlanArgs, config_path: &Path) -> Result<()> {
    let config = super::load_config(config_path)?;
    let primary = primary_override_from_env(args.primary_override.as_deref());

    // Nothing is executed: deciding only reads the output tree and patches.
    let runtime = ContainerRuntime::new(
        Arc::new(RealCommandRunner),
        config.container_runtime.clone(),
    );
    let pipeline = Pipeline::new(config, runtime, CleanupRegistry::new()).with_override(primary);
    let path = pipeline.decide()?;
    let config = pipeline.config();
    let tree = pipeline.tree();

    let patches: Vec<String> = match &path {
        BuildPath::Build { spec, .. } => spec.patches.iter().map(|p| p.name.clone()).collect(),
        _ => pipeline
            .build_spec()?
            .patches
            .iter()
            .map(|p| p.name.clone())
            .collect(),
    };
    let manifest = tree.manifest_path(&config.offline.manifest);
    let policy = config.runtime.policy()?;

    let summary = PlanSummary {
        output_dir: config.output_dir.clone(),
        build_path: path.label().to_string(),
        cache_key: path.key().map(|key| key.to_string()),
        recorded_key: tree.read_cache_key()?.map(|key| key.to_string()),
        override_path: match &path {
            BuildPath::Override(source) => Some(source.clone()),
            _ => None,
        },
        reverts: config.source.reverts.clone(),
        patches,
        manifest_present: manifest.exists(),
        manifest_stale: is_stale(&manifest, &config.offline.lock_file),
        host_provided_patterns: policy
            .rules()
            .filter(|(_, policy)| *policy == LibraryPolicy::HostProvided)
            .map(|(pattern, _)| pattern.to_string())
            .collect(),
    };

    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    Output::header("bstage plan");
    Output::kv("Output", summary.output_dir.display().to_string());
    Output::kv("Primary", describe(&path));
    if let Some(key) = &summary.cache_key {
        Output::kv("Cache key", key);
    }
    Output::kv(
        "Recorded key",
        summary.recorded_key.as_deref().unwrap_or("(none)"),
    );
    Output::kv("Reverts", summary.reverts.len().to_string());
    for revert in &summary.reverts {
        Output::list_item(format!("  {revert}"));
    }
    Output::kv("Patches", summary.patches.len().to_string());
    for patch in &summary.patches {
        Output::list_item(format!("  {patch}"));
    }
    let manifest_state = match (summary.manifest_present, summary.manifest_stale) {
        (false, _) => "will be generated",
        (true, false) => "present, will be kept",
        (true, true) => "present but older than the lock file, will be kept",
    };
    Output::kv("Manifest", manifest_state);
    Output::kv("Host-provided", summary.host_provided_patterns.join(" "));
    Ok(())
}

fn describe(path: &BuildPath) -> String {
    match path {
        BuildPath::Override(source) => format!("install prebuilt {}", source.display()),
        BuildPath::Skip(_) => "up to date, no build".to_string(),
        BuildPath::Build { .. } => "build from source".to_string(),
    }
}
