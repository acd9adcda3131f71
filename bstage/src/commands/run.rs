//! `bstage run`: the full staging pipeline.

use crate::command_runner::RealCommandRunner;
use crate::environment::CleanupRegistry;
use crate::extract::primary_override_from_env;
use crate::offline::ManifestOutcome;
use crate::output::Output;
use crate::pipeline::{Pipeline, PipelineReport};
use crate::tools::ContainerRuntime;
use anyhow::Result;
use clap::{Args, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Install this prebuilt primary binary instead of building it
    ///
    /// Also read from BSTAGE_PRIMARY_OVERRIDE; an empty value means unset.
    #[arg(long = "override", value_name = "PATH")]
    pub primary_override: Option<PathBuf>,

    /// Output directory (overrides `output_dir` from the config file)
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Summary format
    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    pub format: ReportFormat,
}

pub fn run(args: RunArgs, config_path: &Path) -> Result<()> {
    let mut config = super::load_config(config_path)?;
    if let Some(output) = args.output {
        config.output_dir = output;
    }

    let primary = primary_override_from_env(args.primary_override.as_deref());

    let runtime = ContainerRuntime::new(
        Arc::new(RealCommandRunner),
        config.container_runtime.clone(),
    );
    let registry = CleanupRegistry::new();
    registry.install_interrupt_handler(runtime.clone())?;
    tracing::debug!(invocation = registry.invocation(), "Cleanup registry ready");

    let output_dir = config.output_dir.clone();
    let report = Pipeline::new(config, runtime, registry)
        .with_override(primary)
        .run()?;

    match args.format {
        ReportFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        ReportFormat::Text => print_summary(&report, &output_dir),
    }
    Ok(())
}

fn print_summary(report: &PipelineReport, output_dir: &Path) {
    Output::header(format!("Staged into {}", output_dir.display()));
    Output::kv("Primary", &report.build_path);
    if let Some(key) = &report.cache_key {
        Output::kv("Cache key", key);
    }
    Output::kv("Binaries", report.dependencies.binaries.join(", "));
    Output::kv("Libraries", report.dependencies.staged.len().to_string());
    Output::kv("Host-provided", report.dependencies.host_provided.join(", "));
    let manifest = match report.manifest {
        ManifestOutcome::Generated => "generated",
        ManifestOutcome::AlreadyPresent { stale: false } => "present",
        ManifestOutcome::AlreadyPresent { stale: true } => "present (older than lock file)",
    };
    Output::kv("Manifest", manifest);
}
