//! CLI argument definitions for bstage.
//!
//! Separated from `main.rs` so that shell completion generation can reference
//! these types.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::commands;

#[derive(Debug, Parser)]
#[command(name = "bstage")]
#[command(about = "Stage crosvm, its helper binaries and their libraries for Flatpak packaging")]
#[command(version)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file
    #[arg(long, short, global = true, env = "BSTAGE_CONFIG", default_value = "bstage.json")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the full staging pipeline
    ///
    /// Builds the primary binary (unless the staged one is up to date or an
    /// override is given), stages helper binaries and shared libraries, and
    /// generates the offline dependency manifest if it is missing.
    Run(commands::run::RunArgs),

    /// Show what `run` would do, without side effects
    Plan(commands::plan::PlanArgs),

    /// Print the cache key of the configured source
    Key,

    /// Check that the tools the pipeline needs are available
    Doctor(commands::doctor::DoctorArgs),

    /// List (or remove) environments left behind by earlier runs
    Envs(commands::envs::EnvsArgs),

    /// Print the JSON schema of the configuration file
    Schema(commands::schema::SchemaArgs),

    /// Generate shell completions
    Completions(commands::completions::CompletionsArgs),
}
