use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use bstage::commands;
use bstage::{Cli, Commands};

fn main() -> Result<()> {
    // Initialize tracing with RUST_LOG env filter
    // e.g., RUST_LOG=bstage=debug
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    tracing::debug!(config = %cli.config.display(), "Starting");

    match cli.command {
        Commands::Run(args) => commands::run::run(args, &cli.config),
        Commands::Plan(args) => commands::plan::run(args, &cli.config),
        Commands::Key => commands::key::run(&cli.config),
        Commands::Doctor(args) => commands::doctor::run(args, &cli.config),
        Commands::Envs(args) => commands::envs::run(args, &cli.config),
        Commands::Schema(args) => commands::schema::run(args),
        Commands::Completions(args) => commands::completions::run(args),
    }
}
