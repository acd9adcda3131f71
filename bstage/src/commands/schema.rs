//! Schema generation command implementation.

use anyhow::{Context, Result};
use bstage_common::config::StageConfig;
use clap::Args;
use schemars::schema_for;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Args)]
pub struct SchemaArgs {
    /// Write the schema to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// The configuration file schema as pretty-printed JSON.
pub fn config_schema() -> Result<String> {
    serde_json::to_string_pretty(&schema_for!(StageConfig))
        .context("Failed to serialize configuration schema")
}

pub fn run(args: SchemaArgs) -> Result<()> {
    let json = config_schema()?;
    match args.output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {}", parent.display()))?;
            }
            fs::write(&path, &json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}
