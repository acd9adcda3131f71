//! `bstage key`: print the cache key of the configured source.

use crate::pipeline::build_spec;
use anyhow::Result;
use std::path::Path;

pub fn run(config_path: &Path) -> Result<()> {
    let config = super::load_config(config_path)?;
    let spec = build_spec(&config)?;
    println!("{}", spec.cache_key());
    Ok(())
}
