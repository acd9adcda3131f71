//! The shared output tree.
//!
//! Layout:
//!
//! ```text
//! <output>/
//!   bin/                 primary and auxiliary binaries (0755)
//!   lib/                 staged shared libraries
//!   .build-key           cache key of the staged primary binary
//!   cargo-sources.json   offline dependency manifest
//! ```
//!
//! Writes are additive: nothing here deletes entries it did not write in the
//! current run.

use anyhow::{Context, Result};
use bstage_common::cache_key::CacheKey;
use bstage_common::fsutil::is_executable;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct OutputTree {
    root: PathBuf,
}

impl OutputTree {
    pub const BIN_DIR: &'static str = "bin";
    pub const LIB_DIR: &'static str = "lib";
    pub const CACHE_RECORD: &'static str = ".build-key";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the root, `bin/` and `lib/` if they do not exist yet.
    pub fn ensure(&self) -> Result<()> {
        for dir in [self.root.clone(), self.bin_dir(), self.lib_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join(Self::BIN_DIR)
    }

    pub fn lib_dir(&self) -> PathBuf {
        self.root.join(Self::LIB_DIR)
    }

    pub fn binary_path(&self, name: &str) -> PathBuf {
        self.bin_dir().join(name)
    }

    pub fn library_path(&self, name: &str) -> PathBuf {
        self.lib_dir().join(name)
    }

    pub fn manifest_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn cache_record_path(&self) -> PathBuf {
        self.root.join(Self::CACHE_RECORD)
    }

    pub fn has_binary(&self, name: &str) -> bool {
        is_executable(&self.binary_path(name))
    }

    /// The recorded key, if the record exists and is well formed.
    pub fn read_cache_key(&self) -> Result<Option<CacheKey>> {
        let path = self.cache_record_path();
        match fs::read_to_string(&path) {
            Ok(content) => {
                let key = CacheKey::parse(&content);
                if key.is_none() {
                    tracing::warn!(path = %path.display(), "Ignoring malformed cache key record");
                }
                Ok(key)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to read {}", path.display()))
            }
        }
    }

    /// Record `key` via write-to-temp + rename.
    pub fn write_cache_key(&self, key: &CacheKey) -> Result<()> {
        let path = self.cache_record_path();
        let tmp = self.root.join(".build-key.tmp");
        fs::write(&tmp, format!("{key}\n"))
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Drop the record after the primary binary was replaced by something
    /// the key does not describe.
    pub fn invalidate_cache_key(&self) -> Result<()> {
        let path = self.cache_record_path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to remove {}", path.display()))
            }
        }
    }

    /// Basenames currently present in `lib/`.
    pub fn staged_libraries(&self) -> Result<Vec<String>> {
        let dir = self.lib_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in
            fs::read_dir(&dir).with_context(|| format!("Failed to read {}", dir.display()))?
        {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}
