//! Cache key for the source build.
//!
//! The key covers everything that defines the prepared source tree: the pinned
//! commit, the ordered revert list, and the bytes of every patch. A staged
//! primary binary is reused only while its recorded key matches.

use crate::error::CommonError;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// A single patch file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    /// File name, used for ordering.
    pub name: String,
    /// Location on the host.
    pub path: PathBuf,
    pub contents: Vec<u8>,
}

impl Patch {
    pub fn new(name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        let name = name.into();
        Self {
            path: PathBuf::from(&name),
            name,
            contents: contents.into(),
        }
    }
}

/// Patches in application order (lexical by file name).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSet {
    patches: Vec<Patch>,
}

impl PatchSet {
    /// Load every `*.patch` file in `dir`. A missing directory is an empty set.
    pub fn load(dir: &Path) -> Result<Self, CommonError> {
        if !dir.exists() {
            return Ok(Self::default());
        }

        let mut patches = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some("patch") {
                continue;
            }
            let contents = fs::read(&path)?;
            patches.push(Patch {
                name: entry.file_name().to_string_lossy().into_owned(),
                path,
                contents,
            });
        }

        Ok(Self::from_patches(patches))
    }

    pub fn from_patches(mut patches: Vec<Patch>) -> Self {
        patches.sort_by(|a, b| a.name.cmp(&b.name));
        Self { patches }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Patch> {
        self.patches.iter()
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// SHA-256 over all patch contents concatenated in application order.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for patch in &self.patches {
            hasher.update(&patch.contents);
        }
        hex::encode(hasher.finalize())
    }
}

/// Everything that defines the source tree for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub commit: String,
    pub reverts: Vec<String>,
    pub patches: PatchSet,
}

impl BuildSpec {
    pub fn cache_key(&self) -> CacheKey {
        compute_key(&self.commit, &self.reverts, &self.patches)
    }
}

/// A 64 character lowercase hex SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Parse the contents of a key record file, ignoring surrounding whitespace.
    pub fn parse(record: &str) -> Option<Self> {
        let value = record.trim();
        let valid = value.len() == 64
            && value
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        valid.then(|| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the cache key for a commit, its ordered reverts and a patch set.
pub fn compute_key(commit: &str, reverts: &[String], patches: &PatchSet) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(commit.as_bytes());
    hasher.update(b"\n");
    hasher.update(reverts.join(" ").as_bytes());
    hasher.update(b"\n");
    hasher.update(patches.digest().as_bytes());
    hasher.update(b"\n");
    CacheKey(hex::encode(hasher.finalize()))
}
