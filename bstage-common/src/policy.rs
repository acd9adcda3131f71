//! Host-assumption policy for shared libraries.
//!
//! Libraries matching a denylist pattern are assumed to be present on every
//! target host and are never staged. Everything else is copied next to the
//! binaries. Matching is done on the basename only.

use crate::error::CommonError;
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Libraries every target host already provides.
pub const DEFAULT_HOST_LIBRARIES: &[&str] = &[
    "libc.so.*",
    "libm.so.*",
    "ld-linux*.so.*",
    "libdl.so.*",
    "librt.so.*",
    "libpthread.so.*",
    "libgcc_s.so.*",
    "libstdc++.so.*",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LibraryPolicy {
    /// Present on the host; never copied.
    HostProvided,
    /// Copied into the library output directory.
    Stage,
}

#[derive(Debug, Clone)]
struct PolicyRule {
    pattern: Pattern,
    policy: LibraryPolicy,
}

/// Ordered pattern → policy table. The first matching rule wins; unmatched
/// names are staged.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    rules: Vec<PolicyRule>,
}

impl PolicyTable {
    /// Build a table where every pattern is host-provided.
    pub fn host_denylist<S: AsRef<str>>(patterns: &[S]) -> Result<Self, CommonError> {
        let rules = patterns
            .iter()
            .map(|raw| {
                let raw = raw.as_ref();
                Pattern::new(raw)
                    .map(|pattern| PolicyRule {
                        pattern,
                        policy: LibraryPolicy::HostProvided,
                    })
                    .map_err(|err| CommonError::Pattern {
                        pattern: raw.to_string(),
                        message: err.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Classify a library by its basename.
    pub fn classify(&self, library: &Path) -> LibraryPolicy {
        let Some(name) = basename(library) else {
            return LibraryPolicy::Stage;
        };
        self.rules
            .iter()
            .find(|rule| rule.pattern.matches(name))
            .map(|rule| rule.policy)
            .unwrap_or(LibraryPolicy::Stage)
    }

    /// The table as `(pattern, policy)` pairs, in match order.
    pub fn rules(&self) -> impl Iterator<Item = (&str, LibraryPolicy)> {
        self.rules
            .iter()
            .map(|rule| (rule.pattern.as_str(), rule.policy))
    }

    /// Classify every resolved path and deduplicate the staged set by basename.
    pub fn plan<'a, I>(&self, libraries: I) -> StagingPlan
    where
        I: IntoIterator<Item = &'a Path>,
    {
        let mut staged: BTreeMap<String, PathBuf> = BTreeMap::new();
        let mut host_provided = BTreeSet::new();

        for library in libraries {
            let Some(name) = basename(library) else {
                continue;
            };
            match self.classify(library) {
                LibraryPolicy::HostProvided => {
                    host_provided.insert(name.to_string());
                }
                LibraryPolicy::Stage => {
                    staged
                        .entry(name.to_string())
                        .and_modify(|existing| {
                            if library < existing.as_path() {
                                *existing = library.to_path_buf();
                            }
                        })
                        .or_insert_with(|| library.to_path_buf());
                }
            }
        }

        StagingPlan {
            staged: staged.into_values().collect(),
            host_provided,
        }
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        let rules = DEFAULT_HOST_LIBRARIES
            .iter()
            .filter_map(|raw| Pattern::new(raw).ok())
            .map(|pattern| PolicyRule {
                pattern,
                policy: LibraryPolicy::HostProvided,
            })
            .collect();
        Self { rules }
    }
}

/// Result of classifying all libraries seen in one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagingPlan {
    /// One path per basename, sorted by basename.
    pub staged: Vec<PathBuf>,
    /// Basenames skipped because the host provides them.
    pub host_provided: BTreeSet<String>,
}

pub fn basename(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}
