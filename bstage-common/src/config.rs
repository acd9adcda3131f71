//! Pipeline configuration (`bstage.json`).
//!
//! Only `source.commit` and `offline.generator_url` are required; everything
//! else falls back to the defaults used for the Bubbles Flatpak build.

use crate::error::CommonError;
use crate::policy::{PolicyTable, DEFAULT_HOST_LIBRARIES};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct StageConfig {
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Directory the staged artifacts are written to.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Container runtime CLI used for disposable environments.
    #[serde(default = "default_container_runtime")]
    pub container_runtime: String,

    pub source: SourceConfig,

    #[serde(default)]
    pub build: BuildConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    pub offline: OfflineConfig,
}

/// Where the primary binary's source comes from and how it is modified.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct SourceConfig {
    /// Upstream git URL
    #[serde(default = "default_source_url")]
    pub url: String,

    /// Pinned commit to check out
    pub commit: String,

    /// Commits to revert, applied in this order
    #[serde(default)]
    pub reverts: Vec<String>,

    /// Directory holding `*.patch` files, applied in lexical order
    #[serde(default = "default_patches_dir")]
    pub patches_dir: PathBuf,

    /// Initialize submodules after patching
    #[serde(default = "default_true")]
    pub submodules: bool,
}

/// Package manager inside a disposable environment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    #[default]
    Apt,
    Dnf,
}

impl PackageManager {
    /// Commands that install `packages`, run in order.
    pub fn install_commands(&self, packages: &[String]) -> Vec<Vec<String>> {
        if packages.is_empty() {
            return Vec::new();
        }
        match self {
            PackageManager::Apt => {
                let mut install = vec![
                    "apt-get".to_string(),
                    "install".to_string(),
                    "-y".to_string(),
                    "--no-install-recommends".to_string(),
                ];
                install.extend(packages.iter().cloned());
                vec![vec!["apt-get".to_string(), "update".to_string()], install]
            }
            PackageManager::Dnf => {
                let mut install = vec!["dnf".to_string(), "install".to_string(), "-y".to_string()];
                install.extend(packages.iter().cloned());
                vec![install]
            }
        }
    }

    /// Environment the install commands need.
    pub fn env(&self) -> Vec<(String, String)> {
        match self {
            PackageManager::Apt => vec![(
                "DEBIAN_FRONTEND".to_string(),
                "noninteractive".to_string(),
            )],
            PackageManager::Dnf => Vec::new(),
        }
    }
}

/// The containerized source build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct BuildConfig {
    /// Pinned base image for the build environment
    #[serde(default = "default_build_image")]
    pub image: String,

    #[serde(default)]
    pub package_manager: PackageManager,

    /// Build-time packages
    #[serde(default = "default_build_packages")]
    pub packages: Vec<String>,

    /// Cargo features passed to the release build
    #[serde(default)]
    pub features: Vec<String>,

    /// Name of the primary binary
    #[serde(default = "default_primary")]
    pub primary: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            image: default_build_image(),
            package_manager: PackageManager::default(),
            packages: default_build_packages(),
            features: Vec::new(),
            primary: default_primary(),
        }
    }
}

/// An auxiliary binary taken from the runtime environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct AuxBinary {
    /// Name under the output `bin/` directory
    pub name: String,
    /// Absolute path inside the runtime environment
    pub path: String,
}

/// The runtime environment used for auxiliary binaries and library resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct RuntimeConfig {
    /// Pinned, signature-verified distribution image
    #[serde(default = "default_runtime_image")]
    pub image: String,

    #[serde(default)]
    pub package_manager: PackageManager,

    /// Runtime packages installed before resolution
    #[serde(default = "default_runtime_packages")]
    pub packages: Vec<String>,

    #[serde(default = "default_aux_binaries")]
    pub binaries: Vec<AuxBinary>,

    /// Library basename patterns assumed present on every host
    #[serde(default = "default_denylist")]
    pub denylist: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            image: default_runtime_image(),
            package_manager: PackageManager::default(),
            packages: default_runtime_packages(),
            binaries: default_aux_binaries(),
            denylist: default_denylist(),
        }
    }
}

impl RuntimeConfig {
    pub fn policy(&self) -> Result<PolicyTable, CommonError> {
        PolicyTable::host_denylist(&self.denylist)
    }
}

/// Offline dependency manifest generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct OfflineConfig {
    /// Versioned URL of the generator script
    pub generator_url: String,

    /// Expected SHA256 of the generator script
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator_sha256: Option<String>,

    #[serde(default = "default_runtime_image")]
    pub image: String,

    #[serde(default)]
    pub package_manager: PackageManager,

    /// Interpreter and libraries the generator needs
    #[serde(default = "default_generator_packages")]
    pub packages: Vec<String>,

    /// Dependency lock file the manifest is generated from
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    /// Manifest file name inside the output directory
    #[serde(default = "default_manifest")]
    pub manifest: String,
}

impl StageConfig {
    pub const DEFAULT_PATH: &'static str = "bstage.json";

    /// Load and validate a configuration file.
    pub fn load_from(path: &Path) -> Result<Self, CommonError> {
        if !path.exists() {
            return Err(CommonError::Config(format!(
                "configuration file {} not found",
                path.display()
            )));
        }
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self, CommonError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve relative paths against `base`, normally the directory holding
    /// the configuration file.
    pub fn rebase(&mut self, base: &Path) {
        for path in [
            &mut self.output_dir,
            &mut self.source.patches_dir,
            &mut self.offline.lock_file,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    pub fn validate(&self) -> Result<(), CommonError> {
        validate_revision("source.commit", &self.source.commit)?;
        for revert in &self.source.reverts {
            validate_revision("source.reverts", revert)?;
        }
        validate_binary_name(&self.build.primary)?;
        for binary in &self.runtime.binaries {
            validate_binary_name(&binary.name)?;
            if !binary.path.starts_with('/') {
                return Err(CommonError::Config(format!(
                    "runtime binary '{}' must use an absolute path, got '{}'",
                    binary.name, binary.path
                )));
            }
            if binary.name == self.build.primary {
                return Err(CommonError::Config(format!(
                    "runtime binary '{}' collides with the primary binary",
                    binary.name
                )));
            }
        }
        validate_binary_name(&self.offline.manifest)?;
        self.runtime.policy()?;
        Ok(())
    }
}

/// Revisions are hashed joined by whitespace, so they must not contain any.
fn validate_revision(field: &str, revision: &str) -> Result<(), CommonError> {
    if revision.is_empty() {
        return Err(CommonError::Config(format!("{field} must not be empty")));
    }
    if revision
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(CommonError::Config(format!(
            "{field} entry {revision:?} must not contain whitespace or control characters"
        )));
    }
    Ok(())
}

fn validate_binary_name(name: &str) -> Result<(), CommonError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+'));
    if valid {
        Ok(())
    } else {
        Err(CommonError::Config(format!(
            "invalid file name '{name}': only [A-Za-z0-9._+-] are allowed"
        )))
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("build-deps")
}

fn default_container_runtime() -> String {
    "podman".to_string()
}

fn default_source_url() -> String {
    "https://chromium.googlesource.com/crosvm/crosvm".to_string()
}

fn default_patches_dir() -> PathBuf {
    PathBuf::from("patches")
}

fn default_true() -> bool {
    true
}

fn default_build_image() -> String {
    "docker.io/library/rust:1-bookworm".to_string()
}

fn default_build_packages() -> Vec<String> {
    [
        "clang",
        "libcap-dev",
        "libclang-dev",
        "libdrm-dev",
        "libepoxy-dev",
        "libwayland-dev",
        "pkg-config",
        "protobuf-compiler",
        "wayland-protocols",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_primary() -> String {
    "crosvm".to_string()
}

fn default_runtime_image() -> String {
    "docker.io/library/debian:trixie".to_string()
}

fn default_runtime_packages() -> Vec<String> {
    [
        "libcap2",
        "libdrm2",
        "libepoxy0",
        "libwayland-client0",
        "passt",
        "socat",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_aux_binaries() -> Vec<AuxBinary> {
    vec![
        AuxBinary {
            name: "passt".to_string(),
            path: "/usr/bin/passt".to_string(),
        },
        AuxBinary {
            name: "socat".to_string(),
            path: "/usr/bin/socat".to_string(),
        },
    ]
}

fn default_denylist() -> Vec<String> {
    DEFAULT_HOST_LIBRARIES.iter().map(|s| s.to_string()).collect()
}

fn default_generator_packages() -> Vec<String> {
    ["python3", "python3-aiohttp", "python3-tomlkit"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("Cargo.lock")
}

fn default_manifest() -> String {
    "cargo-sources.json".to_string()
}
