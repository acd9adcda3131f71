//! Placing binaries into the output tree.

use crate::staging::OutputTree;
use crate::tools::ContainerRuntime;
use anyhow::{bail, Context, Result};
use bstage_common::fsutil::{install_executable, set_executable};
use std::path::{Path, PathBuf};

/// Environment variable naming a prebuilt primary binary.
pub const OVERRIDE_ENV: &str = "BSTAGE_PRIMARY_OVERRIDE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    /// A path inside a running environment.
    Environment { container: String, path: String },
    /// A file on the host.
    Host(PathBuf),
}

/// A named binary and where to take it from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub source: ArtifactSource,
}

impl Artifact {
    pub fn from_environment(
        name: impl Into<String>,
        container: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source: ArtifactSource::Environment {
                container: container.into(),
                path: path.into(),
            },
        }
    }

    /// The primary binary taken from a host override path, which must exist.
    pub fn from_override(name: impl Into<String>, path: &Path) -> Result<Self> {
        if !path.is_file() {
            bail!("Override binary {} does not exist", path.display());
        }
        Ok(Self {
            name: name.into(),
            source: ArtifactSource::Host(path.to_path_buf()),
        })
    }
}

/// Pick the override path: the command-line flag first, then the environment.
/// Empty values count as unset.
pub fn primary_override(flag: Option<&Path>, env: Option<&str>) -> Option<PathBuf> {
    flag.filter(|path| !path.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .or_else(|| {
            env.map(str::trim)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        })
}

/// [`primary_override`] with the value of [`OVERRIDE_ENV`].
pub fn primary_override_from_env(flag: Option<&Path>) -> Option<PathBuf> {
    let env = std::env::var(OVERRIDE_ENV).ok();
    primary_override(flag, env.as_deref())
}

pub struct BinaryExtractor<'a> {
    runtime: &'a ContainerRuntime,
    tree: &'a OutputTree,
}

impl<'a> BinaryExtractor<'a> {
    pub fn new(runtime: &'a ContainerRuntime, tree: &'a OutputTree) -> Self {
        Self { runtime, tree }
    }

    /// Copy every artifact to `bin/<name>` and mark it executable, overwriting
    /// whatever was there.
    pub fn install(&self, artifacts: &[Artifact]) -> Result<Vec<PathBuf>> {
        let mut installed = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let dest = self.tree.binary_path(&artifact.name);
            match &artifact.source {
                ArtifactSource::Environment { container, path } => {
                    self.runtime
                        .copy_out(container, path, &dest)
                        .with_context(|| format!("Failed to extract {}", artifact.name))?;
                    set_executable(&dest)
                        .with_context(|| format!("Failed to mark {} executable", dest.display()))?;
                }
                ArtifactSource::Host(path) => {
                    install_executable(path, &dest).with_context(|| {
                        format!("Failed to install {} from {}", artifact.name, path.display())
                    })?;
                }
            }
            tracing::info!(binary = %artifact.name, dest = %dest.display(), "Installed binary");
            installed.push(dest);
        }
        Ok(installed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_runner::{MockCommandRunner, MockResponse};
    use bstage_common::fsutil::is_executable;
    use serial_test::serial;
    use std::sync::Arc;

    /// Helper to set the override env var (requires unsafe in Rust 2024)
    fn set_override_env(value: Option<&str>) {
        unsafe {
            match value {
                Some(value) => std::env::set_var(OVERRIDE_ENV, value),
                None => std::env::remove_var(OVERRIDE_ENV),
            }
        }
    }

    fn copying_runtime() -> (Arc<MockCommandRunner>, ContainerRuntime) {
        let mock = Arc::new(MockCommandRunner::new());
        mock.on(
            "podman cp",
            MockResponse::handler(|call| {
                std::fs::write(&call.args[2], "elf").unwrap();
                MockResponse::Success(String::new())
            }),
        );
        let runtime = ContainerRuntime::new(mock.clone(), "podman");
        (mock, runtime)
    }

    #[test]
    fn override_wins_over_env_and_empty_is_unset() {
        assert_eq!(
            primary_override(Some(Path::new("/a")), Some("/b")),
            Some(PathBuf::from("/a"))
        );
        assert_eq!(
            primary_override(Some(Path::new("")), Some("/b")),
            Some(PathBuf::from("/b"))
        );
        assert_eq!(primary_override(None, Some("  ")), None);
        assert_eq!(primary_override(None, None), None);
    }

    #[test]
    #[serial]
    fn override_is_read_from_environment() {
        set_override_env(Some("/opt/crosvm"));
        assert_eq!(primary_override_from_env(None), Some(PathBuf::from("/opt/crosvm")));
        assert_eq!(
            primary_override_from_env(Some(Path::new("/flag"))),
            Some(PathBuf::from("/flag"))
        );

        set_override_env(Some(""));
        assert_eq!(primary_override_from_env(None), None);
        set_override_env(None);
    }

    #[test]
    fn missing_override_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        assert!(Artifact::from_override("crosvm", &temp.path().join("nope")).is_err());
    }

    #[test]
    fn host_artifact_is_installed_executable() {
        let temp = tempfile::tempdir().unwrap();
        let tree = OutputTree::new(temp.path().join("out"));
        tree.ensure().unwrap();
        let prebuilt = temp.path().join("crosvm-prebuilt");
        std::fs::write(&prebuilt, "elf").unwrap();
        let (mock, runtime) = copying_runtime();

        let artifact = Artifact::from_override("crosvm", &prebuilt).unwrap();
        BinaryExtractor::new(&runtime, &tree)
            .install(&[artifact])
            .unwrap();

        assert!(is_executable(&tree.binary_path("crosvm")));
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn environment_artifacts_are_copied_out_and_overwrite() {
        let temp = tempfile::tempdir().unwrap();
        let tree = OutputTree::new(temp.path());
        tree.ensure().unwrap();
        std::fs::write(tree.binary_path("socat"), "old").unwrap();
        let (mock, runtime) = copying_runtime();

        let installed = BinaryExtractor::new(&runtime, &tree)
            .install(&[
                Artifact::from_environment("passt", "env-1", "/usr/bin/passt"),
                Artifact::from_environment("socat", "env-1", "/usr/bin/socat"),
            ])
            .unwrap();

        assert_eq!(installed.len(), 2);
        assert!(mock.was_called("podman cp env-1:/usr/bin/passt"));
        assert_eq!(std::fs::read_to_string(tree.binary_path("socat")).unwrap(), "elf");
        assert!(is_executable(&tree.binary_path("socat")));
    }
}
