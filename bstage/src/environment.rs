//! Disposable environments and guaranteed cleanup.
//!
//! Each container is owned by an [`EnvironmentGuard`] for exactly as long as
//! the stage that created it runs; dropping the guard removes the container on
//! every exit path, including `?` propagation. Temporary host directories get
//! the same treatment through [`ScopedTempDir`].
//!
//! Both kinds of resource are also recorded in a [`CleanupRegistry`] so the
//! interrupt handler installed at startup can reclaim whatever is live when
//! the process is told to stop, since destructors do not run on signal exit.

use crate::tools::{ContainerRuntime, Mount, ToolError};
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::TempDir;

/// Exit status used after an interrupt, matching a shell's 128 + SIGINT.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Debug, Default)]
struct RegistryState {
    environments: BTreeSet<String>,
    directories: BTreeSet<PathBuf>,
}

/// Process-wide record of live disposable resources.
#[derive(Debug, Clone)]
pub struct CleanupRegistry {
    invocation: String,
    counter: Arc<AtomicUsize>,
    state: Arc<Mutex<RegistryState>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        let invocation = format!(
            "{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_millis()
        );
        Self::with_invocation(invocation)
    }

    pub fn with_invocation(invocation: impl Into<String>) -> Self {
        Self {
            invocation: invocation.into(),
            counter: Arc::new(AtomicUsize::new(0)),
            state: Arc::new(Mutex::new(RegistryState::default())),
        }
    }

    /// Identifier shared by every environment of this process.
    pub fn invocation(&self) -> &str {
        &self.invocation
    }

    /// A fresh, never reused environment name for `purpose`.
    pub fn environment_name(&self, purpose: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("bstage-{purpose}-{}-{n}", self.invocation)
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register_environment(&self, name: &str) {
        self.state().environments.insert(name.to_string());
    }

    fn release_environment(&self, name: &str) {
        self.state().environments.remove(name);
    }

    fn register_dir(&self, path: &Path) {
        self.state().directories.insert(path.to_path_buf());
    }

    fn release_dir(&self, path: &Path) {
        self.state().directories.remove(path);
    }

    pub fn live_environments(&self) -> Vec<String> {
        self.state().environments.iter().cloned().collect()
    }

    pub fn live_directories(&self) -> Vec<PathBuf> {
        self.state().directories.iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state();
        state.environments.is_empty() && state.directories.is_empty()
    }

    /// Remove every live environment and directory. Failures are logged, not
    /// returned, so one stuck container cannot keep the rest alive.
    pub fn drain(&self, runtime: &ContainerRuntime) {
        let (environments, directories) = {
            let mut state = self.state();
            (
                std::mem::take(&mut state.environments),
                std::mem::take(&mut state.directories),
            )
        };

        for name in environments {
            tracing::info!(environment = %name, "Removing environment");
            if let Err(err) = runtime.remove(&name) {
                tracing::warn!(environment = %name, "Failed to remove environment: {err}");
            }
        }
        for dir in directories {
            tracing::info!(path = %dir.display(), "Removing temporary directory");
            if let Err(err) = std::fs::remove_dir_all(&dir) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %dir.display(), "Failed to remove directory: {err}");
                }
            }
        }
    }

    /// Install the Ctrl-C/SIGTERM handler that drains this registry and exits.
    ///
    /// Must be called once per process, before any resource is acquired.
    pub fn install_interrupt_handler(&self, runtime: ContainerRuntime) -> Result<()> {
        let registry = self.clone();
        ctrlc::set_handler(move || {
            eprintln!("Interrupted, cleaning up...");
            registry.drain(&runtime);
            std::process::exit(INTERRUPTED_EXIT_CODE);
        })
        .context("Failed to install interrupt handler")
    }
}

impl Default for CleanupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive ownership of one running disposable environment.
pub struct EnvironmentGuard {
    name: String,
    runtime: ContainerRuntime,
    registry: CleanupRegistry,
    released: bool,
}

impl EnvironmentGuard {
    /// Start a new environment from `image`.
    ///
    /// The name is registered before the container is started so an interrupt
    /// during startup still removes it.
    pub fn acquire(
        runtime: &ContainerRuntime,
        registry: &CleanupRegistry,
        purpose: &str,
        image: &str,
        mounts: &[Mount],
    ) -> Result<Self, ToolError> {
        let name = registry.environment_name(purpose);
        registry.register_environment(&name);
        let guard = Self {
            name,
            runtime: runtime.clone(),
            registry: registry.clone(),
            released: false,
        };

        tracing::info!(environment = %guard.name, image, "Starting environment");
        runtime.start(&guard.name, image, registry.invocation(), mounts)?;
        Ok(guard)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn runtime(&self) -> &ContainerRuntime {
        &self.runtime
    }

    /// Tear the environment down now, reporting failure.
    pub fn release(mut self) -> Result<(), ToolError> {
        self.released = true;
        let result = self.runtime.remove(&self.name);
        self.registry.release_environment(&self.name);
        tracing::debug!(environment = %self.name, "Environment released");
        result
    }
}

impl Drop for EnvironmentGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.runtime.remove(&self.name) {
            tracing::warn!(environment = %self.name, "Failed to remove environment: {err}");
        }
        self.registry.release_environment(&self.name);
        tracing::debug!(environment = %self.name, "Environment dropped");
    }
}

/// A temporary host directory tracked by the cleanup registry.
pub struct ScopedTempDir {
    dir: TempDir,
    registry: CleanupRegistry,
}

impl ScopedTempDir {
    pub fn new(registry: &CleanupRegistry, prefix: &str) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir()
            .context("Failed to create temporary directory")?;
        registry.register_dir(dir.path());
        Ok(Self {
            dir,
            registry: registry.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Drop for ScopedTempDir {
    fn drop(&mut self) {
        self.registry.release_dir(self.dir.path());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_runner::{MockCommandRunner, MockResponse};

    fn setup() -> (Arc<MockCommandRunner>, ContainerRuntime, CleanupRegistry) {
        let mock = Arc::new(MockCommandRunner::new());
        let runtime = ContainerRuntime::new(mock.clone(), "podman");
        (mock, runtime, CleanupRegistry::with_invocation("test"))
    }

    #[test]
    fn names_are_unique_per_invocation() {
        let registry = CleanupRegistry::with_invocation("42-1000");
        let a = registry.environment_name("build");
        let b = registry.environment_name("build");
        assert_ne!(a, b);
        assert!(a.starts_with("bstage-build-42-1000-"));
    }

    #[test]
    fn drop_removes_environment() {
        let (mock, runtime, registry) = setup();
        {
            let guard =
                EnvironmentGuard::acquire(&runtime, &registry, "build", "debian:trixie", &[])
                    .unwrap();
            assert_eq!(registry.live_environments(), vec![guard.name().to_string()]);
        }
        assert!(registry.is_empty());
        assert!(mock.was_called("podman rm --force --ignore bstage-build-test-0"));
    }

    #[test]
    fn failed_start_still_removes() {
        let (mock, runtime, registry) = setup();
        mock.on("podman run", MockResponse::Failure {
            code: 125,
            stderr: "image not known".into(),
        });
        let result = EnvironmentGuard::acquire(&runtime, &registry, "deps", "nope", &[]);
        assert!(result.is_err());
        assert!(registry.is_empty());
        assert!(mock.was_called("podman rm --force --ignore bstage-deps-test-0"));
    }

    #[test]
    fn release_removes_once() {
        let (mock, runtime, registry) = setup();
        let guard =
            EnvironmentGuard::acquire(&runtime, &registry, "build", "img", &[]).unwrap();
        guard.release().unwrap();
        let removals = mock
            .command_lines()
            .iter()
            .filter(|line| line.starts_with("podman rm"))
            .count();
        assert_eq!(removals, 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn drain_removes_everything_live() {
        let (mock, runtime, registry) = setup();
        let first = EnvironmentGuard::acquire(&runtime, &registry, "build", "img", &[]).unwrap();
        let second = EnvironmentGuard::acquire(&runtime, &registry, "deps", "img", &[]).unwrap();
        let scratch = ScopedTempDir::new(&registry, "bstage-test-").unwrap();
        let scratch_path = scratch.path().to_path_buf();

        registry.drain(&runtime);

        assert!(registry.is_empty());
        assert!(!scratch_path.exists());
        assert!(mock.was_called(&format!("podman rm --force --ignore {}", first.name())));
        assert!(mock.was_called(&format!("podman rm --force --ignore {}", second.name())));

        // Guards dropping afterwards must not fail on already-removed state.
        drop(first);
        drop(second);
        drop(scratch);
        assert!(registry.is_empty());
    }

    #[test]
    fn scoped_dir_is_removed_on_drop() {
        let registry = CleanupRegistry::with_invocation("test");
        let path = {
            let dir = ScopedTempDir::new(&registry, "bstage-test-").unwrap();
            assert_eq!(registry.live_directories(), vec![dir.path().to_path_buf()]);
            dir.path().to_path_buf()
        };
        assert!(!path.exists());
        assert!(registry.is_empty());
    }
}
