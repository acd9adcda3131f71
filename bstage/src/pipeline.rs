//! The staging pipeline.
//!
//! ```text
//! DecideBuildPath ─┬─ Override ──────────────────────┐
//!                  ├─ Skip ──────────────────────────┤
//!                  └─ Prepare → Build → Extract ─────┤
//!                                                    ▼
//!                              ResolveDeps → GenerateManifest
//! ```
//!
//! Stages run strictly in sequence. The first error stops the run and is
//! reported as a [`StageFailure`]; files already staged are left as they are
//! and a re-run converges.

use crate::build::ContainerBuildExecutor;
use crate::deps::{DependencyReport, DependencyResolver};
use crate::environment::CleanupRegistry;
use crate::error::{Stage, StageFailure, StageResultExt};
use crate::extract::{Artifact, BinaryExtractor};
use crate::offline::{HttpFetcher, ManifestOutcome, OfflineManifestGenerator, ScriptFetcher};
use crate::output::Output;
use crate::source::SourcePreparer;
use crate::staging::OutputTree;
use crate::tools::ContainerRuntime;
use anyhow::{Context, Result};
use bstage_common::cache_key::{BuildSpec, CacheKey, PatchSet};
use bstage_common::config::StageConfig;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// How the primary binary will be obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildPath {
    /// Install a prebuilt binary from the host; no key, no build.
    Override(PathBuf),
    /// The staged binary already matches the key.
    Skip(CacheKey),
    /// Prepare and build from source.
    Build { spec: BuildSpec, key: CacheKey },
}

impl BuildPath {
    pub fn key(&self) -> Option<&CacheKey> {
        match self {
            BuildPath::Override(_) => None,
            BuildPath::Skip(key) | BuildPath::Build { key, .. } => Some(key),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            BuildPath::Override(_) => "override",
            BuildPath::Skip(_) => "skip",
            BuildPath::Build { .. } => "build",
        }
    }
}

/// The build-defining inputs named by `config`, with patches read from disk.
pub fn build_spec(config: &StageConfig) -> Result<BuildSpec> {
    let patches = PatchSet::load(&config.source.patches_dir).with_context(|| {
        format!(
            "Failed to read patches from {}",
            config.source.patches_dir.display()
        )
    })?;
    Ok(BuildSpec {
        commit: config.source.commit.clone(),
        reverts: config.source.reverts.clone(),
        patches,
    })
}

/// Summary of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub build_path: String,
    pub cache_key: Option<String>,
    pub dependencies: DependencyReport,
    pub manifest: ManifestOutcome,
}

pub struct Pipeline {
    config: StageConfig,
    runtime: ContainerRuntime,
    registry: CleanupRegistry,
    fetcher: Arc<dyn ScriptFetcher>,
    primary_override: Option<PathBuf>,
}

impl Pipeline {
    pub fn new(config: StageConfig, runtime: ContainerRuntime, registry: CleanupRegistry) -> Self {
        Self {
            config,
            runtime,
            registry,
            fetcher: Arc::new(HttpFetcher),
            primary_override: None,
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ScriptFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_override(mut self, path: Option<PathBuf>) -> Self {
        self.primary_override = path;
        self
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    pub fn tree(&self) -> OutputTree {
        OutputTree::new(&self.config.output_dir)
    }

    pub fn build_spec(&self) -> Result<BuildSpec> {
        build_spec(&self.config)
    }

    /// Decide the build path without touching anything.
    pub fn decide(&self) -> Result<BuildPath, StageFailure> {
        if let Some(path) = &self.primary_override {
            return Ok(BuildPath::Override(path.clone()));
        }

        let spec = self.build_spec().stage(Stage::DecideBuildPath)?;
        let key = spec.cache_key();
        let tree = self.tree();
        let recorded = tree.read_cache_key().stage(Stage::DecideBuildPath)?;

        if recorded.as_ref() == Some(&key) && tree.has_binary(&self.config.build.primary) {
            Ok(BuildPath::Skip(key))
        } else {
            Ok(BuildPath::Build { spec, key })
        }
    }

    pub fn run(&self) -> Result<PipelineReport, StageFailure> {
        let tree = self.tree();
        tree.ensure().stage(Stage::DecideBuildPath)?;
        let path = self.decide()?;
        tracing::info!(path = path.label(), "Decided build path");
        let primary = &self.config.build.primary;

        match &path {
            BuildPath::Override(source) => {
                Output::info(format!("Using prebuilt {primary} from {}", source.display()));
                let artifact =
                    Artifact::from_override(primary.as_str(), source).stage(Stage::Extract)?;
                // A prebuilt binary corresponds to no key.
                tree.invalidate_cache_key().stage(Stage::Extract)?;
                BinaryExtractor::new(&self.runtime, &tree)
                    .install(&[artifact])
                    .stage(Stage::Extract)?;
            }
            BuildPath::Skip(key) => {
                Output::info(format!("{primary} is up to date ({key})"));
            }
            BuildPath::Build { spec, key } => {
                Output::info(format!("Building {primary} ({key})"));
                self.build_primary(spec, key, &tree)?;
            }
        }

        Output::info("Resolving runtime dependencies");
        let policy = self.config.runtime.policy().stage(Stage::ResolveDeps)?;
        let dependencies = DependencyResolver::new(
            &self.runtime,
            &self.registry,
            &self.config.runtime,
            &policy,
            &tree,
        )
        .resolve(primary)
        .stage(Stage::ResolveDeps)?;

        let manifest = OfflineManifestGenerator::new(
            &self.runtime,
            &self.registry,
            &self.config.offline,
            &tree,
            self.fetcher.as_ref(),
        )
        .ensure()
        .stage(Stage::GenerateManifest)?;

        Ok(PipelineReport {
            build_path: path.label().to_string(),
            cache_key: path.key().map(|key| key.to_string()),
            dependencies,
            manifest,
        })
    }

    fn build_primary(
        &self,
        spec: &BuildSpec,
        key: &CacheKey,
        tree: &OutputTree,
    ) -> Result<(), StageFailure> {
        let primary = &self.config.build.primary;

        let prepared = SourcePreparer::new(
            self.runtime.runner(),
            &self.registry,
            self.config.source.url.as_str(),
        )
        .submodules(self.config.source.submodules)
        .prepare(spec)
        .stage(Stage::Prepare)?;

        let built = ContainerBuildExecutor::new(&self.runtime, &self.registry, &self.config.build)
            .build(prepared.path())
            .stage(Stage::Build)?;

        let artifact =
            Artifact::from_environment(primary.as_str(), built.environment().name(), built.path());
        // The record must never outlive the binary it describes, even if the
        // overwrite below fails halfway.
        tree.invalidate_cache_key().stage(Stage::Extract)?;
        BinaryExtractor::new(&self.runtime, tree)
            .install(&[artifact])
            .stage(Stage::Extract)?;
        tree.write_cache_key(key).stage(Stage::Extract)?;
        built.finish().stage(Stage::Extract)?;
        drop(prepared);

        Output::success(format!("Staged {primary}"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_runner::{MockCommandRunner, MockResponse};
    use bstage_common::cache_key::compute_key;
    use bstage_common::config::OfflineConfig;
    use bstage_common::fsutil::is_executable;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const LDD: &str = "\
\tlinux-vdso.so.1 (0x00007ffd5e1f2000)
\tlibcap.so.2 => /lib/x86_64-linux-gnu/libcap.so.2 (0x00007f0000001000)
\tlibc.so.6 => /lib/x86_64-linux-gnu/libc.so.6 (0x00007f0000003000)
";

    struct CountingFetcher(AtomicUsize);

    impl ScriptFetcher for CountingFetcher {
        fn fetch(&self, _url: &str) -> Result<Vec<u8>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(b"print()".to_vec())
        }
    }

    struct Fixture {
        temp: tempfile::TempDir,
        mock: Arc<MockCommandRunner>,
        fetcher: Arc<CountingFetcher>,
        registry: CleanupRegistry,
        config: StageConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempfile::tempdir().unwrap();
            let lock_file = temp.path().join("Cargo.lock");
            std::fs::write(&lock_file, "version = 3\n").unwrap();

            let mock = Arc::new(MockCommandRunner::new());
            mock.on(
                "git rev-parse HEAD",
                MockResponse::Success("0123abcd00000000000000000000000000000000\n".into()),
            );
            // Every copy out of an environment produces a small file; the
            // manifest copy produces JSON.
            mock.on(
                "podman cp bstage-",
                MockResponse::handler(|call| {
                    let dest = &call.args[2];
                    let body = if dest.ends_with(".json") { "[]" } else { "elf" };
                    std::fs::write(dest, body).unwrap();
                    MockResponse::Success(String::new())
                }),
            )
            .on(
                "podman exec bstage-deps",
                MockResponse::handler(|call| {
                    if call.args.get(2).map(String::as_str) == Some("ldd") {
                        MockResponse::Success(LDD.into())
                    } else {
                        MockResponse::Success(String::new())
                    }
                }),
            );

            let config = StageConfig {
                schema: None,
                output_dir: temp.path().join("build-deps"),
                container_runtime: "podman".into(),
                source: bstage_common::config::SourceConfig {
                    url: "https://example.invalid/crosvm".into(),
                    commit: "0123abcd".into(),
                    reverts: Vec::new(),
                    patches_dir: temp.path().join("patches"),
                    submodules: true,
                },
                build: Default::default(),
                runtime: Default::default(),
                offline: OfflineConfig {
                    generator_url: "https://example.invalid/gen.py".into(),
                    generator_sha256: None,
                    image: "debian:trixie".into(),
                    package_manager: Default::default(),
                    packages: vec!["python3".into()],
                    lock_file,
                    manifest: "cargo-sources.json".into(),
                },
            };

            Self {
                temp,
                mock,
                fetcher: Arc::new(CountingFetcher(AtomicUsize::new(0))),
                registry: CleanupRegistry::with_invocation("test"),
                config,
            }
        }

        fn pipeline(&self) -> Pipeline {
            let runtime = ContainerRuntime::new(self.mock.clone(), "podman");
            Pipeline::new(self.config.clone(), runtime, self.registry.clone())
                .with_fetcher(self.fetcher.clone())
        }

        fn tree(&self) -> OutputTree {
            OutputTree::new(&self.config.output_dir)
        }
    }

    #[test]
    fn full_run_stages_everything() {
        let f = Fixture::new();
        let report = f.pipeline().run().unwrap();

        let tree = f.tree();
        for binary in ["crosvm", "passt", "socat"] {
            assert!(is_executable(&tree.binary_path(binary)), "{binary}");
        }
        assert_eq!(tree.staged_libraries().unwrap(), ["libcap.so.2"]);
        assert_eq!(
            tree.read_cache_key().unwrap(),
            Some(compute_key("0123abcd", &[], &PatchSet::default()))
        );
        assert!(tree.manifest_path("cargo-sources.json").exists());
        assert_eq!(report.build_path, "build");
        assert_eq!(report.manifest, ManifestOutcome::Generated);
        assert!(f.registry.is_empty());
    }

    #[test]
    fn unchanged_key_skips_build_environment() {
        let f = Fixture::new();
        f.pipeline().run().unwrap();
        let first_run_calls = f.mock.calls().len();

        let report = f.pipeline().run().unwrap();

        let second_run: Vec<String> = f.mock.command_lines()[first_run_calls..].to_vec();
        assert_eq!(report.build_path, "skip");
        assert!(!second_run.iter().any(|line| line.starts_with("git")));
        assert!(!second_run.iter().any(|line| line.contains("bstage-build-")));
        assert!(matches!(report.manifest, ManifestOutcome::AlreadyPresent { .. }));
        assert_eq!(f.fetcher.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn changed_patch_forces_rebuild() {
        let f = Fixture::new();
        f.pipeline().run().unwrap();

        std::fs::create_dir_all(&f.config.source.patches_dir).unwrap();
        std::fs::write(f.config.source.patches_dir.join("01-fix.patch"), "diff").unwrap();

        match f.pipeline().decide().unwrap() {
            BuildPath::Build { spec, .. } => assert_eq!(spec.patches.len(), 1),
            other => panic!("expected a build, got {other:?}"),
        }
    }

    #[test]
    fn override_skips_source_and_build() {
        let f = Fixture::new();
        let prebuilt = f.temp.path().join("crosvm-prebuilt");
        std::fs::write(&prebuilt, "prebuilt").unwrap();

        let report = f
            .pipeline()
            .with_override(Some(prebuilt))
            .run()
            .unwrap();

        let tree = f.tree();
        assert_eq!(report.build_path, "override");
        assert!(is_executable(&tree.binary_path("crosvm")));
        assert_eq!(
            std::fs::read_to_string(tree.binary_path("crosvm")).unwrap(),
            "prebuilt"
        );
        assert!(!f.mock.was_called("git"));
        assert!(!f.mock.command_lines().iter().any(|l| l.contains("bstage-build-")));
        assert_eq!(tree.read_cache_key().unwrap(), None);
    }

    #[test]
    fn missing_override_fails_in_extract() {
        let f = Fixture::new();
        let err = f
            .pipeline()
            .with_override(Some(f.temp.path().join("missing")))
            .run()
            .unwrap_err();
        assert_eq!(err.stage, Stage::Extract);
    }

    #[test]
    fn failed_extract_leaves_no_record_for_partial_binary() {
        let f = Fixture::new();
        f.pipeline().run().unwrap();

        std::fs::create_dir_all(&f.config.source.patches_dir).unwrap();
        let patch = f.config.source.patches_dir.join("01-fix.patch");
        std::fs::write(&patch, "diff").unwrap();
        f.mock.on(
            "podman cp bstage-build-",
            MockResponse::handler(|call| {
                std::fs::write(&call.args[2], "PARTIAL").unwrap();
                MockResponse::Failure {
                    code: 125,
                    stderr: "copy interrupted".into(),
                }
            }),
        );

        let err = f.pipeline().run().unwrap_err();
        assert_eq!(err.stage, Stage::Extract);
        assert_eq!(f.tree().read_cache_key().unwrap(), None);

        // Back to the inputs of the first run: the partial binary is rebuilt.
        std::fs::remove_file(&patch).unwrap();
        assert!(matches!(
            f.pipeline().decide().unwrap(),
            BuildPath::Build { .. }
        ));
    }

    #[test]
    fn override_after_build_drops_record() {
        let f = Fixture::new();
        f.pipeline().run().unwrap();
        assert!(f.tree().read_cache_key().unwrap().is_some());

        let prebuilt = f.temp.path().join("crosvm-prebuilt");
        std::fs::write(&prebuilt, "prebuilt").unwrap();
        f.pipeline().with_override(Some(prebuilt)).run().unwrap();

        assert_eq!(f.tree().read_cache_key().unwrap(), None);
        assert!(matches!(
            f.pipeline().decide().unwrap(),
            BuildPath::Build { .. }
        ));
    }

    #[test]
    fn failure_is_labelled_and_cleans_up() {
        let f = Fixture::new();
        f.mock.on("podman exec --workdir /src", MockResponse::Failure {
            code: 101,
            stderr: String::new(),
        });

        let err = f.pipeline().run().unwrap_err();

        assert_eq!(err.stage, Stage::Build);
        assert!(f.registry.is_empty());
        assert!(f.mock.was_called("podman rm --force --ignore bstage-build-test-0"));
        assert_eq!(f.tree().read_cache_key().unwrap(), None);
        assert!(!f.mock.was_called("podman run --detach --rm --name bstage-deps"));
    }

    #[test]
    fn patch_failure_is_a_prepare_failure() {
        let f = Fixture::new();
        std::fs::create_dir_all(&f.config.source.patches_dir).unwrap();
        std::fs::write(f.config.source.patches_dir.join("bad.patch"), "x").unwrap();
        f.mock.on("git apply", MockResponse::Failure {
            code: 1,
            stderr: "error: corrupt patch".into(),
        });

        let err = f.pipeline().run().unwrap_err();

        assert_eq!(err.stage, Stage::Prepare);
        assert!(format!("{:#}", anyhow::Error::new(err)).contains("bad.patch"));
        assert!(!f.mock.was_called("podman run"));
        assert!(f.registry.is_empty());
    }
}
