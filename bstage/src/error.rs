//! Stage-labelled pipeline errors.

use std::fmt;
use thiserror::Error;

/// A step of the staging pipeline, used to label failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    DecideBuildPath,
    Prepare,
    Build,
    Extract,
    ResolveDeps,
    GenerateManifest,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::DecideBuildPath => "decide-build-path",
            Stage::Prepare => "prepare",
            Stage::Build => "build",
            Stage::Extract => "extract",
            Stage::ResolveDeps => "resolve-deps",
            Stage::GenerateManifest => "generate-manifest",
        };
        f.write_str(name)
    }
}

/// The first error of a failed stage.
#[derive(Debug, Error)]
#[error("{stage} stage failed")]
pub struct StageFailure {
    pub stage: Stage,
    #[source]
    pub source: anyhow::Error,
}

pub trait StageResultExt<T> {
    /// Attribute an error to `stage`.
    fn stage(self, stage: Stage) -> Result<T, StageFailure>;
}

impl<T, E> StageResultExt<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn stage(self, stage: Stage) -> Result<T, StageFailure> {
        self.map_err(|err| StageFailure {
            stage,
            source: err.into(),
        })
    }
}
