//! bstage - stage crosvm and its runtime for Flatpak packaging
//!
//! Assembles a primary binary (built from a pinned, patched source tree),
//! auxiliary binaries and their shared libraries, plus an offline dependency
//! manifest, into one output directory:
//!
//! ```text
//! build-deps/
//!   bin/crosvm bin/passt bin/socat
//!   lib/*.so*
//!   .build-key
//!   cargo-sources.json
//! ```
//!
//! Builds and library resolution run inside disposable podman containers
//! that are always removed, including on Ctrl-C. A content-addressed cache
//! key over commit, reverts and patches lets unchanged sources skip the
//! build entirely.

pub mod build;
pub mod cli;
pub mod command_runner;
pub mod commands;
pub mod deps;
pub mod environment;
pub mod error;
pub mod extract;
pub mod offline;
pub mod output;
pub mod pipeline;
pub mod source;
pub mod staging;
pub mod tools;

pub use cli::{Cli, Commands};
pub use error::{Stage, StageFailure};
pub use pipeline::{BuildPath, Pipeline, PipelineReport};
