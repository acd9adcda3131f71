//! Abstraction over external command execution for testability.
//!
//! This module provides the [`CommandRunner`] trait, which abstracts every
//! external command invocation (podman, git) behind a trait object. This
//! enables in-process testing of whole pipeline runs without spawning
//! subprocesses.
//!
//! # Production Usage
//!
//! [`RealCommandRunner`] delegates to [`std::process::Command`] and is what
//! the CLI hands to [`Pipeline`](crate::pipeline::Pipeline).
//!
//! # Testing Usage
//!
//! [`MockCommandRunner`] records all calls and returns canned responses keyed
//! by command-line prefix, enabling fast, deterministic tests without podman
//! or network access.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Output};
use std::sync::{Arc, Mutex};

/// Trait for abstracting external command execution.
///
/// Stored as `Arc<dyn CommandRunner>` so that environment guards and the
/// interrupt handler can tear down containers on their own.
pub trait CommandRunner: Send + Sync {
    /// Run a command and capture its full output (stdout + stderr + exit status).
    fn run_output(&self, program: &str, args: &[&str], options: &CommandOptions) -> Result<Output>;

    /// Run a command and return only its exit status (inherits stdio).
    ///
    /// Used for long-running steps (clone, package install, build) so the
    /// tool's own progress and diagnostics reach the terminal.
    fn run_status(
        &self,
        program: &str,
        args: &[&str],
        options: &CommandOptions,
    ) -> Result<ExitStatus>;
}

/// Options for command execution.
#[derive(Debug, Default, Clone)]
pub struct CommandOptions {
    /// Working directory for the command.
    pub cwd: Option<PathBuf>,
    /// Additional environment variables.
    pub env: Vec<(String, String)>,
}

impl CommandOptions {
    /// Create options with a working directory.
    pub fn with_cwd(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            ..Default::default()
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Production implementation that delegates to [`std::process::Command`].
pub struct RealCommandRunner;

impl RealCommandRunner {
    fn command(program: &str, args: &[&str], options: &CommandOptions) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &options.env {
            cmd.env(k, v);
        }
        cmd
    }
}

impl CommandRunner for RealCommandRunner {
    fn run_output(&self, program: &str, args: &[&str], options: &CommandOptions) -> Result<Output> {
        tracing::debug!(program, ?args, cwd = ?options.cwd, "Running command");
        Self::command(program, args, options)
            .output()
            .with_context(|| format!("Failed to run '{program}'"))
    }

    fn run_status(
        &self,
        program: &str,
        args: &[&str],
        options: &CommandOptions,
    ) -> Result<ExitStatus> {
        tracing::debug!(program, ?args, cwd = ?options.cwd, "Running command");
        Self::command(program, args, options)
            .status()
            .with_context(|| format!("Failed to run '{program}'"))
    }
}

/// A call captured by [`MockCommandRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl RecordedCall {
    /// `program arg1 arg2 ...`, used for prefix matching.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

type Handler = Arc<dyn Fn(&RecordedCall) -> MockResponse + Send + Sync>;

/// Canned result for a mocked command.
#[derive(Clone)]
pub enum MockResponse {
    /// Exit 0 with the given stdout.
    Success(String),
    /// Exit with `code`, writing `stderr`.
    Failure { code: i32, stderr: String },
    /// The program is not installed.
    Missing,
    /// Compute the response (and perform side effects) from the call.
    Handler(Handler),
}

impl MockResponse {
    pub fn handler<F>(f: F) -> Self
    where
        F: Fn(&RecordedCall) -> MockResponse + Send + Sync + 'static,
    {
        MockResponse::Handler(Arc::new(f))
    }
}

struct MockRule {
    prefix: String,
    response: MockResponse,
}

/// Test implementation that records calls and answers from prefix rules.
///
/// Rules are checked most-recent first; unmatched commands succeed with
/// empty output.
#[derive(Default)]
pub struct MockCommandRunner {
    calls: Mutex<Vec<RecordedCall>>,
    rules: Mutex<Vec<MockRule>>,
}

impl MockCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond to every command line starting with `prefix`.
    pub fn on(&self, prefix: &str, response: MockResponse) -> &Self {
        self.rules
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(MockRule {
                prefix: prefix.to_string(),
                response,
            });
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Command lines of every recorded call, in order.
    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(RecordedCall::command_line).collect()
    }

    /// Whether any recorded command line starts with `prefix`.
    pub fn was_called(&self, prefix: &str) -> bool {
        self.command_lines()
            .iter()
            .any(|line| line.starts_with(prefix))
    }

    fn respond(&self, program: &str, args: &[&str], options: &CommandOptions) -> Result<Output> {
        let call = RecordedCall {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: options.cwd.clone(),
            env: options.env.clone(),
        };
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(call.clone());

        let line = call.command_line();
        let response = self
            .rules
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .rev()
            .find(|rule| line.starts_with(&rule.prefix))
            .map(|rule| rule.response.clone())
            .unwrap_or_else(|| MockResponse::Success(String::new()));

        resolve(response, &call, program)
    }
}

fn resolve(response: MockResponse, call: &RecordedCall, program: &str) -> Result<Output> {
    match response {
        MockResponse::Success(stdout) => Ok(output(0, stdout.into_bytes(), Vec::new())),
        MockResponse::Failure { code, stderr } => Ok(output(code, Vec::new(), stderr.into_bytes())),
        MockResponse::Missing => {
            let err = std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{program}: command not found"),
            );
            Err(anyhow::Error::new(err).context(format!("Failed to run '{program}'")))
        }
        MockResponse::Handler(handler) => resolve(handler(call), call, program),
    }
}

#[cfg(unix)]
fn output(code: i32, stdout: Vec<u8>, stderr: Vec<u8>) -> Output {
    use std::os::unix::process::ExitStatusExt;
    Output {
        status: ExitStatus::from_raw(code << 8),
        stdout,
        stderr,
    }
}

impl CommandRunner for MockCommandRunner {
    fn run_output(&self, program: &str, args: &[&str], options: &CommandOptions) -> Result<Output> {
        self.respond(program, args, options)
    }

    fn run_status(
        &self,
        program: &str,
        args: &[&str],
        options: &CommandOptions,
    ) -> Result<ExitStatus> {
        self.respond(program, args, options).map(|out| out.status)
    }
}
