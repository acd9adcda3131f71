//! Doctor command implementation.
//!
//! Preflight checks for everything `bstage run` needs before it starts
//! creating environments.

use crate::command_runner::{CommandOptions, CommandRunner, RealCommandRunner};
use crate::output::Output;
use anyhow::{bail, Result};
use bstage_common::cache_key::PatchSet;
use bstage_common::config::StageConfig;
use clap::Args;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Args)]
pub struct DoctorArgs {
    /// Output format (table, json)
    #[arg(short, long, default_value = "table")]
    format: String,
}

/// Outcome of one check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub fix_hint: Option<String>,
}

impl CheckResult {
    fn pass(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            message: message.into(),
            fix_hint: None,
        }
    }

    fn fail(name: &str, message: impl Into<String>, fix_hint: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            message: message.into(),
            fix_hint: (!fix_hint.trim().is_empty()).then(|| fix_hint.to_string()),
        }
    }
}

pub fn run(args: DoctorArgs, config_path: &Path) -> Result<()> {
    let results = run_checks(&RealCommandRunner, config_path);

    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        Output::header("bstage doctor - checking pipeline readiness");
        for result in &results {
            if result.passed {
                Output::success(format!("{}: {}", result.name, result.message));
            } else {
                Output::error(format!("{}: {}", result.name, result.message));
                if let Some(hint) = &result.fix_hint {
                    Output::hint(hint);
                }
            }
        }
        Output::blank();
    }

    let failed = results.iter().filter(|r| !r.passed).count();
    if failed > 0 {
        bail!("{failed} check(s) failed");
    }
    if args.format != "json" {
        Output::success("All checks passed. Ready to run the pipeline.");
    }
    Ok(())
}

/// Run every check. Tool checks still run when the config is broken, using
/// the default container runtime.
pub fn run_checks(runner: &dyn CommandRunner, config_path: &Path) -> Vec<CheckResult> {
    let mut results = Vec::new();

    let config = match super::load_config(config_path) {
        Ok(config) => {
            results.push(CheckResult::pass(
                "config",
                format!("{} is valid", config_path.display()),
            ));
            Some(config)
        }
        Err(err) => {
            results.push(CheckResult::fail(
                "config",
                format!("{err:#}"),
                "Create bstage.json or point BSTAGE_CONFIG at one; `bstage schema` prints its schema",
            ));
            None
        }
    };

    let runtime = config
        .as_ref()
        .map(|c| c.container_runtime.as_str())
        .unwrap_or("podman");
    results.push(check_tool(runner, runtime, "Install podman: dnf install podman"));
    results.push(check_tool(runner, "git", "Install git: dnf install git"));

    if let Some(config) = &config {
        results.push(check_lock_file(config));
        results.push(check_patches(config));
    }
    results
}

fn check_tool(runner: &dyn CommandRunner, program: &str, hint: &str) -> CheckResult {
    match runner.run_output(program, &["--version"], &CommandOptions::default()) {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout);
            let line = version.lines().next().unwrap_or("installed").trim().to_string();
            CheckResult::pass(program, line)
        }
        Ok(output) => CheckResult::fail(
            program,
            format!("`{program} --version` exited with {}", output.status),
            hint,
        ),
        Err(_) => CheckResult::fail(program, format!("{program} not found on PATH"), hint),
    }
}

fn check_lock_file(config: &StageConfig) -> CheckResult {
    let lock_file = &config.offline.lock_file;
    let manifest = config.output_dir.join(&config.offline.manifest);
    if lock_file.is_file() {
        CheckResult::pass("lock file", lock_file.display().to_string())
    } else if manifest.exists() {
        CheckResult::pass(
            "lock file",
            format!("missing, but {} already exists", config.offline.manifest),
        )
    } else {
        CheckResult::fail(
            "lock file",
            format!("{} not found", lock_file.display()),
            "Set offline.lock_file to the Cargo.lock the manifest is generated from",
        )
    }
}

fn check_patches(config: &StageConfig) -> CheckResult {
    match PatchSet::load(&config.source.patches_dir) {
        Ok(patches) => CheckResult::pass(
            "patches",
            format!(
                "{} patch(es) in {}",
                patches.len(),
                config.source.patches_dir.display()
            ),
        ),
        Err(err) => CheckResult::fail(
            "patches",
            format!("{}: {err}", config.source.patches_dir.display()),
            "",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_runner::{MockCommandRunner, MockResponse};

    fn write_config(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("bstage.json");
        std::fs::write(
            &path,
            r#"{
                "source": { "commit": "abc" },
                "offline": { "generator_url": "https://example.invalid/gen.py" }
            }"#,
        )
        .unwrap();
        std::fs::write(dir.join("Cargo.lock"), "").unwrap();
        path
    }

    #[test]
    fn all_checks_pass_with_tools_and_config() {
        let temp = tempfile::tempdir().unwrap();
        let config = write_config(temp.path());
        let mock = MockCommandRunner::new();
        mock.on("podman --version", MockResponse::Success("podman version 5.2.0\n".into()));

        let results = run_checks(&mock, &config);

        assert!(results.iter().all(|r| r.passed), "{results:?}");
        let podman = results.iter().find(|r| r.name == "podman").unwrap();
        assert_eq!(podman.message, "podman version 5.2.0");
    }

    #[test]
    fn missing_tool_fails_with_hint() {
        let temp = tempfile::tempdir().unwrap();
        let config = write_config(temp.path());
        let mock = MockCommandRunner::new();
        mock.on("git", MockResponse::Missing);

        let results = run_checks(&mock, &config);

        let git = results.iter().find(|r| r.name == "git").unwrap();
        assert!(!git.passed);
        assert!(git.fix_hint.is_some());
    }

    #[test]
    fn broken_config_still_checks_tools() {
        let temp = tempfile::tempdir().unwrap();
        let mock = MockCommandRunner::new();

        let results = run_checks(&mock, &temp.path().join("missing.json"));

        assert!(!results[0].passed);
        assert!(mock.was_called("podman --version"));
        assert!(mock.was_called("git --version"));
    }
}
