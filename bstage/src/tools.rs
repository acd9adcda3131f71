//! Typed capabilities over the external tools the pipeline drives.
//!
//! Every call goes through [`CommandRunner`] and comes back as a
//! [`ToolError`] that distinguishes a missing tool from a failing one and from
//! output we could not make sense of.

use crate::command_runner::{CommandOptions, CommandRunner};
use std::path::Path;
use std::process::Output;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{program} is not installed or not on PATH")]
    Missing { program: String },

    #[error("could not run {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("`{command}` exited with {status}{}", format_stderr(.stderr))]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("unexpected output from `{command}`: {message}")]
    Parse { command: String, message: String },
}

fn format_stderr(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {trimmed}")
    }
}

fn display_command(program: &str, args: &[&str]) -> String {
    let words = std::iter::once(program).chain(args.iter().copied());
    shlex::try_join(words).unwrap_or_else(|_| {
        std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ")
    })
}

fn spawn_error(program: &str, err: anyhow::Error) -> ToolError {
    match err.downcast_ref::<std::io::Error>() {
        Some(io) if io.kind() == std::io::ErrorKind::NotFound => ToolError::Missing {
            program: program.to_string(),
        },
        _ => ToolError::Spawn {
            program: program.to_string(),
            message: format!("{err:#}"),
        },
    }
}

/// Run a command, capturing output, and fail unless it exits successfully.
pub fn run_checked(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[&str],
    options: &CommandOptions,
) -> Result<Output, ToolError> {
    let output = run_unchecked(runner, program, args, options)?;
    if output.status.success() {
        Ok(output)
    } else {
        Err(ToolError::Failed {
            command: display_command(program, args),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run a command, capturing output, without interpreting its exit status.
pub fn run_unchecked(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[&str],
    options: &CommandOptions,
) -> Result<Output, ToolError> {
    runner
        .run_output(program, args, options)
        .map_err(|err| spawn_error(program, err))
}

/// Run a command with inherited stdio; its diagnostics go straight to the user.
pub fn run_streaming(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[&str],
    options: &CommandOptions,
) -> Result<(), ToolError> {
    let status = runner
        .run_status(program, args, options)
        .map_err(|err| spawn_error(program, err))?;
    if status.success() {
        Ok(())
    } else {
        Err(ToolError::Failed {
            command: display_command(program, args),
            status: status.to_string(),
            stderr: String::new(),
        })
    }
}

/// Source control, configured so user and system settings cannot change the
/// resulting tree.
pub struct Git<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> Git<'a> {
    /// Fixed author/committer dates so revert commits are reproducible.
    const FIXED_DATE: &'static str = "2000-01-01T00:00:00+0000";

    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    fn options(cwd: Option<&Path>) -> CommandOptions {
        let options = match cwd {
            Some(dir) => CommandOptions::with_cwd(dir),
            None => CommandOptions::default(),
        };
        options
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .env("GIT_CONFIG_GLOBAL", "/dev/null")
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_AUTHOR_NAME", "bstage")
            .env("GIT_AUTHOR_EMAIL", "bstage@localhost")
            .env("GIT_COMMITTER_NAME", "bstage")
            .env("GIT_COMMITTER_EMAIL", "bstage@localhost")
            .env("GIT_AUTHOR_DATE", Self::FIXED_DATE)
            .env("GIT_COMMITTER_DATE", Self::FIXED_DATE)
            .env("LC_ALL", "C")
    }

    pub fn clone_repo(&self, url: &str, dest: &Path) -> Result<(), ToolError> {
        let dest = dest.to_string_lossy();
        run_streaming(
            self.runner,
            "git",
            &["clone", "--no-checkout", url, &dest],
            &Self::options(None),
        )
    }

    pub fn checkout(&self, repo: &Path, commit: &str) -> Result<(), ToolError> {
        run_checked(
            self.runner,
            "git",
            &["-c", "advice.detachedHead=false", "checkout", "--detach", commit],
            &Self::options(Some(repo)),
        )
        .map(drop)
    }

    pub fn revert(&self, repo: &Path, commit: &str) -> Result<(), ToolError> {
        run_checked(
            self.runner,
            "git",
            &["revert", "--no-edit", commit],
            &Self::options(Some(repo)),
        )
        .map(drop)
    }

    pub fn apply(&self, repo: &Path, patch: &Path) -> Result<(), ToolError> {
        let patch = patch.to_string_lossy();
        run_checked(
            self.runner,
            "git",
            &["apply", "--whitespace=nowarn", &patch],
            &Self::options(Some(repo)),
        )
        .map(drop)
    }

    pub fn update_submodules(&self, repo: &Path) -> Result<(), ToolError> {
        run_streaming(
            self.runner,
            "git",
            &["submodule", "update", "--init", "--recursive"],
            &Self::options(Some(repo)),
        )
    }

    /// Full hash of `HEAD`.
    pub fn head(&self, repo: &Path) -> Result<String, ToolError> {
        let output = run_checked(
            self.runner,
            "git",
            &["rev-parse", "HEAD"],
            &Self::options(Some(repo)),
        )?;
        let head = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let valid = (head.len() == 40 || head.len() == 64)
            && head.chars().all(|c| c.is_ascii_hexdigit());
        if valid {
            Ok(head)
        } else {
            Err(ToolError::Parse {
                command: "git rev-parse HEAD".to_string(),
                message: format!("expected a commit hash, got '{head}'"),
            })
        }
    }
}

/// Label carried by every environment this tool creates.
pub const MANAGED_LABEL: &str = "bstage.managed=true";

/// A host directory bind-mounted into an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: std::path::PathBuf,
    pub guest: String,
}

/// The container runtime CLI (podman by default).
#[derive(Clone)]
pub struct ContainerRuntime {
    runner: Arc<dyn CommandRunner>,
    program: String,
}

impl ContainerRuntime {
    pub fn new(runner: Arc<dyn CommandRunner>, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    /// Start a detached, idle container that commands are exec'd into.
    pub fn start(
        &self,
        name: &str,
        image: &str,
        invocation: &str,
        mounts: &[Mount],
    ) -> Result<(), ToolError> {
        let invocation_label = format!("bstage.invocation={invocation}");
        let volumes: Vec<String> = mounts
            .iter()
            .map(|m| format!("{}:{}:Z", m.host.display(), m.guest))
            .collect();

        let mut args = vec![
            "run",
            "--detach",
            "--rm",
            "--name",
            name,
            "--label",
            MANAGED_LABEL,
            "--label",
            invocation_label.as_str(),
        ];
        for volume in &volumes {
            args.push("--volume");
            args.push(volume);
        }
        args.extend([image, "sleep", "infinity"]);

        run_checked(self.runner(), &self.program, &args, &CommandOptions::default()).map(drop)
    }

    fn exec_args(
        name: &str,
        command: &[String],
        env: &[(String, String)],
        workdir: Option<&str>,
    ) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        for (key, value) in env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        if let Some(dir) = workdir {
            args.push("--workdir".to_string());
            args.push(dir.to_string());
        }
        args.push(name.to_string());
        args.extend(command.iter().cloned());
        args
    }

    /// Run a command inside `name`, capturing output; non-zero exit is an error.
    pub fn exec(&self, name: &str, command: &[String]) -> Result<Output, ToolError> {
        let args = Self::exec_args(name, command, &[], None);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_checked(self.runner(), &self.program, &args, &CommandOptions::default())
    }

    /// Run a command inside `name`, capturing output whatever its exit status.
    pub fn exec_unchecked(&self, name: &str, command: &[String]) -> Result<Output, ToolError> {
        let args = Self::exec_args(name, command, &[], None);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_unchecked(self.runner(), &self.program, &args, &CommandOptions::default())
    }

    /// Run a long command inside `name` with inherited stdio.
    pub fn exec_streaming(
        &self,
        name: &str,
        command: &[String],
        env: &[(String, String)],
        workdir: Option<&str>,
    ) -> Result<(), ToolError> {
        let args = Self::exec_args(name, command, env, workdir);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_streaming(self.runner(), &self.program, &args, &CommandOptions::default())
    }

    pub fn copy_out(&self, name: &str, guest: &str, host: &Path) -> Result<(), ToolError> {
        let source = format!("{name}:{guest}");
        let dest = host.to_string_lossy();
        run_checked(
            self.runner(),
            &self.program,
            &["cp", &source, &dest],
            &CommandOptions::default(),
        )
        .map(drop)
    }

    pub fn copy_in(&self, host: &Path, name: &str, guest: &str) -> Result<(), ToolError> {
        let source = host.to_string_lossy();
        let dest = format!("{name}:{guest}");
        run_checked(
            self.runner(),
            &self.program,
            &["cp", &source, &dest],
            &CommandOptions::default(),
        )
        .map(drop)
    }

    /// Force-remove a container; removing one that is already gone succeeds.
    pub fn remove(&self, name: &str) -> Result<(), ToolError> {
        run_checked(
            self.runner(),
            &self.program,
            &["rm", "--force", "--ignore", name],
            &CommandOptions::default(),
        )
        .map(drop)
    }

    /// Names of every live environment created by this tool.
    pub fn list_managed(&self) -> Result<Vec<String>, ToolError> {
        let filter = format!("label={MANAGED_LABEL}");
        let output = run_checked(
            self.runner(),
            &self.program,
            &["ps", "--all", "--filter", &filter, "--format", "{{.Names}}"],
            &CommandOptions::default(),
        )?;
        let stdout = String::from_utf8(output.stdout).map_err(|err| ToolError::Parse {
            command: format!("{} ps", self.program),
            message: err.to_string(),
        })?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// `<program> --version`, used by preflight checks.
    pub fn version(&self) -> Result<String, ToolError> {
        let output = run_checked(
            self.runner(),
            &self.program,
            &["--version"],
            &CommandOptions::default(),
        )?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_runner::{MockCommandRunner, MockResponse};

    fn runtime(mock: &Arc<MockCommandRunner>) -> ContainerRuntime {
        ContainerRuntime::new(mock.clone(), "podman")
    }

    #[test]
    fn missing_tool_is_reported_as_missing() {
        let mock = MockCommandRunner::new();
        mock.on("git", MockResponse::Missing);
        let err = run_checked(&mock, "git", &["--version"], &CommandOptions::default())
            .unwrap_err();
        assert!(matches!(err, ToolError::Missing { ref program } if program == "git"));
    }

    #[test]
    fn failure_carries_stderr() {
        let mock = MockCommandRunner::new();
        mock.on("git revert", MockResponse::Failure {
            code: 1,
            stderr: "CONFLICT (content): Merge conflict in src/main.rs\n".into(),
        });
        let err = Git::new(&mock)
            .revert(Path::new("/tmp/src"), "deadbeef")
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("git revert --no-edit deadbeef"), "{message}");
        assert!(message.contains("Merge conflict"), "{message}");
    }

    #[test]
    fn git_runs_with_isolated_config() {
        let mock = MockCommandRunner::new();
        Git::new(&mock)
            .checkout(Path::new("/tmp/src"), "abc123")
            .unwrap();
        let call = &mock.calls()[0];
        assert_eq!(call.cwd.as_deref(), Some(Path::new("/tmp/src")));
        assert!(call
            .env
            .contains(&("GIT_CONFIG_GLOBAL".to_string(), "/dev/null".to_string())));
        assert!(call
            .env
            .contains(&("GIT_CONFIG_NOSYSTEM".to_string(), "1".to_string())));
    }

    #[test]
    fn head_rejects_non_hash_output() {
        let mock = MockCommandRunner::new();
        mock.on("git rev-parse", MockResponse::Success("HEAD\n".into()));
        let err = Git::new(&mock).head(Path::new("/tmp/src")).unwrap_err();
        assert!(matches!(err, ToolError::Parse { .. }));
    }

    #[test]
    fn start_labels_and_mounts() {
        let mock = Arc::new(MockCommandRunner::new());
        let mounts = [Mount {
            host: "/tmp/tree".into(),
            guest: "/src".to_string(),
        }];
        runtime(&mock)
            .start("bstage-build-1", "debian:trixie", "inv-1", &mounts)
            .unwrap();
        let line = &mock.command_lines()[0];
        assert!(line.starts_with("podman run --detach --rm --name bstage-build-1"));
        assert!(line.contains("--label bstage.managed=true"));
        assert!(line.contains("--label bstage.invocation=inv-1"));
        assert!(line.contains("--volume /tmp/tree:/src:Z"));
        assert!(line.ends_with("debian:trixie sleep infinity"));
    }

    #[test]
    fn exec_passes_env_and_workdir() {
        let mock = Arc::new(MockCommandRunner::new());
        let env = [("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string())];
        runtime(&mock)
            .exec_streaming(
                "env-1",
                &["apt-get".to_string(), "update".to_string()],
                &env,
                Some("/src"),
            )
            .unwrap();
        assert_eq!(
            mock.command_lines(),
            vec!["podman exec --env DEBIAN_FRONTEND=noninteractive --workdir /src env-1 apt-get update"]
        );
    }

    #[test]
    fn list_managed_parses_names() {
        let mock = Arc::new(MockCommandRunner::new());
        mock.on("podman ps", MockResponse::Success("bstage-a\n\nbstage-b\n".into()));
        assert_eq!(
            runtime(&mock).list_managed().unwrap(),
            vec!["bstage-a".to_string(), "bstage-b".to_string()]
        );
    }
}
