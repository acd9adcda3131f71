//! Output helpers for consistent CLI output.
//!
//! Status lines (`success`, `error`, `info`, `step`, `hint`) go to stderr the
//! way cargo reports progress, so `--format json` output on stdout stays
//! machine readable. Report lines (`header`, `kv`, `list_item`) go to stdout.
//!
//! # Example
//!
//! ```rust,ignore
//! use bstage::output::Output;
//!
//! Output::info("Resolving runtime dependencies");
//! let spinner = Output::spinner("Resolving shared libraries...");
//! // ... do work ...
//! spinner.finish_clear();
//! Output::success("Staged crosvm");
//! ```

use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use std::borrow::Cow;
use std::time::Duration;

pub struct Output;

impl Output {
    /// `✓ Staged crosvm`
    pub fn success(msg: impl AsRef<str>) {
        eprintln!("{} {}", "✓".green().bold(), msg.as_ref());
    }

    /// `✗ git: not found on PATH`
    pub fn error(msg: impl AsRef<str>) {
        eprintln!("{} {}", "✗".red().bold(), msg.as_ref().red());
    }

    /// `→ Resolving runtime dependencies`
    pub fn info(msg: impl AsRef<str>) {
        eprintln!("{} {}", "→".cyan(), msg.as_ref().dimmed());
    }

    /// `  • Staged libcap.so.2`
    pub fn step(msg: impl AsRef<str>) {
        eprintln!("  {} {}", "•".cyan(), msg.as_ref());
    }

    /// Indented suggestion under a failure.
    pub fn hint(msg: impl AsRef<str>) {
        eprintln!("  {} {}", "→".cyan(), msg.as_ref());
    }

    pub fn header(msg: impl AsRef<str>) {
        println!("\n{}\n", msg.as_ref().bold().cyan());
    }

    pub fn list_item(msg: impl AsRef<str>) {
        println!("  {}", msg.as_ref());
    }

    /// `  Cache key:     4f1c...`
    pub fn kv(key: impl AsRef<str>, value: impl AsRef<str>) {
        println!("  {:<14} {}", format!("{}:", key.as_ref()).cyan(), value.as_ref());
    }

    pub fn blank() {
        println!();
    }

    /// A spinner for steps whose output is captured rather than streamed.
    pub fn spinner(msg: impl Into<Cow<'static, str>>) -> Spinner {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(msg);
        pb.enable_steady_tick(Duration::from_millis(80));
        Spinner(pb)
    }
}

/// Created via [`Output::spinner`].
pub struct Spinner(ProgressBar);

impl Spinner {
    pub fn set_message(&self, msg: impl Into<Cow<'static, str>>) {
        self.0.set_message(msg);
    }

    /// Finish and clear the line (no final message).
    pub fn finish_clear(self) {
        self.0.finish_and_clear();
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        // A spinner abandoned by `?` must not keep ticking over error output.
        if !self.0.is_finished() {
            self.0.finish_and_clear();
        }
    }
}
