// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Ephemeral tester runs.
//!
//! A tester executes the tests for one scope and reports pass/fail with
//! diagnostics. [`CommandTester`] runs a configured shell command.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;
#[cfg(feature = "telemetry")]
use tracing::{debug, instrument, warn};

use crate::error::TesterError;

/// Placeholder replaced by the scope hint in a command template.
pub const SCOPE_PLACEHOLDER: &str = "{scope}";

const MAX_DIAGNOSTIC_LINES: usize = 200;

/// Outcome of one tester run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TesterReport {
    pub passed: bool,
    pub diagnostics: String,
}

impl TesterReport {
    pub fn pass(diagnostics: impl Into<String>) -> Self {
        Self {
            passed: true,
            diagnostics: diagnostics.into(),
        }
    }

    pub fn fail(diagnostics: impl Into<String>) -> Self {
        Self {
            passed: false,
            diagnostics: diagnostics.into(),
        }
    }
}

/// Runs the tests of a scope.
#[async_trait]
pub trait TesterAgentRunner: Send + Sync {
    async fn run(&self, scope_hint: &str) -> Result<TesterReport, TesterError>;
}

/// Tester that shells out to a command template such as `cargo test {scope}`.
#[derive(Debug, Clone)]
pub struct CommandTester {
    template: String,
    cwd: PathBuf,
    timeout: Duration,
}

impl CommandTester {
    pub fn new(template: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            template: template.into(),
            cwd: cwd.into(),
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The concrete command line for `scope_hint`.
    pub fn command_for(&self, scope_hint: &str) -> String {
        let scope = if scope_hint.is_empty() { "." } else { scope_hint };
        self.template.replace(SCOPE_PLACEHOLDER, scope)
    }
}

/// Raw result of a finished command.
struct CommandOutput {
    stdout: String,
    stderr: String,
    exit_code: i32,
    duration: Duration,
    timed_out: bool,
}

#[async_trait]
impl TesterAgentRunner for CommandTester {
    #[cfg_attr(feature = "telemetry", instrument(skip(self), fields(command, exit_code)))]
    async fn run(&self, scope_hint: &str) -> Result<TesterReport, TesterError> {
        if self.template.trim().is_empty() {
            return Err(TesterError::NotConfigured(
                "testing.command is empty".to_string(),
            ));
        }

        let command = self.command_for(scope_hint);
        #[cfg(feature = "telemetry")]
        tracing::Span::current().record("command", command.as_str());

        let output = run_command(&command, &self.cwd, self.timeout).await?;

        #[cfg(feature = "telemetry")]
        {
            tracing::Span::current().record("exit_code", output.exit_code);
            if output.timed_out {
                warn!(command = %command, "Tester timed out");
            } else {
                debug!(
                    exit_code = output.exit_code,
                    duration_ms = output.duration.as_millis() as u64,
                    "Tester finished"
                );
            }
        }

        let diagnostics = format_output(&command, &output);
        if output.exit_code == 0 && !output.timed_out {
            Ok(TesterReport::pass(diagnostics))
        } else {
            Ok(TesterReport::fail(diagnostics))
        }
    }
}

async fn run_command(command: &str, cwd: &PathBuf, limit: Duration) -> Result<CommandOutput, TesterError> {
    let start = Instant::now();

    let shell = if cfg!(windows) { "cmd" } else { "sh" };
    let shell_flag = if cfg!(windows) { "/C" } else { "-c" };

    let mut cmd = Command::new(shell);
    cmd.arg(shell_flag)
        .arg(command)
        .current_dir(cwd)
        .kill_on_drop(true)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    match timeout(limit, cmd.output()).await {
        Ok(Ok(output)) => Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
            duration: start.elapsed(),
            timed_out: false,
        }),
        Ok(Err(e)) => Err(TesterError::LaunchFailed(format!("{command}: {e}"))),
        Err(_) => Ok(CommandOutput {
            stdout: String::new(),
            stderr: format!("timed out after {} seconds", limit.as_secs()),
            exit_code: -1,
            duration: start.elapsed(),
            timed_out: true,
        }),
    }
}

fn format_output(command: &str, output: &CommandOutput) -> String {
    let mut parts = vec![format!("$ {command}")];

    if output.timed_out {
        parts.push(format!("timed out after {:.1}s", output.duration.as_secs_f64()));
    }
    if !output.stdout.is_empty() {
        parts.push(truncate_output(&output.stdout, MAX_DIAGNOSTIC_LINES));
    }
    if !output.stderr.is_empty() {
        parts.push(format!(
            "[stderr]\n{}",
            truncate_output(&output.stderr, MAX_DIAGNOSTIC_LINES / 4)
        ));
    }
    if output.exit_code != 0 && !output.timed_out {
        parts.push(format!("[exit code: {}]", output.exit_code));
    }
    parts.join("\n")
}

/// Keep the first and last halves of `max_lines` lines of `output`.
pub fn truncate_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();
    let total = lines.len();
    if total <= max_lines {
        return output.to_string();
    }

    let keep = max_lines / 2;
    let omitted = total - keep * 2;
    format!(
        "{}\n\n... [{omitted} lines omitted] ...\n\n{}",
        lines[..keep].join("\n"),
        lines[total - keep..].join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_command_for_substitutes_scope() {
        let tester = CommandTester::new("cargo test --manifest-path {scope}/Cargo.toml", ".");
        assert_eq!(
            tester.command_for("crates/core"),
            "cargo test --manifest-path crates/core/Cargo.toml"
        );
        assert_eq!(tester.command_for(""), "cargo test --manifest-path ./Cargo.toml");
    }

    #[test]
    fn test_truncate_output_keeps_both_ends() {
        let text: String = (1..=10).map(|i| format!("line{i}\n")).collect();
        let truncated = truncate_output(&text, 4);
        assert!(truncated.starts_with("line1\nline2"));
        assert!(truncated.ends_with("line9\nline10"));
        assert!(truncated.contains("[6 lines omitted]"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_passing_command() {
        let dir = tempdir().unwrap();
        let tester = CommandTester::new("echo checking {scope}", dir.path());
        let report = tester.run("src").await.unwrap();
        assert!(report.passed);
        assert!(report.diagnostics.contains("checking src"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_command() {
        let dir = tempdir().unwrap();
        let tester = CommandTester::new("echo broken >&2; exit 3", dir.path());
        let report = tester.run("src").await.unwrap();
        assert!(!report.passed);
        assert!(report.diagnostics.contains("broken"));
        assert!(report.diagnostics.contains("[exit code: 3]"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_fails_report() {
        let dir = tempdir().unwrap();
        let tester = CommandTester::new("sleep 5", dir.path()).with_timeout(Duration::from_millis(100));
        let report = tester.run("").await.unwrap();
        assert!(!report.passed);
        assert!(report.diagnostics.contains("timed out"));
    }

    #[tokio::test]
    async fn test_empty_template_not_configured() {
        let tester = CommandTester::new("  ", ".");
        assert!(matches!(
            tester.run("src").await,
            Err(TesterError::NotConfigured(_))
        ));
    }
}
