//! Subprocess runner backed by `tokio::process`.

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{CommandRunner, CommandSpec};

/// Runs commands as child processes of this one
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    /// Create a new runner
    pub fn new() -> Self {
        Self
    }

    fn command(spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args).kill_on_drop(true);
        if let Some(ref cwd) = spec.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<bool> {
        debug!(command = %spec, "Running");

        let status = Self::command(spec)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .await
            .with_context(|| format!("Failed to spawn '{}'", spec.program_name()))?;

        debug!(command = %spec, code = ?status.code(), "Finished");
        Ok(status.success())
    }

    async fn run_capture(&self, spec: &CommandSpec) -> Result<String> {
        debug!(command = %spec, "Running (capture)");

        let output = Self::command(spec)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to spawn '{}'", spec.program_name()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "'{}' failed with exit code {}: {}",
                spec,
                exit_code,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8(output.stdout)
            .with_context(|| format!("Output of '{}' is not valid UTF-8", spec.program_name()))?;

        Ok(stdout.trim_end().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_reports_exit_status() {
        let runner = ProcessRunner::new();
        assert!(runner.run(&CommandSpec::new("true")).await.unwrap());
        assert!(!runner.run(&CommandSpec::new("false")).await.unwrap());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_run_discards_stdout() {
        let runner = ProcessRunner::new();
        let spec = CommandSpec::new("sh")
            .arg("-c")
            .arg(r#"[ "$(readlink /proc/$$/fd/1)" = /dev/null ]"#);
        assert!(runner.run(&spec).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_capture_trims_trailing_whitespace() {
        let runner = ProcessRunner::new();
        let out = runner
            .run_capture(&CommandSpec::new("printf").arg("  hello\n\n"))
            .await
            .unwrap();
        assert_eq!(out, "  hello");
    }

    #[tokio::test]
    async fn test_run_capture_respects_cwd() {
        let temp = tempfile::TempDir::new().unwrap();
        let runner = ProcessRunner::new();
        let out = runner
            .run_capture(&CommandSpec::new("pwd").current_dir(temp.path()))
            .await
            .unwrap();
        let expected = temp.path().canonicalize().unwrap();
        assert_eq!(std::path::PathBuf::from(out).canonicalize().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_run_capture_fails_on_nonzero_exit() {
        let runner = ProcessRunner::new();
        assert!(runner.run_capture(&CommandSpec::new("false")).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let runner = ProcessRunner::new();
        let result = runner
            .run(&CommandSpec::new("definitely-not-a-real-tool-sdkmirror"))
            .await;
        assert!(result.is_err());
    }
}
