//! External command-line tools driven through `tokio::process`.

use std::process::Output;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::debug;

use crate::error::KeelError;

/// A binary plus the environment it always runs with.
#[derive(Debug, Clone)]
pub struct Tool {
    binary: String,
    env: Vec<(String, String)>,
}

impl Tool {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run and return stdout, failing with the combined output on a
    /// non-zero exit.
    pub async fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<String> {
        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        debug!(binary = %self.binary, args = ?args, "Running tool");

        let output = Command::new(&self.binary)
            .args(&args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.binary))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(KeelError::Tool {
                command: format!("{} {}", self.binary, args.join(" ")),
                output: combined_output(&output),
            }
            .into())
        }
    }
}

fn combined_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    [stdout.trim(), stderr.trim()]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_is_an_error() {
        let err = Tool::new("keel-no-such-binary")
            .run(&["--version"])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("keel-no-such-binary"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failure_reports_command_and_output() {
        let err = Tool::new("sh")
            .run(&["-c", "echo out; echo err >&2; exit 3"])
            .await
            .unwrap_err();
        match err.downcast_ref::<KeelError>() {
            Some(KeelError::Tool { command, output }) => {
                assert!(command.starts_with("sh -c"));
                assert_eq!(output, "out\nerr");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_is_passed() {
        let out = Tool::new("sh")
            .with_env("KEEL_TEST_VALUE", "42")
            .run(&["-c", "echo $KEEL_TEST_VALUE"])
            .await
            .unwrap();
        assert_eq!(out, "42");
    }
}
