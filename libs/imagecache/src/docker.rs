//! [`ContainerRuntime`] backed by the `docker` CLI.

use std::path::Path;
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::RuntimeError;
use crate::reference::ImageRef;
use crate::runtime::ContainerRuntime;

/// Drives the local docker daemon through its CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl DockerCli {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use another docker-compatible binary.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Output, RuntimeError> {
        debug!(binary = %self.binary, args = ?args, "Running container runtime command");
        Ok(Command::new(&self.binary).args(args).output().await?)
    }

    async fn run_checked(&self, args: &[&str]) -> Result<String, RuntimeError> {
        let output = self.run(args).await?;
        let text = combined_output(&output);
        if output.status.success() {
            Ok(text)
        } else {
            Err(RuntimeError::Command {
                command: format!("{} {}", self.binary, args.join(" ")),
                output: text,
            })
        }
    }
}

fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(stderr.trim());
    }
    text
}

/// Map a failed pull's output onto a [`RuntimeError`].
pub fn classify_pull_failure(image: &str, output: &str) -> RuntimeError {
    let lower = output.to_lowercase();
    let registry = ImageRef::parse(image).registry;
    if lower.contains("toomanyrequests") || lower.contains("rate limit") {
        RuntimeError::RateLimited { registry }
    } else if lower.contains("manifest unknown")
        || lower.contains("not found")
        || lower.contains("does not exist")
    {
        RuntimeError::NotFound {
            image: image.to_string(),
        }
    } else {
        RuntimeError::RegistryUnavailable {
            registry,
            message: output.to_string(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        let output = self.run(&["pull", "--quiet", image]).await?;
        if output.status.success() {
            return Ok(());
        }
        Err(classify_pull_failure(image, &combined_output(&output)))
    }

    async fn tag(&self, source: &str, target: &str) -> Result<(), RuntimeError> {
        self.run_checked(&["tag", source, target]).await.map(|_| ())
    }

    async fn push(&self, image: &str) -> Result<String, RuntimeError> {
        self.run_checked(&["push", image]).await
    }

    async fn list_local(&self) -> Result<Vec<String>, RuntimeError> {
        let listing = self
            .run_checked(&["image", "ls", "--format", "{{.Repository}}:{{.Tag}}"])
            .await?;
        Ok(listing
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.ends_with(":<none>"))
            .map(str::to_string)
            .collect())
    }

    async fn remove(&self, image: &str) -> Result<(), RuntimeError> {
        self.run_checked(&["image", "rm", image]).await.map(|_| ())
    }

    async fn save(&self, images: &[String], dest: &Path) -> Result<(), RuntimeError> {
        let dest = dest.to_string_lossy().to_string();
        let mut args = vec!["save", "--output", dest.as_str()];
        args.extend(images.iter().map(String::as_str));
        self.run_checked(&args).await.map(|_| ())
    }

    async fn load(&self, archive: &Path) -> Result<(), RuntimeError> {
        let archive = archive.to_string_lossy().to_string();
        self.run_checked(&["load", "--input", archive.as_str()])
            .await
            .map(|_| ())
    }
}
