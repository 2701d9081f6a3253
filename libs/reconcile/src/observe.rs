//! Read-only views of the live cluster used by the decision engine.

use anyhow::Result;
use async_trait::async_trait;

/// Reports whether the cluster exists and can run.
#[async_trait]
pub trait ClusterObserver: Send + Sync {
    /// Whether a cluster for this installation exists at all.
    async fn exists(&self) -> Result<bool>;

    /// Start the cluster if it is stopped. Errors when it cannot run.
    async fn ensure_running(&self) -> Result<()>;
}

/// Reports the chart version of deployed releases.
#[async_trait]
pub trait ReleaseObserver: Send + Sync {
    /// Chart version of the named release, or `None` if it is not deployed.
    async fn release_version(&self, release: &str) -> Result<Option<String>>;
}
