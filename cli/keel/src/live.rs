//! Live cluster views for the reconciler.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use keel_reconcile::{ClusterObserver, ReleaseObserver};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::info;

use crate::charts::ChartDeployer;
use crate::cluster::ClusterManager;

/// Kubeconfig written to a temporary file on first use and reused until
/// the cluster is torn down.
#[derive(Debug, Default)]
pub struct KubeAccess {
    file: Mutex<Option<Arc<NamedTempFile>>>,
}

/// Keeps the kubeconfig file alive while a path to it is in use.
#[derive(Debug, Clone)]
pub struct Kubeconfig(Arc<NamedTempFile>);

impl Kubeconfig {
    pub fn path(&self) -> PathBuf {
        self.0.path().to_path_buf()
    }
}

impl KubeAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, cluster: &dyn ClusterManager) -> Result<Kubeconfig> {
        let mut guard = self.file.lock().await;
        if let Some(file) = guard.as_ref() {
            return Ok(Kubeconfig(Arc::clone(file)));
        }

        let contents = cluster.kubeconfig().await?;
        let file = NamedTempFile::new().context("failed to create kubeconfig file")?;
        std::fs::write(file.path(), contents).context("failed to write kubeconfig")?;
        let file = Arc::new(file);
        *guard = Some(Arc::clone(&file));
        Ok(Kubeconfig(file))
    }

    /// Forget the cached kubeconfig after the cluster is deleted.
    pub async fn reset(&self) {
        self.file.lock().await.take();
    }
}

/// [`ClusterObserver`] and [`ReleaseObserver`] over the live collaborators.
pub struct LiveCluster<'a> {
    pub cluster: &'a dyn ClusterManager,
    pub charts: &'a dyn ChartDeployer,
    pub kube: &'a KubeAccess,
}

#[async_trait]
impl ClusterObserver for LiveCluster<'_> {
    async fn exists(&self) -> Result<bool> {
        self.cluster.exists().await
    }

    async fn ensure_running(&self) -> Result<()> {
        if self.cluster.is_running().await? {
            return Ok(());
        }
        info!("Cluster is stopped, starting it");
        self.cluster.start().await?;
        if !self.cluster.is_running().await? {
            bail!("cluster did not reach a running state");
        }
        Ok(())
    }
}

#[async_trait]
impl ReleaseObserver for LiveCluster<'_> {
    async fn release_version(&self, release: &str) -> Result<Option<String>> {
        let kubeconfig = self.kube.get(self.cluster).await?;
        self.charts
            .release_version(&kubeconfig.path(), release)
            .await
    }
}
