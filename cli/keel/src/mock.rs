//! In-memory collaborators for tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Result};
use async_trait::async_trait;
use keel_airgap::{package_chart_dir, ChartArchive};
use keel_manifest::{ChartRef, RegistryParams};

use crate::charts::ChartDeployer;
use crate::cluster::{ClusterManager, ClusterSpec};

#[derive(Debug, Default)]
struct ClusterState {
    exists: bool,
    running: bool,
    registry: bool,
    created: Vec<ClusterSpec>,
    registries_created: Vec<String>,
    deleted: u32,
    starts: u32,
    /// Mutating calls in order.
    operations: Vec<&'static str>,
}

/// Mock cluster manager.
#[derive(Debug, Default)]
pub struct MockCluster {
    state: Mutex<ClusterState>,
    unstartable: bool,
    fail_create: AtomicBool,
    /// Releases that live inside the cluster and go away with it.
    charts: Option<Arc<MockCharts>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a stopped cluster already present.
    pub fn with_cluster(self) -> Self {
        self.lock().exists = true;
        self
    }

    /// Start with the local registry already present.
    pub fn with_registry(self) -> Self {
        self.lock().registry = true;
        self
    }

    /// Starting the cluster never succeeds.
    pub fn unstartable(mut self) -> Self {
        self.unstartable = true;
        self
    }

    /// Deleting the cluster also drops the releases recorded in `charts`.
    pub fn hosting(mut self, charts: Arc<MockCharts>) -> Self {
        self.charts = Some(charts);
        self
    }

    /// Every later `create` fails.
    pub fn fail_creates(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn created(&self) -> Vec<ClusterSpec> {
        self.lock().created.clone()
    }

    pub fn deleted(&self) -> u32 {
        self.lock().deleted
    }

    pub fn starts(&self) -> u32 {
        self.lock().starts
    }

    pub fn has_cluster(&self) -> bool {
        self.lock().exists
    }

    pub fn has_registry(&self) -> bool {
        self.lock().registry
    }

    pub fn registries_created(&self) -> Vec<String> {
        self.lock().registries_created.clone()
    }

    pub fn operations(&self) -> Vec<&'static str> {
        self.lock().operations.clone()
    }
}

#[async_trait]
impl ClusterManager for MockCluster {
    async fn exists(&self) -> Result<bool> {
        Ok(self.lock().exists)
    }

    async fn is_running(&self) -> Result<bool> {
        let state = self.lock();
        Ok(state.exists && state.running)
    }

    async fn start(&self) -> Result<()> {
        let mut state = self.lock();
        state.starts += 1;
        state.operations.push("start");
        if !state.exists {
            bail!("no cluster to start");
        }
        if self.unstartable {
            bail!("server container exited");
        }
        state.running = true;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.lock();
        state.operations.push("stop");
        state.running = false;
        Ok(())
    }

    async fn create(&self, spec: &ClusterSpec) -> Result<()> {
        let mut state = self.lock();
        state.operations.push("create");
        if self.fail_create.load(Ordering::SeqCst) {
            bail!("cluster create failed");
        }
        state.exists = true;
        state.running = true;
        state.created.push(spec.clone());
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        {
            let mut state = self.lock();
            state.operations.push("delete");
            state.exists = false;
            state.running = false;
            state.deleted += 1;
        }
        if let Some(charts) = &self.charts {
            charts.clear_releases();
        }
        Ok(())
    }

    async fn kubeconfig(&self) -> Result<String> {
        if !self.lock().exists {
            bail!("no cluster");
        }
        Ok("apiVersion: v1\nkind: Config\n".to_string())
    }

    async fn registry_exists(&self) -> Result<bool> {
        Ok(self.lock().registry)
    }

    async fn create_registry(&self, image: &str, _params: &RegistryParams) -> Result<()> {
        let mut state = self.lock();
        state.operations.push("create_registry");
        state.registry = true;
        state.registries_created.push(image.to_string());
        Ok(())
    }

    async fn delete_registry(&self) -> Result<()> {
        let mut state = self.lock();
        state.operations.push("delete_registry");
        state.registry = false;
        Ok(())
    }
}

/// A recorded install or upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartRelease {
    pub release: String,
    pub version: String,
    /// Contents of the values file.
    pub values: String,
}

#[derive(Debug, Default)]
struct ChartState {
    /// release -> chart version
    releases: HashMap<String, String>,
    installs: Vec<ChartRelease>,
    upgrades: Vec<ChartRelease>,
    fetched: Vec<String>,
}

/// Mock chart deployer. Fetching packages a generated chart carrying the
/// referenced version.
#[derive(Debug, Default)]
pub struct MockCharts {
    state: Mutex<ChartState>,
}

impl MockCharts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with `release` deployed at `version`.
    pub fn with_release(self, release: &str, version: &str) -> Self {
        self.lock()
            .releases
            .insert(release.to_string(), version.to_string());
        self
    }

    fn lock(&self) -> MutexGuard<'_, ChartState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn installs(&self) -> Vec<ChartRelease> {
        self.lock().installs.clone()
    }

    pub fn upgrades(&self) -> Vec<ChartRelease> {
        self.lock().upgrades.clone()
    }

    pub fn fetched(&self) -> Vec<String> {
        self.lock().fetched.clone()
    }

    pub fn deployed(&self, release: &str) -> Option<String> {
        self.lock().releases.get(release).cloned()
    }

    /// Drop every release, as deleting the cluster does.
    pub fn clear_releases(&self) {
        self.lock().releases.clear();
    }

    fn record(&self, release: &str, chart: &ChartArchive, values: &Path) -> Result<ChartRelease> {
        let opened = ChartArchive::open(&chart.path)?;
        let record = ChartRelease {
            release: release.to_string(),
            version: opened.version,
            values: std::fs::read_to_string(values)?,
        };
        self.lock()
            .releases
            .insert(release.to_string(), record.version.clone());
        Ok(record)
    }
}

#[async_trait]
impl ChartDeployer for MockCharts {
    async fn release_version(&self, _kubeconfig: &Path, release: &str) -> Result<Option<String>> {
        Ok(self.lock().releases.get(release).cloned())
    }

    async fn install(
        &self,
        _kubeconfig: &Path,
        release: &str,
        chart: &ChartArchive,
        values: &Path,
    ) -> Result<()> {
        if self.lock().releases.contains_key(release) {
            bail!("cannot re-use a name that is still in use: {release}");
        }
        let record = self.record(release, chart, values)?;
        self.lock().installs.push(record);
        Ok(())
    }

    async fn upgrade(
        &self,
        _kubeconfig: &Path,
        release: &str,
        chart: &ChartArchive,
        values: &Path,
    ) -> Result<()> {
        if !self.lock().releases.contains_key(release) {
            bail!("release {release} has no deployed releases");
        }
        let record = self.record(release, chart, values)?;
        self.lock().upgrades.push(record);
        Ok(())
    }

    async fn fetch(&self, chart: &ChartRef, dest_dir: &Path) -> Result<ChartArchive> {
        let source = dest_dir.join("sources").join(&chart.chart_name);
        std::fs::create_dir_all(&source)?;
        std::fs::write(
            source.join("Chart.yaml"),
            format!(
                "apiVersion: v2\nname: {}\nversion: {}\n",
                chart.chart_name, chart.version
            ),
        )?;
        let archive = package_chart_dir(&source, &dest_dir.join(format!("{}.tgz", chart.chart_name)))?;
        self.lock().fetched.push(chart.chart_name.clone());
        Ok(archive)
    }
}
