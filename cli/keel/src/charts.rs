//! Helm chart releases.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use keel_airgap::{package_chart_dir, ChartArchive};
use keel_manifest::generate::chart_version_from_tag;
use keel_manifest::ChartRef;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::tool::Tool;

const RELEASE_TIMEOUT: &str = "20m";

/// Chart deployer operations. `kubeconfig` is the path of a kubeconfig
/// file for the target cluster.
#[async_trait]
pub trait ChartDeployer: Send + Sync {
    /// Chart version of the deployed release, or `None` if absent.
    async fn release_version(&self, kubeconfig: &Path, release: &str) -> Result<Option<String>>;

    async fn release_exists(&self, kubeconfig: &Path, release: &str) -> Result<bool> {
        Ok(self.release_version(kubeconfig, release).await?.is_some())
    }

    async fn install(
        &self,
        kubeconfig: &Path,
        release: &str,
        chart: &ChartArchive,
        values: &Path,
    ) -> Result<()>;

    async fn upgrade(
        &self,
        kubeconfig: &Path,
        release: &str,
        chart: &ChartArchive,
        values: &Path,
    ) -> Result<()>;

    /// Fetch the referenced chart as an archive inside `dest_dir`.
    async fn fetch(&self, chart: &ChartRef, dest_dir: &Path) -> Result<ChartArchive>;
}

#[derive(Deserialize)]
struct ReleaseListing {
    name: String,
    /// `<chart>-<version>`
    chart: String,
}

/// [`ChartDeployer`] backed by the `helm` CLI.
#[derive(Debug, Clone)]
pub struct HelmCli {
    helm: Tool,
    namespace: String,
}

impl HelmCli {
    pub fn new(namespace: &str) -> Self {
        Self {
            helm: Tool::new("helm"),
            namespace: namespace.to_string(),
        }
    }

    async fn release(
        &self,
        action: &str,
        kubeconfig: &Path,
        release: &str,
        chart: &ChartArchive,
        values: &Path,
    ) -> Result<()> {
        info!(release, chart = %chart.name, version = %chart.version, action, "Releasing chart");
        let kubeconfig = kubeconfig.display().to_string();
        let chart_path = chart.path.display().to_string();
        let values = values.display().to_string();
        self.helm
            .run(&[
                action,
                release,
                chart_path.as_str(),
                "--kubeconfig",
                kubeconfig.as_str(),
                "--namespace",
                self.namespace.as_str(),
                "--create-namespace",
                "--values",
                values.as_str(),
                "--wait",
                "--timeout",
                RELEASE_TIMEOUT,
            ])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ChartDeployer for HelmCli {
    async fn release_version(&self, kubeconfig: &Path, release: &str) -> Result<Option<String>> {
        let kubeconfig = kubeconfig.display().to_string();
        let filter = format!("^{release}$");
        let out = self
            .helm
            .run(&[
                "list",
                "--kubeconfig",
                kubeconfig.as_str(),
                "--namespace",
                self.namespace.as_str(),
                "--all",
                "--filter",
                filter.as_str(),
                "-o",
                "json",
            ])
            .await?;
        let releases: Vec<ReleaseListing> =
            serde_json::from_str(&out).context("failed to parse helm release list")?;
        Ok(releases
            .into_iter()
            .find(|r| r.name == release)
            .and_then(|r| chart_version_from_tag(&r.chart)))
    }

    async fn install(
        &self,
        kubeconfig: &Path,
        release: &str,
        chart: &ChartArchive,
        values: &Path,
    ) -> Result<()> {
        self.release("install", kubeconfig, release, chart, values)
            .await
    }

    async fn upgrade(
        &self,
        kubeconfig: &Path,
        release: &str,
        chart: &ChartArchive,
        values: &Path,
    ) -> Result<()> {
        self.release("upgrade", kubeconfig, release, chart, values)
            .await
    }

    async fn fetch(&self, chart: &ChartRef, dest_dir: &Path) -> Result<ChartArchive> {
        if chart.is_local() {
            return package_local(chart, dest_dir);
        }

        info!(chart = %chart.chart_name, version = %chart.version, repo = %chart.repo_url, "Pulling chart");
        let dest = dest_dir.display().to_string();
        self.helm
            .run(&[
                "pull",
                chart.chart_name.as_str(),
                "--repo",
                chart.repo_url.as_str(),
                "--version",
                chart.version.as_str(),
                "--destination",
                dest.as_str(),
            ])
            .await?;
        Ok(ChartArchive::open(
            dest_dir.join(format!("{}-{}.tgz", chart.chart_name, chart.version)),
        )?)
    }
}

/// Package a chart referenced by a local charts directory.
pub fn package_local(chart: &ChartRef, dest_dir: &Path) -> Result<ChartArchive> {
    let source = Path::new(&chart.repo_url).join(&chart.chart_name);
    let dest = dest_dir.join(format!("{}.tgz", chart.chart_name));
    info!(chart = %chart.chart_name, source = %source.display(), "Packaging local chart");
    package_chart_dir(&source, &dest)
        .with_context(|| format!("failed to package chart {}", source.display()))
}

/// Write chart values as YAML into `dir/<name>.yaml`.
pub fn write_values<T: Serialize>(values: &T, dir: &Path, name: &str) -> Result<PathBuf> {
    let path = dir.join(format!("{name}.yaml"));
    let yaml = serde_yaml::to_string(values).context("failed to encode chart values")?;
    std::fs::write(&path, yaml).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use keel_manifest::InfraChartParams;

    use super::*;

    #[test]
    fn test_package_local_chart() {
        let tmp = tempfile::tempdir().unwrap();
        let charts = tmp.path().join("charts");
        std::fs::create_dir_all(charts.join("keel-infra")).unwrap();
        std::fs::write(
            charts.join("keel-infra").join("Chart.yaml"),
            "apiVersion: v2\nname: keel-infra\nversion: 0.2.0\n",
        )
        .unwrap();

        let chart = ChartRef {
            version: "0.2.0".to_string(),
            repo_url: charts.display().to_string(),
            chart_name: "keel-infra".to_string(),
            release_name: "keel-infra".to_string(),
        };
        let archive = package_local(&chart, tmp.path()).unwrap();
        assert_eq!(archive.version, "0.2.0");
        assert_eq!(archive.path, tmp.path().join("keel-infra.tgz"));
    }

    #[test]
    fn test_write_values_uses_camel_case() {
        let tmp = tempfile::tempdir().unwrap();
        let params = keel_manifest::InstallationParams {
            gpu: keel_manifest::GpuSelection::All,
            ..Default::default()
        };
        let values: InfraChartParams = params.infra_chart_params();
        let path = write_values(&values, tmp.path(), "infra-values").unwrap();

        let written: serde_yaml::Value =
            serde_yaml::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written["nvidiaGpu"]["enabled"].as_bool(), Some(true));
        assert_eq!(written["nvidiaGpu"]["visibleDevices"].as_str(), Some("all"));
    }
}
