//! Manifest generation from chart checkouts and release indexes.
//!
//! A manifest is produced from one of three sources, all normalizing into
//! the same shape:
//!
//! - a chart checkout (local directory or a remote git ref), read through a
//!   [`ResourceFetcher`]
//! - a published release, whose `manifest.yaml` asset is downloaded through a
//!   [`ReleaseIndex`]
//! - an airgap bundle (decoded by the bundle codec with
//!   [`InstallationManifest::from_yaml_bytes`])

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::GenerateError;
use crate::manifest::{
    ChartRef, InstallationManifest, MachineImages, ManifestImages, APP_VERSION,
    INSTALLER_VERSION, MANIFEST_SCHEMA_VERSION,
};
use crate::version::Version;

/// Prefix of release tags that carry a manifest asset.
pub const MANIFEST_TAG_PREFIX: &str = "manifest-";

/// Prefix of release tags that pin an application chart version.
pub const APP_TAG_PREFIX: &str = "keel-";

/// Name of the manifest asset attached to manifest releases.
pub const MANIFEST_ASSET: &str = "manifest.yaml";

/// Application image list shipped at the root of the chart checkout.
pub const IMAGES_FILE: &str = "images.txt";

/// Reads files from a chart checkout.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// Fetch a file by path relative to the checkout root.
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, GenerateError>;
}

/// A chart checkout on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalCheckout {
    root: PathBuf,
}

impl LocalCheckout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the chart sources.
    pub fn charts_dir(&self) -> PathBuf {
        self.root.join("charts")
    }
}

#[async_trait]
impl ResourceFetcher for LocalCheckout {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, GenerateError> {
        let full = self.root.join(path);
        tokio::fs::read(&full)
            .await
            .map_err(|e| GenerateError::Fetch {
                resource: full.display().to_string(),
                message: e.to_string(),
            })
    }
}

/// A chart checkout at a git ref, read through a raw-content HTTP endpoint.
#[derive(Debug, Clone)]
pub struct RemoteCharts {
    client: reqwest::Client,
    base_url: String,
    git_ref: String,
}

impl RemoteCharts {
    /// `base_url` is the raw-content root of the repository, e.g.
    /// `https://raw.githubusercontent.com/keel-dev/keel-helm-charts`.
    pub fn new(client: reqwest::Client, base_url: &str, git_ref: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            git_ref: git_ref.to_string(),
        }
    }
}

#[async_trait]
impl ResourceFetcher for RemoteCharts {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, GenerateError> {
        let url = format!("{}/{}/{}", self.base_url, self.git_ref, path);
        debug!(url = %url, "Fetching chart resource");
        let response = self.client.get(&url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// Opens the chart checkout at a git ref.
pub trait ChartSources: Send + Sync {
    fn at(&self, git_ref: &str) -> Box<dyn ResourceFetcher>;
}

/// [`ChartSources`] over a raw-content HTTP root.
#[derive(Debug, Clone)]
pub struct RawContent {
    client: reqwest::Client,
    base_url: String,
}

impl RawContent {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
        }
    }
}

impl ChartSources for RawContent {
    fn at(&self, git_ref: &str) -> Box<dyn ResourceFetcher> {
        Box::new(RemoteCharts::new(self.client.clone(), &self.base_url, git_ref))
    }
}

/// Chart versions pinned when generating from a release. Unset fields
/// follow the newest release.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChartVersions {
    pub app: Option<String>,
    pub infra: Option<String>,
}

/// Lists published releases and downloads their assets.
#[async_trait]
pub trait ReleaseIndex: Send + Sync {
    /// Release tags, newest first.
    async fn list_tags(&self) -> Result<Vec<String>, GenerateError>;

    /// Download a named asset of a release.
    async fn download_asset(&self, tag: &str, name: &str) -> Result<Vec<u8>, GenerateError>;
}

/// Release index backed by the GitHub releases API.
#[derive(Debug, Clone)]
pub struct GithubReleases {
    client: reqwest::Client,
    api_base: String,
    download_base: String,
    repo: String,
}

#[derive(Deserialize)]
struct ReleaseEntry {
    tag_name: String,
}

impl GithubReleases {
    /// `repo` is `owner/name`.
    pub fn new(api_base: &str, download_base: &str, repo: &str) -> Result<Self, GenerateError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("keel/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            download_base: download_base.trim_end_matches('/').to_string(),
            repo: repo.to_string(),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

#[async_trait]
impl ReleaseIndex for GithubReleases {
    async fn list_tags(&self) -> Result<Vec<String>, GenerateError> {
        let url = format!("{}/repos/{}/releases?per_page=50", self.api_base, self.repo);
        let releases: Vec<ReleaseEntry> = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(releases.into_iter().map(|r| r.tag_name).collect())
    }

    async fn download_asset(&self, tag: &str, name: &str) -> Result<Vec<u8>, GenerateError> {
        let url = format!(
            "{}/{}/releases/download/{}/{}",
            self.download_base, self.repo, tag, name
        );
        debug!(url = %url, "Downloading release asset");
        let response = self.client.get(&url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// Version carried by a tag like `prefix1.2.3`, if the tag has that shape.
fn tag_version(tag: &str, prefix: &str) -> Option<Version> {
    let rest = tag.strip_prefix(prefix)?;
    if !rest.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    Version::parse(rest).ok()
}

/// Newest tag of the form `prefix<MAJOR>.<MINOR>.<PATCH>`.
pub fn find_latest_tag<'a, I>(tags: I, prefix: &str) -> Option<String>
where
    I: IntoIterator<Item = &'a String>,
{
    tags.into_iter()
        .filter_map(|tag| tag_version(tag, prefix).map(|v| (v.triple(), tag)))
        .max_by_key(|(triple, _)| *triple)
        .map(|(_, tag)| tag.clone())
}

/// The chart version embedded in a release tag: everything from the first
/// `MAJOR.MINOR.PATCH` onward (`keel-1.0.357-extra.0` -> `1.0.357-extra.0`).
pub fn chart_version_from_tag(tag: &str) -> Option<String> {
    (0..tag.len())
        .filter(|&i| tag.is_char_boundary(i))
        .find(|&i| {
            tag[i..].starts_with(|c: char| c.is_ascii_digit())
                && (i == 0 || !tag.as_bytes()[i - 1].is_ascii_digit())
                && Version::parse(&tag[i..]).is_ok()
        })
        .map(|i| tag[i..].to_string())
}

/// Non-empty, trimmed lines of an image list.
pub fn parse_images_text(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[derive(Deserialize)]
struct ChartDescriptor {
    version: String,
}

/// The `version` field of a `Chart.yaml` document.
pub fn chart_version_from_chart_yaml(bytes: &[u8]) -> Result<String, GenerateError> {
    let descriptor: ChartDescriptor = serde_yaml::from_slice(bytes)
        .map_err(|e| GenerateError::NoVersion(format!("Chart.yaml: {e}")))?;
    Ok(descriptor.version)
}

/// Fixed parts of every generated manifest.
#[derive(Debug, Clone)]
pub struct ManifestBlueprint {
    pub machine: MachineImages,
    pub cluster_images: Vec<String>,
    pub cluster_gpu_images: Vec<String>,
    pub chart_repo_url: String,
    pub app_chart_name: String,
    pub infra_chart_name: String,
}

impl Default for ManifestBlueprint {
    fn default() -> Self {
        let cluster_images: Vec<String> = [
            "docker.io/rancher/klipper-helm:v0.7.7-build20230403",
            "docker.io/rancher/local-path-provisioner:v0.0.24",
            "docker.io/rancher/mirrored-coredns-coredns:1.10.1",
            "docker.io/rancher/mirrored-library-busybox:1.34.1",
            "docker.io/rancher/mirrored-metrics-server:v0.6.2",
            "docker.io/rancher/mirrored-pause:3.6",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();

        let mut cluster_gpu_images = cluster_images.clone();
        cluster_gpu_images.push("nvcr.io/nvidia/k8s-device-plugin:v0.14.1".to_string());

        Self {
            machine: MachineImages {
                node: "docker.io/rancher/k3s:v1.26.4-k3s1".to_string(),
                node_gpu: "ghcr.io/keel-dev/k3s-gpu:v1.26.4-k3s1-cuda".to_string(),
                tools: "ghcr.io/k3d-io/k3d-tools:5.5.1".to_string(),
                registry: "docker.io/library/registry:2".to_string(),
                env_probe: "docker.io/library/alpine:3.18.3".to_string(),
            },
            cluster_images,
            cluster_gpu_images,
            chart_repo_url: "https://charts.keel.dev".to_string(),
            app_chart_name: "keel".to_string(),
            infra_chart_name: "keel-infra".to_string(),
        }
    }
}

/// Produces manifests from a [`ManifestBlueprint`].
#[derive(Debug, Clone, Default)]
pub struct ManifestGenerator {
    blueprint: ManifestBlueprint,
}

impl ManifestGenerator {
    pub fn new(blueprint: ManifestBlueprint) -> Self {
        Self { blueprint }
    }

    /// Assemble a manifest stamped with this installer's version.
    pub fn build(
        &self,
        repo_url: &str,
        app_version: &str,
        infra_version: &str,
        app_images: Vec<String>,
        tag: Option<String>,
    ) -> InstallationManifest {
        let bp = &self.blueprint;
        InstallationManifest {
            version: MANIFEST_SCHEMA_VERSION.to_string(),
            installer_version: INSTALLER_VERSION.to_string(),
            app_version: APP_VERSION.to_string(),
            images: ManifestImages {
                machine: bp.machine.clone(),
                cluster_images: bp.cluster_images.clone(),
                cluster_gpu_images: bp.cluster_gpu_images.clone(),
                app_images,
            },
            tag,
            app_chart: ChartRef {
                version: app_version.to_string(),
                repo_url: repo_url.to_string(),
                chart_name: bp.app_chart_name.clone(),
                release_name: bp.app_chart_name.clone(),
            },
            infra_chart: ChartRef {
                version: infra_version.to_string(),
                repo_url: repo_url.to_string(),
                chart_name: bp.infra_chart_name.clone(),
                release_name: bp.infra_chart_name.clone(),
            },
        }
    }

    /// Generate from a chart checkout. Chart versions come from each
    /// chart's `Chart.yaml`, application images from `images.txt`.
    ///
    /// `repo_url` is recorded in the chart references; pass the checkout's
    /// charts directory for local installs.
    pub async fn from_checkout(
        &self,
        fetcher: &dyn ResourceFetcher,
        repo_url: &str,
    ) -> Result<InstallationManifest, GenerateError> {
        let bp = &self.blueprint;
        let app_version = chart_version_from_chart_yaml(
            &fetcher
                .fetch(&format!("charts/{}/Chart.yaml", bp.app_chart_name))
                .await?,
        )?;
        let infra_version = chart_version_from_chart_yaml(
            &fetcher
                .fetch(&format!("charts/{}/Chart.yaml", bp.infra_chart_name))
                .await?,
        )?;
        let app_images = parse_images_text(&fetcher.fetch(IMAGES_FILE).await?);

        info!(
            app_version = %app_version,
            infra_version = %infra_version,
            images = app_images.len(),
            "Generated manifest from chart checkout"
        );
        Ok(self.build(repo_url, &app_version, &infra_version, app_images, None))
    }

    /// Generate from the chart checkout at an application release tag.
    ///
    /// The tag is `keel-<versions.app>`, or the newest `keel-` tag when no
    /// application version is pinned. A pinned infrastructure version
    /// replaces the one in the checkout's `Chart.yaml`.
    pub async fn from_app_release(
        &self,
        index: &dyn ReleaseIndex,
        sources: &dyn ChartSources,
        versions: &ChartVersions,
    ) -> Result<InstallationManifest, GenerateError> {
        let tag = match versions.app.as_deref() {
            Some(version) => app_release_tag(version)?,
            None => {
                let tags = index.list_tags().await?;
                find_latest_tag(&tags, APP_TAG_PREFIX).ok_or_else(|| {
                    GenerateError::NoMatchingTag {
                        prefix: APP_TAG_PREFIX.to_string(),
                    }
                })?
            }
        };

        let fetcher = sources.at(&tag);
        let mut manifest = self
            .from_checkout(fetcher.as_ref(), &self.blueprint.chart_repo_url)
            .await?;
        if Some(&manifest.app_chart.version) != chart_version_from_tag(&tag).as_ref() {
            debug!(tag = %tag, chart = %manifest.app_chart.version, "Chart version differs from tag");
        }
        if let Some(infra) = versions.infra.as_deref() {
            let infra = infra.trim().trim_start_matches('v');
            Version::parse(infra).map_err(|_| GenerateError::NoVersion(infra.to_string()))?;
            manifest.infra_chart.version = infra.to_string();
        }
        info!(tag = %tag, infra_version = %manifest.infra_chart.version, "Generated manifest from release");
        Ok(manifest)
    }
}

/// `keel-<version>` for a bare or `v`-prefixed chart version.
fn app_release_tag(version: &str) -> Result<String, GenerateError> {
    let version = version.trim();
    if version.starts_with(APP_TAG_PREFIX) {
        return Ok(version.to_string());
    }
    let version = version.trim_start_matches('v');
    Version::parse(version).map_err(|_| GenerateError::NoVersion(version.to_string()))?;
    Ok(format!("{APP_TAG_PREFIX}{version}"))
}

/// Newest published manifest tag.
pub async fn latest_manifest_tag(index: &dyn ReleaseIndex) -> Result<String, GenerateError> {
    let tags = index.list_tags().await?;
    find_latest_tag(&tags, MANIFEST_TAG_PREFIX).ok_or_else(|| GenerateError::NoMatchingTag {
        prefix: MANIFEST_TAG_PREFIX.to_string(),
    })
}

/// Download and validate the manifest published under `tag`.
pub async fn manifest_for_tag(
    index: &dyn ReleaseIndex,
    tag: &str,
) -> Result<InstallationManifest, GenerateError> {
    let bytes = index.download_asset(tag, MANIFEST_ASSET).await?;
    let mut manifest = InstallationManifest::from_yaml_bytes(&bytes)?;
    if manifest.tag.is_none() {
        manifest.tag = Some(tag.to_string());
    }
    info!(tag = %tag, app_chart = %manifest.app_chart.version, "Loaded release manifest");
    Ok(manifest)
}
