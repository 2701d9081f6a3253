//! Installer flows against in-memory collaborators.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel::config::Config;
use keel::context::CommandContext;
use keel::flow::{Collaborators, InstallRequest, Installer};
use keel::mock::{MockCharts, MockCluster};
use keel::prompt::ScriptedPrompter;
use keel::source::{InstallSource, ManifestSource};
use keel::KeelError;
use keel_airgap::BundleError;
use keel_imagecache::{CoordinatorConfig, MockRuntime, Platform};
use keel_manifest::generate::{
    ChartSources, ChartVersions, LocalCheckout, ManifestGenerator, ReleaseIndex, ResourceFetcher,
};
use keel_manifest::{GenerateError, GpuSelection, ImageCachingMethod, ParamsOverrides};
use keel_reconcile::ReconcileError;

struct FakeIndex {
    manifests: HashMap<String, String>,
}

impl FakeIndex {
    fn new(releases: &[(&str, &str)]) -> Self {
        let generator = ManifestGenerator::default();
        let manifests = releases
            .iter()
            .map(|(tag, version)| {
                let manifest = generator.build(
                    "https://charts.keel.dev",
                    version,
                    "0.1.9",
                    vec![format!("ghcr.io/keel-dev/app:{version}")],
                    Some(tag.to_string()),
                );
                (tag.to_string(), manifest.to_yaml().unwrap())
            })
            .collect();
        Self { manifests }
    }
}

#[async_trait]
impl ReleaseIndex for FakeIndex {
    async fn list_tags(&self) -> Result<Vec<String>, GenerateError> {
        let mut tags: Vec<String> = self.manifests.keys().cloned().collect();
        tags.extend(["keel-1.0.11".to_string(), "keel-1.0.12".to_string()]);
        Ok(tags)
    }

    async fn download_asset(&self, tag: &str, _name: &str) -> Result<Vec<u8>, GenerateError> {
        self.manifests
            .get(tag)
            .map(|m| m.clone().into_bytes())
            .ok_or_else(|| GenerateError::Fetch {
                resource: tag.to_string(),
                message: "404".to_string(),
            })
    }
}

/// Chart checkouts kept on disk, one directory per git ref.
struct FakeCheckouts {
    root: PathBuf,
}

impl FakeCheckouts {
    fn new(root: PathBuf) -> Self {
        for (version, infra) in [("1.0.11", "0.1.8"), ("1.0.12", "0.1.9")] {
            let checkout = root.join(format!("keel-{version}"));
            write_checkout(&checkout, version, infra);
        }
        Self { root }
    }
}

impl ChartSources for FakeCheckouts {
    fn at(&self, git_ref: &str) -> Box<dyn ResourceFetcher> {
        Box::new(LocalCheckout::new(self.root.join(git_ref)))
    }
}

fn write_checkout(root: &Path, version: &str, infra: &str) {
    for (chart, chart_version) in [("keel", version), ("keel-infra", infra)] {
        let dir = root.join("charts").join(chart);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("Chart.yaml"),
            format!("apiVersion: v2\nname: {chart}\nversion: {chart_version}\n"),
        )
        .unwrap();
    }
    std::fs::write(root.join("images.txt"), format!("ghcr.io/keel-dev/app:{version}\n")).unwrap();
}

/// One simulated host: cluster, charts and runtime share state across
/// installer runs.
struct Host {
    dir: tempfile::TempDir,
    data_dir: PathBuf,
    cluster: Arc<MockCluster>,
    charts: Arc<MockCharts>,
    runtime: Arc<MockRuntime>,
    index: Arc<FakeIndex>,
    checkouts: Arc<FakeCheckouts>,
}

impl Host {
    fn new() -> Self {
        Self::with_runtime(MockRuntime::new())
    }

    fn with_runtime(runtime: MockRuntime) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let charts = Arc::new(MockCharts::new());
        let checkouts = Arc::new(FakeCheckouts::new(dir.path().join("checkouts")));
        Self {
            data_dir: dir.path().join("keel"),
            dir,
            cluster: Arc::new(MockCluster::new().hosting(Arc::clone(&charts))),
            charts,
            runtime: Arc::new(runtime),
            index: Arc::new(FakeIndex::new(&[
                ("manifest-0.9.0", "0.9.0"),
                ("manifest-1.0.10", "1.0.10"),
                ("manifest-1.0.11", "1.0.11"),
                ("manifest-1.0.12", "1.0.12"),
            ])),
            checkouts,
        }
    }

    fn config(&self) -> Config {
        let data_dir = self.data_dir.display().to_string();
        Config::from_lookup(|key| (key == "KEEL_DATA_DIR").then(|| data_dir.clone()))
    }

    fn installer(&self, command: &'static str, prompter: ScriptedPrompter) -> Installer {
        self.installer_asking(command, Arc::new(prompter))
    }

    fn installer_asking(&self, command: &'static str, prompter: Arc<ScriptedPrompter>) -> Installer {
        let collab = Collaborators {
            cluster: self.cluster.clone(),
            charts: self.charts.clone(),
            runtime: self.runtime.clone(),
            catalog: self.runtime.clone(),
            index: self.index.clone(),
            checkouts: self.checkouts.clone(),
        };
        let ctx = CommandContext::new(command, self.config(), prompter);
        Installer::new(ctx, collab)
            .with_platform(Platform::Linux)
            .with_cache_config(CoordinatorConfig {
                pull_backoff: Duration::from_millis(1),
                push_backoff: Duration::from_millis(1),
                ..CoordinatorConfig::default()
            })
    }
}

fn request(tag: &str) -> InstallRequest {
    InstallRequest {
        source: InstallSource::tag(tag),
        overrides: ParamsOverrides {
            dataset_volumes: vec!["/srv/datasets".to_string()],
            ..ParamsOverrides::default()
        },
        caching_method: None,
    }
}

/// Pack a bundle for `tag` on a separate online host.
async fn packed_bundle(dir: &Path, tag: &str) -> PathBuf {
    let bundle = dir.join("pack.tar");
    Host::new()
        .installer("pack", ScriptedPrompter::default())
        .pack(&InstallSource::tag(tag), &bundle)
        .await
        .unwrap();
    bundle
}

/// Copy of `bundle` without the named entry.
fn without_entry(bundle: &Path, entry: &str) -> PathBuf {
    let output = bundle.with_file_name(format!("without-{entry}.tar"));
    let mut archive = tar::Archive::new(File::open(bundle).unwrap());
    let mut builder = tar::Builder::new(File::create(&output).unwrap());
    for item in archive.entries().unwrap() {
        let mut item = item.unwrap();
        let path = item.path().unwrap().into_owned();
        if path == Path::new(entry) {
            continue;
        }
        let mut header = item.header().clone();
        builder.append_data(&mut header, path, &mut item).unwrap();
    }
    builder.finish().unwrap();
    output
}

fn deployed_app_version(host: &Host) -> Option<String> {
    host.charts.deployed("keel")
}

fn exists(path: &Path) -> bool {
    path.try_exists().unwrap()
}

#[tokio::test]
async fn test_fresh_install_creates_cluster_and_saves_state() {
    let host = Host::new();
    let state = host
        .installer("install", ScriptedPrompter::default())
        .install(&request("1.0.12"))
        .await
        .unwrap();

    assert_eq!(state.manifest.tag.as_deref(), Some("manifest-1.0.12"));
    assert_eq!(state.params.image_caching_method, Some(ImageCachingMethod::LocalVolume));

    let created = host.cluster.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].node_image, state.manifest.node_image(false));
    assert!(created[0].mirrored_registries.is_empty());
    assert!(!host.cluster.has_registry());

    let installs = host.charts.installs();
    assert_eq!(installs.len(), 2);
    assert_eq!(installs[0].release, "keel-infra");
    assert_eq!(installs[1].release, "keel");
    assert_eq!(installs[1].version, "1.0.12");

    let saved = host.config().state_store().load().unwrap().unwrap();
    assert_eq!(saved, state);
}

#[tokio::test]
async fn test_patch_release_upgrades_in_place() {
    let host = Host::new();
    host.installer("install", ScriptedPrompter::default())
        .install(&request("1.0.10"))
        .await
        .unwrap();

    let state = host
        .installer("upgrade", ScriptedPrompter::default())
        .upgrade(&request("1.0.11"))
        .await
        .unwrap();

    assert_eq!(state.manifest.app_chart.version, "1.0.11");
    assert_eq!(host.cluster.deleted(), 0);
    assert_eq!(host.cluster.created().len(), 1);

    let upgrades = host.charts.upgrades();
    assert_eq!(upgrades.len(), 1);
    assert_eq!(upgrades[0].release, "keel");
    assert_eq!(upgrades[0].version, "1.0.11");
    assert_eq!(host.charts.installs().len(), 2);
    assert_eq!(deployed_app_version(&host).as_deref(), Some("1.0.11"));

    assert!(host
        .runtime
        .removed()
        .contains(&"ghcr.io/keel-dev/app:1.0.10".to_string()));
}

#[tokio::test]
async fn test_gpu_change_reinstalls_after_consent() {
    let host = Host::new();
    host.installer("install", ScriptedPrompter::default())
        .install(&request("1.0.12"))
        .await
        .unwrap();

    let mut gpu_request = request("1.0.12");
    gpu_request.overrides.gpu = Some(GpuSelection::All);
    let prompter = Arc::new(ScriptedPrompter::new([true]));
    let state = host
        .installer_asking("install", Arc::clone(&prompter))
        .install(&gpu_request)
        .await
        .unwrap();

    let asked = prompter.asked();
    assert_eq!(asked.len(), 1);
    assert!(asked[0].contains("reinstalled"));

    assert_eq!(host.cluster.deleted(), 1);
    let created = host.cluster.created();
    assert_eq!(created.len(), 2);
    assert_eq!(created[1].node_image, state.manifest.node_image(true));
    assert!(created[1].params.gpu);
    assert_eq!(host.charts.installs().len(), 4);
    assert!(exists(&host.data_dir));
}

#[tokio::test]
async fn test_declined_reinstall_changes_nothing() {
    let host = Host::new();
    let first = host
        .installer("install", ScriptedPrompter::default())
        .install(&request("1.0.12"))
        .await
        .unwrap();
    let operations = host.cluster.operations();

    let mut gpu_request = request("1.0.12");
    gpu_request.overrides.gpu = Some(GpuSelection::Count(1));
    let err = host
        .installer("install", ScriptedPrompter::new([false]))
        .install(&gpu_request)
        .await
        .unwrap_err();

    assert!(matches!(err, KeelError::ReinstallAborted));
    assert_eq!(host.cluster.deleted(), 0);
    assert_eq!(host.cluster.operations(), operations);
    let saved = host.config().state_store().load().unwrap().unwrap();
    assert_eq!(saved, first);
}

#[tokio::test]
async fn test_older_minor_release_is_rejected_before_any_change() {
    let host = Host::new();
    host.installer("install", ScriptedPrompter::default())
        .install(&request("1.0.12"))
        .await
        .unwrap();
    let operations = host.cluster.operations();

    let err = host
        .installer("install", ScriptedPrompter::default())
        .install(&request("0.9.0"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        KeelError::Reconcile(ReconcileError::StaleManifest { .. })
    ));
    assert_eq!(host.cluster.operations(), operations);
    assert_eq!(deployed_app_version(&host).as_deref(), Some("1.0.12"));
}

#[tokio::test]
async fn test_upgrade_without_installation() {
    let host = Host::new();
    let err = host
        .installer("upgrade", ScriptedPrompter::default())
        .upgrade(&request("1.0.12"))
        .await
        .unwrap_err();
    assert!(matches!(err, KeelError::NotInstalled(_)));
    assert!(host.cluster.operations().is_empty());
}

#[tokio::test]
async fn test_upgrade_with_missing_cluster() {
    let host = Host::new();
    std::fs::create_dir_all(&host.data_dir).unwrap();
    let err = host
        .installer("upgrade", ScriptedPrompter::default())
        .upgrade(&request("1.0.12"))
        .await
        .unwrap_err();
    assert!(matches!(err, KeelError::ClusterMissing(_)));
}

#[tokio::test]
async fn test_stopped_cluster_is_started_for_upgrade() {
    let host = Host::new();
    host.installer("install", ScriptedPrompter::default())
        .install(&request("1.0.10"))
        .await
        .unwrap();
    keel::cluster::ClusterManager::stop(host.cluster.as_ref())
        .await
        .unwrap();

    host.installer("upgrade", ScriptedPrompter::default())
        .upgrade(&request("1.0.11"))
        .await
        .unwrap();
    assert_eq!(host.cluster.starts(), 1);
    assert_eq!(host.cluster.deleted(), 0);
}

#[tokio::test]
async fn test_uninstall_with_purge_removes_data_dir() {
    let host = Host::new();
    host.installer("install", ScriptedPrompter::default())
        .install(&request("1.0.12"))
        .await
        .unwrap();
    assert!(exists(&host.data_dir));

    host.installer("uninstall", ScriptedPrompter::default())
        .uninstall(true)
        .await
        .unwrap();

    assert!(!host.cluster.has_cluster());
    assert!(!exists(&host.data_dir));
    assert!(host.charts.deployed("keel").is_none());
}

#[tokio::test]
async fn test_uninstall_keeps_data_dir() {
    let host = Host::new();
    host.installer("install", ScriptedPrompter::default())
        .install(&request("1.0.12"))
        .await
        .unwrap();

    host.installer("uninstall", ScriptedPrompter::default())
        .uninstall(false)
        .await
        .unwrap();

    assert!(!host.cluster.has_cluster());
    assert!(host.config().state_store().load().unwrap().is_some());
}

#[tokio::test]
async fn test_reinstall_does_not_ask() {
    let host = Host::new();
    host.installer("install", ScriptedPrompter::default())
        .install(&request("1.0.12"))
        .await
        .unwrap();

    host.installer("reinstall", ScriptedPrompter::default())
        .reinstall(&request("1.0.12"), false)
        .await
        .unwrap();

    assert_eq!(host.cluster.deleted(), 1);
    assert_eq!(host.cluster.created().len(), 2);
}

#[tokio::test]
async fn test_create_manifest_from_latest_release() {
    let host = Host::new();
    let manifest = host
        .installer("create-manifest", ScriptedPrompter::default())
        .create_manifest(&ManifestSource::Remote(ChartVersions::default()), None)
        .await
        .unwrap();

    assert_eq!(manifest.app_chart.version, "1.0.12");
    assert_eq!(manifest.infra_chart.version, "0.1.9");
    assert_eq!(manifest.images.app_images, vec!["ghcr.io/keel-dev/app:1.0.12"]);
    assert!(!manifest.app_chart.is_local());
    assert!(manifest.tag.is_none());
}

#[tokio::test]
async fn test_create_manifest_with_pinned_versions_and_tag() {
    let host = Host::new();
    let versions = ChartVersions {
        app: Some("1.0.11".to_string()),
        infra: Some("0.2.0".to_string()),
    };
    let manifest = host
        .installer("create-manifest", ScriptedPrompter::default())
        .create_manifest(&ManifestSource::Remote(versions), Some("manifest-1.0.11"))
        .await
        .unwrap();

    assert_eq!(manifest.app_chart.version, "1.0.11");
    assert_eq!(manifest.infra_chart.version, "0.2.0");
    assert_eq!(manifest.tag.as_deref(), Some("manifest-1.0.11"));
}

#[tokio::test]
async fn test_create_manifest_from_local_checkout() {
    let host = Host::new();
    let checkout = host.dir.path().join("src");
    write_checkout(&checkout, "2.0.0-dev", "0.3.0");

    let manifest = host
        .installer("create-manifest", ScriptedPrompter::default())
        .create_manifest(&ManifestSource::Local(checkout), Some("dev"))
        .await
        .unwrap();

    assert_eq!(manifest.app_chart.version, "2.0.0-dev");
    assert!(manifest.app_chart.is_local());
    assert_eq!(manifest.tag.as_deref(), Some("dev"));
    assert!(host.cluster.operations().is_empty());
}

#[tokio::test]
async fn test_pack_then_airgap_install() {
    let online = Host::new();
    let bundle = online.dir.path().join("out").join("pack.tar");
    let manifest = online
        .installer("pack", ScriptedPrompter::default())
        .pack(&InstallSource::tag("1.0.12"), &bundle)
        .await
        .unwrap();
    assert!(exists(&bundle));
    assert_eq!(online.runtime.saved().len(), 1);
    assert!(!online.runtime.pulls().is_empty());

    let offline = Host::new();
    let mut airgap = request("1.0.12");
    airgap.source = InstallSource::Airgap(bundle);
    let state = offline
        .installer("install", ScriptedPrompter::default())
        .install(&airgap)
        .await
        .unwrap();

    assert_eq!(state.manifest, manifest);
    assert!(state.params.is_airgap);
    assert_eq!(state.params.image_caching_method, Some(ImageCachingMethod::Registry));
    assert!(offline.runtime.pulls().is_empty());
    assert_eq!(offline.runtime.loaded().len(), 1);
    assert!(offline.cluster.has_registry());
    assert!(!offline.runtime.pushes().is_empty());

    let created = offline.cluster.created();
    assert_eq!(created.len(), 1);
    assert!(!created[0].mirrored_registries.is_empty());
    assert_eq!(offline.charts.installs().len(), 2);
    assert!(offline.charts.fetched().is_empty());
}

#[tokio::test]
async fn test_malformed_bundle_install_keeps_existing_cluster() {
    let host = Host::new();
    let first = host
        .installer("install", ScriptedPrompter::default())
        .install(&request("1.0.12"))
        .await
        .unwrap();
    let bundle = packed_bundle(host.dir.path(), "1.0.12").await;
    let broken = without_entry(&bundle, "app-chart.tgz");

    let mut airgap = request("1.0.12");
    airgap.source = InstallSource::Airgap(broken);
    airgap.overrides.gpu = Some(GpuSelection::All);
    let prompter = Arc::new(ScriptedPrompter::new([true]));
    let err = host
        .installer_asking("install", Arc::clone(&prompter))
        .install(&airgap)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        KeelError::Bundle(BundleError::Malformed {
            entry: "app-chart.tgz"
        })
    ));
    assert_eq!(prompter.asked().len(), 1);
    assert_eq!(host.cluster.deleted(), 0);
    assert!(host.cluster.has_cluster());
    assert_eq!(deployed_app_version(&host).as_deref(), Some("1.0.12"));
    let saved = host.config().state_store().load().unwrap().unwrap();
    assert_eq!(saved, first);
}

#[tokio::test]
async fn test_malformed_bundle_reinstall_keeps_existing_cluster() {
    let host = Host::new();
    let first = host
        .installer("install", ScriptedPrompter::default())
        .install(&request("1.0.12"))
        .await
        .unwrap();
    let bundle = packed_bundle(host.dir.path(), "1.0.12").await;
    let broken = without_entry(&bundle, "app-chart.tgz");
    let operations = host.cluster.operations();

    let mut airgap = request("1.0.12");
    airgap.source = InstallSource::Airgap(broken);
    let err = host
        .installer("reinstall", ScriptedPrompter::default())
        .reinstall(&airgap, true)
        .await
        .unwrap_err();

    assert!(matches!(err, KeelError::Bundle(BundleError::Malformed { .. })));
    assert_eq!(host.cluster.deleted(), 0);
    assert_eq!(host.cluster.operations(), operations);
    assert!(exists(&host.data_dir));
    let saved = host.config().state_store().load().unwrap().unwrap();
    assert_eq!(saved, first);
}

#[tokio::test]
async fn test_failure_after_teardown_keeps_previous_state() {
    let host = Host::new();
    let first = host
        .installer("install", ScriptedPrompter::default())
        .install(&request("1.0.12"))
        .await
        .unwrap();
    host.cluster.fail_creates();

    let mut gpu_request = request("1.0.12");
    gpu_request.overrides.gpu = Some(GpuSelection::All);
    let err = host
        .installer("install", ScriptedPrompter::new([true]))
        .install(&gpu_request)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("cluster create failed"));
    assert_eq!(host.cluster.deleted(), 1);
    assert!(!host.cluster.has_cluster());
    let saved = host.config().state_store().load().unwrap().unwrap();
    assert_eq!(saved, first);
}

#[tokio::test]
async fn test_stop_then_run() {
    let host = Host::new();
    host.installer("install", ScriptedPrompter::default())
        .install(&request("1.0.12"))
        .await
        .unwrap();

    let installer = host.installer("stop", ScriptedPrompter::default());
    installer.stop().await.unwrap();
    installer.stop().await.unwrap();
    let stops = host
        .cluster
        .operations()
        .into_iter()
        .filter(|op| *op == "stop")
        .count();
    assert_eq!(stops, 1);

    let installer = host.installer("run", ScriptedPrompter::default());
    installer.run().await.unwrap();
    installer.run().await.unwrap();
    assert_eq!(host.cluster.starts(), 1);
    assert_eq!(host.cluster.deleted(), 0);
}

#[tokio::test]
async fn test_run_and_stop_need_a_cluster() {
    let host = Host::new();
    let installer = host.installer("run", ScriptedPrompter::default());

    assert!(matches!(
        installer.run().await.unwrap_err(),
        KeelError::ClusterMissing(_)
    ));
    assert!(matches!(
        installer.stop().await.unwrap_err(),
        KeelError::ClusterMissing(_)
    ));
    assert!(host.cluster.operations().is_empty());
}
