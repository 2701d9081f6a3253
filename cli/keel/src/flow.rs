//! Install, upgrade, reinstall, uninstall, run, stop and pack flows.
//!
//! Every flow resolves and validates its target, and stages the charts and
//! bundled images, before touching the machine. Classification errors and
//! unreadable bundles leave the existing installation as it was.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use keel_airgap::{
    bundle_images, load, pack, stage_images, BundleError, ChartArchive, PackInputs, StagedImages,
};
use keel_imagecache::{
    images_to_cache, images_to_clean, registry_limits_for, select_caching_method, ContainerRuntime,
    CoordinatorConfig, DockerCli, HttpRegistryCatalog, ImageCacheCoordinator, ImageRef, Platform,
    RegistryCatalog,
};
use keel_manifest::generate::{
    ChartSources, GithubReleases, LocalCheckout, ManifestGenerator, RawContent, ReleaseIndex,
};
use keel_manifest::{
    ImageCachingMethod, InstallationManifest, InstallationParams, InstalledState, ParamsOverrides,
    StateStore, INSTALLER_VERSION,
};
use keel_reconcile::{
    validate_installer_version, ClusterObserver, ReconcileError, Reconciler, Target,
};
use tempfile::TempDir;
use tracing::{info, warn};

use crate::charts::{write_values, ChartDeployer, HelmCli};
use crate::cluster::{ClusterManager, ClusterSpec, K3dCli};
use crate::config::Config;
use crate::context::{CommandContext, Status};
use crate::error::KeelError;
use crate::live::{KubeAccess, LiveCluster};
use crate::source::{InstallSource, ManifestResolver, ManifestSource};

/// External systems the flows drive.
#[derive(Clone)]
pub struct Collaborators {
    pub cluster: Arc<dyn ClusterManager>,
    pub charts: Arc<dyn ChartDeployer>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub catalog: Arc<dyn RegistryCatalog>,
    pub index: Arc<dyn ReleaseIndex>,
    pub checkouts: Arc<dyn ChartSources>,
}

impl Collaborators {
    /// The real tools: k3d, helm, docker, the local registry API and the
    /// release index.
    pub fn live(config: &Config) -> Result<Self, KeelError> {
        let releases = GithubReleases::new(
            &config.github_api,
            &config.github_download,
            &config.releases_repo,
        )?;
        let checkouts = RawContent::new(releases.client().clone(), &config.chart_checkout_url());
        Ok(Self {
            cluster: Arc::new(K3dCli::new(&config.cluster_name)),
            charts: Arc::new(HelmCli::new(&config.namespace)),
            runtime: Arc::new(DockerCli::new()),
            catalog: Arc::new(HttpRegistryCatalog::new()?),
            index: Arc::new(releases),
            checkouts: Arc::new(checkouts),
        })
    }
}

/// Inputs shared by install, upgrade and reinstall.
#[derive(Debug, Clone, Default)]
pub struct InstallRequest {
    pub source: InstallSource,
    pub overrides: ParamsOverrides,
    pub caching_method: Option<ImageCachingMethod>,
}

/// Charts held in a scratch directory until the release step.
struct Staged {
    scratch: TempDir,
    infra_chart: ChartArchive,
    app_chart: ChartArchive,
}

/// Runs the installer flows against a set of collaborators.
pub struct Installer {
    ctx: CommandContext,
    collab: Collaborators,
    store: StateStore,
    kube: KubeAccess,
    platform: Platform,
    cache_config: CoordinatorConfig,
}

impl Installer {
    pub fn new(ctx: CommandContext, collab: Collaborators) -> Self {
        let store = ctx.config.state_store();
        Self {
            ctx,
            collab,
            store,
            kube: KubeAccess::new(),
            platform: Platform::current(),
            cache_config: CoordinatorConfig::default(),
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_cache_config(mut self, config: CoordinatorConfig) -> Self {
        self.cache_config = config;
        self
    }

    fn data_dir(&self) -> &Path {
        self.store.data_dir()
    }

    fn live(&self) -> LiveCluster<'_> {
        LiveCluster {
            cluster: self.collab.cluster.as_ref(),
            charts: self.collab.charts.as_ref(),
            kube: &self.kube,
        }
    }

    fn resolver(&self) -> ManifestResolver<'_> {
        ManifestResolver::new(self.collab.index.as_ref(), self.ctx.prompter.as_ref())
    }

    fn coordinator(&self, manifest: &InstallationManifest) -> ImageCacheCoordinator {
        ImageCacheCoordinator::new(
            Arc::clone(&self.collab.runtime),
            Arc::clone(&self.collab.catalog),
            registry_limits_for(manifest),
            self.cache_config.clone(),
        )
    }

    /// Resolve the manifest and params to install and check the manifest
    /// against this installer.
    async fn plan(
        &self,
        request: &InstallRequest,
        previous: Option<&InstalledState>,
    ) -> Result<InstalledState, KeelError> {
        self.ctx.report("resolve", Status::Starting);
        let manifest = self
            .resolver()
            .resolve(&request.source, previous.map(|p| &p.manifest))
            .await?;
        validate_installer_version(INSTALLER_VERSION, &manifest)?;

        let is_airgap = request.source.is_airgap();
        let previous_params = previous.map(|p| &p.params);
        let method = select_caching_method(
            request.caching_method,
            previous_params,
            is_airgap,
            self.platform,
        )?;
        let default_volume = self.ctx.config.default_dataset_volume();
        let params = InstallationParams::resolve(
            request.overrides.clone(),
            previous_params,
            is_airgap,
            method,
            default_volume.as_deref(),
        )?;

        info!(
            app_version = %manifest.app_chart.version,
            tag = manifest.tag.as_deref().unwrap_or("-"),
            gpu = %params.gpu,
            method = %method,
            "Resolved installation target"
        );
        self.ctx.report("resolve", Status::Success);
        Ok(InstalledState { manifest, params })
    }

    /// Install or upgrade to the requested target. A reinstall is only
    /// performed with the operator's consent.
    pub async fn install(&self, request: &InstallRequest) -> Result<InstalledState, KeelError> {
        let previous = self.store.load()?;
        let target = self.plan(request, previous.as_ref()).await?;

        let live = self.live();
        let decision = Reconciler::new(&live, &live, self.data_dir())
            .decide(
                Target::new(&target.manifest, &target.params),
                previous.as_ref().map(|p| Target::new(&p.manifest, &p.params)),
            )
            .await?;

        let reinstall = match decision.in_place() {
            Ok(decision) => {
                info!(decision = ?decision, "Applying installation");
                false
            }
            Err(ReconcileError::ReinstallRequired { reasons }) => {
                let summary = reasons
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                let question = format!(
                    "The installation must be reinstalled ({summary}). The cluster will be deleted; data in {} is kept. Continue?",
                    self.data_dir().display()
                );
                if !self.ctx.confirm(&question, true)? {
                    return Err(KeelError::ReinstallAborted);
                }
                true
            }
            Err(e) => return Err(e.into()),
        };

        let staged = self.stage(&request.source, &target.manifest).await?;
        if reinstall {
            self.teardown(false).await?;
        }
        self.apply(&target, &staged, previous.as_ref().map(|p| &p.manifest))
            .await?;
        Ok(target)
    }

    /// Upgrade an existing installation.
    pub async fn upgrade(&self, request: &InstallRequest) -> Result<InstalledState, KeelError> {
        if !self.data_dir().exists() {
            return Err(KeelError::NotInstalled(self.data_dir().to_path_buf()));
        }
        if !self.collab.cluster.exists().await? {
            return Err(KeelError::ClusterMissing(self.ctx.config.cluster_name.clone()));
        }
        self.install(request).await
    }

    /// Tear down and install again without asking.
    pub async fn reinstall(
        &self,
        request: &InstallRequest,
        purge: bool,
    ) -> Result<InstalledState, KeelError> {
        let previous = self.store.load()?;
        let target = self.plan(request, previous.as_ref()).await?;
        let staged = self.stage(&request.source, &target.manifest).await?;
        self.teardown(purge).await?;
        self.apply(&target, &staged, previous.as_ref().map(|p| &p.manifest))
            .await?;
        Ok(target)
    }

    /// Delete the cluster and registry. `purge` also removes the data
    /// directory.
    pub async fn uninstall(&self, purge: bool) -> Result<(), KeelError> {
        self.teardown(purge).await
    }

    /// Start the stopped cluster.
    pub async fn run(&self) -> Result<(), KeelError> {
        if !self.collab.cluster.exists().await? {
            return Err(KeelError::ClusterMissing(self.ctx.config.cluster_name.clone()));
        }
        self.ctx.report("cluster", Status::Starting);
        self.live()
            .ensure_running()
            .await
            .inspect_err(|_| self.ctx.report("cluster", Status::Failed))?;
        self.ctx.report("cluster", Status::Success);
        Ok(())
    }

    /// Stop the cluster, keeping its state.
    pub async fn stop(&self) -> Result<(), KeelError> {
        let cluster = self.collab.cluster.as_ref();
        if !cluster.exists().await? {
            return Err(KeelError::ClusterMissing(self.ctx.config.cluster_name.clone()));
        }
        if !cluster.is_running().await? {
            info!(cluster = %self.ctx.config.cluster_name, "Cluster is already stopped");
            return Ok(());
        }
        self.ctx.report("cluster", Status::Starting);
        cluster.stop().await?;
        self.ctx.report("cluster", Status::Success);
        Ok(())
    }

    async fn teardown(&self, purge: bool) -> Result<(), KeelError> {
        self.ctx.report("teardown", Status::Starting);
        if self.collab.cluster.exists().await? {
            self.collab.cluster.delete().await?;
        }
        self.kube.reset().await;

        if self.collab.cluster.registry_exists().await? {
            self.collab.cluster.delete_registry().await?;
        }

        if purge && self.data_dir().exists() {
            info!(dir = %self.data_dir().display(), "Removing data directory");
            tokio::fs::remove_dir_all(self.data_dir()).await?;
        }
        self.ctx.report("teardown", Status::Success);
        Ok(())
    }

    async fn apply(
        &self,
        target: &InstalledState,
        staged: &Staged,
        previous: Option<&InstallationManifest>,
    ) -> Result<(), KeelError> {
        tokio::fs::create_dir_all(self.data_dir()).await?;

        self.ensure_registry(target).await?;
        self.cache_images(target).await?;
        self.ensure_cluster(target).await?;
        self.release_charts(target, staged).await?;

        self.store.save(target)?;
        info!(dir = %self.data_dir().display(), "Saved installation state");

        self.clean_images(target, previous).await;
        Ok(())
    }

    /// Fetch the charts, and for airgap installs read the whole bundle and
    /// load its images into the runtime.
    async fn stage(
        &self,
        source: &InstallSource,
        manifest: &InstallationManifest,
    ) -> Result<Staged, KeelError> {
        let scratch = tempfile::tempdir()?;
        self.ctx.report("charts", Status::Starting);

        let InstallSource::Airgap(bundle) = source else {
            let infra_chart = self.collab.charts.fetch(&manifest.infra_chart, scratch.path()).await?;
            let app_chart = self.collab.charts.fetch(&manifest.app_chart, scratch.path()).await?;
            return Ok(Staged {
                scratch,
                infra_chart,
                app_chart,
            });
        };

        let present = self.collab.runtime.list_local().await?;
        let (bundle, dir) = (bundle.clone(), scratch.path().to_path_buf());
        let (loaded, staged) = tokio::task::spawn_blocking(move || {
            let mut sink = StagedImages::new(present, &dir);
            let loaded = load(BufReader::new(File::open(&bundle)?), &mut sink, &dir)?;
            Ok::<_, BundleError>((loaded, sink.staged().map(Path::to_path_buf)))
        })
        .await
        .map_err(std::io::Error::other)?
        .inspect_err(|_| self.ctx.report("charts", Status::Failed))?;

        if loaded.manifest != *manifest {
            warn!("Bundle manifest changed since it was first read");
        }
        if let Some(archive) = staged {
            self.ctx.report("load-images", Status::Running);
            self.collab.runtime.load(&archive).await?;
        }
        Ok(Staged {
            scratch,
            infra_chart: loaded.infra_chart,
            app_chart: loaded.app_chart,
        })
    }

    async fn ensure_registry(&self, target: &InstalledState) -> Result<(), KeelError> {
        if target.params.image_caching_method != Some(ImageCachingMethod::Registry) {
            return Ok(());
        }
        if self.collab.cluster.registry_exists().await? {
            return Ok(());
        }
        self.ctx.report("registry", Status::Starting);
        self.collab
            .cluster
            .create_registry(
                &target.manifest.images.machine.registry,
                &target.params.registry_params(self.data_dir()),
            )
            .await?;
        Ok(())
    }

    async fn cache_images(&self, target: &InstalledState) -> Result<(), KeelError> {
        let images = images_to_cache(&target.manifest, &target.params);
        if images.is_empty() {
            return Ok(());
        }

        self.ctx.report("cache-images", Status::Starting);
        let report = self
            .coordinator(&target.manifest)
            .cache_images(&images, target.params.registry_port, target.params.is_airgap)
            .await
            .inspect_err(|_| self.ctx.report("cache-images", Status::Failed))?;
        info!(
            skipped = report.skipped.len(),
            pulled = report.pulled.len(),
            pushed = report.pushed.len(),
            "Images cached"
        );
        self.ctx.report("cache-images", Status::Success);
        Ok(())
    }

    async fn ensure_cluster(&self, target: &InstalledState) -> Result<(), KeelError> {
        let cluster = self.collab.cluster.as_ref();
        if cluster.exists().await? {
            if !cluster.is_running().await? {
                cluster.start().await?;
            }
            return Ok(());
        }

        self.ctx.report("cluster", Status::Starting);
        let gpu = target.params.uses_gpu();
        let mut mirrored_registries: Vec<String> = Vec::new();
        for image in images_to_cache(&target.manifest, &target.params) {
            let registry = ImageRef::parse(&image).registry;
            if !mirrored_registries.contains(&registry) {
                mirrored_registries.push(registry);
            }
        }

        cluster
            .create(&ClusterSpec {
                node_image: target.manifest.node_image(gpu).to_string(),
                tools_image: target.manifest.images.machine.tools.clone(),
                params: target.params.cluster_params(self.data_dir()),
                data_dir: self.data_dir().to_path_buf(),
                mirrored_registries,
            })
            .await?;
        self.ctx.report("cluster", Status::Success);
        Ok(())
    }

    async fn release_charts(&self, target: &InstalledState, staged: &Staged) -> Result<(), KeelError> {
        let scratch = staged.scratch.path();
        let kubeconfig = self.kube.get(self.collab.cluster.as_ref()).await?;
        let kubeconfig = kubeconfig.path();
        let charts = self.collab.charts.as_ref();
        let manifest = &target.manifest;

        let infra_release = &manifest.infra_chart.release_name;
        if charts.release_version(&kubeconfig, infra_release).await?.is_none() {
            self.ctx.report("infra-chart", Status::Starting);
            let values = write_values(&target.params.infra_chart_params(), scratch, "infra-values")?;
            charts
                .install(&kubeconfig, infra_release, &staged.infra_chart, &values)
                .await?;
        } else {
            info!(release = %infra_release, "Infrastructure chart already deployed");
        }

        self.ctx.report("app-chart", Status::Starting);
        let app_release = &manifest.app_chart.release_name;
        let values = write_values(&target.params.app_chart_params()?, scratch, "app-values")?;
        if charts.release_exists(&kubeconfig, app_release).await? {
            charts
                .upgrade(&kubeconfig, app_release, &staged.app_chart, &values)
                .await?;
        } else {
            charts
                .install(&kubeconfig, app_release, &staged.app_chart, &values)
                .await?;
        }
        self.ctx.report("app-chart", Status::Success);
        Ok(())
    }

    /// Remove images no longer needed. Failures are only logged.
    async fn clean_images(&self, target: &InstalledState, previous: Option<&InstallationManifest>) {
        let images = images_to_clean(
            &target.manifest,
            previous,
            target.params.uses_gpu(),
            target.params.clear_installation_images,
        );
        for image in images {
            if let Err(e) = self.collab.runtime.remove(&image).await {
                warn!(image = %image, error = %e, "Failed to remove image");
            }
        }
    }

    /// Generate a manifest without installing it. `tag` only labels the
    /// result.
    pub async fn create_manifest(
        &self,
        source: &ManifestSource,
        tag: Option<&str>,
    ) -> Result<InstallationManifest, KeelError> {
        let generator = ManifestGenerator::default();
        let mut manifest = match source {
            ManifestSource::Local(dir) => {
                let checkout = LocalCheckout::new(dir);
                let repo_url = checkout.charts_dir().display().to_string();
                generator.from_checkout(&checkout, &repo_url).await?
            }
            ManifestSource::Remote(versions) => {
                generator
                    .from_app_release(
                        self.collab.index.as_ref(),
                        self.collab.checkouts.as_ref(),
                        versions,
                    )
                    .await?
            }
        };
        manifest.tag = tag.map(str::to_string);
        Ok(manifest)
    }

    /// Write an airgap bundle for `source` to `output`.
    pub async fn pack(
        &self,
        source: &InstallSource,
        output: &Path,
    ) -> Result<InstallationManifest, KeelError> {
        if source.is_airgap() {
            return Err(KeelError::UnsupportedSource("an airgap bundle"));
        }
        let manifest = self.resolver().resolve(source, None).await?;
        let images = bundle_images(&manifest);

        self.ctx.report("pull-images", Status::Starting);
        let local = self.collab.runtime.list_local().await?;
        let missing: Vec<String> = images
            .iter()
            .filter(|image| !local.contains(image))
            .cloned()
            .collect();
        self.coordinator(&manifest).pull_images(&missing).await?;

        let scratch = tempfile::tempdir()?;
        self.ctx.report("stage-images", Status::Starting);
        let images_archive = stage_images(self.collab.runtime.as_ref(), &images, scratch.path()).await?;

        self.ctx.report("charts", Status::Starting);
        let infra = self.collab.charts.fetch(&manifest.infra_chart, scratch.path()).await?;
        let app = self.collab.charts.fetch(&manifest.app_chart, scratch.path()).await?;

        self.ctx.report("write-bundle", Status::Starting);
        let inputs = PackInputs {
            manifest: manifest.clone(),
            images_archive,
            infra_chart: infra.path,
            app_chart: app.path,
        };
        let output: PathBuf = output.to_path_buf();
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let writer = pack(&inputs, BufWriter::new(File::create(&output)?))?;
            writer
                .into_inner()
                .map_err(|e| BundleError::Io(e.into_error()))?
                .sync_all()?;
            info!(path = %output.display(), "Wrote airgap bundle");
            Ok::<_, BundleError>(())
        })
        .await
        .map_err(std::io::Error::other)??;

        Ok(manifest)
    }
}
