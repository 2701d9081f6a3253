//! Upgrade-or-reinstall decision.

use std::path::Path;

use keel_manifest::{InstallationManifest, InstallationParams};
use tracing::{info, warn};

use crate::error::{ReconcileError, ReinstallReason};
use crate::gate::charts_stale;
use crate::hash::SpecHash;
use crate::observe::{ClusterObserver, ReleaseObserver};

/// One side of a reconciliation: a manifest and the params to run it with.
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    pub manifest: &'a InstallationManifest,
    pub params: &'a InstallationParams,
}

impl<'a> Target<'a> {
    pub fn new(manifest: &'a InstallationManifest, params: &'a InstallationParams) -> Self {
        Self { manifest, params }
    }

    fn node_image(&self) -> &'a str {
        self.manifest.node_image(self.params.uses_gpu())
    }
}

/// Why a fresh install was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshReason {
    /// Nothing was installed before.
    NoPreviousState,
    /// State exists but the cluster is gone.
    NoCluster,
}

/// Outcome of reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Nothing to preserve; install from scratch.
    FreshInstall(FreshReason),
    /// The desired state is reachable in place.
    Upgrade,
    /// Tear down and install again.
    Reinstall(Vec<ReinstallReason>),
}

impl Decision {
    pub fn needs_reinstall(&self) -> bool {
        matches!(self, Self::Reinstall(_))
    }

    /// Require an in-place path, turning a reinstall decision into
    /// [`ReconcileError::ReinstallRequired`].
    pub fn in_place(self) -> Result<Self, ReconcileError> {
        match self {
            Self::Reinstall(reasons) => Err(ReconcileError::ReinstallRequired { reasons }),
            other => Ok(other),
        }
    }
}

/// Decides between fresh install, upgrade and reinstall.
pub struct Reconciler<'a> {
    cluster: &'a dyn ClusterObserver,
    releases: &'a dyn ReleaseObserver,
    data_dir: &'a Path,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        cluster: &'a dyn ClusterObserver,
        releases: &'a dyn ReleaseObserver,
        data_dir: &'a Path,
    ) -> Self {
        Self {
            cluster,
            releases,
            data_dir,
        }
    }

    /// Decide how to move from `previous` to `desired`.
    ///
    /// May start a stopped cluster to inspect its releases. Never touches
    /// persisted state.
    pub async fn decide(
        &self,
        desired: Target<'_>,
        previous: Option<Target<'_>>,
    ) -> Result<Decision, ReconcileError> {
        let Some(previous) = previous else {
            info!("No previous installation, fresh install");
            return Ok(Decision::FreshInstall(FreshReason::NoPreviousState));
        };

        if !self
            .cluster
            .exists()
            .await
            .map_err(ReconcileError::observe)?
        {
            info!("No cluster found, fresh install");
            return Ok(Decision::FreshInstall(FreshReason::NoCluster));
        }

        if let Err(e) = self.cluster.ensure_running().await {
            warn!(error = %format!("{e:#}"), "Cluster failed to start");
            return Ok(Decision::Reinstall(vec![ReinstallReason::ClusterUnstartable]));
        }

        let mut reasons = Vec::new();

        if desired.node_image() != previous.node_image() {
            reasons.push(ReinstallReason::NodeImageChanged {
                from: previous.node_image().to_string(),
                to: desired.node_image().to_string(),
            });
        }

        if desired.manifest.app_version != previous.manifest.app_version {
            reasons.push(ReinstallReason::AppVersionChanged {
                from: previous.manifest.app_version.clone(),
                to: desired.manifest.app_version.clone(),
            });
        }

        if hash(&desired.params.infra_chart_params(), "infra values")?
            != hash(&previous.params.infra_chart_params(), "infra values")?
        {
            reasons.push(ReinstallReason::InfraParamsChanged);
        }

        if hash(&desired.params.cluster_params(self.data_dir), "cluster params")?
            != hash(&previous.params.cluster_params(self.data_dir), "cluster params")?
        {
            reasons.push(ReinstallReason::ClusterParamsChanged);
        }

        if charts_stale(desired.manifest, self.releases).await? {
            reasons.push(ReinstallReason::ChartsStale);
        }

        if reasons.is_empty() {
            info!("Installation can be upgraded in place");
            Ok(Decision::Upgrade)
        } else {
            for reason in &reasons {
                info!(reason = %reason, "Reinstall needed");
            }
            Ok(Decision::Reinstall(reasons))
        }
    }
}

fn hash<T: serde::Serialize>(value: &T, what: &'static str) -> Result<SpecHash, ReconcileError> {
    SpecHash::of(value).map_err(|source| ReconcileError::Hash { what, source })
}
