use std::fmt;

use keel_manifest::VersionError;
use thiserror::Error;

/// Why an in-place upgrade is not enough.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReinstallReason {
    /// The cluster exists but could not be started.
    ClusterUnstartable,
    /// Switching between the CPU and GPU node runtime image.
    NodeImageChanged { from: String, to: String },
    /// Application version stamp changed.
    AppVersionChanged { from: String, to: String },
    /// Values that feed the infrastructure chart changed.
    InfraParamsChanged,
    /// Values that feed cluster creation changed.
    ClusterParamsChanged,
    /// Deployed chart releases cannot be upgraded in place.
    ChartsStale,
}

impl fmt::Display for ReinstallReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClusterUnstartable => write!(f, "cluster failed to start"),
            Self::NodeImageChanged { from, to } => {
                write!(f, "node image changed from {from} to {to}")
            }
            Self::AppVersionChanged { from, to } => {
                write!(f, "app version changed from {from} to {to}")
            }
            Self::InfraParamsChanged => write!(f, "infrastructure settings changed"),
            Self::ClusterParamsChanged => write!(f, "cluster settings changed"),
            Self::ChartsStale => write!(f, "deployed charts need a fresh install"),
        }
    }
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The target is older than what is already installed.
    #[error(
        "{component} {desired} is older than the installed {deployed}; \
         choose a release at or after {deployed}"
    )]
    StaleManifest {
        component: String,
        deployed: String,
        desired: String,
    },

    /// The target was produced by a newer installer than this one.
    #[error("target requires installer {required} but this is {current}; upgrade keel first")]
    InstallerUpgradeRequired { current: String, required: String },

    /// An in-place upgrade was requested but only a reinstall can reach the
    /// target.
    #[error("reinstall required: {}", join_reasons(.reasons))]
    ReinstallRequired { reasons: Vec<ReinstallReason> },

    /// A version stamp could not be parsed.
    #[error(transparent)]
    Version(#[from] VersionError),

    /// A derived value set could not be hashed.
    #[error("failed to hash {what}: {source}")]
    Hash {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Querying the live cluster failed.
    #[error("cluster query failed: {0}")]
    Observe(String),
}

fn join_reasons(reasons: &[ReinstallReason]) -> String {
    reasons
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ReconcileError {
    pub(crate) fn observe(err: anyhow::Error) -> Self {
        Self::Observe(format!("{err:#}"))
    }
}
