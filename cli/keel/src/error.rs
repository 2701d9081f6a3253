//! Error handling and display for the CLI.

use std::path::PathBuf;

use colored::Colorize;
use keel_airgap::BundleError;
use keel_imagecache::{CacheError, RuntimeError};
use keel_manifest::{GenerateError, ManifestError, StoreError};
use keel_reconcile::ReconcileError;
use thiserror::Error;

/// Errors from the installer flows.
#[derive(Debug, Error)]
pub enum KeelError {
    /// An upgrade was requested but nothing is installed.
    #[error("no installation found in {}", .0.display())]
    NotInstalled(PathBuf),

    /// State exists but the cluster it describes is gone.
    #[error("cluster {0} does not exist")]
    ClusterMissing(String),

    /// The operator declined a required reinstall.
    #[error("reinstall aborted")]
    ReinstallAborted,

    /// The command cannot take its manifest from this source.
    #[error("{0} cannot be used with this command")]
    UnsupportedSource(&'static str),

    /// An external tool exited with a failure.
    #[error("{command} failed:\n{output}")]
    Tool { command: String, output: String },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Generate(#[from] GenerateError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A collaborator (cluster manager, chart deployer, runtime) failed.
    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

fn hint(err: &KeelError) -> Option<String> {
    match err {
        KeelError::NotInstalled(_) | KeelError::ClusterMissing(_) => {
            Some("Run `keel install` first.".to_string())
        }
        KeelError::ReinstallAborted => Some(
            "Nothing was changed. Keep the current release with `keel install --tag <current tag>`."
                .to_string(),
        ),
        KeelError::Reconcile(ReconcileError::StaleManifest { deployed, .. }) => Some(format!(
            "Pick a release at or after {deployed} with `keel install --tag <tag>`."
        )),
        KeelError::Reconcile(ReconcileError::InstallerUpgradeRequired { required, .. }) => {
            Some(format!("Install keel {required} or later and run the command again."))
        }
        KeelError::Bundle(BundleError::Malformed { entry }) => Some(format!(
            "The bundle has no {entry}. Create it again with `keel pack`."
        )),
        KeelError::Cache(CacheError::PullExhausted { .. }) => {
            Some("Check access to the image registry and run the command again.".to_string())
        }
        KeelError::Cache(CacheError::PushExhausted { .. }) => Some(
            "Check that the local registry container is running and has free disk space."
                .to_string(),
        ),
        KeelError::Cache(CacheError::MethodUnavailable { .. }) => {
            Some("Choose another --image-caching-method.".to_string())
        }
        KeelError::Other(inner) => match inner.downcast_ref::<KeelError>() {
            Some(KeelError::Tool { .. }) => {
                Some("Check that k3d, helm and docker are installed and on PATH.".to_string())
            }
            Some(nested) => hint(nested),
            None => None,
        },
        _ => None,
    }
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    let keel_err = err.downcast_ref::<KeelError>().or_else(|| {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<KeelError>())
    });
    if let Some(hint) = keel_err.and_then(hint) {
        eprintln!("\n{}", format!("Hint: {hint}").yellow());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_manifest_hint_names_deployed_version() {
        let err = KeelError::Reconcile(ReconcileError::StaleManifest {
            component: "app chart".to_string(),
            deployed: "1.4.0".to_string(),
            desired: "1.3.9".to_string(),
        });
        assert!(hint(&err).unwrap().contains("1.4.0"));
    }

    #[test]
    fn test_tool_failure_hint_through_other() {
        let tool = KeelError::Tool {
            command: "k3d cluster list -o json".to_string(),
            output: "not found".to_string(),
        };
        let err = KeelError::Other(anyhow::Error::new(tool));
        assert!(hint(&err).unwrap().contains("PATH"));
    }

    #[test]
    fn test_bundle_hint_names_entry() {
        let err = KeelError::Bundle(BundleError::Malformed {
            entry: "app-chart.tgz",
        });
        assert!(hint(&err).unwrap().contains("app-chart.tgz"));
    }

    #[test]
    fn test_unclassified_errors_have_no_hint() {
        let err = KeelError::Io(std::io::Error::other("disk full"));
        assert!(hint(&err).is_none());
    }
}
