//! Version gates that reject a target before any destructive step.

use keel_manifest::{is_minor_change, is_minor_smaller, InstallationManifest};
use tracing::{debug, warn};

use crate::error::ReconcileError;
use crate::observe::ReleaseObserver;

/// Check that this installer can install `manifest`.
///
/// A manifest stamped by an older minor release than `tool_version` is
/// stale; one stamped by a different (newer) minor release needs a newer
/// installer.
pub fn validate_installer_version(
    tool_version: &str,
    manifest: &InstallationManifest,
) -> Result<(), ReconcileError> {
    let stamp = manifest.installer_version.as_str();
    if is_minor_smaller(stamp, tool_version)? {
        return Err(ReconcileError::StaleManifest {
            component: "manifest".to_string(),
            deployed: tool_version.to_string(),
            desired: stamp.to_string(),
        });
    }
    if is_minor_change(stamp, tool_version)? {
        return Err(ReconcileError::InstallerUpgradeRequired {
            current: tool_version.to_string(),
            required: stamp.to_string(),
        });
    }
    Ok(())
}

/// Whether the deployed chart releases can not be moved to `desired` in
/// place.
///
/// - infra missing while the app release exists: stale
/// - a desired chart whose minor pair is below the deployed one:
///   [`ReconcileError::StaleManifest`]
/// - any infra version change: stale (the infra release is never upgraded
///   in place)
/// - an app minor change: stale; patch changes are a plain upgrade
pub async fn charts_stale(
    desired: &InstallationManifest,
    releases: &dyn ReleaseObserver,
) -> Result<bool, ReconcileError> {
    let infra = &desired.infra_chart;
    let app = &desired.app_chart;

    let deployed_infra = releases
        .release_version(&infra.release_name)
        .await
        .map_err(ReconcileError::observe)?;
    let deployed_app = releases
        .release_version(&app.release_name)
        .await
        .map_err(ReconcileError::observe)?;

    let Some(deployed_infra) = deployed_infra else {
        let stale = deployed_app.is_some();
        if stale {
            warn!(release = %infra.release_name, "Infra release missing while app release exists");
        }
        return Ok(stale);
    };

    if is_minor_smaller(&infra.version, &deployed_infra)? {
        return Err(ReconcileError::StaleManifest {
            component: format!("chart {}", infra.chart_name),
            deployed: deployed_infra,
            desired: infra.version.clone(),
        });
    }

    let mut stale = deployed_infra != infra.version;

    if let Some(deployed_app) = deployed_app {
        if is_minor_smaller(&app.version, &deployed_app)? {
            return Err(ReconcileError::StaleManifest {
                component: format!("chart {}", app.chart_name),
                deployed: deployed_app,
                desired: app.version.clone(),
            });
        }
        stale |= is_minor_change(&app.version, &deployed_app)?;
    }

    debug!(
        infra_deployed = %deployed_infra,
        infra_desired = %infra.version,
        stale,
        "Compared deployed chart releases"
    );
    Ok(stale)
}
