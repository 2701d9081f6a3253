//! Image caching method selection and image set calculation.

use keel_manifest::{ImageCachingMethod, InstallationManifest, InstallationParams};
use tracing::{info, warn};

use crate::error::CacheError;

/// Host platform, as far as caching is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Self::Linux
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else {
            Self::Other
        }
    }
}

fn mode(is_airgap: bool) -> &'static str {
    if is_airgap {
        "airgap"
    } else {
        "online"
    }
}

/// Whether `method` works for the given mode and platform.
///
/// Airgap installs have nothing to pull, so images must come from the
/// bundle through the local registry. Bind-mounting the node's image store
/// only works on Linux hosts.
pub fn is_available(method: ImageCachingMethod, is_airgap: bool, platform: Platform) -> bool {
    match method {
        ImageCachingMethod::Registry => true,
        ImageCachingMethod::DockerVolume => !is_airgap,
        ImageCachingMethod::LocalVolume => !is_airgap && platform == Platform::Linux,
    }
}

/// Platform default when neither the user nor a previous install chose.
pub fn default_method(is_airgap: bool, platform: Platform) -> ImageCachingMethod {
    match (is_airgap, platform) {
        (true, _) => ImageCachingMethod::Registry,
        (false, Platform::Linux) => ImageCachingMethod::LocalVolume,
        (false, _) => ImageCachingMethod::DockerVolume,
    }
}

/// Pick the caching method: an explicit choice, else the previous method if
/// it still fits the mode, else the platform default.
pub fn select_caching_method(
    requested: Option<ImageCachingMethod>,
    previous: Option<&InstallationParams>,
    is_airgap: bool,
    platform: Platform,
) -> Result<ImageCachingMethod, CacheError> {
    if let Some(method) = requested {
        if !is_available(method, is_airgap, platform) {
            return Err(CacheError::MethodUnavailable {
                method: method.to_string(),
                mode: mode(is_airgap),
            });
        }
        return Ok(method);
    }

    if let Some(previous) = previous {
        if let Some(method) = previous.image_caching_method {
            if previous.is_airgap == is_airgap && is_available(method, is_airgap, platform) {
                info!(method = %method, "Reusing previous image caching method");
                return Ok(method);
            }
            warn!(
                method = %method,
                mode = mode(is_airgap),
                "Previous image caching method does not fit this install"
            );
        }
    }

    Ok(default_method(is_airgap, platform))
}

/// Images that must be in the local registry before the cluster starts.
/// Only the registry method serves images this way.
pub fn images_to_cache(
    manifest: &InstallationManifest,
    params: &InstallationParams,
) -> Vec<String> {
    match params.image_caching_method {
        Some(ImageCachingMethod::Registry) => manifest.registry_images(params.uses_gpu()),
        _ => Vec::new(),
    }
}

/// Images of a previous installation that are no longer needed.
///
/// With `include_current`, the current installation's images are removed
/// too (after they have been cached into the cluster).
pub fn images_to_clean(
    current: &InstallationManifest,
    previous: Option<&InstallationManifest>,
    gpu: bool,
    include_current: bool,
) -> Vec<String> {
    let mut keep = current.all_images(true);
    keep.extend(current.all_images(false));
    let mut candidates: Vec<String> = Vec::new();

    if let Some(previous) = previous {
        for image in previous.all_images(true).into_iter().chain(previous.all_images(false)) {
            if !keep.contains(&image) && !candidates.contains(&image) {
                candidates.push(image);
            }
        }
    }

    if include_current {
        for image in current.registry_images(gpu) {
            if !candidates.contains(&image) {
                candidates.push(image);
            }
        }
    }

    candidates
}
