use std::io;

use keel_imagecache::RuntimeError;
use keel_manifest::ManifestError;
use thiserror::Error;

/// Errors from packing or loading an airgap bundle.
#[derive(Debug, Error)]
pub enum BundleError {
    /// A required entry is missing from the bundle.
    #[error("airgap bundle is missing {entry}")]
    Malformed { entry: &'static str },

    /// The bundled manifest could not be decoded.
    #[error("airgap bundle manifest: {0}")]
    Manifest(#[from] ManifestError),

    /// A chart archive is unreadable or has no usable Chart.yaml.
    #[error("chart archive {entry}: {message}")]
    Chart { entry: String, message: String },

    /// Exporting images from the container runtime failed.
    #[error("failed to export images: {0}")]
    Export(#[from] RuntimeError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
