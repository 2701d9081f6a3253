//! Installation manifest and params model for keel.
//!
//! - [`InstallationManifest`]: what to deploy (images, charts, version stamps)
//! - [`InstallationParams`]: how to run it (GPU, volumes, network identity)
//! - [`StateStore`]: the persisted (manifest, params) pair of the current
//!   installation
//! - [`generate`]: building manifests from chart checkouts and releases

pub mod error;
pub mod generate;
pub mod gpu;
pub mod manifest;
pub mod params;
pub mod store;
pub mod version;

pub use error::{GenerateError, ManifestError, StoreError, VersionError};
pub use gpu::GpuSelection;
pub use manifest::{
    ChartRef, InstallationManifest, MachineImages, ManifestImages, APP_VERSION,
    INSTALLER_VERSION, MANIFEST_SCHEMA_VERSION,
};
pub use params::{
    ClusterParams, ImageCachingMethod, InfraChartParams, InstallationParams, ParamsOverrides,
    RegistryParams, TlsParams, PARAMS_SCHEMA_VERSION,
};
pub use store::{InstalledState, StateStore};
pub use version::{is_minor_change, is_minor_smaller, Version};
