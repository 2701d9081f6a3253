//! Airgap bundles for keel.
//!
//! A bundle is one uncompressed tar stream with entries in a fixed order:
//!
//! 1. `manifest.yaml`: the installation manifest
//! 2. `images.tar.gz`: every image the manifest references, as a runtime
//!    export
//! 3. `infra-chart.tgz` and `app-chart.tgz`: packaged helm charts
//!
//! The manifest comes first so [`load_manifest_only`] can stop early and
//! [`load`] can decide whether the image archive is needed before reading
//! it.

mod chart;
mod error;
mod load;
mod pack;

pub use chart::{package_chart_dir, ChartArchive};
pub use error::BundleError;
pub use load::{load, load_manifest_only, ImageSink, LoadedBundle, StagedImages};
pub use pack::{
    bundle_images, gzip_file, pack, stage_images, PackInputs, APP_CHART_ENTRY, IMAGES_ENTRY,
    INFRA_CHART_ENTRY, MANIFEST_ENTRY,
};
