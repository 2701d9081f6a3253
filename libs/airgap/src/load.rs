//! Reading airgap bundles in one forward pass.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use keel_manifest::InstallationManifest;
use tar::{Archive, Entry};
use tracing::{debug, info};

use crate::chart::ChartArchive;
use crate::error::BundleError;
use crate::pack::{bundle_images, APP_CHART_ENTRY, IMAGES_ENTRY, INFRA_CHART_ENTRY, MANIFEST_ENTRY};

/// Receives the bundled image archive.
pub trait ImageSink {
    /// Whether every image is already present, so the archive can be
    /// skipped.
    fn all_present(&self, images: &[String]) -> bool;

    /// Consume the gzipped image archive stream.
    fn import(&mut self, stream: &mut dyn Read) -> Result<(), BundleError>;
}

/// Copies the image archive into a directory for the container runtime to
/// load afterwards.
#[derive(Debug)]
pub struct StagedImages {
    present: HashSet<String>,
    dir: PathBuf,
    staged: Option<PathBuf>,
}

impl StagedImages {
    pub fn new(present: impl IntoIterator<Item = String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            present: present.into_iter().collect(),
            dir: dir.into(),
            staged: None,
        }
    }

    /// Path of the staged archive, if the bundle's images were needed.
    pub fn staged(&self) -> Option<&Path> {
        self.staged.as_deref()
    }
}

impl ImageSink for StagedImages {
    fn all_present(&self, images: &[String]) -> bool {
        images.iter().all(|image| self.present.contains(image))
    }

    fn import(&mut self, stream: &mut dyn Read) -> Result<(), BundleError> {
        let path = self.dir.join(IMAGES_ENTRY);
        let mut file = File::create(&path)?;
        let bytes = io::copy(stream, &mut file)?;
        debug!(bytes, path = %path.display(), "Staged bundled images");
        self.staged = Some(path);
        Ok(())
    }
}

/// Contents of a fully loaded bundle.
#[derive(Debug)]
pub struct LoadedBundle {
    pub manifest: InstallationManifest,
    pub infra_chart: ChartArchive,
    pub app_chart: ChartArchive,
    /// False when every image was already present and the archive was
    /// skipped.
    pub images_imported: bool,
}

fn entry_name<R: Read>(entry: &Entry<'_, R>) -> Result<String, BundleError> {
    let path = entry.path()?;
    Ok(path
        .to_string_lossy()
        .trim_start_matches("./")
        .to_string())
}

fn read_manifest<R: Read>(entry: &mut Entry<'_, R>) -> Result<InstallationManifest, BundleError> {
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes)?;
    Ok(InstallationManifest::from_yaml_bytes(&bytes)?)
}

fn extract_chart<R: Read>(
    entry: &mut Entry<'_, R>,
    name: &str,
    scratch_dir: &Path,
) -> Result<ChartArchive, BundleError> {
    let path = scratch_dir.join(name);
    let mut file = File::create(&path)?;
    io::copy(entry, &mut file)?;
    ChartArchive::open(path)
}

/// Read only the manifest, stopping as soon as it is parsed. Bytes after
/// the manifest entry are never read.
pub fn load_manifest_only<R: Read>(reader: R) -> Result<InstallationManifest, BundleError> {
    let mut archive = Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry_name(&entry)? == MANIFEST_ENTRY {
            return read_manifest(&mut entry);
        }
    }
    Err(BundleError::Malformed {
        entry: MANIFEST_ENTRY,
    })
}

/// Load a whole bundle. Charts are written into `scratch_dir`; the image
/// archive goes to `sink` unless it already has every image.
pub fn load<R: Read>(
    reader: R,
    sink: &mut dyn ImageSink,
    scratch_dir: &Path,
) -> Result<LoadedBundle, BundleError> {
    let mut archive = Archive::new(reader);
    let mut manifest: Option<InstallationManifest> = None;
    let mut images_seen = false;
    let mut images_imported = false;
    let mut infra_chart = None;
    let mut app_chart = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry_name(&entry)?;
        match name.as_str() {
            MANIFEST_ENTRY => {
                let loaded = read_manifest(&mut entry)?;
                info!(app_version = %loaded.app_version, "Loaded bundle manifest");
                manifest = Some(loaded);
            }
            IMAGES_ENTRY => {
                let manifest = manifest.as_ref().ok_or(BundleError::Malformed {
                    entry: MANIFEST_ENTRY,
                })?;
                images_seen = true;
                if sink.all_present(&bundle_images(manifest)) {
                    info!("All images already present, skipping bundled images");
                    io::copy(&mut entry, &mut io::sink())?;
                } else {
                    sink.import(&mut entry)?;
                    images_imported = true;
                }
            }
            INFRA_CHART_ENTRY => {
                infra_chart = Some(extract_chart(&mut entry, INFRA_CHART_ENTRY, scratch_dir)?);
            }
            APP_CHART_ENTRY => {
                app_chart = Some(extract_chart(&mut entry, APP_CHART_ENTRY, scratch_dir)?);
            }
            other => debug!(entry = other, "Ignoring unknown bundle entry"),
        }
    }

    let manifest = manifest.ok_or(BundleError::Malformed {
        entry: MANIFEST_ENTRY,
    })?;
    if !images_seen {
        return Err(BundleError::Malformed {
            entry: IMAGES_ENTRY,
        });
    }
    let infra_chart = infra_chart.ok_or(BundleError::Malformed {
        entry: INFRA_CHART_ENTRY,
    })?;
    let app_chart = app_chart.ok_or(BundleError::Malformed {
        entry: APP_CHART_ENTRY,
    })?;

    Ok(LoadedBundle {
        manifest,
        infra_chart,
        app_chart,
        images_imported,
    })
}
