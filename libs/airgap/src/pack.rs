//! Writing airgap bundles.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use keel_imagecache::ContainerRuntime;
use keel_manifest::InstallationManifest;
use tar::{Builder, Header};
use tracing::info;

use crate::error::BundleError;

pub const MANIFEST_ENTRY: &str = "manifest.yaml";
pub const IMAGES_ENTRY: &str = "images.tar.gz";
pub const INFRA_CHART_ENTRY: &str = "infra-chart.tgz";
pub const APP_CHART_ENTRY: &str = "app-chart.tgz";

/// Everything a bundle carries. Archives are files so each entry's size is
/// known before its header is written.
#[derive(Debug, Clone)]
pub struct PackInputs {
    pub manifest: InstallationManifest,
    pub images_archive: PathBuf,
    pub infra_chart: PathBuf,
    pub app_chart: PathBuf,
}

/// Images a bundle ships: both cluster variants, so one bundle serves CPU
/// and GPU hosts.
pub fn bundle_images(manifest: &InstallationManifest) -> Vec<String> {
    let mut images = manifest.all_images(false);
    for image in manifest.all_images(true) {
        if !images.contains(&image) {
            images.push(image);
        }
    }
    images
}

/// Write the bundle to `writer` and hand the writer back.
pub fn pack<W: Write>(inputs: &PackInputs, writer: W) -> Result<W, BundleError> {
    let mut builder = Builder::new(writer);

    let manifest = inputs.manifest.to_yaml()?;
    let mut header = Header::new_gnu();
    header.set_size(manifest.len() as u64);
    header.set_mode(0o600);
    header.set_cksum();
    builder.append_data(&mut header, MANIFEST_ENTRY, manifest.as_bytes())?;
    info!(entry = MANIFEST_ENTRY, "Packed installation manifest");

    append_file(&mut builder, IMAGES_ENTRY, &inputs.images_archive)?;
    append_file(&mut builder, INFRA_CHART_ENTRY, &inputs.infra_chart)?;
    append_file(&mut builder, APP_CHART_ENTRY, &inputs.app_chart)?;

    Ok(builder.into_inner()?)
}

fn append_file<W: Write>(
    builder: &mut Builder<W>,
    entry: &'static str,
    path: &Path,
) -> Result<(), BundleError> {
    let mut file = File::open(path)?;
    let bytes = file.metadata()?.len();
    builder.append_file(entry, &mut file)?;
    info!(entry, bytes, "Packed bundle entry");
    Ok(())
}

/// Gzip `src` into `dst`, returning the uncompressed size.
pub fn gzip_file(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut input = BufReader::new(File::open(src)?);
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(dst)?), Compression::default());
    let copied = io::copy(&mut input, &mut encoder)?;
    encoder.finish()?.flush()?;
    Ok(copied)
}

/// Export `images` from the runtime and gzip them into
/// `dir/images.tar.gz`.
pub async fn stage_images(
    runtime: &dyn ContainerRuntime,
    images: &[String],
    dir: &Path,
) -> Result<PathBuf, BundleError> {
    let tar_path = dir.join("images.tar");
    let gz_path = dir.join(IMAGES_ENTRY);

    info!(images = images.len(), "Exporting images");
    runtime.save(images, &tar_path).await?;

    let (src, dst) = (tar_path.clone(), gz_path.clone());
    let size = tokio::task::spawn_blocking(move || gzip_file(&src, &dst))
        .await
        .map_err(io::Error::other)??;
    tokio::fs::remove_file(&tar_path).await?;

    info!(bytes = size, path = %gz_path.display(), "Staged image archive");
    Ok(gz_path)
}
