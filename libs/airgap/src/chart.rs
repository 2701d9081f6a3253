//! Packaged helm chart archives.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;
use tar::Archive;
use tracing::debug;

use crate::error::BundleError;

const CHART_FILE: &str = "Chart.yaml";

#[derive(Deserialize)]
struct ChartMeta {
    name: String,
    version: String,
}

/// A gzipped chart archive on disk with its `Chart.yaml` identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartArchive {
    pub path: PathBuf,
    pub name: String,
    pub version: String,
}

impl ChartArchive {
    /// Open a chart archive and read the top-level `<name>/Chart.yaml`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, BundleError> {
        let path = path.into();
        let label = path.display().to_string();
        let invalid = |message: String| BundleError::Chart {
            entry: label.clone(),
            message,
        };

        let file = File::open(&path)?;
        let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));
        let entries = archive.entries().map_err(|e| invalid(e.to_string()))?;

        for entry in entries {
            let mut entry = entry.map_err(|e| invalid(e.to_string()))?;
            let is_chart_file = {
                let entry_path = entry.path().map_err(|e| invalid(e.to_string()))?;
                is_top_level_chart_file(&entry_path)
            };
            if !is_chart_file {
                continue;
            }

            let mut bytes = Vec::new();
            entry
                .read_to_end(&mut bytes)
                .map_err(|e| invalid(e.to_string()))?;
            let meta: ChartMeta =
                serde_yaml::from_slice(&bytes).map_err(|e| invalid(e.to_string()))?;
            debug!(chart = %meta.name, version = %meta.version, "Read chart archive");
            return Ok(Self {
                path,
                name: meta.name,
                version: meta.version,
            });
        }

        Err(invalid(format!("no {CHART_FILE} found")))
    }
}

fn is_top_level_chart_file(path: &Path) -> bool {
    let parts: Vec<_> = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    parts.len() == 2 && parts[1].as_os_str() == CHART_FILE
}

/// Package a chart directory into `dest` as `<name>/...`, the layout
/// `helm package` produces.
pub fn package_chart_dir(chart_dir: &Path, dest: &Path) -> Result<ChartArchive, BundleError> {
    let meta_bytes = std::fs::read(chart_dir.join(CHART_FILE))?;
    let meta: ChartMeta =
        serde_yaml::from_slice(&meta_bytes).map_err(|e| BundleError::Chart {
            entry: chart_dir.display().to_string(),
            message: e.to_string(),
        })?;

    let encoder = GzEncoder::new(File::create(dest)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(&meta.name, chart_dir)?;
    builder.into_inner()?.finish()?;

    ChartArchive::open(dest)
}
