//! The installation manifest: what to deploy.

use serde::{Deserialize, Serialize};

use crate::error::ManifestError;

/// The only manifest schema version this build reads or writes.
pub const MANIFEST_SCHEMA_VERSION: &str = "1.0.0";

/// Application version stamp. Bumping it forces a reinstall.
pub const APP_VERSION: &str = "0.1.0";

/// Installer version stamped into generated manifests.
pub const INSTALLER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Images the installer itself runs on the operator machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MachineImages {
    /// Single-node cluster runtime (CPU).
    pub node: String,
    /// Single-node cluster runtime with the GPU toolkit.
    pub node_gpu: String,
    /// Offline helper tool used by the cluster manager.
    pub tools: String,
    /// Local image registry.
    pub registry: String,
    /// Image used to check the container environment.
    pub env_probe: String,
}

/// All images referenced by a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ManifestImages {
    #[serde(flatten)]
    pub machine: MachineImages,
    /// System images the CPU cluster needs.
    #[serde(default)]
    pub cluster_images: Vec<String>,
    /// System images the GPU cluster needs.
    #[serde(default)]
    pub cluster_gpu_images: Vec<String>,
    /// Application images, discovered from the chart's image list.
    #[serde(default)]
    pub app_images: Vec<String>,
}

/// Where a chart lives and how it is released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChartRef {
    pub version: String,
    /// Helm repository URL, or a filesystem path for local charts.
    pub repo_url: String,
    pub chart_name: String,
    pub release_name: String,
}

impl ChartRef {
    /// Local charts are referenced by path rather than repository URL.
    pub fn is_local(&self) -> bool {
        let url = self.repo_url.as_str();
        !(url.starts_with("http://") || url.starts_with("https://") || url.starts_with("oci://"))
    }
}

/// Versioned description of what to deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallationManifest {
    pub version: String,
    /// Version of the tool that generated this manifest.
    pub installer_version: String,
    pub app_version: String,
    pub images: ManifestImages,
    /// Release tag pinning this manifest, when generated from a release.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub app_chart: ChartRef,
    pub infra_chart: ChartRef,
}

#[derive(Deserialize)]
struct VersionRecord {
    version: String,
}

impl InstallationManifest {
    /// Decode a manifest, rejecting any schema version but the current one
    /// before looking at the rest of the document.
    pub fn from_yaml_bytes(bytes: &[u8]) -> Result<Self, ManifestError> {
        let record: VersionRecord =
            serde_yaml::from_slice(bytes).map_err(|source| ManifestError::Yaml {
                kind: "manifest",
                source,
            })?;
        if record.version != MANIFEST_SCHEMA_VERSION {
            return Err(ManifestError::UnsupportedVersion {
                kind: "manifest",
                found: record.version,
                supported: MANIFEST_SCHEMA_VERSION,
            });
        }

        serde_yaml::from_slice(bytes).map_err(|source| ManifestError::Yaml {
            kind: "manifest",
            source,
        })
    }

    /// Encode as YAML.
    pub fn to_yaml(&self) -> Result<String, ManifestError> {
        serde_yaml::to_string(self).map_err(|source| ManifestError::Yaml {
            kind: "manifest",
            source,
        })
    }

    /// Node runtime image for the requested variant.
    pub fn node_image(&self, gpu: bool) -> &str {
        if gpu {
            &self.images.machine.node_gpu
        } else {
            &self.images.machine.node
        }
    }

    /// Images run directly on the operator machine.
    pub fn running_on_machine_images(&self, gpu: bool) -> Vec<String> {
        let machine = &self.images.machine;
        [
            self.node_image(gpu),
            &machine.tools,
            &machine.registry,
            &machine.env_probe,
        ]
        .into_iter()
        .filter(|image| !image.is_empty())
        .map(str::to_string)
        .collect()
    }

    /// Images served to the cluster from the local registry.
    pub fn registry_images(&self, gpu: bool) -> Vec<String> {
        let cluster = if gpu {
            &self.images.cluster_gpu_images
        } else {
            &self.images.cluster_images
        };
        self.images
            .app_images
            .iter()
            .chain(cluster.iter())
            .filter(|image| !image.is_empty())
            .cloned()
            .collect()
    }

    /// Every image an installation needs, without duplicates.
    pub fn all_images(&self, gpu: bool) -> Vec<String> {
        let mut images = self.running_on_machine_images(gpu);
        for image in self.registry_images(gpu) {
            if !images.contains(&image) {
                images.push(image);
            }
        }
        images
    }
}
