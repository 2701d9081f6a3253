//! Installation params: how to run the deployment.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ManifestError;
use crate::gpu::GpuSelection;

/// The only params schema version this build reads or writes.
pub const PARAMS_SCHEMA_VERSION: &str = "1.0.0";

pub const DEFAULT_PORT: u16 = 4589;
pub const DEFAULT_REGISTRY_PORT: u16 = 5699;
pub const DEFAULT_TLS_PORT: u16 = 443;

/// Data directory as seen from inside the cluster node.
pub const CONTAINER_DATA_DIR: &str = "/var/lib/keel/standalone";

/// How images reach the cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageCachingMethod {
    /// The node's containerd store lives in a named docker volume.
    DockerVolume,
    /// The node's containerd store is bind-mounted from the data directory.
    LocalVolume,
    /// Images are served to the node from a local registry.
    Registry,
}

impl ImageCachingMethod {
    pub const ALL: [ImageCachingMethod; 3] = [Self::DockerVolume, Self::LocalVolume, Self::Registry];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DockerVolume => "docker-volume",
            Self::LocalVolume => "local-volume",
            Self::Registry => "registry",
        }
    }
}

impl fmt::Display for ImageCachingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageCachingMethod {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s.trim())
            .ok_or_else(|| ManifestError::InvalidField {
                field: "image caching method",
                message: format!("'{s}' is not one of docker-volume, local-volume, registry"),
            })
    }
}

/// TLS material for the public endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsParams {
    pub enabled: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cert: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub key: String,
    pub port: u16,
}

/// Versioned description of how to run the deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstallationParams {
    pub version: String,
    pub gpu: GpuSelection,
    pub port: u16,
    pub registry_port: u16,
    pub domain: String,
    pub proxy_url: String,
    pub tls: TlsParams,
    /// Normalized `host:container` mounts.
    pub dataset_volumes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    pub disable_metrics: bool,
    pub disabled_auth: bool,
    /// Remove installation images from the local runtime after install.
    pub clear_installation_images: bool,
    pub is_airgap: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_caching_method: Option<ImageCachingMethod>,
}

impl Default for InstallationParams {
    fn default() -> Self {
        Self {
            version: PARAMS_SCHEMA_VERSION.to_string(),
            gpu: GpuSelection::None,
            port: DEFAULT_PORT,
            registry_port: DEFAULT_REGISTRY_PORT,
            domain: "localhost".to_string(),
            proxy_url: String::new(),
            tls: TlsParams::default(),
            dataset_volumes: Vec::new(),
            cpu_limit: None,
            disable_metrics: false,
            disabled_auth: false,
            clear_installation_images: false,
            is_airgap: false,
            image_caching_method: None,
        }
    }
}

/// Fields older params files used before the current shape.
#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct LegacyFields {
    dataset_directory: Option<String>,
    gpus: Option<u32>,
    gpu_devices: Option<String>,
    gpu: Option<serde_yaml::Value>,
}

#[derive(Deserialize)]
struct VersionRecord {
    version: String,
}

/// Infrastructure chart values derived from params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfraChartParams {
    pub nvidia_gpu: NvidiaGpuValues,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NvidiaGpuValues {
    pub enabled: bool,
    pub visible_devices: String,
}

/// Cluster creation inputs derived from params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterParams {
    pub gpu: bool,
    pub gpu_devices: Option<String>,
    pub port: u16,
    pub tls_port: Option<u16>,
    pub volumes: Vec<String>,
    pub cpu_limit: Option<String>,
    pub image_caching_method: Option<ImageCachingMethod>,
}

/// Local registry creation inputs derived from params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryParams {
    pub port: u16,
    pub volumes: Vec<String>,
}

/// Application chart values derived from params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppChartParams {
    pub gpu: bool,
    pub local_data_directories: Vec<String>,
    pub disable_metrics: bool,
    pub domain: String,
    pub base_path: String,
    pub url: String,
    pub proxy_url: String,
    pub tls: AppTlsValues,
    pub auth_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppTlsValues {
    pub enabled: bool,
    pub cert: String,
    pub key: String,
}

impl InstallationParams {
    /// Decode params, rejecting other schema versions and migrating legacy
    /// fields into their current shape.
    pub fn from_yaml_bytes(bytes: &[u8]) -> Result<Self, ManifestError> {
        let yaml_err = |source| ManifestError::Yaml {
            kind: "params",
            source,
        };

        let record: VersionRecord = serde_yaml::from_slice(bytes).map_err(yaml_err)?;
        if record.version != PARAMS_SCHEMA_VERSION {
            return Err(ManifestError::UnsupportedVersion {
                kind: "params",
                found: record.version,
                supported: PARAMS_SCHEMA_VERSION,
            });
        }

        let mut params: Self = serde_yaml::from_slice(bytes).map_err(yaml_err)?;
        let legacy: LegacyFields = serde_yaml::from_slice(bytes).map_err(yaml_err)?;

        if let Some(dir) = legacy.dataset_directory.filter(|d| !d.is_empty()) {
            let volume = normalize_volume(&dir)?;
            if !params.dataset_volumes.contains(&volume) {
                params.dataset_volumes.push(volume);
            }
        }
        if legacy.gpu.is_none() && (legacy.gpus.is_some() || legacy.gpu_devices.is_some()) {
            params.gpu = GpuSelection::from_legacy(
                legacy.gpus.unwrap_or(0),
                legacy.gpu_devices.as_deref().unwrap_or(""),
            )?;
        }

        Ok(params)
    }

    /// Encode as YAML.
    pub fn to_yaml(&self) -> Result<String, ManifestError> {
        serde_yaml::to_string(self).map_err(|source| ManifestError::Yaml {
            kind: "params",
            source,
        })
    }

    pub fn uses_gpu(&self) -> bool {
        self.gpu.is_enabled()
    }

    /// Public URL of the application.
    pub fn url(&self) -> String {
        let (scheme, port) = if self.tls.enabled {
            ("https", self.tls.port)
        } else {
            ("http", self.port)
        };
        let domain = if self.domain.is_empty() {
            "localhost"
        } else {
            self.domain.as_str()
        };
        let default_port = (self.tls.enabled && port == 443) || (!self.tls.enabled && port == 80);
        if default_port {
            format!("{scheme}://{domain}")
        } else {
            format!("{scheme}://{domain}:{port}")
        }
    }

    /// Path prefix the application is served under behind the proxy.
    pub fn base_path(&self) -> Result<String, ManifestError> {
        if self.proxy_url.is_empty() {
            return Ok(String::new());
        }
        let url = reqwest::Url::parse(&self.proxy_url).map_err(|e| ManifestError::InvalidField {
            field: "proxy url",
            message: format!("'{}': {e}", self.proxy_url),
        })?;
        Ok(url.path().trim_matches('/').to_string())
    }

    pub fn infra_chart_params(&self) -> InfraChartParams {
        InfraChartParams {
            nvidia_gpu: NvidiaGpuValues {
                enabled: self.gpu.is_enabled(),
                visible_devices: self.gpu.visible_devices().unwrap_or_default(),
            },
        }
    }

    pub fn cluster_params(&self, data_dir: &Path) -> ClusterParams {
        let mut volumes = vec![format!("{}:{}", data_dir.display(), CONTAINER_DATA_DIR)];
        volumes.extend(self.dataset_volumes.iter().cloned());

        ClusterParams {
            gpu: self.gpu.is_enabled(),
            gpu_devices: self.gpu.cluster_device_request(),
            port: self.port,
            tls_port: self.tls.enabled.then_some(self.tls.port),
            volumes,
            cpu_limit: self.cpu_limit.clone(),
            image_caching_method: self.image_caching_method,
        }
    }

    pub fn registry_params(&self, data_dir: &Path) -> RegistryParams {
        RegistryParams {
            port: self.registry_port,
            volumes: vec![format!(
                "{}:/var/lib/registry",
                data_dir.join("registry").display()
            )],
        }
    }

    pub fn app_chart_params(&self) -> Result<AppChartParams, ManifestError> {
        let local_data_directories = self
            .dataset_volumes
            .iter()
            .filter_map(|v| v.split_once(':').map(|(_, container)| container.to_string()))
            .collect();

        Ok(AppChartParams {
            gpu: self.gpu.is_enabled(),
            local_data_directories,
            disable_metrics: self.disable_metrics,
            domain: self.domain.clone(),
            base_path: self.base_path()?,
            url: self.url(),
            proxy_url: self.proxy_url.clone(),
            tls: AppTlsValues {
                enabled: self.tls.enabled,
                cert: self.tls.cert.clone(),
                key: self.tls.key.clone(),
            },
            auth_enabled: !self.disabled_auth,
        })
    }
}

/// Normalize a dataset mount to `host:container`. A bare host path mounts at
/// the same path inside the cluster.
pub fn normalize_volume(spec: &str) -> Result<String, ManifestError> {
    let spec = spec.trim();
    let (host, container) = spec.split_once(':').unwrap_or((spec, spec));
    if host.is_empty() || container.is_empty() || container.contains(':') {
        return Err(ManifestError::InvalidField {
            field: "dataset volume",
            message: format!("'{spec}' must be HOST_PATH or HOST_PATH:CONTAINER_PATH"),
        });
    }
    if !container.starts_with('/') {
        return Err(ManifestError::InvalidField {
            field: "dataset volume",
            message: format!("container path '{container}' must be absolute"),
        });
    }
    Ok(format!("{host}:{container}"))
}

/// User-supplied values for a new installation. `None` falls back to the
/// previous installation, then to defaults.
#[derive(Debug, Clone, Default)]
pub struct ParamsOverrides {
    pub gpu: Option<GpuSelection>,
    pub port: Option<u16>,
    pub registry_port: Option<u16>,
    pub domain: Option<String>,
    pub proxy_url: Option<String>,
    pub tls: Option<TlsParams>,
    pub dataset_volumes: Vec<String>,
    pub cpu_limit: Option<String>,
    pub disable_metrics: Option<bool>,
    pub disabled_auth: Option<bool>,
    pub clear_installation_images: Option<bool>,
}

impl InstallationParams {
    /// Merge user input over the previous installation's params.
    ///
    /// `default_volume` is mounted when neither the input nor the previous
    /// params name any dataset volume.
    pub fn resolve(
        overrides: ParamsOverrides,
        previous: Option<&InstallationParams>,
        is_airgap: bool,
        image_caching_method: ImageCachingMethod,
        default_volume: Option<&str>,
    ) -> Result<Self, ManifestError> {
        let base = previous.cloned().unwrap_or_default();

        let dataset_volumes = if !overrides.dataset_volumes.is_empty() {
            overrides
                .dataset_volumes
                .iter()
                .map(|v| normalize_volume(v))
                .collect::<Result<Vec<_>, _>>()?
        } else if previous.is_some_and(|p| !p.dataset_volumes.is_empty()) {
            base.dataset_volumes.clone()
        } else {
            default_volume
                .map(normalize_volume)
                .transpose()?
                .into_iter()
                .collect()
        };

        let tls = match overrides.tls {
            Some(tls) if tls.enabled && (tls.cert.is_empty() || tls.key.is_empty()) => {
                return Err(ManifestError::InvalidField {
                    field: "tls",
                    message: "both a certificate and a key are required".to_string(),
                });
            }
            Some(mut tls) => {
                if tls.enabled && tls.port == 0 {
                    tls.port = DEFAULT_TLS_PORT;
                }
                tls
            }
            None => base.tls.clone(),
        };

        Ok(Self {
            version: PARAMS_SCHEMA_VERSION.to_string(),
            gpu: overrides.gpu.unwrap_or(base.gpu),
            port: overrides.port.unwrap_or(base.port),
            registry_port: overrides.registry_port.unwrap_or(base.registry_port),
            domain: overrides.domain.unwrap_or(base.domain),
            proxy_url: overrides.proxy_url.unwrap_or(base.proxy_url),
            tls,
            dataset_volumes,
            cpu_limit: overrides.cpu_limit.or(base.cpu_limit),
            disable_metrics: overrides.disable_metrics.unwrap_or(base.disable_metrics),
            disabled_auth: overrides.disabled_auth.unwrap_or(base.disabled_auth),
            clear_installation_images: overrides
                .clear_installation_images
                .unwrap_or(base.clear_installation_images),
            is_airgap,
            image_caching_method: Some(image_caching_method),
        })
    }
}
