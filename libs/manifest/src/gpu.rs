//! GPU selection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ManifestError;

const UUID_PREFIX: &str = "GPU-";

/// Which GPUs the cluster may use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum GpuSelection {
    /// CPU only.
    #[default]
    None,
    /// Every GPU on the machine.
    All,
    /// The first `n` GPUs.
    Count(u32),
    /// Specific GPUs by index.
    DeviceIndices(Vec<u32>),
    /// Specific GPUs by UUID (`GPU-…`).
    DeviceUuids(Vec<String>),
}

impl GpuSelection {
    pub fn is_enabled(&self) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::Count(n) => *n > 0,
            Self::DeviceIndices(list) => !list.is_empty(),
            Self::DeviceUuids(list) => !list.is_empty(),
        }
    }

    /// Value for the device plugin's visible-devices setting, or `None` when
    /// GPUs are disabled.
    pub fn visible_devices(&self) -> Option<String> {
        if !self.is_enabled() {
            return None;
        }
        Some(match self {
            Self::None | Self::All => "all".to_string(),
            Self::Count(n) => (0..*n).map(|i| i.to_string()).collect::<Vec<_>>().join(","),
            Self::DeviceIndices(list) => {
                list.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(",")
            }
            Self::DeviceUuids(list) => list.join(","),
        })
    }

    /// Device request passed to the cluster manager. Only UUID selections
    /// pin devices at the container level; everything else exposes all GPUs
    /// and narrows visibility through the device plugin.
    pub fn cluster_device_request(&self) -> Option<String> {
        match self {
            Self::DeviceUuids(list) if !list.is_empty() => Some(list.join(",")),
            _ => None,
        }
    }

    /// Build a selection from the legacy `gpus` count and `gpuDevices`
    /// string found in older params files.
    pub fn from_legacy(gpus: u32, devices: &str) -> Result<Self, ManifestError> {
        let devices = devices.trim();
        if !devices.is_empty() {
            return devices.parse();
        }
        Ok(if gpus > 0 { Self::Count(gpus) } else { Self::None })
    }
}

impl FromStr for GpuSelection {
    type Err = ManifestError;

    /// Accepts `none`, `all`, a count (`2`), an index list (`0,2`) or a UUID
    /// list (`GPU-aaa,GPU-bbb`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "" | "none" | "0" => return Ok(Self::None),
            "all" => return Ok(Self::All),
            _ => {}
        }

        if !s.contains(',') {
            if let Ok(n) = s.parse::<u32>() {
                return Ok(Self::Count(n));
            }
        }

        let items: Vec<&str> = s.split(',').map(str::trim).filter(|i| !i.is_empty()).collect();
        if items.iter().all(|i| i.starts_with(UUID_PREFIX)) {
            return Ok(Self::DeviceUuids(items.into_iter().map(str::to_string).collect()));
        }

        let indices: Result<Vec<u32>, _> = items.iter().map(|i| i.parse::<u32>()).collect();
        match indices {
            Ok(indices) => Ok(Self::DeviceIndices(indices)),
            Err(_) => Err(ManifestError::InvalidField {
                field: "gpu selection",
                message: format!(
                    "'{s}' must be 'all', a count, a list of indices, or a list of GPU UUIDs"
                ),
            }),
        }
    }
}

impl fmt::Display for GpuSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::All => write!(f, "all GPUs"),
            Self::Count(n) => write!(f, "{n} GPU(s)"),
            Self::DeviceIndices(_) | Self::DeviceUuids(_) => {
                write!(f, "devices {}", self.visible_devices().unwrap_or_default())
            }
        }
    }
}
