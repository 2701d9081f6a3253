//! Configuration loaded from the environment.
//!
//! Every setting has a default so `keel` runs with no environment at all:
//! - `KEEL_DATA_DIR`: where state, registry data and datasets live
//! - `KEEL_CLUSTER_NAME` / `KEEL_NAMESPACE`: cluster and release namespace
//! - `KEEL_USE_DEFAULT_OPTION`: answer every prompt with its default
//! - `KEEL_RELEASES_REPO`, `KEEL_GITHUB_API`, `KEEL_GITHUB_DOWNLOAD`: release index
//! - `KEEL_RAW_CONTENT`: raw file root for chart checkouts at a release tag
//! - `KEEL_LOG_FORMAT` / `KEEL_LOG_LEVEL`: logging

use std::path::PathBuf;

use directories::BaseDirs;
use keel_manifest::StateStore;

pub const DEFAULT_DATA_DIR: &str = "/var/lib/keel/standalone";
pub const DEFAULT_CLUSTER_NAME: &str = "keel";
pub const DEFAULT_NAMESPACE: &str = "keel";
pub const DEFAULT_RELEASES_REPO: &str = "keel-dev/keel-helm-charts";
pub const DEFAULT_GITHUB_API: &str = "https://api.github.com";
pub const DEFAULT_GITHUB_DOWNLOAD: &str = "https://github.com";
pub const DEFAULT_RAW_CONTENT: &str = "https://raw.githubusercontent.com";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Installer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Installation data directory.
    pub data_dir: PathBuf,

    /// Name of the single-node cluster.
    pub cluster_name: String,

    /// Namespace the charts are released into.
    pub namespace: String,

    /// Answer prompts with their default instead of asking.
    pub use_default_option: bool,

    /// `owner/name` of the repository publishing release manifests.
    pub releases_repo: String,

    /// Base URL of the release API.
    pub github_api: String,

    /// Base URL for release asset downloads.
    pub github_download: String,

    /// Base URL serving repository files at a git ref.
    pub raw_content: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let use_default_option = lookup("KEEL_USE_DEFAULT_OPTION")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let log_format = match lookup("KEEL_LOG_FORMAT").map(|v| v.to_lowercase()) {
            Some(v) if v == "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Self {
            data_dir: PathBuf::from(var("KEEL_DATA_DIR", DEFAULT_DATA_DIR)),
            cluster_name: var("KEEL_CLUSTER_NAME", DEFAULT_CLUSTER_NAME),
            namespace: var("KEEL_NAMESPACE", DEFAULT_NAMESPACE),
            use_default_option,
            releases_repo: var("KEEL_RELEASES_REPO", DEFAULT_RELEASES_REPO),
            github_api: var("KEEL_GITHUB_API", DEFAULT_GITHUB_API),
            github_download: var("KEEL_GITHUB_DOWNLOAD", DEFAULT_GITHUB_DOWNLOAD),
            raw_content: var("KEEL_RAW_CONTENT", DEFAULT_RAW_CONTENT),
            log_format,
            log_level: var("KEEL_LOG_LEVEL", "info"),
        }
    }

    /// Override the data directory (from a command-line flag).
    pub fn with_data_dir(mut self, data_dir: Option<PathBuf>) -> Self {
        if let Some(dir) = data_dir {
            self.data_dir = dir;
        }
        self
    }

    /// Raw-content root of the chart repository.
    pub fn chart_checkout_url(&self) -> String {
        format!(
            "{}/{}",
            self.raw_content.trim_end_matches('/'),
            self.releases_repo
        )
    }

    pub fn state_store(&self) -> StateStore {
        StateStore::new(&self.data_dir)
    }

    /// Dataset volume mounted when none was ever configured.
    pub fn default_dataset_volume(&self) -> Option<String> {
        BaseDirs::new().map(|dirs| dirs.home_dir().join("keel").join("data").display().to_string())
    }
}
