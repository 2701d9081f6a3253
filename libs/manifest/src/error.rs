//! Error types for the manifest model.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from version parsing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VersionError {
    /// The string is not `vMAJOR.MINOR.PATCH[-suffix]`.
    #[error("invalid version '{0}': expected MAJOR.MINOR.PATCH")]
    Malformed(String),
}

/// Errors from decoding or encoding manifests and params.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Schema version is not the one this build understands.
    #[error("unsupported {kind} schema version '{found}' (supported: '{supported}')")]
    UnsupportedVersion {
        kind: &'static str,
        found: String,
        supported: &'static str,
    },

    /// YAML could not be decoded or encoded.
    #[error("invalid {kind} document: {source}")]
    Yaml {
        kind: &'static str,
        #[source]
        source: serde_yaml::Error,
    },

    /// A value inside the document is invalid.
    #[error("invalid {field}: {message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },
}

/// Errors from the persisted state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing a state file failed.
    #[error("state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A state file exists but is not a valid document.
    #[error("state file {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: ManifestError,
    },

    /// The in-memory state could not be serialized for writing.
    #[error("cannot encode state file {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: ManifestError,
    },
}

/// Errors from manifest generation.
#[derive(Debug, Error)]
pub enum GenerateError {
    /// A resource could not be fetched.
    #[error("failed to fetch {resource}: {message}")]
    Fetch { resource: String, message: String },

    /// The release list has no tag matching the naming pattern.
    #[error("no release tag matching '{prefix}<version>' found")]
    NoMatchingTag { prefix: String },

    /// A chart descriptor or tag does not carry a usable version.
    #[error("cannot determine version from '{0}'")]
    NoVersion(String),

    /// The fetched manifest failed validation.
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

impl From<reqwest::Error> for GenerateError {
    fn from(err: reqwest::Error) -> Self {
        Self::Fetch {
            resource: err
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "<unknown>".to_string()),
            message: err.to_string(),
        }
    }
}
