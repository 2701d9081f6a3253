//! Container runtime and local registry interfaces.
//!
//! The coordinator drives image transfers through these seams:
//! - [`ContainerRuntime`]: pull/push/tag/list/remove/save/load primitives
//! - [`RegistryCatalog`]: whether the local registry already has an image
//!
//! [`HttpRegistryCatalog`] queries the registry's tag list over HTTP.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{CacheError, RuntimeError};
use crate::reference::ImageRef;

/// Container runtime operating on image references.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull an image from its upstream registry.
    async fn pull(&self, image: &str) -> Result<(), RuntimeError>;

    /// Add a second reference to a local image.
    async fn tag(&self, source: &str, target: &str) -> Result<(), RuntimeError>;

    /// Push an image, returning the captured transfer output.
    async fn push(&self, image: &str) -> Result<String, RuntimeError>;

    /// References of all images present locally.
    async fn list_local(&self) -> Result<Vec<String>, RuntimeError>;

    /// Remove a local image reference.
    async fn remove(&self, image: &str) -> Result<(), RuntimeError>;

    /// Export images into a tar archive at `dest`.
    async fn save(&self, images: &[String], dest: &Path) -> Result<(), RuntimeError>;

    /// Import images from an (optionally gzipped) tar archive.
    async fn load(&self, archive: &Path) -> Result<(), RuntimeError>;
}

/// Answers whether the local registry already holds an image.
#[async_trait]
pub trait RegistryCatalog: Send + Sync {
    async fn has_image(&self, image: &ImageRef, port: u16) -> Result<bool, CacheError>;
}

#[derive(Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// Tag-list lookups against a registry's v2 HTTP API.
#[derive(Debug, Clone)]
pub struct HttpRegistryCatalog {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl HttpRegistryCatalog {
    /// Catalog for `http://127.0.0.1:{port}`.
    pub fn new() -> Result<Self, CacheError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CacheError::RegistryUnavailable {
                registry: "127.0.0.1".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: None,
        })
    }

    /// Query a fixed base URL instead of the loopback port.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = Some(base_url.trim_end_matches('/').to_string());
        self
    }

    fn base(&self, port: u16) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| format!("http://127.0.0.1:{port}"))
    }
}

#[async_trait]
impl RegistryCatalog for HttpRegistryCatalog {
    async fn has_image(&self, image: &ImageRef, port: u16) -> Result<bool, CacheError> {
        if image.is_digest {
            return Ok(false);
        }

        let base = self.base(port);
        let url = format!("{base}/v2/{}/tags/list", image.repository);
        let unavailable = |message: String| CacheError::RegistryUnavailable {
            registry: base.clone(),
            message,
        };

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(unavailable(format!("tag list returned {}", response.status())));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        if body.is_empty() {
            return Ok(false);
        }

        let list: TagList =
            serde_json::from_slice(&body).map_err(|e| unavailable(format!("bad tag list: {e}")))?;
        let present = list
            .tags
            .unwrap_or_default()
            .iter()
            .any(|tag| tag == &image.reference);
        debug!(image = %image, present, "Checked local registry");
        Ok(present)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn catalog(server: &MockServer) -> HttpRegistryCatalog {
        HttpRegistryCatalog::new().unwrap().with_base_url(&server.uri())
    }

    #[tokio::test]
    async fn test_has_image_when_tag_listed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/keel-dev/app/tags/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "keel-dev/app",
                "tags": ["1.2.2", "1.2.3"]
            })))
            .mount(&server)
            .await;

        let catalog = catalog(&server).await;
        assert!(catalog
            .has_image(&ImageRef::parse("ghcr.io/keel-dev/app:1.2.3"), 5699)
            .await
            .unwrap());
        assert!(!catalog
            .has_image(&ImageRef::parse("ghcr.io/keel-dev/app:9.9.9"), 5699)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_missing_repository_is_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let catalog = catalog(&server).await;
        assert!(!catalog
            .has_image(&ImageRef::parse("alpine:3.18.3"), 5699)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_empty_body_and_null_tags_are_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/library/alpine/tags/list"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/library/busybox/tags/list"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"name": "library/busybox", "tags": null})),
            )
            .mount(&server)
            .await;

        let catalog = catalog(&server).await;
        assert!(!catalog
            .has_image(&ImageRef::parse("alpine:3.18.3"), 5699)
            .await
            .unwrap());
        assert!(!catalog
            .has_image(&ImageRef::parse("busybox:1"), 5699)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let catalog = catalog(&server).await;
        let err = catalog
            .has_image(&ImageRef::parse("alpine:3.18.3"), 5699)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::RegistryUnavailable { .. }));
    }
}
