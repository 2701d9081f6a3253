//! Image reference parsing.

use std::fmt;

/// Canonical host for Docker Hub images.
pub const DOCKER_HUB: &str = "docker.io";

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    /// Registry host, with Docker Hub aliases folded into `docker.io`.
    pub registry: String,
    /// Repository path, e.g. `library/alpine`.
    pub repository: String,
    /// Tag, or a digest when `is_digest` is set.
    pub reference: String,
    pub is_digest: bool,
}

impl ImageRef {
    /// Parse `[registry/]repository[:tag|@digest]`.
    pub fn parse(image: &str) -> Self {
        let image = image.trim();
        let (name, reference, is_digest) = if let Some((name, digest)) = image.rsplit_once('@') {
            (name, digest.to_string(), true)
        } else if let Some((name, tag)) = image.rsplit_once(':') {
            if tag.contains('/') {
                // `host:port/repo` without a tag
                (image, "latest".to_string(), false)
            } else {
                (name, tag.to_string(), false)
            }
        } else {
            (image, "latest".to_string(), false)
        };

        let (registry, repository) = match name.split_once('/') {
            None => (DOCKER_HUB.to_string(), format!("library/{name}")),
            Some((host, rest))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                let registry = normalize_registry(host);
                let repository = if registry == DOCKER_HUB && !rest.contains('/') {
                    format!("library/{rest}")
                } else {
                    rest.to_string()
                };
                (registry, repository)
            }
            Some(_) => (DOCKER_HUB.to_string(), name.to_string()),
        };

        Self {
            registry,
            repository,
            reference,
            is_digest,
        }
    }

    /// Reference of this image inside the local registry on `port`.
    pub fn local_target(&self, port: u16) -> String {
        format!("127.0.0.1:{port}/{}", self.path_with_reference())
    }

    fn path_with_reference(&self) -> String {
        let separator = if self.is_digest { '@' } else { ':' };
        format!("{}{}{}", self.repository, separator, self.reference)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.path_with_reference())
    }
}

/// Fold Docker Hub host aliases into one key.
pub fn normalize_registry(host: &str) -> String {
    match host {
        "index.docker.io" | "registry-1.docker.io" | "docker.io" => DOCKER_HUB.to_string(),
        other => other.to_string(),
    }
}
