//! Two-stage image caching: pull from upstream, push to the local registry.
//!
//! Each image is an independent task. The pull stage gates tasks per
//! upstream registry with a [`RegistryLimits`] map; the push stage uses one
//! global worker pool because the local registry is a single shared
//! resource. The first image to exhaust its attempts cancels the batch:
//! running transfers finish, no new attempts start, and the batch reports
//! only after every task has exited.

use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_manifest::InstallationManifest;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CacheError, RuntimeError};
use crate::limiter::RegistryLimits;
use crate::reference::ImageRef;
use crate::runtime::{ContainerRuntime, RegistryCatalog};

/// Concurrent pulls allowed against the application's own registry.
pub const APP_REGISTRY_LIMIT: usize = 2;

/// Retry and concurrency settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Pull attempts per image.
    pub pull_attempts: u32,
    /// Fixed delay between pull attempts.
    pub pull_backoff: Duration,
    /// Push attempts per image.
    pub push_attempts: u32,
    /// Fixed delay between push attempts.
    pub push_backoff: Duration,
    /// Concurrent pushes into the local registry.
    pub push_workers: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            pull_attempts: 3,
            pull_backoff: Duration::from_secs(2),
            push_attempts: 3,
            push_backoff: Duration::from_secs(10),
            push_workers: 2,
        }
    }
}

/// What a caching batch did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheReport {
    /// Already in the local registry.
    pub skipped: Vec<String>,
    /// Pulled from upstream.
    pub pulled: Vec<String>,
    /// Pushed into the local registry.
    pub pushed: Vec<String>,
}

/// Registry limits with the application registry capped at
/// [`APP_REGISTRY_LIMIT`].
pub fn registry_limits_for(manifest: &InstallationManifest) -> RegistryLimits {
    let limits = RegistryLimits::default();
    match manifest.images.app_images.iter().find(|i| !i.is_empty()) {
        Some(image) => limits.with_override(&ImageRef::parse(image).registry, APP_REGISTRY_LIMIT),
        None => limits,
    }
}

/// Gets images into the local registry.
pub struct ImageCacheCoordinator {
    runtime: Arc<dyn ContainerRuntime>,
    catalog: Arc<dyn RegistryCatalog>,
    limits: Arc<RegistryLimits>,
    config: CoordinatorConfig,
}

impl ImageCacheCoordinator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        catalog: Arc<dyn RegistryCatalog>,
        limits: RegistryLimits,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            runtime,
            catalog,
            limits: Arc::new(limits),
            config,
        }
    }

    pub fn limits(&self) -> &RegistryLimits {
        &self.limits
    }

    /// Make `images` available from the local registry on `registry_port`.
    ///
    /// Images already in the registry are skipped. Airgap installs push
    /// from the images loaded out of the bundle and never pull.
    pub async fn cache_images(
        &self,
        images: &[String],
        registry_port: u16,
        is_airgap: bool,
    ) -> Result<CacheReport, CacheError> {
        let start = Instant::now();
        let mut report = CacheReport::default();
        let mut missing = Vec::new();

        for image in dedup(images) {
            if self
                .catalog
                .has_image(&ImageRef::parse(&image), registry_port)
                .await?
            {
                report.skipped.push(image);
            } else {
                missing.push(image);
            }
        }

        if missing.is_empty() {
            info!(skipped = report.skipped.len(), "All images already cached");
            return Ok(report);
        }

        if !is_airgap {
            let local = self.runtime.list_local().await.unwrap_or_else(|e| {
                warn!(error = %e, "Could not list local images, pulling all");
                Vec::new()
            });
            let to_pull: Vec<String> = missing
                .iter()
                .filter(|image| !local.contains(image))
                .cloned()
                .collect();
            report.pulled = self.pull_images(&to_pull).await?;
        }

        report.pushed = self.push_images(&missing, registry_port).await?;

        info!(
            skipped = report.skipped.len(),
            pulled = report.pulled.len(),
            pushed = report.pushed.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Cached images"
        );
        Ok(report)
    }

    /// Pull every image from upstream.
    pub async fn pull_images(&self, images: &[String]) -> Result<Vec<String>, CacheError> {
        let cancel = CancellationToken::new();
        let mut workers = JoinSet::new();

        for image in dedup(images) {
            workers.spawn(pull_with_retry(
                Arc::clone(&self.runtime),
                Arc::clone(&self.limits),
                image,
                self.config.clone(),
                cancel.clone(),
            ));
        }

        info!(images = workers.len(), "Pulling images");
        join_batch(workers, &cancel).await
    }

    /// Push local images into the registry on `port`.
    async fn push_images(&self, images: &[String], port: u16) -> Result<Vec<String>, CacheError> {
        let cancel = CancellationToken::new();
        let pool = Arc::new(Semaphore::new(self.config.push_workers.max(1)));
        let mut workers = JoinSet::new();

        for image in dedup(images) {
            workers.spawn(push_with_retry(
                Arc::clone(&self.runtime),
                Arc::clone(&self.catalog),
                Arc::clone(&pool),
                image,
                port,
                self.config.clone(),
                cancel.clone(),
            ));
        }

        info!(images = workers.len(), port, "Pushing images to local registry");
        join_batch(workers, &cancel).await
    }
}

/// Wait for every worker, keeping the first real failure.
async fn join_batch(
    mut workers: JoinSet<Result<String, CacheError>>,
    cancel: &CancellationToken,
) -> Result<Vec<String>, CacheError> {
    let mut done = Vec::new();
    let mut failure = None;

    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(image)) => done.push(image),
            Ok(Err(CacheError::Cancelled)) => {}
            Ok(Err(err)) => {
                failure.get_or_insert(err);
            }
            Err(err) => {
                cancel.cancel();
                failure.get_or_insert(CacheError::Worker(err.to_string()));
            }
        }
    }

    match failure {
        Some(err) => Err(err),
        None if cancel.is_cancelled() => Err(CacheError::Cancelled),
        None => Ok(done),
    }
}

async fn pull_with_retry(
    runtime: Arc<dyn ContainerRuntime>,
    limits: Arc<RegistryLimits>,
    image: String,
    config: CoordinatorConfig,
    cancel: CancellationToken,
) -> Result<String, CacheError> {
    let registry = ImageRef::parse(&image).registry;
    let limiter = limits.limiter(&registry);

    let permit = tokio::select! {
        permit = limiter.acquire() => permit,
        _ = cancel.cancelled() => return Err(CacheError::Cancelled),
    };

    let mut attempt = 0;
    loop {
        attempt += 1;

        limiter.wait_if_over_limit(&permit).await;
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        debug!(image = %image, registry = %registry, attempt, "Pulling image");
        let err = match runtime.pull(&image).await {
            Ok(()) => {
                info!(image = %image, attempt, "Pulled image");
                return Ok(image);
            }
            Err(err) => err,
        };

        if let RuntimeError::RateLimited { .. } = err {
            limits.throttle(&registry);
        }
        warn!(image = %image, attempt, error = %err, "Image pull failed");

        if attempt >= config.pull_attempts || !err.is_retryable() {
            cancel.cancel();
            return Err(CacheError::PullExhausted {
                image,
                attempts: attempt,
                source: err,
            });
        }

        tokio::select! {
            _ = tokio::time::sleep(config.pull_backoff) => {}
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
        }
    }
}

async fn push_with_retry(
    runtime: Arc<dyn ContainerRuntime>,
    catalog: Arc<dyn RegistryCatalog>,
    pool: Arc<Semaphore>,
    image: String,
    port: u16,
    config: CoordinatorConfig,
    cancel: CancellationToken,
) -> Result<String, CacheError> {
    let _slot = tokio::select! {
        slot = pool.acquire_owned() => slot.map_err(|e| CacheError::Worker(e.to_string()))?,
        _ = cancel.cancelled() => return Err(CacheError::Cancelled),
    };

    let reference = ImageRef::parse(&image);
    let target = reference.local_target(port);

    let mut attempt = 0;
    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        debug!(image = %image, target = %target, attempt, "Pushing image");
        let output = match runtime.tag(&image, &target).await {
            Ok(()) => match runtime.push(&target).await {
                Ok(output) => output,
                Err(err) => err.to_string(),
            },
            Err(err) => err.to_string(),
        };

        match catalog.has_image(&reference, port).await {
            Ok(true) => {
                info!(image = %image, attempt, "Pushed image to local registry");
                return Ok(image);
            }
            Ok(false) => {}
            Err(err) => debug!(image = %image, error = %err, "Registry check failed after push"),
        }

        warn!(image = %image, attempt, output = %output, "Image push did not land");
        if attempt >= config.push_attempts {
            cancel.cancel();
            return Err(CacheError::PushExhausted {
                image,
                attempts: attempt,
                output,
            });
        }

        tokio::select! {
            _ = tokio::time::sleep(config.push_backoff) => {}
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
        }
    }
}

fn dedup(images: &[String]) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(images.len());
    for image in images.iter().filter(|i| !i.is_empty()) {
        if !unique.contains(image) {
            unique.push(image.clone());
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_drops_empty_and_repeats() {
        let images = vec![
            "a:1".to_string(),
            String::new(),
            "b:1".to_string(),
            "a:1".to_string(),
        ];
        assert_eq!(dedup(&images), vec!["a:1", "b:1"]);
    }

    #[test]
    fn test_registry_limits_for_manifest() {
        let manifest = keel_manifest::generate::ManifestGenerator::default().build(
            "https://charts.keel.dev",
            "1.0.0",
            "0.1.0",
            vec!["ghcr.io/keel-dev/app:1.0.0".to_string()],
            None,
        );
        let limits = registry_limits_for(&manifest);
        assert_eq!(limits.limit_for("ghcr.io"), APP_REGISTRY_LIMIT);
        assert_eq!(limits.limit_for("docker.io"), crate::limiter::DEFAULT_REGISTRY_LIMIT);
    }
}
