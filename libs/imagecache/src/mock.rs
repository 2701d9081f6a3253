//! In-memory container runtime and registry for tests and dry runs.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use tracing::{debug, info};

use crate::error::{CacheError, RuntimeError};
use crate::reference::ImageRef;
use crate::runtime::{ContainerRuntime, RegistryCatalog};

/// One pull observed by the mock.
#[derive(Debug, Clone)]
pub struct PullRecord {
    pub image: String,
    pub registry: String,
    /// Pulls for the same registry already running when this one started.
    pub concurrent_at_start: usize,
    /// Whether the registry had already answered with a rate limit.
    pub after_rate_limit: bool,
}

#[derive(Debug, Default)]
struct MockState {
    local: HashSet<String>,
    registry: HashSet<String>,
    in_flight: HashMap<String, usize>,
    pulls: Vec<PullRecord>,
    pushes: Vec<String>,
    removed: Vec<String>,
    saved: Vec<Vec<String>>,
    loaded: Vec<String>,
    rate_limited: HashSet<String>,
}

/// Mock runtime. Pushed images become visible through its
/// [`RegistryCatalog`] implementation.
#[derive(Debug, Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
    pull_delay: Duration,
    /// Registries whose first pull answers with a rate limit.
    rate_limit_once: HashSet<String>,
    failing_pulls: HashSet<String>,
    fail_pushes: bool,
    fail_saves: AtomicBool,
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every pull take `delay`.
    pub fn with_pull_delay(mut self, delay: Duration) -> Self {
        self.pull_delay = delay;
        self
    }

    /// The first pull from `registry` answers with a rate limit.
    pub fn rate_limiting(mut self, registry: &str) -> Self {
        self.rate_limit_once.insert(registry.to_string());
        self
    }

    /// Every pull of `image` fails.
    pub fn failing_pull(mut self, image: &str) -> Self {
        self.failing_pulls.insert(image.to_string());
        self
    }

    /// Pushes report success but never reach the registry.
    pub fn failing_pushes(mut self) -> Self {
        self.fail_pushes = true;
        self
    }

    /// Images already present locally.
    pub fn with_local_images<I, S>(self, images: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock().local.extend(images.into_iter().map(Into::into));
        self
    }

    /// Make `save` fail.
    pub fn fail_saves(&self) {
        self.fail_saves.store(true, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pulls(&self) -> Vec<PullRecord> {
        self.lock().pulls.clone()
    }

    pub fn pushes(&self) -> Vec<String> {
        self.lock().pushes.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.lock().removed.clone()
    }

    pub fn saved(&self) -> Vec<Vec<String>> {
        self.lock().saved.clone()
    }

    pub fn loaded(&self) -> Vec<String> {
        self.lock().loaded.clone()
    }

    pub fn has_local(&self, image: &str) -> bool {
        self.lock().local.contains(image)
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        let registry = ImageRef::parse(image).registry;
        let limited_now;
        {
            let mut state = self.lock();
            let after_rate_limit = state.rate_limited.contains(&registry);
            let running = state.in_flight.entry(registry.clone()).or_insert(0);
            let concurrent_at_start = *running;
            *running += 1;
            state.pulls.push(PullRecord {
                image: image.to_string(),
                registry: registry.clone(),
                concurrent_at_start,
                after_rate_limit,
            });
            limited_now = !after_rate_limit && self.rate_limit_once.contains(&registry);
        }
        info!(image = %image, "[MOCK] Pulling image");

        if !self.pull_delay.is_zero() {
            tokio::time::sleep(self.pull_delay).await;
        }

        let mut state = self.lock();
        if let Some(running) = state.in_flight.get_mut(&registry) {
            *running -= 1;
        }
        if limited_now {
            state.rate_limited.insert(registry.clone());
            return Err(RuntimeError::RateLimited { registry });
        }
        if self.failing_pulls.contains(image) {
            return Err(RuntimeError::RegistryUnavailable {
                registry,
                message: "connection reset".to_string(),
            });
        }
        state.local.insert(image.to_string());
        Ok(())
    }

    async fn tag(&self, source: &str, target: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        if !state.local.contains(source) {
            return Err(RuntimeError::NotFound {
                image: source.to_string(),
            });
        }
        state.local.insert(target.to_string());
        Ok(())
    }

    async fn push(&self, image: &str) -> Result<String, RuntimeError> {
        let mut state = self.lock();
        state.pushes.push(image.to_string());
        if self.fail_pushes {
            return Ok(format!("{image}: blob upload unknown"));
        }
        state.registry.insert(image.to_string());
        debug!(image = %image, "[MOCK] Pushed image");
        Ok(format!("{image}: digest: sha256:0000 size: 1"))
    }

    async fn list_local(&self) -> Result<Vec<String>, RuntimeError> {
        let mut images: Vec<String> = self.lock().local.iter().cloned().collect();
        images.sort();
        Ok(images)
    }

    async fn remove(&self, image: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        state.local.remove(image);
        state.removed.push(image.to_string());
        Ok(())
    }

    async fn save(&self, images: &[String], dest: &Path) -> Result<(), RuntimeError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(RuntimeError::Command {
                command: "save".to_string(),
                output: "mock save failure".to_string(),
            });
        }
        let listing = images.join("\n");
        tokio::fs::write(dest, listing.as_bytes()).await?;
        self.lock().saved.push(images.to_vec());
        Ok(())
    }

    async fn load(&self, archive: &Path) -> Result<(), RuntimeError> {
        let bytes = tokio::fs::read(archive).await?;
        let text = if bytes.starts_with(&[0x1f, 0x8b]) {
            let mut text = String::new();
            GzDecoder::new(bytes.as_slice()).read_to_string(&mut text)?;
            text
        } else {
            String::from_utf8_lossy(&bytes).into_owned()
        };
        let mut state = self.lock();
        state.loaded.push(archive.display().to_string());
        state.local.extend(
            text.lines()
                .filter(|l| !l.is_empty())
                .map(str::to_string),
        );
        Ok(())
    }
}

#[async_trait]
impl RegistryCatalog for MockRuntime {
    async fn has_image(&self, image: &ImageRef, port: u16) -> Result<bool, CacheError> {
        Ok(self.lock().registry.contains(&image.local_target(port)))
    }
}
