//! Per-registry dynamic concurrency limits.
//!
//! A [`DynamicLimiter`] is a counting gate whose capacity can change while
//! permits are held. Every capacity change and every release is broadcast
//! to all waiters, since each waiter's wake condition depends on the
//! current capacity. Holders that were admitted under a larger capacity
//! call [`DynamicLimiter::wait_if_over_limit`] at safe points to pause until
//! the gate is back under its cap.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::reference::normalize_registry;

/// Default concurrent pulls per registry.
pub const DEFAULT_REGISTRY_LIMIT: usize = 10;

#[derive(Debug)]
struct LimiterState {
    limit: usize,
    active: usize,
    /// Holders currently paused in `wait_if_over_limit`.
    waiting: usize,
}

/// Counting gate with a resizable capacity.
#[derive(Debug)]
pub struct DynamicLimiter {
    state: Mutex<LimiterState>,
    changed: Notify,
}

/// A held slot. Dropping it releases the slot and wakes all waiters.
#[derive(Debug)]
pub struct LimiterPermit {
    limiter: Arc<DynamicLimiter>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

impl DynamicLimiter {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LimiterState {
                limit: limit.max(1),
                active: 0,
                waiting: 0,
            }),
            changed: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn limit(&self) -> usize {
        self.lock().limit
    }

    pub fn active(&self) -> usize {
        self.lock().active
    }

    /// Wait for a free slot.
    pub async fn acquire(self: &Arc<Self>) -> LimiterPermit {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the check and
            // the await is not lost.
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.active < state.limit {
                    state.active += 1;
                    return LimiterPermit {
                        limiter: Arc::clone(self),
                    };
                }
            }

            notified.await;
        }
    }

    /// Change the capacity and wake every waiter. A capacity of zero is
    /// raised to one.
    pub fn set_limit(&self, limit: usize) {
        {
            let mut state = self.lock();
            state.limit = limit.max(1);
            debug!(limit = state.limit, active = state.active, "Limiter capacity changed");
        }
        self.changed.notify_waiters();
    }

    /// Pause a permit holder while more holders are running than the
    /// capacity allows.
    ///
    /// Paused holders do not count as running. A holder continues once the
    /// running holders, itself included, fit under the capacity, so if
    /// every holder is paused one of them always continues.
    pub async fn wait_if_over_limit(&self, _permit: &LimiterPermit) {
        self.lock().waiting += 1;

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                let running = state.active - (state.waiting - 1);
                if running <= state.limit {
                    state.waiting -= 1;
                    return;
                }
            }

            notified.await;
        }
    }

    fn release(&self) {
        {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);
        }
        self.changed.notify_waiters();
    }
}

/// Lazily created limiters keyed by registry host.
#[derive(Debug)]
pub struct RegistryLimits {
    default_limit: usize,
    overrides: HashMap<String, usize>,
    limiters: Mutex<HashMap<String, Arc<DynamicLimiter>>>,
    throttled: Mutex<HashSet<String>>,
}

impl RegistryLimits {
    pub fn new(default_limit: usize) -> Self {
        Self {
            default_limit,
            overrides: HashMap::new(),
            limiters: Mutex::new(HashMap::new()),
            throttled: Mutex::new(HashSet::new()),
        }
    }

    /// Use a different starting capacity for one registry host.
    pub fn with_override(mut self, registry: &str, limit: usize) -> Self {
        self.overrides.insert(normalize_registry(registry), limit);
        self
    }

    /// The limiter for a registry host, created on first use.
    pub fn limiter(&self, registry: &str) -> Arc<DynamicLimiter> {
        let key = normalize_registry(registry);
        let mut limiters = self.limiters.lock().unwrap_or_else(PoisonError::into_inner);
        let limit = self.overrides.get(&key).copied().unwrap_or(self.default_limit);
        Arc::clone(
            limiters
                .entry(key)
                .or_insert_with(|| DynamicLimiter::new(limit)),
        )
    }

    /// Current capacity for a registry host.
    pub fn limit_for(&self, registry: &str) -> usize {
        self.limiter(registry).limit()
    }

    /// Drop a registry to a single concurrent pull after it rate-limited
    /// us. Returns true the first time a registry is throttled.
    pub fn throttle(&self, registry: &str) -> bool {
        let key = normalize_registry(registry);
        let first = self
            .throttled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        if first {
            warn!(registry = %key, "Registry is rate limiting, reducing to one concurrent pull");
            self.limiter(&key).set_limit(1);
        }
        first
    }
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTRY_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_respects_limit() {
        let limiter = DynamicLimiter::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let limiter = Arc::clone(&limiter);
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            tasks.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 2);
        assert_eq!(limiter.active(), 0);
    }

    #[tokio::test]
    async fn test_raising_limit_wakes_every_waiter() {
        let limiter = DynamicLimiter::new(1);
        let _held = limiter.acquire().await;

        let acquired = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..3 {
            let limiter = Arc::clone(&limiter);
            let acquired = Arc::clone(&acquired);
            tasks.push(tokio::spawn(async move {
                let permit = limiter.acquire().await;
                acquired.fetch_add(1, Ordering::SeqCst);
                permit
            }));
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(acquired.load(Ordering::SeqCst), 0);

        // No permit is released: only the broadcast can wake the waiters.
        limiter.set_limit(4);
        let permits = tokio::time::timeout(Duration::from_secs(1), async {
            let mut permits = Vec::new();
            for task in tasks {
                permits.push(task.await.unwrap());
            }
            permits
        })
        .await
        .expect("all waiters should be woken by the limit change");

        assert_eq!(permits.len(), 3);
        assert_eq!(limiter.active(), 4);
    }

    #[tokio::test]
    async fn test_zero_limit_is_clamped() {
        let limiter = DynamicLimiter::new(0);
        assert_eq!(limiter.limit(), 1);
        limiter.set_limit(0);
        assert_eq!(limiter.limit(), 1);
        let _permit = limiter.acquire().await;
    }

    #[tokio::test]
    async fn test_wait_if_over_limit_admits_one_holder_at_a_time() {
        let limiter = DynamicLimiter::new(3);
        let mut permits = Vec::new();
        for _ in 0..3 {
            permits.push(limiter.acquire().await);
        }
        limiter.set_limit(1);

        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for permit in permits {
            let limiter = Arc::clone(&limiter);
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            tasks.push(tokio::spawn(async move {
                limiter.wait_if_over_limit(&permit).await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            }));
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            for task in tasks {
                task.await.unwrap();
            }
        })
        .await
        .expect("paused holders must not deadlock");

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(limiter.active(), 0);
    }

    #[tokio::test]
    async fn test_wait_if_over_limit_passes_under_cap() {
        let limiter = DynamicLimiter::new(2);
        let permit = limiter.acquire().await;
        tokio::time::timeout(Duration::from_millis(100), limiter.wait_if_over_limit(&permit))
            .await
            .unwrap();
    }

    #[test]
    fn test_registry_limits() {
        let limits = RegistryLimits::new(10).with_override("ghcr.io", 2);
        assert_eq!(limits.limit_for("docker.io"), 10);
        assert_eq!(limits.limit_for("ghcr.io"), 2);
        assert!(Arc::ptr_eq(
            &limits.limiter("index.docker.io"),
            &limits.limiter("docker.io")
        ));

        assert!(limits.throttle("registry-1.docker.io"));
        assert!(!limits.throttle("docker.io"));
        assert_eq!(limits.limit_for("docker.io"), 1);
        assert_eq!(limits.limit_for("ghcr.io"), 2);
    }
}
