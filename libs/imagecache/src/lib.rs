//! Image caching for keel installations.
//!
//! Gets the images an installation needs into the local registry so the
//! cluster can start without reaching upstream registries:
//!
//! - [`method`]: which caching method applies and which images it covers
//! - [`ImageCacheCoordinator`]: pull stage gated per upstream registry,
//!   then a push stage into the local registry
//! - [`RegistryLimits`]: per-registry concurrency that drops to one after a
//!   rate-limit response
//!
//! Runtimes are reached through [`ContainerRuntime`]; [`DockerCli`] drives
//! the docker CLI and [`MockRuntime`] keeps everything in memory.

mod coordinator;
mod docker;
mod error;
mod limiter;
pub mod method;
mod mock;
mod reference;
mod runtime;

pub use coordinator::{
    registry_limits_for, CacheReport, CoordinatorConfig, ImageCacheCoordinator,
    APP_REGISTRY_LIMIT,
};
pub use docker::{classify_pull_failure, DockerCli};
pub use error::{CacheError, RuntimeError};
pub use limiter::{DynamicLimiter, LimiterPermit, RegistryLimits, DEFAULT_REGISTRY_LIMIT};
pub use method::{images_to_cache, images_to_clean, select_caching_method, Platform};
pub use mock::{MockRuntime, PullRecord};
pub use reference::{normalize_registry, ImageRef, DOCKER_HUB};
pub use runtime::{ContainerRuntime, HttpRegistryCatalog, RegistryCatalog};
