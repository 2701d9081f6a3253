use thiserror::Error;

/// Errors from the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The upstream registry answered with a rate-limit response.
    #[error("registry {registry} is rate limiting requests")]
    RateLimited { registry: String },

    /// The upstream registry could not be reached.
    #[error("registry {registry} is unavailable: {message}")]
    RegistryUnavailable { registry: String, message: String },

    /// The image does not exist.
    #[error("image {image} not found")]
    NotFound { image: String },

    /// A runtime command failed.
    #[error("{command} failed: {output}")]
    Command { command: String, output: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound { .. })
    }
}

/// Errors from caching images.
#[derive(Debug, Error)]
pub enum CacheError {
    /// An image could not be pulled within the attempt budget.
    #[error("failed to pull image {image} after {attempts} attempts: {source}")]
    PullExhausted {
        image: String,
        attempts: u32,
        #[source]
        source: RuntimeError,
    },

    /// An image could not be pushed to the local registry.
    #[error("failed to push image {image} after {attempts} attempts\n{output}")]
    PushExhausted {
        image: String,
        attempts: u32,
        /// Captured transfer output of the last attempt.
        output: String,
    },

    /// The local registry's tag list could not be queried.
    #[error("registry {registry} is unavailable: {message}")]
    RegistryUnavailable { registry: String, message: String },

    /// The requested caching method cannot be used in this mode.
    #[error("image caching method {method} is not available for {mode} installations")]
    MethodUnavailable { method: String, mode: &'static str },

    /// The batch was cancelled after another image failed.
    #[error("image caching cancelled")]
    Cancelled,

    /// A worker task panicked or was aborted.
    #[error("image caching worker failed: {0}")]
    Worker(String),
}
