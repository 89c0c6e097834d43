//! Error types for the request cache.

use std::sync::Arc;
use std::time::Duration;

/// Failure of a `RequestCache::fetch` call.
///
/// `Clone` because a single producer result is fanned out to every caller
/// that joined the in-flight fetch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("cache key must not be empty")]
    EmptyKey,
    #[error("cache has been shut down")]
    ShutDown,
    #[error("producer for `{key}` failed: {cause:#}")]
    Producer {
        key: String,
        cause: Arc<anyhow::Error>,
    },
    #[error("gave up waiting for in-flight fetch of `{key}` after {waited:?}")]
    WaitTimedOut { key: String, waited: Duration },
    #[error("fetch of `{key}` was cancelled")]
    Cancelled { key: String },
    #[error("producer for `{key}` panicked")]
    ProducerPanicked { key: String },
}

impl CacheError {
    /// True for the degraded outcome of a waiter that stopped waiting.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CacheError::WaitTimedOut { .. })
    }
}

/// Failure of a durable mirror read or write.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("mirror I/O failed for `{key}`")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("mirror entry for `{key}` is malformed")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}
