use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// The error type of all cache operations.
///
/// It is cheap to clone, as one failed population is handed to every caller that waited for
/// it.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The producer populating the entry returned an error.
    ///
    /// The producer's error is kept as-is, see [`producer_error`](Self::producer_error). Failures
    /// are never cached.
    #[error("producer failed: {0}")]
    ProducerFailure(Arc<dyn StdError + Send + Sync + 'static>),
    /// An explicit cache key was empty or malformed.
    #[error("invalid cache key: {0}")]
    InvalidKey(String),
    /// The caller gave up waiting for the population of an entry.
    ///
    /// The population itself keeps running.
    #[error("timed out after {0:?} waiting for cache population")]
    Timeout(Duration),
    /// The entry under the key holds a value of another type.
    #[error("cache entry {key} does not hold a `{expected}`")]
    TypeMismatch {
        key: String,
        expected: &'static str,
    },
    /// The cache has been shut down.
    #[error("cache has been shut down")]
    Shutdown,
    /// An unexpected error in the cache itself, such as a panicking producer.
    #[error("internal error")]
    InternalError,
}

impl CacheError {
    /// Wraps an error returned by a producer.
    pub fn producer<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self::ProducerFailure(Arc::from(err.into()))
    }

    /// Returns the error of a failed producer, if this is a [`ProducerFailure`](Self::ProducerFailure).
    ///
    /// The returned error can be downcast to the concrete type the producer returned.
    pub fn producer_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            Self::ProducerFailure(err) => Some(err.as_ref()),
            _ => None,
        }
    }

    /// A short tag describing the error, used for metrics.
    pub(crate) fn metrics_tag(&self) -> &'static str {
        match self {
            Self::ProducerFailure(_) => "producer",
            Self::InvalidKey(_) => "invalid_key",
            Self::Timeout(_) => "timeout",
            Self::TypeMismatch { .. } => "type_mismatch",
            Self::Shutdown => "shutdown",
            Self::InternalError => "internal",
        }
    }
}
