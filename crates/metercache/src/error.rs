//! Error types for metercache

use thiserror::Error;

use crate::config::ConfigError;
use crate::usage::QuotaExceeded;

/// Result type alias for cache and tracker operations
pub type Result<T> = std::result::Result<T, MeterError>;

/// Failures of the cache store, usage tracker and context wiring
#[derive(Debug, Error)]
pub enum MeterError {
    /// The persistence medium failed
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] meterstoredb::Error),

    /// The period's stored usage record could not be read, so the new count
    /// was kept in memory and not written back
    #[error("usage record {0} could not be loaded; counted in memory only")]
    UsageNotLoaded(String),

    /// A usage record could not be encoded
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration could not be loaded
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Outcome of a metered call that did not produce a payload
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The period quota is used up; the provider was not contacted
    #[error(transparent)]
    QuotaExceeded(#[from] QuotaExceeded),

    /// The provider capability failed; passed through untouched
    #[error("provider call failed: {0}")]
    Provider(#[source] E),
}

impl<E> CallError<E> {
    /// Whether this failure came from the quota guard
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, CallError::QuotaExceeded(_))
    }

    /// The provider's own error, if the provider failed
    pub fn into_provider_error(self) -> Option<E> {
        match self {
            CallError::Provider(e) => Some(e),
            CallError::QuotaExceeded(_) => None,
        }
    }
}
