//! Error taxonomy of the crate.
//!
//! Cache-layer faults are absorbed by the read path and only logged; everything that prevents reaching the record
//! store is surfaced. The "cache is down" condition is not an error: it is reported through
//! [`Liveness`](crate::types::Liveness) and [`CacheOutcome::Skipped`](crate::types::CacheOutcome::Skipped).
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or malformed record identifier.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The record store has no record under the identifier.
    #[error("record '{0}' not found")]
    NotFound(String),

    /// The record store could not be reached. Fatal for a read: there is no further fallback.
    #[error("record store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("cache write for '{key}' failed: {reason}")]
    CacheWriteFailed { key: String, reason: String },

    #[error("cache delete for '{key}' failed: {reason}")]
    CacheDeleteFailed { key: String, reason: String },

    /// A cached value exists but can't be decoded. Signals corruption of the keyspace.
    #[error("corrupt cache entry for '{key}': {reason}")]
    CorruptEntry { key: String, reason: String },

    #[error("malformed change notification for '{0}'")]
    MalformedChange(String),

    /// Raw failure reported by a cache backend implementation.
    #[error("cache backend: {0}")]
    Backend(String),

    #[error("provisioning: {0}")]
    Provisioning(String),

    #[error("configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Cli(#[from] clap::Error),

    #[error(transparent)]
    Builder(#[from] fieldx::error::FieldXError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "redis")]
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

impl Error {
    /// Errors a change feed delivery mechanism may want to redeliver the triggering event for.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CacheWriteFailed { .. } | Self::CacheDeleteFailed { .. } | Self::StoreUnavailable(_)
        )
    }

    /// HTTP-equivalent status a caller of the read endpoint gets for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) => 400,
            Self::NotFound(_) => 404,
            _ => 500,
        }
    }
}

impl From<garde::Report> for Error {
    fn from(report: garde::Report) -> Self {
        Self::Config(report.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
