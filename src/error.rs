//! Cache error types

use std::sync::Arc;

use redis::RedisError;

/// Boxed error accepted from storage backends and data sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error produced by the data source, shareable with coalesced callers.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The key is absent or expired. Expected outcome of a lookup, never a failure.
    #[error("Not found")]
    NotFound,

    #[error("Backend error: {0}")]
    Backend(#[source] BoxError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(#[source] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The data source's own error, passed through unchanged.
    #[error("{0}")]
    Upstream(SharedError),
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound)
    }

    pub(crate) fn backend(message: impl Into<String>) -> Self {
        CacheError::Backend(message.into().into())
    }

    pub(crate) fn upstream(err: impl Into<BoxError>) -> Self {
        CacheError::Upstream(Arc::from(err.into()))
    }
}

impl From<RedisError> for CacheError {
    fn from(err: RedisError) -> Self {
        CacheError::Backend(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_distinguished() {
        assert!(CacheError::NotFound.is_not_found());
        assert!(!CacheError::backend("boom").is_not_found());
    }

    #[test]
    fn upstream_error_displays_unchanged() {
        let err = CacheError::upstream("record not found");
        assert_eq!(err.to_string(), "record not found");
    }
}
