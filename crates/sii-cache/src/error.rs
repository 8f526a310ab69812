//! Cache error types.

use sii_core::{ErrorKind, SiiError};
use thiserror::Error;

/// Errors from a key-value backend.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The backend could not complete the operation.
    #[error("cache backend error: {0}")]
    Backend(String),

    /// A stored value could not be encoded or decoded.
    #[error("cache serialization error for {key}: {source}")]
    Serialization {
        /// Key being read or written.
        key: String,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// The key holds a value of another type (plain value vs set).
    #[error("key {key} holds a value of a different type")]
    WrongType {
        /// Offending key.
        key: String,
    },
}

impl From<CacheError> for SiiError {
    fn from(err: CacheError) -> Self {
        SiiError::wrap(ErrorKind::Procesamiento, "cache operation failed", err)
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Backend(err.to_string())
    }
}
