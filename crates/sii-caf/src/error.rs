//! Storage errors for folio authorizations.

use sii_cache::CacheError;
use sii_core::{ErrorKind, SiiError};
use thiserror::Error;

/// Failures inside a [`crate::CafRepository`] backend.
#[derive(Error, Debug)]
pub enum CafError {
    /// File-system access failed.
    #[error("CAF store I/O on {path}: {source}")]
    Io {
        /// Path that failed.
        path: String,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// A stored record could not be decoded.
    #[error("corrupt CAF record {id}: {reason}")]
    Corrupt {
        /// Record id.
        id: String,
        /// What was wrong.
        reason: String,
    },

    /// Id is not usable as a storage name.
    #[error("invalid CAF id {0:?}")]
    InvalidId(String),

    /// No record with this id.
    #[error("CAF {0} not found")]
    NotFound(String),

    /// A blocking store task did not complete.
    #[error("CAF store task failed: {0}")]
    Task(String),

    /// Cache backend failure.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl CafError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl From<CafError> for SiiError {
    fn from(err: CafError) -> Self {
        let kind = match &err {
            CafError::NotFound(_) => ErrorKind::DocumentoNoEncontrado,
            CafError::InvalidId(_) => ErrorKind::DocumentoInvalido,
            _ => ErrorKind::Procesamiento,
        };
        SiiError::wrap(kind, err.to_string(), err)
    }
}
