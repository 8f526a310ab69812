//! Error types for certificates, XML handling and signatures.

use sii_core::{ErrorKind, SiiError};
use thiserror::Error;

/// Failures inside the crypto layer.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Certificate file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File that failed.
        path: String,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// Certificate bundle or key is unusable (bad password, wrong format, non-RSA key).
    #[error("invalid certificate: {reason}")]
    InvalidCertificate {
        /// What was wrong.
        reason: String,
    },

    /// `now` is past `notAfter`.
    #[error("certificate expired at {not_after}")]
    Expired {
        /// End of the validity window.
        not_after: chrono::DateTime<chrono::Utc>,
    },

    /// `now` is before `notBefore`.
    #[error("certificate not valid before {not_before}")]
    NotYetValid {
        /// Start of the validity window.
        not_before: chrono::DateTime<chrono::Utc>,
    },

    /// Subject lacks an attribute needed to identify the signer.
    #[error("certificate subject has no {attribute}")]
    MissingSubjectAttribute {
        /// Missing attribute.
        attribute: &'static str,
    },

    /// Input is not well-formed XML.
    #[error("malformed XML: {0}")]
    Xml(String),

    /// Document has no root element.
    #[error("document has no root element")]
    NoRoot,

    /// No element carries the referenced id.
    #[error("no element with ID {0:?}")]
    ReferenceNotFound(String),

    /// Signature could not be produced.
    #[error("signing failed: {0}")]
    Signing(String),

    /// Signature did not verify.
    #[error("signature verification failed: {0}")]
    Verification(String),
}

impl CryptoError {
    /// Taxonomy entry for this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. }
            | Self::InvalidCertificate { .. }
            | Self::Expired { .. }
            | Self::NotYetValid { .. }
            | Self::MissingSubjectAttribute { .. } => ErrorKind::CertInvalid,
            Self::Xml(_) | Self::NoRoot | Self::ReferenceNotFound(_) => {
                ErrorKind::DocumentoInvalido
            }
            Self::Signing(_) | Self::Verification(_) => ErrorKind::Firma,
        }
    }

    pub(crate) fn certificate(reason: impl std::fmt::Display) -> Self {
        Self::InvalidCertificate {
            reason: reason.to_string(),
        }
    }

    pub(crate) fn xml(reason: impl std::fmt::Display) -> Self {
        Self::Xml(reason.to_string())
    }

    pub(crate) fn signing(reason: impl std::fmt::Display) -> Self {
        Self::Signing(reason.to_string())
    }

    pub(crate) fn verification(reason: impl std::fmt::Display) -> Self {
        Self::Verification(reason.to_string())
    }
}

impl From<CryptoError> for SiiError {
    fn from(err: CryptoError) -> Self {
        let kind = err.kind();
        let message = err.to_string();
        SiiError::wrap(kind, message, err)
    }
}
