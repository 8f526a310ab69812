//! # Error Taxonomy
//!
//! Every failure surfaced by the client carries an [`ErrorKind`] from a
//! closed taxonomy, a human message, an optional authority rejection
//! (status code + glosa) and an optional wrapped cause.
//!
//! ## Design
//!
//! - Only [`ErrorKind::Timeout`], [`ErrorKind::Conexion`] and
//!   [`ErrorKind::Servidor`] are retryable. Everything else fails the
//!   operation immediately.
//! - An authority rejection is a [`SiiError`] with [`SiiError::rejection`]
//!   set, so callers can tell "the authority said no" apart from
//!   "the authority could not be reached".
//! - Causes are preserved through [`std::error::Error::source`], never
//!   flattened into the message.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boxed cause carried by [`SiiError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convenience alias used across the workspace.
pub type Result<T, E = SiiError> = std::result::Result<T, E>;

/// Closed classification of client failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Session token missing, expired, or refused by the authority.
    AuthInvalid,
    /// Certificate unreadable, wrong password, non-RSA, or outside its validity window.
    CertInvalid,
    /// The request or the authority timed out.
    Timeout,
    /// Network-level failure reaching the authority.
    Conexion,
    /// The authority answered with a server-side failure.
    Servidor,
    /// The document is malformed or was rejected.
    DocumentoInvalido,
    /// The document or authorization was already registered.
    DocumentoDuplicado,
    /// The requested document or authorization does not exist.
    DocumentoNoEncontrado,
    /// Folio outside any usable authorization, or authorization unusable.
    FolioInvalido,
    /// Generic processing failure (parsing, storage, unexpected payloads).
    Procesamiento,
    /// Structural validation failure.
    Schema,
    /// Signature creation or verification failure.
    Firma,
    /// The caller cancelled the operation or its deadline elapsed.
    Cancelled,
}

impl ErrorKind {
    /// All kinds, in declaration order.
    pub const ALL: [ErrorKind; 13] = [
        Self::AuthInvalid,
        Self::CertInvalid,
        Self::Timeout,
        Self::Conexion,
        Self::Servidor,
        Self::DocumentoInvalido,
        Self::DocumentoDuplicado,
        Self::DocumentoNoEncontrado,
        Self::FolioInvalido,
        Self::Procesamiento,
        Self::Schema,
        Self::Firma,
        Self::Cancelled,
    ];

    /// Stable code reported to consumers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthInvalid => "AUTH_001",
            Self::CertInvalid => "AUTH_003",
            Self::Timeout => "COM_001",
            Self::Conexion => "COM_002",
            Self::Servidor => "COM_003",
            Self::DocumentoInvalido => "DTE_001",
            Self::DocumentoDuplicado => "DTE_002",
            Self::DocumentoNoEncontrado => "DTE_003",
            Self::FolioInvalido => "DTE_004",
            Self::Procesamiento => "PROC_001",
            Self::Schema => "PROC_002",
            Self::Firma => "PROC_003",
            Self::Cancelled => "CTX_001",
        }
    }

    /// Whether the retry executor may run the operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Conexion | Self::Servidor)
    }

    /// Short English label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthInvalid => "auth_invalid",
            Self::CertInvalid => "cert_invalid",
            Self::Timeout => "timeout",
            Self::Conexion => "connection",
            Self::Servidor => "server",
            Self::DocumentoInvalido => "invalid_document",
            Self::DocumentoDuplicado => "duplicate_document",
            Self::DocumentoNoEncontrado => "document_not_found",
            Self::FolioInvalido => "invalid_folio",
            Self::Procesamiento => "processing",
            Self::Schema => "schema",
            Self::Firma => "signature",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status code and glosa reported by the authority when it refuses something.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rejection {
    /// Authority status code, e.g. `RCH`.
    pub code: String,
    /// Human-readable explanation from the authority.
    pub glosa: String,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.glosa.is_empty() {
            f.write_str(&self.code)
        } else {
            write!(f, "{}: {}", self.code, self.glosa)
        }
    }
}

/// The error type returned by every client component.
#[derive(Error, Debug)]
#[error("[{}] {}", .kind.code(), .message)]
pub struct SiiError {
    kind: ErrorKind,
    message: String,
    rejection: Option<Rejection>,
    source: Option<BoxError>,
}

impl SiiError {
    /// Create an error with no cause.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            rejection: None,
            source: None,
        }
    }

    /// Create an error wrapping `cause`.
    pub fn wrap<E>(kind: ErrorKind, message: impl Into<String>, cause: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::new(kind, message).with_source(cause)
    }

    /// Authority rejection carrying its code and glosa.
    pub fn rejected(kind: ErrorKind, code: impl Into<String>, glosa: impl Into<String>) -> Self {
        let rejection = Rejection {
            code: code.into(),
            glosa: glosa.into(),
        };
        Self {
            kind,
            message: format!("rejected by authority ({rejection})"),
            rejection: Some(rejection),
            source: None,
        }
    }

    /// Caller cancelled the operation.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }

    /// Caller deadline elapsed.
    pub fn deadline_exceeded() -> Self {
        Self::new(ErrorKind::Cancelled, "deadline exceeded")
    }

    /// Attach a cause.
    pub fn with_source<E>(mut self, cause: E) -> Self
    where
        E: Into<BoxError>,
    {
        self.source = Some(cause.into());
        self
    }

    /// Wrap this error after `attempts` tries, keeping the kind and any rejection.
    pub fn after_attempts(self, attempts: u32) -> Self {
        let kind = self.kind;
        let rejection = self.rejection.clone();
        let message = format!("failed after {attempts} attempts: {}", self.message);
        Self {
            kind,
            message,
            rejection,
            source: Some(Box::new(self)),
        }
    }

    /// The taxonomy entry.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The message without the code prefix.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Authority code and glosa, when the authority refused the request.
    pub fn rejection(&self) -> Option<&Rejection> {
        self.rejection.as_ref()
    }

    /// Shorthand for `self.kind().is_retryable()`.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// True when this error reports an authority decision, not a transport failure.
    pub fn is_rejection(&self) -> bool {
        self.rejection.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn only_network_kinds_are_retryable() {
        let retryable: Vec<ErrorKind> = ErrorKind::ALL
            .iter()
            .copied()
            .filter(ErrorKind::is_retryable)
            .collect();
        assert_eq!(
            retryable,
            vec![ErrorKind::Timeout, ErrorKind::Conexion, ErrorKind::Servidor]
        );
    }

    #[test]
    fn codes_are_unique() {
        let mut codes: Vec<&str> = ErrorKind::ALL.iter().map(ErrorKind::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), ErrorKind::ALL.len());
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = SiiError::new(ErrorKind::CertInvalid, "certificate expired");
        assert_eq!(err.to_string(), "[AUTH_003] certificate expired");
    }

    #[test]
    fn wrapped_cause_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.p12");
        let err = SiiError::wrap(ErrorKind::CertInvalid, "cannot read certificate", io);
        let source = err.source().map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("missing.p12"));
    }

    #[test]
    fn rejection_carries_code_and_glosa() {
        let err = SiiError::rejected(ErrorKind::DocumentoInvalido, "RCH", "Folio repetido");
        assert!(err.is_rejection());
        let rejection = err.rejection().cloned();
        assert_eq!(
            rejection,
            Some(Rejection {
                code: "RCH".into(),
                glosa: "Folio repetido".into()
            })
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn after_attempts_keeps_kind_and_chains_last_error() {
        let err = SiiError::new(ErrorKind::Servidor, "503").after_attempts(4);
        assert_eq!(err.kind(), ErrorKind::Servidor);
        assert!(err.message().contains("4 attempts"));
        let inner = err.source().map(ToString::to_string);
        assert_eq!(inner.as_deref(), Some("[COM_003] 503"));
    }
}
