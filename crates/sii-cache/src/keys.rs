//! # Key Namespaces
//!
//! Every consumer builds its keys through [`KeySpace`] so backends shared
//! between deployments never collide.

use std::time::Duration;

use sii_core::{Ambiente, Rut, TipoDte};

/// Default prefix for every key.
pub const DEFAULT_PREFIX: &str = "sii";

/// Default lifetime of cached folio authorizations.
pub const CAF_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default lifetime of cached certificates.
pub const CERTIFICATE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default lifetime of session tokens.
pub const TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

/// Prefix-scoped key builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl KeySpace {
    /// Key space rooted at `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The configured prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Serialized folio authorization record.
    pub fn caf(&self, id: &str) -> String {
        format!("{}:caf:{id}", self.prefix)
    }

    /// Prefix shared by every folio authorization key, including indexes.
    pub fn caf_prefix(&self) -> String {
        format!("{}:caf:", self.prefix)
    }

    /// Set of authorization ids for one document type.
    pub fn caf_type_index(&self, tipo: TipoDte) -> String {
        format!("{}:caf:tipo:{}", self.prefix, tipo.code())
    }

    /// Cached certificate for a taxpayer.
    pub fn certificate(&self, rut: &Rut) -> String {
        format!("{}:cert:{rut}", self.prefix)
    }

    /// Session token for a taxpayer in one environment.
    pub fn session_token(&self, rut: &Rut, ambiente: Ambiente) -> String {
        format!("{}:token:{rut}:{}", self.prefix, ambiente.as_str())
    }
}
