//! # Certificate Cache
//!
//! Public certificate metadata cached per taxpayer in the shared key-value
//! store. Private keys never leave the [`Certificate`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sii_cache::{get_json, set_json, CacheError, KeySpace, KeyValueStore, CERTIFICATE_TTL};
use sii_core::Rut;

use crate::certificate::Certificate;
use crate::error::CryptoError;

/// Cached public view of a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedCertificate {
    /// Holder RUT.
    pub rut: Rut,
    /// Holder name.
    pub name: String,
    /// Holder email.
    pub email: Option<String>,
    /// Issuer DN.
    pub issuer: String,
    /// Serial number, decimal.
    pub serial_number: String,
    /// Start of validity.
    pub not_before: DateTime<Utc>,
    /// End of validity.
    pub not_after: DateTime<Utc>,
    /// Base64 DER certificate.
    pub der_base64: String,
}

impl CachedCertificate {
    /// Public view of `certificate`. Fails when the subject lacks a RUT or name.
    pub fn from_certificate(certificate: &Certificate) -> Result<Self, CryptoError> {
        let info = certificate.signer_info()?;
        Ok(Self {
            rut: info.rut,
            name: info.name,
            email: info.email,
            issuer: certificate.issuer_name(),
            serial_number: certificate.serial_number()?,
            not_before: certificate.not_before(),
            not_after: certificate.not_after(),
            der_base64: certificate.der_base64()?,
        })
    }

    /// Whether `now` lies inside the validity window.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }
}

/// TTL cache of [`CachedCertificate`] keyed by RUT.
#[derive(Debug, Clone)]
pub struct CertificateCache {
    store: Arc<dyn KeyValueStore>,
    keys: KeySpace,
    ttl: Duration,
}

impl CertificateCache {
    /// Cache over `store` with the default 24h TTL.
    pub fn new(store: Arc<dyn KeyValueStore>, keys: KeySpace) -> Self {
        Self {
            store,
            keys,
            ttl: CERTIFICATE_TTL,
        }
    }

    /// Override the TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Cache `certificate` under its holder's RUT.
    pub async fn put(&self, certificate: &Certificate) -> Result<CachedCertificate, sii_core::SiiError> {
        let entry = CachedCertificate::from_certificate(certificate)?;
        set_json(
            self.store.as_ref(),
            &self.keys.certificate(&entry.rut),
            &entry,
            Some(self.ttl),
        )
        .await?;
        tracing::debug!(rut = %entry.rut, "cached certificate");
        Ok(entry)
    }

    /// Cached certificate for `rut`, if present and unexpired in the cache.
    pub async fn get(&self, rut: &Rut) -> Result<Option<CachedCertificate>, CacheError> {
        get_json(self.store.as_ref(), &self.keys.certificate(rut)).await
    }

    /// Drop the entry for `rut`.
    pub async fn invalidate(&self, rut: &Rut) -> Result<bool, CacheError> {
        self.store.delete(&self.keys.certificate(rut)).await
    }
}
