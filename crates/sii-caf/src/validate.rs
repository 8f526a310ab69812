//! # Authorization Validation
//!
//! A CAF is accepted only while current, with a well-formed range, and when
//! its `FRMA` verifies against the authority key named by its `IDK`.
//!
//! The authority signs the `DA` element serialized compactly (whitespace-only
//! text removed) in ISO-8859-1, with SHA-1 and RSA PKCS#1 v1.5.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use openssl::pkey::{PKey, Public};
use sii_core::{DigestAlgorithm, ErrorKind, SiiError};
use sii_crypto::digest::rsa_verify;
use sii_crypto::xml::encode_latin1;
use sii_crypto::Element;

use crate::model::Caf;
use crate::parse::CafXml;

/// Bytes covered by an authority signature over `element`.
pub fn authority_signed_bytes(element: &Element) -> Vec<u8> {
    encode_latin1(&element.without_whitespace().to_xml())
}

// ---------------------------------------------------------------------------
// Keyring
// ---------------------------------------------------------------------------

/// Authority public keys indexed by `IDK`.
#[derive(Clone, Default)]
pub struct AuthorityKeyring {
    keys: HashMap<u32, PKey<Public>>,
}

impl std::fmt::Debug for AuthorityKeyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut idks: Vec<_> = self.keys.keys().collect();
        idks.sort();
        f.debug_struct("AuthorityKeyring").field("idks", &idks).finish()
    }
}

impl AuthorityKeyring {
    /// Empty keyring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the key for `idk`.
    pub fn insert(&mut self, idk: u32, key: PKey<Public>) {
        self.keys.insert(idk, key);
    }

    /// Add a PEM public key (SPKI or PKCS#1).
    pub fn insert_pem(&mut self, idk: u32, pem: &[u8]) -> Result<(), SiiError> {
        let key = PKey::public_key_from_pem(pem)
            .or_else(|_| {
                openssl::rsa::Rsa::public_key_from_pem_pkcs1(pem).and_then(PKey::from_rsa)
            })
            .map_err(|e| SiiError::wrap(ErrorKind::Firma, format!("authority key {idk}"), e))?;
        self.insert(idk, key);
        Ok(())
    }

    /// Load every `<idk>.pem` file in `dir`. Other files are skipped.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, SiiError> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|e| {
            SiiError::wrap(
                ErrorKind::Procesamiento,
                format!("cannot read authority keys in {}", dir.display()),
                e,
            )
        })?;
        let mut keyring = Self::new();
        for entry in entries {
            let path = entry
                .map_err(|e| SiiError::wrap(ErrorKind::Procesamiento, "authority key listing", e))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("pem") {
                continue;
            }
            let Some(idk) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u32>().ok())
            else {
                tracing::debug!(path = %path.display(), "skipping authority key without numeric name");
                continue;
            };
            let pem = std::fs::read(&path).map_err(|e| {
                SiiError::wrap(ErrorKind::Procesamiento, format!("cannot read {}", path.display()), e)
            })?;
            keyring.insert_pem(idk, &pem)?;
        }
        tracing::debug!(keys = keyring.len(), dir = %dir.display(), "loaded authority keys");
        Ok(keyring)
    }

    /// Key for `idk`.
    pub fn get(&self, idk: u32) -> Option<&PKey<Public>> {
        self.keys.get(&idk)
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the keyring is empty.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

/// Checks expiry, range and authority signature.
#[derive(Debug, Clone)]
pub struct CafValidator {
    keyring: Arc<AuthorityKeyring>,
}

impl CafValidator {
    /// Validator trusting the keys in `keyring`.
    pub fn new(keyring: Arc<AuthorityKeyring>) -> Self {
        Self { keyring }
    }

    /// Validate at the current instant.
    pub fn validate(&self, caf: &Caf) -> Result<(), SiiError> {
        self.validate_at(caf, Utc::now())
    }

    /// Validate as of `now`.
    pub fn validate_at(&self, caf: &Caf, now: DateTime<Utc>) -> Result<(), SiiError> {
        if caf.folio_inicial > caf.folio_final {
            return Err(SiiError::new(
                ErrorKind::FolioInvalido,
                format!(
                    "CAF {} has a malformed range {}..={}",
                    caf.id, caf.folio_inicial, caf.folio_final
                ),
            ));
        }
        if !caf.is_current_at(now) {
            return Err(SiiError::new(
                ErrorKind::FolioInvalido,
                format!("CAF {} expired at {}", caf.id, caf.fecha_vencimiento),
            ));
        }
        self.verify_signature(caf)
    }

    /// Verify `FRMA` over `DA` and that `DA` agrees with the record.
    pub fn verify_signature(&self, caf: &Caf) -> Result<(), SiiError> {
        let parsed = CafXml::parse(&caf.xml)?;
        let da = parsed.da()?;

        let declared = parsed.to_caf(&caf.xml)?;
        if declared.rut_emisor != caf.rut_emisor
            || declared.tipo != caf.tipo
            || declared.folio_inicial != caf.folio_inicial
            || declared.folio_final != caf.folio_final
        {
            return Err(SiiError::new(
                ErrorKind::DocumentoInvalido,
                format!("CAF {} record does not match its authorization data", caf.id),
            ));
        }

        let key = self.keyring.get(declared.idk).ok_or_else(|| {
            SiiError::new(
                ErrorKind::Firma,
                format!("no authority key for IDK {}", declared.idk),
            )
        })?;
        rsa_verify(
            key,
            DigestAlgorithm::Sha1,
            &authority_signed_bytes(da),
            &parsed.authority_signature()?,
        )
        .map_err(|e| {
            SiiError::wrap(
                ErrorKind::Firma,
                format!("CAF {} authority signature does not verify", caf.id),
                e,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_caf;
    use crate::testing::{CafSpec, TestAuthority};
    use sii_core::TipoDte;

    fn setup() -> (TestAuthority, CafValidator) {
        let authority = TestAuthority::new(100);
        let validator = CafValidator::new(Arc::new(authority.keyring()));
        (authority, validator)
    }

    #[test]
    fn accepts_authority_signed_caf() {
        let (authority, validator) = setup();
        let caf = parse_caf(&authority.issue(&CafSpec::new(TipoDte::FacturaElectronica, 1, 100))).unwrap();
        validator.validate(&caf).unwrap();
    }

    #[test]
    fn rejects_expired_caf() {
        let (authority, validator) = setup();
        let caf = parse_caf(&authority.issue(&CafSpec::new(TipoDte::FacturaElectronica, 1, 100))).unwrap();
        let later = caf.fecha_vencimiento + chrono::Duration::seconds(1);
        let err = validator.validate_at(&caf, later).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FolioInvalido);
        assert!(!err.is_retryable());
    }

    #[test]
    fn rejects_malformed_range() {
        let (authority, validator) = setup();
        let mut caf =
            parse_caf(&authority.issue(&CafSpec::new(TipoDte::FacturaElectronica, 1, 100))).unwrap();
        caf.folio_inicial = 200;
        assert_eq!(validator.validate(&caf).unwrap_err().kind(), ErrorKind::FolioInvalido);
    }

    #[test]
    fn rejects_unknown_authority_key() {
        let authority = TestAuthority::new(100);
        let stranger = TestAuthority::new(200);
        let validator = CafValidator::new(Arc::new(stranger.keyring()));
        let caf = parse_caf(&authority.issue(&CafSpec::new(TipoDte::FacturaElectronica, 1, 10))).unwrap();
        let err = validator.validate(&caf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Firma);
        assert!(err.message().contains("IDK 100"));
    }

    #[test]
    fn rejects_signature_from_other_key() {
        let authority = TestAuthority::new(100);
        let impostor = TestAuthority::new(100);
        let validator = CafValidator::new(Arc::new(authority.keyring()));
        let caf = parse_caf(&impostor.issue(&CafSpec::new(TipoDte::FacturaElectronica, 1, 10))).unwrap();
        assert_eq!(validator.validate(&caf).unwrap_err().kind(), ErrorKind::Firma);
    }

    #[test]
    fn rejects_tampered_range() {
        let (authority, validator) = setup();
        let xml = authority.issue(&CafSpec::new(TipoDte::FacturaElectronica, 1, 10));
        let tampered = String::from_utf8_lossy(&xml).replace("<H>10</H>", "<H>99</H>");
        let caf = parse_caf(tampered.as_bytes()).unwrap();
        assert_eq!(validator.validate(&caf).unwrap_err().kind(), ErrorKind::Firma);
    }

    #[test]
    fn signed_bytes_ignore_layout_whitespace() {
        let pretty = sii_crypto::XmlDocument::parse_str("<DA>\n  <RE>1-9</RE>\n  <RS>A B</RS>\n</DA>").unwrap();
        assert_eq!(
            authority_signed_bytes(pretty.root()),
            b"<DA><RE>1-9</RE><RS>A B</RS></DA>".to_vec()
        );
    }

    #[test]
    fn loads_keyring_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let authority = TestAuthority::new(300);
        std::fs::write(dir.path().join("300.pem"), authority.public_key_pem()).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let keyring = AuthorityKeyring::load_dir(dir.path()).unwrap();
        assert_eq!(keyring.len(), 1);
        assert!(keyring.get(300).is_some());
    }
}
