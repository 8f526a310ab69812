//! # Certificate Manager
//!
//! Loads the taxpayer's signing certificate from a PKCS#12 bundle (or a
//! PEM certificate/key pair), and answers lifecycle questions about it.
//!
//! ## Invariants
//!
//! - The private key is always RSA. Anything else is rejected at load.
//! - A [`Certificate`] is read-only after load and is shared behind an `Arc`.
//! - Validity (`notBefore ≤ now ≤ notAfter`) is checked by [`Certificate::validate`],
//!   which the signature engine calls before every signing operation.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, PKeyRef, Private, Public};
use openssl::x509::{X509NameRef, X509};
use serde::{Deserialize, Serialize};
use sii_core::Rut;
use zeroize::Zeroizing;

use crate::digest::b64_encode;
use crate::error::CryptoError;

/// Identity of the certificate holder, read from the subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerInfo {
    /// Holder's RUT.
    pub rut: Rut,
    /// Holder's common name.
    pub name: String,
    /// Holder's email, when present in the subject or alternative names.
    pub email: Option<String>,
}

/// A loaded signing certificate and its private key.
pub struct Certificate {
    cert: X509,
    key: PKey<Private>,
    chain: Vec<X509>,
    raw: Zeroizing<Vec<u8>>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    owner: Option<Rut>,
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject_name())
            .field("owner", &self.owner)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, CryptoError> {
    std::fs::read(path).map_err(|source| CryptoError::Io {
        path: path.display().to_string(),
        source,
    })
}

impl Certificate {
    /// Load a PKCS#12 bundle from disk.
    pub fn load_pkcs12(path: impl AsRef<Path>, password: &str) -> Result<Self, CryptoError> {
        let path = path.as_ref();
        let der = read_file(path)?;
        let cert = Self::from_pkcs12(&der, password)?;
        tracing::debug!(path = %path.display(), owner = ?cert.owner, "loaded PKCS#12 certificate");
        Ok(cert)
    }

    /// Parse a PKCS#12 bundle.
    pub fn from_pkcs12(der: &[u8], password: &str) -> Result<Self, CryptoError> {
        let parsed = Pkcs12::from_der(der)
            .map_err(|e| CryptoError::certificate(format!("not a PKCS#12 bundle: {e}")))?
            .parse2(password)
            .map_err(|_| CryptoError::certificate("wrong password or corrupt bundle"))?;
        let key = parsed
            .pkey
            .ok_or_else(|| CryptoError::certificate("bundle has no private key"))?;
        let cert = parsed
            .cert
            .ok_or_else(|| CryptoError::certificate("bundle has no certificate"))?;
        let chain = parsed
            .ca
            .map(|stack| stack.into_iter().collect())
            .unwrap_or_default();
        Self::from_parts(cert, key, chain, Zeroizing::new(der.to_vec()))
    }

    /// Load a PEM certificate and a PEM private key from disk.
    pub fn load_pem(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        password: Option<&str>,
    ) -> Result<Self, CryptoError> {
        let cert_pem = read_file(cert_path.as_ref())?;
        let key_pem = Zeroizing::new(read_file(key_path.as_ref())?);
        Self::from_pem(&cert_pem, &key_pem, password)
    }

    /// Parse a PEM certificate (optionally followed by its chain) and key.
    pub fn from_pem(
        cert_pem: &[u8],
        key_pem: &[u8],
        password: Option<&str>,
    ) -> Result<Self, CryptoError> {
        let mut certs = X509::stack_from_pem(cert_pem)
            .map_err(|e| CryptoError::certificate(format!("bad PEM certificate: {e}")))?;
        if certs.is_empty() {
            return Err(CryptoError::certificate("no certificate in PEM input"));
        }
        let cert = certs.remove(0);
        let key = match password {
            Some(pass) => PKey::private_key_from_pem_passphrase(key_pem, pass.as_bytes()),
            None => PKey::private_key_from_pem(key_pem),
        }
        .map_err(|_| CryptoError::certificate("bad PEM private key or passphrase"))?;

        let mut raw = Zeroizing::new(cert_pem.to_vec());
        raw.extend_from_slice(key_pem);
        Self::from_parts(cert, key, certs, raw)
    }

    /// Assemble from parsed parts, enforcing an RSA key matching the certificate.
    pub fn from_parts(
        cert: X509,
        key: PKey<Private>,
        chain: Vec<X509>,
        raw: Zeroizing<Vec<u8>>,
    ) -> Result<Self, CryptoError> {
        if key.rsa().is_err() {
            return Err(CryptoError::certificate("private key is not RSA"));
        }
        let public = cert
            .public_key()
            .map_err(|e| CryptoError::certificate(format!("unreadable public key: {e}")))?;
        if !public.public_eq(&key) {
            return Err(CryptoError::certificate(
                "private key does not match certificate",
            ));
        }
        let not_before = asn1_to_utc(cert.not_before())?;
        let not_after = asn1_to_utc(cert.not_after())?;
        let mut loaded = Self {
            cert,
            key,
            chain,
            raw,
            not_before,
            not_after,
            owner: None,
        };
        loaded.owner = loaded.signer_info().ok().map(|info| info.rut);
        Ok(loaded)
    }

    /// Fail unless `notBefore ≤ now ≤ notAfter`.
    pub fn validate(&self) -> Result<(), CryptoError> {
        self.validate_at(Utc::now())
    }

    /// Fail unless `notBefore ≤ at ≤ notAfter`.
    pub fn validate_at(&self, at: DateTime<Utc>) -> Result<(), CryptoError> {
        if at < self.not_before {
            return Err(CryptoError::NotYetValid {
                not_before: self.not_before,
            });
        }
        if at > self.not_after {
            return Err(CryptoError::Expired {
                not_after: self.not_after,
            });
        }
        Ok(())
    }

    /// Whether the certificate expires within `days` from now.
    pub fn is_expiring_soon(&self, days: i64) -> bool {
        self.is_expiring_soon_at(Utc::now(), days)
    }

    /// Whether the certificate expires within `days` from `at`.
    pub fn is_expiring_soon_at(&self, at: DateTime<Utc>, days: i64) -> bool {
        at + Duration::days(days) > self.not_after
    }

    /// Whole days left until `notAfter`, negative once expired.
    pub fn days_until_expiry(&self) -> i64 {
        (self.not_after - Utc::now()).num_days()
    }

    /// Holder identity from the subject. Fails when the RUT or name is absent.
    pub fn signer_info(&self) -> Result<SignerInfo, CryptoError> {
        let subject = name_entries(self.cert.subject_name());
        let name = subject
            .iter()
            .find(|(nid, _)| *nid == Nid::COMMONNAME)
            .map(|(_, value)| value.clone())
            .filter(|v| !v.trim().is_empty())
            .ok_or(CryptoError::MissingSubjectAttribute {
                attribute: "commonName",
            })?;

        let rut = subject
            .iter()
            .find(|(nid, _)| *nid == Nid::SERIALNUMBER)
            .and_then(|(_, value)| find_rut(value))
            .or_else(|| subject.iter().find_map(|(_, value)| find_rut(value)))
            .ok_or(CryptoError::MissingSubjectAttribute { attribute: "RUT" })?;

        let email = subject
            .iter()
            .find(|(nid, _)| *nid == Nid::PKCS9_EMAILADDRESS)
            .map(|(_, value)| value.clone())
            .or_else(|| {
                self.cert.subject_alt_names().and_then(|names| {
                    names
                        .iter()
                        .find_map(|general| general.email().map(str::to_string))
                })
            });

        Ok(SignerInfo { rut, name, email })
    }

    /// The RUT found in the subject at load time, if any.
    pub fn owner(&self) -> Option<&Rut> {
        self.owner.as_ref()
    }

    /// Start of the validity window.
    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    /// End of the validity window.
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// The X.509 certificate.
    pub fn x509(&self) -> &X509 {
        &self.cert
    }

    /// The RSA private key.
    pub fn private_key(&self) -> &PKeyRef<Private> {
        &self.key
    }

    /// The certificate's public key.
    pub fn public_key(&self) -> Result<PKey<Public>, CryptoError> {
        self.cert.public_key().map_err(CryptoError::certificate)
    }

    /// Intermediate certificates shipped with the bundle.
    pub fn chain(&self) -> &[X509] {
        &self.chain
    }

    /// Bytes the certificate was loaded from.
    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// DER encoding of the certificate.
    pub fn der(&self) -> Result<Vec<u8>, CryptoError> {
        self.cert.to_der().map_err(CryptoError::certificate)
    }

    /// Base64 DER, as embedded in `X509Certificate`.
    pub fn der_base64(&self) -> Result<String, CryptoError> {
        self.der().map(b64_encode)
    }

    /// Subject as `CN=...,O=...`.
    pub fn subject_name(&self) -> String {
        format_name(self.cert.subject_name())
    }

    /// Issuer as `CN=...,O=...`, as embedded in `X509IssuerName`.
    pub fn issuer_name(&self) -> String {
        format_name(self.cert.issuer_name())
    }

    /// Serial number in decimal, as embedded in `X509SerialNumber`.
    pub fn serial_number(&self) -> Result<String, CryptoError> {
        let bn = self
            .cert
            .serial_number()
            .to_bn()
            .map_err(CryptoError::certificate)?;
        let dec = bn.to_dec_str().map_err(CryptoError::certificate)?;
        Ok(dec.to_string())
    }

    /// RSA modulus and public exponent, base64 encoded.
    pub fn rsa_key_value(&self) -> Result<(String, String), CryptoError> {
        let rsa = self.key.rsa().map_err(CryptoError::signing)?;
        Ok((b64_encode(rsa.n().to_vec()), b64_encode(rsa.e().to_vec())))
    }

    /// PEM private key followed by the certificate chain, for TLS client auth.
    pub fn identity_pem(&self) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let mut pem = Zeroizing::new(
            self.key
                .private_key_to_pem_pkcs8()
                .map_err(CryptoError::certificate)?,
        );
        pem.extend_from_slice(&self.cert.to_pem().map_err(CryptoError::certificate)?);
        for ca in &self.chain {
            pem.extend_from_slice(&ca.to_pem().map_err(CryptoError::certificate)?);
        }
        Ok(pem)
    }
}

fn asn1_to_utc(time: &Asn1TimeRef) -> Result<DateTime<Utc>, CryptoError> {
    let epoch = Asn1Time::from_unix(0).map_err(CryptoError::certificate)?;
    let diff = epoch.diff(time).map_err(CryptoError::certificate)?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| CryptoError::certificate("validity date out of range"))
}

fn name_entries(name: &X509NameRef) -> Vec<(Nid, String)> {
    name.entries()
        .filter_map(|entry| {
            let nid = entry.object().nid();
            entry
                .data()
                .as_utf8()
                .ok()
                .map(|value| (nid, value.to_string()))
        })
        .collect()
}

fn format_name(name: &X509NameRef) -> String {
    name.entries()
        .filter_map(|entry| {
            let key = entry.object().nid().short_name().ok()?;
            let value = entry.data().as_utf8().ok()?;
            Some(format!("{key}={value}"))
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// First RUT-shaped token in a subject value.
fn find_rut(value: &str) -> Option<Rut> {
    Rut::parse(value).ok().or_else(|| {
        value
            .split(|c: char| c.is_whitespace() || matches!(c, ':' | ',' | ';' | '=' | '/'))
            .filter(|token| token.contains('-'))
            .find_map(|token| Rut::parse(token).ok())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestCertificate, TestCertificateSpec};

    #[test]
    fn loads_pkcs12_from_disk() {
        let generated = TestCertificate::generate(&TestCertificateSpec::default());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firma.p12");
        std::fs::write(&path, generated.pkcs12("secret")).unwrap();

        let cert = Certificate::load_pkcs12(&path, "secret").unwrap();
        assert_eq!(cert.owner().map(ToString::to_string).as_deref(), Some("11111111-1"));
        cert.validate().unwrap();
    }

    #[test]
    fn wrong_password_is_cert_invalid() {
        let generated = TestCertificate::generate(&TestCertificateSpec::default());
        let err = Certificate::from_pkcs12(&generated.pkcs12("secret"), "nope").unwrap_err();
        assert_eq!(err.kind(), sii_core::ErrorKind::CertInvalid);
    }

    #[test]
    fn unreadable_file_is_cert_invalid() {
        let err = Certificate::load_pkcs12("/nonexistent/firma.p12", "x").unwrap_err();
        assert!(matches!(err, CryptoError::Io { .. }));
        assert_eq!(err.kind(), sii_core::ErrorKind::CertInvalid);
    }

    #[test]
    fn non_rsa_key_is_rejected() {
        let generated = TestCertificate::generate_ec();
        let err = Certificate::from_pkcs12(&generated.pkcs12("pw"), "pw").unwrap_err();
        assert!(err.to_string().contains("not RSA"));
    }

    #[test]
    fn expired_certificate_fails_validation() {
        let spec = TestCertificateSpec {
            not_before_days: -30,
            not_after_days: -1,
            ..Default::default()
        };
        let cert = TestCertificate::generate(&spec).certificate();
        assert!(matches!(cert.validate(), Err(CryptoError::Expired { .. })));
    }

    #[test]
    fn future_certificate_fails_validation() {
        let spec = TestCertificateSpec {
            not_before_days: 2,
            not_after_days: 30,
            ..Default::default()
        };
        let cert = TestCertificate::generate(&spec).certificate();
        let err = cert.validate().unwrap_err();
        assert!(matches!(err, CryptoError::NotYetValid { .. }));
        assert_eq!(err.kind(), sii_core::ErrorKind::CertInvalid);
    }

    #[test]
    fn window_boundaries_are_inclusive() {
        let cert = TestCertificate::generate(&TestCertificateSpec::default()).certificate();
        cert.validate_at(cert.not_before()).unwrap();
        cert.validate_at(cert.not_after()).unwrap();
        assert!(cert
            .validate_at(cert.not_after() + Duration::seconds(1))
            .is_err());
    }

    #[test]
    fn expiring_soon_threshold() {
        let spec = TestCertificateSpec {
            not_after_days: 10,
            ..Default::default()
        };
        let cert = TestCertificate::generate(&spec).certificate();
        assert!(cert.is_expiring_soon(30));
        assert!(!cert.is_expiring_soon(5));
        assert!((9..=10).contains(&cert.days_until_expiry()));
    }

    #[test]
    fn signer_info_reads_subject() {
        let spec = TestCertificateSpec {
            common_name: "Juan Perez".into(),
            rut: Some("76192083-9".into()),
            email: Some("juan@example.cl".into()),
            ..Default::default()
        };
        let info = TestCertificate::generate(&spec)
            .certificate()
            .signer_info()
            .unwrap();
        assert_eq!(info.name, "Juan Perez");
        assert_eq!(info.rut.to_string(), "76192083-9");
        assert_eq!(info.email.as_deref(), Some("juan@example.cl"));
    }

    #[test]
    fn signer_info_without_rut_fails() {
        let spec = TestCertificateSpec {
            rut: None,
            ..Default::default()
        };
        let err = TestCertificate::generate(&spec)
            .certificate()
            .signer_info()
            .unwrap_err();
        assert!(matches!(
            err,
            CryptoError::MissingSubjectAttribute { attribute: "RUT" }
        ));
    }

    #[test]
    fn pem_pair_loads() {
        let generated = TestCertificate::generate(&TestCertificateSpec::default());
        let cert_pem = generated.cert.to_pem().unwrap();
        let key_pem = generated.key.private_key_to_pem_pkcs8().unwrap();
        let cert = Certificate::from_pem(&cert_pem, &key_pem, None).unwrap();
        assert_eq!(cert.serial_number().unwrap(), "1");
        assert!(cert.issuer_name().contains("CN=Test"));
        let identity = cert.identity_pem().unwrap();
        let text = String::from_utf8_lossy(&identity);
        assert!(text.contains("BEGIN PRIVATE KEY"));
        assert!(text.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn debug_redacts_key() {
        let cert = TestCertificate::generate(&TestCertificateSpec::default()).certificate();
        let debug = format!("{cert:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("PRIVATE"));
    }

    #[test]
    fn finds_rut_inside_longer_values() {
        assert_eq!(
            find_rut("RUT: 76.192.083-9").map(|r| r.to_string()).as_deref(),
            Some("76192083-9")
        );
        assert!(find_rut("Juan Perez").is_none());
    }
}
