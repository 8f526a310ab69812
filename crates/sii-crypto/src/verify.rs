//! # Signature Verification
//!
//! Checks an enveloped signature produced by [`crate::signature`] or by the
//! authority: the reference digest first, then the RSA signature over the
//! canonical `SignedInfo`.

use openssl::pkey::{PKeyRef, Public};
use openssl::x509::X509;
use sii_core::algorithm::{C14N_URI, ENVELOPED_SIGNATURE_URI};
use sii_core::DigestAlgorithm;
use subtle::ConstantTimeEq;

use crate::c14n::{canonicalize, C14nOptions};
use crate::digest::{b64_decode, digest_canonical, rsa_verify};
use crate::error::CryptoError;
use crate::signature::{child_scope, resolve_reference};
use crate::xml::{Element, XmlDocument};

/// A signature that verified.
#[derive(Debug, Clone)]
pub struct VerifiedSignature {
    /// Algorithm declared in `SignatureMethod`.
    pub algorithm: DigestAlgorithm,
    /// Reference URI.
    pub reference_uri: String,
    /// Certificate carried in `KeyInfo`, when present.
    pub certificate: Option<X509>,
}

/// Verify against the certificate embedded in `KeyInfo`.
pub fn verify_document(document: &XmlDocument) -> Result<VerifiedSignature, CryptoError> {
    verify(document, None)
}

/// Verify against a trusted public key, ignoring any embedded certificate.
pub fn verify_document_with(
    document: &XmlDocument,
    key: &PKeyRef<Public>,
) -> Result<VerifiedSignature, CryptoError> {
    verify(document, Some(key))
}

/// Parse and verify raw XML.
pub fn verify_xml(xml: &[u8]) -> Result<VerifiedSignature, CryptoError> {
    verify_document(&XmlDocument::parse(xml)?)
}

fn required<'a>(parent: &'a Element, local: &str) -> Result<&'a Element, CryptoError> {
    parent
        .child(local)
        .ok_or_else(|| CryptoError::verification(format!("missing {local}")))
}

fn verify(
    document: &XmlDocument,
    trusted: Option<&PKeyRef<Public>>,
) -> Result<VerifiedSignature, CryptoError> {
    let root = document.root();
    let signature = root
        .elements()
        .filter(|e| e.local_name() == "Signature")
        .last()
        .ok_or_else(|| CryptoError::verification("document is not signed"))?;
    let signed_info = required(signature, "SignedInfo")?;

    let c14n_method = required(signed_info, "CanonicalizationMethod")?
        .attr("Algorithm")
        .unwrap_or_default();
    if c14n_method != C14N_URI {
        return Err(CryptoError::verification(format!(
            "unsupported canonicalization {c14n_method:?}"
        )));
    }
    let algorithm = DigestAlgorithm::from_signature_uri(
        required(signed_info, "SignatureMethod")?
            .attr("Algorithm")
            .unwrap_or_default(),
    )
    .map_err(CryptoError::verification)?;

    let reference = required(signed_info, "Reference")?;
    let reference_uri = reference.attr("URI").unwrap_or_default().to_string();
    let digest_algorithm = DigestAlgorithm::from_digest_uri(
        required(reference, "DigestMethod")?
            .attr("Algorithm")
            .unwrap_or_default(),
    )
    .map_err(CryptoError::verification)?;
    let expected_digest = b64_decode(&required(reference, "DigestValue")?.text())
        .map_err(CryptoError::verification)?;
    let enveloped = reference.child("Transforms").is_some_and(|transforms| {
        transforms
            .elements()
            .any(|t| t.attr("Algorithm") == Some(ENVELOPED_SIGNATURE_URI))
    });

    let (apex, inherited) = resolve_reference(root, &reference_uri)?;
    let canonical = canonicalize(
        apex,
        &inherited,
        C14nOptions {
            enveloped_signature: enveloped,
        },
    );
    let actual_digest = digest_canonical(digest_algorithm, &canonical);
    if !bool::from(actual_digest.as_slice().ct_eq(expected_digest.as_slice())) {
        return Err(CryptoError::verification("reference digest mismatch"));
    }

    let certificate = signature
        .path(&["KeyInfo", "X509Data", "X509Certificate"])
        .map(|e| {
            let der = b64_decode(&e.text()).map_err(CryptoError::verification)?;
            X509::from_der(&der).map_err(CryptoError::verification)
        })
        .transpose()?;

    let signature_value = b64_decode(&required(signature, "SignatureValue")?.text())
        .map_err(CryptoError::verification)?;
    let signed_info_c14n = canonicalize(
        signed_info,
        &child_scope(root, signature),
        C14nOptions::default(),
    );

    match (trusted, &certificate) {
        (Some(key), _) => rsa_verify(key, algorithm, signed_info_c14n.as_bytes(), &signature_value)?,
        (None, Some(cert)) => {
            let key = cert.public_key().map_err(CryptoError::verification)?;
            rsa_verify(&key, algorithm, signed_info_c14n.as_bytes(), &signature_value)?;
        }
        (None, None) => {
            return Err(CryptoError::verification(
                "no certificate in KeyInfo and no trusted key supplied",
            ))
        }
    }

    Ok(VerifiedSignature {
        algorithm,
        reference_uri,
        certificate,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::signature::{SignOptions, SignatureEngine, XmlSigner};
    use crate::testing::{TestCertificate, TestCertificateSpec};

    fn signed(alg: DigestAlgorithm) -> (XmlDocument, TestCertificate) {
        let generated = TestCertificate::generate(&TestCertificateSpec::default());
        let engine = SignatureEngine::new(Arc::new(generated.certificate()));
        let doc = engine
            .sign_xml(b"<a><b>value</b></a>", &SignOptions::new(alg))
            .unwrap()
            .document;
        (doc, generated)
    }

    #[test]
    fn unsigned_document_fails() {
        let doc = XmlDocument::parse_str("<a/>").unwrap();
        assert!(matches!(verify_document(&doc), Err(CryptoError::Verification(_))));
    }

    #[test]
    fn verifies_with_trusted_key() {
        let (doc, generated) = signed(DigestAlgorithm::Sha256);
        let public = generated.cert.public_key().unwrap();
        let verified = verify_document_with(&doc, &public).unwrap();
        assert_eq!(verified.algorithm, DigestAlgorithm::Sha256);
    }

    #[test]
    fn other_key_fails() {
        let (doc, _) = signed(DigestAlgorithm::Sha1);
        let other = TestCertificate::generate(&TestCertificateSpec::default());
        let public = other.cert.public_key().unwrap();
        assert!(verify_document_with(&doc, &public).is_err());
    }

    #[test]
    fn tampered_signed_info_fails() {
        let (mut doc, _) = signed(DigestAlgorithm::Sha1);
        let signature = doc
            .root_mut()
            .elements_mut()
            .last()
            .unwrap();
        signature
            .child_mut("SignedInfo")
            .unwrap()
            .child_mut("Reference")
            .unwrap()
            .set_attr("Id", "x");
        let err = verify_document(&doc).unwrap_err();
        assert!(err.to_string().contains("RSA signature mismatch"));
    }

    #[test]
    fn signature_survives_serialization() {
        let (doc, _) = signed(DigestAlgorithm::Sha1);
        let latin1 = doc.to_bytes(crate::xml::XmlEncoding::Latin1);
        verify_xml(&latin1).unwrap();
    }
}
