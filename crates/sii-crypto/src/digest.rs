//! # Digests and RSA Primitives
//!
//! Reference digests are computed over [`CanonicalXml`] only, so every
//! digest in the workspace flows through canonicalization. RSA PKCS#1 v1.5
//! signing and verification take the algorithm as an explicit argument.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use openssl::hash::MessageDigest;
use openssl::pkey::{HasPublic, PKeyRef, Private};
use openssl::sign::{Signer, Verifier};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use sii_core::DigestAlgorithm;

use crate::c14n::CanonicalXml;
use crate::error::CryptoError;

/// Digest of canonical XML.
pub fn digest_canonical(algorithm: DigestAlgorithm, canonical: &CanonicalXml) -> Vec<u8> {
    digest_bytes(algorithm, canonical.as_bytes())
}

/// Digest of arbitrary bytes.
pub fn digest_bytes(algorithm: DigestAlgorithm, data: &[u8]) -> Vec<u8> {
    match algorithm {
        DigestAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
        DigestAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
    }
}

fn message_digest(algorithm: DigestAlgorithm) -> MessageDigest {
    match algorithm {
        DigestAlgorithm::Sha1 => MessageDigest::sha1(),
        DigestAlgorithm::Sha256 => MessageDigest::sha256(),
    }
}

/// RSA PKCS#1 v1.5 signature over `data`. Fails if the key is not RSA.
pub fn rsa_sign(
    key: &PKeyRef<Private>,
    algorithm: DigestAlgorithm,
    data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if key.rsa().is_err() {
        return Err(CryptoError::signing("private key is not RSA"));
    }
    let mut signer = Signer::new(message_digest(algorithm), key).map_err(CryptoError::signing)?;
    signer.update(data).map_err(CryptoError::signing)?;
    signer.sign_to_vec().map_err(CryptoError::signing)
}

/// Verify an RSA PKCS#1 v1.5 signature over `data`.
pub fn rsa_verify<T: HasPublic>(
    key: &PKeyRef<T>,
    algorithm: DigestAlgorithm,
    data: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let mut verifier =
        Verifier::new(message_digest(algorithm), key).map_err(CryptoError::verification)?;
    verifier.update(data).map_err(CryptoError::verification)?;
    match verifier.verify(signature) {
        Ok(true) => Ok(()),
        Ok(false) => Err(CryptoError::verification("RSA signature mismatch")),
        Err(e) => Err(CryptoError::verification(e)),
    }
}

/// Standard base64.
pub fn b64_encode(data: impl AsRef<[u8]>) -> String {
    STANDARD.encode(data)
}

/// Standard base64, ignoring embedded whitespace and line breaks.
pub fn b64_decode(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD.decode(compact)
}
