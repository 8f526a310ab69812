//! # sii-crypto — Certificates, Canonical XML and Signatures
//!
//! - [`certificate`]: load PKCS#12 / PEM credentials, check validity, read
//!   the holder's identity.
//! - [`xml`] and [`c14n`]: a small XML tree and inclusive Canonical XML 1.0.
//! - [`digest`]: digests over canonical bytes and RSA PKCS#1 v1.5 primitives.
//! - [`signature`] and [`verify`]: enveloped XML digital signatures with a
//!   per-call digest/signature algorithm.
//! - [`cache`]: TTL cache of public certificate metadata.
//!
//! ## Crate Policy
//!
//! - Digests are computed over [`CanonicalXml`] only; there is no path from
//!   raw document bytes to a reference digest.
//! - No `unsafe` code. No `.unwrap()` outside tests and the `testing` module.

#![deny(missing_docs)]

pub mod c14n;
pub mod cache;
pub mod certificate;
pub mod digest;
pub mod error;
pub mod signature;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod verify;
pub mod xml;

pub use c14n::{canonicalize, C14nOptions, CanonicalXml};
pub use cache::{CachedCertificate, CertificateCache};
pub use certificate::{Certificate, SignerInfo};
pub use error::CryptoError;
pub use signature::{
    ReferenceTarget, SignOptions, SignatureEngine, SignatureResult, SignedXml, XmlSigner,
};
pub use verify::{verify_document, verify_document_with, verify_xml, VerifiedSignature};
pub use xml::{Element, XmlDocument, XmlEncoding};
