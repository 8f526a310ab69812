//! # Signature Engine
//!
//! Produces enveloped XML digital signatures:
//!
//! 1. canonicalize the referenced subtree (the whole document, or the
//!    element carrying a given `ID`);
//! 2. digest it with the per-call [`DigestAlgorithm`];
//! 3. append a `Signature` element as the last child of the document root,
//!    carrying `SignedInfo`, `SignatureValue` and `KeyInfo` (RSA key value,
//!    issuer/serial and the base64 DER certificate);
//! 4. canonicalize `SignedInfo` in place and sign it with RSA PKCS#1 v1.5.
//!
//! The certificate is re-validated before every signing operation. Given the
//! same input and key the output is byte-for-byte identical.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sii_core::algorithm::{C14N_URI, ENVELOPED_SIGNATURE_URI, XMLDSIG_NS};
use sii_core::DigestAlgorithm;

use crate::c14n::{canonicalize, C14nOptions};
use crate::certificate::Certificate;
use crate::digest::{b64_encode, digest_canonical, rsa_sign};
use crate::error::CryptoError;
use crate::xml::{Element, NamespaceBindings, XmlDocument, XmlEncoding};

/// What the signature's `Reference` points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceTarget {
    /// The whole document (`URI=""`), with the enveloped-signature transform.
    Document,
    /// The element whose `ID` attribute matches (`URI="#id"`).
    Id(String),
}

impl ReferenceTarget {
    /// Value of the `URI` attribute.
    pub fn uri(&self) -> String {
        match self {
            Self::Document => String::new(),
            Self::Id(id) => format!("#{id}"),
        }
    }
}

/// Per-call signing parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignOptions {
    /// Digest and signature algorithm pair.
    pub algorithm: DigestAlgorithm,
    /// Referenced content.
    pub target: ReferenceTarget,
}

impl SignOptions {
    /// Whole-document signature with `algorithm`.
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self {
            algorithm,
            target: ReferenceTarget::Document,
        }
    }

    /// Reference the element with this `ID` instead of the whole document.
    pub fn with_reference_id(mut self, id: impl Into<String>) -> Self {
        self.target = ReferenceTarget::Id(id.into());
        self
    }
}

/// Digest, signature value and signing time of one signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureResult {
    /// Base64 reference digest.
    pub digest_value: String,
    /// Base64 RSA signature over the canonical `SignedInfo`.
    pub signature_value: String,
    /// When the signature was produced.
    pub signed_at: DateTime<Utc>,
    /// Algorithm used.
    pub algorithm: DigestAlgorithm,
    /// Reference URI (`""` or `#id`).
    pub reference_uri: String,
}

/// A signed document and its signature details.
#[derive(Debug, Clone)]
pub struct SignedXml {
    /// Document with the `Signature` element appended to its root.
    pub document: XmlDocument,
    /// Signature details.
    pub result: SignatureResult,
}

impl SignedXml {
    /// Serialize the signed document.
    pub fn to_bytes(&self, encoding: XmlEncoding) -> Vec<u8> {
        self.document.to_bytes(encoding)
    }
}

/// Something that can sign XML documents.
pub trait XmlSigner: Send + Sync {
    /// Sign a parsed document.
    fn sign_document(
        &self,
        document: XmlDocument,
        options: &SignOptions,
    ) -> Result<SignedXml, CryptoError>;

    /// Parse and sign raw XML. Fails `NoRoot`/`Xml` on unparseable input.
    fn sign_xml(&self, xml: &[u8], options: &SignOptions) -> Result<SignedXml, CryptoError> {
        let document = XmlDocument::parse(xml)?;
        self.sign_document(document, options)
    }
}

/// RSA signer over a loaded [`Certificate`].
#[derive(Debug, Clone)]
pub struct SignatureEngine {
    certificate: Arc<Certificate>,
}

impl SignatureEngine {
    /// Engine signing with `certificate`.
    pub fn new(certificate: Arc<Certificate>) -> Self {
        Self { certificate }
    }

    /// The signing certificate.
    pub fn certificate(&self) -> &Arc<Certificate> {
        &self.certificate
    }

    fn key_info(&self) -> Result<Element, CryptoError> {
        let (modulus, exponent) = self.certificate.rsa_key_value()?;
        let key_value = Element::new("KeyValue").with_child(
            Element::new("RSAKeyValue")
                .with_text_child("Modulus", modulus)
                .with_text_child("Exponent", exponent),
        );
        let x509_data = Element::new("X509Data")
            .with_child(
                Element::new("X509IssuerSerial")
                    .with_text_child("X509IssuerName", self.certificate.issuer_name())
                    .with_text_child("X509SerialNumber", self.certificate.serial_number()?),
            )
            .with_text_child("X509Certificate", self.certificate.der_base64()?);
        Ok(Element::new("KeyInfo")
            .with_child(key_value)
            .with_child(x509_data))
    }
}

fn signed_info(options: &SignOptions, digest_value: &str) -> Element {
    let mut reference = Element::new("Reference").with_attr("URI", options.target.uri());
    if options.target == ReferenceTarget::Document {
        reference = reference.with_child(
            Element::new("Transforms").with_child(
                Element::new("Transform").with_attr("Algorithm", ENVELOPED_SIGNATURE_URI),
            ),
        );
    }
    let reference = reference
        .with_child(
            Element::new("DigestMethod").with_attr("Algorithm", options.algorithm.digest_uri()),
        )
        .with_text_child("DigestValue", digest_value);

    Element::new("SignedInfo")
        .with_child(Element::new("CanonicalizationMethod").with_attr("Algorithm", C14N_URI))
        .with_child(
            Element::new("SignatureMethod")
                .with_attr("Algorithm", options.algorithm.signature_uri()),
        )
        .with_child(reference)
}

/// Namespace bindings visible to a direct child of `root` that declares `own`.
pub(crate) fn child_scope(root: &Element, own: &Element) -> NamespaceBindings {
    root.namespace_declarations()
        .chain(own.namespace_declarations())
        .map(|(p, u)| (p.to_string(), u.to_string()))
        .collect()
}

/// Locate the referenced subtree and its inherited bindings.
pub(crate) fn resolve_reference<'a>(
    root: &'a Element,
    uri: &str,
) -> Result<(&'a Element, NamespaceBindings), CryptoError> {
    match uri.strip_prefix('#') {
        None if uri.is_empty() => Ok((root, NamespaceBindings::new())),
        None => Err(CryptoError::ReferenceNotFound(uri.to_string())),
        Some(id) => root
            .find_by_id(id)
            .ok_or_else(|| CryptoError::ReferenceNotFound(id.to_string())),
    }
}

impl XmlSigner for SignatureEngine {
    fn sign_document(
        &self,
        mut document: XmlDocument,
        options: &SignOptions,
    ) -> Result<SignedXml, CryptoError> {
        self.certificate.validate()?;

        let uri = options.target.uri();
        let digest = {
            let (apex, inherited) = resolve_reference(document.root(), &uri)?;
            let c14n_options = match options.target {
                ReferenceTarget::Document => C14nOptions::enveloped(),
                ReferenceTarget::Id(_) => C14nOptions::default(),
            };
            let canonical = canonicalize(apex, &inherited, c14n_options);
            digest_canonical(options.algorithm, &canonical)
        };
        let digest_value = b64_encode(&digest);

        let signature = Element::new("Signature")
            .with_attr("xmlns", XMLDSIG_NS)
            .with_child(signed_info(options, &digest_value))
            .with_child(Element::new("SignatureValue"))
            .with_child(self.key_info()?);
        document.root_mut().push_child(signature);

        let signed_info_bytes = {
            let root = document.root();
            let signature = root
                .elements()
                .last()
                .ok_or_else(|| CryptoError::signing("signature element missing"))?;
            let signed_info = signature
                .child("SignedInfo")
                .ok_or_else(|| CryptoError::signing("SignedInfo missing"))?;
            canonicalize(
                signed_info,
                &child_scope(root, signature),
                C14nOptions::default(),
            )
        };
        let signature_bytes = rsa_sign(
            self.certificate.private_key(),
            options.algorithm,
            signed_info_bytes.as_bytes(),
        )?;
        let signature_value = b64_encode(&signature_bytes);

        document
            .root_mut()
            .elements_mut()
            .last()
            .and_then(|signature| signature.child_mut("SignatureValue"))
            .ok_or_else(|| CryptoError::signing("SignatureValue missing"))?
            .set_text(signature_value.clone());

        tracing::debug!(
            algorithm = %options.algorithm,
            reference = %uri,
            root = document.root().name(),
            "signed XML document"
        );

        Ok(SignedXml {
            document,
            result: SignatureResult {
                digest_value,
                signature_value,
                signed_at: Utc::now(),
                algorithm: options.algorithm,
                reference_uri: uri,
            },
        })
    }
}
