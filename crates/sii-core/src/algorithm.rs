//! # Signature Algorithms
//!
//! The authority's endpoints are not uniform: authentication and document
//! signatures historically use RSA-SHA1 while newer flows use RSA-SHA256.
//! The algorithm is therefore an explicit per-operation value.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, SiiError};

/// Canonical XML 1.0 (inclusive, without comments).
pub const C14N_URI: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";

/// Enveloped-signature transform.
pub const ENVELOPED_SIGNATURE_URI: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

/// XML digital signature namespace.
pub const XMLDSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";

/// Digest algorithm paired with its RSA PKCS#1 v1.5 signature method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// SHA-1 with `rsa-sha1`.
    Sha1,
    /// SHA-256 with `rsa-sha256`.
    Sha256,
}

impl DigestAlgorithm {
    /// `DigestMethod` algorithm URI.
    pub fn digest_uri(&self) -> &'static str {
        match self {
            Self::Sha1 => "http://www.w3.org/2000/09/xmldsig#sha1",
            Self::Sha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
        }
    }

    /// `SignatureMethod` algorithm URI.
    pub fn signature_uri(&self) -> &'static str {
        match self {
            Self::Sha1 => "http://www.w3.org/2000/09/xmldsig#rsa-sha1",
            Self::Sha256 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256",
        }
    }

    /// Resolve a `DigestMethod` URI.
    pub fn from_digest_uri(uri: &str) -> Result<Self, SiiError> {
        match uri {
            u if u == Self::Sha1.digest_uri() => Ok(Self::Sha1),
            u if u == Self::Sha256.digest_uri() => Ok(Self::Sha256),
            other => Err(unsupported(other)),
        }
    }

    /// Resolve a `SignatureMethod` URI.
    pub fn from_signature_uri(uri: &str) -> Result<Self, SiiError> {
        match uri {
            u if u == Self::Sha1.signature_uri() => Ok(Self::Sha1),
            u if u == Self::Sha256.signature_uri() => Ok(Self::Sha256),
            other => Err(unsupported(other)),
        }
    }

    /// Digest length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    /// Short name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }
}

fn unsupported(uri: &str) -> SiiError {
    SiiError::new(
        ErrorKind::Firma,
        format!("unsupported algorithm URI {uri:?}"),
    )
}

impl std::fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DigestAlgorithm {
    type Err = SiiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "sha1" | "rsasha1" => Ok(Self::Sha1),
            "sha256" | "rsasha256" => Ok(Self::Sha256),
            other => Err(unsupported(other)),
        }
    }
}
