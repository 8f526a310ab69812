//! # Deployment Environment
//!
//! The authority runs two independent deployments. Each [`Ambiente`]
//! selects a host; each [`Endpoint`] is a fixed path on that host.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, SiiError};

/// Certification (sandbox) or production deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Ambiente {
    /// Sandbox used while the taxpayer is being certified.
    #[default]
    Certificacion,
    /// Live deployment.
    Produccion,
}

impl Ambiente {
    /// Host serving this environment.
    pub fn host(&self) -> &'static str {
        match self {
            Self::Certificacion => "maullin.sii.cl",
            Self::Produccion => "palena.sii.cl",
        }
    }

    /// `https://<host>` for this environment.
    pub fn base_url(&self) -> String {
        format!("https://{}", self.host())
    }

    /// Stable lowercase name, also used in cache keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Certificacion => "certificacion",
            Self::Produccion => "produccion",
        }
    }
}

impl std::fmt::Display for Ambiente {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Ambiente {
    type Err = SiiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "certificacion" | "certification" | "cert" | "maullin" => Ok(Self::Certificacion),
            "produccion" | "production" | "prod" | "palena" => Ok(Self::Produccion),
            other => Err(SiiError::new(
                ErrorKind::Procesamiento,
                format!("unknown environment {other:?}"),
            )),
        }
    }
}

/// Authority web services used by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    /// Issues an authentication seed.
    Seed,
    /// Exchanges a signed seed for a session token.
    Token,
    /// Receives submission envelopes.
    Upload,
    /// Reports the processing status of a submission.
    UploadStatus,
    /// Reports the status of one document.
    DocumentStatus,
}

impl Endpoint {
    /// Path on the environment host.
    pub fn path(&self) -> &'static str {
        match self {
            Self::Seed => "/DTEWS/CrSeed.jws",
            Self::Token => "/DTEWS/GetTokenFromSeed.jws",
            Self::Upload => "/cgi_dte/UPL/DTEUpload",
            Self::UploadStatus => "/DTEWS/QueryEstUp.jws",
            Self::DocumentStatus => "/DTEWS/QueryEstDte.jws",
        }
    }

    /// SOAP operation name, `None` for the multipart upload.
    pub fn operation(&self) -> Option<&'static str> {
        match self {
            Self::Seed => Some("getSeed"),
            Self::Token => Some("getToken"),
            Self::Upload => None,
            Self::UploadStatus => Some("getEstUp"),
            Self::DocumentStatus => Some("getEstDte"),
        }
    }

    /// Whether the call needs a session token.
    pub fn requires_token(&self) -> bool {
        !matches!(self, Self::Seed | Self::Token)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.path())
    }
}
