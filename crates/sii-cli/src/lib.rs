//! # sii-cli — Command Line for the SII Client
//!
//! Provides the `sii` binary on top of the client crates.
//!
//! ## Subcommands
//!
//! - `sii cert inspect`: holder identity and validity of the signing certificate.
//! - `sii sign` / `sii verify`: enveloped XML signatures.
//! - `sii caf`: import, list and check folio authorizations.
//! - `sii submit`: upload documents or a prepared envelope.
//! - `sii status`: poll a submission, optionally until it settles.
//! - `sii query`: status of one issued document.
//!
//! Configuration comes from a YAML file (`--config`) or `SII_*` variables.
//!
//! ```bash
//! sii -v --config sii.yaml caf import caf_33.xml
//! sii submit dte_33_1.xml dte_33_2.xml --wait
//! sii status 0211379914
//! ```

pub mod caf;
pub mod cert;
pub mod remote;
pub mod sign;

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use sii_client::SiiConfig;
use sii_core::TipoDte;
use sii_crypto::XmlDocument;

/// Load configuration from `path`, or from the environment when absent.
pub fn load_config(path: Option<&Path>) -> Result<SiiConfig> {
    match path {
        Some(path) => SiiConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => SiiConfig::from_env().context("failed to load configuration from environment"),
    }
}

/// Document type from its numeric code.
pub fn parse_tipo(code: &str) -> Result<TipoDte, String> {
    let code: u16 = code
        .trim()
        .parse()
        .map_err(|_| format!("document type must be numeric, got {code:?}"))?;
    TipoDte::from_code(code).map_err(|e| e.to_string())
}

/// Read and parse an XML file.
pub fn read_xml(path: &Path) -> Result<XmlDocument> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    XmlDocument::parse(&bytes).with_context(|| format!("{} is not well-formed XML", path.display()))
}

/// Print `value` as pretty JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{text}");
    Ok(())
}
