//! # Certificate CLI — inspect the configured signing certificate.
//!
//! ```bash
//! sii cert inspect
//! sii cert inspect --json
//! ```

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use serde::Serialize;
use sii_client::SiiConfig;
use sii_crypto::Certificate;

/// Days before expiry at which `inspect` warns.
pub const EXPIRY_WARNING_DAYS: i64 = 30;

/// Certificate subcommand arguments.
#[derive(Args, Debug)]
pub struct CertArgs {
    #[command(subcommand)]
    pub command: CertCommand,
}

/// Available certificate subcommands.
#[derive(Subcommand, Debug)]
pub enum CertCommand {
    /// Show holder identity and validity. Exits 2 when the certificate is
    /// outside its validity window.
    Inspect {
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
}

/// Summary printed by `inspect`.
#[derive(Debug, Serialize)]
pub struct CertificateSummary {
    pub rut: String,
    pub name: String,
    pub email: Option<String>,
    pub issuer: String,
    pub serial_number: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub days_until_expiry: i64,
    pub valid: bool,
    pub expiring_soon: bool,
}

impl CertificateSummary {
    /// Summary of `certificate`.
    pub fn of(certificate: &Certificate) -> Result<Self> {
        let info = certificate.signer_info()?;
        Ok(Self {
            rut: info.rut.to_string(),
            name: info.name,
            email: info.email,
            issuer: certificate.issuer_name(),
            serial_number: certificate.serial_number()?,
            not_before: certificate.not_before(),
            not_after: certificate.not_after(),
            days_until_expiry: certificate.days_until_expiry(),
            valid: certificate.validate().is_ok(),
            expiring_soon: certificate.is_expiring_soon(EXPIRY_WARNING_DAYS),
        })
    }
}

/// Execute the cert subcommand.
pub fn run_cert(args: &CertArgs, config: &SiiConfig) -> Result<u8> {
    match &args.command {
        CertCommand::Inspect { json } => {
            let certificate = config.load_certificate()?;
            let summary = CertificateSummary::of(&certificate)?;
            if *json {
                crate::print_json(&summary)?;
            } else {
                print_summary(&summary);
            }
            if !summary.valid {
                tracing::error!(not_after = %summary.not_after, "certificate is not valid now");
                return Ok(2);
            }
            if summary.expiring_soon {
                tracing::warn!(days = summary.days_until_expiry, "certificate expires soon");
            }
            Ok(0)
        }
    }
}

fn print_summary(summary: &CertificateSummary) {
    println!("  holder:     {} ({})", summary.name, summary.rut);
    if let Some(email) = &summary.email {
        println!("  email:      {email}");
    }
    println!("  issuer:     {}", summary.issuer);
    println!("  serial:     {}", summary.serial_number);
    println!("  not before: {}", summary.not_before.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  not after:  {}", summary.not_after.format("%Y-%m-%d %H:%M:%S UTC"));
    let state = if !summary.valid {
        "INVALID".to_string()
    } else if summary.expiring_soon {
        format!("valid, expires in {} days", summary.days_until_expiry)
    } else {
        "valid".to_string()
    };
    println!("  status:     {state}");
}
