//! # Signing CLI — sign and verify enveloped XML signatures.
//!
//! ```bash
//! sii sign dte.xml --reference-id F1T33 --out dte.signed.xml
//! sii sign semilla.xml --algorithm sha256
//! sii verify dte.signed.xml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use sii_client::SiiConfig;
use sii_core::DigestAlgorithm;
use sii_crypto::{verify_document, SignOptions, SignatureEngine, XmlEncoding, XmlSigner};

use crate::read_xml;

/// Arguments of `sii sign`.
#[derive(Args, Debug)]
pub struct SignArgs {
    /// XML file to sign.
    pub file: PathBuf,

    /// Digest and signature algorithm (sha1, sha256). Defaults to the
    /// configured document algorithm.
    #[arg(long)]
    pub algorithm: Option<DigestAlgorithm>,

    /// `ID` of the element to reference. The whole document when absent.
    #[arg(long)]
    pub reference_id: Option<String>,

    /// Output file. Signed XML goes to stdout when absent.
    #[arg(long, short)]
    pub out: Option<PathBuf>,

    /// Write UTF-8 instead of ISO-8859-1.
    #[arg(long)]
    pub utf8: bool,
}

/// Arguments of `sii verify`.
#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Signed XML file.
    pub file: PathBuf,
}

/// Execute `sii sign`.
pub fn run_sign(args: &SignArgs, config: &SiiConfig) -> Result<u8> {
    let document = read_xml(&args.file)?;
    let certificate = config.load_certificate()?;
    certificate.validate()?;
    let engine = SignatureEngine::new(Arc::new(certificate));

    let algorithm = args.algorithm.unwrap_or(config.document_algorithm);
    let mut options = SignOptions::new(algorithm);
    if let Some(id) = &args.reference_id {
        options = options.with_reference_id(id.clone());
    }
    let signed = engine.sign_document(document, &options)?;
    tracing::info!(
        file = %args.file.display(),
        algorithm = %algorithm,
        reference = %signed.result.reference_uri,
        "document signed"
    );

    let encoding = if args.utf8 {
        XmlEncoding::Utf8
    } else {
        XmlEncoding::Latin1
    };
    let bytes = signed.to_bytes(encoding);
    match &args.out {
        Some(out) => {
            std::fs::write(out, &bytes)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("  signed:    {}", out.display());
            println!("  reference: {}", signed.result.reference_uri);
            println!("  digest:    {}", signed.result.digest_value);
        }
        None => {
            use std::io::Write;
            std::io::stdout()
                .write_all(&bytes)
                .context("failed to write to stdout")?;
        }
    }
    Ok(0)
}

/// Execute `sii verify`. Exits 1 when the signature does not hold.
pub fn run_verify(args: &VerifyArgs) -> Result<u8> {
    let document = read_xml(&args.file)?;
    match verify_document(&document) {
        Ok(verified) => {
            println!("  file:      {}", args.file.display());
            println!("  algorithm: {}", verified.algorithm);
            println!("  reference: {}", verified.reference_uri);
            if let Some(cert) = &verified.certificate {
                let subject = cert
                    .subject_name()
                    .entries()
                    .filter_map(|e| e.data().as_utf8().ok().map(|s| s.to_string()))
                    .collect::<Vec<_>>()
                    .join(", ");
                println!("  signer:    {subject}");
            }
            println!("  result:    OK");
            Ok(0)
        }
        Err(err) => {
            println!("  file:      {}", args.file.display());
            println!("  result:    FAILED ({err})");
            Ok(1)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use sii_crypto::testing::{TestCertificate, TestCertificateSpec};

    fn config_with_certificate(dir: &Path) -> SiiConfig {
        let generated = TestCertificate::generate(&TestCertificateSpec::default());
        let path = dir.join("cert.p12");
        std::fs::write(&path, generated.pkcs12("clave")).unwrap();
        SiiConfig {
            cert_path: Some(path),
            cert_password: Some(sii_client::Secret::new("clave")),
            ..SiiConfig::default()
        }
    }

    #[test]
    fn sign_then_verify() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_certificate(dir.path());
        let input = dir.path().join("doc.xml");
        std::fs::write(&input, r#"<DTE><Documento ID="F1T33"><Folio>1</Folio></Documento></DTE>"#)
            .unwrap();
        let output = dir.path().join("doc.signed.xml");

        let sign = SignArgs {
            file: input,
            algorithm: Some(DigestAlgorithm::Sha256),
            reference_id: Some("F1T33".into()),
            out: Some(output.clone()),
            utf8: false,
        };
        assert_eq!(run_sign(&sign, &config).unwrap(), 0);
        assert_eq!(run_verify(&VerifyArgs { file: output.clone() }).unwrap(), 0);

        let tampered = std::fs::read_to_string(&output)
            .unwrap()
            .replace("<Folio>1</Folio>", "<Folio>2</Folio>");
        std::fs::write(&output, tampered).unwrap();
        assert_eq!(run_verify(&VerifyArgs { file: output }).unwrap(), 1);
    }

    #[test]
    fn malformed_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("broken.xml");
        std::fs::write(&input, "<a><b></a>").unwrap();
        assert!(run_verify(&VerifyArgs { file: input }).is_err());
    }
}
