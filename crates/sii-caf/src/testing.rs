//! A stand-in authority issuing signed authorizations. Compiled for tests
//! and the `test-util` feature.

use chrono::NaiveDate;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::Rsa;
use sii_core::{DigestAlgorithm, Rut, TipoDte};
use sii_crypto::digest::{b64_encode, rsa_sign};
use sii_crypto::{Element, XmlDocument, XmlEncoding};

use crate::model::Caf;
use crate::parse::parse_caf;
use crate::validate::{authority_signed_bytes, AuthorityKeyring};

/// Contents of an authorization to issue.
#[derive(Debug, Clone)]
pub struct CafSpec {
    /// Issuer.
    pub rut: Rut,
    /// Issuer name.
    pub razon_social: String,
    /// Document type.
    pub tipo: TipoDte,
    /// First folio.
    pub desde: u64,
    /// Last folio.
    pub hasta: u64,
    /// Authorization date.
    pub fecha: NaiveDate,
}

impl CafSpec {
    /// Range for the default issuer, authorized today.
    pub fn new(tipo: TipoDte, desde: u64, hasta: u64) -> Self {
        Self {
            rut: Rut::parse("76192083-9").expect("valid RUT"),
            razon_social: "EMPRESA DE PRUEBA SPA".into(),
            tipo,
            desde,
            hasta,
            fecha: chrono::Utc::now().date_naive(),
        }
    }

    /// Override the authorization date.
    pub fn authorized_on(mut self, fecha: NaiveDate) -> Self {
        self.fecha = fecha;
        self
    }
}

/// Signing key of a fake authority.
pub struct TestAuthority {
    /// Key id written as `IDK`.
    pub idk: u32,
    key: PKey<Private>,
}

impl TestAuthority {
    /// Fresh authority key.
    pub fn new(idk: u32) -> Self {
        let rsa = Rsa::generate(1024).expect("authority key");
        Self {
            idk,
            key: PKey::from_rsa(rsa).expect("wrap authority key"),
        }
    }

    /// Public key.
    pub fn public_key(&self) -> PKey<Public> {
        let pem = self.public_key_pem();
        PKey::public_key_from_pem(&pem).expect("public key")
    }

    /// Public key as SPKI PEM.
    pub fn public_key_pem(&self) -> Vec<u8> {
        self.key.public_key_to_pem().expect("public key PEM")
    }

    /// Keyring trusting only this authority.
    pub fn keyring(&self) -> AuthorityKeyring {
        let mut keyring = AuthorityKeyring::new();
        keyring.insert(self.idk, self.public_key());
        keyring
    }

    /// Authorization XML (ISO-8859-1) with a fresh issuer key pair.
    pub fn issue(&self, spec: &CafSpec) -> Vec<u8> {
        let issuer = Rsa::generate(1024).expect("issuer key");
        let da = Element::new("DA")
            .with_text_child("RE", spec.rut.to_string())
            .with_text_child("RS", &spec.razon_social)
            .with_text_child("TD", spec.tipo.code().to_string())
            .with_child(
                Element::new("RNG")
                    .with_text_child("D", spec.desde.to_string())
                    .with_text_child("H", spec.hasta.to_string()),
            )
            .with_text_child("FA", spec.fecha.format("%Y-%m-%d").to_string())
            .with_child(
                Element::new("RSAPK")
                    .with_text_child("M", b64_encode(issuer.n().to_vec()))
                    .with_text_child("E", b64_encode(issuer.e().to_vec())),
            )
            .with_text_child("IDK", self.idk.to_string());
        let firma = rsa_sign(&self.key, DigestAlgorithm::Sha1, &authority_signed_bytes(&da))
            .expect("authority signature");

        let private_pem = issuer.private_key_to_pem().expect("issuer private PEM");
        let public_pem = issuer.public_key_to_pem().expect("issuer public PEM");
        let root = Element::new("AUTORIZACION")
            .with_child(
                Element::new("CAF")
                    .with_attr("version", "1.0")
                    .with_child(da)
                    .with_child(
                        Element::new("FRMA")
                            .with_attr("algoritmo", "SHA1withRSA")
                            .with_text(b64_encode(firma)),
                    ),
            )
            .with_text_child("RSASK", String::from_utf8_lossy(&private_pem))
            .with_text_child("RSAPUBK", String::from_utf8_lossy(&public_pem));
        XmlDocument::new(root).to_bytes(XmlEncoding::Latin1)
    }

    /// Issue and parse.
    pub fn issue_caf(&self, spec: &CafSpec) -> Caf {
        parse_caf(&self.issue(spec)).expect("issued CAF parses")
    }
}
