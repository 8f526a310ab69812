//! # Authorization XML
//!
//! Reads the authority's `AUTORIZACION` document:
//!
//! ```text
//! AUTORIZACION
//! ├── CAF version="1.0"
//! │   ├── DA   RE RS TD RNG(D H) FA RSAPK(M E) IDK
//! │   └── FRMA algoritmo="SHA1withRSA"
//! ├── RSASK    issuer private key (PEM)
//! └── RSAPUBK  issuer public key (PEM)
//! ```
//!
//! A bare `CAF` root is accepted too; such documents cannot stamp timbres
//! because they carry no `RSASK`.

use chrono::{NaiveDate, Utc};
use openssl::bn::BigNum;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::Rsa;
use sii_core::{ErrorKind, Rut, SiiError, TipoDte};
use sii_crypto::digest::b64_decode;
use sii_crypto::{Element, XmlDocument};

use crate::model::{Caf, CafState};

/// A parsed authorization document.
#[derive(Debug, Clone)]
pub struct CafXml {
    document: XmlDocument,
}

fn invalid(message: impl Into<String>) -> SiiError {
    SiiError::new(ErrorKind::DocumentoInvalido, message)
}

impl CafXml {
    /// Parse and check the document shape.
    pub fn parse(bytes: &[u8]) -> Result<Self, SiiError> {
        Self::from_document(XmlDocument::parse(bytes)?)
    }

    /// Check the shape of an already parsed document.
    pub fn from_document(document: XmlDocument) -> Result<Self, SiiError> {
        let parsed = Self { document };
        match parsed.document.root().local_name() {
            "AUTORIZACION" | "CAF" => {}
            other => return Err(invalid(format!("unexpected root element {other}"))),
        }
        parsed.caf_element()?.child("DA").ok_or_else(|| invalid("CAF has no DA"))?;
        Ok(parsed)
    }

    /// The `CAF` element.
    pub fn caf_element(&self) -> Result<&Element, SiiError> {
        let root = self.document.root();
        if root.local_name() == "CAF" {
            return Ok(root);
        }
        root.child("CAF").ok_or_else(|| invalid("AUTORIZACION has no CAF"))
    }

    /// The authorization data signed by the authority.
    pub fn da(&self) -> Result<&Element, SiiError> {
        self.caf_element()?
            .child("DA")
            .ok_or_else(|| invalid("CAF has no DA"))
    }

    fn da_text(&self, path: &[&str]) -> Result<String, SiiError> {
        self.da()?
            .path_text(path)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| invalid(format!("DA has no {}", path.join("/"))))
    }

    /// Authority signature bytes (`FRMA`).
    pub fn authority_signature(&self) -> Result<Vec<u8>, SiiError> {
        let frma = self
            .caf_element()?
            .child("FRMA")
            .ok_or_else(|| invalid("CAF has no FRMA"))?;
        b64_decode(&frma.text()).map_err(|e| SiiError::wrap(ErrorKind::Firma, "FRMA is not base64", e))
    }

    /// Declared `FRMA` algorithm, if any.
    pub fn signature_algorithm(&self) -> Option<String> {
        self.caf_element()
            .ok()?
            .child("FRMA")?
            .attr("algoritmo")
            .map(str::to_string)
    }

    /// Authority key id.
    pub fn idk(&self) -> Result<u32, SiiError> {
        let text = self.da_text(&["IDK"])?;
        text.parse()
            .map_err(|_| invalid(format!("IDK {text:?} is not a number")))
    }

    /// Public half of the issuer key as published in `RSAPK`.
    pub fn issuer_public_key(&self) -> Result<PKey<Public>, SiiError> {
        let component = |name: &str| -> Result<BigNum, SiiError> {
            let bytes = b64_decode(&self.da_text(&["RSAPK", name])?)
                .map_err(|e| SiiError::wrap(ErrorKind::DocumentoInvalido, "RSAPK is not base64", e))?;
            BigNum::from_slice(&bytes).map_err(|e| SiiError::wrap(ErrorKind::DocumentoInvalido, "RSAPK", e))
        };
        let rsa = Rsa::from_public_components(component("M")?, component("E")?)
            .map_err(|e| SiiError::wrap(ErrorKind::DocumentoInvalido, "RSAPK", e))?;
        PKey::from_rsa(rsa).map_err(|e| SiiError::wrap(ErrorKind::DocumentoInvalido, "RSAPK", e))
    }

    /// Issuer private key (`RSASK`) used to stamp timbres.
    pub fn issuer_private_key(&self) -> Result<PKey<Private>, SiiError> {
        let pem = self
            .document
            .root()
            .child_text("RSASK")
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| invalid("authorization carries no RSASK"))?;
        PKey::private_key_from_pem(pem.as_bytes())
            .map_err(|e| SiiError::wrap(ErrorKind::Firma, "RSASK is not a PEM private key", e))
    }

    /// Build the model record. `raw` is kept verbatim.
    pub fn to_caf(&self, raw: &[u8]) -> Result<Caf, SiiError> {
        let rut_emisor = Rut::parse(&self.da_text(&["RE"])?)?;
        let razon_social = self.da_text(&["RS"])?;
        let td = self.da_text(&["TD"])?;
        let tipo = TipoDte::from_code(
            td.parse()
                .map_err(|_| invalid(format!("TD {td:?} is not a number")))?,
        )?;
        let folio = |name: &str| -> Result<u64, SiiError> {
            let text = self.da_text(&["RNG", name])?;
            text.parse().map_err(|_| {
                SiiError::new(ErrorKind::FolioInvalido, format!("RNG/{name} {text:?} is not a folio"))
            })
        };
        let folio_inicial = folio("D")?;
        let folio_final = folio("H")?;
        if folio_inicial == 0 || folio_inicial > folio_final {
            return Err(SiiError::new(
                ErrorKind::FolioInvalido,
                format!("malformed folio range {folio_inicial}..={folio_final}"),
            ));
        }
        let fa = self.da_text(&["FA"])?;
        let fecha_autorizacion = NaiveDate::parse_from_str(&fa, "%Y-%m-%d")
            .map_err(|e| SiiError::wrap(ErrorKind::DocumentoInvalido, format!("FA {fa:?}"), e))?;

        let now = Utc::now();
        Ok(Caf {
            id: Caf::make_id(&rut_emisor, tipo, folio_inicial, folio_final),
            tipo,
            rut_emisor,
            razon_social,
            folio_inicial,
            folio_final,
            folio_ultimo: 0,
            fecha_autorizacion,
            fecha_vencimiento: Caf::expiry_for(fecha_autorizacion),
            idk: self.idk()?,
            estado: CafState::Activo,
            xml: raw.to_vec(),
            firma_sii: self.authority_signature()?,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Parse an authorization document into a fresh, unconsumed [`Caf`].
pub fn parse_caf(bytes: &[u8]) -> Result<Caf, SiiError> {
    CafXml::parse(bytes)?.to_caf(bytes)
}
