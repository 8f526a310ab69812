//! # Electronic Documents
//!
//! Typed document model and the builder producing a signed `DTE`:
//!
//! ```text
//! DTE version="1.0"
//! ├── Documento ID="F{folio}T{tipo}"
//! │   ├── Encabezado (IdDoc, Emisor, Receptor, Totales)
//! │   ├── Detalle*   (one per line, numbered from 1)
//! │   ├── TED        (timbre signed with the CAF issuer key)
//! │   └── TmstFirma
//! └── Signature      (reference #F{folio}T{tipo})
//! ```
//!
//! Amounts are taken as given; no tax arithmetic happens here.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sii_caf::{build_ted, Caf, TimbreData};
use sii_core::{DigestAlgorithm, ErrorKind, Rut, SiiError, TipoDte};
use sii_crypto::{Element, SignOptions, SignedXml, XmlDocument, XmlSigner};

/// Namespace of documents and envelopes.
pub const SII_DTE_NS: &str = "http://www.sii.cl/SiiDte";

/// Most detail lines a document may carry.
pub const MAX_DETAIL_LINES: usize = 60;

/// Document identification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdDoc {
    /// Document type.
    pub tipo: TipoDte,
    /// Folio, from a CAF of the same type.
    pub folio: u64,
    /// Issue date.
    pub fecha_emision: NaiveDate,
    /// Payment form (1 cash, 2 credit, 3 free of charge).
    #[serde(default)]
    pub forma_pago: Option<u8>,
}

/// Issuer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Emisor {
    /// Issuer RUT; must match the CAF.
    pub rut: Rut,
    /// Legal name.
    pub razon_social: String,
    /// Line of business.
    pub giro: String,
    /// Economic activity code.
    #[serde(default)]
    pub acteco: Option<u32>,
    /// Street address.
    #[serde(default)]
    pub direccion: Option<String>,
    /// Commune.
    #[serde(default)]
    pub comuna: Option<String>,
    /// City.
    #[serde(default)]
    pub ciudad: Option<String>,
}

/// Receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receptor {
    /// Receiver RUT.
    pub rut: Rut,
    /// Legal name.
    pub razon_social: String,
    /// Line of business.
    #[serde(default)]
    pub giro: Option<String>,
    /// Street address.
    #[serde(default)]
    pub direccion: Option<String>,
    /// Commune.
    #[serde(default)]
    pub comuna: Option<String>,
    /// City.
    #[serde(default)]
    pub ciudad: Option<String>,
}

/// Document totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totales {
    /// Net taxable amount.
    #[serde(default)]
    pub monto_neto: Option<u64>,
    /// Exempt amount.
    #[serde(default)]
    pub monto_exento: Option<u64>,
    /// VAT rate, percent.
    #[serde(default)]
    pub tasa_iva: Option<u8>,
    /// VAT amount.
    #[serde(default)]
    pub iva: Option<u64>,
    /// Total.
    pub monto_total: u64,
}

/// One detail line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detalle {
    /// Item name.
    pub nombre: String,
    /// Quantity.
    #[serde(default)]
    pub cantidad: Option<f64>,
    /// Unit price.
    #[serde(default)]
    pub precio: Option<f64>,
    /// Line amount.
    pub monto: u64,
    /// Line is VAT exempt.
    #[serde(default)]
    pub exento: bool,
}

/// A document before stamping and signing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Documento {
    /// Identification.
    pub id_doc: IdDoc,
    /// Issuer.
    pub emisor: Emisor,
    /// Receiver.
    pub receptor: Receptor,
    /// Totals.
    pub totales: Totales,
    /// Detail lines.
    pub detalle: Vec<Detalle>,
}

fn invalid(message: impl Into<String>) -> SiiError {
    SiiError::new(ErrorKind::DocumentoInvalido, message)
}

fn push_opt<T: ToString>(el: Element, name: &str, value: &Option<T>) -> Element {
    match value {
        Some(v) => el.with_text_child(name, v.to_string()),
        None => el,
    }
}

impl Documento {
    /// `ID` attribute of the `Documento` element.
    pub fn reference_id(&self) -> String {
        format!("F{}T{}", self.id_doc.folio, self.id_doc.tipo.code())
    }

    /// Shape checks done before any folio is stamped.
    pub fn validate(&self) -> Result<(), SiiError> {
        if self.id_doc.folio == 0 {
            return Err(SiiError::new(ErrorKind::FolioInvalido, "folio must be positive"));
        }
        if self.emisor.razon_social.trim().is_empty() {
            return Err(invalid("issuer legal name is empty"));
        }
        if self.receptor.razon_social.trim().is_empty() {
            return Err(invalid("receiver legal name is empty"));
        }
        if self.detalle.is_empty() {
            return Err(invalid("document has no detail lines"));
        }
        if self.detalle.len() > MAX_DETAIL_LINES {
            return Err(invalid(format!(
                "{} detail lines, at most {MAX_DETAIL_LINES} allowed",
                self.detalle.len()
            )));
        }
        if let Some(n) = self.detalle.iter().position(|d| d.nombre.trim().is_empty()) {
            return Err(invalid(format!("detail line {} has no item name", n + 1)));
        }
        Ok(())
    }

    /// Fields stamped into the `TED`.
    pub fn timbre_data(&self, timestamp: NaiveDateTime) -> TimbreData {
        TimbreData {
            tipo: self.id_doc.tipo,
            folio: self.id_doc.folio,
            fecha_emision: self.id_doc.fecha_emision,
            rut_emisor: self.emisor.rut.clone(),
            rut_receptor: self.receptor.rut.clone(),
            razon_social_receptor: self.receptor.razon_social.clone(),
            monto_total: self.totales.monto_total,
            primer_item: self
                .detalle
                .first()
                .map(|d| d.nombre.clone())
                .unwrap_or_default(),
            timestamp,
        }
    }

    fn encabezado(&self) -> Element {
        let id_doc = Element::new("IdDoc")
            .with_text_child("TipoDTE", self.id_doc.tipo.code().to_string())
            .with_text_child("Folio", self.id_doc.folio.to_string())
            .with_text_child("FchEmis", self.id_doc.fecha_emision.format("%Y-%m-%d").to_string());
        let id_doc = push_opt(id_doc, "FmaPago", &self.id_doc.forma_pago);

        let e = &self.emisor;
        let emisor = Element::new("Emisor")
            .with_text_child("RUTEmisor", e.rut.to_string())
            .with_text_child("RznSoc", &e.razon_social)
            .with_text_child("GiroEmis", &e.giro);
        let emisor = push_opt(emisor, "Acteco", &e.acteco);
        let emisor = push_opt(emisor, "DirOrigen", &e.direccion);
        let emisor = push_opt(emisor, "CmnaOrigen", &e.comuna);
        let emisor = push_opt(emisor, "CiudadOrigen", &e.ciudad);

        let r = &self.receptor;
        let receptor = Element::new("Receptor")
            .with_text_child("RUTRecep", r.rut.to_string())
            .with_text_child("RznSocRecep", &r.razon_social);
        let receptor = push_opt(receptor, "GiroRecep", &r.giro);
        let receptor = push_opt(receptor, "DirRecep", &r.direccion);
        let receptor = push_opt(receptor, "CmnaRecep", &r.comuna);
        let receptor = push_opt(receptor, "CiudadRecep", &r.ciudad);

        let t = &self.totales;
        let totales = push_opt(Element::new("Totales"), "MntNeto", &t.monto_neto);
        let totales = push_opt(totales, "MntExe", &t.monto_exento);
        let totales = push_opt(totales, "TasaIVA", &t.tasa_iva);
        let totales = push_opt(totales, "IVA", &t.iva);
        let totales = totales.with_text_child("MntTotal", t.monto_total.to_string());

        Element::new("Encabezado")
            .with_child(id_doc)
            .with_child(emisor)
            .with_child(receptor)
            .with_child(totales)
    }

    fn detalle_elements(&self) -> impl Iterator<Item = Element> + '_ {
        self.detalle.iter().enumerate().map(|(i, d)| {
            let mut line = Element::new("Detalle").with_text_child("NroLinDet", (i + 1).to_string());
            if d.exento {
                line = line.with_text_child("IndExe", "1");
            }
            line = line.with_text_child("NmbItem", &d.nombre);
            line = push_opt(line, "QtyItem", &d.cantidad);
            line = push_opt(line, "PrcItem", &d.precio);
            line.with_text_child("MontoItem", d.monto.to_string())
        })
    }

    /// Unsigned `DTE` element stamped with `ted`.
    pub fn to_element(&self, ted: Element, timestamp: NaiveDateTime) -> Element {
        let mut documento = Element::new("Documento")
            .with_attr("ID", self.reference_id())
            .with_child(self.encabezado());
        for line in self.detalle_elements() {
            documento.push_child(line);
        }
        let documento = documento
            .with_child(ted)
            .with_text_child("TmstFirma", timestamp.format("%Y-%m-%dT%H:%M:%S").to_string());
        Element::new("DTE")
            .with_attr("xmlns", SII_DTE_NS)
            .with_attr("version", "1.0")
            .with_child(documento)
    }
}

/// Stamps and signs documents.
pub struct DteBuilder<'a> {
    signer: &'a dyn XmlSigner,
    algorithm: DigestAlgorithm,
}

impl<'a> DteBuilder<'a> {
    /// Builder signing with `signer` and `algorithm`.
    pub fn new(signer: &'a dyn XmlSigner, algorithm: DigestAlgorithm) -> Self {
        Self { signer, algorithm }
    }

    /// Validate, stamp with a timbre from `caf`, and sign.
    pub fn build(&self, documento: &Documento, caf: &Caf, timestamp: NaiveDateTime) -> Result<SignedXml, SiiError> {
        documento.validate()?;
        let ted = build_ted(caf, &documento.timbre_data(timestamp))?;
        let element = documento.to_element(ted, timestamp);
        let options = SignOptions::new(self.algorithm).with_reference_id(documento.reference_id());
        let signed = self.signer.sign_document(XmlDocument::new(element), &options)?;
        tracing::debug!(
            tipo = documento.id_doc.tipo.code(),
            folio = documento.id_doc.folio,
            "document signed"
        );
        Ok(signed)
    }
}

/// Type and folio of a parsed `DTE`.
pub fn document_identity(dte: &Element) -> Result<(TipoDte, u64), SiiError> {
    if dte.local_name() != "DTE" {
        return Err(invalid(format!("expected DTE, got {}", dte.name())));
    }
    let id_doc = dte
        .path(&["Documento", "Encabezado", "IdDoc"])
        .ok_or_else(|| invalid("DTE has no Documento/Encabezado/IdDoc"))?;
    let tipo = id_doc
        .child_text("TipoDTE")
        .and_then(|t| t.trim().parse::<u16>().ok())
        .ok_or_else(|| invalid("TipoDTE missing or not numeric"))
        .and_then(TipoDte::from_code)?;
    let folio = id_doc
        .child_text("Folio")
        .and_then(|f| f.trim().parse::<u64>().ok())
        .ok_or_else(|| invalid("Folio missing or not numeric"))?;
    if folio == 0 {
        return Err(SiiError::new(ErrorKind::FolioInvalido, "folio must be positive"));
    }
    Ok((tipo, folio))
}
