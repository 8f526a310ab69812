//! # Electronic Stamp (TED)
//!
//! Every document carries a `TED` proving its folio was authorized:
//!
//! ```text
//! TED version="1.0"
//! ├── DD    RE TD F FE RR RSR MNT IT1 CAF TSTED
//! └── FRMT  algoritmo="SHA1withRSA"
//! ```
//!
//! `FRMT` is signed with the issuer key (`RSASK`) of the authorization over
//! the compact `DD`, the same way the authority signs `DA`.

use chrono::{NaiveDate, NaiveDateTime};
use sii_core::{DigestAlgorithm, ErrorKind, Rut, SiiError, TipoDte};
use sii_crypto::digest::{b64_decode, b64_encode, rsa_sign, rsa_verify};
use sii_crypto::{Element, XmlDocument};

use crate::model::Caf;
use crate::parse::CafXml;
use crate::validate::authority_signed_bytes;

const TEXT_LIMIT: usize = 40;

/// Key document fields stamped into the timbre.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimbreData {
    /// Document type.
    pub tipo: TipoDte,
    /// Folio.
    pub folio: u64,
    /// Issue date.
    pub fecha_emision: NaiveDate,
    /// Issuer.
    pub rut_emisor: Rut,
    /// Receiver.
    pub rut_receptor: Rut,
    /// Receiver legal name; truncated to 40 characters.
    pub razon_social_receptor: String,
    /// Document total.
    pub monto_total: u64,
    /// Name of the first line item; truncated to 40 characters.
    pub primer_item: String,
    /// Stamp time (`TSTED`).
    pub timestamp: NaiveDateTime,
}

fn truncate(text: &str) -> String {
    text.trim().chars().take(TEXT_LIMIT).collect()
}

/// Build and sign the `TED` element for a document numbered from `caf`.
pub fn build_ted(caf: &Caf, data: &TimbreData) -> Result<Element, SiiError> {
    if data.tipo != caf.tipo {
        return Err(SiiError::new(
            ErrorKind::FolioInvalido,
            format!(
                "CAF {} authorizes type {}, not {}",
                caf.id,
                caf.tipo.code(),
                data.tipo.code()
            ),
        ));
    }
    if data.rut_emisor != caf.rut_emisor {
        return Err(SiiError::new(
            ErrorKind::FolioInvalido,
            format!("CAF {} belongs to {}, not {}", caf.id, caf.rut_emisor, data.rut_emisor),
        ));
    }
    if !caf.contains_folio(data.folio) {
        return Err(SiiError::new(
            ErrorKind::FolioInvalido,
            format!("folio {} is outside CAF {}", data.folio, caf.id),
        ));
    }

    let authorization = CafXml::parse(&caf.xml)?;
    let issuer_key = authorization.issuer_private_key()?;

    let dd = Element::new("DD")
        .with_text_child("RE", data.rut_emisor.to_string())
        .with_text_child("TD", data.tipo.code().to_string())
        .with_text_child("F", data.folio.to_string())
        .with_text_child("FE", data.fecha_emision.format("%Y-%m-%d").to_string())
        .with_text_child("RR", data.rut_receptor.to_string())
        .with_text_child("RSR", truncate(&data.razon_social_receptor))
        .with_text_child("MNT", data.monto_total.to_string())
        .with_text_child("IT1", truncate(&data.primer_item))
        .with_child(authorization.caf_element()?.without_whitespace())
        .with_text_child("TSTED", data.timestamp.format("%Y-%m-%dT%H:%M:%S").to_string());

    let frmt = rsa_sign(&issuer_key, DigestAlgorithm::Sha1, &authority_signed_bytes(&dd))?;
    tracing::debug!(tipo = data.tipo.code(), folio = data.folio, "stamped TED");
    Ok(Element::new("TED")
        .with_attr("version", "1.0")
        .with_child(dd)
        .with_child(
            Element::new("FRMT")
                .with_attr("algoritmo", "SHA1withRSA")
                .with_text(b64_encode(frmt)),
        ))
}

/// Check `FRMT` against the issuer key published in the embedded CAF.
pub fn verify_ted(ted: &Element) -> Result<(), SiiError> {
    let dd = ted
        .child("DD")
        .ok_or_else(|| SiiError::new(ErrorKind::DocumentoInvalido, "TED has no DD"))?;
    let caf = dd
        .child("CAF")
        .ok_or_else(|| SiiError::new(ErrorKind::DocumentoInvalido, "TED has no CAF"))?;
    let public = CafXml::from_document(XmlDocument::new(caf.clone()))?.issuer_public_key()?;
    let frmt = ted
        .child("FRMT")
        .ok_or_else(|| SiiError::new(ErrorKind::DocumentoInvalido, "TED has no FRMT"))?;
    let signature = b64_decode(&frmt.text())
        .map_err(|e| SiiError::wrap(ErrorKind::Firma, "FRMT is not base64", e))?;
    rsa_verify(&public, DigestAlgorithm::Sha1, &authority_signed_bytes(dd), &signature)
        .map_err(|e| SiiError::wrap(ErrorKind::Firma, "TED signature does not verify", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CafSpec, TestAuthority};

    fn data(folio: u64) -> TimbreData {
        TimbreData {
            tipo: TipoDte::FacturaElectronica,
            folio,
            fecha_emision: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            rut_emisor: Rut::parse("76192083-9").unwrap(),
            rut_receptor: Rut::parse("60803000-K").unwrap(),
            razon_social_receptor: "Servicio de Impuestos Internos con un nombre bastante largo".into(),
            monto_total: 119_000,
            primer_item: "Servicio de consultoría".into(),
            timestamp: NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_opt(10, 30, 0)
                .unwrap(),
        }
    }

    #[test]
    fn stamps_and_verifies() {
        let caf = TestAuthority::new(100).issue_caf(&CafSpec::new(TipoDte::FacturaElectronica, 1, 100));
        let ted = build_ted(&caf, &data(7)).unwrap();

        let dd = ted.child("DD").unwrap();
        assert_eq!(dd.child_text("F").as_deref(), Some("7"));
        assert_eq!(dd.child_text("RSR").unwrap().chars().count(), 40);
        assert_eq!(dd.child_text("TSTED").as_deref(), Some("2024-03-01T10:30:00"));
        assert!(dd.path(&["CAF", "DA", "RNG"]).is_some());
        verify_ted(&ted).unwrap();
    }

    #[test]
    fn tampered_amount_fails_verification() {
        let caf = TestAuthority::new(100).issue_caf(&CafSpec::new(TipoDte::FacturaElectronica, 1, 100));
        let mut ted = build_ted(&caf, &data(7)).unwrap();
        ted.child_mut("DD").unwrap().child_mut("MNT").unwrap().set_text("1");
        assert_eq!(verify_ted(&ted).unwrap_err().kind(), ErrorKind::Firma);
    }

    #[test]
    fn survives_reparse() {
        let caf = TestAuthority::new(100).issue_caf(&CafSpec::new(TipoDte::FacturaElectronica, 1, 100));
        let ted = build_ted(&caf, &data(7)).unwrap();
        let reparsed = XmlDocument::parse_str(&ted.to_xml()).unwrap();
        verify_ted(reparsed.root()).unwrap();
    }

    #[test]
    fn folio_outside_range_is_refused() {
        let caf = TestAuthority::new(100).issue_caf(&CafSpec::new(TipoDte::FacturaElectronica, 1, 100));
        let err = build_ted(&caf, &data(101)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FolioInvalido);
    }

    #[test]
    fn type_mismatch_is_refused() {
        let caf = TestAuthority::new(100).issue_caf(&CafSpec::new(TipoDte::NotaCredito, 1, 100));
        let err = build_ted(&caf, &data(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FolioInvalido);
    }
}
