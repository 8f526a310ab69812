//! # Submission Envelope
//!
//! `EnvioDTE` wrapping signed documents for upload:
//!
//! ```text
//! EnvioDTE version="1.0"
//! ├── SetDTE ID="SetDoc"
//! │   ├── Caratula  RutEmisor RutEnvia RutReceptor FchResol NroResol TmstFirmaEnv SubTotDTE*
//! │   └── DTE*      (each carrying its own signature)
//! └── Signature     (reference #SetDoc)
//! ```

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use sii_core::{DigestAlgorithm, ErrorKind, Rut, SiiError, TipoDte};
use sii_crypto::{Element, SignOptions, SignedXml, XmlDocument, XmlSigner};

use crate::dte::{document_identity, SII_DTE_NS};

/// `ID` of the signed `SetDTE`.
pub const SET_ID: &str = "SetDoc";

/// Authority RUT, the receiver of every envelope.
pub const SII_RUT: &str = "60803000-K";

/// Envelope cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caratula {
    /// Issuing company.
    pub rut_emisor: Rut,
    /// Person submitting; the certificate holder.
    pub rut_envia: Rut,
    /// Receiver of the envelope.
    pub rut_receptor: Rut,
    /// Date of the authorization resolution.
    pub fecha_resolucion: NaiveDate,
    /// Number of the authorization resolution; 0 in certification.
    pub numero_resolucion: u32,
    /// Signing timestamp.
    pub timestamp: NaiveDateTime,
}

impl Caratula {
    /// Cover for an envelope addressed to the authority.
    pub fn new(
        rut_emisor: Rut,
        rut_envia: Rut,
        fecha_resolucion: NaiveDate,
        numero_resolucion: u32,
        timestamp: NaiveDateTime,
    ) -> Result<Self, SiiError> {
        Ok(Self {
            rut_emisor,
            rut_envia,
            rut_receptor: Rut::parse(SII_RUT)?,
            fecha_resolucion,
            numero_resolucion,
            timestamp,
        })
    }

    fn to_element(&self, subtotals: &BTreeMap<TipoDte, u32>) -> Element {
        let mut caratula = Element::new("Caratula")
            .with_attr("version", "1.0")
            .with_text_child("RutEmisor", self.rut_emisor.to_string())
            .with_text_child("RutEnvia", self.rut_envia.to_string())
            .with_text_child("RutReceptor", self.rut_receptor.to_string())
            .with_text_child("FchResol", self.fecha_resolucion.format("%Y-%m-%d").to_string())
            .with_text_child("NroResol", self.numero_resolucion.to_string())
            .with_text_child(
                "TmstFirmaEnv",
                self.timestamp.format("%Y-%m-%dT%H:%M:%S").to_string(),
            );
        for (tipo, count) in subtotals {
            caratula.push_child(
                Element::new("SubTotDTE")
                    .with_text_child("TpoDTE", tipo.code().to_string())
                    .with_text_child("NroDTE", count.to_string()),
            );
        }
        caratula
    }
}

/// Build and sign an envelope around `documents`, each a signed `DTE`.
pub fn build_envio(
    caratula: &Caratula,
    documents: &[XmlDocument],
    signer: &dyn XmlSigner,
    algorithm: DigestAlgorithm,
) -> Result<SignedXml, SiiError> {
    if documents.is_empty() {
        return Err(SiiError::new(ErrorKind::DocumentoInvalido, "envelope needs at least one document"));
    }
    let mut subtotals: BTreeMap<TipoDte, u32> = BTreeMap::new();
    for document in documents {
        let (tipo, _) = document_identity(document.root())?;
        *subtotals.entry(tipo).or_default() += 1;
    }

    let mut set = Element::new("SetDTE")
        .with_attr("ID", SET_ID)
        .with_child(caratula.to_element(&subtotals));
    for document in documents {
        set.push_child(document.root().clone());
    }
    let envio = Element::new("EnvioDTE")
        .with_attr("xmlns", SII_DTE_NS)
        .with_attr("version", "1.0")
        .with_child(set);

    let signed = signer.sign_document(
        XmlDocument::new(envio),
        &SignOptions::new(algorithm).with_reference_id(SET_ID),
    )?;
    tracing::info!(
        rut_emisor = %caratula.rut_emisor,
        documents = documents.len(),
        "envelope signed"
    );
    Ok(signed)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dte::fixtures::{documento, timestamp};
    use crate::dte::DteBuilder;
    use sii_caf::testing::{CafSpec, TestAuthority};
    use sii_crypto::testing::{TestCertificate, TestCertificateSpec};
    use sii_crypto::{verify_document, verify_document_with, SignatureEngine, XmlEncoding};

    fn caratula() -> Caratula {
        Caratula::new(
            Rut::parse("76192083-9").unwrap(),
            Rut::parse("11111111-1").unwrap(),
            NaiveDate::from_ymd_opt(2014, 8, 22).unwrap(),
            0,
            timestamp(),
        )
        .unwrap()
    }

    #[test]
    fn envelope_counts_types_and_keeps_inner_signatures() {
        let generated = TestCertificate::generate(&TestCertificateSpec::default());
        let engine = SignatureEngine::new(Arc::new(generated.certificate()));
        let authority = TestAuthority::new(100);
        let facturas = authority.issue_caf(&CafSpec::new(TipoDte::FacturaElectronica, 1, 10));
        let notas = authority.issue_caf(&CafSpec::new(TipoDte::NotaCredito, 1, 10));

        let builder = DteBuilder::new(&engine, DigestAlgorithm::Sha1);
        let mut nota = documento(3);
        nota.id_doc.tipo = TipoDte::NotaCredito;
        let docs = vec![
            builder.build(&documento(1), &facturas, timestamp()).unwrap().document,
            builder.build(&documento(2), &facturas, timestamp()).unwrap().document,
            builder.build(&nota, &notas, timestamp()).unwrap().document,
        ];

        let signed = build_envio(&caratula(), &docs, &engine, DigestAlgorithm::Sha1).unwrap();
        let bytes = signed.to_bytes(XmlEncoding::Latin1);
        let reparsed = XmlDocument::parse(&bytes).unwrap();
        let verified = verify_document(&reparsed).unwrap();
        assert_eq!(verified.reference_uri, "#SetDoc");

        let set = reparsed.root().child("SetDTE").unwrap();
        let subtotals: Vec<_> = set
            .child("Caratula")
            .unwrap()
            .elements()
            .filter(|e| e.local_name() == "SubTotDTE")
            .map(|e| (e.child_text("TpoDTE").unwrap(), e.child_text("NroDTE").unwrap()))
            .collect();
        assert_eq!(
            subtotals,
            vec![("33".to_string(), "2".to_string()), ("61".to_string(), "1".to_string())]
        );

        // each embedded document still verifies on its own
        let public = generated.cert.public_key().unwrap();
        for dte in set.elements().filter(|e| e.local_name() == "DTE") {
            let standalone = XmlDocument::new(dte.clone());
            verify_document_with(&standalone, &public).unwrap();
        }
    }

    #[test]
    fn empty_envelope_is_refused() {
        let generated = TestCertificate::generate(&TestCertificateSpec::default());
        let engine = SignatureEngine::new(Arc::new(generated.certificate()));
        let err = build_envio(&caratula(), &[], &engine, DigestAlgorithm::Sha1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DocumentoInvalido);
    }
}
