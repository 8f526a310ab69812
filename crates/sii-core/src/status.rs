//! # Authority Status Vocabulary
//!
//! Maps the authority's status codes onto a fixed vocabulary with explicit
//! terminal flags, and carries the latest known state of a submission.
//!
//! ## Invariants
//!
//! - Accepted, rejected and errored states are terminal. Received,
//!   processing and unknown states are not.
//! - A rejected state always yields a [`SiiError`] carrying the authority
//!   code and glosa.
//! - [`SubmissionStatus::refine`] never moves a terminal status back to a
//!   non-terminal one.
//! - Absent or unrecognised codes map to [`EstadoSii::Desconocido`], which
//!   is neither an error nor terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::document::TipoDte;
use crate::error::{ErrorKind, SiiError};

/// Coarse grouping of status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCategory {
    /// The authority holds the submission but has not started processing.
    Received,
    /// Processing in progress.
    Processing,
    /// Accepted, possibly with objections.
    Accepted,
    /// Refused by the authority.
    Rejected,
    /// The authority failed to process it.
    Errored,
    /// Absent or unrecognised code.
    Unknown,
}

/// Status codes reported for submissions and documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EstadoSii {
    /// `REC`: envelope received.
    Recibido,
    /// `EPR`: envelope processed, results pending.
    EnProceso,
    /// `SOK`: schema and signature validated, accepted.
    Aceptado,
    /// `RPR`: accepted with objections.
    AceptadoConReparos,
    /// `RLV`: accepted with warnings.
    AceptadoConAdvertencias,
    /// `RCH`: rejected.
    Rechazado,
    /// `RSC`: rejected by schema.
    RechazadoSchema,
    /// `RFR`: rejected by signature.
    RechazadoFirma,
    /// `RCT`: rejected due to cover (`Caratula`) data.
    RechazadoCaratula,
    /// `ERR`: processing error.
    Error,
    /// `DOK`: document received and data matches.
    DocumentoOk,
    /// `DNK`: document received with discrepancies.
    DocumentoConDiscrepancias,
    /// `FAU`: document not received by the authority.
    DocumentoNoRecibido,
    /// `FAN`: document annulled.
    DocumentoAnulado,
    /// `FNA`: document not authorized.
    DocumentoNoAutorizado,
    /// Anything else, including a missing code.
    Desconocido,
}

impl EstadoSii {
    /// Map a raw authority code. Unrecognised codes become [`Self::Desconocido`].
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_uppercase().as_str() {
            "REC" => Self::Recibido,
            "EPR" => Self::EnProceso,
            "SOK" => Self::Aceptado,
            "RPR" => Self::AceptadoConReparos,
            "RLV" => Self::AceptadoConAdvertencias,
            "RCH" => Self::Rechazado,
            "RSC" => Self::RechazadoSchema,
            "RFR" => Self::RechazadoFirma,
            "RCT" => Self::RechazadoCaratula,
            "ERR" => Self::Error,
            "DOK" => Self::DocumentoOk,
            "DNK" => Self::DocumentoConDiscrepancias,
            "FAU" => Self::DocumentoNoRecibido,
            "FAN" => Self::DocumentoAnulado,
            "FNA" => Self::DocumentoNoAutorizado,
            _ => Self::Desconocido,
        }
    }

    /// Canonical code, `DESC` for unknown.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Recibido => "REC",
            Self::EnProceso => "EPR",
            Self::Aceptado => "SOK",
            Self::AceptadoConReparos => "RPR",
            Self::AceptadoConAdvertencias => "RLV",
            Self::Rechazado => "RCH",
            Self::RechazadoSchema => "RSC",
            Self::RechazadoFirma => "RFR",
            Self::RechazadoCaratula => "RCT",
            Self::Error => "ERR",
            Self::DocumentoOk => "DOK",
            Self::DocumentoConDiscrepancias => "DNK",
            Self::DocumentoNoRecibido => "FAU",
            Self::DocumentoAnulado => "FAN",
            Self::DocumentoNoAutorizado => "FNA",
            Self::Desconocido => "DESC",
        }
    }

    /// Coarse category.
    pub fn category(&self) -> StatusCategory {
        match self {
            Self::Recibido => StatusCategory::Received,
            Self::EnProceso => StatusCategory::Processing,
            Self::Aceptado
            | Self::AceptadoConReparos
            | Self::AceptadoConAdvertencias
            | Self::DocumentoOk
            | Self::DocumentoConDiscrepancias => StatusCategory::Accepted,
            Self::Rechazado
            | Self::RechazadoSchema
            | Self::RechazadoFirma
            | Self::RechazadoCaratula
            | Self::DocumentoAnulado
            | Self::DocumentoNoAutorizado => StatusCategory::Rejected,
            Self::Error | Self::DocumentoNoRecibido => StatusCategory::Errored,
            Self::Desconocido => StatusCategory::Unknown,
        }
    }

    /// Whether polling can stop.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.category(),
            StatusCategory::Accepted | StatusCategory::Rejected | StatusCategory::Errored
        )
    }

    /// Taxonomy entry used when this status is surfaced as an error.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::RechazadoSchema => Some(ErrorKind::Schema),
            Self::RechazadoFirma => Some(ErrorKind::Firma),
            Self::Rechazado
            | Self::RechazadoCaratula
            | Self::DocumentoAnulado
            | Self::DocumentoNoAutorizado => Some(ErrorKind::DocumentoInvalido),
            Self::DocumentoNoRecibido => Some(ErrorKind::DocumentoNoEncontrado),
            Self::Error => Some(ErrorKind::Procesamiento),
            _ => None,
        }
    }

    /// Typed error for rejected or errored states, `None` otherwise.
    pub fn to_error(&self, glosa: &str) -> Option<SiiError> {
        self.error_kind()
            .map(|kind| SiiError::rejected(kind, self.code(), glosa))
    }
}

impl std::fmt::Display for EstadoSii {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Result of mapping one raw status code.
#[derive(Debug)]
pub struct MappedStatus {
    /// Vocabulary entry.
    pub estado: EstadoSii,
    /// Whether polling can stop.
    pub terminal: bool,
    /// Rejection error for refused documents.
    pub error: Option<SiiError>,
}

/// Map a raw code and glosa onto the vocabulary.
pub fn map_status(code: &str, glosa: &str) -> MappedStatus {
    let estado = EstadoSii::from_code(code);
    MappedStatus {
        estado,
        terminal: estado.is_terminal(),
        error: estado.to_error(glosa),
    }
}

/// Per-document line of a status report. Absent fields are unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentStatus {
    /// Document type, when reported.
    pub tipo: Option<TipoDte>,
    /// Folio, when reported.
    pub folio: Option<u64>,
    /// Status of this document.
    pub estado: EstadoSii,
    /// Authority explanation, when reported.
    pub glosa: Option<String>,
}

/// Aggregate counters reported for an envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentCounts {
    /// Documents in the envelope.
    pub informados: Option<u32>,
    /// Documents accepted.
    pub aceptados: Option<u32>,
    /// Documents rejected.
    pub rechazados: Option<u32>,
    /// Documents accepted with objections.
    pub reparos: Option<u32>,
}

/// Latest known state of a submission or document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionStatus {
    /// Tracking id returned by the authority (empty for document lookups).
    pub track_id: String,
    /// Mapped status.
    pub estado: EstadoSii,
    /// Raw code as reported.
    pub code: String,
    /// Authority explanation.
    pub glosa: String,
    /// Whether polling can stop.
    pub terminal: bool,
    /// Per-document details.
    pub documents: Vec<DocumentStatus>,
    /// Aggregate counters.
    pub counts: DocumentCounts,
    /// When this status was observed.
    pub updated_at: DateTime<Utc>,
}

impl SubmissionStatus {
    /// Status built from a raw code.
    pub fn new(track_id: impl Into<String>, code: &str, glosa: impl Into<String>) -> Self {
        let estado = EstadoSii::from_code(code);
        Self {
            track_id: track_id.into(),
            estado,
            code: code.trim().to_string(),
            glosa: glosa.into(),
            terminal: estado.is_terminal(),
            documents: Vec::new(),
            counts: DocumentCounts::default(),
            updated_at: Utc::now(),
        }
    }

    /// Replace this status with `newer` unless this one is already terminal.
    pub fn refine(self, newer: SubmissionStatus) -> SubmissionStatus {
        if self.terminal && !newer.terminal {
            return self;
        }
        newer
    }

    /// Rejection error for refused submissions.
    pub fn error(&self) -> Option<SiiError> {
        self.estado.to_error(&self.glosa)
    }

    /// Accepted, possibly with objections.
    pub fn is_accepted(&self) -> bool {
        self.estado.category() == StatusCategory::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rch_is_terminal_rejection() {
        let mapped = map_status("RCH", "Folio fuera de rango");
        assert_eq!(mapped.estado, EstadoSii::Rechazado);
        assert!(mapped.terminal);
        let err = mapped.error.unwrap();
        assert_eq!(err.kind(), ErrorKind::DocumentoInvalido);
        let rejection = err.rejection().unwrap();
        assert_eq!(rejection.code, "RCH");
        assert_eq!(rejection.glosa, "Folio fuera de rango");
    }

    #[test]
    fn accepted_and_processing_codes_have_no_error() {
        let sok = map_status("SOK", "");
        assert!(sok.error.is_none());
        assert!(sok.terminal);

        let rpr = map_status("RPR", "");
        assert!(rpr.error.is_none());
        assert!(rpr.terminal);

        let epr = map_status("EPR", "");
        assert!(epr.error.is_none());
        assert!(!epr.terminal);
    }

    #[test]
    fn received_is_not_terminal() {
        assert!(!EstadoSii::Recibido.is_terminal());
    }

    #[test]
    fn missing_or_unknown_code_is_not_an_error() {
        for code in ["", "   ", "XYZ"] {
            let mapped = map_status(code, "");
            assert_eq!(mapped.estado, EstadoSii::Desconocido);
            assert!(!mapped.terminal);
            assert!(mapped.error.is_none());
        }
    }

    #[test]
    fn schema_and_signature_rejections_keep_their_kind() {
        assert_eq!(
            map_status("RSC", "").error.map(|e| e.kind()),
            Some(ErrorKind::Schema)
        );
        assert_eq!(
            map_status("RFR", "").error.map(|e| e.kind()),
            Some(ErrorKind::Firma)
        );
        assert_eq!(
            map_status("FAU", "").error.map(|e| e.kind()),
            Some(ErrorKind::DocumentoNoEncontrado)
        );
    }

    #[test]
    fn codes_are_case_insensitive() {
        assert_eq!(EstadoSii::from_code(" sok "), EstadoSii::Aceptado);
    }

    #[test]
    fn refine_never_regresses_from_terminal() {
        let accepted = SubmissionStatus::new("123", "SOK", "");
        let processing = SubmissionStatus::new("123", "EPR", "");
        let kept = accepted.clone().refine(processing);
        assert_eq!(kept.estado, EstadoSii::Aceptado);
        assert!(kept.terminal);
    }

    #[test]
    fn refine_advances_non_terminal() {
        let received = SubmissionStatus::new("123", "REC", "");
        let processing = SubmissionStatus::new("123", "EPR", "");
        let rejected = SubmissionStatus::new("123", "RCH", "Firma");
        let step = received.refine(processing);
        assert_eq!(step.estado, EstadoSii::EnProceso);
        let step = step.refine(rejected);
        assert_eq!(step.estado, EstadoSii::Rechazado);
        assert!(step.error().is_some());
    }
}
