//! # Document Submission Client
//!
//! Submits signed documents and tracks what the authority makes of them.
//!
//! - [`SubmissionClient::submit`]: validate, wrap in a signed `EnvioDTE`,
//!   upload, and record the acknowledgment as a `REC` status.
//! - [`SubmissionClient::poll_status`]: `getEstUp` for a tracking id. The
//!   remembered status is refined, never regressing from a terminal state.
//! - [`SubmissionClient::query_document`]: `getEstDte` for one document.
//!
//! Malformed input fails before a token is requested or the transport is
//! touched. A status the authority reports as rejected is returned as data;
//! [`SubmissionClient::await_final`] turns it into the rejection error.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use dashmap::DashMap;
use sii_core::status::{DocumentCounts, DocumentStatus};
use sii_core::{DigestAlgorithm, Endpoint, ErrorKind, Rut, SiiError, SubmissionStatus, TipoDte};
use sii_crypto::{XmlDocument, XmlEncoding, XmlSigner};

use crate::context::CallContext;
use crate::dte::document_identity;
use crate::envelope::{build_envio, Caratula};
use crate::schema::SchemaRules;
use crate::session::SessionManager;
use crate::soap::Respuesta;
use crate::transport::{SoapRequest, Transport, UploadRequest};

/// Who submits, and under which authorization resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    /// Issuing company.
    pub rut_empresa: Rut,
    /// Certificate holder submitting on its behalf.
    pub rut_envia: Rut,
    /// Resolution date.
    pub fecha_resolucion: NaiveDate,
    /// Resolution number.
    pub numero_resolucion: u32,
}

/// Targeted lookup of one issued document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentQuery {
    /// Document type.
    pub tipo: TipoDte,
    /// Folio.
    pub folio: u64,
    /// Issuer.
    pub rut_emisor: Rut,
    /// Receiver.
    pub rut_receptor: Rut,
    /// Issue date.
    pub fecha_emision: NaiveDate,
    /// Document total.
    pub monto_total: u64,
}

impl DocumentQuery {
    fn validate(&self) -> Result<(), SiiError> {
        if self.folio == 0 {
            return Err(SiiError::new(ErrorKind::FolioInvalido, "folio must be positive"));
        }
        Ok(())
    }
}

fn validate_track_id(track_id: &str) -> Result<(), SiiError> {
    if track_id.is_empty() || !track_id.chars().all(|c| c.is_ascii_digit()) {
        return Err(SiiError::new(
            ErrorKind::DocumentoInvalido,
            format!("tracking id {track_id:?} is not numeric"),
        ));
    }
    Ok(())
}

/// Default number of tracking ids remembered per client.
pub const TRACKING_CAPACITY: usize = 1024;

/// Latest status per tracking id. Merges are atomic per id and never regress
/// a terminal status. Past capacity, terminal entries are dropped first, then
/// the least recently updated.
#[derive(Debug)]
struct Tracker {
    statuses: DashMap<String, SubmissionStatus>,
    capacity: usize,
}

impl Tracker {
    fn new(capacity: usize) -> Self {
        Self {
            statuses: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, track_id: &str) -> Option<SubmissionStatus> {
        self.statuses.get(track_id).map(|s| s.clone())
    }

    fn len(&self) -> usize {
        self.statuses.len()
    }

    fn remove(&self, track_id: &str) -> Option<SubmissionStatus> {
        self.statuses.remove(track_id).map(|(_, s)| s)
    }

    /// Merge `status` into the stored one and return the result.
    fn record(&self, status: SubmissionStatus) -> SubmissionStatus {
        if !self.statuses.contains_key(&status.track_id) {
            self.make_room();
        }
        let entry = self
            .statuses
            .entry(status.track_id.clone())
            .and_modify(|previous| {
                let merged = previous.clone().refine(status.clone());
                *previous = merged;
            })
            .or_insert_with(|| status.clone());
        entry.value().clone()
    }

    fn make_room(&self) {
        if self.statuses.len() < self.capacity {
            return;
        }
        self.statuses.retain(|_, s| !s.terminal);
        while self.statuses.len() >= self.capacity {
            let oldest = self
                .statuses
                .iter()
                .min_by_key(|s| s.updated_at)
                .map(|s| s.key().clone());
            match oldest {
                Some(track_id) => {
                    self.statuses.remove(&track_id);
                    tracing::debug!(%track_id, "dropped oldest tracked submission");
                }
                None => break,
            }
        }
    }
}

/// Submit, poll and query against the authority.
pub struct SubmissionClient {
    transport: Arc<dyn Transport>,
    session: Arc<SessionManager>,
    signer: Arc<dyn XmlSigner>,
    sender: Sender,
    algorithm: DigestAlgorithm,
    schema: SchemaRules,
    tracked: Tracker,
}

impl std::fmt::Debug for SubmissionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionClient")
            .field("sender", &self.sender)
            .field("algorithm", &self.algorithm)
            .field("tracked", &self.tracked.len())
            .finish_non_exhaustive()
    }
}

impl SubmissionClient {
    /// Client submitting as `sender`, signing envelopes with SHA-1 and
    /// checking the built-in structural rules.
    pub fn new(
        transport: Arc<dyn Transport>,
        session: Arc<SessionManager>,
        signer: Arc<dyn XmlSigner>,
        sender: Sender,
    ) -> Self {
        Self {
            transport,
            session,
            signer,
            sender,
            algorithm: DigestAlgorithm::Sha1,
            schema: SchemaRules::builtin(),
            tracked: Tracker::new(TRACKING_CAPACITY),
        }
    }

    /// Envelope signature algorithm.
    pub fn with_algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Structural rules checked before submission.
    pub fn with_schema(mut self, schema: SchemaRules) -> Self {
        self.schema = schema;
        self
    }

    /// The session manager.
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// How many tracking ids to remember.
    pub fn with_tracking_capacity(mut self, capacity: usize) -> Self {
        self.tracked = Tracker::new(capacity);
        self
    }

    /// Last known status of a submission made or polled by this client.
    pub fn tracked(&self, track_id: &str) -> Option<SubmissionStatus> {
        self.tracked.get(track_id)
    }

    /// Stop tracking a submission, returning its last known status.
    pub fn forget(&self, track_id: &str) -> Option<SubmissionStatus> {
        self.tracked.remove(track_id)
    }

    /// Check `documents` and wrap them in a signed envelope.
    pub fn prepare(&self, documents: &[XmlDocument], timestamp: NaiveDateTime) -> Result<XmlDocument, SiiError> {
        if documents.is_empty() {
            return Err(SiiError::new(ErrorKind::DocumentoInvalido, "nothing to submit"));
        }
        for document in documents {
            let root = document.root();
            let (tipo, folio) = document_identity(root)?;
            self.schema.validate(root)?;
            let emisor = root
                .path_text(&["Documento", "Encabezado", "Emisor", "RUTEmisor"])
                .unwrap_or_default();
            if Rut::parse(&emisor).ok().as_ref() != Some(&self.sender.rut_empresa) {
                return Err(SiiError::new(
                    ErrorKind::DocumentoInvalido,
                    format!(
                        "document {}/{folio} is issued by {emisor:?}, not {}",
                        tipo.code(),
                        self.sender.rut_empresa
                    ),
                ));
            }
        }
        let caratula = Caratula::new(
            self.sender.rut_empresa.clone(),
            self.sender.rut_envia.clone(),
            self.sender.fecha_resolucion,
            self.sender.numero_resolucion,
            timestamp,
        )?;
        let signed = build_envio(&caratula, documents, self.signer.as_ref(), self.algorithm)?;
        self.schema.validate(signed.document.root())?;
        Ok(signed.document)
    }

    /// Submit signed documents in one envelope.
    pub async fn submit(&self, ctx: &CallContext, documents: &[XmlDocument]) -> Result<SubmissionStatus, SiiError> {
        let timestamp = chrono::Local::now().naive_local();
        let envelope = self.prepare(documents, timestamp)?;
        let file_name = format!(
            "EnvioDTE_{}_{}.xml",
            self.sender.rut_empresa.body(),
            timestamp.format("%Y%m%d%H%M%S")
        );
        self.submit_envelope(ctx, &envelope, file_name).await
    }

    /// Upload an already signed `EnvioDTE`.
    pub async fn submit_envelope(
        &self,
        ctx: &CallContext,
        envelope: &XmlDocument,
        file_name: String,
    ) -> Result<SubmissionStatus, SiiError> {
        if envelope.root().local_name() != "EnvioDTE" {
            return Err(SiiError::new(
                ErrorKind::DocumentoInvalido,
                format!("expected EnvioDTE, got {}", envelope.root().name()),
            ));
        }
        self.schema.validate(envelope.root())?;

        let authorized = self.session.authorize(ctx).await?;
        let request = UploadRequest {
            rut_sender: self.sender.rut_envia.clone(),
            rut_company: self.sender.rut_empresa.clone(),
            file_name,
            content: envelope.to_bytes(XmlEncoding::Latin1),
        };
        let ack = self.transport.upload(&authorized, &request).await;
        let ack = self.forget_token_on_auth_failure(ack).await?;
        if let Some(err) = ack.error() {
            return self.forget_token_on_auth_failure(Err(err)).await;
        }
        let track_id = ack.track_id.clone().ok_or_else(|| {
            SiiError::new(ErrorKind::Procesamiento, "upload accepted without a tracking id")
        })?;
        validate_track_id(&track_id)?;

        let status = SubmissionStatus::new(track_id.clone(), "REC", "envelope received");
        let status = self.tracked.record(status);
        tracing::info!(%track_id, file = %request.file_name, "submission accepted for processing");
        Ok(status)
    }

    /// Current status of a submission.
    pub async fn poll_status(&self, ctx: &CallContext, track_id: &str) -> Result<SubmissionStatus, SiiError> {
        validate_track_id(track_id)?;
        let authorized = self.session.authorize(ctx).await?;
        let token = authorized.token().unwrap_or_default().to_string();
        let request = SoapRequest::new(Endpoint::UploadStatus)
            .param("RutCompania", self.sender.rut_empresa.body())
            .param("DvCompania", self.sender.rut_empresa.dv())
            .param("TrackId", track_id)
            .param("Token", token);
        let reply = self.transport.call(&authorized, &request).await;
        let reply = self.forget_token_on_auth_failure(reply).await?;
        let respuesta = Respuesta::parse(&reply)?;
        let estado = checked_estado(&respuesta)?;

        let mut status = SubmissionStatus::new(track_id, &estado, respuesta.glosa().unwrap_or_default());
        status.counts = DocumentCounts {
            informados: respuesta.body_number("INFORMADOS"),
            aceptados: respuesta.body_number("ACEPTADOS"),
            rechazados: respuesta.body_number("RECHAZADOS"),
            reparos: respuesta.body_number("REPAROS"),
        };
        if let Some(atencion) = respuesta.header_text("NUM_ATENCION") {
            tracing::debug!(%track_id, %atencion, "status query served");
        }

        let refined = self.tracked.record(status);
        tracing::info!(
            %track_id,
            estado = %refined.estado,
            terminal = refined.terminal,
            "submission status"
        );
        Ok(refined)
    }

    /// Status of one issued document.
    pub async fn query_document(&self, ctx: &CallContext, query: &DocumentQuery) -> Result<SubmissionStatus, SiiError> {
        query.validate()?;
        let authorized = self.session.authorize(ctx).await?;
        let token = authorized.token().unwrap_or_default().to_string();
        let consultante = self.session.rut().clone();
        let request = SoapRequest::new(Endpoint::DocumentStatus)
            .param("RutConsultante", consultante.body())
            .param("DvConsultante", consultante.dv())
            .param("RutCompania", query.rut_emisor.body())
            .param("DvCompania", query.rut_emisor.dv())
            .param("RutReceptor", query.rut_receptor.body())
            .param("DvReceptor", query.rut_receptor.dv())
            .param("TipoDte", query.tipo.code())
            .param("FolioDte", query.folio)
            .param("FechaEmisionDte", query.fecha_emision.format("%d%m%Y"))
            .param("MontoDte", query.monto_total)
            .param("token", token);
        let reply = self.transport.call(&authorized, &request).await;
        let reply = self.forget_token_on_auth_failure(reply).await?;
        let respuesta = Respuesta::parse(&reply)?;
        let estado = checked_estado(&respuesta)?;
        let glosa = respuesta.glosa().unwrap_or_default();

        let mut status = SubmissionStatus::new(String::new(), &estado, glosa.clone());
        status.documents.push(DocumentStatus {
            tipo: Some(query.tipo),
            folio: Some(query.folio),
            estado: status.estado,
            glosa: Some(glosa).filter(|g| !g.is_empty()),
        });
        tracing::info!(
            tipo = query.tipo.code(),
            folio = query.folio,
            estado = %status.estado,
            "document status"
        );
        Ok(status)
    }

    /// Poll every `interval` until the status is terminal. Rejections come
    /// back as their typed error.
    pub async fn await_final(
        &self,
        ctx: &CallContext,
        track_id: &str,
        interval: Duration,
    ) -> Result<SubmissionStatus, SiiError> {
        loop {
            let status = self.poll_status(ctx, track_id).await?;
            if status.terminal {
                return match status.error() {
                    Some(err) => Err(err),
                    None => Ok(status),
                };
            }
            tokio::select! {
                biased;
                err = ctx.done() => return Err(err),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn forget_token_on_auth_failure<T>(&self, result: Result<T, SiiError>) -> Result<T, SiiError> {
        if let Err(err) = &result {
            if err.kind() == ErrorKind::AuthInvalid {
                if let Err(cache_err) = self.session.invalidate().await {
                    tracing::warn!(error = %cache_err, "could not drop refused token");
                }
            }
        }
        result
    }
}

/// `ESTADO` of a status reply; negative values are errors of the query itself.
fn checked_estado(respuesta: &Respuesta) -> Result<String, SiiError> {
    let estado = respuesta.estado();
    if estado.starts_with('-') {
        let glosa = respuesta.glosa().unwrap_or_else(|| "query refused".to_string());
        return Err(SiiError::rejected(ErrorKind::Procesamiento, estado, glosa));
    }
    Ok(estado)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_ids_are_numeric() {
        validate_track_id("0123456789").unwrap();
        assert_eq!(validate_track_id("").unwrap_err().kind(), ErrorKind::DocumentoInvalido);
        assert_eq!(validate_track_id("12a").unwrap_err().kind(), ErrorKind::DocumentoInvalido);
    }

    #[test]
    fn negative_estado_is_error() {
        let r = Respuesta::parse("<RESPUESTA><RESP_HDR><ESTADO>-7</ESTADO><GLOSA>Error interno</GLOSA></RESP_HDR></RESPUESTA>").unwrap();
        let err = checked_estado(&r).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Procesamiento);
        assert_eq!(err.rejection().unwrap().code, "-7");


        let r = Respuesta::parse("<RESPUESTA><RESP_HDR><ESTADO>EPR</ESTADO></RESP_HDR></RESPUESTA>").unwrap();
        assert_eq!(checked_estado(&r).unwrap(), "EPR");
    }

    fn status(track_id: &str, code: &str) -> SubmissionStatus {
        SubmissionStatus::new(track_id, code, "")
    }

    #[test]
    fn tracker_never_regresses_terminal_status() {
        let tracker = Tracker::new(8);
        tracker.record(status("1", "REC"));
        assert_eq!(tracker.record(status("1", "SOK")).code, "SOK");
        let after = tracker.record(status("1", "EPR"));
        assert_eq!(after.code, "SOK");
        assert!(after.terminal);
    }

    #[test]
    fn concurrent_polls_keep_the_terminal_status() {
        for _ in 0..50 {
            let tracker = std::sync::Arc::new(Tracker::new(8));
            tracker.record(status("77", "REC"));
            let handles: Vec<_> = ["SOK", "EPR", "EPR", "EPR"]
                .into_iter()
                .map(|code| {
                    let tracker = tracker.clone();
                    std::thread::spawn(move || {
                        tracker.record(status("77", code));
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            let stored = tracker.get("77").unwrap();
            assert_eq!(stored.code, "SOK");
            assert!(stored.terminal);
        }
    }

    #[test]
    fn tracker_drops_terminal_entries_first() {
        let tracker = Tracker::new(3);
        tracker.record(status("1", "SOK"));
        tracker.record(status("2", "EPR"));
        tracker.record(status("3", "RCH"));
        tracker.record(status("4", "REC"));
        assert_eq!(tracker.len(), 2);
        assert!(tracker.get("1").is_none());
        assert!(tracker.get("3").is_none());
        assert!(tracker.get("2").is_some());
        assert!(tracker.get("4").is_some());
    }

    #[test]
    fn tracker_stays_bounded_without_terminal_entries() {
        let tracker = Tracker::new(2);
        for id in 1..=5 {
            tracker.record(status(&id.to_string(), "EPR"));
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(tracker.len(), 2);
        assert!(tracker.get("5").is_some());
        assert!(tracker.get("4").is_some());
        assert!(tracker.get("1").is_none());
    }

    #[test]
    fn zero_folio_query_is_refused() {
        let query = DocumentQuery {
            tipo: TipoDte::FacturaElectronica,
            folio: 0,
            rut_emisor: Rut::parse("76192083-9").unwrap(),
            rut_receptor: Rut::parse("60803000-K").unwrap(),
            fecha_emision: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            monto_total: 1,
        };
        assert_eq!(query.validate().unwrap_err().kind(), ErrorKind::FolioInvalido);
    }
}
