//! # CAF Manager
//!
//! Registration, lookup, consumption and expiry of folio authorizations
//! over any [`CafRepository`]. Folio reservation is serialized per manager
//! so two callers never receive the same folio.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sii_core::{ErrorKind, Rut, SiiError, TipoDte};

use crate::alerts::{AlertKind, AlertSink, FolioAlert};
use crate::model::{Caf, CafState, Vigencia};
use crate::parse::parse_caf;
use crate::store::CafRepository;
use crate::validate::CafValidator;

/// Available-folio count under which low-stock alerts fire.
pub const DEFAULT_LOW_STOCK_THRESHOLD: u64 = 1000;

/// Days ahead of expiry at which an authorization counts as expiring.
pub const DEFAULT_EXPIRY_WARNING_DAYS: u32 = 15;

/// Validity and usage of one authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CafVigencia {
    /// Authorization id.
    pub caf_id: String,
    /// Document type.
    pub tipo: TipoDte,
    /// Issuer.
    pub rut_emisor: Rut,
    /// Validity classification.
    pub vigencia: Vigencia,
    /// Whole days until expiry; negative once expired.
    pub dias_restantes: i64,
    /// Folios still available.
    pub folios_disponibles: u64,
    /// Folios consumed.
    pub folios_utilizados: u64,
    /// End of validity.
    pub fecha_vencimiento: DateTime<Utc>,
}

impl CafVigencia {
    fn of(caf: &Caf, now: DateTime<Utc>, warning_days: u32) -> Self {
        Self {
            caf_id: caf.id.clone(),
            tipo: caf.tipo,
            rut_emisor: caf.rut_emisor.clone(),
            vigencia: caf.vigencia_at(now, warning_days),
            dias_restantes: caf.days_left_at(now),
            folios_disponibles: caf.available_folios(),
            folios_utilizados: caf.used_folios(),
            fecha_vencimiento: caf.fecha_vencimiento,
        }
    }
}

/// Folio stock for one document type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    /// Document type.
    pub tipo: TipoDte,
    /// Sum of available folios over current authorizations.
    pub available: u64,
    /// Number of current, active authorizations.
    pub active_cafs: usize,
    /// Whether `available` is under the threshold.
    pub low_stock: bool,
    /// When the figures were computed.
    pub checked_at: DateTime<Utc>,
}

/// A folio handed out by [`CafManager::next_folio`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolioReservation {
    /// Authorization the folio belongs to.
    pub caf_id: String,
    /// Document type.
    pub tipo: TipoDte,
    /// The folio.
    pub folio: u64,
    /// Folios left for this type and issuer afterwards.
    pub remaining: u64,
}

/// Folio authorization lifecycle over a pluggable repository.
#[derive(Debug)]
pub struct CafManager {
    repository: Arc<dyn CafRepository>,
    validator: CafValidator,
    alerts: Arc<dyn AlertSink>,
    low_stock_threshold: u64,
    expiry_warning_days: u32,
    consumption: tokio::sync::Mutex<()>,
}

impl CafManager {
    /// Manager with the default low-stock threshold.
    pub fn new(
        repository: Arc<dyn CafRepository>,
        validator: CafValidator,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            repository,
            validator,
            alerts,
            low_stock_threshold: DEFAULT_LOW_STOCK_THRESHOLD,
            expiry_warning_days: DEFAULT_EXPIRY_WARNING_DAYS,
            consumption: tokio::sync::Mutex::new(()),
        }
    }

    /// Override the low-stock threshold.
    pub fn with_low_stock_threshold(mut self, threshold: u64) -> Self {
        self.low_stock_threshold = threshold;
        self
    }

    /// The configured threshold.
    pub fn low_stock_threshold(&self) -> u64 {
        self.low_stock_threshold
    }

    /// Override how many days ahead of expiry alerts start.
    pub fn with_expiry_warning_days(mut self, days: u32) -> Self {
        self.expiry_warning_days = days;
        self
    }

    /// The configured warning window in days.
    pub fn expiry_warning_days(&self) -> u32 {
        self.expiry_warning_days
    }

    /// Expiry, range and authority-signature checks.
    pub fn validate(&self, caf: &Caf) -> Result<(), SiiError> {
        self.validator.validate(caf)
    }

    /// Validate and persist a new authorization. Ranges overlapping a stored
    /// one for the same issuer and type are refused.
    pub async fn register(&self, caf: Caf) -> Result<Caf, SiiError> {
        self.validate(&caf)?;
        let existing = self.repository.list_by_type(caf.tipo).await?;
        if let Some(clash) = existing.iter().find(|c| c.overlaps(&caf)) {
            return Err(SiiError::new(
                ErrorKind::DocumentoDuplicado,
                format!(
                    "folio range {}..={} overlaps CAF {}",
                    caf.folio_inicial, caf.folio_final, clash.id
                ),
            ));
        }
        self.repository.save(&caf).await?;
        tracing::info!(
            id = %caf.id,
            tipo = caf.tipo.code(),
            rut = %caf.rut_emisor,
            desde = caf.folio_inicial,
            hasta = caf.folio_final,
            "registered CAF"
        );
        Ok(caf)
    }

    /// Parse, validate and register an authorization document.
    pub async fn import_xml(&self, xml: &[u8]) -> Result<Caf, SiiError> {
        self.register(parse_caf(xml)?).await
    }

    /// Stored authorization by id.
    pub async fn get(&self, id: &str) -> Result<Option<Caf>, SiiError> {
        Ok(self.repository.get(id).await?)
    }

    /// Every stored authorization of one type.
    pub async fn list(&self, tipo: TipoDte) -> Result<Vec<Caf>, SiiError> {
        Ok(self.repository.list_by_type(tipo).await?)
    }

    /// Remove an authorization.
    pub async fn remove(&self, id: &str) -> Result<bool, SiiError> {
        Ok(self.repository.delete(id).await?)
    }

    /// First current authorization of `tipo` whose range holds `folio`.
    /// Expired authorizations met on the way are transitioned to `VENCIDO`.
    pub async fn caf_for_folio(&self, tipo: TipoDte, folio: u64) -> Result<Caf, SiiError> {
        if folio == 0 {
            return Err(SiiError::new(ErrorKind::FolioInvalido, "folio must be positive"));
        }
        let now = Utc::now();
        for caf in self.repository.list_by_type(tipo).await? {
            if caf.estado == CafState::Vencido {
                continue;
            }
            if !caf.is_current_at(now) {
                self.mark_expired(&caf).await?;
                continue;
            }
            if caf.contains_folio(folio) {
                self.validator.validate_at(&caf, now)?;
                self.check_expiry(&caf, now);
                if caf.available_folios() < self.low_stock_threshold {
                    self.alert(
                        FolioAlert::new(
                            AlertKind::LowStock,
                            tipo,
                            caf.rut_emisor.clone(),
                            caf.available_folios(),
                            self.low_stock_threshold,
                        )
                        .for_caf(&caf.id),
                    );
                }
                return Ok(caf);
            }
        }
        Err(SiiError::new(
            ErrorKind::DocumentoNoEncontrado,
            format!("no current CAF for document type {} holds folio {folio}", tipo.code()),
        ))
    }

    /// Reserve the next folio of `tipo` for `rut`, persisting the consumption.
    pub async fn next_folio(&self, tipo: TipoDte, rut: &Rut) -> Result<FolioReservation, SiiError> {
        let _guard = self.consumption.lock().await;
        let now = Utc::now();
        let usable = self.usable(tipo, Some(rut), now).await?;

        let Some(mut caf) = usable.first().cloned() else {
            return Err(SiiError::new(
                ErrorKind::FolioInvalido,
                format!("no folios available for document type {} and {rut}", tipo.code()),
            ));
        };
        let folio = caf.next_folio().ok_or_else(|| {
            SiiError::new(ErrorKind::FolioInvalido, format!("CAF {} is exhausted", caf.id))
        })?;
        self.consume(&mut caf, folio).await?;

        let remaining = usable
            .iter()
            .skip(1)
            .map(Caf::available_folios)
            .sum::<u64>()
            + caf.available_folios();
        self.check_stock(tipo, rut, remaining);
        tracing::debug!(tipo = tipo.code(), folio, remaining, caf_id = %caf.id, "reserved folio");
        Ok(FolioReservation {
            caf_id: caf.id,
            tipo,
            folio,
            remaining,
        })
    }

    /// Record use of a specific folio chosen by the caller. Folios at or
    /// below the last consumed one are refused.
    pub async fn record_folio(&self, tipo: TipoDte, folio: u64) -> Result<Caf, SiiError> {
        let _guard = self.consumption.lock().await;
        let mut caf = self.caf_for_folio(tipo, folio).await?;
        if caf.estado != CafState::Activo || folio <= caf.folio_ultimo {
            return Err(SiiError::new(
                ErrorKind::DocumentoDuplicado,
                format!("folio {folio} of document type {} was already used", tipo.code()),
            ));
        }
        self.consume(&mut caf, folio).await?;
        let rut = caf.rut_emisor.clone();
        let remaining = self
            .usable(tipo, Some(&rut), Utc::now())
            .await?
            .iter()
            .map(Caf::available_folios)
            .sum();
        self.check_stock(tipo, &rut, remaining);
        Ok(caf)
    }

    /// Folio stock for `tipo` across current, active authorizations.
    pub async fn availability(&self, tipo: TipoDte) -> Result<Availability, SiiError> {
        let now = Utc::now();
        let usable = self.usable(tipo, None, now).await?;
        let available = usable.iter().map(Caf::available_folios).sum();
        Ok(Availability {
            tipo,
            available,
            active_cafs: usable.len(),
            low_stock: available < self.low_stock_threshold,
            checked_at: now,
        })
    }

    /// Transition every expired, still-active authorization of `tipo` to
    /// `VENCIDO` and warn about those inside the expiry window. Returns the
    /// ids moved.
    pub async fn expire_stale(&self, tipo: TipoDte) -> Result<Vec<String>, SiiError> {
        let now = Utc::now();
        let mut expired = Vec::new();
        for caf in self.repository.list_by_type(tipo).await? {
            if caf.estado != CafState::Activo {
                continue;
            }
            if !caf.is_current_at(now) {
                self.mark_expired(&caf).await?;
                expired.push(caf.id);
            } else {
                self.check_expiry(&caf, now);
            }
        }
        Ok(expired)
    }

    /// Validity and usage of one stored authorization.
    pub async fn vigencia(&self, id: &str) -> Result<CafVigencia, SiiError> {
        let caf = self.repository.get(id).await?.ok_or_else(|| {
            SiiError::new(ErrorKind::DocumentoNoEncontrado, format!("no CAF with id {id}"))
        })?;
        Ok(CafVigencia::of(&caf, Utc::now(), self.expiry_warning_days))
    }

    /// Validity and usage of every stored authorization of `tipo`.
    pub async fn vigencia_report(&self, tipo: TipoDte) -> Result<Vec<CafVigencia>, SiiError> {
        let now = Utc::now();
        Ok(self
            .repository
            .list_by_type(tipo)
            .await?
            .iter()
            .map(|caf| CafVigencia::of(caf, now, self.expiry_warning_days))
            .collect())
    }

    // ── internals ─────────────────────────────────────────────────────

    async fn usable(
        &self,
        tipo: TipoDte,
        rut: Option<&Rut>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Caf>, SiiError> {
        let mut usable = Vec::new();
        for caf in self.repository.list_by_type(tipo).await? {
            if rut.is_some_and(|r| r != &caf.rut_emisor) {
                continue;
            }
            if caf.estado == CafState::Activo && !caf.is_current_at(now) {
                self.mark_expired(&caf).await?;
                continue;
            }
            if caf.is_usable_at(now) {
                usable.push(caf);
            }
        }
        Ok(usable)
    }

    async fn consume(&self, caf: &mut Caf, folio: u64) -> Result<(), SiiError> {
        caf.folio_ultimo = folio;
        caf.updated_at = Utc::now();
        if !caf.has_available_folios() {
            caf.estado = CafState::Agotado;
        }
        self.repository.save(caf).await?;
        if caf.estado == CafState::Agotado {
            tracing::info!(id = %caf.id, "CAF exhausted");
            self.alert(
                FolioAlert::new(
                    AlertKind::Exhausted,
                    caf.tipo,
                    caf.rut_emisor.clone(),
                    0,
                    self.low_stock_threshold,
                )
                .for_caf(&caf.id),
            );
        }
        Ok(())
    }

    async fn mark_expired(&self, caf: &Caf) -> Result<(), SiiError> {
        self.repository.update_state(&caf.id, CafState::Vencido).await?;
        tracing::info!(id = %caf.id, vencimiento = %caf.fecha_vencimiento, "CAF expired");
        self.alert(
            FolioAlert::new(
                AlertKind::Expired,
                caf.tipo,
                caf.rut_emisor.clone(),
                caf.available_folios(),
                self.low_stock_threshold,
            )
            .for_caf(&caf.id),
        );
        Ok(())
    }

    fn check_expiry(&self, caf: &Caf, now: DateTime<Utc>) {
        if caf.vigencia_at(now, self.expiry_warning_days) != Vigencia::ProximoExpirar {
            return;
        }
        let dias = caf.days_left_at(now);
        self.alert(
            FolioAlert::new(
                AlertKind::ExpiringSoon,
                caf.tipo,
                caf.rut_emisor.clone(),
                caf.available_folios(),
                self.low_stock_threshold,
            )
            .for_caf(&caf.id)
            .with_message(format!(
                "CAF {} for document type {} expires in {dias} days ({} folios left)",
                caf.id,
                caf.tipo.code(),
                caf.available_folios()
            )),
        );
    }

    fn check_stock(&self, tipo: TipoDte, rut: &Rut, remaining: u64) {
        if remaining < self.low_stock_threshold {
            self.alert(FolioAlert::new(
                AlertKind::LowStock,
                tipo,
                rut.clone(),
                remaining,
                self.low_stock_threshold,
            ));
        }
    }

    fn alert(&self, alert: FolioAlert) {
        self.alerts.notify(alert);
    }
}
