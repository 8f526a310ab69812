//! # Folio Authorization Model
//!
//! A [`Caf`] is an authority-issued block of folios `[folio_inicial,
//! folio_final]` for one document type and issuer. The range never changes
//! after issuance; only `folio_ultimo` (consumption) and `estado` (expiry or
//! exhaustion) move.

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sii_core::{Rut, TipoDte};

/// Months an authorization stays usable after its issue date.
pub const VALIDITY_MONTHS: u32 = 6;

/// Lifecycle state of a [`Caf`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CafState {
    /// Usable.
    #[serde(rename = "ACTIVO")]
    Activo,
    /// Past its expiry date.
    #[serde(rename = "VENCIDO")]
    Vencido,
    /// Every folio consumed.
    #[serde(rename = "AGOTADO")]
    Agotado,
}

impl CafState {
    /// Wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Activo => "ACTIVO",
            Self::Vencido => "VENCIDO",
            Self::Agotado => "AGOTADO",
        }
    }
}

impl std::fmt::Display for CafState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validity of a [`Caf`] relative to its expiry date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vigencia {
    /// Current and outside the warning window.
    #[serde(rename = "VIGENTE")]
    Vigente,
    /// Current, but expiring within the warning window.
    #[serde(rename = "PROXIMO_EXPIRAR")]
    ProximoExpirar,
    /// Past its expiry date.
    #[serde(rename = "EXPIRADO")]
    Expirado,
}

/// An authority-issued folio range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caf {
    /// Stable id derived from issuer, type and range.
    pub id: String,
    /// Document type the folios are valid for.
    pub tipo: TipoDte,
    /// Issuer.
    pub rut_emisor: Rut,
    /// Issuer legal name.
    pub razon_social: String,
    /// First folio of the range.
    pub folio_inicial: u64,
    /// Last folio of the range.
    pub folio_final: u64,
    /// Last consumed folio, 0 when none has been used.
    pub folio_ultimo: u64,
    /// Authorization date (`FA`).
    pub fecha_autorizacion: NaiveDate,
    /// End of validity.
    pub fecha_vencimiento: DateTime<Utc>,
    /// Authority key id (`IDK`) that signed the authorization.
    pub idk: u32,
    /// Lifecycle state.
    pub estado: CafState,
    /// Raw authorization XML as received.
    #[serde(with = "base64_bytes")]
    pub xml: Vec<u8>,
    /// Raw authority signature (`FRMA`).
    #[serde(with = "base64_bytes")]
    pub firma_sii: Vec<u8>,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Last state or consumption change.
    pub updated_at: DateTime<Utc>,
}

impl Caf {
    /// Id for a range: `<rut>-<tipo>-<desde>-<hasta>`.
    pub fn make_id(rut: &Rut, tipo: TipoDte, desde: u64, hasta: u64) -> String {
        format!("{}-{}-{}-{}", rut, tipo.code(), desde, hasta)
    }

    /// Expiry for an authorization issued on `fecha`. A day past the end of
    /// the target month rolls over into the next one (Aug 31 gives Mar 3).
    pub fn expiry_for(fecha: NaiveDate) -> DateTime<Utc> {
        let end = fecha
            .with_day(1)
            .and_then(|first| first.checked_add_months(Months::new(VALIDITY_MONTHS)))
            .and_then(|first| first.checked_add_days(Days::new(u64::from(fecha.day0()))))
            .unwrap_or(NaiveDate::MAX);
        end.and_time(chrono::NaiveTime::MIN).and_utc()
    }

    /// Number of folios in the range.
    pub fn range_size(&self) -> u64 {
        (self.folio_final + 1).saturating_sub(self.folio_inicial)
    }

    /// Folios consumed so far.
    pub fn used_folios(&self) -> u64 {
        self.range_size().saturating_sub(self.available_folios())
    }

    /// Whole days from `now` to expiry, truncated; negative once expired.
    pub fn days_left_at(&self, now: DateTime<Utc>) -> i64 {
        (self.fecha_vencimiento - now).num_days()
    }

    /// Validity at `now`, warning `warning_days` days ahead of expiry.
    pub fn vigencia_at(&self, now: DateTime<Utc>, warning_days: u32) -> Vigencia {
        if self.estado == CafState::Vencido || !self.is_current_at(now) {
            Vigencia::Expirado
        } else if self.days_left_at(now) <= i64::from(warning_days) {
            Vigencia::ProximoExpirar
        } else {
            Vigencia::Vigente
        }
    }

    /// Folios not yet consumed. Never negative.
    pub fn available_folios(&self) -> u64 {
        let consumed_up_to = self.folio_ultimo.max(self.folio_inicial.saturating_sub(1));
        self.folio_final.saturating_sub(consumed_up_to)
    }

    /// Whether any folio is left.
    pub fn has_available_folios(&self) -> bool {
        self.available_folios() > 0
    }

    /// Whether `folio` lies inside the authorized range.
    pub fn contains_folio(&self, folio: u64) -> bool {
        self.folio_inicial <= folio && folio <= self.folio_final
    }

    /// Whether the authorization is still current.
    pub fn is_current(&self) -> bool {
        self.is_current_at(Utc::now())
    }

    /// Current at `now` unless `now` is past the expiry instant.
    pub fn is_current_at(&self, now: DateTime<Utc>) -> bool {
        now <= self.fecha_vencimiento
    }

    /// Next folio to hand out, if any remain.
    pub fn next_folio(&self) -> Option<u64> {
        if !self.has_available_folios() {
            return None;
        }
        Some(self.folio_ultimo.max(self.folio_inicial.saturating_sub(1)) + 1)
    }

    /// Usable for issuance at `now`: active, current and not exhausted.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.estado == CafState::Activo && self.is_current_at(now) && self.has_available_folios()
    }

    /// Whether the two ranges share an issuer, type and at least one folio.
    pub fn overlaps(&self, other: &Caf) -> bool {
        self.rut_emisor == other.rut_emisor
            && self.tipo == other.tipo
            && self.folio_inicial <= other.folio_final
            && other.folio_inicial <= self.folio_final
    }
}

/// Serde helper for byte fields stored as standard base64 strings.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn caf(desde: u64, hasta: u64, ultimo: u64) -> Caf {
        let rut = Rut::parse("76192083-9").unwrap();
        let fecha = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let now = Utc::now();
        Caf {
            id: Caf::make_id(&rut, TipoDte::FacturaElectronica, desde, hasta),
            tipo: TipoDte::FacturaElectronica,
            rut_emisor: rut,
            razon_social: "EMPRESA DE PRUEBA SPA".into(),
            folio_inicial: desde,
            folio_final: hasta,
            folio_ultimo: ultimo,
            fecha_autorizacion: fecha,
            fecha_vencimiento: now + chrono::Duration::days(30),
            idk: 100,
            estado: CafState::Activo,
            xml: b"<AUTORIZACION/>".to_vec(),
            firma_sii: vec![1, 2, 3],
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::caf;
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn available_folios_partial_consumption() {
        assert_eq!(caf(100, 200, 150).available_folios(), 50);
    }

    #[test]
    fn available_folios_untouched_range() {
        let fresh = caf(100, 200, 0);
        assert_eq!(fresh.available_folios(), 101);
        assert_eq!(fresh.next_folio(), Some(100));
    }

    #[test]
    fn exhausted_range() {
        let used = caf(1, 10, 10);
        assert_eq!(used.available_folios(), 0);
        assert!(!used.has_available_folios());
        assert_eq!(used.next_folio(), None);
    }

    #[test]
    fn current_up_to_expiry_instant() {
        let c = caf(1, 10, 0);
        let at = c.fecha_vencimiento;
        assert!(c.is_current_at(at - chrono::Duration::nanoseconds(1)));
        assert!(c.is_current_at(at));
        assert!(!c.is_current_at(at + chrono::Duration::nanoseconds(1)));
    }

    #[test]
    fn expiry_is_six_months_after_authorization() {
        let on = |y, m, d| NaiveDate::from_ymd_opt(y, m, d).unwrap();
        assert_eq!(Caf::expiry_for(on(2024, 1, 15)).date_naive(), on(2024, 7, 15));
        assert_eq!(Caf::expiry_for(on(2024, 8, 31)).date_naive(), on(2025, 3, 3));
        assert_eq!(Caf::expiry_for(on(2023, 8, 31)).date_naive(), on(2024, 3, 2));
        assert_eq!(Caf::expiry_for(on(2024, 12, 31)).date_naive(), on(2025, 7, 1));
    }

    #[test]
    fn used_folios_complement_available() {
        let c = caf(100, 200, 150);
        assert_eq!(c.range_size(), 101);
        assert_eq!(c.used_folios(), 51);
        assert_eq!(caf(100, 200, 0).used_folios(), 0);
    }

    #[test]
    fn vigencia_windows() {
        let mut c = caf(1, 10, 0);
        let now = Utc::now();
        c.fecha_vencimiento = now + chrono::Duration::days(16) + chrono::Duration::hours(1);
        assert_eq!(c.days_left_at(now), 16);
        assert_eq!(c.vigencia_at(now, 15), Vigencia::Vigente);

        c.fecha_vencimiento = now + chrono::Duration::days(15) + chrono::Duration::hours(1);
        assert_eq!(c.vigencia_at(now, 15), Vigencia::ProximoExpirar);
        assert_eq!(c.vigencia_at(now, 0), Vigencia::Vigente);

        c.fecha_vencimiento = now + chrono::Duration::hours(2);
        assert_eq!(c.days_left_at(now), 0);
        assert_eq!(c.vigencia_at(now, 0), Vigencia::ProximoExpirar);

        c.fecha_vencimiento = now - chrono::Duration::seconds(1);
        assert_eq!(c.vigencia_at(now, 15), Vigencia::Expirado);
        assert_eq!(serde_json::to_string(&Vigencia::ProximoExpirar).unwrap(), "\"PROXIMO_EXPIRAR\"");
    }

    #[test]
    fn overlapping_ranges() {
        let a = caf(1, 100, 0);
        assert!(a.overlaps(&caf(100, 200, 0)));
        assert!(!a.overlaps(&caf(101, 200, 0)));
    }

    #[test]
    fn state_serializes_in_spanish() {
        assert_eq!(serde_json::to_string(&CafState::Vencido).unwrap(), "\"VENCIDO\"");
        let original = caf(1, 5, 0);
        let json = serde_json::to_string(&original).unwrap();
        assert!(json.contains("\"estado\":\"ACTIVO\""));
        let back: Caf = serde_json::from_str(&json).unwrap();
        assert_eq!(back, original);
    }

    proptest! {
        #[test]
        fn contains_folio_matches_range(desde in 1u64..10_000, len in 0u64..10_000, f in 0u64..30_000) {
            let c = caf(desde, desde + len, 0);
            prop_assert_eq!(c.contains_folio(f), desde <= f && f <= desde + len);
        }

        #[test]
        fn availability_never_exceeds_range(desde in 1u64..10_000, len in 0u64..10_000, ultimo in 0u64..30_000) {
            let c = caf(desde, desde + len, ultimo);
            let size = len + 1;
            prop_assert!(c.available_folios() <= size);
            if ultimo < desde {
                prop_assert_eq!(c.available_folios(), size);
            }
            if ultimo >= desde + len {
                prop_assert_eq!(c.available_folios(), 0);
            }
        }
    }
}
