//! Storage seam for folio authorizations. File-system and cache-backed
//! implementations are interchangeable.

use async_trait::async_trait;
use sii_core::TipoDte;

use crate::error::CafError;
use crate::model::{Caf, CafState};

/// Persistence for [`Caf`] records.
#[async_trait]
pub trait CafRepository: Send + Sync + std::fmt::Debug {
    /// Insert or overwrite a record.
    async fn save(&self, caf: &Caf) -> Result<(), CafError>;

    /// Record by id.
    async fn get(&self, id: &str) -> Result<Option<Caf>, CafError>;

    /// All records of one document type, ordered by first folio.
    async fn list_by_type(&self, tipo: TipoDte) -> Result<Vec<Caf>, CafError>;

    /// Write back a lifecycle transition.
    async fn update_state(&self, id: &str, estado: CafState) -> Result<(), CafError>;

    /// Remove a record. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool, CafError>;
}

pub(crate) fn sort_by_range(cafs: &mut [Caf]) {
    cafs.sort_by(|a, b| {
        (a.folio_inicial, a.rut_emisor.body()).cmp(&(b.folio_inicial, b.rut_emisor.body()))
    });
}
