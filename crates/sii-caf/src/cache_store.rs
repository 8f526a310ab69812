//! # Cache-Backed CAF Store
//!
//! Each record is a JSON value under `<prefix>:caf:<id>`; ids of one
//! document type are kept in the set `<prefix>:caf:tipo:<code>`. Both carry a
//! TTL (24h by default) and expire on their own. Index members whose record
//! has expired are pruned when listed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sii_cache::{get_json, set_json, KeySpace, KeyValueStore, CAF_TTL};
use sii_core::TipoDte;

use crate::error::CafError;
use crate::model::{Caf, CafState};
use crate::store::{sort_by_range, CafRepository};

/// [`CafRepository`] over a [`KeyValueStore`].
#[derive(Debug, Clone)]
pub struct CachedCafStore {
    store: Arc<dyn KeyValueStore>,
    keys: KeySpace,
    ttl: Duration,
}

impl CachedCafStore {
    /// Store over `store` with the default TTL.
    pub fn new(store: Arc<dyn KeyValueStore>, keys: KeySpace) -> Self {
        Self {
            store,
            keys,
            ttl: CAF_TTL,
        }
    }

    /// Override the TTL of records and indexes.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Drop every CAF key, records and indexes alike.
    pub async fn clear(&self) -> Result<usize, CafError> {
        let removed = self.store.delete_prefix(&self.keys.caf_prefix()).await?;
        tracing::info!(removed, "cleared CAF cache");
        Ok(removed)
    }
}

#[async_trait]
impl CafRepository for CachedCafStore {
    async fn save(&self, caf: &Caf) -> Result<(), CafError> {
        set_json(self.store.as_ref(), &self.keys.caf(&caf.id), caf, Some(self.ttl)).await?;
        self.store
            .set_add(&self.keys.caf_type_index(caf.tipo), &caf.id, Some(self.ttl))
            .await?;
        tracing::debug!(id = %caf.id, estado = %caf.estado, "cached CAF");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Caf>, CafError> {
        Ok(get_json(self.store.as_ref(), &self.keys.caf(id)).await?)
    }

    async fn list_by_type(&self, tipo: TipoDte) -> Result<Vec<Caf>, CafError> {
        let index = self.keys.caf_type_index(tipo);
        let mut out = Vec::new();
        for id in self.store.set_members(&index).await? {
            match self.get(&id).await? {
                Some(caf) if caf.tipo == tipo => out.push(caf),
                Some(_) => {}
                None => {
                    tracing::debug!(%id, "pruning expired CAF from type index");
                    self.store.set_remove(&index, &id).await?;
                }
            }
        }
        sort_by_range(&mut out);
        Ok(out)
    }

    async fn update_state(&self, id: &str, estado: CafState) -> Result<(), CafError> {
        let mut caf = self
            .get(id)
            .await?
            .ok_or_else(|| CafError::NotFound(id.to_string()))?;
        caf.estado = estado;
        caf.updated_at = Utc::now();
        self.save(&caf).await
    }

    async fn delete(&self, id: &str) -> Result<bool, CafError> {
        let Some(caf) = self.get(id).await? else {
            return Ok(false);
        };
        let removed = self.store.delete(&self.keys.caf(id)).await?;
        self.store
            .set_remove(&self.keys.caf_type_index(caf.tipo), id)
            .await?;
        Ok(removed)
    }
}
