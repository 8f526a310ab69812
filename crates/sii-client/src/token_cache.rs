//! # Token Cache
//!
//! Session tokens keyed by (taxpayer, environment) in the shared
//! [`KeyValueStore`]. A record is valid while `now < expires_at`; expired
//! records read as absent and are deleted on the way out.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sii_cache::{get_json, set_json, CacheError, KeySpace, KeyValueStore};
use sii_core::{Ambiente, Rut};

/// A cached session token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenData {
    /// Token value.
    pub token: String,
    /// When the authority issued it.
    pub created_at: DateTime<Utc>,
    /// First instant at which it is no longer valid.
    pub expires_at: DateTime<Utc>,
    /// Taxpayer it was issued for.
    pub rut_emisor: Rut,
    /// Environment it was issued in.
    pub ambiente: Ambiente,
    /// Last time a caller used it.
    pub last_used_at: DateTime<Utc>,
}

impl fmt::Debug for TokenData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenData")
            .field("token", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("rut_emisor", &self.rut_emisor)
            .field("ambiente", &self.ambiente)
            .field("last_used_at", &self.last_used_at)
            .finish()
    }
}

impl TokenData {
    /// Token issued now and valid for `ttl`.
    pub fn issued(token: impl Into<String>, rut_emisor: Rut, ambiente: Ambiente, ttl: Duration) -> Self {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            token: token.into(),
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            rut_emisor,
            ambiente,
            last_used_at: now,
        }
    }

    /// Valid at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Valid now.
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// Time left before expiry, zero when expired.
    pub fn remaining(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or_default()
    }
}

/// Session tokens over a [`KeyValueStore`].
#[derive(Debug, Clone)]
pub struct TokenCache {
    store: Arc<dyn KeyValueStore>,
    keys: KeySpace,
}

impl TokenCache {
    /// Cache over `store`.
    pub fn new(store: Arc<dyn KeyValueStore>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    /// Valid token for the pair, if cached.
    pub async fn get(&self, rut: &Rut, ambiente: Ambiente) -> Result<Option<TokenData>, CacheError> {
        let key = self.keys.session_token(rut, ambiente);
        match get_json::<TokenData>(self.store.as_ref(), &key).await? {
            Some(data) if data.is_valid() => {
                tracing::debug!(%rut, %ambiente, "session token cache hit");
                Ok(Some(data))
            }
            Some(_) => {
                self.store.delete(&key).await?;
                tracing::debug!(%rut, %ambiente, "session token expired");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Store `data`; the backend entry lives until `expires_at`.
    pub async fn put(&self, data: &TokenData) -> Result<(), CacheError> {
        let ttl = data.remaining();
        if ttl.is_zero() {
            return Ok(());
        }
        let key = self.keys.session_token(&data.rut_emisor, data.ambiente);
        set_json(self.store.as_ref(), &key, data, Some(ttl)).await
    }

    /// Record a use of the cached token.
    pub async fn touch(&self, rut: &Rut, ambiente: Ambiente) -> Result<Option<TokenData>, CacheError> {
        let Some(mut data) = self.get(rut, ambiente).await? else {
            return Ok(None);
        };
        data.last_used_at = Utc::now();
        self.put(&data).await?;
        Ok(Some(data))
    }

    /// Drop the token for the pair.
    pub async fn invalidate(&self, rut: &Rut, ambiente: Ambiente) -> Result<bool, CacheError> {
        self.store
            .delete(&self.keys.session_token(rut, ambiente))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sii_cache::MemoryStore;

    fn rut() -> Rut {
        Rut::parse("76192083-9").unwrap()
    }

    fn cache() -> TokenCache {
        TokenCache::new(Arc::new(MemoryStore::new()), KeySpace::default())
    }

    #[tokio::test]
    async fn put_then_get() {
        let cache = cache();
        let data = TokenData::issued("TOK1", rut(), Ambiente::Certificacion, Duration::from_secs(60));
        cache.put(&data).await.unwrap();
        let got = cache.get(&rut(), Ambiente::Certificacion).await.unwrap().unwrap();
        assert_eq!(got.token, "TOK1");
        assert!(cache.get(&rut(), Ambiente::Produccion).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_record_reads_as_absent() {
        let store = Arc::new(MemoryStore::new());
        let cache = TokenCache::new(store.clone(), KeySpace::default());
        let mut data = TokenData::issued("OLD", rut(), Ambiente::Certificacion, Duration::from_secs(60));
        // written with a long backend TTL but already past expires_at
        data.expires_at = Utc::now() - chrono::Duration::seconds(1);
        set_json(
            store.as_ref(),
            &KeySpace::default().session_token(&rut(), Ambiente::Certificacion),
            &data,
            None,
        )
        .await
        .unwrap();
        assert!(cache.get(&rut(), Ambiente::Certificacion).await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn valid_strictly_before_expiry() {
        let data = TokenData::issued("T", rut(), Ambiente::Certificacion, Duration::from_secs(60));
        assert!(data.is_valid_at(data.expires_at - chrono::Duration::nanoseconds(1)));
        assert!(!data.is_valid_at(data.expires_at));
    }

    #[tokio::test]
    async fn touch_and_invalidate() {
        let cache = cache();
        let data = TokenData::issued("T", rut(), Ambiente::Produccion, Duration::from_secs(60));
        cache.put(&data).await.unwrap();
        let touched = cache.touch(&rut(), Ambiente::Produccion).await.unwrap().unwrap();
        assert!(touched.last_used_at >= data.last_used_at);
        assert!(cache.invalidate(&rut(), Ambiente::Produccion).await.unwrap());
        assert!(cache.touch(&rut(), Ambiente::Produccion).await.unwrap().is_none());
    }

    #[test]
    fn debug_redacts_token() {
        let data = TokenData::issued("SECRET", rut(), Ambiente::Certificacion, Duration::from_secs(1));
        assert!(!format!("{data:?}").contains("SECRET"));
    }
}
