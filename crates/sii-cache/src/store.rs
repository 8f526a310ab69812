//! # Key-Value Store Interface
//!
//! The seam between cache consumers (session tokens, certificates, folio
//! authorizations) and the backend holding them. Backends own TTL expiry:
//! the in-memory store expires lazily on read, Redis expires natively.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CacheError;

/// Byte values and string sets with optional TTL.
#[async_trait]
pub trait KeyValueStore: Send + Sync + std::fmt::Debug {
    /// Read a value. Expired keys read as `None`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Write a value, replacing any previous one. `None` means no expiry.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
        -> Result<(), CacheError>;

    /// Remove a key of any type. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Add `member` to the set at `key` and reset the set's TTL.
    async fn set_add(
        &self,
        key: &str,
        member: &str,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>;

    /// Members of the set at `key`, sorted. Missing or expired sets are empty.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, CacheError>;

    /// Remove `member` from the set at `key`.
    async fn set_remove(&self, key: &str, member: &str) -> Result<(), CacheError>;

    /// Remove every key starting with `prefix`. Returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError>;
}

/// Read and decode a JSON value.
pub async fn get_json<T>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>, CacheError>
where
    T: DeserializeOwned,
{
    match store.get(key).await? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| CacheError::Serialization {
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

/// Encode and write a JSON value.
pub async fn set_json<T>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<(), CacheError>
where
    T: Serialize + Sync,
{
    let bytes = serde_json::to_vec(value).map_err(|source| CacheError::Serialization {
        key: key.to_string(),
        source,
    })?;
    store.set(key, bytes, ttl).await
}
