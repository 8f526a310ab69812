//! # In-Memory Backend
//!
//! A `parking_lot::RwLock` around a plain map. Reads take the shared lock;
//! writes and lazy expiry take the exclusive lock. The lock is never held
//! across an `.await`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::CacheError;
use crate::store::KeyValueStore;

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

fn deadline(ttl: Option<Duration>) -> Option<Instant> {
    ttl.and_then(|ttl| Instant::now().checked_add(ttl))
}

/// Thread-safe, cloneable in-memory store. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Live (non-expired) entry for `key`, evicting it when expired.
    fn live(&self, key: &str) -> Option<Entry> {
        let now = Instant::now();
        {
            let guard = self.data.read();
            match guard.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => return Some(entry.clone()),
                Some(_) => {}
            }
        }
        let mut guard = self.data.write();
        if guard.get(key).is_some_and(|entry| entry.is_expired(now)) {
            guard.remove(key);
        }
        None
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.data.write();
        let before = guard.len();
        guard.retain(|_, entry| !entry.is_expired(now));
        before - guard.len()
    }

    /// Number of stored keys, expired or not.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Bytes(bytes),
                ..
            }) => Ok(Some(bytes)),
            Some(_) => Err(CacheError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let entry = Entry {
            value: Value::Bytes(value),
            expires_at: deadline(ttl),
        };
        self.data.write().insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let now = Instant::now();
        let removed = self.data.write().remove(key);
        Ok(removed.is_some_and(|entry| !entry.is_expired(now)))
    }

    async fn set_add(
        &self,
        key: &str,
        member: &str,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut guard = self.data.write();
        let entry = guard.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Set(BTreeSet::new()),
            expires_at: None,
        });
        if entry.is_expired(now) {
            entry.value = Value::Set(BTreeSet::new());
        }
        match &mut entry.value {
            Value::Set(members) => {
                members.insert(member.to_string());
            }
            Value::Bytes(_) => {
                return Err(CacheError::WrongType {
                    key: key.to_string(),
                })
            }
        }
        entry.expires_at = deadline(ttl);
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, CacheError> {
        match self.live(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => Ok(members.into_iter().collect()),
            Some(_) => Err(CacheError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), CacheError> {
        let mut guard = self.data.write();
        let now_empty = match guard.get_mut(key) {
            None => return Ok(()),
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => {
                members.remove(member);
                members.is_empty()
            }
            Some(_) => {
                return Err(CacheError::WrongType {
                    key: key.to_string(),
                })
            }
        };
        if now_empty {
            guard.remove(key);
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let mut guard = self.data.write();
        let before = guard.len();
        guard.retain(|key, _| !key.starts_with(prefix));
        Ok(before - guard.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get() {
        let store = MemoryStore::new();
        store.set("k", b"v".to_vec(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_values_read_as_missing_and_are_evicted() {
        let store = MemoryStore::new();
        store
            .set("k", b"v".to_vec(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn sets_are_sorted_and_removable() {
        let store = MemoryStore::new();
        store.set_add("s", "b", None).await.unwrap();
        store.set_add("s", "a", None).await.unwrap();
        store.set_add("s", "a", None).await.unwrap();
        assert_eq!(store.set_members("s").await.unwrap(), vec!["a", "b"]);
        store.set_remove("s", "a").await.unwrap();
        assert_eq!(store.set_members("s").await.unwrap(), vec!["b"]);
        store.set_remove("s", "b").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn wrong_type_is_reported() {
        let store = MemoryStore::new();
        store.set("k", b"v".to_vec(), None).await.unwrap();
        let err = store.set_add("k", "m", None).await.unwrap_err();
        assert!(matches!(err, CacheError::WrongType { .. }));
        store.set_add("s", "m", None).await.unwrap();
        assert!(store.get("s").await.is_err());
    }

    #[tokio::test]
    async fn delete_prefix_only_touches_matching_keys() {
        let store = MemoryStore::new();
        store.set("sii:caf:1", b"1".to_vec(), None).await.unwrap();
        store.set("sii:caf:2", b"2".to_vec(), None).await.unwrap();
        store.set("sii:token:1", b"t".to_vec(), None).await.unwrap();
        assert_eq!(store.delete_prefix("sii:caf:").await.unwrap(), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn purge_drops_only_expired() {
        let store = MemoryStore::new();
        store
            .set("short", b"x".to_vec(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        store.set("long", b"y".to_vec(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let a = MemoryStore::new();
        let b = a.clone();
        a.set("k", b"v".to_vec(), None).await.unwrap();
        assert!(b.delete("k").await.unwrap());
        assert!(a.is_empty());
    }
}
