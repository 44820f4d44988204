//! Shared cache client and in-memory backend.
//!
//! The shared cache is strictly an optimization: the client never lets a
//! backend failure reach its caller. Reads that fail are misses, writes and
//! deletes that fail are no-ops, and every failure is logged and counted.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use entcache_core::{CacheEntry, CacheError, CacheResult, Identifier, SharedCacheError, Timestamp};
use tracing::{debug, warn};

use super::traits::SharedCache;

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Option<Timestamp>,
}

impl StoredValue {
    fn is_live(&self, now: Timestamp) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process shared cache backend.
///
/// Suitable for tests and single-process deployments. Entries expire lazily
/// on read; [`evict`](Self::evict) simulates the store dropping an entry on
/// its own.
#[derive(Debug, Default)]
pub struct InMemorySharedCache {
    entries: RwLock<HashMap<String, StoredValue>>,
}

impl InMemorySharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.entries
            .read()
            .map(|entries| entries.values().filter(|v| v.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        matches!(self.get(key), Ok(Some(_)))
    }

    /// Drop an entry without going through the cache policy.
    pub fn evict(&self, key: &str) -> bool {
        self.entries
            .write()
            .map(|mut entries| entries.remove(key).is_some())
            .unwrap_or(false)
    }
}

impl SharedCache for InMemorySharedCache {
    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| SharedCacheError::LockPoisoned)?;
        let now = Utc::now();
        Ok(entries
            .get(key)
            .filter(|v| v.is_live(now))
            .map(|v| v.bytes.clone()))
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()> {
        // An expiry too far out to represent never expires.
        let expires_at = ttl.and_then(|ttl| {
            chrono::Duration::from_std(ttl)
                .ok()
                .and_then(|delta| Utc::now().checked_add_signed(delta))
        });
        let mut entries = self
            .entries
            .write()
            .map_err(|_| SharedCacheError::LockPoisoned)?;
        entries.insert(
            key.to_string(),
            StoredValue {
                bytes: value,
                expires_at,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| SharedCacheError::LockPoisoned)?;
        entries.remove(key);
        Ok(())
    }

    fn clear(&self) -> CacheResult<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| SharedCacheError::LockPoisoned)?;
        entries.clear();
        Ok(())
    }
}

/// Typed, failure-swallowing front of a [`SharedCache`] backend.
///
/// Cloning is cheap and clones share the backend and the failure counter.
#[derive(Clone)]
pub struct SharedCacheClient {
    backend: Arc<dyn SharedCache>,
    ttl: Option<Duration>,
    failures: Arc<AtomicU64>,
}

impl SharedCacheClient {
    pub fn new(backend: Arc<dyn SharedCache>) -> Self {
        Self {
            backend,
            ttl: None,
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Set the expiry passed with every write.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Number of backend failures swallowed so far.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Read the snapshot stored under `identifier`; any failure is a miss.
    pub fn get(&self, identifier: &Identifier) -> Option<CacheEntry> {
        let bytes = match self.backend.get(identifier.as_str()) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                self.record_failure("get", identifier, &err);
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(entry) => Some(entry),
            Err(err) => {
                let err = CacheError::from(SharedCacheError::Serialization {
                    reason: err.to_string(),
                });
                self.record_failure("decode", identifier, &err);
                None
            }
        }
    }

    /// Store one snapshot under every identifier.
    pub fn set_many(&self, identifiers: &[Identifier], entry: &CacheEntry) {
        let Some(first) = identifiers.first() else {
            return;
        };
        let bytes = match serde_json::to_vec(entry) {
            Ok(bytes) => bytes,
            Err(err) => {
                let err = CacheError::from(SharedCacheError::Serialization {
                    reason: err.to_string(),
                });
                self.record_failure("encode", first, &err);
                return;
            }
        };

        for identifier in identifiers {
            match self.backend.set(identifier.as_str(), bytes.clone(), self.ttl) {
                Ok(()) => debug!(identifier = %identifier, "Shared cache populated"),
                Err(err) => self.record_failure("set", identifier, &err),
            }
        }
    }

    pub fn set(&self, identifier: &Identifier, entry: &CacheEntry) {
        self.set_many(std::slice::from_ref(identifier), entry);
    }

    pub fn delete_many(&self, identifiers: &[Identifier]) {
        for identifier in identifiers {
            match self.backend.delete(identifier.as_str()) {
                Ok(()) => debug!(identifier = %identifier, "Shared cache entry deleted"),
                Err(err) => self.record_failure("delete", identifier, &err),
            }
        }
    }

    pub fn delete(&self, identifier: &Identifier) {
        self.delete_many(std::slice::from_ref(identifier));
    }

    /// Drop everything in the backend.
    pub fn clear(&self) {
        if let Err(err) = self.backend.clear() {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!(operation = "clear", error = %err, "Shared cache failure ignored");
        }
    }

    fn record_failure(&self, operation: &str, identifier: &Identifier, err: &CacheError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        warn!(
            operation,
            identifier = %identifier,
            error = %err,
            "Shared cache failure ignored"
        );
    }
}

impl fmt::Debug for SharedCacheClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedCacheClient")
            .field("ttl", &self.ttl)
            .field("failures", &self.failures())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entcache_core::{Entity, Key};

    /// Backend whose every call fails.
    struct DownBackend;

    impl SharedCache for DownBackend {
        fn get(&self, _key: &str) -> CacheResult<Option<Vec<u8>>> {
            Err(SharedCacheError::Timeout { millis: 100 }.into())
        }

        fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Option<Duration>) -> CacheResult<()> {
            Err(SharedCacheError::Unavailable {
                reason: "connection refused".to_string(),
            }
            .into())
        }

        fn delete(&self, _key: &str) -> CacheResult<()> {
            Err(SharedCacheError::Timeout { millis: 100 }.into())
        }

        fn clear(&self) -> CacheResult<()> {
            Err(SharedCacheError::LockPoisoned.into())
        }
    }

    fn entry() -> CacheEntry {
        Entity::new(Key::new("CachingTestModel"))
            .with("field1", "Apple")
            .with("comb1", 1)
            .to_entry()
    }

    #[test]
    fn test_set_get_delete_roundtrip() {
        let backend = Arc::new(InMemorySharedCache::new());
        let client = SharedCacheClient::new(backend.clone());
        let ids = vec![Identifier::from("a"), Identifier::from("b")];
        let entry = entry();

        client.set_many(&ids, &entry);
        assert_eq!(backend.len(), 2);
        assert_eq!(client.get(&ids[0]), Some(entry.clone()));
        assert_eq!(client.get(&ids[1]), Some(entry));

        client.delete_many(&ids);
        assert!(backend.is_empty());
        assert_eq!(client.get(&ids[0]), None);
    }

    #[test]
    fn test_failures_are_swallowed_and_counted() {
        let client = SharedCacheClient::new(Arc::new(DownBackend));
        let id = Identifier::from("a");

        assert_eq!(client.get(&id), None);
        client.set(&id, &entry());
        client.delete(&id);
        client.clear();

        assert_eq!(client.failures(), 4);
    }

    #[test]
    fn test_corrupt_value_is_a_miss() {
        let backend = Arc::new(InMemorySharedCache::new());
        backend.set("a", b"not json".to_vec(), None).unwrap();

        let client = SharedCacheClient::new(backend);
        assert_eq!(client.get(&Identifier::from("a")), None);
        assert_eq!(client.failures(), 1);
    }

    #[test]
    fn test_expired_entries_are_absent() {
        let backend = InMemorySharedCache::new();
        backend
            .set("short", b"1".to_vec(), Some(Duration::from_millis(1)))
            .unwrap();
        backend.set("forever", b"1".to_vec(), None).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert!(!backend.contains("short"));
        assert!(backend.contains("forever"));
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn test_huge_ttl_never_expires() {
        let backend = InMemorySharedCache::new();
        backend
            .set("a", b"1".to_vec(), Some(Duration::from_secs(u64::MAX)))
            .unwrap();
        assert!(backend.contains("a"));
    }

    #[test]
    fn test_evict_simulates_independent_eviction() {
        let backend = Arc::new(InMemorySharedCache::new());
        let client = SharedCacheClient::new(backend.clone());
        let id = Identifier::from("a");
        client.set(&id, &entry());

        assert!(backend.evict("a"));
        assert!(!backend.evict("a"));
        assert_eq!(client.get(&id), None);
        assert_eq!(client.failures(), 0);
    }
}
