//! entcache Storage - Datastore Trait, Cache Layer and Mock Implementation
//!
//! Defines the datastore abstraction the cache sits in front of, the
//! two-tier cache itself, and the [`Session`] unit of work tying them to an
//! ORM's save, delete, get and query calls.

pub mod cache;
pub mod session;
pub mod transaction;

pub use cache::{
    CachePolicy, CacheRead, CacheStats, CacheTier, ContextLevel, ContextStack,
    HashedIdentifierDeriver, IdentifierDeriver, InMemorySharedCache, QueryShape, SharedCache,
    SharedCacheClient, StagedOp,
};
pub use session::Session;
pub use transaction::TransactionHooks;

use entcache_core::{CacheEntry, CacheResult, DatastoreError, Key, Query};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

// ============================================================================
// DATASTORE TRAIT
// ============================================================================

/// The authoritative entity store.
///
/// Reads by key are strongly consistent. Queries filtering on anything but
/// `__key__` may be served from an index that lags recent writes.
pub trait Datastore: Send + Sync {
    /// Get an entity by key.
    fn get(&self, key: &Key) -> CacheResult<Option<CacheEntry>>;

    /// Get several entities by key, in key order.
    fn get_multi(&self, keys: &[Key]) -> CacheResult<Vec<Option<CacheEntry>>>;

    /// Run a query. Keys-only queries return entries without fields,
    /// projections only the projected fields.
    fn run_query(&self, query: &Query) -> CacheResult<Vec<CacheEntry>>;

    /// Insert or replace an entity.
    fn put(&self, entry: &CacheEntry) -> CacheResult<()>;

    /// Delete an entity. Deleting an absent key is not an error.
    fn delete(&self, key: &Key) -> CacheResult<()>;
}

// ============================================================================
// MOCK DATASTORE
// ============================================================================

/// In-memory datastore for testing.
///
/// Counts calls so tests can assert whether a read reached the datastore.
/// Queries are served straight from the entity map, so they are consistent.
#[derive(Debug, Default)]
pub struct MockDatastore {
    entities: RwLock<BTreeMap<Key, CacheEntry>>,
    get_calls: AtomicUsize,
    query_calls: AtomicUsize,
    put_calls: AtomicUsize,
}

impl MockDatastore {
    /// Create a new mock datastore.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get` and `get_multi` calls.
    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::Relaxed)
    }

    /// Number of `run_query` calls.
    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::Relaxed)
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::Relaxed)
    }

    pub fn reset_counters(&self) {
        self.get_calls.store(0, Ordering::Relaxed);
        self.query_calls.store(0, Ordering::Relaxed);
        self.put_calls.store(0, Ordering::Relaxed);
    }

    /// Number of stored entities.
    pub fn len(&self) -> usize {
        self.entities.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all stored data.
    pub fn clear(&self) -> CacheResult<()> {
        self.entities
            .write()
            .map_err(|_| DatastoreError::LockPoisoned)?
            .clear();
        Ok(())
    }

    fn shape(query: &Query, entry: &CacheEntry) -> CacheEntry {
        if query.keys_only {
            return CacheEntry::empty(entry.key().clone());
        }
        match &query.projection {
            Some(fields) => CacheEntry::new(
                entry.key().clone(),
                entry
                    .fields()
                    .iter()
                    .filter(|(name, _)| fields.contains(name))
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect(),
            ),
            None => entry.clone(),
        }
    }
}

impl Datastore for MockDatastore {
    fn get(&self, key: &Key) -> CacheResult<Option<CacheEntry>> {
        self.get_calls.fetch_add(1, Ordering::Relaxed);
        let entities = self
            .entities
            .read()
            .map_err(|_| DatastoreError::LockPoisoned)?;
        Ok(entities.get(key).cloned())
    }

    fn get_multi(&self, keys: &[Key]) -> CacheResult<Vec<Option<CacheEntry>>> {
        self.get_calls.fetch_add(1, Ordering::Relaxed);
        let entities = self
            .entities
            .read()
            .map_err(|_| DatastoreError::LockPoisoned)?;
        Ok(keys.iter().map(|key| entities.get(key).cloned()).collect())
    }

    fn run_query(&self, query: &Query) -> CacheResult<Vec<CacheEntry>> {
        self.query_calls.fetch_add(1, Ordering::Relaxed);
        let entities = self
            .entities
            .read()
            .map_err(|_| DatastoreError::LockPoisoned)?;
        Ok(entities
            .values()
            .filter(|entry| query.matches(entry))
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|entry| Self::shape(query, entry))
            .collect())
    }

    fn put(&self, entry: &CacheEntry) -> CacheResult<()> {
        self.put_calls.fetch_add(1, Ordering::Relaxed);
        let mut entities = self
            .entities
            .write()
            .map_err(|_| DatastoreError::LockPoisoned)?;
        entities.insert(entry.key().clone(), entry.clone());
        Ok(())
    }

    fn delete(&self, key: &Key) -> CacheResult<()> {
        let mut entities = self
            .entities
            .write()
            .map_err(|_| DatastoreError::LockPoisoned)?;
        entities.remove(key);
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================


// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================
