//! Shared cache backend trait and cache statistics.
//!
//! This module defines the trait a process-wide cache store must implement
//! and the counters the policy engine keeps about how reads were served.

use std::time::Duration;

use entcache_core::CacheResult;

/// Process-wide key/value store backing consistent reads.
///
/// Implementations are best-effort: an entry may disappear at any time
/// without an explicit delete, and no transactional isolation or ordering
/// between concurrent writers is offered. Correctness relies entirely on the
/// policy engine never writing uncommitted state here.
///
/// # Key Format
///
/// Keys are identifier strings produced by an
/// [`IdentifierDeriver`](crate::cache::IdentifierDeriver).
///
/// # Serialization
///
/// Values are opaque bytes; the [`SharedCacheClient`](crate::cache::SharedCacheClient)
/// owns the encoding.
pub trait SharedCache: Send + Sync {
    /// Get a value, or None if absent or evicted.
    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store a value, optionally expiring after `ttl`.
    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()>;

    /// Delete a value. Deleting an absent key is not an error.
    fn delete(&self, key: &str) -> CacheResult<()>;

    /// Drop everything. Administrative and test use only.
    fn clear(&self) -> CacheResult<()>;
}

/// Statistics about how reads were served.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served by the context cache.
    pub context_hits: u64,
    /// Reads served by the shared cache.
    pub shared_hits: u64,
    /// Reads that reached the datastore.
    pub misses: u64,
    /// Shared cache failures that were swallowed.
    pub shared_failures: u64,
}

impl CacheStats {
    /// Total hits across both tiers.
    pub fn hits(&self) -> u64 {
        self.context_hits + self.shared_hits
    }

    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }
}
