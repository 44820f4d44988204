//! Provenance of cache reads.
//!
//! Every read made through the policy engine says which tier served it, so
//! callers and tests can tell a cache hit from a datastore round-trip.

use chrono::Utc;
use entcache_core::Timestamp;
use std::time::Duration;

/// Where a read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTier {
    /// The unit of work's context cache.
    Context,
    /// The process-wide shared cache.
    Shared,
    /// The authoritative datastore.
    Datastore,
}

impl CacheTier {
    pub fn is_cache(&self) -> bool {
        !matches!(self, Self::Datastore)
    }
}

/// Result of a read, carrying the tier that served it.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: T,
    tier: CacheTier,
    read_at: Timestamp,
}

impl<T> CacheRead<T> {
    pub fn new(value: T, tier: CacheTier) -> Self {
        Self {
            value,
            tier,
            read_at: Utc::now(),
        }
    }

    /// Consume the wrapper and return the underlying value.
    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn tier(&self) -> CacheTier {
        self.tier
    }

    pub fn read_at(&self) -> Timestamp {
        self.read_at
    }

    /// Check if this was served by either cache tier.
    pub fn was_cache_hit(&self) -> bool {
        self.tier.is_cache()
    }

    /// Check if this was fetched from the datastore.
    pub fn was_cache_miss(&self) -> bool {
        !self.was_cache_hit()
    }

    /// Time elapsed since the read.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.read_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Map the inner value to a new type.
    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            tier: self.tier,
            read_at: self.read_at,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}
