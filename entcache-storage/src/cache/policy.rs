//! Cache policy engine.
//!
//! This module decides, for every read and write the ORM layer performs,
//! which cache tiers may be consulted or updated:
//!
//! | Operation | Outside a transaction | Inside a transaction |
//! |---|---|---|
//! | save / delete | context top + shared cache updated | context top (staged); shared entries **deleted** |
//! | get by key, unique filter | context, then shared, then datastore; result populates both | datastore only; result populates context top |
//! | non-unique filter, projection | datastore only, nothing cached | datastore only, nothing cached |
//!
//! A non-unique filter is answered from an index that may lag the entity
//! itself, so its results never reach either tier. A transactional write
//! may still roll back, so it never reaches the shared cache either; the
//! stale shared entries are deleted and the identifiers are remembered so
//! the next consistent read outside a transaction goes to the datastore and
//! repopulates both tiers.

use std::collections::HashSet;

use entcache_core::{CacheConfig, CacheEntry, Entity, Identifier, Key, ModelSchema, Query, Value};
use tracing::debug;

use super::context::ContextStack;
use super::identifiers::IdentifierDeriver;
use super::read::{CacheRead, CacheTier};
use super::shared::SharedCacheClient;
use super::traits::CacheStats;

/// How a query may interact with the caches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryShape {
    /// `__key__` equality: consistent, cacheable per key.
    ByKey(Vec<Key>),
    /// Equality on every field of a unique constraint: consistent, cacheable.
    Unique { identifier: Identifier },
    /// Anything else: served by a possibly lagging index, never cached.
    Eventual,
    /// Keys-only or projection: a partial view, never cached.
    Projection,
}

impl QueryShape {
    /// Classify `query` against the unique constraints of `schema`.
    pub fn classify(query: &Query, schema: &ModelSchema, deriver: &dyn IdentifierDeriver) -> Self {
        if query.is_partial() {
            return Self::Projection;
        }

        let keys = query.key_filters();
        if !keys.is_empty() {
            return Self::ByKey(keys);
        }

        for constraint in schema.constraints() {
            let values: Option<Vec<(&str, &Value)>> = constraint
                .iter()
                .map(|field| query.value_for(field).map(|v| (field.as_str(), v)))
                .collect();
            let identifier = values.and_then(|values| {
                deriver.constraint_identifier(schema, query.namespace.as_deref(), &values)
            });
            if let Some(identifier) = identifier {
                return Self::Unique { identifier };
            }
        }

        Self::Eventual
    }

    /// Whether results reflect the latest committed write.
    pub fn is_consistent(&self) -> bool {
        matches!(self, Self::ByKey(_) | Self::Unique { .. })
    }
}

/// Per-unit-of-work policy state.
///
/// The engine holds no reference to the stack or the shared cache; both are
/// passed to every call so the transaction state in force is always the one
/// of the stack at hand.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    config: CacheConfig,
    /// Identifiers whose shared entries a transactional write deleted.
    needs_refresh: HashSet<Identifier>,
    stats: CacheStats,
}

impl CachePolicy {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            needs_refresh: HashSet::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Whether the next consistent read of `identifier` must skip the caches.
    pub fn needs_refresh(&self, identifier: &Identifier) -> bool {
        self.needs_refresh.contains(identifier)
    }

    /// Try to serve a consistent read of `identifier` from cache.
    ///
    /// Inside a transaction this always misses. A candidate rejected by
    /// `accept` (for instance because it no longer matches the query) is a
    /// miss as well. Every None returned is counted as a datastore read.
    pub fn lookup<F>(
        &mut self,
        stack: &ContextStack,
        shared: &SharedCacheClient,
        identifier: &Identifier,
        accept: F,
    ) -> Option<CacheRead<CacheEntry>>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let hit = self.find(stack, shared, identifier, &accept);
        match &hit {
            Some(read) => {
                match read.tier() {
                    CacheTier::Context => self.stats.context_hits += 1,
                    CacheTier::Shared => self.stats.shared_hits += 1,
                    CacheTier::Datastore => {}
                }
                debug!(identifier = %identifier, tier = ?read.tier(), "Cache hit");
            }
            None => {
                self.stats.misses += 1;
                debug!(identifier = %identifier, "Cache miss");
            }
        }
        hit
    }

    fn find<F>(
        &self,
        stack: &ContextStack,
        shared: &SharedCacheClient,
        identifier: &Identifier,
        accept: &F,
    ) -> Option<CacheRead<CacheEntry>>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        if stack.in_transaction() {
            debug!(
                identifier = %identifier,
                depth = stack.transaction_depth(),
                "Consistent read inside transaction bypasses caches"
            );
            return None;
        }
        if self.needs_refresh.contains(identifier) {
            return None;
        }

        if self.config.context_enabled {
            if let Some(entry) = stack.get(identifier).filter(|e| accept(e)) {
                return Some(CacheRead::new(entry.clone(), CacheTier::Context));
            }
        }

        if self.config.shared_enabled {
            if let Some(entry) = shared.get(identifier).filter(|e| accept(e)) {
                return Some(CacheRead::new(entry, CacheTier::Shared));
            }
        }

        None
    }

    /// Populate the caches after a consistent read.
    ///
    /// `reads` pairs each snapshot with all of its identifiers. Snapshots
    /// from the datastore replace what the context holds and, outside a
    /// transaction, are written to the shared cache. Snapshots from the
    /// shared cache only warm the context. At most `max_entity_count`
    /// snapshots are cached.
    pub fn record_read(
        &mut self,
        stack: &mut ContextStack,
        shared: &SharedCacheClient,
        tier: CacheTier,
        reads: &[(Vec<Identifier>, CacheEntry)],
    ) {
        if tier == CacheTier::Context {
            return;
        }
        let in_transaction = stack.in_transaction();

        for (identifiers, entry) in reads.iter().take(self.config.max_entity_count) {
            if self.config.context_enabled {
                stack.invalidate(identifiers);
                stack.cache_entity(identifiers, &Entity::from(entry.clone()));
            }

            if tier == CacheTier::Datastore && self.config.shared_enabled && !in_transaction {
                shared.set_many(identifiers, entry);
                for identifier in identifiers {
                    self.needs_refresh.remove(identifier);
                }
            }
        }

        debug!(
            tier = ?tier,
            count = reads.len().min(self.config.max_entity_count),
            in_transaction,
            "Populated caches from read"
        );
    }

    /// Apply a save to the caches.
    ///
    /// `identifiers` are the entity's identifiers after the save, `stale`
    /// those it had before and no longer has. `snapshot` is the full stored
    /// state written to the shared cache outside a transaction.
    pub fn record_write(
        &mut self,
        stack: &mut ContextStack,
        shared: &SharedCacheClient,
        entity: &Entity,
        snapshot: &CacheEntry,
        identifiers: &[Identifier],
        stale: &[Identifier],
    ) {
        if self.config.context_enabled {
            stack.invalidate(stale);
            stack.cache_entity(identifiers, entity);
        }

        if self.config.shared_enabled {
            shared.delete_many(stale);
            if stack.in_transaction() {
                shared.delete_many(identifiers);
                self.needs_refresh.extend(identifiers.iter().cloned());
            } else {
                shared.set_many(identifiers, snapshot);
                for identifier in identifiers {
                    self.needs_refresh.remove(identifier);
                }
            }
        }

        debug!(
            key = %entity.key(),
            identifiers = identifiers.len(),
            stale = stale.len(),
            in_transaction = stack.in_transaction(),
            "Recorded write"
        );
    }

    /// Apply a delete to the caches.
    pub fn record_delete(
        &mut self,
        stack: &mut ContextStack,
        shared: &SharedCacheClient,
        identifiers: &[Identifier],
    ) {
        if self.config.context_enabled {
            stack.invalidate(identifiers);
        }

        if self.config.shared_enabled {
            shared.delete_many(identifiers);
            if stack.in_transaction() {
                self.needs_refresh.extend(identifiers.iter().cloned());
            }
        }

        debug!(
            identifiers = identifiers.len(),
            in_transaction = stack.in_transaction(),
            "Recorded delete"
        );
    }
}
