//! Unit of work.
//!
//! A [`Session`] is what an ORM layer holds for the duration of one request
//! or task. It owns the context cache stack and the policy state, shares the
//! datastore and shared cache with every other session, and routes each
//! save, delete, get and query through the cache policy.

use std::collections::HashMap;
use std::sync::Arc;

use entcache_core::{
    CacheConfig, CacheEntry, CacheResult, Entity, Identifier, IdentifierError, Key, ModelSchema,
    Query,
};
use tracing::{debug, warn};

use crate::cache::{
    CachePolicy, CacheRead, CacheStats, CacheTier, ContextStack, HashedIdentifierDeriver,
    IdentifierDeriver, QueryShape, SharedCacheClient,
};
use crate::transaction::TransactionHooks;
use crate::Datastore;

fn schema_for<'a>(
    schemas: &'a HashMap<String, ModelSchema>,
    kind: &str,
) -> CacheResult<&'a ModelSchema> {
    schemas.get(kind).ok_or_else(|| {
        IdentifierError::UnknownModel {
            kind: kind.to_string(),
        }
        .into()
    })
}

fn apply_limit(mut entries: Vec<CacheEntry>, limit: Option<usize>) -> Vec<CacheEntry> {
    if let Some(limit) = limit {
        entries.truncate(limit);
    }
    entries
}

/// Per-unit-of-work cache handle.
pub struct Session<D: Datastore> {
    datastore: Arc<D>,
    shared: SharedCacheClient,
    deriver: Arc<dyn IdentifierDeriver>,
    schemas: HashMap<String, ModelSchema>,
    stack: ContextStack,
    policy: CachePolicy,
}

impl<D: Datastore> Session<D> {
    /// Open a session. Fails if `config` is invalid.
    pub fn new(datastore: Arc<D>, shared: SharedCacheClient, config: CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        let shared = shared.with_ttl(config.shared_ttl);
        Ok(Self {
            datastore,
            shared,
            deriver: Arc::new(HashedIdentifierDeriver::new()),
            schemas: HashMap::new(),
            stack: ContextStack::new(),
            policy: CachePolicy::new(config),
        })
    }

    /// Replace the identifier deriver.
    pub fn with_deriver(mut self, deriver: Arc<dyn IdentifierDeriver>) -> Self {
        self.deriver = deriver;
        self
    }

    pub fn with_model(mut self, schema: ModelSchema) -> Self {
        self.register_model(schema);
        self
    }

    /// Make a model's unique constraints known. Re-registering a kind
    /// replaces its schema.
    pub fn register_model(&mut self, schema: ModelSchema) {
        debug!(
            kind = schema.kind(),
            constraints = schema.constraints().len(),
            "Registered model"
        );
        self.schemas.insert(schema.kind().to_string(), schema);
    }

    pub fn context(&self) -> &ContextStack {
        &self.stack
    }

    pub fn datastore(&self) -> &Arc<D> {
        &self.datastore
    }

    pub fn shared(&self) -> &SharedCacheClient {
        &self.shared
    }

    pub fn config(&self) -> &CacheConfig {
        self.policy.config()
    }

    /// Read statistics, including swallowed shared cache failures.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            shared_failures: self.shared.failures(),
            ..self.policy.stats().clone()
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.stack.in_transaction()
    }

    // === Transactions ===

    pub fn begin(&mut self) {
        self.stack.on_begin();
    }

    pub fn commit(&mut self) -> CacheResult<()> {
        self.stack.on_commit()
    }

    pub fn rollback(&mut self) -> CacheResult<()> {
        self.stack.on_rollback()
    }

    /// Run `f` inside a transaction, committing on `Ok` and rolling back on
    /// `Err`. Nests.
    pub fn atomic<T, F>(&mut self, f: F) -> CacheResult<T>
    where
        F: FnOnce(&mut Self) -> CacheResult<T>,
    {
        self.begin();
        match f(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                self.rollback()?;
                Err(err)
            }
        }
    }

    // === Writes ===

    /// Persist `entity` and update the caches.
    ///
    /// Fields present on `entity` overwrite the stored ones, tombstoned
    /// fields are removed, everything else is kept. Returns the stored
    /// snapshot.
    pub fn save(&mut self, entity: &Entity) -> CacheResult<CacheEntry> {
        let schema = schema_for(&self.schemas, entity.key().kind())?;
        let previous = self.datastore.get(entity.key())?;

        let mut stored = previous
            .clone()
            .unwrap_or_else(|| CacheEntry::empty(entity.key().clone()));
        stored.merge(entity);

        let mut written = Entity::from(stored.clone());
        for field in entity.removed() {
            written.remove(field);
        }
        let identifiers = self.deriver.all_identifiers(schema, &written)?;

        // Identifiers the entity no longer answers to.
        let stale: Vec<Identifier> = match previous {
            Some(previous) => self
                .stored_identifiers(schema, previous)
                .into_iter()
                .filter(|id| !identifiers.contains(id))
                .collect(),
            None => Vec::new(),
        };

        self.datastore.put(&stored)?;
        self.policy.record_write(
            &mut self.stack,
            &self.shared,
            &written,
            &stored,
            &identifiers,
            &stale,
        );
        Ok(stored)
    }

    /// Delete the entity stored under `key` and drop it from the caches.
    pub fn delete(&mut self, key: &Key) -> CacheResult<()> {
        let schema = schema_for(&self.schemas, key.kind())?;
        let identifiers = match self.datastore.get(key)? {
            Some(previous) => self.stored_identifiers(schema, previous),
            None => vec![self.deriver.key_identifier(key)],
        };

        self.datastore.delete(key)?;
        self.policy
            .record_delete(&mut self.stack, &self.shared, &identifiers);
        Ok(())
    }

    // === Reads ===

    pub fn get(&mut self, key: &Key) -> CacheResult<Option<Entity>> {
        Ok(self.fetch(key)?.map(|read| Entity::from(read.into_value())))
    }

    /// Like [`get`](Self::get), but reports which tier served the read.
    pub fn fetch(&mut self, key: &Key) -> CacheResult<Option<CacheRead<CacheEntry>>> {
        Ok(self
            .fetch_many(std::slice::from_ref(key))?
            .pop()
            .flatten())
    }

    pub fn get_multi(&mut self, keys: &[Key]) -> CacheResult<Vec<Option<Entity>>> {
        Ok(self
            .fetch_many(keys)?
            .into_iter()
            .map(|read| read.map(|read| Entity::from(read.into_value())))
            .collect())
    }

    /// Resolve each key from cache where allowed; fetch the rest with one
    /// datastore call. Results are in key order.
    pub fn fetch_many(&mut self, keys: &[Key]) -> CacheResult<Vec<Option<CacheRead<CacheEntry>>>> {
        for key in keys {
            schema_for(&self.schemas, key.kind())?;
        }

        let mut results: Vec<Option<CacheRead<CacheEntry>>> = Vec::with_capacity(keys.len());
        let mut missing = Vec::new();
        let mut warmed = Vec::new();

        for (index, key) in keys.iter().enumerate() {
            let identifier = self.deriver.key_identifier(key);
            let hit = self
                .policy
                .lookup(&self.stack, &self.shared, &identifier, |entry| entry.key() == key);
            match &hit {
                Some(read) if read.tier() == CacheTier::Shared => {
                    if let Some(identifiers) = self.read_identifiers(read.value()) {
                        warmed.push((identifiers, read.value().clone()));
                    }
                }
                Some(_) => {}
                None => missing.push(index),
            }
            results.push(hit);
        }

        if !warmed.is_empty() {
            self.policy
                .record_read(&mut self.stack, &self.shared, CacheTier::Shared, &warmed);
        }

        if !missing.is_empty() {
            let missing_keys: Vec<Key> = missing.iter().map(|&i| keys[i].clone()).collect();
            let fetched = self.datastore.get_multi(&missing_keys)?;

            let mut populated = Vec::new();
            for (index, entry) in missing.into_iter().zip(fetched) {
                if let Some(entry) = entry {
                    if let Some(identifiers) = self.read_identifiers(&entry) {
                        populated.push((identifiers, entry.clone()));
                    }
                    results[index] = Some(CacheRead::new(entry, CacheTier::Datastore));
                }
            }
            self.policy
                .record_read(&mut self.stack, &self.shared, CacheTier::Datastore, &populated);
        }

        Ok(results)
    }

    /// Run a query, consulting the caches only when its shape allows.
    pub fn run_query(&mut self, query: &Query) -> CacheResult<Vec<Entity>> {
        let schema = schema_for(&self.schemas, &query.kind)?;
        let shape = QueryShape::classify(query, schema, self.deriver.as_ref());
        debug!(kind = %query.kind, shape = ?shape, "Running query");

        let entries = match shape {
            QueryShape::ByKey(keys) => self
                .fetch_many(&keys)?
                .into_iter()
                .flatten()
                .map(CacheRead::into_value)
                .filter(|entry| query.matches(entry))
                .collect(),
            QueryShape::Unique { identifier } => self.unique_query(query, &identifier)?,
            QueryShape::Eventual | QueryShape::Projection => self.datastore.run_query(query)?,
        };

        Ok(apply_limit(entries, query.limit)
            .into_iter()
            .map(Entity::from)
            .collect())
    }

    fn unique_query(&mut self, query: &Query, identifier: &Identifier) -> CacheResult<Vec<CacheEntry>> {
        let hit = self
            .policy
            .lookup(&self.stack, &self.shared, identifier, |entry| query.matches(entry));
        if let Some(read) = hit {
            if read.tier() == CacheTier::Shared {
                if let Some(identifiers) = self.read_identifiers(read.value()) {
                    self.policy.record_read(
                        &mut self.stack,
                        &self.shared,
                        CacheTier::Shared,
                        &[(identifiers, read.value().clone())],
                    );
                }
            }
            return Ok(vec![read.into_value()]);
        }

        // The index may lag; only the keys come from the query, the entities
        // themselves from a consistent get.
        let keys: Vec<Key> = self
            .datastore
            .run_query(&query.clone().keys_only())?
            .into_iter()
            .map(|entry| entry.key().clone())
            .collect();
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let entries: Vec<CacheEntry> = self
            .datastore
            .get_multi(&keys)?
            .into_iter()
            .flatten()
            .filter(|entry| query.matches(entry))
            .collect();

        if let [entry] = entries.as_slice() {
            if let Some(identifiers) = self.read_identifiers(entry) {
                self.policy.record_read(
                    &mut self.stack,
                    &self.shared,
                    CacheTier::Datastore,
                    &[(identifiers, entry.clone())],
                );
            }
        }
        Ok(entries)
    }

    fn identifiers_of(&self, entry: &CacheEntry) -> CacheResult<Vec<Identifier>> {
        let schema = schema_for(&self.schemas, entry.key().kind())?;
        self.deriver
            .all_identifiers(schema, &Entity::from(entry.clone()))
    }

    /// Identifiers to populate for a snapshot that was read. A snapshot the
    /// schema cannot fully address is still served, just not cached.
    fn read_identifiers(&self, entry: &CacheEntry) -> Option<Vec<Identifier>> {
        match self.identifiers_of(entry) {
            Ok(identifiers) => Some(identifiers),
            Err(err) => {
                warn!(key = %entry.key(), error = %err, "Read not cached");
                None
            }
        }
    }

    /// Identifiers a stored snapshot answers to, for invalidation. Constraints
    /// the snapshot cannot satisfy are skipped instead of failing the write.
    fn stored_identifiers(&self, schema: &ModelSchema, entry: CacheEntry) -> Vec<Identifier> {
        let entity = Entity::from(entry);
        match self.deriver.all_identifiers(schema, &entity) {
            Ok(identifiers) => identifiers,
            Err(err) => {
                warn!(
                    key = %entity.key(),
                    error = %err,
                    "Stored snapshot only partly addressable"
                );
                self.deriver.available_identifiers(schema, &entity)
            }
        }
    }
}
