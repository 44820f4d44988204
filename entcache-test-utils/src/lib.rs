//! entcache Test Utilities
//!
//! Centralized test infrastructure for the entcache workspace:
//! - Proptest generators for values, entities and context stack operations
//! - A failure-injecting shared cache backend
//! - Test fixtures for common scenarios
//! - Custom assertions for cache provenance and errors

// Re-export the storage-side types tests need most
pub use entcache_storage::{
    CacheRead, CacheStats, CacheTier, ContextStack, Datastore, HashedIdentifierDeriver,
    IdentifierDeriver, InMemorySharedCache, MockDatastore, QueryShape, Session, SharedCache,
    SharedCacheClient, TransactionHooks,
};

// Re-export core types for convenience
pub use entcache_core::{
    CacheConfig, CacheEntry, CacheError, CacheResult, ContextError, Entity, Identifier, Key,
    ModelSchema, Query, SharedCacheError, Value,
};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

// ============================================================================
// LOGGING
// ============================================================================

static TRACING: Once = Once::new();

/// Install a test-friendly subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to debug output for the entcache crates.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("entcache_storage=debug,entcache_core=debug,warn")
        });
        // Another harness may already own the global subscriber.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// FAILURE INJECTION
// ============================================================================

/// Shared cache backend that can be switched off mid-test.
///
/// While down, every call fails with [`SharedCacheError::Unavailable`]. The
/// wrapped in-memory store keeps its contents across outages.
#[derive(Debug, Default)]
pub struct FlakySharedCache {
    inner: InMemorySharedCache,
    down: AtomicBool,
    calls_failed: AtomicU64,
}

impl FlakySharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start failing every call.
    pub fn go_down(&self) {
        self.down.store(true, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.down.store(false, Ordering::SeqCst);
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }

    /// Number of calls rejected while down.
    pub fn calls_failed(&self) -> u64 {
        self.calls_failed.load(Ordering::SeqCst)
    }

    /// The backing store, bypassing failure injection.
    pub fn inner(&self) -> &InMemorySharedCache {
        &self.inner
    }

    fn check(&self) -> CacheResult<()> {
        if self.is_down() {
            self.calls_failed.fetch_add(1, Ordering::SeqCst);
            return Err(SharedCacheError::Unavailable {
                reason: "injected outage".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

impl SharedCache for FlakySharedCache {
    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.check()?;
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()> {
        self.check()?;
        self.inner.set(key, value, ttl)
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        self.check()?;
        self.inner.delete(key)
    }

    fn clear(&self) -> CacheResult<()> {
        self.check()?;
        self.inner.clear()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating entcache types.

    use super::*;
    use proptest::prelude::*;

    /// Generate a scalar field value (no keys or lists).
    pub fn arb_scalar_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            (-1.0e6f64..1.0e6).prop_map(Value::Float),
            "[a-zA-Z0-9 ]{0,16}".prop_map(Value::Text),
            prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
        ]
    }

    /// Generate any field value, including one level of lists.
    pub fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            4 => arb_scalar_value(),
            1 => prop::collection::vec(arb_scalar_value(), 0..4).prop_map(Value::List),
        ]
    }

    /// Generate a non-null value usable in a unique field.
    pub fn arb_unique_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<i64>().prop_map(Value::Int),
            "[a-zA-Z]{1,12}".prop_map(Value::Text),
        ]
    }

    /// Generate a field name.
    pub fn arb_field_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,10}"
    }

    /// Generate an optional namespace.
    pub fn arb_namespace() -> impl Strategy<Value = Option<String>> {
        prop::option::of("[a-z]{1,8}")
    }

    /// Generate a fresh key for `kind`.
    pub fn arb_key(kind: &'static str) -> impl Strategy<Value = Key> {
        arb_namespace().prop_map(move |ns| {
            let key = Key::new(kind);
            match ns {
                Some(ns) => key.in_namespace(ns),
                None => key,
            }
        })
    }

    /// Generate an entity of the caching test model with arbitrary extra fields.
    pub fn arb_caching_test_entity() -> impl Strategy<Value = Entity> {
        (
            arb_unique_value(),
            any::<i64>(),
            "[A-Z][a-z]{2,8}",
            prop::collection::btree_map("x_[a-z]{1,6}", arb_value(), 0..4),
        )
            .prop_map(|(field1, comb1, comb2, extra)| {
                let mut entity = fixtures::caching_test_entity(field1, comb1, comb2);
                for (field, value) in extra {
                    entity.set(field, value);
                }
                entity
            })
    }

    /// One step applied to a [`ContextStack`].
    #[derive(Debug, Clone)]
    pub enum StackStep {
        Push,
        Commit,
        Rollback,
        /// Write `value` to field `field` of entity number `slot`.
        Write { slot: usize, field: String, value: Value },
        /// Drop entity number `slot` from the top level.
        Invalidate { slot: usize },
    }

    /// Generate a sequence of stack steps over `slots` entities.
    pub fn arb_stack_steps(slots: usize, max_len: usize) -> impl Strategy<Value = Vec<StackStep>> {
        let step = prop_oneof![
            2 => Just(StackStep::Push),
            1 => Just(StackStep::Commit),
            1 => Just(StackStep::Rollback),
            4 => (0..slots, arb_field_name(), arb_scalar_value())
                .prop_map(|(slot, field, value)| StackStep::Write { slot, field, value }),
            1 => (0..slots).prop_map(|slot| StackStep::Invalidate { slot }),
        ];
        prop::collection::vec(step, 0..max_len)
    }

    /// Generate a valid cache configuration.
    pub fn arb_valid_config() -> impl Strategy<Value = CacheConfig> {
        (
            any::<bool>(),
            any::<bool>(),
            1usize..64,
            prop::option::of(1u64..86_400),
        )
            .prop_map(|(context, shared, max, ttl)| {
                let config = CacheConfig::default()
                    .with_context(context)
                    .with_shared(shared)
                    .with_max_entity_count(max);
                match ttl {
                    Some(secs) => config.with_shared_ttl(Duration::from_secs(secs)),
                    None => config,
                }
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;

    pub const CACHING_TEST_MODEL: &str = "CachingTestModel";

    /// Model with `field1` unique and `(comb1, comb2)` unique together.
    pub fn caching_test_model() -> ModelSchema {
        ModelSchema::new(CACHING_TEST_MODEL)
            .unique("field1")
            .unique_together(["comb1", "comb2"])
    }

    /// A new, unsaved caching test entity.
    pub fn caching_test_entity(
        field1: impl Into<Value>,
        comb1: impl Into<Value>,
        comb2: impl Into<Value>,
    ) -> Entity {
        Entity::new(Key::new(CACHING_TEST_MODEL))
            .with("field1", field1)
            .with("comb1", comb1)
            .with("comb2", comb2)
    }

    /// The entity most scenarios start from.
    pub fn apple() -> Entity {
        caching_test_entity("Apple", 1, "Cherry")
    }

    /// Process-wide state shared by every session: the datastore and the
    /// shared cache backend.
    pub struct CacheHarness {
        pub datastore: Arc<MockDatastore>,
        pub backend: Arc<FlakySharedCache>,
        pub shared: SharedCacheClient,
        pub config: CacheConfig,
    }

    impl CacheHarness {
        pub fn new() -> Self {
            Self::with_config(CacheConfig::default())
        }

        pub fn with_config(config: CacheConfig) -> Self {
            init_test_tracing();
            let backend = Arc::new(FlakySharedCache::new());
            Self {
                datastore: Arc::new(MockDatastore::new()),
                shared: SharedCacheClient::new(backend.clone()),
                backend,
                config,
            }
        }

        /// Open a new unit of work with the caching test model registered.
        pub fn session(&self) -> Session<MockDatastore> {
            match Session::new(self.datastore.clone(), self.shared.clone(), self.config.clone()) {
                Ok(session) => session.with_model(caching_test_model()),
                Err(err) => panic!("harness config rejected: {}", err),
            }
        }

        /// Whether the shared cache holds anything under `identifier`.
        pub fn shared_contains(&self, identifier: &Identifier) -> bool {
            self.backend.inner().contains(identifier.as_str())
        }

        /// Every identifier of `entity` under the default deriver.
        pub fn identifiers(&self, entity: &Entity) -> Vec<Identifier> {
            match HashedIdentifierDeriver::new().all_identifiers(&caching_test_model(), entity) {
                Ok(identifiers) => identifiers,
                Err(err) => panic!("fixture entity lacks unique fields: {}", err),
            }
        }
    }

    impl Default for CacheHarness {
        fn default() -> Self {
            Self::new()
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertion functions for cache provenance and errors.

    use super::*;

    /// Assert that a read was served by the given tier.
    #[track_caller]
    pub fn assert_served_by<T: std::fmt::Debug>(read: &Option<CacheRead<T>>, tier: CacheTier) {
        match read {
            Some(read) => assert_eq!(read.tier(), tier, "Read served by wrong tier: {:?}", read),
            None => panic!("Expected a read served by {:?}, got nothing", tier),
        }
    }

    /// Assert that a CacheResult is an empty-stack error.
    #[track_caller]
    pub fn assert_empty_stack<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::Context(ContextError::EmptyStack)) => {}
            other => panic!("Expected EmptyStack error, got: {:?}", other),
        }
    }

    /// Assert that two snapshots hold the same key and fields.
    #[track_caller]
    pub fn assert_same_snapshot(a: &Entity, b: &Entity) {
        assert_eq!(a.to_entry(), b.to_entry(), "Snapshots differ");
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_flaky_cache_fails_only_while_down() {
        let cache = FlakySharedCache::new();
        cache.set("a", b"1".to_vec(), None).unwrap();

        cache.go_down();
        assert!(cache.get("a").is_err());
        assert!(cache.set("b", b"1".to_vec(), None).is_err());
        assert_eq!(cache.calls_failed(), 2);

        cache.recover();
        assert_eq!(cache.get("a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(cache.get("b").unwrap(), None);
    }

    #[test]
    fn test_harness_sessions_share_state() {
        let harness = fixtures::CacheHarness::new();
        let entity = fixtures::apple();
        harness.session().save(&entity).unwrap();

        let ids = harness.identifiers(&entity);
        assert!(ids.iter().all(|id| harness.shared_contains(id)));
        assert_eq!(harness.datastore.len(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_generated_config_is_valid(config in generators::arb_valid_config()) {
            prop_assert!(config.validate().is_ok());
        }

        #[test]
        fn prop_generated_entity_has_all_identifiers(entity in generators::arb_caching_test_entity()) {
            let ids = HashedIdentifierDeriver::new()
                .all_identifiers(&fixtures::caching_test_model(), &entity)
                .unwrap();
            prop_assert_eq!(ids.len(), 3);
        }
    }
}
