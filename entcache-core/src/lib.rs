//! entcache Core - Entity Types
//!
//! Pure data structures shared by the cache layer: values, keys, live
//! entities and their cached snapshots, model schemas, queries, errors and
//! configuration. No caching behaviour lives here.

pub mod config;
pub mod entities;
pub mod error;
pub mod filter;
pub mod identity;
pub mod schema;
pub mod value;

pub use config::{CacheConfig, DEFAULT_MAX_ENTITY_COUNT};
pub use entities::{CacheEntry, Entity, FieldMap, Key};
pub use error::{
    CacheError, CacheResult, ConfigError, ContextError, DatastoreError, IdentifierError,
    SharedCacheError,
};
pub use filter::{Filter, Query, KEY_FIELD};
pub use identity::{
    compute_content_hash, content_digest, new_entity_id, ContentHash, EntityId, Identifier,
    Timestamp,
};
pub use schema::ModelSchema;
pub use value::Value;

// ============================================================================
// TESTS
// ============================================================================
