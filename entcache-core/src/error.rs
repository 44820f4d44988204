//! Error types for entcache operations

use thiserror::Error;

/// Context cache stack errors.
///
/// These indicate a transaction-tracking bug in the caller and are never
/// recovered from.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("Cannot pop the base context level: no transaction is open")]
    EmptyStack,
}

/// Identifier derivation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("No model schema registered for kind {kind}")]
    UnknownModel { kind: String },

    #[error("Unique field {field} missing on {kind}")]
    MissingUniqueField { kind: String, field: String },
}

/// Shared cache errors.
///
/// Only the shared cache client ever sees these; it logs them and carries on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SharedCacheError {
    #[error("Shared cache unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Shared cache timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Shared cache serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Shared cache lock poisoned")]
    LockPoisoned,
}

/// Datastore errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DatastoreError {
    #[error("Datastore operation failed: {reason}")]
    Failed { reason: String },

    #[error("Datastore lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all entcache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Identifier error: {0}")]
    Identifier(#[from] IdentifierError),

    #[error("Shared cache error: {0}")]
    SharedCache(#[from] SharedCacheError),

    #[error("Datastore error: {0}")]
    Datastore(#[from] DatastoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for entcache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================
