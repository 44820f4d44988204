//! Configuration types

use crate::{CacheError, CacheResult, ConfigError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of entities of one result set that populate the caches.
pub const DEFAULT_MAX_ENTITY_COUNT: usize = 8;

/// Cache layer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Use the per-unit-of-work context cache.
    pub context_enabled: bool,
    /// Use the process-wide shared cache.
    pub shared_enabled: bool,
    /// Only the first `max_entity_count` entities of a result set are cached.
    pub max_entity_count: usize,
    /// Expiry passed to the shared cache on every set.
    pub shared_ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            context_enabled: true,
            shared_enabled: true,
            max_entity_count: DEFAULT_MAX_ENTITY_COUNT,
            shared_ttl: None,
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the context cache.
    pub fn with_context(mut self, enabled: bool) -> Self {
        self.context_enabled = enabled;
        self
    }

    /// Enable or disable the shared cache.
    pub fn with_shared(mut self, enabled: bool) -> Self {
        self.shared_enabled = enabled;
        self
    }

    /// Set the per-result-set cache population limit.
    pub fn with_max_entity_count(mut self, max: usize) -> Self {
        self.max_entity_count = max;
        self
    }

    /// Set the shared cache expiry.
    pub fn with_shared_ttl(mut self, ttl: Duration) -> Self {
        self.shared_ttl = Some(ttl);
        self
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `ENTCACHE_CONTEXT_ENABLED`: use the context cache (default: true)
    /// - `ENTCACHE_SHARED_ENABLED`: use the shared cache (default: true)
    /// - `ENTCACHE_MAX_ENTITY_COUNT`: entities cached per result set (default: 8)
    /// - `ENTCACHE_SHARED_TTL_SECS`: shared cache expiry in seconds (default: none)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            context_enabled: std::env::var("ENTCACHE_CONTEXT_ENABLED")
                .ok()
                .and_then(|s| parse_flag(&s))
                .unwrap_or(defaults.context_enabled),
            shared_enabled: std::env::var("ENTCACHE_SHARED_ENABLED")
                .ok()
                .and_then(|s| parse_flag(&s))
                .unwrap_or(defaults.shared_enabled),
            max_entity_count: std::env::var("ENTCACHE_MAX_ENTITY_COUNT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_entity_count),
            shared_ttl: std::env::var("ENTCACHE_SHARED_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .or(defaults.shared_ttl),
        }
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - max_entity_count > 0
    /// - shared_ttl, when set, is positive
    pub fn validate(&self) -> CacheResult<()> {
        if self.max_entity_count == 0 {
            return Err(CacheError::Config(ConfigError::InvalidValue {
                field: "max_entity_count".to_string(),
                value: self.max_entity_count.to_string(),
                reason: "max_entity_count must be greater than 0".to_string(),
            }));
        }

        if let Some(ttl) = self.shared_ttl {
            if ttl.is_zero() {
                return Err(CacheError::Config(ConfigError::InvalidValue {
                    field: "shared_ttl".to_string(),
                    value: format!("{:?}", ttl),
                    reason: "shared_ttl must be positive".to_string(),
                }));
            }
        }

        Ok(())
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
