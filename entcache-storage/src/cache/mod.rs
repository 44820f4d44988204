//! Two-tier entity cache with transaction-aware consistency.
//!
//! Consistent reads (by key, or by every field of a unique constraint) are
//! served from a per-unit-of-work context cache, then from a process-wide
//! shared cache, and only then from the datastore. Both tiers hold the same
//! snapshot under every identifier an entity has, so a read by key and a
//! read by unique field hit the same entry.
//!
//! # Transactions
//!
//! The context cache is a stack: opening a transaction pushes a copy of the
//! current level, committing pops it and replays its staged writes onto the
//! level below, rolling back discards it. The shared cache never receives
//! uncommitted state: writes inside a transaction delete its entries
//! instead, and reads inside a transaction never consult either tier.
//!
//! # Example
//!
//! ```ignore
//! let mut stack = ContextStack::new();
//! stack.cache_entity(&ids, &entity);
//!
//! stack.push();
//! stack.cache_entity(&ids, &entity.clone().with("field1", "Banana"));
//! stack.pop(false, true)?; // rolled back, base level unchanged
//! ```

pub mod context;
pub mod identifiers;
pub mod policy;
pub mod read;
pub mod shared;
pub mod traits;

pub use context::{ContextLevel, ContextStack, StagedOp};
pub use identifiers::{HashedIdentifierDeriver, IdentifierDeriver};
pub use policy::{CachePolicy, QueryShape};
pub use read::{CacheRead, CacheTier};
pub use shared::{InMemorySharedCache, SharedCacheClient};
pub use traits::{CacheStats, SharedCache};
