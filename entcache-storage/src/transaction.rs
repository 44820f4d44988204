//! Transaction lifecycle hooks.
//!
//! The datastore's transaction machinery drives these; the context stack is
//! the only implementor the cache layer needs.

use entcache_core::CacheResult;
use tracing::debug;

use crate::cache::ContextStack;

/// Callbacks fired as a datastore transaction opens and closes.
pub trait TransactionHooks {
    /// A transaction (possibly nested) has begun.
    fn on_begin(&mut self);

    /// The innermost transaction committed.
    fn on_commit(&mut self) -> CacheResult<()>;

    /// The innermost transaction rolled back.
    fn on_rollback(&mut self) -> CacheResult<()>;
}

impl TransactionHooks for ContextStack {
    fn on_begin(&mut self) {
        self.push();
        debug!(depth = self.transaction_depth(), "Transaction began");
    }

    fn on_commit(&mut self) -> CacheResult<()> {
        self.pop(true, true)?;
        debug!(depth = self.transaction_depth(), "Transaction committed");
        Ok(())
    }

    fn on_rollback(&mut self) -> CacheResult<()> {
        self.pop(false, true)?;
        debug!(depth = self.transaction_depth(), "Transaction rolled back");
        Ok(())
    }
}
