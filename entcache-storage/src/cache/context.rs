//! Transaction-aware context cache.
//!
//! One [`ContextStack`] lives for one unit of work (a request or a worker
//! thread). Its base level holds what the unit of work has seen outside any
//! transaction; every transaction entry pushes a copy of the current top and
//! every exit pops it again, either replaying the writes staged inside it
//! onto the enclosing level (commit) or dropping them (rollback).
//!
//! Levels never share state: a push deep-copies the snapshots of the level
//! below, so rolling back is just discarding the top level.

use std::collections::HashMap;

use entcache_core::{CacheEntry, CacheResult, ContextError, Entity, Identifier};
use tracing::debug;

/// A mutation recorded at a level, pending propagation to the level below.
#[derive(Debug, Clone, PartialEq)]
pub enum StagedOp {
    /// Merge `entity` into the snapshot stored under every identifier.
    Cache {
        identifiers: Vec<Identifier>,
        entity: Entity,
    },
    /// Drop the snapshots stored under the identifiers.
    Invalidate { identifiers: Vec<Identifier> },
}

impl StagedOp {
    pub fn identifiers(&self) -> &[Identifier] {
        match self {
            Self::Cache { identifiers, .. } | Self::Invalidate { identifiers } => identifiers,
        }
    }
}

/// One frame of the stack.
#[derive(Debug, Clone, Default)]
pub struct ContextLevel {
    cache: HashMap<Identifier, CacheEntry>,
    staged: Vec<StagedOp>,
}

impl ContextLevel {
    /// Readable view at this depth.
    pub fn cache(&self) -> &HashMap<Identifier, CacheEntry> {
        &self.cache
    }

    pub fn get(&self, identifier: &Identifier) -> Option<&CacheEntry> {
        self.cache.get(identifier)
    }

    pub fn contains(&self, identifier: &Identifier) -> bool {
        self.cache.contains_key(identifier)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Mutations recorded here that have not been merged outward.
    pub fn staged(&self) -> &[StagedOp] {
        &self.staged
    }

    /// Copy of this level's snapshots with nothing staged.
    fn fork(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            staged: Vec::new(),
        }
    }

    fn apply(&mut self, op: &StagedOp) {
        match op {
            StagedOp::Cache {
                identifiers,
                entity,
            } => {
                // All identifiers of one entity share one merged snapshot.
                let mut snapshot = identifiers
                    .iter()
                    .filter_map(|id| self.cache.get(id))
                    .find(|entry| entry.key() == entity.key())
                    .cloned()
                    .unwrap_or_else(|| CacheEntry::empty(entity.key().clone()));
                snapshot.merge(entity);

                for id in identifiers {
                    self.cache.insert(id.clone(), snapshot.clone());
                }
            }
            StagedOp::Invalidate { identifiers } => {
                for id in identifiers {
                    self.cache.remove(id);
                }
            }
        }
    }

    fn record(&mut self, op: StagedOp) {
        self.apply(&op);
        self.staged.push(op);
    }
}

/// Stack of context levels, one per open transaction plus the base level.
///
/// The base level is held separately so the stack can never be empty.
#[derive(Debug, Clone, Default)]
pub struct ContextStack {
    base: ContextLevel,
    nested: Vec<ContextLevel>,
}

impl ContextStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of levels, base included. Always at least 1.
    pub fn size(&self) -> usize {
        self.nested.len() + 1
    }

    /// Number of open transactions.
    pub fn transaction_depth(&self) -> usize {
        self.nested.len()
    }

    pub fn in_transaction(&self) -> bool {
        !self.nested.is_empty()
    }

    /// The current context cache.
    pub fn top(&self) -> &ContextLevel {
        self.nested.last().unwrap_or(&self.base)
    }

    fn top_mut(&mut self) -> &mut ContextLevel {
        self.nested.last_mut().unwrap_or(&mut self.base)
    }

    /// Number of staged operations at the current top.
    pub fn staged_count(&self) -> usize {
        self.top().staged.len()
    }

    /// Snapshot visible at the current top.
    pub fn get(&self, identifier: &Identifier) -> Option<&CacheEntry> {
        self.top().get(identifier)
    }

    /// Enter a transaction: push a copy of the current top.
    pub fn push(&mut self) {
        let level = self.top().fork();
        self.nested.push(level);
        debug!(depth = self.transaction_depth(), "Pushed context level");
    }

    /// Leave a transaction.
    ///
    /// With `apply_staged` the popped level's staged operations are replayed,
    /// in recorded order, onto the new top and recorded there so a further
    /// commit carries them outward again. Without it they are discarded and
    /// the new top is exactly what it was before the matching push.
    ///
    /// `clear_staged` replays onto the base level without staging and empties
    /// whatever the base still holds. Without it the replayed operations are
    /// kept at the base for the caller to inspect.
    ///
    /// Popping the base level is a [`ContextError::EmptyStack`].
    pub fn pop(&mut self, apply_staged: bool, clear_staged: bool) -> CacheResult<()> {
        let popped = self.nested.pop().ok_or(ContextError::EmptyStack)?;
        let replayed = popped.staged.len();

        if apply_staged {
            let at_base = self.nested.is_empty();
            let top = self.top_mut();
            for op in popped.staged {
                if clear_staged && at_base {
                    top.apply(&op);
                } else {
                    top.record(op);
                }
            }
            if clear_staged && at_base {
                top.staged.clear();
            }
        }

        debug!(
            depth = self.transaction_depth(),
            apply_staged,
            staged = replayed,
            "Popped context level"
        );
        Ok(())
    }

    /// Cache `entity` under every identifier at the current top.
    pub fn cache_entity(&mut self, identifiers: &[Identifier], entity: &Entity) {
        if identifiers.is_empty() {
            return;
        }
        self.record(StagedOp::Cache {
            identifiers: identifiers.to_vec(),
            entity: entity.clone(),
        });
    }

    /// Drop the snapshots stored under `identifiers` at the current top.
    pub fn invalidate(&mut self, identifiers: &[Identifier]) {
        if identifiers.is_empty() {
            return;
        }
        self.record(StagedOp::Invalidate {
            identifiers: identifiers.to_vec(),
        });
    }

    /// Apply `op` at the top. Only a transaction level stages it: the base
    /// level has no parent to replay into, so staging there would only grow.
    fn record(&mut self, op: StagedOp) {
        match self.nested.last_mut() {
            Some(level) => level.record(op),
            None => self.base.apply(&op),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entcache_core::{CacheError, Key, Value};
    use std::collections::BTreeMap;

    fn ids(raw: &[&str]) -> Vec<Identifier> {
        raw.iter().map(|r| Identifier::from(*r)).collect()
    }

    fn fields(entry: &CacheEntry) -> BTreeMap<String, Value> {
        entry.fields().clone()
    }

    #[test]
    fn test_new_stack_has_empty_base() {
        let stack = ContextStack::new();
        assert_eq!(stack.size(), 1);
        assert!(!stack.in_transaction());
        assert!(stack.top().is_empty());
    }

    #[test]
    fn test_push_pop() {
        let mut stack = ContextStack::new();
        let entity = Entity::new(Key::new("table")).with("bananas", 1);

        stack.cache_entity(&ids(&["bananas:1"]), &entity);
        let bananas = Identifier::from("bananas:1");
        assert_eq!(stack.get(&bananas).unwrap().get("bananas"), Some(&Value::Int(1)));

        stack.push();
        assert_eq!(stack.get(&bananas).unwrap().get("bananas"), Some(&Value::Int(1)));
        assert_eq!(stack.size(), 2);

        stack.push();
        stack.cache_entity(&ids(&["apples:2"]), &entity);
        let mut keys: Vec<_> = stack.top().cache().keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, ids(&["apples:2", "bananas:1"]));

        // Rolled back: the inner write vanishes.
        stack.pop(false, false).unwrap();
        let keys: Vec<_> = stack.top().cache().keys().cloned().collect();
        assert_eq!(keys, ids(&["bananas:1"]));
        assert_eq!(stack.size(), 2);
        assert_eq!(stack.staged_count(), 0);

        let updated = Entity::new(entity.key().clone()).with("bananas", 3);
        stack.cache_entity(&ids(&["bananas:1"]), &updated);
        assert_eq!(stack.staged_count(), 1);

        stack.pop(true, true).unwrap();
        assert_eq!(stack.size(), 1);
        assert_eq!(stack.get(&bananas).unwrap().get("bananas"), Some(&Value::Int(3)));
        assert_eq!(stack.staged_count(), 0);
    }

    #[test]
    fn test_property_deletion() {
        let mut stack = ContextStack::new();
        let mut entity = Entity::new(Key::new("table"))
            .with("field1", "one")
            .with("field2", "two");
        let id = ids(&["entity"]);

        stack.cache_entity(&id, &entity);

        stack.push();
        entity.set("field1", "oneone");
        entity.remove("field2");
        stack.cache_entity(&id, &entity);
        stack.pop(true, true).unwrap();

        let mut expected = BTreeMap::new();
        expected.insert("field1".to_string(), Value::from("oneone"));
        assert_eq!(fields(stack.get(&id[0]).unwrap()), expected);
    }

    #[test]
    fn test_untouched_fields_survive_partial_write() {
        let mut stack = ContextStack::new();
        let key = Key::new("table");
        let id = ids(&["e"]);
        stack.cache_entity(&id, &Entity::new(key.clone()).with("a", 1).with("b", 2));
        stack.cache_entity(&id, &Entity::new(key).with("a", 10));

        let entry = stack.get(&id[0]).unwrap();
        assert_eq!(entry.get("a"), Some(&Value::Int(10)));
        assert_eq!(entry.get("b"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_pop_base_level_fails() {
        let mut stack = ContextStack::new();
        let err = stack.pop(true, true).unwrap_err();
        assert_eq!(err, CacheError::from(ContextError::EmptyStack));
        assert_eq!(stack.size(), 1);
    }

    #[test]
    fn test_rollback_leaves_outer_level_untouched() {
        let mut stack = ContextStack::new();
        let key = Key::new("table");
        let id = ids(&["e"]);
        stack.cache_entity(&id, &Entity::new(key.clone()).with("a", 1));
        let before = stack.top().cache().clone();
        let staged_before = stack.staged_count();

        stack.push();
        stack.cache_entity(&id, &Entity::new(key.clone()).with("a", 2));
        stack.cache_entity(&ids(&["other"]), &Entity::new(Key::new("table")).with("x", 1));
        stack.invalidate(&id);
        stack.pop(false, true).unwrap();

        assert_eq!(stack.top().cache(), &before);
        assert_eq!(stack.staged_count(), staged_before);
    }

    #[test]
    fn test_push_copies_instead_of_sharing() {
        let mut stack = ContextStack::new();
        let key = Key::new("table");
        let id = ids(&["e"]);
        stack.cache_entity(&id, &Entity::new(key.clone()).with("a", 1));

        stack.push();
        stack.cache_entity(&id, &Entity::new(key).with("a", 2));
        assert_eq!(stack.get(&id[0]).unwrap().get("a"), Some(&Value::Int(2)));

        stack.pop(false, true).unwrap();
        assert_eq!(stack.get(&id[0]).unwrap().get("a"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_nested_commit_is_invisible_until_outer_commit() {
        let mut stack = ContextStack::new();
        let key = Key::new("table");
        let id = ids(&["e"]);

        stack.push();
        stack.push();
        stack.cache_entity(&id, &Entity::new(key).with("a", 1));
        // The base level never sees writes of open transactions.
        assert!(stack.base.get(&id[0]).is_none());

        stack.pop(true, true).unwrap();
        assert_eq!(stack.staged_count(), 1);
        assert!(stack.base.get(&id[0]).is_none());

        stack.pop(true, true).unwrap();
        assert_eq!(stack.get(&id[0]).unwrap().get("a"), Some(&Value::Int(1)));
        assert_eq!(stack.staged_count(), 0);
    }

    #[test]
    fn test_nested_rollback_does_not_apply_on_outer_commit() {
        let mut stack = ContextStack::new();
        let key = Key::new("table");

        stack.push();
        stack.cache_entity(&ids(&["kept"]), &Entity::new(key.clone()).with("a", 1));
        stack.push();
        stack.cache_entity(&ids(&["dropped"]), &Entity::new(key).with("a", 2));
        stack.pop(false, true).unwrap();
        stack.pop(true, true).unwrap();

        assert!(stack.top().contains(&Identifier::from("kept")));
        assert!(!stack.top().contains(&Identifier::from("dropped")));
    }

    #[test]
    fn test_invalidate_propagates_on_commit() {
        let mut stack = ContextStack::new();
        let id = ids(&["e"]);
        stack.cache_entity(&id, &Entity::new(Key::new("table")).with("a", 1));

        stack.push();
        stack.invalidate(&id);
        stack.pop(true, true).unwrap();

        assert!(stack.get(&id[0]).is_none());
    }

    #[test]
    fn test_apply_without_clear_keeps_bookkeeping_at_base() {
        let mut stack = ContextStack::new();
        stack.push();
        stack.cache_entity(&ids(&["e"]), &Entity::new(Key::new("table")).with("a", 1));
        stack.pop(true, false).unwrap();
        assert_eq!(stack.staged_count(), 1);
    }

    #[test]
    fn test_replay_creates_missing_identifiers() {
        let mut stack = ContextStack::new();
        stack.push();
        stack.cache_entity(&ids(&["fresh"]), &Entity::new(Key::new("table")).with("a", 1));
        assert!(stack.pop(true, true).is_ok());
        assert!(stack.top().contains(&Identifier::from("fresh")));
    }

    #[test]
    fn test_identifiers_of_one_entity_stay_consistent() {
        let mut stack = ContextStack::new();
        let key = Key::new("table");
        stack.cache_entity(&ids(&["pk"]), &Entity::new(key.clone()).with("a", 1).with("b", 1));
        stack.cache_entity(&ids(&["pk", "unique"]), &Entity::new(key).with("b", 2));

        let by_pk = stack.get(&Identifier::from("pk")).unwrap();
        let by_unique = stack.get(&Identifier::from("unique")).unwrap();
        assert_eq!(by_pk, by_unique);
        assert_eq!(by_unique.get("a"), Some(&Value::Int(1)));
        assert_eq!(by_unique.get("b"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_identifier_taken_over_by_other_entity_is_not_merged() {
        let mut stack = ContextStack::new();
        let id = ids(&["unique"]);
        stack.cache_entity(&id, &Entity::new(Key::new("table")).with("stale", 1));

        let other = Key::new("table");
        stack.cache_entity(&id, &Entity::new(other.clone()).with("a", 1));

        let entry = stack.get(&id[0]).unwrap();
        assert_eq!(entry.key(), &other);
        assert!(entry.get("stale").is_none());
    }

    #[test]
    fn test_empty_identifier_list_is_not_staged() {
        let mut stack = ContextStack::new();
        stack.cache_entity(&[], &Entity::new(Key::new("table")));
        stack.invalidate(&[]);
        assert_eq!(stack.staged_count(), 0);
    }

    #[test]
    fn test_base_level_writes_are_not_staged() {
        let mut stack = ContextStack::new();
        let key = Key::new("table");
        for n in 0..100 {
            let id = ids(&[format!("e{}", n % 5).as_str()]);
            stack.cache_entity(&id, &Entity::new(key.clone()).with("a", n));
            if n % 3 == 0 {
                stack.invalidate(&id);
            }
        }

        assert_eq!(stack.staged_count(), 0);
        assert!(stack.top().staged().is_empty());
        assert!(!stack.top().is_empty());
    }

    #[test]
    fn test_commits_into_base_leave_nothing_staged() {
        let mut stack = ContextStack::new();
        let key = Key::new("table");
        for n in 0..20 {
            stack.push();
            stack.cache_entity(&ids(&["e"]), &Entity::new(key.clone()).with("a", n));
            stack.pop(true, true).unwrap();
            stack.cache_entity(&ids(&["f"]), &Entity::new(key.clone()).with("a", n));
        }

        assert_eq!(stack.staged_count(), 0);
        assert_eq!(stack.get(&Identifier::from("e")).unwrap().get("a"), Some(&Value::Int(19)));
    }
}
