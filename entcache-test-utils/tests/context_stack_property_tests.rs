//! Property-Based Tests for the Context Cache Stack
//!
//! Random push/commit/rollback/write/invalidate sequences are applied both
//! to a [`ContextStack`] and to a plain model where committing a level
//! replaces its parent and rolling back discards it. After every step the
//! visible snapshot of each entity, under each of its identifiers, must
//! match the model.

use std::collections::BTreeMap;

use entcache_core::FieldMap;
use entcache_test_utils::assertions::assert_empty_stack;
use entcache_test_utils::generators::{arb_stack_steps, StackStep};
use entcache_test_utils::{ContextStack, Entity, Identifier, Key, TransactionHooks};
use proptest::prelude::*;

const SLOTS: usize = 3;

type Level = BTreeMap<usize, FieldMap>;

fn slot_identifiers(slot: usize) -> Vec<Identifier> {
    vec![
        Identifier::from(format!("|m|__key__:{}", slot)),
        Identifier::from(format!("|m|field1:{}", slot)),
    ]
}

fn check(stack: &ContextStack, model: &[Level]) -> Result<(), TestCaseError> {
    prop_assert_eq!(stack.size(), model.len());
    let top = model.last().expect("model never empty");
    for slot in 0..SLOTS {
        let expected = top.get(&slot);
        for identifier in slot_identifiers(slot) {
            let actual = stack.get(&identifier).map(|entry| entry.fields());
            prop_assert_eq!(actual, expected, "slot {} under {}", slot, identifier);
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// The stack behaves like copy-on-push snapshots with replace-on-commit.
    #[test]
    fn prop_stack_matches_snapshot_model(steps in arb_stack_steps(SLOTS, 40)) {
        let keys: Vec<Key> = (0..SLOTS).map(|_| Key::new("m")).collect();
        let mut stack = ContextStack::new();
        let mut model: Vec<Level> = vec![Level::new()];

        for step in steps {
            match step {
                StackStep::Push => {
                    stack.on_begin();
                    let copy = model.last().cloned().unwrap_or_default();
                    model.push(copy);
                }
                StackStep::Commit => {
                    let result = stack.on_commit();
                    if model.len() > 1 {
                        prop_assert!(result.is_ok());
                        let committed = model.pop().unwrap_or_default();
                        if let Some(parent) = model.last_mut() {
                            *parent = committed;
                        }
                    } else {
                        assert_empty_stack(&result);
                    }
                }
                StackStep::Rollback => {
                    let result = stack.on_rollback();
                    if model.len() > 1 {
                        prop_assert!(result.is_ok());
                        model.pop();
                    } else {
                        assert_empty_stack(&result);
                    }
                }
                StackStep::Write { slot, field, value } => {
                    let entity = Entity::new(keys[slot].clone()).with(field.clone(), value.clone());
                    stack.cache_entity(&slot_identifiers(slot), &entity);
                    if let Some(top) = model.last_mut() {
                        top.entry(slot).or_default().insert(field, value);
                    }
                }
                StackStep::Invalidate { slot } => {
                    stack.invalidate(&slot_identifiers(slot));
                    if let Some(top) = model.last_mut() {
                        top.remove(&slot);
                    }
                }
            }
            check(&stack, &model)?;
        }
    }

    /// Matching push/pop pairs restore the stack size.
    #[test]
    fn prop_balanced_push_pop_restores_size(depth in 0usize..8, commits in prop::collection::vec(any::<bool>(), 8)) {
        let mut stack = ContextStack::new();
        let before = stack.size();
        for _ in 0..depth {
            stack.push();
        }
        for commit in commits.iter().take(depth) {
            stack.pop(*commit, true).unwrap();
        }
        prop_assert_eq!(stack.size(), before);
        prop_assert_eq!(stack.staged_count(), 0);
    }
}
