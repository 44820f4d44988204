//! Keys, live entities and cached snapshots

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::{new_entity_id, EntityId, Value};

/// Field map shared by entities and snapshots.
pub type FieldMap = BTreeMap<String, Value>;

/// Datastore key of a single entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    namespace: Option<String>,
    kind: String,
    id: EntityId,
}

impl Key {
    /// Allocate a fresh key for `kind` in the default namespace.
    pub fn new(kind: impl Into<String>) -> Self {
        Self::with_id(kind, new_entity_id())
    }

    pub fn with_id(kind: impl Into<String>, id: EntityId) -> Self {
        Self {
            namespace: None,
            kind: kind.into(),
            id,
        }
    }

    /// Move the key into a namespace.
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> EntityId {
        self.id
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}:{}", ns, self.kind, self.id),
            None => write!(f, "{}:{}", self.kind, self.id),
        }
    }
}

/// A live entity as the ORM layer manipulates it.
///
/// Besides its current field values an entity remembers which fields were
/// explicitly removed since it was loaded. Removal is a tombstone, distinct
/// from a field that was simply never written, so that caching the entity
/// deletes the field from an existing snapshot instead of leaving the old
/// value behind.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    key: Key,
    fields: FieldMap,
    removed: BTreeSet<String>,
}

impl Entity {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            fields: FieldMap::new(),
            removed: BTreeSet::new(),
        }
    }

    /// Builder-style setter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    /// Set a field, clearing any tombstone for it.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        let field = field.into();
        self.removed.remove(&field);
        self.fields.insert(field, value.into());
    }

    /// Remove a field and record a tombstone for it.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.removed.insert(field.to_string());
        self.fields.remove(field)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    /// Fields removed since the entity was loaded.
    pub fn removed(&self) -> &BTreeSet<String> {
        &self.removed
    }

    pub fn is_removed(&self, field: &str) -> bool {
        self.removed.contains(field)
    }

    /// Forget tombstones, e.g. after the entity has been persisted.
    pub fn clear_removed(&mut self) {
        self.removed.clear();
    }

    /// Snapshot of the current values (tombstones are not part of a snapshot).
    pub fn to_entry(&self) -> CacheEntry {
        CacheEntry::new(self.key.clone(), self.fields.clone())
    }
}

impl From<CacheEntry> for Entity {
    fn from(entry: CacheEntry) -> Self {
        Self {
            key: entry.key,
            fields: entry.fields,
            removed: BTreeSet::new(),
        }
    }
}

/// Immutable snapshot of an entity as held by either cache tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    key: Key,
    fields: FieldMap,
}

impl CacheEntry {
    pub fn new(key: Key, fields: FieldMap) -> Self {
        Self { key, fields }
    }

    /// Empty snapshot for `key`, used as the merge base of a first write.
    pub fn empty(key: Key) -> Self {
        Self::new(key, FieldMap::new())
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn into_fields(self) -> FieldMap {
        self.fields
    }

    /// Merge a live entity into this snapshot field by field.
    ///
    /// Present fields overwrite, tombstoned fields are deleted and every
    /// other field keeps its cached value.
    pub fn merge(&mut self, entity: &Entity) {
        for (field, value) in entity.fields() {
            self.fields.insert(field.clone(), value.clone());
        }
        for field in entity.removed() {
            self.fields.remove(field);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display_includes_namespace() {
        let id = uuid::Uuid::nil();
        let key = Key::with_id("table", id);
        assert_eq!(key.to_string(), format!("table:{}", id));

        let key = key.in_namespace("ns1");
        assert_eq!(key.namespace(), Some("ns1"));
        assert_eq!(key.to_string(), format!("ns1/table:{}", id));
    }

    #[test]
    fn test_remove_records_tombstone_and_set_clears_it() {
        let mut entity = Entity::new(Key::new("table")).with("a", 1);
        assert_eq!(entity.remove("a"), Some(Value::Int(1)));
        assert!(entity.is_removed("a"));
        assert!(entity.get("a").is_none());

        entity.set("a", 2);
        assert!(!entity.is_removed("a"));
        assert_eq!(entity.get("a"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_removing_unknown_field_still_tombstones() {
        let mut entity = Entity::new(Key::new("table"));
        assert_eq!(entity.remove("ghost"), None);
        assert!(entity.is_removed("ghost"));
    }

    #[test]
    fn test_merge_overwrites_deletes_and_keeps() {
        let key = Key::new("table");
        let mut entry = Entity::new(key.clone())
            .with("keep", "k")
            .with("field1", "one")
            .with("field2", "two")
            .to_entry();

        let mut live = Entity::new(key).with("field1", "oneone");
        live.remove("field2");
        entry.merge(&live);

        assert_eq!(entry.get("field1"), Some(&Value::from("oneone")));
        assert_eq!(entry.get("field2"), None);
        assert_eq!(entry.get("keep"), Some(&Value::from("k")));
    }

    #[test]
    fn test_entity_from_entry_has_no_tombstones() {
        let entry = Entity::new(Key::new("table")).with("a", 1).to_entry();
        let entity = Entity::from(entry.clone());
        assert!(entity.removed().is_empty());
        assert_eq!(entity.to_entry(), entry);
    }
}
