//! Equality queries as the ORM hands them to the cache layer

use serde::{Deserialize, Serialize};

use crate::{CacheEntry, Key, Value};

/// Pseudo-field used to filter by datastore key.
pub const KEY_FIELD: &str = "__key__";

/// Equality filter on one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Field to filter on
    pub field: String,
    /// Value the field must equal
    pub value: Value,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Filter by datastore key.
    pub fn key(key: Key) -> Self {
        Self::eq(KEY_FIELD, Value::Key(key))
    }

    pub fn is_key_filter(&self) -> bool {
        self.field == KEY_FIELD
    }

    /// Whether a snapshot satisfies this filter.
    pub fn matches(&self, entry: &CacheEntry) -> bool {
        if self.is_key_filter() {
            return self.value.as_key() == Some(entry.key());
        }
        entry.get(&self.field) == Some(&self.value)
    }
}

/// A conjunction of equality filters over one kind.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Query {
    pub namespace: Option<String>,
    pub kind: String,
    pub filters: Vec<Filter>,
    /// Restrict returned fields; projection results are never cached.
    pub projection: Option<Vec<String>>,
    /// Return keys only; such results are never cached.
    pub keys_only: bool,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::eq(field, value));
        self
    }

    pub fn by_key(mut self, key: Key) -> Self {
        self.filters.push(Filter::key(key));
        self
    }

    pub fn project<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn keys_only(mut self) -> Self {
        self.keys_only = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Keys named by `__key__` filters, deduplicated in filter order.
    pub fn key_filters(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = Vec::new();
        for key in self.filters.iter().filter_map(|f| {
            if f.is_key_filter() {
                f.value.as_key()
            } else {
                None
            }
        }) {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys
    }

    /// Value the query requires for `field`, if it filters on it.
    pub fn value_for(&self, field: &str) -> Option<&Value> {
        self.filters
            .iter()
            .find(|f| f.field == field)
            .map(|f| &f.value)
    }

    /// Whether a snapshot satisfies every filter of the query.
    pub fn matches(&self, entry: &CacheEntry) -> bool {
        entry.key().kind() == self.kind
            && entry.key().namespace() == self.namespace.as_deref()
            && self.filters.iter().all(|f| f.matches(entry))
    }

    /// Whether the result is a reduced view of the entity.
    pub fn is_partial(&self) -> bool {
        self.keys_only || self.projection.is_some()
    }
}
