//! Identifier derivation.
//!
//! An entity is addressable by its key and by every unique constraint its
//! model declares. Each address is turned into a stable [`Identifier`] so
//! both cache tiers can store the same snapshot under all of them.

use entcache_core::{
    content_digest, CacheResult, Entity, Identifier, IdentifierError, Key, ModelSchema, Value,
    KEY_FIELD,
};

/// Turns keys and unique constraint values into cache identifiers.
///
/// Implementations must be deterministic: the same schema and values always
/// produce the same identifiers, across processes.
pub trait IdentifierDeriver: Send + Sync {
    /// Identifier addressing an entity by key.
    fn key_identifier(&self, key: &Key) -> Identifier;

    /// Identifier of one unique constraint, given its fields' values in
    /// constraint order. Returns None when any value is null, since nulls
    /// never collide under a unique constraint.
    fn constraint_identifier(
        &self,
        schema: &ModelSchema,
        namespace: Option<&str>,
        values: &[(&str, &Value)],
    ) -> Option<Identifier>;

    /// Identifiers of every unique constraint of `schema` for `entity`.
    fn derive(&self, schema: &ModelSchema, entity: &Entity) -> CacheResult<Vec<Identifier>> {
        let namespace = entity.key().namespace();
        let mut identifiers = Vec::new();

        for constraint in schema.constraints() {
            let mut values = Vec::with_capacity(constraint.len());
            for field in &constraint {
                let value = entity.get(field).ok_or_else(|| {
                    IdentifierError::MissingUniqueField {
                        kind: schema.kind().to_string(),
                        field: field.clone(),
                    }
                })?;
                values.push((field.as_str(), value));
            }
            if let Some(identifier) = self.constraint_identifier(schema, namespace, &values) {
                identifiers.push(identifier);
            }
        }

        Ok(identifiers)
    }

    /// The key identifier followed by every constraint identifier.
    fn all_identifiers(&self, schema: &ModelSchema, entity: &Entity) -> CacheResult<Vec<Identifier>> {
        let mut identifiers = vec![self.key_identifier(entity.key())];
        identifiers.extend(self.derive(schema, entity)?);
        Ok(identifiers)
    }

    /// Like [`all_identifiers`](Self::all_identifiers), but a constraint with
    /// an absent field is skipped instead of failing the whole derivation.
    fn available_identifiers(&self, schema: &ModelSchema, entity: &Entity) -> Vec<Identifier> {
        let namespace = entity.key().namespace();
        let mut identifiers = vec![self.key_identifier(entity.key())];

        for constraint in schema.constraints() {
            let values: Option<Vec<(&str, &Value)>> = constraint
                .iter()
                .map(|field| entity.get(field).map(|value| (field.as_str(), value)))
                .collect();
            if let Some(identifier) = values
                .and_then(|values| self.constraint_identifier(schema, namespace, &values))
            {
                identifiers.push(identifier);
            }
        }

        identifiers
    }
}

/// Default deriver: `{namespace}|{kind}|{field}:{sha256(value)}|...`.
///
/// Values are hashed from their JSON encoding so identifiers have bounded
/// length whatever the field contents.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashedIdentifierDeriver;

impl HashedIdentifierDeriver {
    pub fn new() -> Self {
        Self
    }

    fn prefix(namespace: Option<&str>, kind: &str) -> String {
        format!("{}|{}", namespace.unwrap_or_default(), kind)
    }

    fn digest(value: &Value) -> String {
        // Serializing a Value cannot fail: all map keys are strings.
        content_digest(&serde_json::to_vec(value).unwrap_or_default())
    }
}

impl IdentifierDeriver for HashedIdentifierDeriver {
    fn key_identifier(&self, key: &Key) -> Identifier {
        Identifier::new(format!(
            "{}|{}:{}",
            Self::prefix(key.namespace(), key.kind()),
            KEY_FIELD,
            key.id()
        ))
    }

    fn constraint_identifier(
        &self,
        schema: &ModelSchema,
        namespace: Option<&str>,
        values: &[(&str, &Value)],
    ) -> Option<Identifier> {
        if values.is_empty() || values.iter().any(|(_, v)| v.is_null()) {
            return None;
        }

        let mut raw = Self::prefix(namespace, schema.kind());
        for (field, value) in values {
            raw.push('|');
            raw.push_str(field);
            raw.push(':');
            raw.push_str(&Self::digest(value));
        }
        Some(Identifier::new(raw))
    }
}
