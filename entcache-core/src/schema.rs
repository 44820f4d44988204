//! Model schemas: the unique constraints identifiers are derived from

use serde::{Deserialize, Serialize};

/// Unique constraint definition of one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSchema {
    kind: String,
    unique_fields: Vec<String>,
    unique_together: Vec<Vec<String>>,
}

impl ModelSchema {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            unique_fields: Vec::new(),
            unique_together: Vec::new(),
        }
    }

    /// Add a single-field unique constraint.
    pub fn unique(mut self, field: impl Into<String>) -> Self {
        self.unique_fields.push(field.into());
        self
    }

    /// Add a multi-field unique constraint.
    pub fn unique_together<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let group: Vec<String> = fields.into_iter().map(Into::into).collect();
        if !group.is_empty() {
            self.unique_together.push(group);
        }
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn unique_fields(&self) -> &[String] {
        &self.unique_fields
    }

    pub fn unique_together_groups(&self) -> &[Vec<String>] {
        &self.unique_together
    }

    /// Every unique constraint as a list of fields: single unique fields
    /// first, then unique-together groups, in declaration order.
    pub fn constraints(&self) -> Vec<Vec<String>> {
        self.unique_fields
            .iter()
            .map(|f| vec![f.clone()])
            .chain(self.unique_together.iter().cloned())
            .collect()
    }

    pub fn has_unique_constraints(&self) -> bool {
        !self.unique_fields.is_empty() || !self.unique_together.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraints_order() {
        let schema = ModelSchema::new("CachingTestModel")
            .unique("field1")
            .unique_together(["comb1", "comb2"]);

        assert_eq!(
            schema.constraints(),
            vec![
                vec!["field1".to_string()],
                vec!["comb1".to_string(), "comb2".to_string()],
            ]
        );
        assert!(schema.has_unique_constraints());
    }

    #[test]
    fn test_empty_group_is_ignored() {
        let schema = ModelSchema::new("m").unique_together(Vec::<String>::new());
        assert!(schema.unique_together_groups().is_empty());
        assert!(!schema.has_unique_constraints());
    }
}
