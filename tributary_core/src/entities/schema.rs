use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
    StringList,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
}

/// Declared shape of one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub entity_type: String,
    pub fields: Vec<FieldSpec>,
    /// Volatile, non-semantic fields left out of the content hash.
    #[serde(default)]
    pub hash_exclude: Vec<String>,
    /// Timestamp field copied into `Entity::source_updated_at`.
    #[serde(default)]
    pub updated_at_field: Option<String>,
    /// Keep payload keys the schema does not declare (as raw JSON).
    #[serde(default = "default_true")]
    pub keep_undeclared: bool,
}

fn default_true() -> bool {
    true
}

impl EntitySchema {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            fields: Vec::new(),
            hash_exclude: Vec::new(),
            updated_at_field: None,
            keep_undeclared: true,
        }
    }

    pub fn required(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    pub fn exclude_from_hash(mut self, name: impl Into<String>) -> Self {
        self.hash_exclude.push(name.into());
        self
    }

    pub fn updated_at(mut self, name: impl Into<String>) -> Self {
        self.updated_at_field = Some(name.into());
        self
    }

    pub fn strict(mut self) -> Self {
        self.keep_undeclared = false;
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    #[tracing::instrument(level = "debug", skip(self), fields(entity_type = %self.entity_type))]
    pub fn validate(&self) -> Result<()> {
        if self.entity_type.trim().is_empty() {
            return Err(Error::InvalidInput("entity_type is empty".to_string()));
        }
        let mut seen = HashSet::new();
        for f in &self.fields {
            if f.name.trim().is_empty() {
                return Err(Error::InvalidInput(format!(
                    "schema '{}' has a field with an empty name",
                    self.entity_type
                )));
            }
            if !seen.insert(f.name.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "schema '{}' declares field '{}' twice",
                    self.entity_type, f.name
                )));
            }
        }
        if let Some(updated) = &self.updated_at_field {
            match self.field(updated) {
                Some(f) if f.kind == FieldKind::Timestamp => {}
                _ => {
                    return Err(Error::InvalidInput(format!(
                        "schema '{}': updated_at_field '{}' must be a declared timestamp field",
                        self.entity_type, updated
                    )))
                }
            }
        }
        Ok(())
    }
}

/// Entity schemas resolved by `entity_type` at normalization time.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, EntitySchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_schemas(schemas: impl IntoIterator<Item = EntitySchema>) -> Result<Self> {
        let mut reg = Self::new();
        for s in schemas {
            reg.register(s)?;
        }
        Ok(reg)
    }

    pub fn register(&mut self, schema: EntitySchema) -> Result<()> {
        schema.validate()?;
        if self.schemas.contains_key(&schema.entity_type) {
            return Err(Error::Conflict(format!(
                "schema for entity type '{}' already registered",
                schema.entity_type
            )));
        }
        self.schemas.insert(schema.entity_type.clone(), schema);
        Ok(())
    }

    pub fn get(&self, entity_type: &str) -> Option<&EntitySchema> {
        self.schemas.get(entity_type)
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicate_fields_and_bad_updated_at() {
        let dup = EntitySchema::new("t")
            .required("a", FieldKind::String)
            .optional("a", FieldKind::Integer);
        assert!(dup.validate().is_err());

        let bad = EntitySchema::new("t")
            .required("a", FieldKind::String)
            .updated_at("a");
        assert!(bad.validate().is_err());

        let ok = EntitySchema::new("t")
            .optional("modified", FieldKind::Timestamp)
            .updated_at("modified");
        ok.validate().unwrap();
    }

    #[test]
    fn registry_rejects_duplicate_types() {
        let mut reg = SchemaRegistry::new();
        reg.register(EntitySchema::new("issue")).unwrap();
        assert!(matches!(
            reg.register(EntitySchema::new("issue")),
            Err(Error::Conflict(_))
        ));
        assert!(reg.get("issue").is_some());
        assert!(reg.get("comment").is_none());
    }

    #[test]
    fn deserializes_with_defaults() {
        let s: EntitySchema = serde_json::from_value(serde_json::json!({
            "entity_type": "contact",
            "fields": [{"name": "email", "kind": "string", "required": true}]
        }))
        .unwrap();
        assert!(s.keep_undeclared);
        assert!(s.hash_exclude.is_empty());
        assert!(s.fields[0].required);
    }
}
