use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Identity of an entity within one connection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// Reference to an ancestor entity (e.g. Project -> Issue for a Comment).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Breadcrumb {
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Breadcrumb {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            name: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_type, &self.entity_id)
    }
}

/// Typed payload value.
///
/// `Absent` is kept explicitly for declared fields the source did not provide,
/// so two payloads differing only by a missing optional field hash identically
/// regardless of whether the key was omitted or null at the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Absent,
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    StringList(Vec<String>),
    Json(Value),
}

impl FieldValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Plain JSON rendering used for canonical hashing and destination metadata.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Absent => Value::Null,
            Self::String(s) => Value::String(s.clone()),
            Self::Integer(i) => Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Boolean(b) => Value::Bool(*b),
            Self::Timestamp(t) => Value::String(t.to_rfc3339_opts(SecondsFormat::Micros, true)),
            Self::StringList(items) => {
                Value::Array(items.iter().cloned().map(Value::String).collect())
            }
            Self::Json(v) => v.clone(),
        }
    }
}

/// Canonical unit of extracted data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: String,
    pub entity_type: String,
    pub payload: BTreeMap<String, FieldValue>,
    #[serde(default)]
    pub source_updated_at: Option<DateTime<Utc>>,
    pub content_hash: String,
    #[serde(default)]
    pub breadcrumbs: Vec<Breadcrumb>,
    /// Key of the source record this entity descends from (itself for normalized records).
    pub lineage_root: EntityKey,
    /// Payload fields left out of `content_hash`; inherited by derived entities.
    #[serde(default)]
    pub hash_exclude: Vec<String>,
}

impl Entity {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_type, &self.entity_id)
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.payload.get(name).filter(|v| !v.is_absent())
    }

    pub fn parent(&self) -> Option<&Breadcrumb> {
        self.breadcrumbs.last()
    }

    /// Recompute `content_hash` after a payload change.
    pub fn rehash(&mut self) {
        self.content_hash = super::hash::content_hash(
            &self.entity_type,
            &self.payload,
            &self.breadcrumbs,
            &self.hash_exclude,
        );
    }

    /// Text handed to the embedder: string-ish fields in key order.
    pub fn embedding_text(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.payload {
            let rendered = match value {
                FieldValue::String(s) => s.clone(),
                FieldValue::StringList(items) => items.join(", "),
                _ => continue,
            };
            if rendered.trim().is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(name);
            out.push_str(": ");
            out.push_str(&rendered);
        }
        out
    }

    /// Metadata stored next to vectors and graph nodes.
    pub fn metadata(&self) -> Value {
        let payload: serde_json::Map<String, Value> = self
            .payload
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        serde_json::json!({
            "entity_type": self.entity_type,
            "entity_id": self.entity_id,
            "content_hash": self.content_hash,
            "source_updated_at": self.source_updated_at,
            "breadcrumbs": self.breadcrumbs,
            "lineage_root": self.lineage_root.to_string(),
            "payload": Value::Object(payload),
        })
    }
}
