use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Per-connection transformation graph: a fan-out-only forest of named stages.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DagSpec {
    #[serde(default)]
    pub stages: Vec<StageSpec>,
}

impl DagSpec {
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub op: StageKind,
    /// Stage whose outputs feed this one; `None` means the normalized source entity.
    /// A single upstream keeps sibling lineages from ever merging.
    #[serde(default)]
    pub upstream: Option<String>,
    /// Entity types the stage transforms; others pass through untouched. Empty means all.
    #[serde(default)]
    pub applies_to: Vec<String>,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, op: StageKind) -> Self {
        Self {
            name: name.into(),
            op,
            upstream: None,
            applies_to: Vec::new(),
        }
    }

    pub fn after(mut self, upstream: impl Into<String>) -> Self {
        self.upstream = Some(upstream.into());
        self
    }

    pub fn only(mut self, entity_type: impl Into<String>) -> Self {
        self.applies_to.push(entity_type.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageKind {
    /// Split a long string field into overlapping chunk entities.
    TextChunker {
        field: String,
        max_chars: usize,
        #[serde(default)]
        overlap: usize,
        /// Defaults to `<entity_type>_chunk`.
        #[serde(default)]
        chunk_type: Option<String>,
        /// Also emit the input entity (without the chunked field).
        #[serde(default = "default_true")]
        emit_parent: bool,
    },
    SelectFields {
        fields: Vec<String>,
    },
    DropFields {
        fields: Vec<String>,
    },
    /// Turn each element of an array field into a child entity.
    ExplodeArray {
        field: String,
        child_type: String,
        #[serde(default)]
        id_field: Option<String>,
    },
    /// Stage implemented by a registered `StageFactory`.
    Custom {
        handler: String,
        #[serde(default)]
        config: serde_json::Value,
    },
}

fn default_true() -> bool {
    true
}

impl StageKind {
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn validate(&self, stage: &str) -> Result<()> {
        let bad = |msg: &str| Err(Error::InvalidInput(format!("stage '{stage}': {msg}")));
        match self {
            Self::TextChunker {
                field,
                max_chars,
                overlap,
                chunk_type,
                ..
            } => {
                if field.trim().is_empty() {
                    return bad("field is empty");
                }
                if *max_chars == 0 {
                    return bad("max_chars must be > 0");
                }
                if overlap >= max_chars {
                    return bad("overlap must be < max_chars");
                }
                if chunk_type.as_deref().is_some_and(|t| t.trim().is_empty()) {
                    return bad("chunk_type is empty");
                }
            }
            Self::SelectFields { fields } | Self::DropFields { fields } => {
                if fields.is_empty() || fields.iter().any(|f| f.trim().is_empty()) {
                    return bad("fields must be non-empty names");
                }
            }
            Self::ExplodeArray {
                field, child_type, ..
            } => {
                if field.trim().is_empty() || child_type.trim().is_empty() {
                    return bad("field and child_type are required");
                }
            }
            Self::Custom { handler, .. } => {
                if handler.trim().is_empty() {
                    return bad("handler is empty");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_yaml_style_json() {
        let dag: DagSpec = serde_json::from_value(serde_json::json!({
            "stages": [
                {"name": "chunk", "op": {"kind": "text_chunker", "field": "body", "max_chars": 500, "overlap": 50}, "applies_to": ["doc"]},
                {"name": "trim", "op": {"kind": "drop_fields", "fields": ["raw"]}, "upstream": "chunk"}
            ]
        }))
        .unwrap();
        assert_eq!(dag.stages.len(), 2);
        assert_eq!(dag.stages[1].upstream.as_deref(), Some("chunk"));
        match &dag.stages[0].op {
            StageKind::TextChunker { emit_parent, .. } => assert!(*emit_parent),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn validates_chunker_bounds() {
        let k = StageKind::TextChunker {
            field: "body".into(),
            max_chars: 10,
            overlap: 10,
            chunk_type: None,
            emit_parent: true,
        };
        assert!(k.validate("c").is_err());
    }
}
