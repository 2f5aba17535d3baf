//! Built-in stages.

use crate::entities::models::{Breadcrumb, Entity, FieldValue};
use crate::transform::traits::{Stage, StageContext};
use crate::{Error, Result};
use serde_json::Value;
use std::collections::BTreeMap;

fn child_breadcrumbs(parent: &Entity) -> Vec<Breadcrumb> {
    let mut crumbs = parent.breadcrumbs.clone();
    let mut own = Breadcrumb::new(&parent.entity_type, &parent.entity_id);
    if let Some(FieldValue::String(name)) = parent
        .payload
        .get("name")
        .or_else(|| parent.payload.get("title"))
    {
        own = own.named(name.clone());
    }
    crumbs.push(own);
    crumbs
}

fn derived(parent: &Entity, entity_type: &str, entity_id: String) -> Entity {
    Entity {
        entity_id,
        entity_type: entity_type.to_string(),
        payload: BTreeMap::new(),
        source_updated_at: parent.source_updated_at,
        content_hash: String::new(),
        breadcrumbs: child_breadcrumbs(parent),
        lineage_root: parent.lineage_root.clone(),
        hash_exclude: parent.hash_exclude.clone(),
    }
}

pub struct TextChunker {
    pub field: String,
    pub max_chars: usize,
    pub overlap: usize,
    pub chunk_type: Option<String>,
    pub emit_parent: bool,
}

impl TextChunker {
    /// Split on character boundaries, preferring whitespace in the back half of a window.
    pub fn split(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        // A window cut short at whitespace must not shrink the stride below this.
        let min_step = self.max_chars.saturating_sub(self.overlap).max(1);
        let mut chunks = Vec::new();
        let mut start = 0usize;
        while start < chars.len() {
            let mut end = (start + self.max_chars).min(chars.len());
            if end < chars.len() {
                let floor = start + self.max_chars / 2;
                if let Some(ws) = (floor..end).rev().find(|&i| chars[i].is_whitespace()) {
                    if ws > start {
                        end = ws;
                    }
                }
            }
            let chunk: String = chars[start..end].iter().collect();
            let chunk = chunk.trim();
            if !chunk.is_empty() {
                chunks.push(chunk.to_string());
            }
            if end >= chars.len() {
                break;
            }
            start = end.saturating_sub(self.overlap).max(start + min_step).min(end);
        }
        chunks
    }
}

impl Stage for TextChunker {
    fn apply(&self, input: &Entity, _ctx: &StageContext<'_>) -> Result<Vec<Entity>> {
        let text = match input.payload.get(&self.field) {
            Some(FieldValue::String(s)) => s.clone(),
            Some(FieldValue::Absent) | None => return Ok(vec![input.clone()]),
            Some(_) => {
                return Err(Error::stage(
                    "text_chunker",
                    format!("field '{}' is not a string", self.field),
                ))
            }
        };

        let chunk_type = self
            .chunk_type
            .clone()
            .unwrap_or_else(|| format!("{}_chunk", input.entity_type));
        let chunks = self.split(&text);
        let count = chunks.len() as i64;

        let mut out = Vec::with_capacity(chunks.len() + 1);
        if self.emit_parent {
            let mut parent = input.clone();
            parent.payload.remove(&self.field);
            out.push(parent);
        }
        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut e = derived(input, &chunk_type, format!("{}#chunk-{i}", input.entity_id));
            e.payload.insert("text".into(), FieldValue::String(chunk));
            e.payload
                .insert("chunk_index".into(), FieldValue::Integer(i as i64));
            e.payload.insert("chunk_count".into(), FieldValue::Integer(count));
            out.push(e);
        }
        Ok(out)
    }
}

pub struct SelectFields {
    pub fields: Vec<String>,
}

impl Stage for SelectFields {
    fn apply(&self, input: &Entity, _ctx: &StageContext<'_>) -> Result<Vec<Entity>> {
        let mut e = input.clone();
        e.payload.retain(|k, _| self.fields.iter().any(|f| f == k));
        Ok(vec![e])
    }
}

pub struct DropFields {
    pub fields: Vec<String>,
}

impl Stage for DropFields {
    fn apply(&self, input: &Entity, _ctx: &StageContext<'_>) -> Result<Vec<Entity>> {
        let mut e = input.clone();
        e.payload.retain(|k, _| !self.fields.iter().any(|f| f == k));
        Ok(vec![e])
    }
}

pub struct ExplodeArray {
    pub field: String,
    pub child_type: String,
    pub id_field: Option<String>,
}

impl ExplodeArray {
    fn child_id(&self, parent: &Entity, index: usize, item: &Value) -> Result<String> {
        let Some(id_field) = &self.id_field else {
            return Ok(format!("{}#{}-{index}", parent.entity_id, self.field));
        };
        match item.get(id_field) {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(Error::stage(
                "explode_array",
                format!("element {index} of '{}' has no usable '{id_field}'", self.field),
            )),
        }
    }
}

fn json_to_field(v: &Value) -> FieldValue {
    match v {
        Value::Null => FieldValue::Absent,
        Value::Bool(b) => FieldValue::Boolean(*b),
        Value::String(s) => FieldValue::String(s.clone()),
        Value::Number(n) => match n.as_i64() {
            Some(i) => FieldValue::Integer(i),
            None => n
                .as_f64()
                .map(FieldValue::Float)
                .unwrap_or_else(|| FieldValue::Json(v.clone())),
        },
        other => FieldValue::Json(other.clone()),
    }
}

impl Stage for ExplodeArray {
    fn apply(&self, input: &Entity, _ctx: &StageContext<'_>) -> Result<Vec<Entity>> {
        let items: Vec<Value> = match input.payload.get(&self.field) {
            Some(FieldValue::Json(Value::Array(items))) => items.clone(),
            Some(FieldValue::StringList(items)) => {
                items.iter().cloned().map(Value::String).collect()
            }
            Some(FieldValue::Absent) | None => return Ok(vec![input.clone()]),
            Some(_) => {
                return Err(Error::stage(
                    "explode_array",
                    format!("field '{}' is not an array", self.field),
                ))
            }
        };

        let mut parent = input.clone();
        parent.payload.remove(&self.field);
        let mut out = vec![parent];
        for (i, item) in items.iter().enumerate() {
            let id = self.child_id(input, i, item)?;
            let mut child = derived(input, &self.child_type, id);
            match item {
                Value::Object(map) => {
                    for (k, v) in map {
                        child.payload.insert(k.clone(), json_to_field(v));
                    }
                }
                other => {
                    child.payload.insert("value".into(), json_to_field(other));
                }
            }
            out.push(child);
        }
        Ok(out)
    }
}
