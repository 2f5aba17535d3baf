use super::hash::content_hash;
use super::models::{Entity, FieldValue};
use super::schema::{EntitySchema, FieldKind, SchemaRegistry};
use crate::connectors::models::RawRecord;
use crate::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

/// Maps raw connector records onto the canonical entity model.
#[derive(Debug, Clone)]
pub struct Normalizer {
    schemas: SchemaRegistry,
}

impl Normalizer {
    pub fn new(schemas: SchemaRegistry) -> Self {
        Self { schemas }
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    /// Normalize `raw` as `entity_type`.
    ///
    /// Fails with `SchemaViolation` when the type is undeclared, the payload is not
    /// an object, or a field is missing (required) or mistyped.
    #[tracing::instrument(level = "debug", skip(self, raw), fields(entity_id = %raw.entity_id))]
    pub fn normalize(&self, raw: &RawRecord, entity_type: &str) -> Result<Entity> {
        let schema = self
            .schemas
            .get(entity_type)
            .ok_or_else(|| Error::schema(entity_type, "no schema declared for entity type"))?;
        normalize_with(schema, raw)
    }

    /// Normalize using the record's own `entity_type`.
    pub fn normalize_record(&self, raw: &RawRecord) -> Result<Entity> {
        self.normalize(raw, &raw.entity_type)
    }
}

fn normalize_with(schema: &EntitySchema, raw: &RawRecord) -> Result<Entity> {
    let ty = schema.entity_type.as_str();
    if raw.entity_id.trim().is_empty() {
        return Err(Error::schema(ty, "entity_id is empty"));
    }
    let Value::Object(obj) = &raw.payload else {
        return Err(Error::schema(ty, "payload is not a JSON object"));
    };

    let mut payload = BTreeMap::new();
    for spec in &schema.fields {
        let value = match obj.get(&spec.name) {
            None | Some(Value::Null) => {
                if spec.required {
                    return Err(Error::schema(
                        ty,
                        format!("required field '{}' is missing", spec.name),
                    ));
                }
                FieldValue::Absent
            }
            Some(v) => coerce(v, spec.kind).ok_or_else(|| {
                Error::schema(
                    ty,
                    format!("field '{}' is not a valid {:?}", spec.name, spec.kind),
                )
            })?,
        };
        payload.insert(spec.name.clone(), value);
    }

    if schema.keep_undeclared {
        for (k, v) in obj {
            if schema.field(k).is_some() {
                continue;
            }
            let value = match v {
                Value::Null => FieldValue::Absent,
                other => FieldValue::Json(other.clone()),
            };
            payload.insert(k.clone(), value);
        }
    }

    let source_updated_at = schema
        .updated_at_field
        .as_ref()
        .and_then(|f| match payload.get(f) {
            Some(FieldValue::Timestamp(t)) => Some(*t),
            _ => None,
        });

    let hash_exclude = schema.hash_exclude.clone();
    let content_hash = content_hash(ty, &payload, &raw.breadcrumbs, &hash_exclude);

    Ok(Entity {
        entity_id: raw.entity_id.clone(),
        entity_type: ty.to_string(),
        payload,
        source_updated_at,
        content_hash,
        breadcrumbs: raw.breadcrumbs.clone(),
        lineage_root: raw.key(),
        hash_exclude,
    })
}

fn coerce(v: &Value, kind: FieldKind) -> Option<FieldValue> {
    match kind {
        FieldKind::String => v.as_str().map(|s| FieldValue::String(s.to_string())),
        FieldKind::Integer => match v {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                        .map(|f| f as i64)
                })
                .map(FieldValue::Integer),
            _ => None,
        },
        FieldKind::Float => v
            .as_f64()
            .filter(|f| f.is_finite())
            .map(FieldValue::Float),
        FieldKind::Boolean => v.as_bool().map(FieldValue::Boolean),
        FieldKind::Timestamp => parse_timestamp(v).map(FieldValue::Timestamp),
        FieldKind::StringList => v.as_array().and_then(|items| {
            items
                .iter()
                .map(|i| i.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .map(FieldValue::StringList)
        }),
        FieldKind::Json => Some(FieldValue::Json(v.clone())),
    }
}

fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::models::Breadcrumb;
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::from_schemas([EntitySchema::new("ticket")
            .required("title", FieldKind::String)
            .optional("priority", FieldKind::Integer)
            .optional("updated", FieldKind::Timestamp)
            .optional("last_viewed_at", FieldKind::Timestamp)
            .exclude_from_hash("last_viewed_at")
            .updated_at("updated")])
        .unwrap()
    }

    fn raw(payload: Value) -> RawRecord {
        RawRecord::new("ticket", "T-1", payload).unwrap()
    }

    #[test]
    fn missing_optional_fields_become_absent() {
        let n = Normalizer::new(registry());
        let e = n.normalize(&raw(json!({"title": "Broken"})), "ticket").unwrap();
        assert_eq!(e.payload.get("priority"), Some(&FieldValue::Absent));
        assert_eq!(e.payload.get("updated"), Some(&FieldValue::Absent));
        assert_eq!(e.source_updated_at, None);
        assert_eq!(e.lineage_root, e.key());
    }

    #[test]
    fn null_and_missing_optional_hash_the_same() {
        let n = Normalizer::new(registry());
        let a = n.normalize(&raw(json!({"title": "x"})), "ticket").unwrap();
        let b = n
            .normalize(&raw(json!({"title": "x", "priority": null})), "ticket")
            .unwrap();
        assert_eq!(a.content_hash, b.content_hash);
    }

    #[test]
    fn required_missing_is_schema_violation() {
        let n = Normalizer::new(registry());
        let err = n.normalize(&raw(json!({"priority": 1})), "ticket").unwrap_err();
        assert!(matches!(err, Error::SchemaViolation { .. }));
    }

    #[test]
    fn mistyped_field_is_schema_violation() {
        let n = Normalizer::new(registry());
        let err = n
            .normalize(&raw(json!({"title": "x", "priority": "high"})), "ticket")
            .unwrap_err();
        assert!(matches!(err, Error::SchemaViolation { .. }));
        let err = n.normalize(&raw(json!({"title": 42})), "ticket").unwrap_err();
        assert!(matches!(err, Error::SchemaViolation { .. }));
    }

    #[test]
    fn unknown_entity_type_is_schema_violation() {
        let n = Normalizer::new(registry());
        let err = n.normalize(&raw(json!({"title": "x"})), "comment").unwrap_err();
        assert!(matches!(err, Error::SchemaViolation { .. }));
    }

    #[test]
    fn hash_ignores_field_order_and_volatile_fields() {
        let n = Normalizer::new(registry());
        let a: Value =
            serde_json::from_str(r#"{"title":"x","priority":2,"last_viewed_at":"2024-01-01T00:00:00Z"}"#)
                .unwrap();
        let b: Value =
            serde_json::from_str(r#"{"last_viewed_at":"2025-06-01T10:00:00Z","priority":2,"title":"x"}"#)
                .unwrap();
        let ea = n.normalize(&raw(a), "ticket").unwrap();
        let eb = n.normalize(&raw(b), "ticket").unwrap();
        assert_eq!(ea.content_hash, eb.content_hash);
        assert_ne!(ea.payload, eb.payload);
    }

    #[test]
    fn timestamps_accept_rfc3339_and_epoch_seconds() {
        let n = Normalizer::new(registry());
        let a = n
            .normalize(&raw(json!({"title": "x", "updated": "2024-05-01T12:00:00+02:00"})), "ticket")
            .unwrap();
        let b = n
            .normalize(&raw(json!({"title": "x", "updated": 1714557600})), "ticket")
            .unwrap();
        assert_eq!(a.source_updated_at, b.source_updated_at);
        assert_eq!(a.content_hash, b.content_hash);
    }

    #[test]
    fn undeclared_fields_are_kept_unless_strict() {
        let lenient = Normalizer::new(registry());
        let e = lenient
            .normalize(&raw(json!({"title": "x", "labels": ["a"]})), "ticket")
            .unwrap();
        assert_eq!(e.payload.get("labels"), Some(&FieldValue::Json(json!(["a"]))));

        let strict = Normalizer::new(
            SchemaRegistry::from_schemas([EntitySchema::new("ticket")
                .required("title", FieldKind::String)
                .strict()])
            .unwrap(),
        );
        let e = strict
            .normalize(&raw(json!({"title": "x", "labels": ["a"]})), "ticket")
            .unwrap();
        assert!(!e.payload.contains_key("labels"));
    }

    #[test]
    fn breadcrumbs_are_carried_and_hashed() {
        let n = Normalizer::new(registry());
        let r = raw(json!({"title": "x"}))
            .with_breadcrumbs(vec![Breadcrumb::new("project", "P1")]);
        let e = n.normalize_record(&r).unwrap();
        assert_eq!(e.breadcrumbs.len(), 1);
        let plain = n.normalize_record(&raw(json!({"title": "x"}))).unwrap();
        assert_ne!(e.content_hash, plain.content_hash);
    }
}
