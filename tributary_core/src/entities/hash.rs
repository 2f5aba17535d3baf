use super::models::{Breadcrumb, FieldValue};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Deterministic SHA-256 (hex) over an entity's semantic content.
///
/// Covers the entity type, every payload field not listed in `exclude`, and the
/// breadcrumb identity chain. Ancestor payloads are not included: a comment's
/// hash changes when the comment changes or moves, not when its issue is edited.
pub fn content_hash(
    entity_type: &str,
    payload: &BTreeMap<String, FieldValue>,
    breadcrumbs: &[Breadcrumb],
    exclude: &[String],
) -> String {
    let fields: serde_json::Map<String, Value> = payload
        .iter()
        .filter(|(name, _)| !exclude.iter().any(|x| x == *name))
        .map(|(name, v)| (name.clone(), v.to_json()))
        .collect();
    let chain: Vec<Value> = breadcrumbs
        .iter()
        .map(|b| Value::String(b.key().to_string()))
        .collect();

    let doc = serde_json::json!({
        "entity_type": entity_type,
        "payload": Value::Object(fields),
        "breadcrumbs": chain,
    });

    let mut canonical = String::new();
    write_canonical(&doc, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Serialize JSON with object keys sorted at every depth.
pub fn write_canonical(v: &Value, out: &mut String) {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                if let Some(child) = map.get(k) {
                    write_canonical(child, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(pairs: &[(&str, FieldValue)]) -> BTreeMap<String, FieldValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn canonical_sorts_nested_keys() {
        let a: Value = serde_json::from_str(r#"{"b":{"y":1,"x":2},"a":[{"d":1,"c":2}]}"#).unwrap();
        let mut out = String::new();
        write_canonical(&a, &mut out);
        assert_eq!(out, r#"{"a":[{"c":2,"d":1}],"b":{"x":2,"y":1}}"#);
    }

    #[test]
    fn nested_json_key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"k":1,"j":{"q":true,"p":null}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"j":{"p":null,"q":true},"k":1}"#).unwrap();
        let ha = content_hash("doc", &payload(&[("meta", FieldValue::Json(a))]), &[], &[]);
        let hb = content_hash("doc", &payload(&[("meta", FieldValue::Json(b))]), &[], &[]);
        assert_eq!(ha, hb);
        assert_eq!(ha.len(), 64);
    }

    #[test]
    fn excluded_fields_do_not_affect_hash() {
        let exclude = vec!["viewed_at".to_string()];
        let a = payload(&[
            ("title", FieldValue::String("x".into())),
            ("viewed_at", FieldValue::Integer(1)),
        ]);
        let b = payload(&[
            ("title", FieldValue::String("x".into())),
            ("viewed_at", FieldValue::Integer(2)),
        ]);
        assert_eq!(
            content_hash("t", &a, &[], &exclude),
            content_hash("t", &b, &[], &exclude)
        );
        assert_ne!(content_hash("t", &a, &[], &[]), content_hash("t", &b, &[], &[]));
    }

    #[test]
    fn parent_chain_is_part_of_identity() {
        let p = payload(&[("body", FieldValue::String("hi".into()))]);
        let under_a = [Breadcrumb::new("issue", "A")];
        let under_b = [Breadcrumb::new("issue", "B")];
        assert_ne!(
            content_hash("comment", &p, &under_a, &[]),
            content_hash("comment", &p, &under_b, &[])
        );
        // Display names are not semantic.
        let renamed = [Breadcrumb::new("issue", "A").named("Renamed")];
        assert_eq!(
            content_hash("comment", &p, &under_a, &[]),
            content_hash("comment", &p, &renamed, &[])
        );
    }

    #[test]
    fn entity_type_is_part_of_identity() {
        let p = payload(&[("x", FieldValue::Boolean(true))]);
        assert_ne!(content_hash("a", &p, &[], &[]), content_hash("b", &p, &[], &[]));
    }
}
