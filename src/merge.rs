//! # Deep Merge
//!
//! Merge kernel for structured secret payloads.
//!
//! Payloads are arbitrary JSON trees (`serde_json::Value`). Merging two
//! payloads follows a fixed, per-key strategy:
//!
//! - Maps: recursive merge
//! - Lists: append (`dst` items first, then `src`)
//! - Scalars and type conflicts: `src` overrides `dst`
//!
//! A `null` in `src` carries no opinion and leaves the `dst` value in place.
//! Sources that want to clear a key must delete it instead.

use serde_json::{Map, Value};

/// Merges `src` into `dst` and returns the merged map.
///
/// Lists append, maps merge recursively, everything else is overridden by
/// `src`. Values copied out of `src` are deep copies so the result never
/// aliases the input.
pub fn deep_merge(mut dst: Map<String, Value>, src: &Map<String, Value>) -> Map<String, Value> {
    for (key, src_val) in src {
        match dst.remove(key) {
            None => {
                dst.insert(key.clone(), src_val.clone());
            }
            Some(dst_val) => {
                dst.insert(key.clone(), merge_values(dst_val, src_val));
            }
        }
    }
    dst
}

fn merge_values(dst: Value, src: &Value) -> Value {
    match (dst, src) {
        // null in src means "no opinion": keep dst
        (dst, Value::Null) => dst,
        (Value::Object(dst_map), Value::Object(src_map)) => {
            Value::Object(deep_merge(dst_map, src_map))
        }
        (Value::Array(mut dst_arr), Value::Array(src_arr)) => {
            dst_arr.extend(src_arr.iter().cloned());
            Value::Array(dst_arr)
        }
        // scalar or type conflict: src wins
        (_, src) => src.clone(),
    }
}

/// Merges two serialized JSON payloads. An empty `dst` is treated as `{}`.
pub fn deep_merge_json(dst: &[u8], src: &[u8]) -> Result<Vec<u8>, serde_json::Error> {
    let dst_map: Map<String, Value> = if dst.is_empty() {
        Map::new()
    } else {
        serde_json::from_slice(dst)?
    };
    let src_map: Map<String, Value> = if src.is_empty() {
        Map::new()
    } else {
        serde_json::from_slice(src)?
    };
    serde_json::to_vec(&Value::Object(deep_merge(dst_map, &src_map)))
}

/// Structural equality with numeric widening.
///
/// All numbers compare as `f64` so that `1` and `1.0` from different
/// serializers are equal. Map key order is irrelevant by construction.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(fx), Some(fy)) => fx == fy,
            _ => x == y,
        },
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, xv)| y.get(k).is_some_and(|yv| deep_equal(xv, yv)))
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(xv, yv)| deep_equal(xv, yv))
        }
        _ => a == b,
    }
}

/// Compares two serialized secret values for equivalence.
///
/// Both sides are parsed as JSON and compared structurally (tolerating
/// number-width and key-order differences). If `existing` is not valid JSON
/// the comparison falls back to byte equality; if only `new` is invalid the
/// values differ.
pub fn compare_secrets_json(existing: &[u8], new: &[u8]) -> bool {
    let existing_val: Value = match serde_json::from_slice(existing) {
        Ok(v) => v,
        Err(_) => return existing == new,
    };
    let new_val: Value = match serde_json::from_slice(new) {
        Ok(v) => v,
        Err(_) => return false,
    };
    deep_equal(&existing_val, &new_val)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn merge_with_empty_is_identity() {
        let a = obj(json!({"k": "v", "list": [1, 2], "nested": {"x": true}}));
        assert_eq!(deep_merge(a.clone(), &Map::new()), a);
        assert_eq!(deep_merge(Map::new(), &a), a);
    }

    #[test]
    fn lists_append_in_order() {
        let a = obj(json!({"k": ["x1", "x2"]}));
        let b = obj(json!({"k": ["y1"]}));
        let merged = deep_merge(a, &b);
        assert_eq!(merged["k"], json!(["x1", "x2", "y1"]));
    }

    #[test]
    fn scalars_override() {
        let a = obj(json!({"k": 1, "other": "keep"}));
        let b = obj(json!({"k": "two"}));
        let merged = deep_merge(a, &b);
        assert_eq!(merged["k"], json!("two"));
        assert_eq!(merged["other"], json!("keep"));
    }

    #[test]
    fn type_conflict_overrides() {
        let a = obj(json!({"k": {"nested": true}}));
        let b = obj(json!({"k": [1, 2]}));
        assert_eq!(deep_merge(a, &b)["k"], json!([1, 2]));
    }

    #[test]
    fn null_in_src_preserves_dst() {
        let a = obj(json!({"k": "keep"}));
        let b = obj(json!({"k": null, "new": null}));
        let merged = deep_merge(a, &b);
        assert_eq!(merged["k"], json!("keep"));
        // a key only present as null still lands as null
        assert_eq!(merged["new"], Value::Null);
    }

    #[test]
    fn two_import_merge() {
        // analytics then analytics-engineers, imported in that order
        let analytics = obj(json!({
            "DD": "dd_xxx",
            "common": {"region": "us-east-1"},
            "tags": ["analytics"],
        }));
        let engineers = obj(json!({
            "STRIPE": "sk_xxx",
            "common": {"env": "prod"},
            "tags": ["engineers"],
        }));
        let merged = deep_merge(analytics, &engineers);
        assert_eq!(
            Value::Object(merged),
            json!({
                "DD": "dd_xxx",
                "STRIPE": "sk_xxx",
                "common": {"region": "us-east-1", "env": "prod"},
                "tags": ["analytics", "engineers"],
            })
        );
    }

    #[test]
    fn deep_equal_normalizes_numbers() {
        assert!(deep_equal(&json!({"n": 1}), &json!({"n": 1.0})));
        assert!(deep_equal(&json!([1, 2.5]), &json!([1.0, 2.5])));
        assert!(!deep_equal(&json!({"n": 1}), &json!({"n": 2})));
    }

    #[test]
    fn compare_secrets_ignores_key_order_and_width() {
        let a = br#"{"a": 1, "b": "x"}"#;
        let b = br#"{"b": "x", "a": 1.0}"#;
        assert!(compare_secrets_json(a, b));
    }

    #[test]
    fn compare_secrets_non_json_falls_back_to_bytes() {
        assert!(compare_secrets_json(b"not-json", b"not-json"));
        assert!(!compare_secrets_json(b"not-json", b"other"));
        // existing is JSON, new is not
        assert!(!compare_secrets_json(br#"{"a":1}"#, b"not-json"));
    }

    #[test]
    fn deep_merge_json_round_trip() {
        let merged = deep_merge_json(br#"{"a": [1]}"#, br#"{"a": [2], "b": true}"#).unwrap();
        let val: Value = serde_json::from_slice(&merged).unwrap();
        assert_eq!(val, json!({"a": [1, 2], "b": true}));
    }

    #[test]
    fn deep_merge_json_empty_dst() {
        let merged = deep_merge_json(b"", br#"{"a": 1}"#).unwrap();
        let val: Value = serde_json::from_slice(&merged).unwrap();
        assert_eq!(val, json!({"a": 1}));
    }
}
