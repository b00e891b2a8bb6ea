//! Canonical JSON value trees.
//!
//! Resource payloads are kept as `serde_json::Value` trees whose objects are
//! ordered maps. Values are canonicalized once at decode time so that
//! structural equality is meaningful: `1.0` and `1` compare equal, key order
//! never matters.

use serde_json::{Map, Number, Value};

/// Largest integer an `f64` represents exactly.
const MAX_EXACT_F64: f64 = 9_007_199_254_740_992.0;

/// Canonicalize a decoded value tree.
pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::Number(n) => Value::Number(canonical_number(n)),
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        Value::Object(map) => Value::Object(canonicalize_map(map)),
        other => other,
    }
}

/// Canonicalize every value of an object.
pub fn canonicalize_map(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter().map(|(k, v)| (k, canonicalize(v))).collect()
}

fn canonical_number(n: Number) -> Number {
    if !n.is_f64() {
        return n;
    }
    match n.as_f64() {
        Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < MAX_EXACT_F64 => {
            if f >= 0.0 {
                Number::from(f as u64)
            } else {
                Number::from(f as i64)
            }
        }
        _ => n,
    }
}

/// Render a label value as a string.
pub fn label_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integral_floats_collapse() {
        let a = canonicalize(json!({"timeout": {"connect": 1.0, "read": 2.5}, "retries": [3.0, -4.0]}));
        let b = canonicalize(json!({"retries": [3, -4], "timeout": {"read": 2.5, "connect": 1}}));
        assert_eq!(a, b);
    }

    #[test]
    fn test_non_integral_values_untouched() {
        assert_eq!(canonicalize(json!(0.25)), json!(0.25));
        assert_eq!(canonicalize(json!("1.0")), json!("1.0"));
        assert_eq!(canonicalize(json!(null)), json!(null));
    }

    #[test]
    fn test_label_string() {
        assert_eq!(label_string(&json!("prod")), "prod");
        assert_eq!(label_string(&json!(42)), "42");
    }
}
