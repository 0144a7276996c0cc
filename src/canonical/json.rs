//! Canonical JSON form for request hashing.
//!
//! Two requests that differ only in key order, insignificant whitespace,
//! explicit-default parameters or `null` fields must hash identically, so the
//! transform below is applied before serialization:
//!
//! 1. properties whose value equals the documented OpenAI default are removed
//! 2. `null` fields are dropped (present-null collapses to absent)
//! 3. object keys sort lexicographically
//! 4. floats round to 2 decimal places, half-up
//! 5. strings are trimmed and internal whitespace runs collapse to one space
//!
//! `serde_json`'s default `Map` is a `BTreeMap`, so serializing the
//! transformed value yields sorted keys and a byte-deterministic encoding.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Documented parameter defaults. A property equal to its default carries no
/// information and is stripped so that explicit and implicit defaults hash
/// the same.
const DOCUMENTED_DEFAULTS: &[(&str, DefaultValue)] = &[
    ("temperature", DefaultValue::Float(1.0)),
    ("top_p", DefaultValue::Float(1.0)),
    ("n", DefaultValue::Int(1)),
    ("stream", DefaultValue::Bool(false)),
    ("presence_penalty", DefaultValue::Float(0.0)),
    ("frequency_penalty", DefaultValue::Float(0.0)),
];

enum DefaultValue {
    Float(f64),
    Int(i64),
    Bool(bool),
}

impl DefaultValue {
    fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (DefaultValue::Float(d), Value::Number(n)) => {
                n.as_f64().is_some_and(|v| (v - d).abs() < 1e-9)
            }
            (DefaultValue::Int(d), Value::Number(n)) => n.as_i64() == Some(*d),
            (DefaultValue::Bool(d), Value::Bool(b)) => b == d,
            _ => false,
        }
    }
}

/// Apply the canonical transform recursively.
pub fn canonicalize_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, val) in map {
                if val.is_null() {
                    continue;
                }
                if is_documented_default(key, val) {
                    continue;
                }
                out.insert(key.clone(), canonicalize_value(val));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_value).collect()),
        Value::Number(n) => round_number(n),
        Value::String(s) => Value::String(normalize_string(s)),
        other => other.clone(),
    }
}

/// Serialize a value in canonical form.
///
/// Uses an explicit writer with its own key sort rather than relying on the
/// backing map's iteration order, so the encoding stays deterministic even
/// if some dependency flips `serde_json`'s `preserve_order` feature on.
pub fn to_canonical_json(value: &Value) -> String {
    let canonical = canonicalize_value(value);
    let mut out = String::new();
    write_canonical(&canonical, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
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
        leaf => out.push_str(&serde_json::to_string(leaf).unwrap_or_default()),
    }
}

/// SHA-256 of the canonical JSON, lowercase hex.
pub fn exact_key(canonical_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json.as_bytes());
    hex::encode(hasher.finalize())
}

fn is_documented_default(key: &str, value: &Value) -> bool {
    DOCUMENTED_DEFAULTS
        .iter()
        .any(|(name, default)| *name == key && default.matches(value))
}

/// Round a float to 2 decimal places, half-up. Integers pass through.
fn round_number(n: &serde_json::Number) -> Value {
    if n.is_i64() || n.is_u64() {
        return Value::Number(n.clone());
    }
    match n.as_f64() {
        Some(v) => {
            let rounded = (v * 100.0).round() / 100.0;
            serde_json::Number::from_f64(rounded)
                .map(Value::Number)
                .unwrap_or_else(|| Value::Number(n.clone()))
        }
        None => Value::Number(n.clone()),
    }
}

/// Trim and collapse internal whitespace runs to a single space.
fn normalize_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_whitespace = false;
    for ch in s.trim().chars() {
        if ch.is_whitespace() {
            in_whitespace = true;
        } else {
            if in_whitespace && !out.is_empty() {
                out.push(' ');
            }
            in_whitespace = false;
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn canonicalization_is_idempotent() {
        let value = json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "  What   is 2+2? "}],
            "temperature": 0.73456,
        });
        let once = canonicalize_value(&value);
        let twice = canonicalize_value(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn key_order_does_not_affect_exact_key() {
        let a = json!({"model": "gpt-4", "messages": [], "top_p": 0.9});
        let b = json!({"top_p": 0.9, "messages": [], "model": "gpt-4"});
        assert_eq!(exact_key(&to_canonical_json(&a)), exact_key(&to_canonical_json(&b)));
    }

    #[test]
    fn explicit_default_does_not_change_exact_key() {
        let implicit = json!({"model": "gpt-4", "messages": []});
        let explicit = json!({
            "model": "gpt-4",
            "messages": [],
            "temperature": 1.0,
            "top_p": 1.0,
            "n": 1,
            "stream": false,
            "presence_penalty": 0.0,
            "frequency_penalty": 0.0,
        });
        assert_eq!(
            exact_key(&to_canonical_json(&implicit)),
            exact_key(&to_canonical_json(&explicit))
        );
    }

    #[test]
    fn null_collapses_to_absent() {
        let with_null = json!({"model": "gpt-4", "messages": [], "user": null});
        let without = json!({"model": "gpt-4", "messages": []});
        assert_eq!(
            to_canonical_json(&with_null),
            to_canonical_json(&without)
        );
    }

    #[test]
    fn floats_round_half_up_to_two_places() {
        // 0.875 is exact in binary, so the half-up behavior is observable.
        let value = json!({"x": 0.875});
        assert_eq!(to_canonical_json(&value), r#"{"x":0.88}"#);
        let value = json!({"x": 0.874});
        assert_eq!(to_canonical_json(&value), r#"{"x":0.87}"#);
        let value = json!({"x": 0.73456});
        assert_eq!(to_canonical_json(&value), r#"{"x":0.73}"#);
    }

    #[test]
    fn strings_trim_and_collapse_whitespace() {
        let value = json!({"s": "  a \t b\n\nc "});
        assert_eq!(to_canonical_json(&value), r#"{"s":"a b c"}"#);
    }

    #[test]
    fn non_default_values_survive() {
        let value = json!({"temperature": 0.2, "stream": true, "n": 2});
        let canonical = to_canonical_json(&value);
        assert!(canonical.contains("temperature"));
        assert!(canonical.contains("stream"));
        assert!(canonical.contains("\"n\""));
    }
}
