//! Canonical JSON encoder and payload hashing.
//!
//! Every place the rest of this crate needs a byte-exact hash over a JSON value —
//! the attestation chain, checkpoint fingerprints, idempotency scope/payload hashes,
//! inclusion-proof and transparency-log chain hashes — goes through [`canonical_bytes`]
//! and [`payload_hash`]. Two semantically equal `serde_json::Value`s must always
//! produce the same bytes: object keys sorted lexicographically at every level, no
//! insignificant whitespace, and numbers rendered in their minimal decimal form.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

/// Render a JSON value into its canonical byte form.
///
/// Object keys are sorted lexicographically (recursively); arrays keep their
/// order (order is semantically significant for arrays); strings are escaped
/// with `serde_json`'s standard escaping; numbers are rendered through
/// `serde_json`'s own formatter, which already produces a minimal decimal
/// form for both integers and floats.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out.into_bytes()
}

/// Serialize `x` to JSON and render it canonically.
pub fn canonical_bytes_of<T: Serialize>(x: &T) -> Result<Vec<u8>, serde_json::Error> {
    let value = serde_json::to_value(x)?;
    Ok(canonical_bytes(&value))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            // serde_json already renders the minimal canonical decimal form.
            let _ = write!(out, "{}", n);
        }
        Value::String(s) => write_json_string(s, out),
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
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

fn write_json_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// `SHA256(canonical(x))`, hex-encoded.
pub fn payload_hash(value: &Value) -> String {
    let bytes = canonical_bytes(value);
    hex_sha256(&bytes)
}

/// `SHA256(canonical(x))` for any serializable type.
pub fn payload_hash_of<T: Serialize>(x: &T) -> Result<String, serde_json::Error> {
    Ok(payload_hash(&serde_json::to_value(x)?))
}

/// Hex-encoded SHA-256 over raw bytes.
pub fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// `H(a || b)` for two hex-encoded hash strings (or arbitrary strings), used
/// throughout the chaining rules (attestation chain, checkpoint hash, linkage
/// hash, transparency chain hash).
pub fn chain_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// First 16 hex characters of `SHA256(input)` — used for deterministic ids
/// (e.g. `evaluation_id = prefix_<first-16-hex-of-SHA256(input)>`).
pub fn short_hex(input: &str) -> String {
    let full = hex_sha256(input.as_bytes());
    full[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_affect_canonical_bytes() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonical_bytes(&a), canonical_bytes(&b));
    }

    #[test]
    fn nested_objects_sort_recursively() {
        let a = json!({"outer": {"z": 1, "a": 2}});
        assert_eq!(
            String::from_utf8(canonical_bytes(&a)).unwrap(),
            r#"{"outer":{"a":2,"z":1}}"#
        );
    }

    #[test]
    fn array_order_is_preserved() {
        let a = json!([3, 1, 2]);
        assert_eq!(String::from_utf8(canonical_bytes(&a)).unwrap(), "[3,1,2]");
    }

    #[test]
    fn payload_hash_is_deterministic() {
        let a = json!({"x": 1, "y": [1, 2, 3]});
        let b = json!({"y": [1, 2, 3], "x": 1});
        assert_eq!(payload_hash(&a), payload_hash(&b));
    }

    #[test]
    fn payload_hash_differs_on_semantic_change() {
        let a = json!({"x": 1});
        let b = json!({"x": 2});
        assert_ne!(payload_hash(&a), payload_hash(&b));
    }

    #[test]
    fn chain_hash_is_order_sensitive() {
        let h1 = chain_hash(&["a", "b"]);
        let h2 = chain_hash(&["b", "a"]);
        assert_ne!(h1, h2);
    }

    #[test]
    fn short_hex_is_16_chars() {
        assert_eq!(short_hex("anything").len(), 16);
    }
}
