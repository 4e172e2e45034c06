//! Canonical encoding for the guild log protocol
//!
//! All hashed/signed objects use sorted-key JSON with strict constraints:
//! - Object keys sorted lexicographically by UTF-8 bytes, no whitespace
//! - Strings escape `"` and `\`; control characters and all non-ASCII
//!   code points become `\uXXXX` (surrogate pairs above the BMP)
//! - Numbers in shortest decimal form; no `-0`, no NaN/Infinity
//! - `null` is distinct from an absent key
//!
//! Implementations in other languages MUST produce identical bytes.

use crate::error::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize a value to canonical bytes.
///
/// This is the normative encoding for all hashing and signing operations.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    let mut out = String::new();
    write_value(&value, &mut out)?;
    Ok(out.into_bytes())
}

/// Canonical encoding as a string (same bytes as [`canonical_bytes`]).
pub fn canonical_string<T: Serialize>(value: &T) -> Result<String> {
    let bytes = canonical_bytes(value)?;
    // The writer only emits ASCII.
    Ok(String::from_utf8(bytes).unwrap_or_default())
}

/// SHA-256 over raw bytes.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// `hash(x) = SHA256(canonical(x))`.
pub fn hash<T: Serialize>(value: &T) -> Result<[u8; 32]> {
    Ok(sha256(&canonical_bytes(value)?))
}

/// Lowercase hex of [`hash`].
pub fn hash_hex<T: Serialize>(value: &T) -> Result<String> {
    Ok(hex::encode(hash(value)?))
}

fn write_value(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => write_number(n, out)?,
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_value(&map[key], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn write_number(n: &serde_json::Number, out: &mut String) -> Result<()> {
    if let Some(u) = n.as_u64() {
        out.push_str(&u.to_string());
        return Ok(());
    }
    if let Some(i) = n.as_i64() {
        out.push_str(&i.to_string());
        return Ok(());
    }
    let f = n.as_f64().ok_or(Error::NonFiniteNumber)?;
    if !f.is_finite() {
        return Err(Error::NonFiniteNumber);
    }
    if f == 0.0 {
        // -0.0 collapses to 0
        out.push('0');
    } else {
        out.push_str(&n.to_string());
    }
    Ok(())
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c if (c as u32) >= 0x20 && (c as u32) <= 0x7e => out.push(c),
            c => {
                let mut buf = [0u16; 2];
                for unit in c.encode_utf16(&mut buf) {
                    out.push_str(&format!("\\u{:04x}", unit));
                }
            }
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn canon(v: &Value) -> String {
        String::from_utf8(canonical_bytes(v).unwrap()).unwrap()
    }

    #[test]
    fn sorts_object_keys() {
        let v = json!({"b": 1, "a": "x", "aa": null});
        assert_eq!(canon(&v), r#"{"a":"x","aa":null,"b":1}"#);
    }

    #[test]
    fn nested_objects_and_arrays() {
        let v = json!({"z": [{"k": 2, "j": 1}], "a": {"y": true, "x": false}});
        assert_eq!(canon(&v), r#"{"a":{"x":false,"y":true},"z":[{"j":1,"k":2}]}"#);
    }

    #[test]
    fn escapes_non_ascii() {
        let v = json!({"s": "café"});
        assert_eq!(canon(&v), "{\"s\":\"caf\\u00e9\"}");
        // astral plane goes through a surrogate pair
        let v = json!({"s": "😀"});
        assert_eq!(canon(&v), "{\"s\":\"\\ud83d\\ude00\"}");
    }

    #[test]
    fn escapes_control_chars() {
        let v = json!({"s": "a\nb\tc"});
        assert_eq!(canon(&v), "{\"s\":\"a\\u000ab\\u0009c\"}");
    }

    #[test]
    fn integers_shortest_form() {
        let v = json!({"n": 42u64, "m": -7i64, "zero": 0});
        assert_eq!(canon(&v), r#"{"m":-7,"n":42,"zero":0}"#);
    }

    #[test]
    fn negative_zero_collapses() {
        let v = json!({"n": -0.0});
        assert_eq!(canon(&v), r#"{"n":0}"#);
    }

    #[test]
    fn deterministic() {
        let v = json!({"guildId": "abc", "seq": 3, "prevHash": null});
        assert_eq!(canonical_bytes(&v).unwrap(), canonical_bytes(&v).unwrap());
    }

    #[test]
    fn hash_is_stable_across_key_order() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(hash_hex(&a).unwrap(), hash_hex(&b).unwrap());
    }
}
