//! base64url and canonical JSON encoding.
//!
//! Canonical JSON is the byte sequence that gets signed: object keys
//! sorted ascending, no whitespace, fields with no value omitted by the
//! producer. Signature verification is only meaningful against this
//! exact string, so the canonicalization here must match the signing
//! side byte for byte.

use base64::Engine;
use serde_json::Value;

use crate::error::CryptoError;

/// Decode an unpadded base64url string.
///
/// # Errors
///
/// Returns error if the input is not valid base64url.
pub fn base64url_decode(input: &str) -> Result<Vec<u8>, CryptoError> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(input)
        .map_err(|e| CryptoError::DecodeError {
            reason: e.to_string(),
        })
}

/// Encode bytes as unpadded base64url.
#[must_use]
pub fn base64url_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

/// Serialize a JSON value canonically: key-sorted objects, no whitespace.
///
/// Deterministic for a given value regardless of map insertion order.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
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
                // serde_json string serialization handles escaping
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        },
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        },
        // Scalars already serialize without whitespace
        other => out.push_str(&other.to_string()),
    }
}
