//! Offline token model.
//!
//! An offline token is a signed, time-bounded snapshot of license and
//! entitlement state, fetched after activation and refreshed
//! periodically. The server signs the token's *canonical payload*: a
//! key-sorted, whitespace-free JSON rendering of a fixed field set.
//! Verification is only meaningful against that exact byte sequence, so
//! the client re-derives it locally and refuses tokens whose shipped
//! `canonical` string disagrees.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use latchkey_crypto::canonical_json;

use crate::types::Entitlement;

/// Payload of an offline token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineToken {
    /// Token schema version.
    pub schema_version: u32,
    /// License key the token was issued for.
    pub license_key: String,
    /// Product slug.
    pub product_slug: String,
    /// Plan key, when the license belongs to a plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_key: Option<String>,
    /// Licensing mode, e.g. `"per-seat"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Seat limit, when the mode has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seat_limit: Option<u32>,
    /// Device the token is bound to.
    pub device_id: String,
    /// Issued-at (Unix seconds).
    pub iat: i64,
    /// Token expiry (Unix seconds). Absent for tokens bounded only by
    /// the grace period.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    /// Not-before (Unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    /// Absolute license expiry (Unix seconds), when the license has one.
    /// Not part of the signed field set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_expires_at: Option<i64>,
    /// Identifier of the signing key.
    pub kid: String,
    /// Entitlements snapshotted into the token.
    #[serde(default)]
    pub entitlements: Vec<Entitlement>,
}

impl OfflineToken {
    /// Re-derive the canonical payload this token's signature covers.
    ///
    /// Field set is fixed; optional fields are omitted when absent.
    #[must_use]
    pub fn canonical_payload(&self) -> String {
        let mut map = Map::new();
        map.insert("schema_version".into(), Value::from(self.schema_version));
        map.insert("license_key".into(), Value::from(self.license_key.clone()));
        map.insert(
            "product_slug".into(),
            Value::from(self.product_slug.clone()),
        );
        if let Some(ref plan_key) = self.plan_key {
            map.insert("plan_key".into(), Value::from(plan_key.clone()));
        }
        if let Some(ref mode) = self.mode {
            map.insert("mode".into(), Value::from(mode.clone()));
        }
        if let Some(seat_limit) = self.seat_limit {
            map.insert("seat_limit".into(), Value::from(seat_limit));
        }
        map.insert("device_id".into(), Value::from(self.device_id.clone()));
        map.insert("iat".into(), Value::from(self.iat));
        if let Some(exp) = self.exp {
            map.insert("exp".into(), Value::from(exp));
        }
        if let Some(nbf) = self.nbf {
            map.insert("nbf".into(), Value::from(nbf));
        }
        map.insert("kid".into(), Value::from(self.kid.clone()));
        map.insert(
            "entitlements".into(),
            serde_json::to_value(&self.entitlements).unwrap_or(Value::Array(vec![])),
        );

        canonical_json(&Value::Object(map))
    }
}

/// Detached signature over a token's canonical payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSignature {
    /// Signature algorithm. Only `"ed25519"` is accepted.
    pub algorithm: String,
    /// Identifier of the key that produced the signature.
    pub key_id: String,
    /// base64url-encoded signature bytes.
    pub value: String,
}

/// A complete offline token as fetched from the server and cached
/// locally: payload, signature, and the exact canonical string that was
/// signed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedOfflineToken {
    /// Token payload.
    pub token: OfflineToken,
    /// Detached signature.
    pub signature: TokenSignature,
    /// The byte sequence the server signed.
    pub canonical: String,
}

impl SignedOfflineToken {
    /// Check that the shipped canonical string matches the local
    /// re-derivation from the token fields.
    #[must_use]
    pub fn canonical_matches(&self) -> bool {
        self.canonical == self.token.canonical_payload()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    pub(crate) fn sample_token() -> OfflineToken {
        OfflineToken {
            schema_version: 1,
            license_key: "KEY-A".into(),
            product_slug: "acme-editor".into(),
            plan_key: Some("pro".into()),
            mode: None,
            seat_limit: Some(5),
            device_id: "device-1".into(),
            iat: 1_700_000_000,
            exp: Some(1_800_000_000),
            nbf: None,
            license_expires_at: None,
            kid: "signing-2026-01".into(),
            entitlements: vec![Entitlement {
                key: "export-pdf".into(),
                expires_at: None,
                metadata: serde_json::Value::Null,
            }],
        }
    }

    #[test]
    fn test_canonical_is_key_sorted_and_compact() {
        let canonical = sample_token().canonical_payload();
        assert!(!canonical.contains(' '));
        // "device_id" sorts before "entitlements" before "exp"
        let di = canonical.find("\"device_id\"").unwrap();
        let en = canonical.find("\"entitlements\"").unwrap();
        let ex = canonical.find("\"exp\"").unwrap();
        assert!(di < en && en < ex);
    }

    #[test]
    fn test_canonical_omits_absent_fields() {
        let canonical = sample_token().canonical_payload();
        assert!(!canonical.contains("\"mode\""));
        assert!(!canonical.contains("\"nbf\""));
    }

    #[test]
    fn test_canonical_excludes_license_expiry() {
        let mut token = sample_token();
        token.license_expires_at = Some(1_900_000_000);
        assert!(!token.canonical_payload().contains("license_expires_at"));
    }

    #[test]
    fn test_canonical_deterministic() {
        let token = sample_token();
        assert_eq!(token.canonical_payload(), token.canonical_payload());
    }

    #[test]
    fn test_canonical_matches_detects_divergence() {
        let token = sample_token();
        let good = SignedOfflineToken {
            canonical: token.canonical_payload(),
            token: token.clone(),
            signature: TokenSignature {
                algorithm: "ed25519".into(),
                key_id: token.kid.clone(),
                value: String::new(),
            },
        };
        assert!(good.canonical_matches());

        let mut bad = good.clone();
        bad.canonical.push('x');
        assert!(!bad.canonical_matches());
    }

    #[test]
    fn test_token_serde_roundtrip() {
        let mut token = sample_token();
        token.entitlements[0].metadata = json!({"dpi": 300});
        let encoded = serde_json::to_string(&token).unwrap();
        let decoded: OfflineToken = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.canonical_payload(), token.canonical_payload());
    }
}
