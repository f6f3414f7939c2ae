//! Shared fixtures for integration tests: deterministic signing keys
//! and signed offline tokens.

#![allow(dead_code)]

use ed25519_dalek::{Signer, SigningKey};
use latchkey_core::{Entitlement, OfflineToken, SignedOfflineToken, TokenSignature};

pub const KID: &str = "kid-2024-01";
pub const LICENSE_KEY: &str = "KEY-A";
pub const DEVICE_ID: &str = "device-1";

pub fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[42u8; 32])
}

pub fn public_key() -> Vec<u8> {
    signing_key().verifying_key().to_bytes().to_vec()
}

pub fn base_token(iat: i64, exp: Option<i64>) -> OfflineToken {
    OfflineToken {
        schema_version: 1,
        license_key: LICENSE_KEY.into(),
        product_slug: "test-product".into(),
        plan_key: Some("pro".into()),
        mode: None,
        seat_limit: Some(5),
        device_id: DEVICE_ID.into(),
        iat,
        exp,
        nbf: None,
        license_expires_at: None,
        kid: KID.into(),
        entitlements: vec![Entitlement {
            key: "pro".into(),
            expires_at: None,
            metadata: serde_json::Value::Null,
        }],
    }
}

pub fn sign(token: OfflineToken) -> SignedOfflineToken {
    let canonical = token.canonical_payload();
    let signature = signing_key().sign(canonical.as_bytes());
    SignedOfflineToken {
        token,
        signature: TokenSignature {
            algorithm: "ed25519".into(),
            key_id: KID.into(),
            value: latchkey_crypto::base64url_encode(&signature.to_bytes()),
        },
        canonical,
    }
}
