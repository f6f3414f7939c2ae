//! # latchkey-crypto
//!
//! Cryptographic and encoding primitives for the Latchkey licensing
//! engine:
//!
//! - **Ed25519 verification** for offline license tokens. This crate
//!   only verifies; Latchkey never mints signatures on the client.
//! - **Constant-time comparison** for license-key identity checks.
//! - **base64url** (unpadded) encoding used by the wire format.
//! - **Canonical JSON**: deterministic, key-sorted, whitespace-free
//!   serialization so that signing and verification operate over an
//!   identical byte sequence.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod ed25519;
mod encoding;
mod error;

pub use ed25519::Ed25519Verifier;
pub use encoding::{base64url_decode, base64url_encode, canonical_json};
pub use error::CryptoError;

/// Compare two byte slices in constant time.
///
/// Used for license-key identity checks: license keys are secrets
/// comparable to credentials, and default `==` short-circuits on the
/// first differing byte.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;

    if a.len() != b.len() {
        // Still early-return on length, but length is typically not secret.
        // For cases where length is secret, callers should pad to equal length.
        return false;
    }
    a.ct_eq(b).into()
}
