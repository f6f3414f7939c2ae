//! Ed25519 signature verification.
//!
//! Offline tokens are signed server-side with Ed25519; the client only
//! ever holds the 32-byte public verification key.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::error::CryptoError;

/// Ed25519 verifier.
///
/// Malformed inputs (wrong key or signature length, non-canonical key
/// bytes) are errors; a well-formed signature that simply does not match
/// returns `Ok(false)`.
pub struct Ed25519Verifier;

impl Ed25519Verifier {
    /// Create a new verifier.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Verify `signature` over `data` using `public_key`.
    ///
    /// # Errors
    ///
    /// Returns error if the public key or signature is malformed.
    pub fn verify(
        &self,
        public_key: &[u8],
        data: &[u8],
        signature: &[u8],
    ) -> Result<bool, CryptoError> {
        if public_key.len() != 32 {
            return Err(CryptoError::invalid_public_key(format!(
                "Ed25519 public key must be 32 bytes, got {}",
                public_key.len()
            )));
        }

        let mut pk_bytes = [0u8; 32];
        pk_bytes.copy_from_slice(public_key);

        let vk = VerifyingKey::from_bytes(&pk_bytes)
            .map_err(|e| CryptoError::invalid_public_key(e.to_string()))?;

        if signature.len() != 64 {
            return Err(CryptoError::invalid_signature(format!(
                "Ed25519 signature must be 64 bytes, got {}",
                signature.len()
            )));
        }

        let mut sig_bytes = [0u8; 64];
        sig_bytes.copy_from_slice(signature);

        let sig = Signature::from_bytes(&sig_bytes);

        match vk.verify(data, &sig) {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}

impl Default for Ed25519Verifier {
    fn default() -> Self {
        Self::new()
    }
}
