//! Offline token verification.
//!
//! A pure decision function: given a cached token, a public key, and the
//! temporal context, decide whether the license is valid without any
//! network access. Checks run in a fixed order and the first failure
//! short-circuits. Signature validity is established *before* any field
//! inside the payload is trusted — including the license key used for
//! the identity check — otherwise a forged-but-parseable payload could
//! pass the later checks.
//!
//! No I/O happens here. The engine persists the last-seen timestamp
//! after a successful outcome; the function itself only decides.

use latchkey_crypto::{base64url_decode, constant_time_eq, Ed25519Verifier};

use crate::token::SignedOfflineToken;
use crate::types::Entitlement;

/// Seconds per day, for the grace-period day count.
const SECS_PER_DAY: i64 = 86_400;

/// Reason codes for failed offline verification.
///
/// Surfaced verbatim (snake_case) in validation results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineErrorCode {
    /// No offline token is cached.
    NoOfflineToken,
    /// No public key is cached for the token's `kid`.
    /// The caller is expected to fetch the key and retry once.
    NoPublicKey,
    /// Signature does not verify against the canonical payload.
    SignatureInvalid,
    /// Token's license key differs from the cached license.
    LicenseMismatch,
    /// Token past its `exp`.
    TokenExpired,
    /// Token before its `nbf`.
    TokenNotYetValid,
    /// License past its absolute expiry.
    LicenseExpired,
    /// Too long since the last confirmed online validation.
    GracePeriodExpired,
    /// Device clock moved backward beyond tolerance.
    ClockTamper,
    /// Malformed token, signature, or key: undecidable, not invalid.
    VerificationError,
}

impl OfflineErrorCode {
    /// The snake_case wire representation of this code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoOfflineToken => "no_offline_token",
            Self::NoPublicKey => "no_public_key",
            Self::SignatureInvalid => "signature_invalid",
            Self::LicenseMismatch => "license_mismatch",
            Self::TokenExpired => "token_expired",
            Self::TokenNotYetValid => "token_not_yet_valid",
            Self::LicenseExpired => "license_expired",
            Self::GracePeriodExpired => "grace_period_expired",
            Self::ClockTamper => "clock_tamper",
            Self::VerificationError => "verification_error",
        }
    }
}

impl std::fmt::Display for OfflineErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one offline verification attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyOutcome {
    /// The license is valid offline; these entitlements are active.
    Valid {
        /// Entitlements from the verified token.
        entitlements: Vec<Entitlement>,
    },
    /// Verification failed.
    Invalid {
        /// Why.
        code: OfflineErrorCode,
    },
}

impl VerifyOutcome {
    /// Check whether this outcome is valid.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }
}

/// Inputs to one offline verification.
///
/// Everything temporal comes in as a parameter so the function stays
/// deterministic and directly unit-testable.
#[derive(Debug, Clone, Copy)]
pub struct VerifyInput<'a> {
    /// Cached offline token, if any.
    pub token: Option<&'a SignedOfflineToken>,
    /// Public key for the token's `kid`, if cached.
    pub public_key: Option<&'a [u8]>,
    /// License key of the cached license record.
    pub cached_license_key: &'a str,
    /// Last server-confirmed validation (Unix seconds). When absent,
    /// the grace period anchors on the token's signed issue time.
    pub last_validated_online: Option<i64>,
    /// Last proven liveness with the server (Unix seconds).
    pub last_seen: Option<i64>,
    /// Current wall-clock time (Unix seconds).
    pub now: i64,
    /// Offline grace period in days; `0` disables the check.
    pub max_offline_days: u32,
    /// Tolerated backward clock drift in milliseconds.
    pub max_clock_skew_ms: u64,
}

/// Verify an offline token. Checks run in order; first failure wins.
#[must_use]
pub fn verify(input: &VerifyInput<'_>) -> VerifyOutcome {
    let invalid = |code| VerifyOutcome::Invalid { code };

    // 1. A token must exist at all.
    let Some(signed) = input.token else {
        return invalid(OfflineErrorCode::NoOfflineToken);
    };

    // 2. And a public key for its kid.
    let Some(public_key) = input.public_key else {
        return invalid(OfflineErrorCode::NoPublicKey);
    };

    // 3. Signature over the canonical payload, before trusting any field.
    if !signed.signature.algorithm.eq_ignore_ascii_case("ed25519") {
        return invalid(OfflineErrorCode::VerificationError);
    }
    let signature = match base64url_decode(&signed.signature.value) {
        Ok(bytes) => bytes,
        Err(_) => return invalid(OfflineErrorCode::VerificationError),
    };
    match Ed25519Verifier::new().verify(public_key, signed.canonical.as_bytes(), &signature) {
        Ok(true) => {},
        Ok(false) => return invalid(OfflineErrorCode::SignatureInvalid),
        Err(_) => return invalid(OfflineErrorCode::VerificationError),
    }
    // The parsed payload must be the exact thing that was signed,
    // otherwise later checks would trust unsigned fields.
    if !signed.canonical_matches() {
        return invalid(OfflineErrorCode::VerificationError);
    }

    let token = &signed.token;

    // 4. Identity: license keys are secrets, compare in constant time.
    if !constant_time_eq(
        token.license_key.as_bytes(),
        input.cached_license_key.as_bytes(),
    ) {
        return invalid(OfflineErrorCode::LicenseMismatch);
    }

    // 5. Token expiry.
    if let Some(exp) = token.exp {
        if input.now > exp {
            return invalid(OfflineErrorCode::TokenExpired);
        }
    }

    // 6. Not-before.
    if let Some(nbf) = token.nbf {
        if input.now < nbf {
            return invalid(OfflineErrorCode::TokenNotYetValid);
        }
    }

    // 7. Absolute license expiry.
    if let Some(license_exp) = token.license_expires_at {
        if input.now > license_exp {
            return invalid(OfflineErrorCode::LicenseExpired);
        }
    }

    // 8. Grace period: whole days since the last confirmed online
    //    validation. Exactly max_offline_days is still valid. A license
    //    that was never validated online anchors on the signed token
    //    issue time instead; the window must not be unbounded.
    if input.max_offline_days > 0 {
        let anchor = input.last_validated_online.unwrap_or(token.iat);
        let days = (input.now - anchor).max(0) / SECS_PER_DAY;
        if days > i64::from(input.max_offline_days) {
            return invalid(OfflineErrorCode::GracePeriodExpired);
        }
    }

    // 9. Clock tamper: wall clock moved backward past the last proven
    //    liveness, beyond tolerance.
    if let Some(last_seen) = input.last_seen {
        let skew_secs = (input.max_clock_skew_ms / 1000) as i64;
        if input.now + skew_secs < last_seen {
            return invalid(OfflineErrorCode::ClockTamper);
        }
    }

    // 10. Valid.
    VerifyOutcome::Valid {
        entitlements: token.entitlements.clone(),
    }
}
