//! Error types for licensing operations.
//!
//! The taxonomy drives engine policy:
//!
//! - **network** errors (timeout, DNS, connection refused, 5xx, 408) are
//!   eligible for offline fallback;
//! - **semantic** rejections (4xx with a reason code, excluding 401, 403
//!   and 429) are authoritative and purge cached state on `validate`;
//!   401/403 describe the API credential and 429 the connection, not the
//!   license, so none of them may destroy cached license state;
//! - **configuration** errors fail fast before any network call;
//! - **storage** and **crypto** errors are local faults.

use thiserror::Error;

use crate::config::OfflineFallbackMode;

/// Errors that can occur during licensing operations.
#[derive(Debug, Error)]
pub enum LicenseError {
    /// Network-level failure: timeout, DNS, connection refused.
    #[error("Network error: {message}")]
    Network {
        /// Error message.
        message: String,
    },

    /// Request timed out.
    #[error("Request timed out after {seconds}s")]
    Timeout {
        /// Configured timeout in seconds.
        seconds: u64,
    },

    /// Server-side failure (5xx, 408): the server is unwell, not the license.
    #[error("Server error: HTTP {status}")]
    ServerError {
        /// HTTP status code.
        status: u16,
    },

    /// Definitive server-side rejection: the server is reachable and says no.
    #[error("Rejected (HTTP {status}): {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Machine-readable reason code (e.g. `revoked`, `license_expired`).
        code: Option<String>,
        /// Human-readable message from the server.
        message: String,
    },

    /// Authentication or authorization failure (HTTP 401/403): the API
    /// key is missing, wrong, or lacks permission. Says nothing about
    /// the license itself, so it never purges cached state.
    #[error("Unauthorized: {message}")]
    Unauthorized {
        /// Error message.
        message: String,
    },

    /// Rate limited (HTTP 429).
    #[error("Rate limited")]
    RateLimited,

    /// No license is cached locally.
    #[error("No license activated")]
    NoLicense,

    /// Configuration error: missing product slug, API key, etc.
    #[error("Configuration error: {message}")]
    Config {
        /// Error message.
        message: String,
    },

    /// Local cache store failure.
    #[error("Storage error: {message}")]
    Storage {
        /// Error message.
        message: String,
    },

    /// Cryptographic failure during offline verification.
    #[error("Crypto error: {0}")]
    Crypto(#[from] latchkey_crypto::CryptoError),
}

impl LicenseError {
    /// Check whether this is a network-class failure (the server never
    /// answered meaningfully).
    #[must_use]
    pub fn is_network_failure(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Timeout { .. } | Self::ServerError { .. }
        )
    }

    /// Check whether this is an authoritative semantic rejection.
    ///
    /// 401 and 429 are deliberately excluded: they describe the caller
    /// or the connection, not the license.
    #[must_use]
    pub fn is_semantic_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// Check whether the engine may fall back to offline verification
    /// after this failure, under the given policy.
    #[must_use]
    pub fn is_fallback_eligible(&self, mode: OfflineFallbackMode) -> bool {
        match mode {
            OfflineFallbackMode::NetworkOnly => self.is_network_failure(),
            OfflineFallbackMode::Always => {
                self.is_network_failure() || self.is_semantic_rejection() || matches!(self, Self::RateLimited)
            },
        }
    }

    /// Reason code a semantic rejection carries, if any.
    #[must_use]
    pub fn rejection_code(&self) -> Option<&str> {
        match self {
            Self::Rejected { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}
