//! Core licensing types.

use serde::{Deserialize, Serialize};

/// The locally cached license record.
///
/// Owned exclusively by the cache store; the engine reads a copy and
/// writes back an updated copy. Identity is `license_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct License {
    /// The license key.
    pub license_key: String,
    /// Device identifier this activation is bound to.
    pub device_id: String,
    /// Server-assigned activation identifier.
    pub activation_id: String,
    /// When the license was activated (Unix seconds).
    pub activated_at: i64,
    /// Last successful validation, online or offline (Unix seconds).
    pub last_validated: Option<i64>,
    /// Last validation confirmed by the server (Unix seconds).
    /// Drives the offline grace period.
    pub last_validated_online: Option<i64>,
    /// Result of the most recent validation attempt.
    pub validation: Option<ValidationResult>,
}

/// Outcome of one validation attempt. Immutable: each attempt produces
/// a fresh value that replaces the previous one wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Whether the license is valid.
    pub valid: bool,
    /// Machine-readable reason code when invalid.
    pub code: Option<String>,
    /// Whether this result came from offline verification.
    pub offline: bool,
    /// Entitlements active at validation time.
    pub active_entitlements: Vec<Entitlement>,
    /// When this result was produced (Unix seconds).
    pub validated_at: i64,
}

/// A single entitlement within a validation result or offline token.
///
/// Keys are unique within one result; an entitlement never outlives the
/// result that owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entitlement {
    /// Entitlement key, e.g. `"export-pdf"`.
    pub key: String,
    /// Optional absolute expiry (Unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    /// Free-form metadata. The only intentionally loose-typed field in
    /// the data model.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl Entitlement {
    /// Check whether the entitlement is active at `now`.
    #[must_use]
    pub fn is_active(&self, now: i64) -> bool {
        self.expires_at.map_or(true, |exp| now <= exp)
    }
}

/// High-level license state exposed to callers.
///
/// Derived purely from cached data; [`LicenseEngine::status`] never
/// performs I/O and never fails.
///
/// [`LicenseEngine::status`]: crate::engine::LicenseEngine::status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseState {
    /// No license activated.
    Inactive,
    /// Activated but never validated.
    Pending,
    /// Valid, last confirmed online.
    Active,
    /// Invalid per the server.
    Invalid,
    /// Valid per offline verification.
    OfflineValid,
    /// Offline verification failed.
    OfflineInvalid,
}

impl LicenseState {
    /// Check whether the license currently grants access.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Active | Self::OfflineValid)
    }

    /// Check whether the state was produced without server contact.
    #[must_use]
    pub fn is_offline(&self) -> bool {
        matches!(self, Self::OfflineValid | Self::OfflineInvalid)
    }
}

/// Outcome of an entitlement lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntitlementStatus {
    /// Entitlement is present and unexpired.
    Active {
        /// Absolute expiry, if the entitlement has one.
        expires_at: Option<i64>,
    },
    /// Entitlement is present but past its expiry.
    Expired {
        /// When it expired.
        expired_at: i64,
    },
    /// Entitlement is not part of the current validation result.
    NotFound,
    /// No license is activated.
    NoLicense,
}

impl EntitlementStatus {
    /// Check whether the entitlement grants access.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }
}

/// Lifecycle events emitted by the engine and scheduler.
///
/// Carried over a broadcast channel; collaborators observe, they do not
/// decide. Payloads are typed, not dictionaries.
#[derive(Debug, Clone)]
pub enum LicenseEvent {
    /// Activation succeeded.
    ActivationSuccess {
        /// The activated license key.
        license_key: String,
    },
    /// Online validation produced a result (valid or not).
    ValidationSuccess {
        /// The validation result.
        result: ValidationResult,
    },
    /// Offline verification succeeded after an online failure.
    OfflineValidationSuccess {
        /// The offline validation result.
        result: ValidationResult,
    },
    /// Validation failed with no usable fallback.
    ValidationFailure {
        /// Reason code, when one exists.
        code: Option<String>,
    },
    /// Cached state was purged after an authoritative rejection.
    LicensePurged {
        /// The server's reason code.
        code: Option<String>,
    },
    /// Deactivation completed and local state was cleared.
    DeactivationSuccess,
    /// Connectivity transitioned to offline.
    NetworkOffline,
    /// Connectivity transitioned back to online.
    NetworkOnline,
    /// The scheduler started its cycles.
    SchedulerStarted,
    /// The scheduler stopped.
    SchedulerStopped,
}

impl LicenseEvent {
    /// Stable event name, e.g. `"validation:offline-success"`.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ActivationSuccess { .. } => "activation:success",
            Self::ValidationSuccess { .. } => "validation:success",
            Self::OfflineValidationSuccess { .. } => "validation:offline-success",
            Self::ValidationFailure { .. } => "validation:failure",
            Self::LicensePurged { .. } => "license:purged",
            Self::DeactivationSuccess => "deactivation:success",
            Self::NetworkOffline => "network:offline",
            Self::NetworkOnline => "network:online",
            Self::SchedulerStarted => "scheduler:started",
            Self::SchedulerStopped => "scheduler:stopped",
        }
    }
}
