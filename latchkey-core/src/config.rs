//! Configuration for the licensing engine.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::LicenseError;

/// Policy for falling back to offline verification after a failed
/// online validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OfflineFallbackMode {
    /// Only network-class failures (timeout, DNS, 5xx) fall back.
    /// A reachable server that rejects the license never falls back;
    /// optimistic offline trust after a confirmed rejection is a
    /// security hole. This is the default.
    #[default]
    NetworkOnly,
    /// Any failed validation attempts offline verification.
    Always,
}

/// Configuration for a [`LicenseEngine`](crate::engine::LicenseEngine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the licensing API.
    pub api_base_url: String,
    /// Product slug the license keys belong to.
    pub product_slug: String,
    /// API key sent as bearer auth.
    pub api_key: String,
    /// Storage prefix for multi-tenant isolation within one device.
    pub storage_prefix: String,
    /// Directory for persistent cache. `None` keeps state in memory only.
    pub cache_dir: Option<PathBuf>,
    /// Caller-supplied device identifier. Generated (UUID v4) if absent.
    pub device_id: Option<String>,
    /// Request timeout.
    pub timeout: Duration,
    /// Interval between scheduled auto-validations.
    pub auto_validate_interval: Duration,
    /// Interval between offline-asset refreshes (token + signing key).
    pub offline_refresh_interval: Duration,
    /// Heartbeat interval. `None` disables heartbeat.
    pub heartbeat_interval: Option<Duration>,
    /// Interval between connectivity probes while offline.
    pub connectivity_probe_interval: Duration,
    /// Maximum days a license stays valid offline since its last
    /// confirmed online validation. `0` disables the grace-period check.
    pub max_offline_days: u32,
    /// Tolerated backward clock drift before offline validation reports
    /// tampering.
    pub max_clock_skew_ms: u64,
    /// Offline fallback policy.
    pub offline_fallback_mode: OfflineFallbackMode,
}

impl EngineConfig {
    /// Validate the configuration. Programmer errors fail fast here,
    /// before any network call.
    ///
    /// # Errors
    ///
    /// Returns `LicenseError::Config` on a missing product slug, API
    /// key, or base URL.
    pub fn validate(&self) -> Result<(), LicenseError> {
        if self.product_slug.trim().is_empty() {
            return Err(LicenseError::Config {
                message: "product_slug is required".into(),
            });
        }
        if self.api_key.trim().is_empty() {
            return Err(LicenseError::Config {
                message: "api_key is required".into(),
            });
        }
        if self.api_base_url.trim().is_empty() {
            return Err(LicenseError::Config {
                message: "api_base_url is required".into(),
            });
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.latchkey.io".into(),
            product_slug: String::new(),
            api_key: String::new(),
            storage_prefix: "latchkey".into(),
            cache_dir: None,
            device_id: None,
            timeout: Duration::from_secs(30),
            auto_validate_interval: Duration::from_secs(60 * 60),
            offline_refresh_interval: Duration::from_secs(24 * 60 * 60),
            heartbeat_interval: None,
            connectivity_probe_interval: Duration::from_secs(30),
            max_offline_days: 14,
            max_clock_skew_ms: 5 * 60 * 1000,
            offline_fallback_mode: OfflineFallbackMode::NetworkOnly,
        }
    }
}
