//! Validation orchestrator.
//!
//! [`LicenseEngine`] owns the activate/validate/deactivate/heartbeat
//! state machine. All cache mutation goes through a single async mutex
//! so a manual `validate()` call racing a timer-driven one can never
//! interleave read-modify-write cycles on the license record. Reads
//! (`status`, `check_entitlement`) never take the gate and never touch
//! the network.
//!
//! Validation decision tree:
//! - online success is cached verbatim, valid or not
//! - a semantic rejection (4xx with a reason, excluding auth and rate
//!   limiting) purges all cached state; the server is authoritative
//! - a network or server failure falls back to the offline verifier
//!   against the cached token, subject to the configured fallback mode

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::LicenseError;
use crate::scheduler::{self, SchedulerHandle};
use crate::store::CacheStore;
use crate::transport::{ActivateRequest, HttpTransport, Transport};
use crate::types::{
    EntitlementStatus, License, LicenseEvent, LicenseState, ValidationResult,
};
use crate::verifier::{self, VerifyInput, VerifyOutcome};

/// 422 business codes that already describe the deactivated end state.
const DEACTIVATION_OK_CODES: [&str; 5] = [
    "revoked",
    "already_deactivated",
    "not_active",
    "suspended",
    "expired",
];

/// Event channel capacity. Slow subscribers lag, they never block.
const EVENT_CAPACITY: usize = 64;

/// Caller-supplied activation options.
#[derive(Debug, Clone, Default)]
pub struct ActivateOptions {
    /// Device identifier. Generated when neither this nor the config
    /// provides one.
    pub device_id: Option<String>,
    /// Human-readable device name, forwarded to the server.
    pub device_name: Option<String>,
    /// Arbitrary activation metadata, forwarded to the server.
    pub metadata: Option<serde_json::Value>,
}

/// Client-side license validation engine.
///
/// Create with [`LicenseEngine::new`] for a live HTTP transport, or
/// [`LicenseEngine::with_transport`] to inject one. Instances are
/// independent; two engines with different storage prefixes never see
/// each other's state.
pub struct LicenseEngine {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    store: CacheStore,
    events: broadcast::Sender<LicenseEvent>,
    /// Serializes every cache-mutating operation.
    write_gate: Mutex<()>,
    scheduler: StdMutex<Option<SchedulerHandle>>,
}

impl LicenseEngine {
    /// Create an engine with the default HTTP transport.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the cache
    /// directory cannot be opened.
    pub fn new(config: EngineConfig) -> Result<Arc<Self>, LicenseError> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        Self::with_transport(config, transport)
    }

    /// Create an engine with a caller-provided transport.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the cache
    /// directory cannot be opened.
    pub fn with_transport(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, LicenseError> {
        config.validate()?;
        let store = CacheStore::open(&config.storage_prefix, config.cache_dir.clone())?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Arc::new(Self {
            config,
            transport,
            store,
            events,
            write_gate: Mutex::new(()),
            scheduler: StdMutex::new(None),
        }))
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LicenseEvent> {
        self.events.subscribe()
    }

    /// Activate a license key on this device.
    ///
    /// On success the license is cached pending its first validation,
    /// the scheduler starts, and the offline token is fetched in the
    /// background. On transport failure nothing is cached.
    ///
    /// # Errors
    ///
    /// Returns error if the server refuses the activation or cannot be
    /// reached.
    #[instrument(skip(self, options))]
    pub async fn activate(
        self: &Arc<Self>,
        license_key: &str,
        options: ActivateOptions,
    ) -> Result<License, LicenseError> {
        let _guard = self.write_gate.lock().await;

        let device_id = options
            .device_id
            .or_else(|| self.config.device_id.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let request = ActivateRequest {
            device_id: device_id.clone(),
            device_name: options.device_name,
            metadata: options.metadata,
        };
        let record = self.transport.activate(license_key, &request).await?;

        let activated_at = now_ts();
        let license = License {
            license_key: license_key.to_string(),
            device_id,
            activation_id: record.id,
            activated_at,
            last_validated: None,
            // Activation is itself a confirmed online contact; the
            // offline grace window starts counting from here.
            last_validated_online: Some(activated_at),
            validation: None,
        };
        self.store.set_license(&license)?;

        info!(activation_id = %license.activation_id, "License activated");
        self.emit(LicenseEvent::ActivationSuccess {
            license_key: license_key.to_string(),
        });
        self.start_scheduler();

        // Offline assets arrive asynchronously; activation does not wait.
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            if let Some(engine) = weak.upgrade() {
                if let Err(e) = engine.refresh_offline_assets().await {
                    debug!(error = %e, "Initial offline asset fetch failed");
                }
            }
        });

        Ok(license)
    }

    /// Validate the cached license against the server, falling back to
    /// the offline verifier on eligible failures.
    ///
    /// # Errors
    ///
    /// Returns error if no license is cached, or if validation failed
    /// with no applicable fallback. Offline verification failures are
    /// not errors; they come back as a result with `valid == false`.
    #[instrument(skip(self))]
    pub async fn validate(&self) -> Result<ValidationResult, LicenseError> {
        let _guard = self.write_gate.lock().await;

        let mut license = self.store.license().ok_or(LicenseError::NoLicense)?;
        let now = now_ts();

        match self
            .transport
            .validate(&license.license_key, Some(&license.device_id))
            .await
        {
            Ok(response) => {
                let entitlements = response
                    .license
                    .map(|l| l.active_entitlements)
                    .unwrap_or_default();
                let result = ValidationResult {
                    valid: response.valid,
                    code: response.code,
                    offline: false,
                    active_entitlements: entitlements,
                    validated_at: now,
                };

                license.validation = Some(result.clone());
                license.last_validated = Some(now);
                if result.valid {
                    license.last_validated_online = Some(now);
                }
                self.store.set_license(&license)?;
                // The server answered, so the wall clock is trustworthy now.
                self.store.set_last_seen(now)?;

                if result.valid {
                    self.emit(LicenseEvent::ValidationSuccess {
                        result: result.clone(),
                    });
                } else {
                    // No point revalidating a semantically invalid license
                    // on a timer. Cached entitlements stay for inspection.
                    self.stop_scheduler();
                    self.emit(LicenseEvent::ValidationFailure {
                        code: result.code.clone(),
                    });
                }
                Ok(result)
            },
            Err(err) if err.is_fallback_eligible(self.config.offline_fallback_mode) => {
                debug!(error = %err, "Online validation failed, trying offline verifier");
                self.validate_offline(license, now).await
            },
            Err(err) if err.is_semantic_rejection() => {
                warn!(
                    code = err.rejection_code().unwrap_or("none"),
                    "Server rejected license, purging cached state"
                );
                let code = err.rejection_code().map(str::to_string);
                self.store.clear();
                self.stop_scheduler();
                self.emit(LicenseEvent::LicensePurged { code });
                Err(err)
            },
            Err(err) => Err(err),
        }
    }

    /// Run the offline verifier against cached assets. Callers hold the
    /// write gate.
    async fn validate_offline(
        &self,
        mut license: License,
        now: i64,
    ) -> Result<ValidationResult, LicenseError> {
        let token = self.store.offline_token();

        // Unseen kid: fetch the key once and retry. The fetch usually
        // fails too when we got here through a network error.
        let mut public_key = token
            .as_ref()
            .and_then(|t| self.store.public_key(&t.token.kid));
        if public_key.is_none() {
            if let Some(ref signed) = token {
                if let Ok(response) = self.transport.fetch_signing_key(&signed.token.kid).await {
                    if let Ok(bytes) = response.decode_key() {
                        let _ = self.store.set_public_key(&signed.token.kid, &bytes);
                        public_key = Some(bytes);
                    }
                }
            }
        }

        let outcome = verifier::verify(&VerifyInput {
            token: token.as_ref(),
            public_key: public_key.as_deref(),
            cached_license_key: &license.license_key,
            last_validated_online: license.last_validated_online,
            last_seen: self.store.last_seen(),
            now,
            max_offline_days: self.config.max_offline_days,
            max_clock_skew_ms: self.config.max_clock_skew_ms,
        });

        match outcome {
            VerifyOutcome::Valid { entitlements } => {
                let was_offline_valid = license
                    .validation
                    .as_ref()
                    .is_some_and(|v| v.valid && v.offline);

                let result = ValidationResult {
                    valid: true,
                    code: None,
                    offline: true,
                    active_entitlements: entitlements,
                    validated_at: now,
                };
                license.validation = Some(result.clone());
                license.last_validated = Some(now);
                self.store.set_license(&license)?;
                self.store.set_last_seen(now)?;

                if !was_offline_valid {
                    self.emit(LicenseEvent::OfflineValidationSuccess {
                        result: result.clone(),
                    });
                }
                Ok(result)
            },
            VerifyOutcome::Invalid { code } => {
                info!(code = code.as_str(), "Offline verification failed");
                let result = ValidationResult {
                    valid: false,
                    code: Some(code.as_str().to_string()),
                    offline: true,
                    active_entitlements: Vec::new(),
                    validated_at: now,
                };
                license.validation = Some(result.clone());
                license.last_validated = Some(now);
                self.store.set_license(&license)?;

                self.stop_scheduler();
                self.emit(LicenseEvent::ValidationFailure {
                    code: result.code.clone(),
                });
                Ok(result)
            },
        }
    }

    /// Deactivate this device's activation and clear local state.
    ///
    /// Deactivation is idempotent toward the desired end state: a 404 or
    /// 410, or a 422 whose code already describes an inactive license,
    /// counts as success and clears local state like a 200 would.
    ///
    /// # Errors
    ///
    /// Returns error if no license is cached or the server failed in a
    /// way that leaves the activation possibly alive; local state is
    /// preserved in that case.
    #[instrument(skip(self))]
    pub async fn deactivate(&self) -> Result<(), LicenseError> {
        let _guard = self.write_gate.lock().await;
        let license = self.store.license().ok_or(LicenseError::NoLicense)?;

        match self
            .transport
            .deactivate(&license.license_key, &license.device_id)
            .await
        {
            Ok(()) => {},
            Err(LicenseError::Rejected {
                status: 404 | 410, ..
            }) => {
                debug!("Activation already gone server-side");
            },
            Err(LicenseError::Rejected {
                status: 422,
                code: Some(ref code),
                ..
            }) if DEACTIVATION_OK_CODES.contains(&code.as_str()) => {
                debug!(code = %code, "License already inactive server-side");
            },
            Err(err) => return Err(err),
        }

        self.store.clear();
        self.stop_scheduler();
        info!("License deactivated");
        self.emit(LicenseEvent::DeactivationSuccess);
        Ok(())
    }

    /// Prove liveness with the server and advance the last-seen
    /// timestamp.
    ///
    /// # Errors
    ///
    /// Returns error if no license is cached or the server cannot be
    /// reached.
    #[instrument(skip(self))]
    pub async fn heartbeat(&self) -> Result<(), LicenseError> {
        let _guard = self.write_gate.lock().await;
        let license = self.store.license().ok_or(LicenseError::NoLicense)?;
        self.transport
            .heartbeat(&license.license_key, &license.device_id)
            .await?;
        self.store.set_last_seen(now_ts())?;
        Ok(())
    }

    /// Check one entitlement against the last cached validation result.
    /// Pure read, no I/O.
    #[must_use]
    pub fn check_entitlement(&self, key: &str) -> EntitlementStatus {
        let Some(license) = self.store.license() else {
            return EntitlementStatus::NoLicense;
        };
        let Some(validation) = license.validation else {
            return EntitlementStatus::NotFound;
        };

        let now = now_ts();
        match validation.active_entitlements.iter().find(|e| e.key == key) {
            Some(e) if e.is_active(now) => EntitlementStatus::Active {
                expires_at: e.expires_at,
            },
            Some(e) => EntitlementStatus::Expired {
                expired_at: e.expires_at.unwrap_or(now),
            },
            None => EntitlementStatus::NotFound,
        }
    }

    /// Current license state. Pure read, cheap enough to poll every
    /// frame; failures show up as states, never as errors.
    #[must_use]
    pub fn status(&self) -> LicenseState {
        let Some(license) = self.store.license() else {
            return LicenseState::Inactive;
        };
        match license.validation {
            None => LicenseState::Pending,
            Some(v) => match (v.valid, v.offline) {
                (true, false) => LicenseState::Active,
                (true, true) => LicenseState::OfflineValid,
                (false, true) => LicenseState::OfflineInvalid,
                (false, false) => LicenseState::Invalid,
            },
        }
    }

    /// Stop the scheduler and discard all cached state without
    /// contacting the server.
    pub async fn reset(&self) {
        let _guard = self.write_gate.lock().await;
        self.stop_scheduler();
        self.store.clear();
        info!("Engine reset, local state cleared");
    }

    /// Re-fetch the offline token and, when its kid is unseen, the
    /// matching signing key.
    ///
    /// # Errors
    ///
    /// Returns error if no license is cached, the server cannot be
    /// reached, or the fetched token is internally inconsistent.
    pub(crate) async fn refresh_offline_assets(&self) -> Result<(), LicenseError> {
        let license = self.store.license().ok_or(LicenseError::NoLicense)?;
        let signed = self
            .transport
            .fetch_offline_token(&license.license_key, &license.device_id)
            .await?;

        if !signed.canonical_matches() {
            return Err(LicenseError::Crypto(
                latchkey_crypto::CryptoError::invalid_signature(
                    "Offline token canonical form does not match its payload",
                ),
            ));
        }
        self.store.set_offline_token(&signed)?;

        if self.store.public_key(&signed.token.kid).is_none() {
            let response = self.transport.fetch_signing_key(&signed.token.kid).await?;
            self.store
                .set_public_key(&signed.token.kid, &response.decode_key()?)?;
        }

        debug!(kid = %signed.token.kid, "Offline assets refreshed");
        Ok(())
    }

    /// Probe the server's liveness endpoint.
    pub(crate) async fn probe_health(&self) -> bool {
        self.transport.health().await.is_ok()
    }

    pub(crate) fn emit(&self, event: LicenseEvent) {
        debug!(event = event.name(), "Emitting lifecycle event");
        let _ = self.events.send(event);
    }

    /// Start the scheduler, stopping any prior loop first. One loop per
    /// engine instance at a time.
    fn start_scheduler(self: &Arc<Self>) {
        if let Ok(mut slot) = self.scheduler.lock() {
            if let Some(old) = slot.take() {
                old.stop();
                self.emit(LicenseEvent::SchedulerStopped);
            }
            *slot = Some(scheduler::start(Arc::downgrade(self), &self.config));
            self.emit(LicenseEvent::SchedulerStarted);
        }
    }

    pub(crate) fn stop_scheduler(&self) {
        if let Ok(mut slot) = self.scheduler.lock() {
            if let Some(old) = slot.take() {
                old.stop();
                self.emit(LicenseEvent::SchedulerStopped);
            }
        }
    }
}

impl Drop for LicenseEngine {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.scheduler.lock() {
            if let Some(old) = slot.take() {
                old.stop();
            }
        }
    }
}

/// Current Unix time in seconds.
pub(crate) fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
