//! Periodic validation scheduler.
//!
//! Drives timer-based auto-validation, offline-asset refresh, and the
//! optional heartbeat for one engine instance. The validation loop runs
//! a two-phase machine: while online it revalidates at the configured
//! interval; after a connectivity loss it switches to probing the
//! lightweight health endpoint at a shorter interval, and on recovery
//! triggers an immediate validation plus an offline-asset sync.
//!
//! Loops hold only a [`Weak`] engine reference, so dropping the engine
//! ends them. Cancellation is cooperative: the token is re-checked after
//! every suspend point and before every engine call that writes to the
//! cache, so stopping the scheduler guarantees no further cache writes
//! from a stale run.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::engine::LicenseEngine;
use crate::error::LicenseError;
use crate::types::LicenseEvent;

/// Connectivity phase of the validation loop.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    /// Server reachable; revalidate on the normal interval.
    Validating,
    /// Server unreachable; poll the health endpoint instead.
    Probing,
}

/// Handle to a running scheduler. Dropping without [`stop`][Self::stop]
/// leaves the loops running until the engine itself is dropped.
pub(crate) struct SchedulerHandle {
    cancel: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Signal all loops to stop. Tasks parked in a sleep are aborted;
    /// a task mid-call observes the token before its next cache write.
    pub(crate) fn stop(self) {
        let _ = self.cancel.send(true);
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Spawn the scheduler loops for an engine.
pub(crate) fn start(engine: Weak<LicenseEngine>, config: &EngineConfig) -> SchedulerHandle {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(validation_loop(
        engine.clone(),
        cancel_rx.clone(),
        config.auto_validate_interval,
        config.connectivity_probe_interval,
    )));
    tasks.push(tokio::spawn(refresh_loop(
        engine.clone(),
        cancel_rx.clone(),
        config.offline_refresh_interval,
    )));
    if let Some(interval) = config.heartbeat_interval {
        tasks.push(tokio::spawn(heartbeat_loop(engine, cancel_rx, interval)));
    }

    SchedulerHandle {
        cancel: cancel_tx,
        tasks,
    }
}

/// Wait out one period, returning `false` when cancelled.
async fn sleep_or_cancel(period: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => true,
        _ = cancel.changed() => !*cancel.borrow(),
    }
}

async fn validation_loop(
    engine: Weak<LicenseEngine>,
    mut cancel: watch::Receiver<bool>,
    validate_every: Duration,
    probe_every: Duration,
) {
    let mut phase = Phase::Validating;

    loop {
        let period = match phase {
            Phase::Validating => validate_every,
            Phase::Probing => probe_every,
        };
        if !sleep_or_cancel(period, &mut cancel).await {
            return;
        }
        let Some(engine) = engine.upgrade() else {
            return;
        };
        if *cancel.borrow() {
            return;
        }

        match phase {
            Phase::Validating => {
                if run_validation(&engine).await == Phase::Probing {
                    info!("Connectivity lost, switching to probe mode");
                    engine.emit(LicenseEvent::NetworkOffline);
                    phase = Phase::Probing;
                }
            },
            Phase::Probing => {
                if engine.probe_health().await {
                    info!("Connectivity restored");
                    engine.emit(LicenseEvent::NetworkOnline);
                    phase = Phase::Validating;
                    if *cancel.borrow() {
                        return;
                    }
                    // Catch up immediately rather than waiting a full cycle.
                    run_validation(&engine).await;
                    if let Err(e) = engine.refresh_offline_assets().await {
                        debug!(error = %e, "Post-recovery asset sync failed");
                    }
                }
            },
        }
    }
}

/// Run one scheduled validation and decide the next phase.
async fn run_validation(engine: &LicenseEngine) -> Phase {
    match engine.validate().await {
        Ok(result) if result.offline => Phase::Probing,
        Ok(_) => Phase::Validating,
        Err(err) if err.is_network_failure() => Phase::Probing,
        Err(LicenseError::NoLicense) => Phase::Validating,
        Err(err) => {
            // Semantic rejections already stopped this scheduler through
            // the engine; the cancel token fires before the next tick.
            warn!(error = %err, "Scheduled validation failed");
            Phase::Validating
        },
    }
}

async fn refresh_loop(
    engine: Weak<LicenseEngine>,
    mut cancel: watch::Receiver<bool>,
    every: Duration,
) {
    loop {
        if !sleep_or_cancel(every, &mut cancel).await {
            return;
        }
        let Some(engine) = engine.upgrade() else {
            return;
        };
        if *cancel.borrow() {
            return;
        }
        if let Err(e) = engine.refresh_offline_assets().await {
            debug!(error = %e, "Scheduled offline asset refresh failed");
        }
    }
}

async fn heartbeat_loop(
    engine: Weak<LicenseEngine>,
    mut cancel: watch::Receiver<bool>,
    every: Duration,
) {
    loop {
        if !sleep_or_cancel(every, &mut cancel).await {
            return;
        }
        let Some(engine) = engine.upgrade() else {
            return;
        };
        if *cancel.borrow() {
            return;
        }
        if let Err(e) = engine.heartbeat().await {
            debug!(error = %e, "Heartbeat failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::broadcast;

    use super::*;
    use crate::engine::{now_ts, LicenseEngine};
    use crate::store::CacheStore;
    use crate::transport::{
        ActivateRequest, ActivationRecord, LicenseSnapshot, SigningKeyResponse, Transport,
        ValidateResponse,
    };
    use crate::types::{License, LicenseState};

    /// Transport whose reachability is a single switch: offline, every
    /// call fails with a network error; online, validate and health
    /// succeed.
    struct SwitchedTransport {
        healthy: AtomicBool,
    }

    impl SwitchedTransport {
        fn new(healthy: bool) -> Self {
            Self {
                healthy: AtomicBool::new(healthy),
            }
        }

        fn set_healthy(&self, healthy: bool) {
            self.healthy.store(healthy, Ordering::SeqCst);
        }

        fn reachable(&self) -> Result<(), LicenseError> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(LicenseError::Network {
                    message: "connection refused".into(),
                })
            }
        }
    }

    #[async_trait]
    impl Transport for SwitchedTransport {
        async fn activate(
            &self,
            _license_key: &str,
            request: &ActivateRequest,
        ) -> Result<ActivationRecord, LicenseError> {
            self.reachable()?;
            Ok(ActivationRecord {
                id: "act-1".into(),
                device_id: Some(request.device_id.clone()),
                license: None,
            })
        }

        async fn validate(
            &self,
            _license_key: &str,
            _device_id: Option<&str>,
        ) -> Result<ValidateResponse, LicenseError> {
            self.reachable()?;
            Ok(ValidateResponse {
                valid: true,
                code: None,
                message: None,
                license: Some(LicenseSnapshot::default()),
            })
        }

        async fn deactivate(&self, _license_key: &str, _device_id: &str) -> Result<(), LicenseError> {
            self.reachable()
        }

        async fn heartbeat(&self, _license_key: &str, _device_id: &str) -> Result<(), LicenseError> {
            self.reachable()
        }

        async fn fetch_offline_token(
            &self,
            _license_key: &str,
            _device_id: &str,
        ) -> Result<crate::token::SignedOfflineToken, LicenseError> {
            Err(LicenseError::Network {
                message: "no token endpoint in this fixture".into(),
            })
        }

        async fn fetch_signing_key(&self, _kid: &str) -> Result<SigningKeyResponse, LicenseError> {
            Err(LicenseError::Network {
                message: "no key endpoint in this fixture".into(),
            })
        }

        async fn health(&self) -> Result<(), LicenseError> {
            self.reachable()
        }
    }

    fn test_config(dir: &Path) -> EngineConfig {
        EngineConfig {
            api_base_url: "https://licenses.example.com/v1".into(),
            product_slug: "test-product".into(),
            api_key: "pk_test".into(),
            storage_prefix: "sched".into(),
            cache_dir: Some(dir.to_path_buf()),
            auto_validate_interval: Duration::from_secs(60),
            connectivity_probe_interval: Duration::from_secs(5),
            offline_refresh_interval: Duration::from_secs(86_400),
            ..EngineConfig::default()
        }
    }

    fn seed_license(dir: &Path, prefix: &str) {
        let store = CacheStore::open(prefix, Some(dir.to_path_buf())).unwrap();
        store
            .set_license(&License {
                license_key: "KEY-A".into(),
                device_id: "device-1".into(),
                activation_id: "act-0".into(),
                activated_at: now_ts(),
                last_validated: None,
                last_validated_online: Some(now_ts()),
                validation: None,
            })
            .unwrap();
    }

    async fn wait_for(
        events: &mut broadcast::Receiver<LicenseEvent>,
        name: &str,
    ) -> LicenseEvent {
        loop {
            let event = events.recv().await.unwrap();
            if event.name() == name {
                return event;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn validation_loop_switches_to_probe_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        seed_license(dir.path(), &config.storage_prefix);

        let transport = Arc::new(SwitchedTransport::new(false));
        let engine =
            LicenseEngine::with_transport(config.clone(), Arc::clone(&transport) as Arc<dyn Transport>)
                .unwrap();
        let mut events = engine.subscribe();

        let handle = start(Arc::downgrade(&engine), &config);

        // First scheduled validation fails on the network and the loop
        // enters probe mode.
        wait_for(&mut events, "network:offline").await;

        transport.set_healthy(true);
        wait_for(&mut events, "network:online").await;

        // Recovery triggers a validation right away, not on the next
        // full cycle.
        let recovered_at = tokio::time::Instant::now();
        wait_for(&mut events, "validation:success").await;
        assert!(recovered_at.elapsed() < Duration::from_secs(5));
        assert_eq!(engine.status(), LicenseState::Active);

        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_scheduler_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        seed_license(dir.path(), &config.storage_prefix);

        let transport = Arc::new(SwitchedTransport::new(true));
        let engine =
            LicenseEngine::with_transport(config.clone(), transport as Arc<dyn Transport>).unwrap();
        let mut events = engine.subscribe();

        let handle = start(Arc::downgrade(&engine), &config);
        handle.stop();

        // Many auto-validate cycles elapse; a stale run must not land a
        // validation result in the cache.
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert_eq!(engine.status(), LicenseState::Pending);
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn loops_end_when_engine_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        seed_license(dir.path(), &config.storage_prefix);

        let transport = Arc::new(SwitchedTransport::new(true));
        let engine =
            LicenseEngine::with_transport(config.clone(), transport as Arc<dyn Transport>).unwrap();

        let handle = start(Arc::downgrade(&engine), &config);
        drop(engine);

        // The weak upgrade fails on each loop's next tick and every
        // loop exits on its own; the refresh loop ticks once a day.
        tokio::time::sleep(Duration::from_secs(2 * 86_400)).await;
        for task in &handle.tasks {
            assert!(task.is_finished());
        }
    }
}
