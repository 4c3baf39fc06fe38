//! Backend registry.
//!
//! Holds every known backend and derives a single effective status from four
//! independent signals: the agent's claim, external validation, heartbeat
//! staleness and an operator override. The status is never set directly; it
//! is recomputed from the other fields after every mutation and on each
//! stale sweep, and every change is published on a broadcast channel.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use gslb_common::constants::{DEFAULT_LATENCY_SMOOTHING_FACTOR, store_keys};
use gslb_common::{
    Backend, BackendKey, BackendRegistration, BackendStatus, DrainSignal, GslbError, LatencyInfo,
    LatencyStats, Override, StatusChange, Validation,
};

use crate::clock::Clock;
use crate::config::RegistryConfig;
use crate::store::{KvStore, PERSIST_QUEUE_CAPACITY, Persister, STORE_OP_TIMEOUT, bounded};

/// Buffered status changes per subscriber before it starts lagging
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Effective status of a backend at `now`. First matching rule wins:
/// override, draining, validation, staleness, agent claim.
pub fn effective_status(
    backend: &Backend,
    now: DateTime<Utc>,
    stale_threshold: Duration,
) -> BackendStatus {
    if let Some(ref ov) = backend.override_status {
        return BackendStatus::from_verdict(ov.healthy);
    }
    if backend.drain.draining {
        return BackendStatus::Draining;
    }
    if let Some(ref validation) = backend.validation {
        return BackendStatus::from_verdict(validation.healthy);
    }
    if heartbeat_age(backend, now) > stale_threshold {
        return BackendStatus::Stale;
    }
    BackendStatus::from_verdict(backend.agent_healthy)
}

/// Time since the last agent contact; clock skew into the future counts as zero
fn heartbeat_age(backend: &Backend, now: DateTime<Utc>) -> Duration {
    (now - backend.agent_last_seen)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Fold one latency sample into the moving average
fn record_latency(stats: &mut LatencyStats, sample: Duration, alpha: f64) {
    stats.last = sample;
    stats.smoothed = if stats.samples == 0 {
        sample
    } else {
        let smoothed = alpha * sample.as_secs_f64() + (1.0 - alpha) * stats.smoothed.as_secs_f64();
        Duration::try_from_secs_f64(smoothed).unwrap_or(sample)
    };
    stats.samples = stats.samples.saturating_add(1);
}

/// Outcome of one stale sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub changed: usize,
}

pub struct Registry {
    stale_threshold: Duration,
    remove_after: Duration,
    smoothing_factor: f64,
    store: Option<Arc<dyn KvStore>>,
    persister: Option<Persister>,
    clock: Arc<dyn Clock>,
    backends: RwLock<HashMap<BackendKey, Backend>>,
    events: broadcast::Sender<StatusChange>,
}

impl Registry {
    pub fn new(
        config: &RegistryConfig,
        store: Option<Arc<dyn KvStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let alpha = config.latency_smoothing_factor;
        let smoothing_factor = if alpha > 0.0 && alpha <= 1.0 {
            alpha
        } else {
            DEFAULT_LATENCY_SMOOTHING_FACTOR
        };
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let persister = store
            .clone()
            .map(|store| Persister::spawn(store, PERSIST_QUEUE_CAPACITY, STORE_OP_TIMEOUT));

        Self {
            stale_threshold: config.stale_threshold(),
            remove_after: config.remove_after(),
            smoothing_factor,
            store,
            persister,
            clock,
            backends: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    /// Receive every subsequent status change
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.events.subscribe()
    }

    /// Create or refresh a backend from an agent report
    pub async fn register(&self, registration: BackendRegistration) -> Result<(), GslbError> {
        if registration.service.is_empty() || registration.address.is_empty() {
            return Err(GslbError::InvalidInput(
                "service and address are required".to_string(),
            ));
        }
        if registration.port == 0 {
            return Err(GslbError::InvalidInput("port must be non-zero".to_string()));
        }

        let now = self.clock.now();
        let mut backends = self.backends.write().await;

        let (change, snapshot) = match backends.entry(registration.key()) {
            Entry::Occupied(mut entry) => {
                let backend = entry.get_mut();
                backend.weight = registration.weight;
                backend.agent_id = registration.agent_id;
                backend.region = registration.region;
                backend.agent_healthy = registration.healthy;
                backend.agent_last_seen = now;
                (self.recompute(backend, now), backend.clone())
            }
            Entry::Vacant(entry) => {
                let mut backend = Backend::new(&registration, now);
                backend.effective_status = effective_status(&backend, now, self.stale_threshold);
                info!(
                    service = %backend.service,
                    address = %backend.address,
                    port = backend.port,
                    agent_id = %backend.agent_id,
                    region = %backend.region,
                    "Backend registered"
                );
                let change = StatusChange {
                    backend: backend.clone(),
                    old: None,
                    new: Some(backend.effective_status),
                };
                (Some(change), entry.insert(backend).clone())
            }
        };

        self.persist(&snapshot);
        if let Some(change) = change {
            self.emit(change);
        }
        Ok(())
    }

    /// Remove a backend explicitly
    pub async fn deregister(&self, key: &BackendKey) -> Result<(), GslbError> {
        let mut backends = self.backends.write().await;
        let backend = backends
            .remove(key)
            .ok_or_else(|| GslbError::NotFound(key.to_string()))?;

        self.unpersist(key);
        info!(backend = %key, "Backend deregistered");
        self.emit(StatusChange {
            old: Some(backend.effective_status),
            new: None,
            backend,
        });
        Ok(())
    }

    pub async fn update_validation(
        &self,
        key: &BackendKey,
        healthy: bool,
        error: Option<String>,
    ) -> Result<(), GslbError> {
        self.update_validation_with_latency(key, healthy, error, Duration::ZERO)
            .await
    }

    /// Record an external check result; healthy results with a positive
    /// latency feed the moving average
    pub async fn update_validation_with_latency(
        &self,
        key: &BackendKey,
        healthy: bool,
        error: Option<String>,
        latency: Duration,
    ) -> Result<(), GslbError> {
        let now = self.clock.now();
        let mut backends = self.backends.write().await;
        let backend = backends
            .get_mut(key)
            .ok_or_else(|| GslbError::NotFound(key.to_string()))?;

        backend.validation = Some(Validation {
            healthy,
            last_check: now,
            error,
        });
        if healthy && latency > Duration::ZERO {
            record_latency(&mut backend.latency, latency, self.smoothing_factor);
        }

        let change = self.recompute(backend, now);
        let snapshot = backend.clone();
        self.persist(&snapshot);
        if let Some(change) = change {
            self.emit(change);
        }
        Ok(())
    }

    /// Pin a backend's status regardless of every other signal
    pub async fn set_override(
        &self,
        key: &BackendKey,
        healthy: bool,
        reason: impl Into<String>,
        by: impl Into<String>,
    ) -> Result<(), GslbError> {
        let now = self.clock.now();
        let mut backends = self.backends.write().await;
        let backend = backends
            .get_mut(key)
            .ok_or_else(|| GslbError::NotFound(key.to_string()))?;

        let ov = Override {
            healthy,
            reason: reason.into(),
            by: by.into(),
            at: now,
        };
        info!(backend = %key, healthy, reason = %ov.reason, by = %ov.by, "Override set");
        backend.override_status = Some(ov);

        let change = self.recompute(backend, now);
        let snapshot = backend.clone();
        self.persist(&snapshot);
        if let Some(change) = change {
            self.emit(change);
        }
        Ok(())
    }

    pub async fn clear_override(&self, key: &BackendKey) -> Result<(), GslbError> {
        let now = self.clock.now();
        let mut backends = self.backends.write().await;
        let backend = backends
            .get_mut(key)
            .ok_or_else(|| GslbError::NotFound(key.to_string()))?;

        if backend.override_status.take().is_none() {
            return Ok(());
        }
        info!(backend = %key, "Override cleared");

        let change = self.recompute(backend, now);
        let snapshot = backend.clone();
        self.persist(&snapshot);
        if let Some(change) = change {
            self.emit(change);
        }
        Ok(())
    }

    /// Apply one agent's predictive-health signal to all of its backends.
    /// Returns the number of backends touched.
    pub async fn update_draining(&self, agent_id: &str, signal: DrainSignal) -> usize {
        let now = self.clock.now();
        let mut backends = self.backends.write().await;
        let mut affected = 0;

        for backend in backends.values_mut().filter(|b| b.agent_id == agent_id) {
            let mut drain = signal.clone();
            drain.since = if drain.draining {
                drain.since.or(backend.drain.since).or(Some(now))
            } else {
                None
            };
            if drain.draining != backend.drain.draining {
                info!(
                    backend = %backend.key(),
                    agent_id = %agent_id,
                    draining = drain.draining,
                    reason = %drain.reason,
                    "Drain state changed"
                );
            }
            backend.drain = drain;
            affected += 1;

            let change = self.recompute(backend, now);
            self.persist(backend);
            if let Some(change) = change {
                self.emit(change);
            }
        }

        affected
    }

    pub async fn get_backend(&self, key: &BackendKey) -> Option<Backend> {
        self.backends.read().await.get(key).cloned()
    }

    /// All backends of one service, ordered by key
    pub async fn get_backends(&self, service: &str) -> Vec<Backend> {
        let backends = self.backends.read().await;
        let mut out: Vec<Backend> = backends
            .values()
            .filter(|b| b.service == service)
            .cloned()
            .collect();
        out.sort_by_key(Backend::key);
        out
    }

    pub async fn get_healthy_backends(&self, service: &str) -> Vec<Backend> {
        let mut out = self.get_backends(service).await;
        out.retain(|b| b.effective_status == BackendStatus::Healthy);
        out
    }

    pub async fn get_all_backends(&self) -> Vec<Backend> {
        let backends = self.backends.read().await;
        let mut out: Vec<Backend> = backends.values().cloned().collect();
        out.sort_by_key(Backend::key);
        out
    }

    /// True if any backend at this address and port is Healthy
    pub async fn is_healthy(&self, address: &str, port: u16) -> bool {
        self.backends.read().await.values().any(|b| {
            b.address == address
                && b.port == port
                && b.effective_status == BackendStatus::Healthy
        })
    }

    /// Latency for an address and port; `has_data` is false when never measured
    pub async fn get_latency(&self, address: &str, port: u16) -> LatencyInfo {
        self.backends
            .read()
            .await
            .values()
            .filter(|b| b.address == address && b.port == port)
            .max_by_key(|b| b.latency.samples)
            .map(|b| LatencyInfo::from(b.latency))
            .unwrap_or_default()
    }

    pub async fn backend_count(&self) -> usize {
        self.backends.read().await.len()
    }

    /// One stale-sweep pass: reap backends silent past `remove_after` and
    /// recompute everything else
    pub async fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let mut backends = self.backends.write().await;
        let mut report = SweepReport::default();

        let expired: Vec<BackendKey> = backends
            .iter()
            .filter(|(_, b)| heartbeat_age(b, now) > self.remove_after)
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            let Some(backend) = backends.remove(&key) else {
                continue;
            };
            warn!(
                backend = %key,
                agent_id = %backend.agent_id,
                last_seen = %backend.agent_last_seen,
                "Removing backend with no heartbeat"
            );
            self.unpersist(&key);
            self.emit(StatusChange {
                old: Some(backend.effective_status),
                new: None,
                backend,
            });
            report.removed += 1;
        }

        for backend in backends.values_mut() {
            let Some(change) = self.recompute(backend, now) else {
                continue;
            };
            if change.new == Some(BackendStatus::Stale) {
                warn!(
                    backend = %backend.key(),
                    agent_id = %backend.agent_id,
                    last_seen = %backend.agent_last_seen,
                    "Backend went stale"
                );
            }
            self.persist(backend);
            self.emit(change);
            report.changed += 1;
        }

        report
    }

    /// Sweep every `stale_threshold / 2` until shutdown
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let period = (self.stale_threshold / 2).max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval = ?period, "Stale sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    if report.removed > 0 || report.changed > 0 {
                        debug!(removed = report.removed, changed = report.changed, "Stale sweep");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Stale sweeper shutting down");
                    break;
                }
            }
        }
    }

    /// Reload persisted backends, recomputing their status at the current time
    pub async fn load_from_store(&self) -> Result<usize, GslbError> {
        let Some(ref store) = self.store else {
            return Ok(0);
        };

        let pairs = bounded(STORE_OP_TIMEOUT, store.list(store_keys::BACKENDS_PREFIX)).await?;
        let now = self.clock.now();
        let mut backends = self.backends.write().await;
        let mut loaded = 0;

        for pair in pairs {
            let mut backend: Backend = match serde_json::from_slice(&pair.value) {
                Ok(backend) => backend,
                Err(e) => {
                    warn!(key = %pair.key, error = %e, "Skipping unreadable backend record");
                    continue;
                }
            };
            backend.effective_status = effective_status(&backend, now, self.stale_threshold);
            backends.insert(backend.key(), backend);
            loaded += 1;
        }

        info!(count = loaded, "Backends loaded from store");
        Ok(loaded)
    }

    /// Wait for queued store writes to be applied
    pub async fn flush(&self) {
        if let Some(ref persister) = self.persister {
            persister.flush().await;
        }
    }

    fn recompute(&self, backend: &mut Backend, now: DateTime<Utc>) -> Option<StatusChange> {
        let old = backend.effective_status;
        let new = effective_status(backend, now, self.stale_threshold);
        backend.effective_status = new;

        (old != new).then(|| StatusChange {
            backend: backend.clone(),
            old: Some(old),
            new: Some(new),
        })
    }

    fn emit(&self, change: StatusChange) {
        debug!(
            backend = %change.backend.key(),
            old = ?change.old,
            new = ?change.new,
            "Status change"
        );
        // No subscribers is fine
        let _ = self.events.send(change);
    }

    /// Queue the backend's record for the store; never waits on it
    fn persist(&self, backend: &Backend) {
        let Some(ref persister) = self.persister else {
            return;
        };
        match serde_json::to_vec(backend) {
            Ok(bytes) => persister.put(backend.key().store_key(), bytes),
            Err(e) => warn!(backend = %backend.key(), error = %e, "Failed to encode backend"),
        }
    }

    fn unpersist(&self, key: &BackendKey) {
        if let Some(ref persister) = self.persister {
            persister.delete(key.store_key());
        }
    }
}
