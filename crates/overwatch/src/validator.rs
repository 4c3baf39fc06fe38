//! External validation loop.
//!
//! Periodically probes every registered backend (stale ones included, so a
//! backend whose agent died can still be vouched for) and feeds the result
//! into the registry. Probes run concurrently behind a semaphore and always
//! terminate through a timeout.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use gslb_common::{Backend, BackendKey, BackendStatus, GslbError};

use crate::config::ValidatorConfig;
use crate::health::{CheckResult, HealthChecker, Target};
use crate::registry::Registry;

/// Result counts of one validation sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ValidationSummary {
    pub checked: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub timed_out: usize,
    /// Removed from the registry while the probe was in flight
    pub skipped: usize,
}

/// Registry-wide validation picture
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ValidationStats {
    pub total: usize,
    pub validated: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub stale: usize,
    pub draining: usize,
    /// Validation result contradicts the agent's claim
    pub disagreements: usize,
}

pub struct Validator {
    config: ValidatorConfig,
    registry: Arc<Registry>,
    checker: Arc<dyn HealthChecker>,
    semaphore: Arc<Semaphore>,
}

impl Validator {
    pub fn new(
        config: &ValidatorConfig,
        registry: Arc<Registry>,
        checker: Arc<dyn HealthChecker>,
    ) -> Self {
        Self {
            config: config.clone(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            registry,
            checker,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Spawn the periodic loop; returns no task when validation is disabled
    pub fn start(self: Arc<Self>, shutdown: broadcast::Receiver<()>) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            info!("External validation disabled");
            return None;
        }
        Some(tokio::spawn(self.run(shutdown)))
    }

    async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.check_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval = ?self.config.check_interval(),
            timeout = ?self.config.check_timeout(),
            max_concurrent = self.config.max_concurrent,
            checker = self.checker.kind(),
            "Validator started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.validate_now().await;
                    debug!(?summary, "Validation sweep complete");
                }
                _ = shutdown.recv() => {
                    info!("Validator shutting down");
                    break;
                }
            }
        }
    }

    /// Probe every backend once and record the results
    pub async fn validate_now(&self) -> ValidationSummary {
        let backends = self.registry.get_all_backends().await;
        let mut summary = ValidationSummary::default();
        let mut probes = JoinSet::new();

        for backend in backends {
            let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
                warn!("Validator semaphore closed");
                break;
            };
            let checker = self.checker.clone();
            let target = self.target_for(&backend);
            probes.spawn(async move {
                let _permit = permit;
                let result = probe(checker.as_ref(), &target).await;
                (backend, result)
            });
        }

        while let Some(joined) = probes.join_next().await {
            let (backend, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(error = %e, "Validation probe panicked");
                    continue;
                }
            };

            summary.checked += 1;
            if is_timeout(&result) {
                summary.timed_out += 1;
            }
            if self.record(&backend, &result).await {
                if result.healthy {
                    summary.healthy += 1;
                } else {
                    summary.unhealthy += 1;
                }
            } else {
                summary.skipped += 1;
            }
        }

        summary
    }

    /// Probe a single backend now
    pub async fn validate_backend(&self, key: &BackendKey) -> Result<CheckResult, GslbError> {
        let backend = self
            .registry
            .get_backend(key)
            .await
            .ok_or_else(|| GslbError::NotFound(key.to_string()))?;

        let result = probe(self.checker.as_ref(), &self.target_for(&backend)).await;
        self.registry
            .update_validation_with_latency(
                key,
                result.healthy,
                result.error.clone(),
                result.latency,
            )
            .await?;
        log_disagreement(&backend, &result);
        Ok(result)
    }

    pub async fn stats(&self) -> ValidationStats {
        let backends = self.registry.get_all_backends().await;
        let mut stats = ValidationStats {
            total: backends.len(),
            ..Default::default()
        };

        for backend in &backends {
            if backend.validation.is_some() {
                stats.validated += 1;
            }
            if backend.validation_disagrees() {
                stats.disagreements += 1;
            }
            match backend.effective_status {
                BackendStatus::Healthy => stats.healthy += 1,
                BackendStatus::Unhealthy => stats.unhealthy += 1,
                BackendStatus::Stale => stats.stale += 1,
                BackendStatus::Draining => stats.draining += 1,
            }
        }
        stats
    }

    fn target_for(&self, backend: &Backend) -> Target {
        Target {
            address: backend.address.clone(),
            port: backend.port,
            scheme: self.config.scheme.clone(),
            path: self.config.path.clone(),
            timeout: self.config.check_timeout(),
        }
    }

    /// Returns false if the backend vanished before the result landed
    async fn record(&self, backend: &Backend, result: &CheckResult) -> bool {
        let key = backend.key();
        match self
            .registry
            .update_validation_with_latency(
                &key,
                result.healthy,
                result.error.clone(),
                result.latency,
            )
            .await
        {
            Ok(()) => {
                log_disagreement(backend, result);
                true
            }
            Err(GslbError::NotFound(_)) => {
                debug!(backend = %key, "Backend removed during validation");
                false
            }
            Err(e) => {
                warn!(backend = %key, error = %e, "Failed to record validation");
                false
            }
        }
    }
}

const TIMEOUT_ERROR_PREFIX: &str = "check timed out";

/// Run a probe under its own deadline regardless of the checker's behaviour
async fn probe(checker: &dyn HealthChecker, target: &Target) -> CheckResult {
    match tokio::time::timeout(target.timeout, checker.check(target)).await {
        Ok(result) => result,
        Err(_) => CheckResult::unhealthy(
            target.timeout,
            format!("{TIMEOUT_ERROR_PREFIX} after {:?}", target.timeout),
        ),
    }
}

fn is_timeout(result: &CheckResult) -> bool {
    result
        .error
        .as_deref()
        .is_some_and(|e| e.starts_with(TIMEOUT_ERROR_PREFIX))
}

fn log_disagreement(backend: &Backend, result: &CheckResult) {
    if backend.agent_healthy != result.healthy {
        info!(
            service = %backend.service,
            address = %backend.address,
            port = backend.port,
            agent_id = %backend.agent_id,
            agent_healthy = backend.agent_healthy,
            validated_healthy = result.healthy,
            error = ?result.error,
            "Validation disagrees with agent"
        );
    }
}
