//! Core types shared across GSLB components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Effective routing status of a backend, as computed by Overwatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    /// Eligible for DNS answers
    Healthy,
    /// Failing validation, override, or agent claim
    Unhealthy,
    /// No heartbeat within the stale threshold and no validation to fall back on
    Stale,
    /// Removed from rotation by predictive health, not a failure
    Draining,
}

impl BackendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Stale => "stale",
            Self::Draining => "draining",
        }
    }

    /// Map a boolean verdict onto Healthy/Unhealthy
    pub fn from_verdict(healthy: bool) -> Self {
        if healthy { Self::Healthy } else { Self::Unhealthy }
    }
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a backend: (service, address, port)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendKey {
    pub service: String,
    pub address: String,
    pub port: u16,
}

impl BackendKey {
    pub fn new(service: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            service: service.into(),
            address: address.into(),
            port,
        }
    }

    /// KV store key: backends/{service}:{address}:{port}
    pub fn store_key(&self) -> String {
        format!("{}{}", crate::constants::store_keys::BACKENDS_PREFIX, self)
    }
}

impl fmt::Display for BackendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.service, self.address, self.port)
    }
}

/// A single backend registration as reported by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRegistration {
    pub agent_id: String,
    pub region: String,
    pub service: String,
    pub address: String,
    pub port: u16,
    pub weight: u32,
    /// Health claimed by the agent
    pub healthy: bool,
}

impl BackendRegistration {
    pub fn key(&self) -> BackendKey {
        BackendKey::new(&self.service, &self.address, self.port)
    }
}

/// Most recent external validation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    pub healthy: bool,
    pub last_check: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Operator-set verdict superseding every computed signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Override {
    pub healthy: bool,
    pub reason: String,
    pub by: String,
    pub at: DateTime<Utc>,
}

/// Predictive-health (draining) state and the resource metrics that drove it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Drain {
    pub draining: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub error_rate: f64,
}

/// Predictive-health signal from one agent, fanned out to all its backends.
pub type DrainSignal = Drain;

/// Exponential moving average of validation latency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub smoothed: Duration,
    pub samples: u64,
    pub last: Duration,
}

/// Latency snapshot returned to routing consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyInfo {
    pub smoothed: Duration,
    pub samples: u64,
    pub last: Duration,
    pub has_data: bool,
}

impl From<LatencyStats> for LatencyInfo {
    fn from(stats: LatencyStats) -> Self {
        Self {
            smoothed: stats.smoothed,
            samples: stats.samples,
            last: stats.last,
            has_data: stats.samples > 0,
        }
    }
}

/// A backend tracked by the Overwatch registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backend {
    pub service: String,
    pub address: String,
    pub port: u16,
    pub weight: u32,

    /// Agent that last registered this backend
    pub agent_id: String,
    pub region: String,

    /// Health claimed by the agent
    pub agent_healthy: bool,
    pub agent_last_seen: DateTime<Utc>,

    /// None until the validator has probed this backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<Validation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_status: Option<Override>,

    #[serde(default)]
    pub drain: Drain,

    /// Derived; always recomputed from the fields above
    pub effective_status: BackendStatus,

    #[serde(default)]
    pub latency: LatencyStats,
}

impl Backend {
    /// New backend from a first registration, initially Healthy until recomputed
    pub fn new(registration: &BackendRegistration, now: DateTime<Utc>) -> Self {
        Self {
            service: registration.service.clone(),
            address: registration.address.clone(),
            port: registration.port,
            weight: registration.weight,
            agent_id: registration.agent_id.clone(),
            region: registration.region.clone(),
            agent_healthy: registration.healthy,
            agent_last_seen: now,
            validation: None,
            override_status: None,
            drain: Drain::default(),
            effective_status: BackendStatus::Healthy,
            latency: LatencyStats::default(),
        }
    }

    pub fn key(&self) -> BackendKey {
        BackendKey::new(&self.service, &self.address, self.port)
    }

    /// True if validation has run and disagrees with the agent claim
    pub fn validation_disagrees(&self) -> bool {
        self.validation
            .as_ref()
            .is_some_and(|v| v.healthy != self.agent_healthy)
    }
}

/// Registry event: a backend's effective status changed.
///
/// `old == None` means the backend was just created, `new == None` means it
/// was removed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusChange {
    pub backend: Backend,
    pub old: Option<BackendStatus>,
    pub new: Option<BackendStatus>,
}

/// A TOFU-pinned agent certificate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinnedCertificate {
    pub agent_id: String,
    /// Lowercase hex SHA-256 over the certificate DER
    pub fingerprint: String,
    pub certificate_pem: String,
    /// Parsed from the `{prefix}-{region}` CommonName; empty if it doesn't match
    pub region: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub revoked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_reason: Option<String>,
}

impl PinnedCertificate {
    /// KV store key: pinned_certs/{agent_id}
    pub fn store_key(agent_id: &str) -> String {
        format!(
            "{}{}",
            crate::constants::store_keys::PINNED_CERTS_PREFIX,
            agent_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_key_format() {
        let key = BackendKey::new("web", "10.0.0.1", 80);
        assert_eq!(key.to_string(), "web:10.0.0.1:80");
        assert_eq!(key.store_key(), "backends/web:10.0.0.1:80");
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&BackendStatus::Draining).unwrap();
        assert_eq!(json, "\"draining\"");
        assert_eq!(BackendStatus::from_verdict(false), BackendStatus::Unhealthy);
    }

    #[test]
    fn test_backend_persistence_roundtrip_keeps_optional_state() {
        let registration = BackendRegistration {
            agent_id: "a1".into(),
            region: "us-east".into(),
            service: "web".into(),
            address: "10.0.0.1".into(),
            port: 80,
            weight: 100,
            healthy: true,
        };
        let mut backend = Backend::new(&registration, Utc::now());
        backend.validation = Some(Validation {
            healthy: false,
            last_check: Utc::now(),
            error: Some("refused".into()),
        });

        let json = serde_json::to_string(&backend).unwrap();
        let parsed: Backend = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, backend);
        assert!(parsed.validation_disagrees());
    }
}
