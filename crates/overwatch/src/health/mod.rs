//! Active health probes used by the validator.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{CheckType, ValidatorConfig};

mod http;
mod tcp;

pub use self::http::HttpChecker;
pub use self::tcp::TcpChecker;

/// What to probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub address: String,
    pub port: u16,
    /// HTTP only
    pub scheme: String,
    /// HTTP only
    pub path: String,
    pub timeout: Duration,
}

/// Outcome of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub healthy: bool,
    pub latency: Duration,
    pub error: Option<String>,
}

impl CheckResult {
    pub fn healthy(latency: Duration) -> Self {
        Self {
            healthy: true,
            latency,
            error: None,
        }
    }

    pub fn unhealthy(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check(&self, target: &Target) -> CheckResult;

    fn kind(&self) -> &'static str;
}

/// Build the checker selected by `validator.check_type`
pub fn checker_for(config: &ValidatorConfig) -> anyhow::Result<Arc<dyn HealthChecker>> {
    let checker: Arc<dyn HealthChecker> = match config.check_type {
        CheckType::Tcp => Arc::new(TcpChecker),
        CheckType::Http => Arc::new(HttpChecker::new()?),
    };
    Ok(checker)
}

/// `host:port`, bracketing bare IPv6 addresses
pub(crate) fn host_port(address: &str, port: u16) -> String {
    if address.contains(':') && !address.starts_with('[') {
        format!("[{address}]:{port}")
    } else {
        format!("{address}:{port}")
    }
}
