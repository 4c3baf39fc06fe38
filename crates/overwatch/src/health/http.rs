use anyhow::Context;
use async_trait::async_trait;
use tokio::time::Instant;

use super::{CheckResult, HealthChecker, Target, host_port};

/// Healthy on any 2xx response
#[derive(Debug, Clone)]
pub struct HttpChecker {
    client: reqwest::Client,
}

impl HttpChecker {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("gslb-overwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    fn url(target: &Target) -> String {
        let path = if target.path.starts_with('/') {
            target.path.clone()
        } else {
            format!("/{}", target.path)
        };
        format!(
            "{}://{}{}",
            target.scheme,
            host_port(&target.address, target.port),
            path
        )
    }
}

#[async_trait]
impl HealthChecker for HttpChecker {
    async fn check(&self, target: &Target) -> CheckResult {
        let url = Self::url(target);
        let started = Instant::now();

        match self.client.get(&url).timeout(target.timeout).send().await {
            Ok(resp) if resp.status().is_success() => CheckResult::healthy(started.elapsed()),
            Ok(resp) => CheckResult::unhealthy(
                started.elapsed(),
                format!("unexpected status {}", resp.status().as_u16()),
            ),
            Err(e) if e.is_timeout() => {
                CheckResult::unhealthy(started.elapsed(), "request timed out")
            }
            Err(e) => CheckResult::unhealthy(started.elapsed(), format!("request failed: {e}")),
        }
    }

    fn kind(&self) -> &'static str {
        "http"
    }
}
