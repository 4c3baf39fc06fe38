use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::Instant;

use super::{CheckResult, HealthChecker, Target, host_port};

/// Healthy if a TCP connection can be established
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpChecker;

#[async_trait]
impl HealthChecker for TcpChecker {
    async fn check(&self, target: &Target) -> CheckResult {
        let addr = host_port(&target.address, target.port);
        let started = Instant::now();

        match tokio::time::timeout(target.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_stream)) => CheckResult::healthy(started.elapsed()),
            Ok(Err(e)) => CheckResult::unhealthy(started.elapsed(), format!("connect failed: {e}")),
            Err(_) => CheckResult::unhealthy(started.elapsed(), "connect timed out"),
        }
    }

    fn kind(&self) -> &'static str {
        "tcp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn target(port: u16) -> Target {
        Target {
            address: "127.0.0.1".to_string(),
            port,
            scheme: "http".to_string(),
            path: "/".to_string(),
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_open_port_is_healthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let result = TcpChecker.check(&target(port)).await;
        assert!(result.healthy);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_closed_port_is_unhealthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = TcpChecker.check(&target(port)).await;
        assert!(!result.healthy);
        assert!(result.error.is_some());
    }
}
