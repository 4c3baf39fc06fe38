//! Sequential dispatch of decoded gossip into the registry and auth.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use gslb_common::messages::{
    AgentAuthPayload, DeregisterPayload, HeartbeatPayload, RegisterPayload,
};
use gslb_common::{BackendKey, BackendRegistration, GossipMessage, GslbError, Payload};

use super::HandlerStats;
use crate::auth::{AgentAuth, fingerprint_prefix};
use crate::registry::Registry;

pub struct GossipHandler {
    registry: Arc<Registry>,
    auth: Arc<AgentAuth>,
    /// Only pinned, unrevoked agents may touch backends
    require_agent_auth: bool,
    stats: Arc<HandlerStats>,
}

impl GossipHandler {
    pub fn new(
        registry: Arc<Registry>,
        auth: Arc<AgentAuth>,
        require_agent_auth: bool,
        stats: Arc<HandlerStats>,
    ) -> Self {
        Self {
            registry,
            auth,
            require_agent_auth,
            stats,
        }
    }

    pub fn stats(&self) -> Arc<HandlerStats> {
        self.stats.clone()
    }

    /// Consume the queue until it closes or shutdown is signalled
    pub async fn run(
        self,
        mut queue: mpsc::Receiver<GossipMessage>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(require_agent_auth = self.require_agent_auth, "Gossip handler started");

        loop {
            tokio::select! {
                msg = queue.recv() => {
                    match msg {
                        Some(msg) => self.handle(msg).await,
                        None => break,
                    }
                }
                _ = shutdown.recv() => {
                    info!("Gossip handler shutting down");
                    break;
                }
            }
        }
    }

    pub async fn handle(&self, msg: GossipMessage) {
        let GossipMessage {
            agent_id,
            region,
            payload,
            ..
        } = msg;

        match payload {
            Payload::Heartbeat(hb) => self.on_heartbeat(&agent_id, &region, hb).await,
            Payload::Register(reg) => self.on_register(&agent_id, &region, reg).await,
            Payload::Deregister(dereg) => self.on_deregister(&agent_id, dereg).await,
            Payload::AgentAuth(req) => self.on_agent_auth(&agent_id, req).await,
            Payload::Unknown(kind) => {
                HandlerStats::incr(&self.stats.unknown);
                warn!(agent_id = %agent_id, kind = %kind, "Unknown gossip message type");
            }
        }
    }

    async fn on_heartbeat(&self, agent_id: &str, region: &str, hb: HeartbeatPayload) {
        if self.require_agent_auth {
            if let Err(e) = self.auth.verify_fingerprint(agent_id, &hb.fingerprint).await {
                self.reject(agent_id, "heartbeat", &hb.fingerprint, &e);
                return;
            }
        }

        for backend in hb.backends {
            let registration = BackendRegistration {
                agent_id: agent_id.to_string(),
                region: region.to_string(),
                service: backend.service,
                address: backend.address,
                port: backend.port,
                weight: backend.weight,
                healthy: backend.healthy,
            };
            let key = registration.key();
            if let Err(e) = self.registry.register(registration).await {
                warn!(agent_id = %agent_id, backend = %key, error = %e, "Heartbeat entry rejected");
            }
        }

        if let Some(predictive) = hb.predictive {
            let affected = self.registry.update_draining(agent_id, predictive.into()).await;
            debug!(agent_id = %agent_id, affected, "Predictive health applied");
        }

        HandlerStats::incr(&self.stats.heartbeats);
    }

    async fn on_register(&self, agent_id: &str, region: &str, reg: RegisterPayload) {
        if !self.admitted(agent_id, "register").await {
            return;
        }

        let registration = BackendRegistration {
            agent_id: agent_id.to_string(),
            region: region.to_string(),
            service: reg.service,
            address: reg.address,
            port: reg.port,
            weight: reg.weight,
            healthy: true,
        };
        let key = registration.key();
        match self.registry.register(registration).await {
            Ok(()) => HandlerStats::incr(&self.stats.registers),
            Err(e) => warn!(agent_id = %agent_id, backend = %key, error = %e, "Register rejected"),
        }
    }

    async fn on_deregister(&self, agent_id: &str, dereg: DeregisterPayload) {
        if !self.admitted(agent_id, "deregister").await {
            return;
        }

        let key = BackendKey::new(dereg.service, dereg.address, dereg.port);
        match self.registry.deregister(&key).await {
            Ok(()) => HandlerStats::incr(&self.stats.deregisters),
            Err(GslbError::NotFound(_)) => {
                warn!(agent_id = %agent_id, backend = %key, "Deregister for unknown backend");
            }
            Err(e) => warn!(agent_id = %agent_id, backend = %key, error = %e, "Deregister failed"),
        }
    }

    async fn on_agent_auth(&self, agent_id: &str, req: AgentAuthPayload) {
        match self
            .auth
            .authenticate_agent(agent_id, &req.certificate_pem, &req.service_token)
            .await
        {
            Ok(pin) => {
                HandlerStats::incr(&self.stats.agent_auths);
                debug!(
                    agent_id = %agent_id,
                    fingerprint = %fingerprint_prefix(&pin.fingerprint),
                    "Agent authenticated"
                );
            }
            Err(e) => {
                HandlerStats::incr(&self.stats.auth_failures);
                warn!(
                    agent_id = %agent_id,
                    fingerprint = %fingerprint_prefix(&req.fingerprint),
                    error = %e,
                    "Agent authentication failed"
                );
            }
        }
    }

    async fn admitted(&self, agent_id: &str, kind: &str) -> bool {
        if !self.require_agent_auth || self.auth.is_admitted(agent_id).await {
            return true;
        }
        HandlerStats::incr(&self.stats.rejected);
        warn!(agent_id = %agent_id, kind = %kind, "Dropping message from unadmitted agent");
        false
    }

    fn reject(&self, agent_id: &str, kind: &str, fingerprint: &str, error: &GslbError) {
        HandlerStats::incr(&self.stats.rejected);
        warn!(
            agent_id = %agent_id,
            kind = %kind,
            fingerprint = %fingerprint_prefix(fingerprint),
            error = %error,
            "Dropping message from unauthenticated agent"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{AuthConfig, RegistryConfig};
    use gslb_common::BackendStatus;
    use gslb_common::messages::{BackendHeartbeat, PredictiveHealth};
    use rcgen::{CertificateParams, DnType, KeyPair};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    const TOKEN: &str = "cluster-secret";

    struct Fixture {
        registry: Arc<Registry>,
        auth: Arc<AgentAuth>,
        handler: GossipHandler,
    }

    fn fixture(require_agent_auth: bool) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let registry = Arc::new(Registry::new(&RegistryConfig::default(), None, clock.clone()));
        let auth = Arc::new(AgentAuth::new(
            &AuthConfig {
                service_tokens: vec![TOKEN.to_string()],
                ..Default::default()
            },
            None,
            clock,
        ));
        let handler = GossipHandler::new(
            registry.clone(),
            auth.clone(),
            require_agent_auth,
            Arc::new(HandlerStats::default()),
        );
        Fixture {
            registry,
            auth,
            handler,
        }
    }

    fn cert_pem() -> String {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, "gslb-agent-us-east");
        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().pem()
    }

    fn entry(address: &str, port: u16, healthy: bool) -> BackendHeartbeat {
        BackendHeartbeat {
            service: "web".to_string(),
            address: address.to_string(),
            port,
            weight: 100,
            healthy,
        }
    }

    fn heartbeat(agent: &str, backends: Vec<BackendHeartbeat>, fingerprint: &str) -> GossipMessage {
        GossipMessage::new(
            agent,
            "us-east",
            Payload::Heartbeat(HeartbeatPayload {
                backends,
                fingerprint: fingerprint.to_string(),
                predictive: None,
            }),
        )
    }

    #[tokio::test]
    async fn test_heartbeat_registers_each_backend() {
        let f = fixture(false);
        f.handler
            .handle(heartbeat(
                "a1",
                vec![
                    entry("10.0.0.1", 80, true),
                    entry("", 80, true),
                    entry("10.0.0.2", 80, false),
                ],
                "",
            ))
            .await;

        // The invalid entry is skipped, the rest still land
        assert_eq!(f.registry.backend_count().await, 2);
        let down = f
            .registry
            .get_backend(&BackendKey::new("web", "10.0.0.2", 80))
            .await
            .unwrap();
        assert_eq!(down.effective_status, BackendStatus::Unhealthy);
        assert_eq!(down.region, "us-east");
        assert_eq!(f.handler.stats().heartbeats.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_predictive_health_drains_agent_backends() {
        let f = fixture(false);
        let mut msg = heartbeat("a1", vec![entry("10.0.0.1", 80, true)], "");
        if let Payload::Heartbeat(ref mut hb) = msg.payload {
            hb.predictive = Some(PredictiveHealth {
                bleeding: true,
                bleed_reason: "memory_threshold_exceeded".to_string(),
                mem_percent: 97.0,
                ..Default::default()
            });
        }
        f.handler.handle(msg).await;

        let backend = f
            .registry
            .get_backend(&BackendKey::new("web", "10.0.0.1", 80))
            .await
            .unwrap();
        assert_eq!(backend.effective_status, BackendStatus::Draining);
        assert_eq!(backend.drain.reason, "memory_threshold_exceeded");
    }

    #[tokio::test]
    async fn test_register_and_deregister() {
        let f = fixture(false);
        let reg = GossipMessage::new(
            "a1",
            "us-east",
            Payload::Register(RegisterPayload {
                service: "api".to_string(),
                address: "10.0.0.5".to_string(),
                port: 8443,
                weight: 50,
            }),
        );
        f.handler.handle(reg).await;
        let key = BackendKey::new("api", "10.0.0.5", 8443);
        assert!(f.registry.is_healthy("10.0.0.5", 8443).await);

        let dereg = GossipMessage::new(
            "a1",
            "us-east",
            Payload::Deregister(DeregisterPayload {
                service: "api".to_string(),
                address: "10.0.0.5".to_string(),
                port: 8443,
            }),
        );
        f.handler.handle(dereg.clone()).await;
        assert!(f.registry.get_backend(&key).await.is_none());

        // Second deregister is logged, not fatal
        f.handler.handle(dereg).await;
        let stats = f.handler.stats().snapshot();
        assert_eq!(stats.registers, 1);
        assert_eq!(stats.deregisters, 1);
    }

    #[tokio::test]
    async fn test_agent_auth_pins_and_counts_failures() {
        let f = fixture(false);
        let pem = cert_pem();
        let auth_msg = |token: &str, pem: &str| {
            GossipMessage::new(
                "a1",
                "us-east",
                Payload::AgentAuth(AgentAuthPayload {
                    certificate_pem: pem.to_string(),
                    service_token: token.to_string(),
                    fingerprint: String::new(),
                }),
            )
        };

        f.handler.handle(auth_msg("wrong", &pem)).await;
        assert!(!f.auth.is_admitted("a1").await);

        f.handler.handle(auth_msg(TOKEN, &pem)).await;
        assert!(f.auth.is_admitted("a1").await);

        let stats = f.handler.stats().snapshot();
        assert_eq!(stats.auth_failures, 1);
        assert_eq!(stats.agent_auths, 1);
    }

    #[tokio::test]
    async fn test_unknown_type_is_counted() {
        let f = fixture(false);
        f.handler
            .handle(GossipMessage::new("a1", "us-east", Payload::Unknown("gossip_v2".into())))
            .await;
        assert_eq!(f.handler.stats().snapshot().unknown, 1);
        assert_eq!(f.registry.backend_count().await, 0);
    }

    #[tokio::test]
    async fn test_required_auth_gates_backend_messages() {
        let f = fixture(true);
        f.handler
            .handle(heartbeat("a1", vec![entry("10.0.0.1", 80, true)], "00"))
            .await;
        assert_eq!(f.registry.backend_count().await, 0);

        let pin = f.auth.authenticate_agent("a1", &cert_pem(), TOKEN).await.unwrap();
        f.handler
            .handle(heartbeat("a1", vec![entry("10.0.0.1", 80, true)], "deadbeef"))
            .await;
        assert_eq!(f.registry.backend_count().await, 0);

        f.handler
            .handle(heartbeat("a1", vec![entry("10.0.0.1", 80, true)], &pin.fingerprint))
            .await;
        assert_eq!(f.registry.backend_count().await, 1);

        f.auth.revoke_certificate("a1", "retired").await.unwrap();
        f.handler
            .handle(GossipMessage::new(
                "a1",
                "us-east",
                Payload::Deregister(DeregisterPayload {
                    service: "web".to_string(),
                    address: "10.0.0.1".to_string(),
                    port: 80,
                }),
            ))
            .await;
        assert_eq!(f.registry.backend_count().await, 1);
        assert_eq!(f.handler.stats().snapshot().rejected, 3);
    }

    #[tokio::test]
    async fn test_run_drains_queue_until_closed() {
        let f = fixture(false);
        let registry = f.registry.clone();
        let (tx, rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(f.handler.run(rx, shutdown_rx));

        tx.send(heartbeat("a1", vec![entry("10.0.0.1", 80, true)], ""))
            .await
            .unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(registry.backend_count().await, 1);
    }
}
