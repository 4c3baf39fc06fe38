//! Trust-on-first-use agent authentication.
//!
//! The first time an agent ID is seen it must present a configured
//! pre-shared token; its certificate fingerprint is then pinned. Every later
//! authentication must present the same certificate. Pins change only
//! through an authenticated rotation, are marked (never deleted) on
//! revocation, and are removed only by an explicit unpin.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use subtle::{Choice, ConstantTimeEq};
use tokio::sync::RwLock;
use tracing::{info, warn};

use gslb_common::constants::store_keys;
use gslb_common::{GslbError, PinnedCertificate};

use crate::clock::Clock;
use crate::config::AuthConfig;
use crate::store::{KvStore, PERSIST_QUEUE_CAPACITY, Persister, STORE_OP_TIMEOUT, bounded};

pub mod certificate;

pub use certificate::{ParsedCertificate, fingerprint_prefix, parse_pem, region_from_common_name};

fn ct_eq_str(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

pub struct AgentAuth {
    /// SHA-256 of each accepted pre-shared token
    token_hashes: Vec<[u8; 32]>,
    region_prefix: String,
    store: Option<Arc<dyn KvStore>>,
    persister: Option<Persister>,
    clock: Arc<dyn Clock>,
    pins: RwLock<HashMap<String, PinnedCertificate>>,
}

impl AgentAuth {
    pub fn new(
        config: &AuthConfig,
        store: Option<Arc<dyn KvStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let token_hashes = config
            .service_tokens
            .iter()
            .filter(|t| !t.is_empty())
            .map(|t| Sha256::digest(t.as_bytes()).into())
            .collect::<Vec<[u8; 32]>>();

        if token_hashes.is_empty() {
            warn!("No service tokens configured; new agents cannot be admitted");
        }

        let persister = store
            .clone()
            .map(|store| Persister::spawn(store, PERSIST_QUEUE_CAPACITY, STORE_OP_TIMEOUT));

        Self {
            token_hashes,
            region_prefix: config.region_prefix.clone(),
            store,
            persister,
            clock,
            pins: RwLock::new(HashMap::new()),
        }
    }

    /// Constant-time check against every configured token
    fn token_matches(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        let digest = Sha256::digest(token.as_bytes());
        let mut matched = Choice::from(0);
        for hash in &self.token_hashes {
            matched |= hash.as_slice().ct_eq(digest.as_slice());
        }
        matched.into()
    }

    fn valid_certificate(
        &self,
        pem: &str,
        now: DateTime<Utc>,
    ) -> Result<ParsedCertificate, GslbError> {
        let parsed = parse_pem(pem)?;
        if !parsed.is_valid_at(now) {
            return Err(GslbError::CertificateExpired);
        }
        Ok(parsed)
    }

    /// Admit an agent. Unknown agents need a valid service token and are
    /// pinned on success; known agents must present the pinned certificate.
    pub async fn authenticate_agent(
        &self,
        agent_id: &str,
        certificate_pem: &str,
        service_token: &str,
    ) -> Result<PinnedCertificate, GslbError> {
        if agent_id.is_empty() {
            return Err(GslbError::AuthenticationFailed("agent_id is required".to_string()));
        }

        let now = self.clock.now();
        let parsed = self.valid_certificate(certificate_pem, now)?;

        // First contact for one agent ID is serialised here: the first
        // certificate pinned wins and later ones see a mismatch
        let mut pins = self.pins.write().await;

        if let Some(pin) = pins.get_mut(agent_id) {
            if pin.revoked {
                warn!(
                    agent_id = %agent_id,
                    fingerprint = %fingerprint_prefix(&parsed.fingerprint),
                    "Rejected revoked agent"
                );
                return Err(GslbError::CertificateRevoked);
            }
            if !ct_eq_str(&pin.fingerprint, &parsed.fingerprint) {
                warn!(
                    agent_id = %agent_id,
                    pinned = %fingerprint_prefix(&pin.fingerprint),
                    presented = %fingerprint_prefix(&parsed.fingerprint),
                    "Certificate fingerprint mismatch"
                );
                return Err(GslbError::FingerprintMismatch);
            }

            pin.last_seen = now;
            let snapshot = pin.clone();
            self.persist(&snapshot);
            return Ok(snapshot);
        }

        if !self.token_matches(service_token) {
            warn!(
                agent_id = %agent_id,
                fingerprint = %fingerprint_prefix(&parsed.fingerprint),
                "Invalid service token on first contact"
            );
            return Err(GslbError::InvalidToken);
        }

        let region = parsed
            .common_name
            .as_deref()
            .map(|cn| region_from_common_name(cn, &self.region_prefix))
            .unwrap_or_default();

        let pin = PinnedCertificate {
            agent_id: agent_id.to_string(),
            fingerprint: parsed.fingerprint,
            certificate_pem: certificate_pem.to_string(),
            region,
            first_seen: now,
            last_seen: now,
            not_after: parsed.not_after,
            revoked: false,
            revoked_at: None,
            revoked_reason: None,
        };

        info!(
            agent_id = %agent_id,
            region = %pin.region,
            fingerprint = %fingerprint_prefix(&pin.fingerprint),
            "Pinned new agent certificate"
        );
        pins.insert(agent_id.to_string(), pin.clone());
        self.persist(&pin);

        Ok(pin)
    }

    /// Mark an agent's pin revoked; it stays in place so the agent stays locked out
    pub async fn revoke_certificate(&self, agent_id: &str, reason: &str) -> Result<(), GslbError> {
        let now = self.clock.now();
        let mut pins = self.pins.write().await;
        let pin = pins
            .get_mut(agent_id)
            .ok_or_else(|| GslbError::NotFound(format!("agent {agent_id}")))?;

        pin.revoked = true;
        pin.revoked_at = Some(now);
        pin.revoked_reason = Some(reason.to_string());

        warn!(
            agent_id = %agent_id,
            reason = %reason,
            fingerprint = %fingerprint_prefix(&pin.fingerprint),
            "Agent certificate revoked"
        );
        let snapshot = pin.clone();
        self.persist(&snapshot);
        Ok(())
    }

    /// Rotate to a new certificate, proving possession of the current pin
    pub async fn update_certificate(
        &self,
        agent_id: &str,
        new_certificate_pem: &str,
        current_fingerprint: &str,
    ) -> Result<PinnedCertificate, GslbError> {
        let now = self.clock.now();
        let parsed = self.valid_certificate(new_certificate_pem, now)?;

        let mut pins = self.pins.write().await;
        let pin = pins
            .get_mut(agent_id)
            .ok_or_else(|| GslbError::NotFound(format!("agent {agent_id}")))?;

        if pin.revoked {
            return Err(GslbError::CertificateRevoked);
        }
        if !ct_eq_str(&pin.fingerprint, &current_fingerprint.to_ascii_lowercase()) {
            warn!(
                agent_id = %agent_id,
                presented = %fingerprint_prefix(current_fingerprint),
                "Rotation rejected: current fingerprint mismatch"
            );
            return Err(GslbError::FingerprintMismatch);
        }

        info!(
            agent_id = %agent_id,
            old = %fingerprint_prefix(&pin.fingerprint),
            new = %fingerprint_prefix(&parsed.fingerprint),
            "Agent certificate rotated"
        );

        if let Some(cn) = parsed.common_name.as_deref() {
            let region = region_from_common_name(cn, &self.region_prefix);
            if !region.is_empty() {
                pin.region = region;
            }
        }
        pin.fingerprint = parsed.fingerprint;
        pin.certificate_pem = new_certificate_pem.to_string();
        pin.not_after = parsed.not_after;
        pin.last_seen = now;

        let snapshot = pin.clone();
        self.persist(&snapshot);
        Ok(snapshot)
    }

    /// Check a presented fingerprint against an agent's unrevoked pin
    pub async fn verify_fingerprint(
        &self,
        agent_id: &str,
        fingerprint: &str,
    ) -> Result<(), GslbError> {
        let pins = self.pins.read().await;
        let pin = pins.get(agent_id).ok_or_else(|| {
            GslbError::AuthenticationFailed(format!("agent {agent_id} is not pinned"))
        })?;

        if pin.revoked {
            return Err(GslbError::CertificateRevoked);
        }
        if !ct_eq_str(&pin.fingerprint, &fingerprint.to_ascii_lowercase()) {
            return Err(GslbError::FingerprintMismatch);
        }
        Ok(())
    }

    /// Pinned and not revoked
    pub async fn is_admitted(&self, agent_id: &str) -> bool {
        self.pins
            .read()
            .await
            .get(agent_id)
            .is_some_and(|pin| !pin.revoked)
    }

    pub async fn get_pinned_certificate(&self, agent_id: &str) -> Option<PinnedCertificate> {
        self.pins.read().await.get(agent_id).cloned()
    }

    pub async fn list_pinned_certificates(&self) -> Vec<PinnedCertificate> {
        let pins = self.pins.read().await;
        let mut out: Vec<PinnedCertificate> = pins.values().cloned().collect();
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    /// Unpin an agent so its next contact is treated as first contact
    pub async fn delete_pinned_certificate(&self, agent_id: &str) -> Result<(), GslbError> {
        let mut pins = self.pins.write().await;
        let pin = pins
            .remove(agent_id)
            .ok_or_else(|| GslbError::NotFound(format!("agent {agent_id}")))?;

        if let Some(ref persister) = self.persister {
            persister.delete(PinnedCertificate::store_key(agent_id));
        }

        info!(
            agent_id = %agent_id,
            fingerprint = %fingerprint_prefix(&pin.fingerprint),
            "Agent certificate unpinned"
        );
        Ok(())
    }

    /// Unrevoked pins whose certificate expires within `within`
    pub async fn expiring_certificates(&self, within: Duration) -> Vec<PinnedCertificate> {
        let horizon = chrono::Duration::from_std(within)
            .ok()
            .and_then(|d| self.clock.now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let pins = self.pins.read().await;
        let mut out: Vec<PinnedCertificate> = pins
            .values()
            .filter(|pin| !pin.revoked && pin.not_after <= horizon)
            .cloned()
            .collect();
        out.sort_by_key(|pin| pin.not_after);
        out
    }

    /// Reload persisted pins
    pub async fn load_from_store(&self) -> Result<usize, GslbError> {
        let Some(ref store) = self.store else {
            return Ok(0);
        };

        let pairs = bounded(STORE_OP_TIMEOUT, store.list(store_keys::PINNED_CERTS_PREFIX)).await?;
        let mut pins = self.pins.write().await;
        let mut loaded = 0;

        for pair in pairs {
            match serde_json::from_slice::<PinnedCertificate>(&pair.value) {
                Ok(pin) => {
                    pins.insert(pin.agent_id.clone(), pin);
                    loaded += 1;
                }
                Err(e) => warn!(key = %pair.key, error = %e, "Skipping unreadable pin record"),
            }
        }

        info!(count = loaded, "Pinned certificates loaded from store");
        Ok(loaded)
    }

    /// Wait for queued store writes to be applied
    pub async fn flush(&self) {
        if let Some(ref persister) = self.persister {
            persister.flush().await;
        }
    }

    /// Queue the pin for the store; never waits on it
    fn persist(&self, pin: &PinnedCertificate) {
        let Some(ref persister) = self.persister else {
            return;
        };
        match serde_json::to_vec(pin) {
            Ok(bytes) => persister.put(PinnedCertificate::store_key(&pin.agent_id), bytes),
            Err(e) => warn!(agent_id = %pin.agent_id, error = %e, "Failed to encode pin"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::store::testing::HangingStore;
    use rcgen::{CertificateParams, DnType, KeyPair};

    const TOKEN: &str = "cluster-secret";

    fn cert(cn: &str) -> String {
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, cn);
        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().pem()
    }

    fn expired_cert() -> String {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, "gslb-agent-us-east");
        params.not_before = rcgen::date_time_ymd(2000, 1, 1);
        params.not_after = rcgen::date_time_ymd(2001, 1, 1);
        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().pem()
    }

    fn auth_with(store: Option<Arc<dyn KvStore>>) -> AgentAuth {
        let config = AuthConfig {
            service_tokens: vec![TOKEN.to_string(), "second-token".to_string()],
            ..Default::default()
        };
        AgentAuth::new(&config, store, Arc::new(ManualClock::default()))
    }

    #[tokio::test]
    async fn test_first_contact_pins_certificate() {
        let auth = auth_with(None);
        let pem = cert("gslb-agent-us-east");

        let pin = auth.authenticate_agent("a1", &pem, TOKEN).await.unwrap();
        assert_eq!(pin.region, "us-east");
        assert_eq!(pin.fingerprint, parse_pem(&pem).unwrap().fingerprint);
        assert!(auth.is_admitted("a1").await);

        // Known agents don't need the token again
        let again = auth.authenticate_agent("a1", &pem, "").await.unwrap();
        assert_eq!(again.first_seen, pin.first_seen);
    }

    #[tokio::test]
    async fn test_different_certificate_is_rejected() {
        let auth = auth_with(None);
        auth.authenticate_agent("a1", &cert("gslb-agent-us-east"), TOKEN)
            .await
            .unwrap();

        let err = auth
            .authenticate_agent("a1", &cert("gslb-agent-us-east"), TOKEN)
            .await
            .unwrap_err();
        assert!(matches!(err, GslbError::FingerprintMismatch));
    }

    #[tokio::test]
    async fn test_bad_token_for_new_agent() {
        let auth = auth_with(None);
        let pem = cert("gslb-agent-eu-west");

        for token in ["wrong", ""] {
            let err = auth.authenticate_agent("a2", &pem, token).await.unwrap_err();
            assert!(matches!(err, GslbError::InvalidToken));
        }
        assert!(auth.get_pinned_certificate("a2").await.is_none());

        // Any configured token works
        assert!(auth.authenticate_agent("a2", &pem, "second-token").await.is_ok());
    }

    #[tokio::test]
    async fn test_no_configured_tokens_rejects_everyone() {
        let auth = AgentAuth::new(
            &AuthConfig::default(),
            None,
            Arc::new(ManualClock::default()),
        );
        let err = auth
            .authenticate_agent("a1", &cert("gslb-agent-us-east"), "")
            .await
            .unwrap_err();
        assert!(matches!(err, GslbError::InvalidToken));
    }

    #[tokio::test]
    async fn test_revoked_agent_stays_locked_out() {
        let auth = auth_with(None);
        let pem = cert("gslb-agent-us-east");
        auth.authenticate_agent("a1", &pem, TOKEN).await.unwrap();

        auth.revoke_certificate("a1", "compromised").await.unwrap();
        let err = auth.authenticate_agent("a1", &pem, TOKEN).await.unwrap_err();
        assert!(matches!(err, GslbError::CertificateRevoked));
        let err = auth
            .authenticate_agent("a1", &cert("gslb-agent-us-east"), TOKEN)
            .await
            .unwrap_err();
        assert!(matches!(err, GslbError::CertificateRevoked));

        let pin = auth.get_pinned_certificate("a1").await.unwrap();
        assert!(pin.revoked);
        assert_eq!(pin.revoked_reason.as_deref(), Some("compromised"));
        assert!(!auth.is_admitted("a1").await);
    }

    #[tokio::test]
    async fn test_expired_certificate_rejected() {
        let auth = auth_with(None);
        let err = auth
            .authenticate_agent("a1", &expired_cert(), TOKEN)
            .await
            .unwrap_err();
        assert!(matches!(err, GslbError::CertificateExpired));
    }

    #[tokio::test]
    async fn test_invalid_pem_rejected() {
        let auth = auth_with(None);
        let err = auth.authenticate_agent("a1", "garbage", TOKEN).await.unwrap_err();
        assert!(matches!(err, GslbError::InvalidCertificate(_)));
    }

    #[tokio::test]
    async fn test_rotation_requires_current_fingerprint() {
        let auth = auth_with(None);
        let old_pem = cert("gslb-agent-us-east");
        let pin = auth.authenticate_agent("a1", &old_pem, TOKEN).await.unwrap();
        let new_pem = cert("gslb-agent-us-west");

        let err = auth
            .update_certificate("a1", &new_pem, "00ff")
            .await
            .unwrap_err();
        assert!(matches!(err, GslbError::FingerprintMismatch));

        let rotated = auth
            .update_certificate("a1", &new_pem, &pin.fingerprint.to_uppercase())
            .await
            .unwrap();
        assert_ne!(rotated.fingerprint, pin.fingerprint);
        assert_eq!(rotated.region, "us-west");

        // The old certificate no longer authenticates
        assert!(matches!(
            auth.authenticate_agent("a1", &old_pem, TOKEN).await,
            Err(GslbError::FingerprintMismatch)
        ));
        assert!(auth.authenticate_agent("a1", &new_pem, "").await.is_ok());
    }

    #[tokio::test]
    async fn test_rotation_rejects_revoked_and_expired() {
        let auth = auth_with(None);
        let pin = auth
            .authenticate_agent("a1", &cert("gslb-agent-us-east"), TOKEN)
            .await
            .unwrap();

        assert!(matches!(
            auth.update_certificate("a1", &expired_cert(), &pin.fingerprint).await,
            Err(GslbError::CertificateExpired)
        ));

        auth.revoke_certificate("a1", "retired").await.unwrap();
        assert!(matches!(
            auth.update_certificate("a1", &cert("gslb-agent-us-east"), &pin.fingerprint)
                .await,
            Err(GslbError::CertificateRevoked)
        ));
        assert!(matches!(
            auth.update_certificate("ghost", &cert("gslb-agent-us-east"), &pin.fingerprint)
                .await,
            Err(GslbError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_verify_fingerprint() {
        let auth = auth_with(None);
        let pin = auth
            .authenticate_agent("a1", &cert("gslb-agent-us-east"), TOKEN)
            .await
            .unwrap();

        assert!(auth.verify_fingerprint("a1", &pin.fingerprint).await.is_ok());
        assert!(matches!(
            auth.verify_fingerprint("a1", "deadbeef").await,
            Err(GslbError::FingerprintMismatch)
        ));
        assert!(matches!(
            auth.verify_fingerprint("a9", &pin.fingerprint).await,
            Err(GslbError::AuthenticationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_first_contact_has_one_winner() {
        let auth = Arc::new(auth_with(None));
        let certs: Vec<String> = (0..8).map(|_| cert("gslb-agent-us-east")).collect();

        let handles: Vec<_> = certs
            .iter()
            .cloned()
            .map(|pem| {
                let auth = auth.clone();
                tokio::spawn(async move { auth.authenticate_agent("a1", &pem, TOKEN).await })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert!(matches!(e, GslbError::FingerprintMismatch)),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_pins_survive_reload_and_unpin() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let auth = auth_with(Some(store.clone()));
        let pem = cert("gslb-agent-us-east");
        auth.authenticate_agent("a1", &pem, TOKEN).await.unwrap();
        auth.revoke_certificate("a1", "lost laptop").await.unwrap();
        auth.flush().await;

        let reloaded = auth_with(Some(store.clone()));
        assert_eq!(reloaded.load_from_store().await.unwrap(), 1);
        assert!(matches!(
            reloaded.authenticate_agent("a1", &pem, TOKEN).await,
            Err(GslbError::CertificateRevoked)
        ));

        reloaded.delete_pinned_certificate("a1").await.unwrap();
        reloaded.flush().await;
        assert!(store.get(&PinnedCertificate::store_key("a1")).await.unwrap().is_none());
        assert!(reloaded.authenticate_agent("a1", &pem, TOKEN).await.is_ok());
        assert!(matches!(
            reloaded.delete_pinned_certificate("a9").await,
            Err(GslbError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_hung_store_does_not_block_admission() {
        let store: Arc<dyn KvStore> = Arc::new(HangingStore);
        let auth = Arc::new(auth_with(Some(store)));
        let pem = cert("gslb-agent-us-east");
        let limit = Duration::from_secs(2);

        let first = {
            let auth = auth.clone();
            let pem = pem.clone();
            tokio::spawn(async move { auth.authenticate_agent("a1", &pem, TOKEN).await })
        };
        tokio::time::timeout(limit, first).await.unwrap().unwrap().unwrap();

        assert!(tokio::time::timeout(limit, auth.is_admitted("a1")).await.unwrap());
        tokio::time::timeout(limit, auth.authenticate_agent("a1", &pem, ""))
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(limit, auth.revoke_certificate("a1", "rotated out"))
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(limit, auth.delete_pinned_certificate("a1"))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_expiring_certificates() {
        let auth = auth_with(None);
        auth.authenticate_agent("a1", &cert("gslb-agent-us-east"), TOKEN)
            .await
            .unwrap();

        // rcgen's default validity runs for centuries
        assert!(auth.expiring_certificates(Duration::from_secs(86_400)).await.is_empty());
        assert_eq!(auth.expiring_certificates(Duration::MAX).await.len(), 1);
    }
}
