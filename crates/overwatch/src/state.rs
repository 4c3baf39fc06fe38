//! Application state and shared resources.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;

use crate::auth::AgentAuth;
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::gossip::HandlerStats;
use crate::health;
use crate::registry::Registry;
use crate::store::{self, KvStore};
use crate::validator::Validator;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: AppConfig,

    /// Node identifier for clustering
    pub node_id: String,

    /// Persistence backend (memory or Redis)
    pub store: Arc<dyn KvStore>,

    /// Backend health consensus
    pub registry: Arc<Registry>,

    /// TOFU agent admission
    pub auth: Arc<AgentAuth>,

    /// External validation loop
    pub validator: Arc<Validator>,

    /// Gossip ingestion counters
    pub gossip_stats: Arc<HandlerStats>,

    pub started_at: Instant,
}

impl AppState {
    /// Build every service and reload persisted state
    pub async fn new(config: AppConfig) -> Result<Self> {
        let store = store::open(&config.store)
            .await
            .context("Failed to open store")?;
        Self::with_store(config, store, Arc::new(SystemClock)).await
    }

    pub async fn with_store(
        config: AppConfig,
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let registry = Arc::new(Registry::new(
            &config.registry,
            Some(store.clone()),
            clock.clone(),
        ));
        let auth = Arc::new(AgentAuth::new(&config.auth, Some(store.clone()), clock));

        registry
            .load_from_store()
            .await
            .context("Failed to load backends")?;
        auth.load_from_store()
            .await
            .context("Failed to load pinned certificates")?;

        let checker = health::checker_for(&config.validator)?;
        let validator = Arc::new(Validator::new(&config.validator, registry.clone(), checker));
        let node_id = config.node_id.clone();

        Ok(Self {
            config,
            node_id,
            store,
            registry,
            auth,
            validator,
            gossip_stats: Arc::new(HandlerStats::default()),
            started_at: Instant::now(),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
