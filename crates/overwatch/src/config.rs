//! Configuration management for Overwatch.

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use gslb_common::GslbError;
use gslb_common::constants::{
    DEFAULT_AGENT_CN_PREFIX, DEFAULT_GOSSIP_BIND_ADDR, DEFAULT_GOSSIP_QUEUE_CAPACITY,
    DEFAULT_LATENCY_SMOOTHING_FACTOR, DEFAULT_LISTEN_ADDR, DEFAULT_REDIS_URL,
    DEFAULT_REMOVE_AFTER_SECS, DEFAULT_STALE_THRESHOLD_SECS, DEFAULT_VALIDATION_INTERVAL_SECS,
    DEFAULT_VALIDATION_MAX_CONCURRENT, DEFAULT_VALIDATION_TIMEOUT_SECS,
};

/// Environment variable prefix, e.g. `GSLB__REGISTRY__STALE_THRESHOLD_SECS`
const ENV_PREFIX: &str = "GSLB";

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Admin HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// This node's unique ID (auto-generated if not set)
    #[serde(default = "generate_node_id")]
    pub node_id: String,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub validator: ValidatorConfig,

    #[serde(default)]
    pub gossip: GossipConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

/// Backend registry timing
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Heartbeat age after which an unvalidated backend is stale
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_secs: u64,

    /// Heartbeat age after which a backend is removed entirely
    #[serde(default = "default_remove_after")]
    pub remove_after_secs: u64,

    /// EMA alpha for validation latency, in (0, 1]
    #[serde(default = "default_smoothing_factor")]
    pub latency_smoothing_factor: f64,
}

impl RegistryConfig {
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    pub fn remove_after(&self) -> Duration {
        Duration::from_secs(self.remove_after_secs)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_threshold_secs: default_stale_threshold(),
            remove_after_secs: default_remove_after(),
            latency_smoothing_factor: default_smoothing_factor(),
        }
    }
}

/// Probe type used by the validator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    #[default]
    Tcp,
    Http,
}

/// External validation loop
#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    #[serde(default = "default_check_timeout")]
    pub check_timeout_secs: u64,

    /// Maximum in-flight probes
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default)]
    pub check_type: CheckType,

    /// HTTP probes only
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// HTTP probes only
    #[serde(default = "default_check_path")]
    pub path: String,
}

impl ValidatorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: default_check_interval(),
            check_timeout_secs: default_check_timeout(),
            max_concurrent: default_max_concurrent(),
            check_type: CheckType::default(),
            scheme: default_scheme(),
            path: default_check_path(),
        }
    }
}

/// Gossip ingestion (UDP)
#[derive(Debug, Clone, Deserialize)]
pub struct GossipConfig {
    #[serde(default = "default_gossip_bind")]
    pub bind_addr: String,

    /// Base64 cluster key, 32 bytes once decoded
    #[serde(default)]
    pub encryption_key: String,

    /// Inbound queue depth; excess messages are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Drop backend messages from agents that are not pinned
    #[serde(default)]
    pub require_agent_auth: bool,
}

impl GossipConfig {
    /// Decode the cluster key used to encrypt gossip frames
    pub fn key(&self) -> Result<[u8; 32], GslbError> {
        if self.encryption_key.is_empty() {
            return Err(GslbError::Config(
                "gossip.encryption_key is required".to_string(),
            ));
        }
        let bytes = STANDARD
            .decode(self.encryption_key.trim())
            .map_err(|e| GslbError::Config(format!("gossip.encryption_key is not base64: {e}")))?;
        <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
            GslbError::Config(format!(
                "gossip.encryption_key must decode to 32 bytes, got {}",
                bytes.len()
            ))
        })
    }
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_gossip_bind(),
            encryption_key: String::new(),
            queue_capacity: default_queue_capacity(),
            require_agent_auth: false,
        }
    }
}

/// Agent admission
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared tokens accepted on first contact; empty rejects every new agent
    #[serde(default)]
    pub service_tokens: Vec<String>,

    /// CommonName prefix: `{prefix}-{region}`
    #[serde(default = "default_region_prefix")]
    pub region_prefix: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            service_tokens: Vec::new(),
            region_prefix: default_region_prefix(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
        }
    }
}

/// Command-line values that take precedence over file and environment
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub listen: Option<String>,
    pub gossip_bind: Option<String>,
    pub redis_url: Option<String>,
}

// Default value functions
fn default_listen_addr() -> String { DEFAULT_LISTEN_ADDR.to_string() }
fn default_gossip_bind() -> String { DEFAULT_GOSSIP_BIND_ADDR.to_string() }
fn default_redis_url() -> String { DEFAULT_REDIS_URL.to_string() }
fn default_stale_threshold() -> u64 { DEFAULT_STALE_THRESHOLD_SECS }
fn default_remove_after() -> u64 { DEFAULT_REMOVE_AFTER_SECS }
fn default_smoothing_factor() -> f64 { DEFAULT_LATENCY_SMOOTHING_FACTOR }
fn default_check_interval() -> u64 { DEFAULT_VALIDATION_INTERVAL_SECS }
fn default_check_timeout() -> u64 { DEFAULT_VALIDATION_TIMEOUT_SECS }
fn default_max_concurrent() -> usize { DEFAULT_VALIDATION_MAX_CONCURRENT }
fn default_scheme() -> String { "http".to_string() }
fn default_check_path() -> String { "/health".to_string() }
fn default_queue_capacity() -> usize { DEFAULT_GOSSIP_QUEUE_CAPACITY }
fn default_region_prefix() -> String { DEFAULT_AGENT_CN_PREFIX.to_string() }
fn default_true() -> bool { true }

fn generate_node_id() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    format!("overwatch-{:08x}", rng.random::<u32>())
}

impl AppConfig {
    /// Load configuration from file and `GSLB__*` environment, with CLI overrides
    pub fn load(config_path: &str, overrides: &CliOverrides) -> Result<Self> {
        let mut builder = config::Config::builder();

        if Path::new(config_path).exists() {
            builder = builder.add_source(config::File::with_name(config_path));
        } else {
            tracing::warn!(path = %config_path, "Config file not found, using defaults");
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("auth.service_tokens")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load config")?;

        let mut config: Self = settings
            .try_deserialize()
            .context("Failed to parse config")?;

        config.apply_overrides(overrides);
        config.validate()?;

        Ok(config)
    }

    pub fn apply_overrides(&mut self, overrides: &CliOverrides) {
        if let Some(ref listen) = overrides.listen {
            self.listen_addr = listen.clone();
        }
        if let Some(ref bind) = overrides.gossip_bind {
            self.gossip.bind_addr = bind.clone();
        }
        if let Some(ref redis_url) = overrides.redis_url {
            self.store.redis_url = redis_url.clone();
        }
    }

    /// Reject settings the runtime cannot honour
    pub fn validate(&self) -> Result<(), GslbError> {
        let registry = &self.registry;
        if registry.stale_threshold_secs == 0 {
            return Err(GslbError::Config(
                "registry.stale_threshold_secs must be positive".to_string(),
            ));
        }
        if registry.remove_after_secs <= registry.stale_threshold_secs {
            return Err(GslbError::Config(format!(
                "registry.remove_after_secs ({}) must exceed stale_threshold_secs ({})",
                registry.remove_after_secs, registry.stale_threshold_secs
            )));
        }
        let alpha = registry.latency_smoothing_factor;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(GslbError::Config(format!(
                "registry.latency_smoothing_factor must be in (0, 1], got {alpha}"
            )));
        }

        let validator = &self.validator;
        if validator.check_interval_secs == 0 || validator.check_timeout_secs == 0 {
            return Err(GslbError::Config(
                "validator intervals must be positive".to_string(),
            ));
        }
        if validator.max_concurrent == 0 {
            return Err(GslbError::Config(
                "validator.max_concurrent must be positive".to_string(),
            ));
        }

        if self.gossip.queue_capacity == 0 {
            return Err(GslbError::Config(
                "gossip.queue_capacity must be positive".to_string(),
            ));
        }
        self.gossip.key()?;

        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            node_id: generate_node_id(),
            registry: RegistryConfig::default(),
            validator: ValidatorConfig::default(),
            gossip: GossipConfig::default(),
            auth: AuthConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.gossip.encryption_key = STANDARD.encode([7u8; 32]);
        config
    }

    #[test]
    fn test_defaults_validate_with_key() {
        let config = valid_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.registry.stale_threshold(), Duration::from_secs(30));
        assert_eq!(config.validator.check_type, CheckType::Tcp);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.node_id.starts_with("overwatch-"));
    }

    #[test]
    fn test_remove_after_must_exceed_stale_threshold() {
        let mut config = valid_config();
        config.registry.remove_after_secs = config.registry.stale_threshold_secs;
        assert!(matches!(config.validate(), Err(GslbError::Config(_))));
    }

    #[test]
    fn test_smoothing_factor_range() {
        let mut config = valid_config();
        config.registry.latency_smoothing_factor = 0.0;
        assert!(config.validate().is_err());
        config.registry.latency_smoothing_factor = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = valid_config();
        config.validator.max_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_gossip_key_length() {
        let mut config = valid_config();
        config.gossip.encryption_key = STANDARD.encode([1u8; 16]);
        assert!(config.validate().is_err());
        config.gossip.encryption_key = String::new();
        assert!(config.validate().is_err());
        config.gossip.encryption_key = "!!!".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_overrides_win() {
        let mut config = valid_config();
        config.apply_overrides(&CliOverrides {
            listen: Some("0.0.0.0:9090".to_string()),
            gossip_bind: Some("127.0.0.1:7000".to_string()),
            redis_url: None,
        });
        assert_eq!(config.listen_addr, "0.0.0.0:9090");
        assert_eq!(config.gossip.bind_addr, "127.0.0.1:7000");
        assert_eq!(config.store.redis_url, DEFAULT_REDIS_URL);
    }

    #[test]
    fn test_toml_sections_deserialize() {
        let toml = r#"
            listen_addr = "0.0.0.0:8081"
            [validator]
            check_type = "http"
            path = "/ready"
            [store]
            backend = "redis"
            [auth]
            service_tokens = ["alpha", "beta"]
        "#;
        let config: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.listen_addr, "0.0.0.0:8081");
        assert_eq!(config.validator.check_type, CheckType::Http);
        assert_eq!(config.validator.path, "/ready");
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.auth.service_tokens, vec!["alpha", "beta"]);
        assert_eq!(config.auth.region_prefix, DEFAULT_AGENT_CN_PREFIX);
    }
}
