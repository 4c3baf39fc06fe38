//! Shared constants for GSLB components.

/// Default admin HTTP listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

/// Default gossip (UDP) bind address
pub const DEFAULT_GOSSIP_BIND_ADDR: &str = "0.0.0.0:7946";

/// Default Redis connection URL
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Heartbeat age after which a backend without validation is stale (seconds)
pub const DEFAULT_STALE_THRESHOLD_SECS: u64 = 30;

/// Heartbeat age after which a backend is removed entirely (5 minutes)
pub const DEFAULT_REMOVE_AFTER_SECS: u64 = 300;

/// EMA alpha for validation latency smoothing
pub const DEFAULT_LATENCY_SMOOTHING_FACTOR: f64 = 0.3;

/// External validation interval (seconds)
pub const DEFAULT_VALIDATION_INTERVAL_SECS: u64 = 30;

/// Per-probe timeout (seconds)
pub const DEFAULT_VALIDATION_TIMEOUT_SECS: u64 = 5;

/// Maximum in-flight validation probes
pub const DEFAULT_VALIDATION_MAX_CONCURRENT: usize = 10;

/// Inbound gossip queue depth; messages beyond this are dropped
pub const DEFAULT_GOSSIP_QUEUE_CAPACITY: usize = 1000;

/// Agent certificate CommonName prefix: `{prefix}-{region}`
pub const DEFAULT_AGENT_CN_PREFIX: &str = "gslb-agent";

/// Length of the fingerprint prefix allowed in log output
pub const FINGERPRINT_LOG_PREFIX_LEN: usize = 16;

/// KV store key prefixes
pub mod store_keys {
    /// Backend record: backends/{service}:{address}:{port}
    pub const BACKENDS_PREFIX: &str = "backends/";

    /// Pinned agent certificate: pinned_certs/{agent_id}
    pub const PINNED_CERTS_PREFIX: &str = "pinned_certs/";
}

/// Gossip message type tags
pub mod message_types {
    pub const HEARTBEAT: &str = "heartbeat";
    pub const REGISTER: &str = "register";
    pub const DEREGISTER: &str = "deregister";
    pub const AGENT_AUTH: &str = "agent_auth";
}
