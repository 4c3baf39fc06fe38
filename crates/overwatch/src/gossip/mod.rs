//! Gossip ingestion.
//!
//! ```text
//! UDP datagram → frame::open (ChaCha20-Poly1305) → GossipMessage::decode
//!     → bounded queue → GossipHandler (sequential) → Registry / AgentAuth
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

pub mod frame;
pub mod handler;
pub mod receiver;

pub use handler::GossipHandler;
pub use receiver::GossipReceiver;

/// Ingestion counters shared by the receiver and the handler
#[derive(Debug, Default)]
pub struct HandlerStats {
    /// Heartbeats applied
    pub heartbeats: AtomicU64,
    /// Register messages applied
    pub registers: AtomicU64,
    /// Deregister messages applied
    pub deregisters: AtomicU64,
    /// Successful agent authentications
    pub agent_auths: AtomicU64,
    /// Messages with an unrecognised type
    pub unknown: AtomicU64,
    /// Backend messages dropped because the agent is not admitted
    pub rejected: AtomicU64,
    /// Failed agent authentications
    pub auth_failures: AtomicU64,
    /// Datagrams that fail to decrypt under the cluster key
    pub bad_frames: AtomicU64,
    /// Authenticated datagrams that failed to decode
    pub decode_errors: AtomicU64,
    /// Messages dropped because the queue was full
    pub queue_full: AtomicU64,
}

impl HandlerStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HandlerStatsSnapshot {
        HandlerStatsSnapshot {
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            registers: self.registers.load(Ordering::Relaxed),
            deregisters: self.deregisters.load(Ordering::Relaxed),
            agent_auths: self.agent_auths.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            bad_frames: self.bad_frames.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of gossip statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HandlerStatsSnapshot {
    pub heartbeats: u64,
    pub registers: u64,
    pub deregisters: u64,
    pub agent_auths: u64,
    pub unknown: u64,
    pub rejected: u64,
    pub auth_failures: u64,
    pub bad_frames: u64,
    pub decode_errors: u64,
    pub queue_full: u64,
}
