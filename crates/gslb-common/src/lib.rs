//! # GSLB Common
//!
//! Shared types used by agents and Overwatch nodes.
//!
//! ## Modules
//! - `types` - Backend records, statuses, pinned certificates
//! - `messages` - Gossip wire schema (typed payloads)
//! - `error` - Common error type
//! - `constants` - Defaults and store key prefixes

pub mod constants;
pub mod error;
pub mod messages;
pub mod types;

pub use error::GslbError;
pub use messages::{GossipMessage, Payload};
pub use types::*;
