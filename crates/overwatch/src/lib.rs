//! # Overwatch - GSLB health consensus node
//!
//! Agents co-located with backends gossip their health here. Overwatch
//! combines agent claims, its own validation probes, heartbeat staleness and
//! operator overrides into one effective status per backend.
//!
//! ## Architecture
//! ```text
//! Agents ──UDP/AEAD──→ GossipReceiver → queue → GossipHandler ─┬→ Registry ──→ StatusChange subscribers
//!                                                             └→ AgentAuth (TOFU)
//!                      Validator ──probes──→ Backends ──────────→ Registry
//!                                                  Registry, AgentAuth ⇄ KvStore (memory | Redis)
//! ```

pub mod auth;
pub mod clock;
pub mod config;
pub mod gossip;
pub mod health;
pub mod registry;
pub mod routes;
pub mod state;
pub mod store;
pub mod validator;
