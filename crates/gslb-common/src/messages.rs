//! Gossip wire schema.
//!
//! Agents send JSON envelopes of the form
//! `{type, agent_id, region, timestamp, payload}`. The envelope is decoded
//! once, at the transport boundary, into [`GossipMessage`] with a typed
//! [`Payload`]. Payload fields are lenient: a missing or mistyped field falls
//! back to its default instead of failing the whole message, and integral
//! floats (`80.0`) are accepted for integer fields.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::constants::message_types;
use crate::error::GslbError;
use crate::types::Drain;

/// A decoded gossip message from an agent.
#[derive(Debug, Clone, PartialEq)]
pub struct GossipMessage {
    pub agent_id: String,
    pub region: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub payload: Payload,
}

/// Message body, keyed by the envelope `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Heartbeat(HeartbeatPayload),
    Register(RegisterPayload),
    Deregister(DeregisterPayload),
    AgentAuth(AgentAuthPayload),
    /// Unrecognised type tag; carried through so the handler can log it
    Unknown(String),
}

impl Payload {
    pub fn message_type(&self) -> &str {
        match self {
            Self::Heartbeat(_) => message_types::HEARTBEAT,
            Self::Register(_) => message_types::REGISTER,
            Self::Deregister(_) => message_types::DEREGISTER,
            Self::AgentAuth(_) => message_types::AGENT_AUTH,
            Self::Unknown(kind) => kind,
        }
    }
}

/// Periodic bulk status report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatPayload {
    #[serde(deserialize_with = "lenient_seq")]
    pub backends: Vec<BackendHeartbeat>,
    /// Agent certificate fingerprint
    #[serde(deserialize_with = "lenient")]
    pub fingerprint: String,
    #[serde(deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub predictive: Option<PredictiveHealth>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendHeartbeat {
    #[serde(deserialize_with = "lenient")]
    pub service: String,
    #[serde(deserialize_with = "lenient")]
    pub address: String,
    #[serde(deserialize_with = "lenient")]
    pub port: u16,
    #[serde(deserialize_with = "lenient")]
    pub weight: u32,
    #[serde(deserialize_with = "lenient")]
    pub healthy: bool,
}

/// Predictive-health block attached to heartbeats.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictiveHealth {
    #[serde(deserialize_with = "lenient")]
    pub bleeding: bool,
    #[serde(deserialize_with = "lenient")]
    pub bleed_reason: String,
    #[serde(deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub bleeding_at: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "lenient")]
    pub cpu_percent: f64,
    #[serde(deserialize_with = "lenient")]
    pub mem_percent: f64,
    #[serde(deserialize_with = "lenient")]
    pub error_rate: f64,
}

/// A bleeding agent drains all of its backends
impl From<PredictiveHealth> for Drain {
    fn from(p: PredictiveHealth) -> Self {
        Self {
            draining: p.bleeding,
            reason: p.bleed_reason,
            since: p.bleeding_at,
            cpu_percent: p.cpu_percent,
            mem_percent: p.mem_percent,
            error_rate: p.error_rate,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterPayload {
    #[serde(deserialize_with = "lenient")]
    pub service: String,
    #[serde(deserialize_with = "lenient")]
    pub address: String,
    #[serde(deserialize_with = "lenient")]
    pub port: u16,
    #[serde(deserialize_with = "lenient")]
    pub weight: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeregisterPayload {
    #[serde(deserialize_with = "lenient")]
    pub service: String,
    #[serde(deserialize_with = "lenient")]
    pub address: String,
    #[serde(deserialize_with = "lenient")]
    pub port: u16,
}

/// TOFU authentication request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentAuthPayload {
    #[serde(deserialize_with = "lenient")]
    pub certificate_pem: String,
    #[serde(deserialize_with = "lenient")]
    pub service_token: String,
    #[serde(deserialize_with = "lenient")]
    pub fingerprint: String,
}

/// On-the-wire envelope
#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type", default, deserialize_with = "lenient")]
    kind: String,
    #[serde(default, deserialize_with = "lenient")]
    agent_id: String,
    #[serde(default, deserialize_with = "lenient")]
    region: String,
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    payload: Value,
}

impl GossipMessage {
    /// Build a message stamped with the current time
    pub fn new(agent_id: impl Into<String>, region: impl Into<String>, payload: Payload) -> Self {
        Self {
            agent_id: agent_id.into(),
            region: region.into(),
            timestamp: Some(Utc::now()),
            payload,
        }
    }

    pub fn message_type(&self) -> &str {
        self.payload.message_type()
    }

    /// Decode a JSON envelope into a typed message
    pub fn decode(bytes: &[u8]) -> Result<Self, GslbError> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| GslbError::Gossip(format!("invalid envelope: {e}")))?;

        let kind = envelope.kind.as_str();
        let payload = match kind {
            message_types::HEARTBEAT => Payload::Heartbeat(decode_payload(kind, envelope.payload)?),
            message_types::REGISTER => Payload::Register(decode_payload(kind, envelope.payload)?),
            message_types::DEREGISTER => {
                Payload::Deregister(decode_payload(kind, envelope.payload)?)
            }
            message_types::AGENT_AUTH => {
                Payload::AgentAuth(decode_payload(kind, envelope.payload)?)
            }
            _ => Payload::Unknown(envelope.kind.clone()),
        };

        Ok(Self {
            agent_id: envelope.agent_id,
            region: envelope.region,
            timestamp: envelope.timestamp,
            payload,
        })
    }

    /// Encode into a JSON envelope
    pub fn encode(&self) -> Result<Vec<u8>, GslbError> {
        let payload = match &self.payload {
            Payload::Heartbeat(p) => serde_json::to_value(p)?,
            Payload::Register(p) => serde_json::to_value(p)?,
            Payload::Deregister(p) => serde_json::to_value(p)?,
            Payload::AgentAuth(p) => serde_json::to_value(p)?,
            Payload::Unknown(_) => Value::Null,
        };
        let envelope = Envelope {
            kind: self.message_type().to_string(),
            agent_id: self.agent_id.clone(),
            region: self.region.clone(),
            timestamp: self.timestamp,
            payload,
        };
        Ok(serde_json::to_vec(&envelope)?)
    }
}

fn decode_payload<T: DeserializeOwned>(kind: &str, value: Value) -> Result<T, GslbError> {
    if !value.is_object() {
        return Err(GslbError::Gossip(format!("{kind} payload is not an object")));
    }
    serde_json::from_value(value)
        .map_err(|e| GslbError::Gossip(format!("invalid {kind} payload: {e}")))
}

/// Deserialize a field, falling back to `T::default()` on any type mismatch
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(coerce(value))
}

/// Deserialize a list, skipping entries that are not objects
fn lenient_seq<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    let Value::Array(items) = value else {
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .filter(Value::is_object)
        .map(coerce)
        .collect())
}

fn coerce<T: DeserializeOwned + Default>(value: Value) -> T {
    // Generic encoders round-trip every number through f64
    let value = match value {
        Value::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Value::from(f as i64),
            _ => Value::Number(n),
        },
        other => other,
    };
    T::deserialize(value).unwrap_or_default()
}
