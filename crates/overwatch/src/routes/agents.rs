//! Pinned agent administration.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gslb_common::PinnedCertificate;

use super::ApiError;
use crate::state::AppState;

/// Pin listing without the raw certificate
#[derive(Serialize)]
pub struct AgentSummary {
    agent_id: String,
    fingerprint: String,
    region: String,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    not_after: DateTime<Utc>,
    revoked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    revoked_reason: Option<String>,
}

impl From<PinnedCertificate> for AgentSummary {
    fn from(pin: PinnedCertificate) -> Self {
        Self {
            agent_id: pin.agent_id,
            fingerprint: pin.fingerprint,
            region: pin.region,
            first_seen: pin.first_seen,
            last_seen: pin.last_seen,
            not_after: pin.not_after,
            revoked: pin.revoked,
            revoked_reason: pin.revoked_reason,
        }
    }
}

pub async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentSummary>> {
    let pins = state.auth.list_pinned_certificates().await;
    Json(pins.into_iter().map(AgentSummary::from).collect())
}

#[derive(Deserialize, Default)]
pub struct RevokeRequest {
    #[serde(default)]
    reason: String,
}

pub async fn revoke_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(payload): Json<RevokeRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .auth
        .revoke_certificate(&agent_id, &payload.reason)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Unpin an agent; its next contact is treated as first contact
pub async fn delete_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.auth.delete_pinned_certificate(&agent_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
