//! Backend, override, and validation endpoints.

use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::{Deserialize, Serialize};

use gslb_common::{Backend, BackendKey, GslbError};

use super::ApiError;
use crate::gossip::HandlerStatsSnapshot;
use crate::state::AppState;
use crate::validator::{ValidationStats, ValidationSummary};

#[derive(Deserialize)]
pub struct BackendQuery {
    service: Option<String>,
}

pub async fn list_backends(
    State(state): State<AppState>,
    Query(query): Query<BackendQuery>,
) -> Json<Vec<Backend>> {
    let backends = match query.service {
        Some(ref service) => state.registry.get_backends(service).await,
        None => state.registry.get_all_backends().await,
    };
    Json(backends)
}

#[derive(Deserialize)]
pub struct SetOverride {
    healthy: bool,
    #[serde(default)]
    reason: String,
    #[serde(default = "default_operator")]
    by: String,
}

fn default_operator() -> String {
    "admin".to_string()
}

async fn current(state: &AppState, key: &BackendKey) -> Result<Json<Backend>, ApiError> {
    state
        .registry
        .get_backend(key)
        .await
        .map(Json)
        .ok_or_else(|| GslbError::NotFound(key.to_string()).into())
}

pub async fn set_override(
    State(state): State<AppState>,
    Path((service, address, port)): Path<(String, String, u16)>,
    Json(payload): Json<SetOverride>,
) -> Result<Json<Backend>, ApiError> {
    let key = BackendKey::new(service, address, port);
    state
        .registry
        .set_override(&key, payload.healthy, payload.reason, payload.by)
        .await?;
    current(&state, &key).await
}

pub async fn clear_override(
    State(state): State<AppState>,
    Path((service, address, port)): Path<(String, String, u16)>,
) -> Result<Json<Backend>, ApiError> {
    let key = BackendKey::new(service, address, port);
    state.registry.clear_override(&key).await?;
    current(&state, &key).await
}

/// Run an out-of-band validation sweep
pub async fn validate_now(State(state): State<AppState>) -> Json<ValidationSummary> {
    Json(state.validator.validate_now().await)
}

#[derive(Serialize)]
pub struct StatsResponse {
    node_id: String,
    uptime_secs: u64,
    store: &'static str,
    validator_enabled: bool,
    pinned_agents: usize,
    backends: ValidationStats,
    gossip: HandlerStatsSnapshot,
}

pub async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        node_id: state.node_id.clone(),
        uptime_secs: state.uptime_secs(),
        store: state.store.kind(),
        validator_enabled: state.validator.is_enabled(),
        pinned_agents: state.auth.list_pinned_certificates().await.len(),
        backends: state.validator.stats().await,
        gossip: state.gossip_stats.snapshot(),
    })
}
