//! HTTP route handlers for Overwatch.

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use serde_json::json;
use tower_http::trace::TraceLayer;

use gslb_common::GslbError;

use crate::state::AppState;

mod agents;
mod backends;
mod health;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Status
        .route("/health", get(health::health_check))
        .route("/ready", get(health::ready_check))
        // Admin API
        .nest("/api/v1", api_routes())
        .layer(TraceLayer::new_for_http())
        // Add shared state
        .with_state(state)
}

/// Admin routes (backends, overrides, agents)
fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/backends", get(backends::list_backends))
        .route(
            "/overrides/{service}/{address}/{port}",
            put(backends::set_override).delete(backends::clear_override),
        )
        .route("/validate", post(backends::validate_now))
        .route("/agents", get(agents::list_agents))
        .route("/agents/{agent_id}/revoke", post(agents::revoke_agent))
        .route("/agents/{agent_id}", delete(agents::delete_agent))
        .route("/stats", get(backends::get_stats))
}

/// Maps library errors onto HTTP responses
pub struct ApiError(GslbError);

impl From<GslbError> for ApiError {
    fn from(err: GslbError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::AppConfig;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use gslb_common::{BackendRegistration, BackendStatus};
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn state() -> AppState {
        let mut config = AppConfig::default();
        config.auth.service_tokens = vec!["token".to_string()];
        AppState::with_store(config, Arc::new(MemoryStore::new()), Arc::new(SystemClock))
            .await
            .unwrap()
    }

    async fn register(state: &AppState, service: &str, port: u16) {
        state
            .registry
            .register(BackendRegistration {
                agent_id: "a1".to_string(),
                region: "us-east".to_string(),
                service: service.to_string(),
                address: "10.0.0.1".to_string(),
                port,
                weight: 100,
                healthy: true,
            })
            .await
            .unwrap();
    }

    async fn call(
        state: &AppState,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = create_router(state.clone())
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let state = state().await;
        let (status, body) = call(&state, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(&state, Method::GET, "/ready", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["store"], "memory");
    }

    #[tokio::test]
    async fn test_list_backends_filters_by_service() {
        let state = state().await;
        register(&state, "web", 80).await;
        register(&state, "api", 8080).await;

        let (status, body) = call(&state, Method::GET, "/api/v1/backends?service=web", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["effective_status"], "healthy");

        let (_, body) = call(&state, Method::GET, "/api/v1/backends", None).await;
        assert_eq!(body.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_override_round_trip() {
        let state = state().await;
        register(&state, "web", 80).await;

        let (status, body) = call(
            &state,
            Method::PUT,
            "/api/v1/overrides/web/10.0.0.1/80",
            Some(json!({"healthy": false, "reason": "maintenance", "by": "ops"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["effective_status"], "unhealthy");
        assert!(!state.registry.is_healthy("10.0.0.1", 80).await);

        let uri = "/api/v1/overrides/web/10.0.0.1/80";
        let (status, _) = call(&state, Method::DELETE, uri, None).await;
        assert_eq!(status, StatusCode::OK);
        let backend = state.registry.get_all_backends().await.remove(0);
        assert_eq!(backend.effective_status, BackendStatus::Healthy);

        let uri = "/api/v1/overrides/web/10.0.0.9/80";
        let (status, body) = call(&state, Method::DELETE, uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("web:10.0.0.9:80"));
    }

    #[tokio::test]
    async fn test_agent_admin_not_found() {
        let state = state().await;
        let (status, _) = call(
            &state,
            Method::POST,
            "/api/v1/agents/ghost/revoke",
            Some(json!({"reason": "test"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&state, Method::DELETE, "/api/v1/agents/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&state, Method::GET, "/api/v1/agents", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stats() {
        let state = state().await;
        register(&state, "web", 80).await;

        let (status, body) = call(&state, Method::GET, "/api/v1/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["node_id"], state.node_id.as_str());
        assert_eq!(body["backends"]["total"], 1);
        assert_eq!(body["gossip"]["heartbeats"], 0);
    }

    #[test]
    fn test_error_status_mapping() {
        let response = ApiError::from(GslbError::CertificateRevoked).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let response = ApiError::from(GslbError::InvalidInput("x".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
