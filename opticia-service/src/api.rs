//! HTTP API for the Opticia broker.
//!
//! This module provides:
//! - Health and metrics monitoring
//! - The tool catalog
//! - The live session WebSocket endpoint

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::service::BrokerService;
use crate::tools::ToolDefinition;
use crate::websocket::handle_ws_connection;

/// Application state
pub struct AppState {
    pub service: Arc<BrokerService>,
    pub start_time: Instant,
    pub metrics: PrometheusHandle,
}

/// Build the API router
pub fn router(service: Arc<BrokerService>, metrics: PrometheusHandle) -> Router {
    let state = Arc::new(AppState {
        service,
        start_time: Instant::now(),
        metrics,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/tools", get(tools_handler))
        .route("/ws/session", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// === Health & Metrics ===

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let upstream_configured = state.service.config.upstream.has_credentials();
    Json(HealthResponse {
        status: if upstream_configured { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        upstream_configured,
        connections: state.service.connections.connection_count(),
        sessions: state.service.orchestrator.session_count(),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: String,
    uptime_seconds: u64,
    upstream_configured: bool,
    connections: usize,
    sessions: usize,
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

// === Tools ===

async fn tools_handler(State(state): State<Arc<AppState>>) -> Json<Vec<ToolDefinition>> {
    Json(state.service.tools.definitions(true))
}

// === WebSocket ===

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("WebSocket upgrade request received");
    let service = state.service.clone();
    ws.on_upgrade(move |socket| handle_ws_connection(socket, service))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::tools::{SearchAnswer, SearchBackend, ToolRegistry, register_builtin_tools};
    use crate::upstream::testing::ScriptedUpstream;
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use serde_json::Value;
    use tower::ServiceExt;

    struct NoSearch;

    #[async_trait]
    impl SearchBackend for NoSearch {
        async fn search(&self, _query: &str) -> Result<SearchAnswer, crate::error::SearchError> {
            Err(crate::error::SearchError::MissingCredentials)
        }
    }

    fn app() -> Router {
        let mut tools = ToolRegistry::new();
        tokio_test::assert_ok!(register_builtin_tools(&mut tools, Arc::new(NoSearch)));
        let service = BrokerService::new(
            ServiceConfig::default(),
            Arc::new(ScriptedUpstream::silent()),
            tools,
        );
        let handle = PrometheusBuilder::new().build_recorder().handle();
        router(Arc::new(service), handle)
    }

    async fn get_json(app: Router, uri: &str) -> Value {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_counts() {
        let health = get_json(app(), "/health").await;
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["upstreamConfigured"], false);
        assert_eq!(health["connections"], 0);
        assert_eq!(health["sessions"], 0);
    }

    #[tokio::test]
    async fn test_tool_catalog_lists_builtins() {
        let tools = get_json(app(), "/api/tools").await;
        let names: Vec<&str> = tools
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|t| t["name"].as_str())
            .collect();
        assert!(names.contains(&"web_search"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint_is_text() {
        let response = app()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; version=0.0.4"
        );
    }
}
