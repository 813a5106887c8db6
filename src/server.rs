#![forbid(unsafe_code)]

// HTTP server - health, Prometheus metrics and the room admin API

use crate::room::{api, RoomRegistry};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Shared handler state
#[derive(Clone)]
pub struct ApiServer {
    registry: RoomRegistry,
    metrics_token: Option<Arc<str>>,
}

impl ApiServer {
    pub fn new(registry: RoomRegistry, metrics_token: Option<String>) -> Self {
        if metrics_token.is_some() {
            info!("/metrics requires a bearer token");
        }
        Self {
            registry,
            metrics_token: metrics_token.map(Arc::from),
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Creates the Axum router
    pub fn router(self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/api/rooms", get(api::list_rooms))
            .route(
                "/api/rooms/{id}",
                get(api::get_room).post(api::create_room).delete(api::delete_room),
            )
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Serves until the listener fails
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting HTTP server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, self.router()).await?;

        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<ApiServer>) -> Json<serde_json::Value> {
    let registry = server.registry();
    Json(serde_json::json!({
        "status": "ok",
        "rooms": registry.room_count(),
        "participants": registry.total_participant_count(),
        "workers": registry.worker_pool().stats(),
    }))
}

/// Metrics handler - Prometheus text exposition format, optionally behind a bearer token
async fn metrics_handler(State(server): State<ApiServer>, headers: HeaderMap) -> Response {
    if let Some(expected) = &server.metrics_token {
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .unwrap_or("");
        if provided != expected.as_ref() {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let registry = server.registry();
    let body = registry
        .metrics()
        .render_prometheus(registry.room_count(), registry.total_participant_count());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}
