// Downstream API surface
//
// HTTP health/metrics endpoints plus the JSON-RPC 2.0 WebSocket that local
// MUD clients connect to.

pub mod health;
pub mod rpc;

use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;
use axum::routing::{any, get};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the full downstream router
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/healthz", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .route("/health", get(health::detailed))
        .route("/metrics", get(health::metrics))
        .route("/ws", any(rpc::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(gateway)
}

/// Bind and serve the API until the process shuts down
pub async fn serve(gateway: Arc<Gateway>, host: &str, port: u16) -> Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| GatewayError::Network(format!("cannot bind {}: {}", addr, e)))?;
    info!(address = %addr, "API listening");

    axum::serve(listener, router(gateway))
        .await
        .map_err(|e| GatewayError::Network(e.to_string()))
}
