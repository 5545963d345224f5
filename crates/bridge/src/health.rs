//! HTTP health, readiness, and metrics surface.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::get,
};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::metrics;

#[derive(Clone)]
pub struct ServiceState {
    pub ready: Arc<AtomicBool>,
    pub bus_connected: Arc<AtomicBool>,
}

impl ServiceState {
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
            bus_connected: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for ServiceState {
    fn default() -> Self {
        Self::new()
    }
}

/// Starts the health/readiness/metrics HTTP server, binding on `port`.
pub async fn start_health_server(port: u16, state: ServiceState) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind health server to {addr}"))?;

    info!("health server listening on http://{}", addr);
    info!("   - GET /health  - liveness probe");
    info!("   - GET /ready   - readiness probe");
    info!("   - GET /metrics - prometheus metrics");

    axum::serve(listener, app)
        .await
        .context("health server failed")?;

    Ok(())
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    metrics::render_metrics().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "stream-bridge",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn readiness_check(State(state): State<ServiceState>) -> (StatusCode, Json<Value>) {
    let ready = state.ready.load(Ordering::SeqCst);
    let bus_connected = state.bus_connected.load(Ordering::SeqCst);

    if ready && bus_connected {
        (
            StatusCode::OK,
            Json(json!({
                "ready": true,
                "service": "stream-bridge",
                "bus_connected": bus_connected,
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "ready": false,
                "service": "stream-bridge",
                "bus_connected": bus_connected,
            })),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_readiness_reflects_state() {
        let state = ServiceState::new();
        let (status, _) = readiness_check(State(state.clone())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        state.ready.store(true, Ordering::SeqCst);
        state.bus_connected.store(true, Ordering::SeqCst);
        let (status, _) = readiness_check(State(state)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_check_reports_service_name() {
        let Json(value) = health_check().await;
        assert_eq!(value["service"], "stream-bridge");
    }
}
