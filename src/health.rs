use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde_json::json;
use tracing::info;

use crate::ingest::IngestMetrics;

#[derive(Clone)]
struct HealthState {
    metrics: Arc<IngestMetrics>,
}

/// Start the health check HTTP server. Blocks for the process lifetime.
pub async fn start_health_server(port: u16, metrics: Arc<IngestMetrics>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_handler))
        .with_state(HealthState { metrics });

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("health server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_handler(State(state): State<HealthState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "ingest": state.metrics.snapshot(),
    }))
}
