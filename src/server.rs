use std::net::SocketAddr;
use std::sync::Arc;

use axum::{middleware as axum_mw, routing::get, Json, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::middleware::timing;
use crate::stats::{stream, PipelineStats};

/// Builds the stats `Router`: health probe, JSON snapshot and SSE stream.
pub fn create_router(stats: Arc<PipelineStats>) -> Router {
    Router::new()
        .route("/health", get(health))
        // ── Stats ───────────────────────────────────────────────
        .route("/api/stats", get(stream::get_stats))
        .route("/api/stats/stream", get(stream::stats_stream))
        .with_state(stats)
        // ── Global middleware (applied bottom-up) ───────────────
        .layer(axum_mw::from_fn(timing::timing_middleware))
        .layer(CorsLayer::permissive())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Serve the stats router on `addr` until `shutdown` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    stats: Arc<PipelineStats>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "stats listener ready");

    axum::serve(listener, create_router(stats))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
