use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;

use super::collector::{PipelineStats, StatsSnapshot};

/// How often the SSE stream pushes a fresh snapshot.
const STREAM_INTERVAL: Duration = Duration::from_millis(500);

// ─── GET /api/stats ──────────────────────────────────────────────
/// Single JSON snapshot.

pub async fn get_stats(State(stats): State<Arc<PipelineStats>>) -> Json<StatsSnapshot> {
    Json(stats.snapshot())
}

// ─── GET /api/stats/stream ───────────────────────────────────────
/// Server-Sent Events endpoint pushing a full `StatsSnapshot` as JSON
/// every 500 ms.

pub async fn stats_stream(
    State(stats): State<Arc<PipelineStats>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let interval = tokio::time::interval(STREAM_INTERVAL);

    let stream = IntervalStream::new(interval).map(move |_| {
        let json = serde_json::to_string(&stats.snapshot()).unwrap_or_default();
        Ok(Event::default().data(json))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
