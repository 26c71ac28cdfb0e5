//! Process-local pipeline statistics.
//!
//! Every component pushes observations into a shared [`PipelineStats`];
//! the optional HTTP surface reads snapshots of it.

pub mod collector;
pub mod stream;
pub mod summary;

pub use collector::{PipelineStats, StatsSnapshot};
pub use summary::LatencySummary;

use crate::model::TickStatus;

/// One probe observation recorded by a region worker.
#[derive(Debug, Clone)]
pub struct ProbeSample {
    pub website_id: String,
    pub url: String,
    pub region: String,
    pub status: TickStatus,
    pub elapsed_ms: i64,
}
