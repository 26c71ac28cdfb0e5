//! Periodic dispatch of check requests, one independent loop per tier.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::error::PipelineError;
use crate::model::Frequency;
use crate::stats::PipelineStats;
use crate::store::TargetStore;

/// Outcome of one dispatch invocation for a tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub tier: Frequency,
    /// Targets the store returned for this tier.
    pub due: usize,
    pub appended: usize,
    pub failed: usize,
}

pub struct Scheduler {
    broker: Arc<dyn Broker>,
    store: Arc<dyn TargetStore>,
    check_stream: String,
    stats: Arc<PipelineStats>,
}

impl Scheduler {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn TargetStore>,
        check_stream: impl Into<String>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            broker,
            store,
            check_stream: check_stream.into(),
            stats,
        }
    }

    /// Append one check request per target of `tier`.
    ///
    /// Only the store query can fail the whole invocation; a failed append
    /// is logged and counted, and the remaining targets are still sent.
    pub async fn dispatch(&self, tier: Frequency) -> Result<DispatchReport, PipelineError> {
        let targets = self.store.targets_by_frequency(tier).await?;

        let mut report = DispatchReport {
            tier,
            due: targets.len(),
            appended: 0,
            failed: 0,
        };

        for target in &targets {
            let payload = serde_json::to_string(&target.check_request())?;
            match self.broker.append(&self.check_stream, &payload).await {
                Ok(id) => {
                    debug!(tier = %tier, website_id = %target.id, message_id = %id, "check request appended");
                    report.appended += 1;
                }
                Err(e) => {
                    warn!(tier = %tier, website_id = %target.id, error = %e, "check request append failed");
                    report.failed += 1;
                }
            }
        }

        self.stats
            .record_dispatch(report.appended as u64, report.failed as u64);
        Ok(report)
    }

    /// Run the dispatch loop of a single tier until `shutdown` fires.
    ///
    /// The first dispatch happens one full period after start. Missed timer
    /// ticks are skipped, never replayed in a burst.
    pub async fn run_tier(self: Arc<Self>, tier: Frequency, shutdown: CancellationToken) {
        let period = tier.period();
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(tier = %tier, period_secs = period.as_secs(), "tier loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.dispatch(tier).await {
                Ok(report) if report.failed > 0 => {
                    warn!(tier = %tier, due = report.due, appended = report.appended, failed = report.failed, "dispatch incomplete");
                }
                Ok(report) => {
                    info!(tier = %tier, due = report.due, appended = report.appended, "dispatch complete");
                }
                Err(e) => {
                    error!(tier = %tier, error = %e, "dispatch skipped");
                }
            }
        }

        info!(tier = %tier, "tier loop stopped");
    }

    /// Spawn one loop per tier. Tiers share nothing but the scheduler's
    /// read-only handles.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        Frequency::ALL
            .into_iter()
            .map(|tier| tokio::spawn(Arc::clone(&self).run_tier(tier, shutdown.clone())))
            .collect()
    }
}
