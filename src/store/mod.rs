//! The target store: monitored targets, regions and the tick series.
//!
//! Targets and regions are written by the registration layer; the pipeline
//! reads them, appends ticks, and answers the metrics engine's aggregate
//! queries.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::StoreError;
use crate::metrics::aggregate::{self, LatencyBucket, UptimeRange, UptimeSummary, WindowMetrics};
use crate::model::{Frequency, MonitoredTarget, Region, Tick};

pub use self::memory::MemoryStore;
pub use self::postgres::PgStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Every target scheduled under `tier`, each with its declared regions.
    async fn targets_by_frequency(&self, tier: Frequency) -> StoreResult<Vec<MonitoredTarget>>;

    async fn region_by_name(&self, name: &str) -> StoreResult<Region>;

    /// Insert all `ticks` in a single transaction. Nothing is written when
    /// an error is returned.
    async fn batch_insert_ticks(&self, ticks: &[Tick]) -> StoreResult<u64>;

    /// The most recent `limit` ticks of a website across all regions,
    /// oldest first.
    async fn latest_statuses(&self, website_id: &str, limit: usize) -> StoreResult<Vec<Tick>>;

    /// Ticks of a website with `from <= time <= to`, optionally restricted
    /// to one region by name, oldest first.
    async fn ticks_between(
        &self,
        website_id: &str,
        region: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Tick>>;

    // ── Aggregates ──────────────────────────────────────────────
    //
    // The provided bodies fold raw ticks from `ticks_between` in memory;
    // a database-backed store overrides them with native queries.

    /// Mean response time per epoch-aligned bucket of `width` for one
    /// region, `from <= time <= to`, oldest bucket first. Buckets without
    /// ticks are absent.
    async fn bucketed_latency(
        &self,
        website_id: &str,
        region: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        width: Duration,
    ) -> StoreResult<Vec<LatencyBucket>> {
        let ticks = self.ticks_between(website_id, Some(region), from, to).await?;
        Ok(aggregate::bucket_latency(&ticks, width))
    }

    /// Percentile metrics over `after < time <= until`, optionally for one
    /// region. Availability is taken per bucket of `bucket`.
    async fn window_metrics(
        &self,
        website_id: &str,
        region: Option<&str>,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
        bucket: Duration,
    ) -> StoreResult<WindowMetrics> {
        let ticks = self.ticks_between(website_id, region, after, until).await?;
        let window: Vec<&Tick> = ticks.iter().filter(|t| t.time > after).collect();
        Ok(aggregate::window_metrics(&window, bucket))
    }

    /// Availability and mean response time across all regions inside
    /// `range`, bounds inclusive.
    async fn uptime(&self, website_id: &str, range: UptimeRange) -> StoreResult<UptimeSummary> {
        let ticks = self.ticks_between(website_id, None, range.from, range.to).await?;
        Ok(aggregate::uptime_summary(range, &ticks))
    }
}
