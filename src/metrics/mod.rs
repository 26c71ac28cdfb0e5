//! Read-side metrics over the tick series.
//!
//! The engine turns request parameters into time windows and asks the store
//! for the aggregates. Stores that cannot aggregate natively fall back to
//! the pure functions in [`aggregate`].

pub mod aggregate;
pub mod percentiles;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::model::Tick;
use crate::store::{StoreResult, TargetStore};

pub use self::aggregate::{
    HealthMetrics, LatencyBucket, PercentileTriple, StatusPercentiles, Trend, UptimeRange,
    UptimeSummary, WindowMetrics,
};

#[derive(Debug, Clone)]
pub struct MetricsSettings {
    /// Width of latency and availability buckets.
    pub bucket_width: Duration,
    /// Length of the current (and of the previous) comparison window.
    pub window: Duration,
    /// Ticks returned by the latest-status snapshot.
    pub status_limit: usize,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            bucket_width: Duration::minutes(5),
            window: Duration::days(30),
            status_limit: 5,
        }
    }
}

pub struct MetricsEngine {
    store: Arc<dyn TargetStore>,
    settings: MetricsSettings,
}

impl MetricsEngine {
    pub fn new(store: Arc<dyn TargetStore>) -> Self {
        Self::with_settings(store, MetricsSettings::default())
    }

    pub fn with_settings(store: Arc<dyn TargetStore>, settings: MetricsSettings) -> Self {
        Self { store, settings }
    }

    /// The most recent ticks of a website across regions, oldest first.
    pub async fn latest_statuses(&self, website_id: &str) -> StoreResult<Vec<Tick>> {
        self.store
            .latest_statuses(website_id, self.settings.status_limit)
            .await
    }

    /// Mean response time per bucket for one region over the last `days`.
    pub async fn bucketed_latency(
        &self,
        website_id: &str,
        region: &str,
        days: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<LatencyBucket>> {
        let from = now - Duration::days(i64::from(days));
        self.store
            .bucketed_latency(website_id, region, from, now, self.settings.bucket_width)
            .await
    }

    /// Response time, status and availability percentiles for the current
    /// window against the previous one. `region = None` spans all regions.
    pub async fn percentile_metrics(
        &self,
        website_id: &str,
        region: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<HealthMetrics> {
        let window = self.settings.window;
        let bucket = self.settings.bucket_width;
        let split = now - window;

        let current = self
            .store
            .window_metrics(website_id, region, split, now, bucket)
            .await?;
        let previous = self
            .store
            .window_metrics(website_id, region, split - window, split, bucket)
            .await?;
        Ok(HealthMetrics::from_windows(current, previous))
    }

    /// One summary per requested range, in request order.
    pub async fn uptime(&self, website_id: &str, ranges: &[UptimeRange]) -> StoreResult<Vec<UptimeSummary>> {
        let mut summaries = Vec::with_capacity(ranges.len());
        for range in ranges {
            summaries.push(self.store.uptime(website_id, *range).await?);
        }
        Ok(summaries)
    }
}
