//! Pure aggregations over raw ticks. Every function takes the reference
//! time explicitly.
//!
//! Stores that aggregate natively (SQL ordered-set aggregates) build the
//! same result types from their rows through the `from_*` constructors.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::percentiles::{percentile_cont, percentile_disc, round2};
use crate::model::{Tick, TickStatus};

const P99: f64 = 0.99;
const P95: f64 = 0.95;
const P90: f64 = 0.90;

// ─── Result types ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PercentileTriple {
    pub p99: f64,
    pub p95: f64,
    pub p90: f64,
}

impl PercentileTriple {
    pub const ZERO: Self = Self { p99: 0.0, p95: 0.0, p90: 0.0 };

    /// Continuous percentiles of `values`, rounded; zero when empty.
    fn continuous(mut values: Vec<f64>) -> Self {
        values.sort_by(|a, b| a.total_cmp(b));
        let at = |p| percentile_cont(&values, p).map(round2).unwrap_or(0.0);
        Self { p99: at(P99), p95: at(P95), p90: at(P90) }
    }

    /// From percentiles already computed in `[p99, p95, p90]` order. A
    /// missing array (empty input) is zero.
    pub fn from_ordered(values: Option<Vec<f64>>) -> Self {
        match values.as_deref() {
            Some(&[p99, p95, p90]) => Self {
                p99: round2(p99),
                p95: round2(p95),
                p90: round2(p90),
            },
            _ => Self::ZERO,
        }
    }
}

/// Fractions passed to ordered-set aggregates, matching
/// [`PercentileTriple::from_ordered`].
pub const PERCENTILE_FRACTIONS: [f64; 3] = [P99, P95, P90];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusPercentiles {
    pub p99: TickStatus,
    pub p95: TickStatus,
    pub p90: TickStatus,
}

impl StatusPercentiles {
    /// Discrete percentiles over `Up = 1, Down = 0`. Unknown ticks carry no
    /// vote; a window without any vote is `Unknown` throughout.
    fn discrete(ticks: &[&Tick]) -> Self {
        let mut votes: Vec<f64> = ticks
            .iter()
            .filter_map(|t| match t.status {
                TickStatus::Up => Some(1.0),
                TickStatus::Down => Some(0.0),
                TickStatus::Unknown => None,
            })
            .collect();
        votes.sort_by(|a, b| a.total_cmp(b));

        let at = |p| match percentile_disc(&votes, p) {
            Some(v) if v >= 1.0 => TickStatus::Up,
            Some(_) => TickStatus::Down,
            None => TickStatus::Unknown,
        };
        Self { p99: at(P99), p95: at(P95), p90: at(P90) }
    }

    /// From discrete percentiles of `Up = 1, Down = 0` votes in
    /// `[p99, p95, p90]` order. A missing array means no votes.
    pub fn from_votes(votes: Option<Vec<i32>>) -> Self {
        let status = |v: i32| if v >= 1 { TickStatus::Up } else { TickStatus::Down };
        match votes.as_deref() {
            Some(&[p99, p95, p90]) => Self {
                p99: status(p99),
                p95: status(p95),
                p90: status(p90),
            },
            _ => Self::UNKNOWN,
        }
    }

    pub const UNKNOWN: Self = Self {
        p99: TickStatus::Unknown,
        p95: TickStatus::Unknown,
        p90: TickStatus::Unknown,
    };
}

/// A value over the current window and the one right before it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Trend<T> {
    pub current: T,
    pub previous: T,
}

/// Percentile metrics of a single window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowMetrics {
    pub response_time_ms: PercentileTriple,
    pub status: StatusPercentiles,
    /// Percentiles of per-bucket availability percentage.
    pub availability_pct: PercentileTriple,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthMetrics {
    pub response_time_ms: Trend<PercentileTriple>,
    pub status: Trend<StatusPercentiles>,
    /// Percentiles of per-bucket availability percentage.
    pub availability_pct: Trend<PercentileTriple>,
}

impl HealthMetrics {
    pub fn from_windows(current: WindowMetrics, previous: WindowMetrics) -> Self {
        Self {
            response_time_ms: Trend {
                current: current.response_time_ms,
                previous: previous.response_time_ms,
            },
            status: Trend { current: current.status, previous: previous.status },
            availability_pct: Trend {
                current: current.availability_pct,
                previous: previous.availability_pct,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LatencyBucket {
    pub bucket: DateTime<Utc>,
    /// Whole-millisecond mean; `None` when no tick in the bucket had a
    /// response time.
    pub avg_response_ms: Option<i64>,
}

/// Inclusive time range for an uptime summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UptimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl UptimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        time >= self.from && time <= self.to
    }

    /// `"YYYY-MM-DD, YYYY-MM-DD"`.
    pub fn label(&self) -> String {
        format!("{}, {}", self.from.format("%Y-%m-%d"), self.to.format("%Y-%m-%d"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UptimeSummary {
    pub range: String,
    pub availability_pct: f64,
    pub avg_response_time_ms: f64,
}

impl UptimeSummary {
    /// From `total` ticks in `range`, `up` of them Up, and their mean
    /// response time.
    pub fn from_counts(range: UptimeRange, total: u64, up: u64, avg_response_time_ms: f64) -> Self {
        let availability_pct = if total == 0 { 0.0 } else { 100.0 * up as f64 / total as f64 };
        Self {
            range: range.label(),
            availability_pct: round2(availability_pct),
            avg_response_time_ms: round2(avg_response_time_ms),
        }
    }
}

// ─── Bucketing ───────────────────────────────────────────────────

/// Start of the epoch-aligned bucket of `width` containing `time`.
pub fn bucket_start(time: DateTime<Utc>, width: Duration) -> DateTime<Utc> {
    let width_ms = width.num_milliseconds().max(1);
    let ms = time.timestamp_millis();
    let start = ms - ms.rem_euclid(width_ms);
    DateTime::from_timestamp_millis(start).unwrap_or(time)
}

/// Mean response time per bucket, oldest bucket first. Only buckets that
/// contain at least one tick are returned.
pub fn bucket_latency(ticks: &[Tick], width: Duration) -> Vec<LatencyBucket> {
    // bucket → (sum, samples)
    let mut buckets: BTreeMap<DateTime<Utc>, (i64, i64)> = BTreeMap::new();
    for tick in ticks {
        let entry = buckets.entry(bucket_start(tick.time, width)).or_default();
        if let Some(ms) = tick.response_time_ms {
            entry.0 += ms;
            entry.1 += 1;
        }
    }

    buckets
        .into_iter()
        .map(|(bucket, (sum, samples))| LatencyBucket {
            bucket,
            avg_response_ms: (samples > 0).then(|| (sum as f64 / samples as f64).round() as i64),
        })
        .collect()
}

/// `100 * up / total` per bucket. Unknown ticks count as not up.
fn bucket_availability(ticks: &[&Tick], width: Duration) -> Vec<f64> {
    let mut buckets: BTreeMap<DateTime<Utc>, (u64, u64)> = BTreeMap::new();
    for tick in ticks {
        let entry = buckets.entry(bucket_start(tick.time, width)).or_default();
        entry.0 += (tick.status == TickStatus::Up) as u64;
        entry.1 += 1;
    }
    buckets
        .into_values()
        .map(|(up, total)| 100.0 * up as f64 / total as f64)
        .collect()
}

// ─── Health metrics ──────────────────────────────────────────────

/// Percentile metrics of the given ticks, which all belong to one window.
pub fn window_metrics(ticks: &[&Tick], bucket: Duration) -> WindowMetrics {
    WindowMetrics {
        response_time_ms: PercentileTriple::continuous(
            ticks.iter().filter_map(|t| t.response_time_ms).map(|ms| ms as f64).collect(),
        ),
        status: StatusPercentiles::discrete(ticks),
        availability_pct: PercentileTriple::continuous(bucket_availability(ticks, bucket)),
    }
}

/// Percentile health metrics over `(now - window, now]` and the preceding
/// `(now - 2*window, now - window]`. Ticks outside both are ignored.
pub fn health_metrics(ticks: &[Tick], now: DateTime<Utc>, window: Duration, bucket: Duration) -> HealthMetrics {
    let split = now - window;
    let floor = split - window;

    let current: Vec<&Tick> = ticks.iter().filter(|t| t.time > split && t.time <= now).collect();
    let previous: Vec<&Tick> = ticks.iter().filter(|t| t.time > floor && t.time <= split).collect();

    HealthMetrics::from_windows(window_metrics(&current, bucket), window_metrics(&previous, bucket))
}

// ─── Uptime ──────────────────────────────────────────────────────

/// Availability and mean response time of the ticks inside `range`
/// (bounds inclusive). Zero for both when the range holds no ticks.
pub fn uptime_summary(range: UptimeRange, ticks: &[Tick]) -> UptimeSummary {
    let mut total = 0u64;
    let mut up = 0u64;
    let mut response_sum = 0i64;
    let mut response_samples = 0i64;

    for tick in ticks.iter().filter(|t| range.contains(t.time)) {
        total += 1;
        up += (tick.status == TickStatus::Up) as u64;
        if let Some(ms) = tick.response_time_ms {
            response_sum += ms;
            response_samples += 1;
        }
    }

    let avg_response_time_ms = if response_samples == 0 {
        0.0
    } else {
        response_sum as f64 / response_samples as f64
    };
    UptimeSummary::from_counts(range, total, up, avg_response_time_ms)
}
