use hdrhistogram::Histogram;
use serde::Serialize;

/// Percentile breakdown of probe latency, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    pub min_ms: u64,
    pub max_ms: u64,
    pub mean_ms: f64,
    pub p50_ms: u64,
    pub p90_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub count: u64,
}

impl LatencySummary {
    /// Zeroed when the histogram is empty.
    pub fn from_histogram(hist: &Histogram<u64>) -> Self {
        if hist.is_empty() {
            return Self::empty();
        }

        Self {
            min_ms: hist.min(),
            max_ms: hist.max(),
            mean_ms: hist.mean(),
            p50_ms: hist.value_at_quantile(0.50),
            p90_ms: hist.value_at_quantile(0.90),
            p95_ms: hist.value_at_quantile(0.95),
            p99_ms: hist.value_at_quantile(0.99),
            count: hist.len(),
        }
    }

    pub fn empty() -> Self {
        Self {
            min_ms: 0,
            max_ms: 0,
            mean_ms: 0.0,
            p50_ms: 0,
            p90_ms: 0,
            p95_ms: 0,
            p99_ms: 0,
            count: 0,
        }
    }
}
