use std::collections::VecDeque;
use std::time::Instant;

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;

use super::summary::LatencySummary;
use super::ProbeSample;
use crate::model::TickStatus;

// ─── Configuration ───────────────────────────────────────────────

/// How many individual probes we keep for the live feed
const MAX_RECENT_PROBES: usize = 200;

/// Aggregate timeline resolution (one point per window)
const TIMELINE_WINDOW_MS: u64 = 10_000;

/// Oldest timeline points are dropped past this many (~4h at 10s windows)
const MAX_TIMELINE_POINTS: usize = 1_440;

/// Probe latency range: 1 ms → 2 min, 3 significant figures
const HIST_LOW: u64 = 1;
const HIST_HIGH: u64 = 120_000;
const HIST_SIGFIG: u8 = 3;

// ─── Public types ────────────────────────────────────────────────

/// Thread-safe pipeline counters and probe latency histogram.
/// Components call the `record_*` methods, the HTTP surface calls `snapshot()`.
pub struct PipelineStats {
    inner: Mutex<Inner>,
}

/// Monotonic counters since process start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    // scheduler
    pub dispatched: u64,
    pub dispatch_failures: u64,
    // region worker
    pub probes_up: u64,
    pub probes_down: u64,
    pub probes_unknown: u64,
    pub ticks_appended: u64,
    pub tick_append_failures: u64,
    pub skipped_foreign: u64,
    pub malformed: u64,
    pub acked: u64,
    // batch writer
    pub flushes: u64,
    pub flushed_ticks: u64,
    pub flush_failures: u64,
    pub dropped_ticks: u64,
}

/// A single entry in the live probe feed.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeRecord {
    pub timestamp_ms: u64,
    pub website_id: String,
    pub url: String,
    pub region: String,
    pub status: TickStatus,
    pub elapsed_ms: i64,
}

/// One aggregated point on the timeline (per 10 s window).
#[derive(Debug, Clone, Serialize)]
pub struct TimelinePoint {
    pub timestamp_ms: u64,
    pub avg_probe_ms: f64,
    pub up_ratio: f64,
    pub count: u64,
}

/// A bucket in the probe latency distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DistBucket {
    pub range_start_ms: u64,
    pub range_end_ms: u64,
    pub count: u64,
}

/// Complete snapshot served by `/api/stats` and on every SSE tick.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub probe_latency: LatencySummary,
    pub counters: Counters,
    pub probes_per_sec: f64,
    pub uptime_secs: f64,

    pub recent_probes: Vec<ProbeRecord>,
    pub timeline: Vec<TimelinePoint>,
    pub distribution: Vec<DistBucket>,
}

// ─── Internal state ──────────────────────────────────────────────

struct Inner {
    probe_hist: Histogram<u64>,
    counters: Counters,
    recent_probes: VecDeque<ProbeRecord>,
    timeline: VecDeque<TimelinePoint>,
    current_window: Option<WindowAccumulator>,
    started: Instant,
}

/// Running totals for the current timeline window.
struct WindowAccumulator {
    window_start_ms: u64,
    elapsed_sum: u64,
    up: u64,
    count: u64,
}

impl WindowAccumulator {
    fn point(&self) -> TimelinePoint {
        TimelinePoint {
            timestamp_ms: self.window_start_ms,
            avg_probe_ms: self.elapsed_sum as f64 / self.count as f64,
            up_ratio: self.up as f64 / self.count as f64,
            count: self.count,
        }
    }
}

// ─── PipelineStats impl ──────────────────────────────────────────

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
        }
    }

    pub fn record_dispatch(&self, appended: u64, failed: u64) {
        let mut inner = self.inner.lock();
        inner.counters.dispatched += appended;
        inner.counters.dispatch_failures += failed;
    }

    /// Record one probe observation. Called once per probed check request.
    pub fn record_probe(&self, sample: ProbeSample) {
        self.inner.lock().record_probe(sample);
    }

    pub fn record_cycle(&self, appended: u64, append_failures: u64, skipped: u64, malformed: u64) {
        let mut inner = self.inner.lock();
        inner.counters.ticks_appended += appended;
        inner.counters.tick_append_failures += append_failures;
        inner.counters.skipped_foreign += skipped;
        inner.counters.malformed += malformed;
    }

    pub fn record_acked(&self, count: u64) {
        self.inner.lock().counters.acked += count;
    }

    pub fn record_flush(&self, ticks: u64) {
        let mut inner = self.inner.lock();
        inner.counters.flushes += 1;
        inner.counters.flushed_ticks += ticks;
    }

    pub fn record_flush_failure(&self) {
        self.inner.lock().counters.flush_failures += 1;
    }

    pub fn record_dropped(&self, ticks: u64) {
        self.inner.lock().counters.dropped_ticks += ticks;
    }

    pub fn counters(&self) -> Counters {
        self.inner.lock().counters.clone()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.inner.lock().snapshot()
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Inner impl ──────────────────────────────────────────────────

impl Inner {
    fn new() -> Self {
        Self {
            probe_hist: Histogram::<u64>::new_with_bounds(HIST_LOW, HIST_HIGH, HIST_SIGFIG)
                .expect("static histogram bounds"),
            counters: Counters::default(),
            recent_probes: VecDeque::with_capacity(MAX_RECENT_PROBES + 1),
            timeline: VecDeque::new(),
            current_window: None,
            started: Instant::now(),
        }
    }

    fn record_probe(&mut self, sample: ProbeSample) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;

        // ── Counters ────────────────────────────────────────────
        match sample.status {
            TickStatus::Up => self.counters.probes_up += 1,
            TickStatus::Down => self.counters.probes_down += 1,
            TickStatus::Unknown => self.counters.probes_unknown += 1,
        }

        // ── Histogram (clamped into range) ─────────────────────
        let probe_ms = (sample.elapsed_ms.max(0) as u64).clamp(HIST_LOW, HIST_HIGH);
        let _ = self.probe_hist.record(probe_ms);

        // ── Timeline ────────────────────────────────────────────
        self.push_to_timeline(elapsed_ms, probe_ms, sample.status == TickStatus::Up);

        // ── Live feed ───────────────────────────────────────────
        self.recent_probes.push_back(ProbeRecord {
            timestamp_ms: elapsed_ms,
            website_id: sample.website_id,
            url: sample.url,
            region: sample.region,
            status: sample.status,
            elapsed_ms: sample.elapsed_ms,
        });
        if self.recent_probes.len() > MAX_RECENT_PROBES {
            self.recent_probes.pop_front();
        }
    }

    fn push_to_timeline(&mut self, elapsed_ms: u64, probe_ms: u64, up: bool) {
        let window_start = (elapsed_ms / TIMELINE_WINDOW_MS) * TIMELINE_WINDOW_MS;

        if let Some(w) = &mut self.current_window {
            if w.window_start_ms == window_start {
                w.elapsed_sum += probe_ms;
                w.up += up as u64;
                w.count += 1;
                return;
            }
        }

        if let Some(finished) = self.current_window.take() {
            self.timeline.push_back(finished.point());
            if self.timeline.len() > MAX_TIMELINE_POINTS {
                self.timeline.pop_front();
            }
        }
        self.current_window = Some(WindowAccumulator {
            window_start_ms: window_start,
            elapsed_sum: probe_ms,
            up: up as u64,
            count: 1,
        });
    }

    fn snapshot(&self) -> StatsSnapshot {
        let uptime_secs = self.started.elapsed().as_secs_f64();
        let probes = self.probe_hist.len();
        let probes_per_sec = if uptime_secs > 0.0 {
            probes as f64 / uptime_secs
        } else {
            0.0
        };

        // Include the current (partial) window
        let mut timeline: Vec<TimelinePoint> = self.timeline.iter().cloned().collect();
        if let Some(w) = &self.current_window {
            timeline.push(w.point());
        }

        StatsSnapshot {
            probe_latency: LatencySummary::from_histogram(&self.probe_hist),
            counters: self.counters.clone(),
            probes_per_sec,
            uptime_secs,
            recent_probes: self.recent_probes.iter().cloned().collect(),
            timeline,
            distribution: compute_distribution(&self.probe_hist),
        }
    }
}

// ── Distribution for the bar chart ──────────────────────────────

/// Bucket upper bounds in milliseconds. Values above the last bound land in
/// an overflow bucket ending at the histogram max.
const DIST_BOUNDARIES: &[u64] = &[
    25, 50, 100, 200, 300, 500, 750, 1_000, 1_500, 2_000, 5_000, 10_000,
];

fn compute_distribution(hist: &Histogram<u64>) -> Vec<DistBucket> {
    if hist.is_empty() {
        return Vec::new();
    }

    let mut counts = vec![0u64; DIST_BOUNDARIES.len() + 1];
    for iv in hist.iter_recorded() {
        // First boundary >= value; past the end means overflow
        let idx = match DIST_BOUNDARIES.binary_search(&iv.value_iterated_to()) {
            Ok(i) | Err(i) => i,
        };
        counts[idx] += iv.count_at_value();
    }

    let mut result = Vec::new();
    let mut prev = 0u64;
    for (&boundary, &count) in DIST_BOUNDARIES.iter().zip(&counts) {
        if count > 0 {
            result.push(DistBucket {
                range_start_ms: prev,
                range_end_ms: boundary,
                count,
            });
        }
        prev = boundary;
    }
    let overflow = counts[DIST_BOUNDARIES.len()];
    if overflow > 0 {
        result.push(DistBucket {
            range_start_ms: prev,
            range_end_ms: hist.max(),
            count: overflow,
        });
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(status: TickStatus, elapsed_ms: i64) -> ProbeSample {
        ProbeSample {
            website_id: "w1".into(),
            url: "http://a.test".into(),
            region: "IND".into(),
            status,
            elapsed_ms,
        }
    }

    #[test]
    fn probes_feed_counters_histogram_and_feed() {
        let stats = PipelineStats::new();
        stats.record_probe(sample(TickStatus::Up, 42));
        stats.record_probe(sample(TickStatus::Down, 2_000));
        stats.record_probe(sample(TickStatus::Unknown, 0));

        let snap = stats.snapshot();
        assert_eq!(snap.counters.probes_up, 1);
        assert_eq!(snap.counters.probes_down, 1);
        assert_eq!(snap.counters.probes_unknown, 1);
        assert_eq!(snap.probe_latency.count, 3);
        assert_eq!(snap.recent_probes.len(), 3);
        // Zero-millisecond probe is clamped to the histogram floor
        assert_eq!(snap.probe_latency.min_ms, 1);
        assert_eq!(snap.timeline.iter().map(|p| p.count).sum::<u64>(), 3);
    }

    #[test]
    fn live_feed_is_bounded() {
        let stats = PipelineStats::new();
        for i in 0..(MAX_RECENT_PROBES + 50) {
            stats.record_probe(sample(TickStatus::Up, i as i64));
        }
        assert_eq!(stats.snapshot().recent_probes.len(), MAX_RECENT_PROBES);
    }

    #[test]
    fn writer_and_scheduler_counters_accumulate() {
        let stats = PipelineStats::new();
        stats.record_dispatch(3, 1);
        stats.record_dispatch(2, 0);
        stats.record_flush(100);
        stats.record_flush(7);
        stats.record_flush_failure();
        stats.record_dropped(12);

        let counters = stats.counters();
        assert_eq!(counters.dispatched, 5);
        assert_eq!(counters.dispatch_failures, 1);
        assert_eq!(counters.flushes, 2);
        assert_eq!(counters.flushed_ticks, 107);
        assert_eq!(counters.flush_failures, 1);
        assert_eq!(counters.dropped_ticks, 12);
    }

    #[test]
    fn distribution_has_overflow_bucket() {
        let mut hist = Histogram::<u64>::new_with_bounds(HIST_LOW, HIST_HIGH, HIST_SIGFIG).unwrap();
        hist.record(10).unwrap();
        hist.record(20).unwrap();
        hist.record(60_000).unwrap();

        let dist = compute_distribution(&hist);
        assert_eq!(dist[0], DistBucket { range_start_ms: 0, range_end_ms: 25, count: 2 });
        let overflow = dist.last().unwrap();
        assert_eq!(overflow.range_start_ms, 10_000);
        assert_eq!(overflow.count, 1);
    }
}
