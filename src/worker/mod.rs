//! Region worker: consumes check requests under its region's consumer group,
//! probes the targets that declared the region, and emits ticks.

pub mod probe;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Broker, MessageId, CHECK_STREAM, TICK_STREAM};
use crate::error::{BrokerError, PipelineError};
use crate::model::{CheckRequest, Region, Tick};
use crate::retry::{sleep_or_cancel, Backoff};
use crate::stats::{PipelineStats, ProbeSample};
use crate::store::TargetStore;

pub use self::probe::{classify, HttpProber, ProbeOutcome, ProbeResult, Prober};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Region this worker probes from; also its consumer group name.
    pub region_name: String,
    /// Consumer name inside the region's group.
    pub worker_id: String,
    pub check_stream: String,
    pub tick_stream: String,
    /// Max messages per read.
    pub read_count: usize,
    pub block_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(region_name: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            region_name: region_name.into(),
            worker_id: worker_id.into(),
            check_stream: CHECK_STREAM.to_string(),
            tick_stream: TICK_STREAM.to_string(),
            read_count: 10,
            block_timeout: Duration::from_secs(5),
        }
    }
}

/// What one read cycle did with the messages it was handed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub delivered: usize,
    /// Of `delivered`, entries replayed from this consumer's pending set.
    pub redelivered: usize,
    pub probed: usize,
    /// Valid requests for other regions.
    pub skipped: usize,
    /// Payloads that did not decode as a check request.
    pub malformed: usize,
    pub appended: usize,
    /// Ticks that could not be appended; their requests stay pending.
    pub failed: usize,
    pub acked: u64,
}

pub struct RegionWorker {
    config: WorkerConfig,
    region: Region,
    broker: Arc<dyn Broker>,
    prober: Arc<dyn Prober>,
    stats: Arc<PipelineStats>,
    /// Read this consumer's pending entries before new ones. Set at start
    /// and after a failed tick append, cleared once nothing is pending.
    replay_pending: AtomicBool,
}

impl RegionWorker {
    /// Resolve the worker's region and make sure its consumer group exists.
    /// Either failure is fatal for the worker.
    pub async fn start(
        config: WorkerConfig,
        broker: Arc<dyn Broker>,
        store: &dyn TargetStore,
        prober: Arc<dyn Prober>,
        stats: Arc<PipelineStats>,
    ) -> Result<Self, PipelineError> {
        let region = store.region_by_name(&config.region_name).await?;
        broker
            .create_group(&config.check_stream, &config.region_name)
            .await?;

        info!(
            region = %region.name,
            region_id = %region.id,
            worker_id = %config.worker_id,
            "region worker ready"
        );

        Ok(Self {
            config,
            region,
            broker,
            prober,
            stats,
            replay_pending: AtomicBool::new(true),
        })
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Read one batch of check requests and handle every message in it.
    ///
    /// Malformed and foreign messages are acknowledged without a tick.
    /// Relevant ones are probed concurrently and acknowledged only once
    /// their tick is on the tick stream; the others stay pending and are
    /// replayed by a later cycle. All acks of a cycle go out in one call.
    /// Only the read itself can fail the cycle.
    pub async fn poll_once(&self) -> Result<CycleReport, PipelineError> {
        let cfg = &self.config;

        let mut redelivered = Vec::new();
        if self.replay_pending.load(Ordering::Acquire) {
            redelivered = self
                .broker
                .read_pending(&cfg.check_stream, &cfg.region_name, &cfg.worker_id, "0", cfg.read_count)
                .await?;
            if redelivered.is_empty() {
                self.replay_pending.store(false, Ordering::Release);
            }
        }

        let mut report = CycleReport {
            redelivered: redelivered.len(),
            ..CycleReport::default()
        };
        let messages = if redelivered.is_empty() {
            self.broker
                .read_group(
                    &cfg.check_stream,
                    &cfg.region_name,
                    &cfg.worker_id,
                    cfg.read_count,
                    cfg.block_timeout,
                )
                .await?
        } else {
            debug!(count = redelivered.len(), "replaying pending check requests");
            redelivered
        };

        report.delivered = messages.len();
        if messages.is_empty() {
            return Ok(report);
        }

        let mut to_ack: Vec<MessageId> = Vec::with_capacity(messages.len());
        let mut due: Vec<(MessageId, CheckRequest)> = Vec::new();

        for message in messages {
            match serde_json::from_str::<CheckRequest>(&message.payload) {
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "dropping malformed check request");
                    report.malformed += 1;
                    to_ack.push(message.id);
                }
                Ok(request) if !request.targets_region(&cfg.region_name) => {
                    report.skipped += 1;
                    to_ack.push(message.id);
                }
                Ok(request) => due.push((message.id, request)),
            }
        }

        // ── Probe concurrently ──────────────────────────────────
        let results = join_all(due.iter().map(|(_, request)| self.prober.probe(&request.url))).await;
        report.probed = results.len();

        // ── Emit ticks ──────────────────────────────────────────
        for ((id, request), result) in due.into_iter().zip(results) {
            let status = result.status();
            self.stats.record_probe(ProbeSample {
                website_id: request.id.clone(),
                url: request.url.clone(),
                region: self.region.name.clone(),
                status,
                elapsed_ms: result.elapsed_ms,
            });

            let tick = Tick {
                time: Utc::now(),
                response_time_ms: Some(result.elapsed_ms),
                status,
                region_id: self.region.id.clone(),
                website_id: request.id,
            };
            let payload = serde_json::to_string(&tick)?;

            match self.broker.append(&cfg.tick_stream, &payload).await {
                Ok(_) => {
                    report.appended += 1;
                    to_ack.push(id);
                }
                Err(e) => {
                    // Left pending and replayed by the next cycle
                    warn!(message_id = %id, website_id = %tick.website_id, error = %e, "tick append failed");
                    report.failed += 1;
                }
            }
        }

        // ── Acknowledge ─────────────────────────────────────────
        if !to_ack.is_empty() {
            match self
                .broker
                .ack(&cfg.check_stream, &cfg.region_name, &to_ack)
                .await
            {
                Ok(n) => report.acked = n,
                Err(e) => warn!(count = to_ack.len(), error = %e, "ack failed"),
            }
        }

        if report.failed > 0 {
            self.replay_pending.store(true, Ordering::Release);
        }

        self.stats.record_cycle(
            report.appended as u64,
            report.failed as u64,
            report.skipped as u64,
            report.malformed as u64,
        );
        self.stats.record_acked(report.acked);

        Ok(report)
    }

    /// Poll until `shutdown` fires. Failed reads and cycles with failed
    /// appends back off before the next read; a clean cycle resets the
    /// backoff. A vanished consumer group is recreated.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut backoff = Backoff::default();

        loop {
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = self.poll_once() => outcome,
            };

            match outcome {
                Ok(report) if report.failed > 0 => {
                    let delay = backoff.next_delay();
                    warn!(
                        region = %self.region.name,
                        failed = report.failed,
                        retry_in_ms = delay.as_millis() as u64,
                        "tick appends failed, requests left pending"
                    );
                    if !sleep_or_cancel(delay, &shutdown).await {
                        break;
                    }
                }
                Ok(report) => {
                    backoff.reset();
                    if report.delivered > 0 {
                        debug!(region = %self.region.name, ?report, "cycle complete");
                    }
                }
                Err(e) => {
                    if matches!(e, PipelineError::Broker(BrokerError::NoSuchGroup { .. }))
                        && self.recreate_group().await
                    {
                        continue;
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        region = %self.region.name,
                        error = %e,
                        attempt = backoff.attempts(),
                        retry_in_ms = delay.as_millis() as u64,
                        "read cycle failed"
                    );
                    if !sleep_or_cancel(delay, &shutdown).await {
                        break;
                    }
                }
            }
        }

        info!(region = %self.region.name, worker_id = %self.config.worker_id, "region worker stopped");
    }

    /// Returns `true` when the group exists again.
    async fn recreate_group(&self) -> bool {
        let cfg = &self.config;
        warn!(region = %cfg.region_name, stream = %cfg.check_stream, "consumer group missing, recreating");
        match self.broker.create_group(&cfg.check_stream, &cfg.region_name).await {
            Ok(()) => true,
            Err(e) => {
                warn!(region = %cfg.region_name, error = %e, "consumer group recreation failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::model::{Frequency, TickStatus};
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    /// Every URL answers 200 after 42 ms.
    struct Healthy;

    #[async_trait]
    impl Prober for Healthy {
        async fn probe(&self, _url: &str) -> ProbeResult {
            ProbeResult {
                outcome: ProbeOutcome::Response(200),
                elapsed_ms: 42,
            }
        }
    }

    fn config(region: &str) -> WorkerConfig {
        WorkerConfig {
            block_timeout: Duration::from_millis(20),
            ..WorkerConfig::new(region, "w-1")
        }
    }

    async fn worker(region: &str, broker: Arc<MemoryBroker>, store: &MemoryStore) -> RegionWorker {
        RegionWorker::start(
            config(region),
            broker,
            store,
            Arc::new(Healthy),
            Arc::new(PipelineStats::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn start_fails_for_unknown_region() {
        let broker = Arc::new(MemoryBroker::new());
        let store = MemoryStore::new();

        let err = RegionWorker::start(
            config("MARS"),
            broker,
            &store,
            Arc::new(Healthy),
            Arc::new(PipelineStats::new()),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, PipelineError::Store(_)));
    }

    #[tokio::test]
    async fn relevant_request_yields_one_tick_and_ack() {
        let broker = Arc::new(MemoryBroker::new());
        let store = MemoryStore::new();
        let target = store.add_target("http://a.test", Frequency::OneMinute, &["IND"]);
        let worker = worker("IND", broker.clone(), &store).await;

        let payload = serde_json::to_string(&target.check_request()).unwrap();
        broker.append(CHECK_STREAM, &payload).await.unwrap();

        let report = worker.poll_once().await.unwrap();
        assert_eq!(report.probed, 1);
        assert_eq!(report.appended, 1);
        assert_eq!(report.acked, 1);

        let ticks = broker.entries(TICK_STREAM);
        assert_eq!(ticks.len(), 1);
        let tick: Tick = serde_json::from_str(&ticks[0].payload).unwrap();
        assert_eq!(tick.status, TickStatus::Up);
        assert_eq!(tick.response_time_ms, Some(42));
        assert_eq!(tick.website_id, target.id);
        assert_eq!(tick.region_id, worker.region().id);
        assert_eq!(broker.pending_count(CHECK_STREAM, "IND").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn foreign_and_malformed_messages_are_acked_without_ticks() {
        let broker = Arc::new(MemoryBroker::new());
        let store = MemoryStore::new();
        store.add_region("USA");
        let target = store.add_target("http://a.test", Frequency::OneMinute, &["IND"]);
        let worker = worker("USA", broker.clone(), &store).await;

        let payload = serde_json::to_string(&target.check_request()).unwrap();
        broker.append(CHECK_STREAM, &payload).await.unwrap();
        broker.append(CHECK_STREAM, "{not json").await.unwrap();

        let report = worker.poll_once().await.unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.malformed, 1);
        assert_eq!(report.acked, 2);
        assert!(broker.entries(TICK_STREAM).is_empty());
        assert_eq!(broker.pending_count(CHECK_STREAM, "USA").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_tick_append_leaves_request_pending() {
        let broker = Arc::new(MemoryBroker::new());
        let store = MemoryStore::new();
        let a = store.add_target("http://a.test", Frequency::OneMinute, &["IND"]);
        let b = store.add_target("http://b.test", Frequency::OneMinute, &["IND"]);
        let worker = worker("IND", broker.clone(), &store).await;

        for target in [&a, &b] {
            let payload = serde_json::to_string(&target.check_request()).unwrap();
            broker.append(CHECK_STREAM, &payload).await.unwrap();
        }
        broker.fail_next_appends(TICK_STREAM, 1);

        let report = worker.poll_once().await.unwrap();
        assert_eq!(report.probed, 2);
        assert_eq!(report.appended, 1);
        assert_eq!(report.acked, 1);
        assert_eq!(broker.pending_for(CHECK_STREAM, "IND", "w-1").len(), 1);
    }

    #[tokio::test]
    async fn failed_append_is_retried_on_next_cycle() {
        let broker = Arc::new(MemoryBroker::new());
        let store = MemoryStore::new();
        let target = store.add_target("http://a.test", Frequency::OneMinute, &["IND"]);
        let worker = worker("IND", broker.clone(), &store).await;

        let payload = serde_json::to_string(&target.check_request()).unwrap();
        broker.append(CHECK_STREAM, &payload).await.unwrap();
        broker.fail_next_appends(TICK_STREAM, 1);

        let first = worker.poll_once().await.unwrap();
        assert_eq!(first.failed, 1);
        assert_eq!(first.acked, 0);

        let second = worker.poll_once().await.unwrap();
        assert_eq!(second.redelivered, 1);
        assert_eq!(second.appended, 1);
        assert_eq!(second.acked, 1);

        let third = worker.poll_once().await.unwrap();
        assert_eq!(third.delivered, 0);

        assert_eq!(broker.entries(TICK_STREAM).len(), 1);
        assert_eq!(broker.pending_count(CHECK_STREAM, "IND").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn run_recreates_a_vanished_group() {
        let broker = Arc::new(MemoryBroker::new());
        let store = MemoryStore::new();
        let target = store.add_target("http://a.test", Frequency::OneMinute, &["IND"]);
        let worker = worker("IND", broker.clone(), &store).await;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        broker.destroy_group(CHECK_STREAM, "IND");
        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.pending_count(CHECK_STREAM, "IND").await.is_err() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("group recreated");

        let payload = serde_json::to_string(&target.check_request()).unwrap();
        broker.append(CHECK_STREAM, &payload).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.entries(TICK_STREAM).is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("tick after recreation");

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn empty_read_is_an_empty_cycle() {
        let broker = Arc::new(MemoryBroker::new());
        let store = MemoryStore::new();
        store.add_region("IND");
        let worker = worker("IND", broker, &store).await;

        assert_eq!(worker.poll_once().await.unwrap(), CycleReport::default());
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let broker = Arc::new(MemoryBroker::new());
        let store = MemoryStore::new();
        store.add_region("IND");
        let worker = worker("IND", broker, &store).await;
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(worker.run(shutdown.clone()));
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
