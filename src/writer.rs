//! Batch writer: drains the tick stream into the store in transactional
//! batches.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, MessageId, StreamMessage, TICK_STREAM};
use crate::error::{BrokerError, PipelineError, StoreError};
use crate::model::Tick;
use crate::retry::{sleep_or_cancel, Backoff};
use crate::stats::PipelineStats;
use crate::store::TargetStore;

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub tick_stream: String,
    pub group: String,
    pub consumer: String,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    /// Upper bound for one blocking read; shortened to the time left until
    /// the flush deadline.
    pub block_timeout: Duration,
    /// Insert attempts per batch before it is dropped.
    pub flush_attempts: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            tick_stream: TICK_STREAM.to_string(),
            group: "db-writer".to_string(),
            consumer: "db-writer-1".to_string(),
            batch_size: 100,
            batch_timeout: Duration::from_secs(5),
            block_timeout: Duration::from_secs(5),
            flush_attempts: 5,
            retry_base: Duration::from_millis(200),
            retry_max: Duration::from_secs(10),
        }
    }
}

/// Flush trigger: the batch is full or the deadline has passed.
pub fn should_flush(len: usize, since_last_flush: Duration, batch_size: usize, batch_timeout: Duration) -> bool {
    len >= batch_size || since_last_flush >= batch_timeout
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing buffered; only the deadline was reset.
    Empty,
    Committed { ticks: usize, acked: u64 },
    /// Every attempt failed and the batch was discarded. Its message ids
    /// remain pending in the writer group.
    Dropped { ticks: usize },
    /// Shutdown interrupted the retries. The batch stays buffered and its
    /// ids stay pending for replay by the next writer start.
    Deferred { ticks: usize },
}

pub struct BatchWriter {
    config: WriterConfig,
    broker: Arc<dyn Broker>,
    store: Arc<dyn TargetStore>,
    stats: Arc<PipelineStats>,

    // Owned by the single writer task; never shared
    buffer: Vec<Tick>,
    ids: Vec<MessageId>,
    last_flush: Instant,
    /// Last replayed id while this consumer's pending entries are being
    /// re-read after start; `None` once they are exhausted.
    replay_after: Option<MessageId>,
}

impl BatchWriter {
    /// Ensure the writer's consumer group exists on the tick stream.
    pub async fn start(
        config: WriterConfig,
        broker: Arc<dyn Broker>,
        store: Arc<dyn TargetStore>,
        stats: Arc<PipelineStats>,
    ) -> Result<Self, PipelineError> {
        broker.create_group(&config.tick_stream, &config.group).await?;
        info!(
            group = %config.group,
            consumer = %config.consumer,
            batch_size = config.batch_size,
            batch_timeout_ms = config.batch_timeout.as_millis() as u64,
            "batch writer ready"
        );

        Ok(Self {
            buffer: Vec::with_capacity(config.batch_size),
            ids: Vec::with_capacity(config.batch_size),
            last_flush: Instant::now(),
            replay_after: Some("0".to_string()),
            config,
            broker,
            store,
            stats,
        })
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn flush_due(&self) -> bool {
        should_flush(
            self.buffer.len(),
            self.last_flush.elapsed(),
            self.config.batch_size,
            self.config.batch_timeout,
        )
    }

    /// Buffer the next ticks. Right after start these are the consumer's
    /// own pending entries left by a previous run; after that, new entries,
    /// blocking at most until the flush deadline. Undecodable entries are
    /// acked and dropped. Returns how many ticks were buffered.
    pub async fn poll_once(&mut self) -> Result<usize, PipelineError> {
        let cfg = &self.config;
        let room = cfg.batch_size.saturating_sub(self.buffer.len()).max(1);

        if let Some(after) = &self.replay_after {
            let replayed = self
                .broker
                .read_pending(&cfg.tick_stream, &cfg.group, &cfg.consumer, after, room)
                .await?;
            self.replay_after = replayed.last().map(|m| m.id.clone());
            if !replayed.is_empty() {
                info!(count = replayed.len(), "replaying pending ticks");
                return self.buffer_messages(replayed).await;
            }
        }

        let until_deadline = cfg.batch_timeout.saturating_sub(self.last_flush.elapsed());
        let block = cfg.block_timeout.min(until_deadline).max(Duration::from_millis(1));
        let messages = self
            .broker
            .read_group(&cfg.tick_stream, &cfg.group, &cfg.consumer, room, block)
            .await?;

        self.buffer_messages(messages).await
    }

    async fn buffer_messages(&mut self, messages: Vec<StreamMessage>) -> Result<usize, PipelineError> {
        let cfg = &self.config;
        let mut malformed: Vec<MessageId> = Vec::new();
        let mut buffered = 0;
        for message in messages {
            match serde_json::from_str::<Tick>(&message.payload) {
                Ok(tick) => {
                    self.buffer.push(tick);
                    self.ids.push(message.id);
                    buffered += 1;
                }
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "dropping malformed tick");
                    malformed.push(message.id);
                }
            }
        }

        if !malformed.is_empty() {
            self.stats.record_cycle(0, 0, 0, malformed.len() as u64);
            let acked = self.broker.ack(&cfg.tick_stream, &cfg.group, &malformed).await?;
            self.stats.record_acked(acked);
        }

        Ok(buffered)
    }

    /// One insert attempt. On success the ids are acked and the buffer
    /// cleared; on failure nothing changes.
    pub async fn try_flush(&mut self) -> Result<FlushOutcome, StoreError> {
        if self.buffer.is_empty() {
            self.last_flush = Instant::now();
            return Ok(FlushOutcome::Empty);
        }

        self.store.batch_insert_ticks(&self.buffer).await?;

        let ticks = self.buffer.len();
        let acked = match self
            .broker
            .ack(&self.config.tick_stream, &self.config.group, &self.ids)
            .await
        {
            Ok(n) => n,
            Err(e) => {
                // Rows are committed; the ids just stay pending
                warn!(count = self.ids.len(), error = %e, "ack after flush failed");
                0
            }
        };

        self.stats.record_flush(ticks as u64);
        self.stats.record_acked(acked);
        self.buffer.clear();
        self.ids.clear();
        self.last_flush = Instant::now();

        debug!(ticks, acked, "batch flushed");
        Ok(FlushOutcome::Committed { ticks, acked })
    }

    /// Flush with bounded retries. After the last failed attempt the batch
    /// is dropped from memory and logged as data loss; its ids are left
    /// un-acked. Retry sleeps end early on shutdown.
    pub async fn flush(&mut self, shutdown: &CancellationToken) -> FlushOutcome {
        let mut backoff = Backoff::new(self.config.retry_base, self.config.retry_max);
        let attempts = self.config.flush_attempts.max(1);

        for attempt in 1..=attempts {
            match self.try_flush().await {
                Ok(outcome) => return outcome,
                Err(e) => {
                    self.stats.record_flush_failure();
                    warn!(attempt, attempts, ticks = self.buffer.len(), error = %e, "flush failed");
                }
            }
            if attempt < attempts && !sleep_or_cancel(backoff.next_delay(), shutdown).await {
                let ticks = self.buffer.len();
                warn!(ticks, attempt, "flush retries interrupted by shutdown");
                return FlushOutcome::Deferred { ticks };
            }
        }

        let ticks = self.buffer.len();
        error!(ticks, ids = ?self.ids, "data loss: dropping batch after failed flushes");
        self.stats.record_dropped(ticks as u64);
        self.buffer.clear();
        self.ids.clear();
        self.last_flush = Instant::now();
        FlushOutcome::Dropped { ticks }
    }

    /// Read and flush until `shutdown` fires, then flush what is left once.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut backoff = Backoff::default();

        while !shutdown.is_cancelled() {
            if self.flush_due() {
                self.flush(&shutdown).await;
                continue;
            }

            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = self.poll_once() => outcome,
            };

            match outcome {
                Ok(_) => backoff.reset(),
                Err(e) => {
                    if matches!(e, PipelineError::Broker(BrokerError::NoSuchGroup { .. }))
                        && self.recreate_group().await
                    {
                        continue;
                    }
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "tick read failed");
                    if !sleep_or_cancel(delay, &shutdown).await {
                        break;
                    }
                }
            }
        }

        if !self.buffer.is_empty() {
            info!(ticks = self.buffer.len(), "final flush");
            if let FlushOutcome::Deferred { ticks } = self.flush(&shutdown).await {
                warn!(ticks, consumer = %self.config.consumer, "unflushed ticks left pending for the next start");
            }
        }
        info!("batch writer stopped");
    }

    /// Recreate the writer group after it vanished from the broker (stream
    /// deleted or broker restarted without persistence). Entries appended
    /// before the recreation are not delivered again.
    async fn recreate_group(&self) -> bool {
        let cfg = &self.config;
        match self.broker.create_group(&cfg.tick_stream, &cfg.group).await {
            Ok(()) => {
                warn!(stream = %cfg.tick_stream, group = %cfg.group, "writer group was missing, recreated it");
                true
            }
            Err(e) => {
                warn!(group = %cfg.group, error = %e, "failed to recreate writer group");
                false
            }
        }
    }
}
