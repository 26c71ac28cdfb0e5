#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use echo_monitor::broker::MemoryBroker;
use echo_monitor::stats::PipelineStats;
use echo_monitor::store::MemoryStore;
use echo_monitor::worker::{ProbeOutcome, ProbeResult, Prober, WorkerConfig};
use echo_monitor::writer::WriterConfig;

/// Prober answering from a fixed table; unlisted URLs are unreachable.
#[derive(Default)]
pub struct ScriptedProber {
    answers: Mutex<HashMap<String, ProbeResult>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(self, url: &str, code: u16, elapsed_ms: i64) -> Self {
        self.answers.lock().insert(
            url.to_string(),
            ProbeResult {
                outcome: ProbeOutcome::Response(code),
                elapsed_ms,
            },
        );
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, url: &str) -> ProbeResult {
        self.calls.lock().push(url.to_string());
        self.answers.lock().get(url).copied().unwrap_or(ProbeResult {
            outcome: ProbeOutcome::Unreachable,
            elapsed_ms: 2_000,
        })
    }
}

pub struct Harness {
    pub broker: Arc<MemoryBroker>,
    pub store: Arc<MemoryStore>,
    pub stats: Arc<PipelineStats>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            broker: Arc::new(MemoryBroker::new()),
            store: Arc::new(MemoryStore::new()),
            stats: Arc::new(PipelineStats::new()),
        }
    }
}

pub fn worker_config(region: &str) -> WorkerConfig {
    WorkerConfig {
        block_timeout: Duration::from_millis(20),
        ..WorkerConfig::new(region, format!("{region}-test"))
    }
}

pub fn writer_config() -> WriterConfig {
    WriterConfig {
        batch_size: 10,
        block_timeout: Duration::from_millis(20),
        retry_base: Duration::from_millis(1),
        retry_max: Duration::from_millis(5),
        ..WriterConfig::default()
    }
}
