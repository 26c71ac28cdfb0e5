use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Broker, MessageId, StreamMessage};
use crate::error::BrokerError;

/// In-process broker with the same group semantics as Redis Streams.
///
/// Used by the test suite and by single-process runs without Redis.
#[derive(Default)]
pub struct MemoryBroker {
    inner: Mutex<Inner>,
    appended: Notify,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, StreamLog>,
    next_seq: u64,
    /// Remaining injected append failures per stream.
    failing_appends: HashMap<String, u32>,
}

#[derive(Default)]
struct StreamLog {
    entries: Vec<StreamMessage>,
    groups: HashMap<String, GroupCursor>,
}

struct GroupCursor {
    /// Index of the first entry this group has not been handed yet.
    next_index: usize,
    /// id → consumer that currently owns the delivery
    pending: BTreeMap<MessageId, String>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` appends to `stream` fail.
    pub fn fail_next_appends(&self, stream: &str, count: u32) {
        self.inner
            .lock()
            .failing_appends
            .insert(stream.to_string(), count);
    }

    /// Every entry ever appended to `stream`, oldest first.
    pub fn entries(&self, stream: &str) -> Vec<StreamMessage> {
        self.inner
            .lock()
            .streams
            .get(stream)
            .map(|log| log.entries.clone())
            .unwrap_or_default()
    }

    /// Pending ids of `group` owned by `consumer`.
    pub fn pending_for(&self, stream: &str, group: &str, consumer: &str) -> Vec<MessageId> {
        let inner = self.inner.lock();
        inner
            .streams
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .map(|cursor| {
                cursor
                    .pending
                    .iter()
                    .filter(|(_, owner)| owner.as_str() == consumer)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Forget `group` and its pending table, like `XGROUP DESTROY`.
    pub fn destroy_group(&self, stream: &str, group: &str) {
        if let Some(log) = self.inner.lock().streams.get_mut(stream) {
            log.groups.remove(group);
        }
    }

    fn no_such_group(stream: &str, group: &str) -> BrokerError {
        BrokerError::NoSuchGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        }
    }

    /// Hand out undelivered entries, or `None` when the group is caught up.
    fn try_deliver(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> Result<Option<Vec<StreamMessage>>, BrokerError> {
        let mut inner = self.inner.lock();
        let log = inner
            .streams
            .get_mut(stream)
            .ok_or_else(|| Self::no_such_group(stream, group))?;
        let cursor = log
            .groups
            .get_mut(group)
            .ok_or_else(|| Self::no_such_group(stream, group))?;

        let start = cursor.next_index;
        let end = (start + max_count.max(1)).min(log.entries.len());
        if end <= start {
            return Ok(None);
        }

        let batch = log.entries[start..end].to_vec();
        cursor.next_index = end;
        for message in &batch {
            cursor.pending.insert(message.id.clone(), consumer.to_string());
        }
        Ok(Some(batch))
    }
}

/// Numeric order of `<millis>-<seq>` ids; `"0"` sorts first.
fn id_key(id: &str) -> (u64, u64) {
    let (ms, seq) = id.split_once('-').unwrap_or((id, "0"));
    (ms.parse().unwrap_or(0), seq.parse().unwrap_or(0))
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn append(&self, stream: &str, payload: &str) -> Result<MessageId, BrokerError> {
        let id = {
            let mut inner = self.inner.lock();

            if let Some(left) = inner.failing_appends.get_mut(stream) {
                if *left > 0 {
                    *left -= 1;
                    return Err(BrokerError::Unavailable(format!("append to {stream}")));
                }
            }

            inner.next_seq += 1;
            let id = format!("{}-{}", chrono::Utc::now().timestamp_millis(), inner.next_seq);
            inner
                .streams
                .entry(stream.to_string())
                .or_default()
                .entries
                .push(StreamMessage {
                    id: id.clone(),
                    payload: payload.to_string(),
                });
            id
        };

        self.appended.notify_waiters();
        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock();
        let log = inner.streams.entry(stream.to_string()).or_default();
        let tail = log.entries.len();
        log.groups
            .entry(group.to_string())
            .or_insert_with(|| GroupCursor {
                next_index: tail,
                pending: BTreeMap::new(),
            });
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let deadline = Instant::now() + block;

        loop {
            // Register interest before looking so an append in between
            // still wakes us.
            let notified = self.appended.notified();

            if let Some(batch) = self.try_deliver(stream, group, consumer, max_count)? {
                return Ok(batch);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        after: &str,
        max_count: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let inner = self.inner.lock();
        let log = inner
            .streams
            .get(stream)
            .ok_or_else(|| Self::no_such_group(stream, group))?;
        let cursor = log
            .groups
            .get(group)
            .ok_or_else(|| Self::no_such_group(stream, group))?;

        let after = id_key(after);
        Ok(log
            .entries
            .iter()
            .filter(|m| id_key(&m.id) > after)
            .filter(|m| cursor.pending.get(&m.id).is_some_and(|owner| owner == consumer))
            .take(max_count.max(1))
            .cloned()
            .collect())
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[MessageId]) -> Result<u64, BrokerError> {
        let mut inner = self.inner.lock();
        let cursor = inner
            .streams
            .get_mut(stream)
            .and_then(|log| log.groups.get_mut(group))
            .ok_or_else(|| Self::no_such_group(stream, group))?;

        let acked = ids
            .iter()
            .filter(|id| cursor.pending.remove(id.as_str()).is_some())
            .count();
        Ok(acked as u64)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, BrokerError> {
        let inner = self.inner.lock();
        inner
            .streams
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .map(|cursor| cursor.pending.len() as u64)
            .ok_or_else(|| Self::no_such_group(stream, group))
    }
}
