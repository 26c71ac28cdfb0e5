//! Append-only log with consumer groups.
//!
//! Every consumer group on a stream sees every entry (broadcast fan-out);
//! consumers inside one group compete for undelivered entries. An entry
//! stays in the group's pending set until it is acknowledged.

pub mod memory;
pub mod redis_client;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrokerError;

pub use self::memory::MemoryBroker;
pub use self::redis_client::RedisBroker;

/// Stream that carries check requests from the scheduler to region workers.
pub const CHECK_STREAM: &str = "echo:websites";
/// Stream that carries ticks from region workers to the batch writer.
pub const TICK_STREAM: &str = "echo:ticks";

/// Broker-assigned entry id (`<millis>-<seq>`).
pub type MessageId = String;

/// One entry delivered by [`Broker::read_group`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub id: MessageId,
    pub payload: String,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Append `payload` to `stream` and return the new entry id.
    async fn append(&self, stream: &str, payload: &str) -> Result<MessageId, BrokerError>;

    /// Create `group` at the current tail of `stream`. No-op when the group
    /// already exists; creates the stream when missing.
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BrokerError>;

    /// Deliver up to `max_count` entries the group has not seen yet, marking
    /// each pending for `consumer`. Waits up to `block` when none are ready
    /// and returns an empty batch on timeout.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, BrokerError>;

    /// Re-deliver up to `max_count` entries already pending for `consumer`
    /// whose id is greater than `after` (`"0"` for all of them), oldest
    /// first. Never blocks and does not change ownership.
    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        after: &str,
        max_count: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError>;

    /// Remove `ids` from the group's pending set. Returns how many were
    /// actually pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[MessageId]) -> Result<u64, BrokerError>;

    /// Size of the group's pending set.
    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, BrokerError>;
}
