use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamPendingReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, warn};

use super::{Broker, MessageId, StreamMessage};
use crate::error::BrokerError;

/// Entry field holding the JSON payload.
const PAYLOAD_FIELD: &str = "data";

/// Redis Streams broker.
///
/// `ConnectionManager` is cheaply cloneable and reconnects on failure, but
/// every clone shares one multiplexed TCP connection. A blocking
/// `XREADGROUP` occupies that connection until it returns, so each consuming
/// loop should own its own `RedisBroker`.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
}

impl RedisBroker {
    /// Open a managed connection to `url` (e.g. `redis://127.0.0.1:6379/`).
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        debug!(%url, "connected to redis");
        Ok(Self { conn })
    }
}

/// `NOGROUP` means the group (or its stream) is gone, e.g. after a Redis
/// restart without persistence.
fn group_error(e: redis::RedisError, stream: &str, group: &str) -> BrokerError {
    if e.code() == Some("NOGROUP") {
        return BrokerError::NoSuchGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };
    }
    e.into()
}

fn decode_reply(stream: &str, reply: StreamReadReply) -> Vec<StreamMessage> {
    let mut messages = Vec::new();
    for key in reply.keys {
        for entry in key.ids {
            let payload: String = match entry.get(PAYLOAD_FIELD) {
                Some(p) => p,
                None => {
                    // Hand it on empty: consumers treat it as poison and ack.
                    warn!(stream, id = %entry.id, "stream entry without payload field");
                    String::new()
                }
            };
            messages.push(StreamMessage { id: entry.id, payload });
        }
    }
    messages
}

#[async_trait]
impl Broker for RedisBroker {
    async fn append(&self, stream: &str, payload: &str) -> Result<MessageId, BrokerError> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(stream, "*", &[(PAYLOAD_FIELD, payload)]).await?;
        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> =
            conn.xgroup_create_mkstream(stream, group, "$").await;

        match created {
            Ok(()) => {
                debug!(stream, group, "consumer group created");
                Ok(())
            }
            // Group already exists
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        // BLOCK 0 means "forever" to Redis; never send it.
        let block_ms = block.as_millis().clamp(1, usize::MAX as u128) as usize;
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(max_count)
            .block(block_ms);

        let mut conn = self.conn.clone();
        // A timed-out blocking read answers nil
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[">"], &opts)
            .await
            .map_err(|e| group_error(e, stream, group))?;

        Ok(reply.map(|r| decode_reply(stream, r)).unwrap_or_default())
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        after: &str,
        max_count: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        // Any id other than `>` reads the consumer's own pending history
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(max_count.max(1));

        let mut conn = self.conn.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[after], &opts)
            .await
            .map_err(|e| group_error(e, stream, group))?;

        Ok(reply.map(|r| decode_reply(stream, r)).unwrap_or_default())
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[MessageId]) -> Result<u64, BrokerError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let acked: u64 = conn
            .xack(stream, group, ids)
            .await
            .map_err(|e| group_error(e, stream, group))?;
        Ok(acked)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, BrokerError> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingReply = conn
            .xpending(stream, group)
            .await
            .map_err(|e| group_error(e, stream, group))?;
        Ok(reply.count() as u64)
    }
}
