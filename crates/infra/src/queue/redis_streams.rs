//! Redis Streams-backed job queue (durable, at-least-once delivery).
//!
//! - **Stream Key**: `audioflow:jobs`, one entry per job id (`job_id` field)
//! - **Consumer Group**: `audioflow.workers`; each worker is a named consumer
//! - **Redelivery**: pending entries idle longer than the visibility timeout
//!   are XCLAIMed by the next consumer that asks
//! - **Settling**: ack and dead-letter `XACK` and `XDEL` the entry in one
//!   MULTI/EXEC, so the stream only holds unsettled job ids
//! - **Dead-Letter Queue**: `audioflow:jobs:dlq`, capped at about
//!   `DLQ_MAXLEN` entries

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use tracing::{instrument, warn};

use audioflow_core::JobId;

use super::{Delivery, JobQueue, QueueError};

const DEFAULT_STREAM_KEY: &str = "audioflow:jobs";
const DEFAULT_DLQ_KEY: &str = "audioflow:jobs:dlq";
const DEFAULT_GROUP: &str = "audioflow.workers";

/// How many pending entries to inspect per reclaim pass
const PENDING_SCAN: usize = 16;

/// Approximate cap on the dead-letter stream
const DLQ_MAXLEN: usize = 10_000;

#[derive(Debug, Clone)]
pub struct RedisStreamsQueue {
    client: Arc<redis::Client>,
    stream_key: String,
    dlq_key: String,
    group: String,
    visibility_timeout: Duration,
}

impl RedisStreamsQueue {
    pub fn new(redis_url: impl AsRef<str>, visibility_timeout: Duration) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(map_redis_error)?;
        Ok(Self {
            client: Arc::new(client),
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            dlq_key: DEFAULT_DLQ_KEY.to_string(),
            group: DEFAULT_GROUP.to_string(),
            visibility_timeout,
        })
    }

    pub fn with_keys(mut self, stream_key: impl Into<String>, dlq_key: impl Into<String>, group: impl Into<String>) -> Self {
        self.stream_key = stream_key.into();
        self.dlq_key = dlq_key.into();
        self.group = group.into();
        self
    }

    async fn conn(&self) -> Result<MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)
    }

    /// Ensure the consumer group exists (idempotent).
    pub async fn ensure_group(&self) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(map_redis_error(e)),
        }
    }

    /// Acknowledge and remove an entry. Yields `(acked, deleted)` counts.
    fn settle_pipeline(&self, receipt: &str) -> redis::Pipeline {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(receipt)
            .cmd("XDEL")
            .arg(&self.stream_key)
            .arg(receipt);
        pipe
    }

    async fn settle(&self, conn: &mut MultiplexedConnection, receipt: &str) -> Result<u64, QueueError> {
        let (acked, _deleted): (u64, u64) = self
            .settle_pipeline(receipt)
            .query_async(conn)
            .await
            .map_err(map_redis_error)?;
        Ok(acked)
    }

    /// Take over one entry whose consumer went quiet for longer than the visibility timeout.
    async fn reclaim_stale(&self, conn: &mut MultiplexedConnection, consumer: &str) -> Result<Option<Delivery>, QueueError> {
        let min_idle_ms = self.visibility_timeout.as_millis() as usize;

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("-")
            .arg("+")
            .arg(PENDING_SCAN)
            .query_async(conn)
            .await
            .map_err(map_redis_error)?;

        for entry in pending.ids.into_iter().filter(|p| p.last_delivered_ms >= min_idle_ms) {
            let claimed: StreamClaimReply = redis::cmd("XCLAIM")
                .arg(&self.stream_key)
                .arg(&self.group)
                .arg(consumer)
                .arg(min_idle_ms)
                .arg(&entry.id)
                .query_async(conn)
                .await
                .map_err(map_redis_error)?;

            // Another consumer may have claimed it first; XCLAIM then returns nothing.
            if let Some(stream_id) = claimed.ids.into_iter().next() {
                let attempt = (entry.times_delivered + 1) as u32;
                return parse_entry(&stream_id, attempt).map(Some);
            }
        }
        Ok(None)
    }
}

fn parse_entry(entry: &StreamId, attempt: u32) -> Result<Delivery, QueueError> {
    let raw: String = entry
        .get("job_id")
        .ok_or_else(|| QueueError::Malformed(format!("entry {} has no job_id", entry.id)))?;
    let job_id = raw
        .parse::<JobId>()
        .map_err(|e| QueueError::Malformed(format!("entry {}: {e}", entry.id)))?;
    Ok(Delivery {
        job_id,
        receipt: entry.id.clone(),
        attempt,
    })
}

#[async_trait]
impl JobQueue for RedisStreamsQueue {
    #[instrument(skip(self), fields(stream_key = %self.stream_key, job_id = %job_id), err)]
    async fn enqueue(&self, job_id: JobId) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("job_id")
            .arg(job_id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn receive(&self, consumer: &str, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn().await?;

        if let Some(d) = self.reclaim_stale(&mut conn, consumer).await? {
            warn!(job_id = %d.job_id, attempt = d.attempt, "reclaimed stale pending entry");
            return Ok(Some(d));
        }

        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(wait.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let Some(entry) = reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|k| k.ids.into_iter().next())
        else {
            return Ok(None);
        };

        match parse_entry(&entry, 1) {
            Ok(d) => Ok(Some(d)),
            Err(e) => {
                // Poison entry: drop it so it is not redelivered forever.
                if let Err(settle) = self.settle(&mut conn, &entry.id).await {
                    warn!(entry_id = %entry.id, error = %settle, "could not drop malformed entry");
                }
                Err(e)
            }
        }
    }

    #[instrument(skip(self, delivery), fields(job_id = %delivery.job_id), err)]
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let acked = self.settle(&mut conn, &delivery.receipt).await?;
        if acked == 0 {
            return Err(QueueError::UnknownReceipt(delivery.receipt.clone()));
        }
        Ok(())
    }

    #[instrument(skip(self, delivery), fields(job_id = %delivery.job_id), err)]
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("XADD")
            .arg(&self.dlq_key)
            .arg("MAXLEN")
            .arg("~")
            .arg(DLQ_MAXLEN)
            .arg("*")
            .arg("job_id")
            .arg(delivery.job_id.to_string())
            .arg("original_message_id")
            .arg(&delivery.receipt)
            .arg("attempts")
            .arg(delivery.attempt)
            .arg("reason")
            .arg(reason)
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        self.settle(&mut conn, &delivery.receipt).await?;

        warn!(job_id = %delivery.job_id, attempts = delivery.attempt, reason, "message sent to dead-letter queue");
        Ok(())
    }
}

fn map_redis_error(e: redis::RedisError) -> QueueError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        QueueError::Unavailable(e.to_string())
    } else {
        QueueError::Malformed(format!("redis command failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed(pipe: &redis::Pipeline) -> String {
        String::from_utf8_lossy(&pipe.get_packed_pipeline()).into_owned()
    }

    #[test]
    fn settling_acks_and_deletes_the_entry_atomically() {
        let queue = RedisStreamsQueue::new("redis://127.0.0.1:6379", Duration::from_secs(30)).unwrap();
        let wire = packed(&queue.settle_pipeline("1700000000000-0"));

        let multi = wire.find("MULTI").expect("atomic pipeline");
        let xack = wire.find("XACK").expect("XACK in pipeline");
        let xdel = wire.find("XDEL").expect("XDEL in pipeline");
        let exec = wire.find("EXEC").expect("atomic pipeline");
        assert!(multi < xack && xack < xdel && xdel < exec);
        assert_eq!(wire.matches("1700000000000-0").count(), 2);
        assert_eq!(wire.matches(DEFAULT_STREAM_KEY).count(), 2);
    }

    #[test]
    fn settling_uses_configured_keys() {
        let queue = RedisStreamsQueue::new("redis://127.0.0.1:6379", Duration::from_secs(30))
            .unwrap()
            .with_keys("test:jobs", "test:jobs:dlq", "test.workers");
        let wire = packed(&queue.settle_pipeline("1-0"));
        assert!(wire.contains("test:jobs"));
        assert!(wire.contains("test.workers"));
        assert!(!wire.contains(DEFAULT_STREAM_KEY));
    }
}
