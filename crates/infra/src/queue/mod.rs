//! Durable hand-off of job ids from submission to the worker loop.
//!
//! Messages carry only the job id; the job store is the source of truth for
//! everything else. Delivery is at-least-once: a message stays in flight until
//! acked, and is redelivered after its visibility timeout otherwise.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, Stream};
use thiserror::Error;

use audioflow_core::JobId;

use crate::retry::Transient;

pub mod in_memory;
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use in_memory::InMemoryQueue;
pub use postgres::PostgresQueue;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsQueue;

#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// Broker unreachable; safe to retry.
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("unknown or expired receipt: {0}")]
    UnknownReceipt(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    /// The broker rejected the command; retrying will not help.
    #[error("queue backend error: {0}")]
    Backend(String),
}

impl Transient for QueueError {
    fn is_transient(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}

/// One in-flight message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job_id: JobId,
    /// Backend handle used to ack or dead-letter this delivery
    pub receipt: String,
    /// 1 on first delivery, incremented on every redelivery
    pub attempt: u32,
}

/// Capability set: durable publish, acknowledged consume, dead-letter.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job_id: JobId) -> Result<(), QueueError>;

    /// Wait up to `wait` for the next message.
    async fn receive(&self, consumer: &str, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Move the message to the dead-letter channel (and stop redelivering it).
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError>;
}

/// Lazy, effectively infinite sequence of deliveries for one consumer.
///
/// Empty polls are skipped; errors are yielded so the caller decides whether
/// to back off.
pub fn deliveries(
    queue: Arc<dyn JobQueue>,
    consumer: impl Into<String>,
    wait: Duration,
) -> impl Stream<Item = Result<Delivery, QueueError>> + Send {
    let consumer = consumer.into();
    stream::unfold((queue, consumer), move |(queue, consumer)| async move {
        loop {
            match queue.receive(&consumer, wait).await {
                Ok(Some(d)) => return Some((Ok(d), (queue, consumer))),
                Ok(None) => continue,
                Err(e) => return Some((Err(e), (queue, consumer))),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;

    #[tokio::test]
    async fn deliveries_stream_yields_enqueued_ids_in_order() {
        let queue = Arc::new(InMemoryQueue::new(Duration::from_secs(30)));
        let a = JobId::new();
        let b = JobId::new();
        queue.enqueue(a).await.unwrap();
        queue.enqueue(b).await.unwrap();

        let mut s = Box::pin(deliveries(queue.clone(), "c1", Duration::from_millis(10)));
        let first = s.next().await.unwrap().unwrap();
        let second = s.next().await.unwrap().unwrap();
        assert_eq!(first.job_id, a);
        assert_eq!(second.job_id, b);
        assert_eq!(first.attempt, 1);
    }
}
