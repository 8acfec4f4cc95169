use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use audioflow_core::JobId;

use super::{Delivery, JobQueue, QueueError};

#[derive(Debug, Clone, Copy)]
struct Message {
    job_id: JobId,
    /// Deliveries handed out so far
    deliveries: u32,
}

#[derive(Debug)]
struct InFlight {
    message: Message,
    visible_at: Instant,
}

/// A message moved aside after repeated failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub job_id: JobId,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Message>,
    in_flight: HashMap<String, InFlight>,
    dead: Vec<DeadLetter>,
}

/// In-process queue with visibility timeouts, for tests/dev.
///
/// Unacked deliveries become visible again once their timeout passes, which
/// models a crashed consumer.
#[derive(Debug)]
pub struct InMemoryQueue {
    state: Mutex<State>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl InMemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state().dead.clone()
    }

    /// Messages waiting or in flight (not yet acked or dead-lettered).
    pub fn outstanding(&self) -> usize {
        let state = self.state();
        state.ready.len() + state.in_flight.len()
    }

    fn try_take(&self, now: Instant) -> Option<Delivery> {
        let mut state = self.state();

        let expired: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.visible_at <= now)
            .map(|(r, _)| r.clone())
            .collect();
        for receipt in expired {
            if let Some(f) = state.in_flight.remove(&receipt) {
                warn!(job_id = %f.message.job_id, "visibility timeout passed; redelivering");
                state.ready.push_front(f.message);
            }
        }

        let mut message = state.ready.pop_front()?;
        message.deliveries += 1;
        let receipt = Uuid::new_v4().to_string();
        state.in_flight.insert(
            receipt.clone(),
            InFlight {
                message,
                visible_at: now + self.visibility_timeout,
            },
        );
        Some(Delivery {
            job_id: message.job_id,
            receipt,
            attempt: message.deliveries,
        })
    }

    fn next_redelivery(&self) -> Option<Instant> {
        self.state().in_flight.values().map(|f| f.visible_at).min()
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, job_id: JobId) -> Result<(), QueueError> {
        self.state().ready.push_back(Message { job_id, deliveries: 0 });
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, _consumer: &str, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            if let Some(d) = self.try_take(Instant::now()) {
                return Ok(Some(d));
            }
            let wake_at = self.next_redelivery().map_or(deadline, |t| t.min(deadline));
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        match self.state().in_flight.remove(&delivery.receipt) {
            Some(_) => Ok(()),
            None => Err(QueueError::UnknownReceipt(delivery.receipt.clone())),
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let mut state = self.state();
        state.in_flight.remove(&delivery.receipt);
        state.dead.push(DeadLetter {
            job_id: delivery.job_id,
            attempts: delivery.attempt,
            reason: reason.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn receive_times_out_when_empty() {
        let q = InMemoryQueue::new(Duration::from_secs(30));
        let got = q.receive("c", Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn acked_message_is_not_redelivered() {
        let q = InMemoryQueue::new(Duration::from_millis(20));
        q.enqueue(JobId::new()).await.unwrap();
        let d = q.receive("c", Duration::from_millis(10)).await.unwrap().unwrap();
        q.ack(&d).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(q.receive("c", Duration::from_millis(10)).await.unwrap().is_none());
        assert_eq!(q.outstanding(), 0);
    }

    #[tokio::test]
    async fn unacked_message_is_redelivered_with_higher_attempt() {
        let q = InMemoryQueue::new(Duration::from_millis(20));
        let id = JobId::new();
        q.enqueue(id).await.unwrap();

        let first = q.receive("c1", Duration::from_millis(10)).await.unwrap().unwrap();
        let second = q.receive("c2", Duration::from_millis(200)).await.unwrap().unwrap();
        assert_eq!(first.job_id, id);
        assert_eq!(second.job_id, id);
        assert_eq!(second.attempt, 2);
        assert_ne!(first.receipt, second.receipt);

        // The stale receipt no longer acks anything.
        assert!(q.ack(&first).await.is_err());
        q.ack(&second).await.unwrap();
    }

    #[tokio::test]
    async fn dead_lettered_message_is_parked() {
        let q = InMemoryQueue::new(Duration::from_millis(20));
        let id = JobId::new();
        q.enqueue(id).await.unwrap();
        let d = q.receive("c", Duration::from_millis(10)).await.unwrap().unwrap();
        q.dead_letter(&d, "delivery attempts exhausted").await.unwrap();

        assert_eq!(q.outstanding(), 0);
        let dead = q.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job_id, id);
    }

    #[tokio::test]
    async fn waiting_receiver_is_woken_by_enqueue() {
        let q = std::sync::Arc::new(InMemoryQueue::new(Duration::from_secs(30)));
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.receive("c", Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = JobId::new();
        q.enqueue(id).await.unwrap();

        let got = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(got.job_id, id);
    }
}
