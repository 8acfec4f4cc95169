//! Database-backed queue table.
//!
//! A receive leases the oldest visible row with `FOR UPDATE SKIP LOCKED`, so
//! concurrent consumers never block on (or double-take) the same message. A
//! lease that is not acked before `available_at` makes the row visible again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{instrument, warn};
use uuid::Uuid;

use audioflow_core::JobId;

use super::{Delivery, JobQueue, QueueError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS job_queue (
        message_id         BIGSERIAL PRIMARY KEY,
        job_id             UUID NOT NULL,
        attempts           INTEGER NOT NULL DEFAULT 0,
        available_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        lease_id           UUID NULL,
        dead_lettered_at   TIMESTAMPTZ NULL,
        dead_letter_reason TEXT NULL,
        created_at         TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS job_queue_ready_idx ON job_queue (available_at, message_id) WHERE dead_lettered_at IS NULL",
];

#[derive(Debug, Clone)]
pub struct PostgresQueue {
    pool: Arc<PgPool>,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl PostgresQueue {
    pub fn new(pool: PgPool, visibility_timeout: Duration) -> Self {
        Self {
            pool: Arc::new(pool),
            visibility_timeout,
            poll_interval: Duration::from_millis(250),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub async fn ensure_schema(&self) -> Result<(), QueueError> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    async fn try_lease(&self) -> Result<Option<Delivery>, QueueError> {
        let lease_id = Uuid::new_v4();
        let visibility_ms = self.visibility_timeout.as_millis() as i64;

        let row = sqlx::query(
            r#"
            UPDATE job_queue q SET
                attempts = q.attempts + 1,
                lease_id = $1,
                available_at = NOW() + ($2 * INTERVAL '1 millisecond')
            WHERE q.message_id = (
                SELECT message_id
                FROM job_queue
                WHERE dead_lettered_at IS NULL AND available_at <= NOW()
                ORDER BY available_at, message_id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING q.message_id, q.job_id, q.attempts
            "#,
        )
        .bind(lease_id)
        .bind(visibility_ms)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("lease", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let message_id: i64 = row.try_get("message_id").map_err(|e| map_sqlx_error("lease", e))?;
        let job_id: Uuid = row.try_get("job_id").map_err(|e| map_sqlx_error("lease", e))?;
        let attempts: i32 = row.try_get("attempts").map_err(|e| map_sqlx_error("lease", e))?;

        Ok(Some(Delivery {
            job_id: JobId::from_uuid(job_id),
            receipt: format!("{message_id}:{lease_id}"),
            attempt: attempts.max(1) as u32,
        }))
    }
}

fn parse_receipt(receipt: &str) -> Result<(i64, Uuid), QueueError> {
    let (id, lease) = receipt
        .split_once(':')
        .ok_or_else(|| QueueError::Malformed(format!("receipt '{receipt}'")))?;
    let id = id
        .parse::<i64>()
        .map_err(|e| QueueError::Malformed(format!("receipt id: {e}")))?;
    let lease = lease
        .parse::<Uuid>()
        .map_err(|e| QueueError::Malformed(format!("receipt lease: {e}")))?;
    Ok((id, lease))
}

#[async_trait]
impl JobQueue for PostgresQueue {
    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn enqueue(&self, job_id: JobId) -> Result<(), QueueError> {
        sqlx::query("INSERT INTO job_queue (job_id) VALUES ($1)")
            .bind(job_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("enqueue", e))?;
        Ok(())
    }

    async fn receive(&self, _consumer: &str, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(d) = self.try_lease().await? {
                return Ok(Some(d));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    #[instrument(skip(self, delivery), fields(job_id = %delivery.job_id), err)]
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let (message_id, lease_id) = parse_receipt(&delivery.receipt)?;
        let result = sqlx::query("DELETE FROM job_queue WHERE message_id = $1 AND lease_id = $2")
            .bind(message_id)
            .bind(lease_id)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ack", e))?;
        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownReceipt(delivery.receipt.clone()));
        }
        Ok(())
    }

    #[instrument(skip(self, delivery), fields(job_id = %delivery.job_id), err)]
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let (message_id, _) = parse_receipt(&delivery.receipt)?;
        sqlx::query(
            "UPDATE job_queue SET dead_lettered_at = NOW(), dead_letter_reason = $2, lease_id = NULL WHERE message_id = $1",
        )
        .bind(message_id)
        .bind(reason)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dead_letter", e))?;
        warn!(job_id = %delivery.job_id, attempts = delivery.attempt, reason, "message dead-lettered");
        Ok(())
    }
}

/// Connection-level failures are transient; anything the database rejected is not.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            QueueError::Unavailable(format!("{operation}: {err}"))
        }
        sqlx::Error::Database(db_err) => {
            QueueError::Backend(format!("database error in {operation}: {}", db_err.message()))
        }
        other => QueueError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Transient;

    #[test]
    fn receipt_round_trips_message_and_lease() {
        let lease = Uuid::new_v4();
        let (id, parsed) = parse_receipt(&format!("42:{lease}")).unwrap();
        assert_eq!(id, 42);
        assert_eq!(parsed, lease);
    }

    #[test]
    fn only_connection_failures_are_retryable() {
        let timed_out = map_sqlx_error("receive", sqlx::Error::PoolTimedOut);
        assert!(matches!(timed_out, QueueError::Unavailable(_)));
        assert!(timed_out.is_transient());

        let missing_column = map_sqlx_error("receive", sqlx::Error::ColumnNotFound("lease_id".into()));
        assert!(matches!(missing_column, QueueError::Backend(ref m) if m.contains("receive")));
        assert!(!missing_column.is_transient());
        assert!(!map_sqlx_error("ack", sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn malformed_receipt_is_rejected() {
        assert!(matches!(parse_receipt("nope"), Err(QueueError::Malformed(_))));
        assert!(matches!(parse_receipt("x:y"), Err(QueueError::Malformed(_))));
    }
}
