//! Postgres-backed pipeline store.
//!
//! ## Atomicity
//!
//! `transition()` runs in one transaction:
//! 1. `SELECT ... FOR UPDATE` the job row
//! 2. apply the domain state machine in memory
//! 3. conditional `UPDATE ... WHERE status = <previous>`
//! 4. upsert the owner's `usage_stats` row with in-database increments
//!
//! so a completed job and its usage increment commit together. Counter
//! updates are `col = col + $n`, never read-modify-write in Rust.
//!
//! `create_within_limits()` seeds the owner's `usage_stats` row, locks it
//! with `FOR UPDATE` and checks the thresholds before inserting, so uploads
//! from one owner are serialized on that row.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | Database `23505` (unique violation) | `Storage` |
//! | Database `23514` (check violation) | `Corrupt` |
//! | PoolClosed / PoolTimedOut / Io | `Unavailable` |
//! | Other | `Storage` |

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};

use audioflow_auth::{GuestRegistry, RegistryError};
use audioflow_core::{GuestId, JobId, UserId};
use audioflow_jobs::{
    Guest, Job, JobStatus, JobTransition, NewJob, Owner, TransitionError, UsageDelta, UsageLimits, UsageStats,
};

use super::r#trait::{
    GuestCounts, GuestStore, JobCounts, JobFilter, JobStore, JobStoreError, UsageLedger, over_limit,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        job_id            UUID PRIMARY KEY,
        user_id           UUID NULL,
        guest_id          TEXT NULL,
        original_filename TEXT NOT NULL,
        stored_filename   TEXT NOT NULL,
        file_format       TEXT NOT NULL,
        file_size         BIGINT NOT NULL,
        processing_type   TEXT NOT NULL,
        input_location    TEXT NOT NULL,
        output_location   TEXT NULL,
        status            TEXT NOT NULL,
        progress          SMALLINT NOT NULL DEFAULT 0,
        error_message     TEXT NULL,
        error_detail      TEXT NULL,
        created_at        TIMESTAMPTZ NOT NULL,
        started_at        TIMESTAMPTZ NULL,
        completed_at      TIMESTAMPTZ NULL,
        expires_at        TIMESTAMPTZ NOT NULL,
        CONSTRAINT jobs_owner_xor CHECK ((user_id IS NULL) <> (guest_id IS NULL)),
        CONSTRAINT jobs_progress_range CHECK (progress BETWEEN 0 AND 100),
        CONSTRAINT jobs_status_valid CHECK (status IN ('pending', 'processing', 'completed', 'failed'))
    )
    "#,
    "CREATE INDEX IF NOT EXISTS jobs_status_expires_idx ON jobs (status, expires_at)",
    "CREATE INDEX IF NOT EXISTS jobs_guest_idx ON jobs (guest_id)",
    "CREATE INDEX IF NOT EXISTS jobs_user_idx ON jobs (user_id)",
    r#"
    CREATE TABLE IF NOT EXISTS guests (
        guest_id             TEXT PRIMARY KEY,
        created_at           TIMESTAMPTZ NOT NULL,
        last_active_at       TIMESTAMPTZ NOT NULL,
        expires_at           TIMESTAMPTZ NOT NULL,
        converted_to_user_id UUID NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS usage_stats (
        owner_key          TEXT PRIMARY KEY,
        user_id            UUID NULL,
        guest_id           TEXT NULL,
        files_uploaded     BIGINT NOT NULL DEFAULT 0,
        files_processed    BIGINT NOT NULL DEFAULT 0,
        files_failed       BIGINT NOT NULL DEFAULT 0,
        files_downloaded   BIGINT NOT NULL DEFAULT 0,
        input_bytes        BIGINT NOT NULL DEFAULT 0,
        output_bytes       BIGINT NOT NULL DEFAULT 0,
        processing_seconds DOUBLE PRECISION NOT NULL DEFAULT 0,
        api_calls          BIGINT NOT NULL DEFAULT 0,
        processing_types   JSONB NOT NULL DEFAULT '{}'::JSONB,
        first_upload_at    TIMESTAMPTZ NULL,
        last_upload_at     TIMESTAMPTZ NULL,
        last_download_at   TIMESTAMPTZ NULL,
        last_api_call_at   TIMESTAMPTZ NULL,
        first_activity_at  TIMESTAMPTZ NOT NULL,
        last_activity_at   TIMESTAMPTZ NOT NULL,
        CONSTRAINT usage_owner_xor CHECK ((user_id IS NULL) <> (guest_id IS NULL))
    )
    "#,
    r#"
    CREATE OR REPLACE FUNCTION audioflow_merge_counts(a JSONB, b JSONB) RETURNS JSONB
    LANGUAGE SQL IMMUTABLE AS $$
        SELECT COALESCE(
            jsonb_object_agg(k, GREATEST(COALESCE((a ->> k)::BIGINT, 0) + COALESCE((b ->> k)::BIGINT, 0), 0)),
            '{}'::JSONB)
        FROM (SELECT jsonb_object_keys(COALESCE(a, '{}'::JSONB) || COALESCE(b, '{}'::JSONB)) AS k) AS keys
    $$
    "#,
];

const JOB_COLUMNS: &str = "job_id, user_id, guest_id, original_filename, stored_filename, file_format, \
    file_size, processing_type, input_location, output_location, status, progress, error_message, \
    error_detail, created_at, started_at, completed_at, expires_at";

/// Postgres implementation of [`JobStore`], [`UsageLedger`] and [`GuestStore`].
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables, indexes and helper functions (idempotent).
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    async fn lock_job(tx: &mut Transaction<'_, Postgres>, job_id: JobId) -> Result<Job, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("lock_job", e))?
            .ok_or(JobStoreError::NotFound(job_id))?;
        job_from_row(&row)
    }

    async fn fetch_jobs(&self, sql: &str, binds: JobBinds<'_>) -> Result<Vec<Job>, JobStoreError> {
        let mut query = sqlx::query(sql);
        for b in binds.0 {
            query = match b {
                Bind::Text(s) => query.bind(s),
                Bind::Uuid(u) => query.bind(u),
                Bind::Time(t) => query.bind(t),
                Bind::Int(i) => query.bind(i),
            };
        }
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_jobs", e))?;
        rows.iter().map(job_from_row).collect()
    }
}

enum Bind<'a> {
    Text(&'a str),
    Uuid(uuid::Uuid),
    Time(DateTime<Utc>),
    Int(i64),
}

struct JobBinds<'a>(Vec<Bind<'a>>);

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, new), fields(owner = %new.owner), err)]
    async fn create(&self, new: NewJob, now: DateTime<Utc>, retention: Duration) -> Result<Job, JobStoreError> {
        let job = Job::create(JobId::new(), new, now, retention);
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("create.begin", e))?;
        insert_job(&mut tx, &job, now).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("create.commit", e))?;
        Ok(job)
    }

    #[instrument(skip(self, new, limits), fields(owner = %new.owner), err)]
    async fn create_within_limits(
        &self,
        new: NewJob,
        now: DateTime<Utc>,
        retention: Duration,
        limits: &UsageLimits,
    ) -> Result<Job, JobStoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("create.begin", e))?;
        let stats = lock_usage(&mut tx, &new.owner, now).await?;
        over_limit(limits, &stats)?;

        let job = Job::create(JobId::new(), new, now, retention);
        insert_job(&mut tx, &job, now).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("create.commit", e))?;
        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let mut clauses = Vec::new();
        let mut binds = Vec::new();
        if let Some(status) = filter.status {
            binds.push(Bind::Text(status.as_str()));
            clauses.push(format!("status = ${}", binds.len()));
        }
        match &filter.owner {
            Some(Owner::User(id)) => {
                binds.push(Bind::Uuid(*id.as_uuid()));
                clauses.push(format!("user_id = ${}", binds.len()));
            }
            Some(Owner::Guest(id)) => {
                binds.push(Bind::Text(id.as_str()));
                clauses.push(format!("guest_id = ${}", binds.len()));
            }
            None => {}
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        binds.push(Bind::Int(filter.page_size() as i64));
        let limit_idx = binds.len();
        binds.push(Bind::Int(filter.skip as i64));
        let offset_idx = binds.len();

        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs {where_sql} \
             ORDER BY created_at DESC, job_id DESC LIMIT ${limit_idx} OFFSET ${offset_idx}"
        );
        self.fetch_jobs(&sql, JobBinds(binds)).await
    }

    #[instrument(skip(self, transition), fields(job_id = %job_id, to = %transition.target()), err)]
    async fn transition(&self, job_id: JobId, transition: JobTransition) -> Result<Job, JobStoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("transition.begin", e))?;
        let mut job = Self::lock_job(&mut tx, job_id).await?;
        let outcome = job.apply(transition)?;

        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = $2,
                progress = $3,
                output_location = $4,
                error_message = $5,
                error_detail = $6,
                started_at = $7,
                completed_at = $8
            WHERE job_id = $1 AND status = $9
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(job.status.as_str())
        .bind(i16::from(job.progress))
        .bind(job.output_location.as_deref())
        .bind(job.error_message.as_deref())
        .bind(job.error_detail.as_deref())
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(outcome.from.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("transition", e))?;

        if result.rows_affected() != 1 {
            return Err(JobStoreError::InvalidTransition(TransitionError {
                job_id,
                from: outcome.from,
                to: outcome.to,
            }));
        }

        if let Some(delta) = &outcome.usage {
            let now = job.completed_at.unwrap_or_else(Utc::now);
            upsert_usage(&mut tx, &job.owner, delta, now).await?;
        }

        tx.commit().await.map_err(|e| map_sqlx_error("transition.commit", e))?;
        debug!(job_id = %job_id, from = %outcome.from, to = %outcome.to, "job transitioned");
        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn record_progress(&self, job_id: JobId, progress: u8) -> Result<bool, JobStoreError> {
        let target = i16::from(progress.min(Job::MAX_PROGRESS - 1));
        let updated = sqlx::query(
            "UPDATE jobs SET progress = $2 WHERE job_id = $1 AND status = 'processing' AND progress < $2",
        )
        .bind(job_id.as_uuid())
        .bind(target)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_progress", e))?;

        if updated.rows_affected() == 1 {
            return Ok(true);
        }

        let status: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("record_progress.status", e))?;
        match status.as_deref().map(str::parse::<JobStatus>).transpose()? {
            None => Err(JobStoreError::NotFound(job_id)),
            Some(JobStatus::Processing) => Ok(false),
            Some(other) => Err(JobStoreError::InvalidTransition(TransitionError {
                job_id,
                from: other,
                to: JobStatus::Processing,
            })),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn delete(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("DELETE FROM jobs WHERE job_id = $1 RETURNING {JOB_COLUMNS}");
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_expired_terminal(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status IN ('completed', 'failed') AND expires_at <= $1 \
             ORDER BY expires_at ASC LIMIT $2"
        );
        self.fetch_jobs(&sql, JobBinds(vec![Bind::Time(now), Bind::Int(limit as i64)]))
            .await
    }

    #[instrument(skip(self), err)]
    async fn list_stalled(&self, started_before: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status = 'processing' AND started_at < $1 \
             ORDER BY started_at ASC LIMIT $2"
        );
        self.fetch_jobs(&sql, JobBinds(vec![Bind::Time(started_before), Bind::Int(limit as i64)]))
            .await
    }

    #[instrument(skip(self), err)]
    async fn counts(&self) -> Result<JobCounts, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("counts", e))?;

        let mut counts = JobCounts::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("counts", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("counts", e))?;
            match status.parse::<JobStatus>()? {
                JobStatus::Pending => counts.pending = n as u64,
                JobStatus::Processing => counts.processing = n as u64,
                JobStatus::Completed => counts.completed = n as u64,
                JobStatus::Failed => counts.failed = n as u64,
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl UsageLedger for PostgresJobStore {
    #[instrument(skip(self, delta), fields(owner = %owner), err)]
    async fn increment(&self, owner: &Owner, delta: &UsageDelta, now: DateTime<Utc>) -> Result<UsageStats, JobStoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("increment.begin", e))?;
        let stats = upsert_usage(&mut tx, owner, delta, now).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("increment.commit", e))?;
        Ok(stats)
    }

    async fn usage(&self, owner: &Owner) -> Result<Option<UsageStats>, JobStoreError> {
        let row = sqlx::query("SELECT * FROM usage_stats WHERE owner_key = $1")
            .bind(owner.key())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("usage", e))?;
        row.as_ref().map(usage_from_row).transpose()
    }

    async fn list_usage(&self) -> Result<Vec<UsageStats>, JobStoreError> {
        let rows = sqlx::query("SELECT * FROM usage_stats ORDER BY owner_key")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_usage", e))?;
        rows.iter().map(usage_from_row).collect()
    }
}

#[async_trait]
impl GuestRegistry for PostgresJobStore {
    async fn find_guest(&self, guest_id: &GuestId) -> Result<Option<Guest>, RegistryError> {
        let row = sqlx::query("SELECT * FROM guests WHERE guest_id = $1")
            .bind(guest_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| RegistryError(map_sqlx_error("find_guest", e).to_string()))?;
        row.as_ref()
            .map(guest_from_row)
            .transpose()
            .map_err(|e| RegistryError(e.to_string()))
    }

    async fn save_guest(&self, guest: &Guest) -> Result<(), RegistryError> {
        sqlx::query(
            r#"
            INSERT INTO guests (guest_id, created_at, last_active_at, expires_at, converted_to_user_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (guest_id) DO UPDATE SET
                last_active_at = GREATEST(guests.last_active_at, EXCLUDED.last_active_at),
                expires_at = EXCLUDED.expires_at,
                converted_to_user_id = COALESCE(EXCLUDED.converted_to_user_id, guests.converted_to_user_id)
            "#,
        )
        .bind(guest.guest_id.as_str())
        .bind(guest.created_at)
        .bind(guest.last_active_at)
        .bind(guest.expires_at)
        .bind(guest.converted_to_user_id.map(|u| *u.as_uuid()))
        .execute(&*self.pool)
        .await
        .map_err(|e| RegistryError(map_sqlx_error("save_guest", e).to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl GuestStore for PostgresJobStore {
    async fn list_guests(&self, skip: usize, limit: usize) -> Result<Vec<Guest>, JobStoreError> {
        let rows = sqlx::query("SELECT * FROM guests ORDER BY created_at DESC LIMIT $1 OFFSET $2")
            .bind(limit as i64)
            .bind(skip as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_guests", e))?;
        rows.iter().map(guest_from_row).collect()
    }

    async fn count_guests(&self, now: DateTime<Utc>) -> Result<GuestCounts, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE expires_at > $1) AS active,
                COUNT(*) FILTER (WHERE converted_to_user_id IS NOT NULL) AS converted
            FROM guests
            "#,
        )
        .bind(now)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_guests", e))?;

        let get = |col: &str| -> Result<u64, JobStoreError> {
            row.try_get::<i64, _>(col)
                .map(|n| n as u64)
                .map_err(|e| map_sqlx_error("count_guests", e))
        };
        Ok(GuestCounts {
            total: get("total")?,
            active: get("active")?,
            converted: get("converted")?,
        })
    }

    async fn list_expired_guests(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Guest>, JobStoreError> {
        let rows = sqlx::query("SELECT * FROM guests WHERE expires_at <= $1 ORDER BY expires_at ASC LIMIT $2")
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_expired_guests", e))?;
        rows.iter().map(guest_from_row).collect()
    }

    #[instrument(skip(self), fields(guest_id = %guest_id), err)]
    async fn delete_guest_if_idle(&self, guest_id: &GuestId, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM guests g
            WHERE g.guest_id = $1
              AND g.expires_at <= $2
              AND NOT EXISTS (SELECT 1 FROM jobs j WHERE j.guest_id = g.guest_id)
            "#,
        )
        .bind(guest_id.as_str())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_guest_if_idle", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn convert_guest(&self, guest_id: &GuestId, user_id: UserId) -> Result<Guest, JobStoreError> {
        let row = sqlx::query("UPDATE guests SET converted_to_user_id = $2 WHERE guest_id = $1 RETURNING *")
            .bind(guest_id.as_str())
            .bind(user_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("convert_guest", e))?
            .ok_or_else(|| JobStoreError::GuestNotFound(guest_id.clone()))?;
        guest_from_row(&row)
    }
}

/// Insert a new job row plus its upload increment.
async fn insert_job(tx: &mut Transaction<'_, Postgres>, job: &Job, now: DateTime<Utc>) -> Result<(), JobStoreError> {
    let sql = format!(
        "INSERT INTO jobs ({JOB_COLUMNS}) VALUES \
         ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)"
    );
    sqlx::query(&sql)
        .bind(job.job_id.as_uuid())
        .bind(job.owner.user_id().map(|u| *u.as_uuid()))
        .bind(job.owner.guest_id().map(GuestId::as_str))
        .bind(&job.original_filename)
        .bind(&job.stored_filename)
        .bind(&job.file_format)
        .bind(to_i64(job.file_size))
        .bind(job.processing_type.as_str())
        .bind(&job.input_location)
        .bind(job.output_location.as_deref())
        .bind(job.status.as_str())
        .bind(i16::from(job.progress))
        .bind(job.error_message.as_deref())
        .bind(job.error_detail.as_deref())
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.expires_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.job_id)
            } else {
                map_sqlx_error("create", e)
            }
        })?;

    upsert_usage(tx, &job.owner, &job.upload_usage(), now).await?;
    Ok(())
}

/// Ensure the owner's usage row exists and hold its row lock until commit.
async fn lock_usage(
    tx: &mut Transaction<'_, Postgres>,
    owner: &Owner,
    now: DateTime<Utc>,
) -> Result<UsageStats, JobStoreError> {
    sqlx::query(
        "INSERT INTO usage_stats (owner_key, user_id, guest_id, first_activity_at, last_activity_at) \
         VALUES ($1, $2, $3, $4, $4) ON CONFLICT (owner_key) DO NOTHING",
    )
    .bind(owner.key())
    .bind(owner.user_id().map(|u| *u.as_uuid()))
    .bind(owner.guest_id().map(GuestId::as_str))
    .bind(now)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_usage.seed", e))?;

    let row = sqlx::query("SELECT * FROM usage_stats WHERE owner_key = $1 FOR UPDATE")
        .bind(owner.key())
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_usage", e))?;
    usage_from_row(&row)
}

/// Atomic per-owner counter upsert inside the caller's transaction.
async fn upsert_usage(
    tx: &mut Transaction<'_, Postgres>,
    owner: &Owner,
    delta: &UsageDelta,
    now: DateTime<Utc>,
) -> Result<UsageStats, JobStoreError> {
    let types = serde_json::to_value(&delta.processing_types)
        .map_err(|e| JobStoreError::Storage(format!("encode processing_types: {e}")))?;
    let activity = delta.activity_at().unwrap_or(now);

    let row = sqlx::query(
        r#"
        INSERT INTO usage_stats (
            owner_key, user_id, guest_id,
            files_uploaded, files_processed, files_failed, files_downloaded,
            input_bytes, output_bytes, processing_seconds, api_calls, processing_types,
            first_upload_at, last_upload_at, last_download_at, last_api_call_at,
            first_activity_at, last_activity_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13, $14, $15, $16, $17)
        ON CONFLICT (owner_key) DO UPDATE SET
            files_uploaded     = GREATEST(usage_stats.files_uploaded + EXCLUDED.files_uploaded, 0),
            files_processed    = GREATEST(usage_stats.files_processed + EXCLUDED.files_processed, 0),
            files_failed       = GREATEST(usage_stats.files_failed + EXCLUDED.files_failed, 0),
            files_downloaded   = GREATEST(usage_stats.files_downloaded + EXCLUDED.files_downloaded, 0),
            input_bytes        = GREATEST(usage_stats.input_bytes + EXCLUDED.input_bytes, 0),
            output_bytes       = GREATEST(usage_stats.output_bytes + EXCLUDED.output_bytes, 0),
            processing_seconds = GREATEST(usage_stats.processing_seconds + EXCLUDED.processing_seconds, 0),
            api_calls          = GREATEST(usage_stats.api_calls + EXCLUDED.api_calls, 0),
            processing_types   = audioflow_merge_counts(usage_stats.processing_types, EXCLUDED.processing_types),
            first_upload_at    = COALESCE(usage_stats.first_upload_at, EXCLUDED.first_upload_at),
            last_upload_at     = COALESCE(EXCLUDED.last_upload_at, usage_stats.last_upload_at),
            last_download_at   = COALESCE(EXCLUDED.last_download_at, usage_stats.last_download_at),
            last_api_call_at   = COALESCE(EXCLUDED.last_api_call_at, usage_stats.last_api_call_at),
            last_activity_at   = GREATEST(usage_stats.last_activity_at, EXCLUDED.last_activity_at)
        RETURNING *
        "#,
    )
    .bind(owner.key())
    .bind(owner.user_id().map(|u| *u.as_uuid()))
    .bind(owner.guest_id().map(GuestId::as_str))
    .bind(delta.files_uploaded)
    .bind(delta.files_processed)
    .bind(delta.files_failed)
    .bind(delta.files_downloaded)
    .bind(delta.input_bytes)
    .bind(delta.output_bytes)
    .bind(delta.processing_seconds)
    .bind(delta.api_calls)
    .bind(types)
    .bind(delta.upload_at)
    .bind(delta.download_at)
    .bind(delta.api_call_at)
    .bind(now)
    .bind(activity)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("upsert_usage", e))?;

    usage_from_row(&row)
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let get_err = |e| map_sqlx_error("job_from_row", e);

    let user_id: Option<uuid::Uuid> = row.try_get("user_id").map_err(get_err)?;
    let guest_id: Option<String> = row.try_get("guest_id").map_err(get_err)?;
    let guest_id = guest_id.map(GuestId::parse).transpose()?;
    let owner = Owner::from_columns(user_id.map(UserId::from_uuid), guest_id)?;

    let status: String = row.try_get("status").map_err(get_err)?;
    let processing_type: String = row.try_get("processing_type").map_err(get_err)?;
    let file_size: i64 = row.try_get("file_size").map_err(get_err)?;
    let progress: i16 = row.try_get("progress").map_err(get_err)?;

    let job = Job {
        job_id: JobId::from_uuid(row.try_get("job_id").map_err(get_err)?),
        owner,
        original_filename: row.try_get("original_filename").map_err(get_err)?,
        stored_filename: row.try_get("stored_filename").map_err(get_err)?,
        file_format: row.try_get("file_format").map_err(get_err)?,
        file_size: file_size.max(0) as u64,
        processing_type: processing_type.parse()?,
        input_location: row.try_get("input_location").map_err(get_err)?,
        output_location: row.try_get("output_location").map_err(get_err)?,
        status: status.parse()?,
        progress: u8::try_from(progress)
            .map_err(|_| JobStoreError::Corrupt(format!("progress out of range: {progress}")))?,
        error_message: row.try_get("error_message").map_err(get_err)?,
        error_detail: row.try_get("error_detail").map_err(get_err)?,
        created_at: row.try_get("created_at").map_err(get_err)?,
        started_at: row.try_get("started_at").map_err(get_err)?,
        completed_at: row.try_get("completed_at").map_err(get_err)?,
        expires_at: row.try_get("expires_at").map_err(get_err)?,
    };
    job.check_invariants()?;
    Ok(job)
}

fn usage_from_row(row: &PgRow) -> Result<UsageStats, JobStoreError> {
    let get_err = |e| map_sqlx_error("usage_from_row", e);
    let counter = |col: &str| -> Result<u64, JobStoreError> {
        row.try_get::<i64, _>(col)
            .map(|n| n.max(0) as u64)
            .map_err(|e| map_sqlx_error("usage_from_row", e))
    };

    let user_id: Option<uuid::Uuid> = row.try_get("user_id").map_err(get_err)?;
    let guest_id: Option<String> = row.try_get("guest_id").map_err(get_err)?;
    let owner = Owner::from_columns(
        user_id.map(UserId::from_uuid),
        guest_id.map(GuestId::parse).transpose()?,
    )?;

    let types: serde_json::Value = row.try_get("processing_types").map_err(get_err)?;
    let processing_types: BTreeMap<String, u64> = serde_json::from_value(types)
        .map_err(|e| JobStoreError::Corrupt(format!("processing_types: {e}")))?;
    let processing_seconds: f64 = row.try_get("processing_seconds").map_err(get_err)?;

    Ok(UsageStats {
        owner,
        files_uploaded: counter("files_uploaded")?,
        files_processed: counter("files_processed")?,
        files_failed: counter("files_failed")?,
        files_downloaded: counter("files_downloaded")?,
        input_bytes: counter("input_bytes")?,
        output_bytes: counter("output_bytes")?,
        processing_seconds: processing_seconds.max(0.0),
        processing_types,
        api_calls: counter("api_calls")?,
        first_upload_at: row.try_get("first_upload_at").map_err(get_err)?,
        last_upload_at: row.try_get("last_upload_at").map_err(get_err)?,
        last_download_at: row.try_get("last_download_at").map_err(get_err)?,
        last_api_call_at: row.try_get("last_api_call_at").map_err(get_err)?,
        first_activity_at: row.try_get("first_activity_at").map_err(get_err)?,
        last_activity_at: row.try_get("last_activity_at").map_err(get_err)?,
    })
}

fn guest_from_row(row: &PgRow) -> Result<Guest, JobStoreError> {
    let get_err = |e| map_sqlx_error("guest_from_row", e);
    let guest_id: String = row.try_get("guest_id").map_err(get_err)?;
    let converted: Option<uuid::Uuid> = row.try_get("converted_to_user_id").map_err(get_err)?;
    Ok(Guest {
        guest_id: GuestId::parse(guest_id)?,
        created_at: row.try_get("created_at").map_err(get_err)?,
        last_active_at: row.try_get("last_active_at").map_err(get_err)?,
        expires_at: row.try_get("expires_at").map_err(get_err)?,
        converted_to_user_id: converted.map(UserId::from_uuid),
    })
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Map SQLx errors to `JobStoreError`.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => JobStoreError::Corrupt(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            JobStoreError::Unavailable(format!("{operation}: {err}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}
