use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use audioflow_auth::GuestRegistry;
use audioflow_core::{DomainError, GuestId, JobId, UserId};
use audioflow_jobs::{
    Guest, Job, JobStatus, JobTransition, NewJob, Owner, TransitionError, UsageDelta, UsageLimits, UsageStats,
};

use crate::retry::Transient;

/// Job store error.
#[derive(Debug, Clone, Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("guest not found: {0}")]
    GuestNotFound(GuestId),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    /// The owner is already at one of its thresholds; nothing was written.
    #[error("{0}")]
    LimitExceeded(String),

    /// A stored row violates a data-model invariant.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Backend unreachable or overloaded; safe to retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for JobStoreError {
    fn from(e: DomainError) -> Self {
        JobStoreError::Corrupt(e.to_string())
    }
}

impl Transient for JobStoreError {
    fn is_transient(&self) -> bool {
        matches!(self, JobStoreError::Unavailable(_))
    }
}

/// First threshold the counters have reached, as a `LimitExceeded` error.
pub(crate) fn over_limit(limits: &UsageLimits, stats: &UsageStats) -> Result<(), JobStoreError> {
    match limits.check_all(stats).into_iter().find(|c| !c.within_limit) {
        Some(check) => Err(JobStoreError::LimitExceeded(check.message)),
        None => Ok(()),
    }
}

/// Admin-side listing filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub owner: Option<Owner>,
    pub skip: usize,
    pub limit: usize,
}

impl JobFilter {
    pub const MAX_LIMIT: usize = 100;

    pub fn owned_by(owner: Owner) -> Self {
        Self {
            owner: Some(owner),
            ..Default::default()
        }
    }

    /// Page size clamped to `1..=MAX_LIMIT`.
    pub fn page_size(&self) -> usize {
        self.limit.clamp(1, Self::MAX_LIMIT)
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s) && self.owner.as_ref().is_none_or(|o| &job.owner == o)
    }
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            owner: None,
            skip: 0,
            limit: 50,
        }
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }

    pub fn bump(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }
}

/// Durable job records: the single source of truth for job state.
///
/// `create` and `transition` write the job row and its usage increment in
/// one atomic unit.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Allocate an id and persist a new `pending` job (plus the upload usage increment).
    async fn create(&self, new: NewJob, now: DateTime<Utc>, retention: Duration) -> Result<Job, JobStoreError>;

    /// Like `create`, but the owner's counters are checked against `limits`
    /// in the same atomic unit as the insert.
    async fn create_within_limits(
        &self,
        new: NewJob,
        now: DateTime<Utc>,
        retention: Duration,
        limits: &UsageLimits,
    ) -> Result<Job, JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Newest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError>;

    /// Apply a guarded state change. Rejected transitions leave the row untouched.
    async fn transition(&self, job_id: JobId, transition: JobTransition) -> Result<Job, JobStoreError>;

    /// Monotonic progress write; returns whether the stored value changed.
    async fn record_progress(&self, job_id: JobId, progress: u8) -> Result<bool, JobStoreError>;

    /// Remove the row. Deleting a missing job is a no-op (`Ok(None)`).
    async fn delete(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Terminal jobs whose `expires_at` has passed, oldest first.
    async fn list_expired_terminal(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// `processing` jobs claimed before `started_before`.
    async fn list_stalled(&self, started_before: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    async fn counts(&self) -> Result<JobCounts, JobStoreError>;
}

/// Per-owner usage counters, incremented atomically.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn increment(&self, owner: &Owner, delta: &UsageDelta, now: DateTime<Utc>) -> Result<UsageStats, JobStoreError>;

    async fn usage(&self, owner: &Owner) -> Result<Option<UsageStats>, JobStoreError>;

    async fn list_usage(&self) -> Result<Vec<UsageStats>, JobStoreError>;
}

/// Guest session rows beyond what the identity resolver needs.
#[async_trait]
pub trait GuestStore: GuestRegistry {
    async fn list_guests(&self, skip: usize, limit: usize) -> Result<Vec<Guest>, JobStoreError>;

    async fn count_guests(&self, now: DateTime<Utc>) -> Result<GuestCounts, JobStoreError>;

    async fn list_expired_guests(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Guest>, JobStoreError>;

    /// Delete the guest if it is expired and owns no jobs. Returns whether a row was removed.
    async fn delete_guest_if_idle(&self, guest_id: &GuestId, now: DateTime<Utc>) -> Result<bool, JobStoreError>;

    async fn convert_guest(&self, guest_id: &GuestId, user_id: UserId) -> Result<Guest, JobStoreError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestCounts {
    pub total: u64,
    pub active: u64,
    pub converted: u64,
}

/// Everything the pipeline needs from one backend.
pub trait PipelineStore: JobStore + UsageLedger + GuestStore {}

impl<T> PipelineStore for T where T: JobStore + UsageLedger + GuestStore {}
