//! Read-side shapes served by the facade.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use audioflow_core::JobId;
use audioflow_jobs::{Job, JobStatus, Owner, ProcessingType};

use crate::store::{GuestCounts, JobCounts};
use crate::usage::UsageTotals;

/// What a job owner sees. Never carries operator error detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub original_filename: String,
    pub file_format: String,
    pub file_size: u64,
    pub processing_type: ProcessingType,
    pub error_message: Option<String>,
    pub download_ready: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id,
            status: job.status,
            progress: job.progress,
            original_filename: job.original_filename.clone(),
            file_format: job.file_format.clone(),
            file_size: job.file_size,
            processing_type: job.processing_type,
            error_message: job.error_message.clone(),
            download_ready: job.status == JobStatus::Completed,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            expires_at: job.expires_at,
        }
    }
}

/// Admin view: the owner view plus ownership, locations and error detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminJobView {
    #[serde(flatten)]
    pub job: JobView,
    pub owner: Owner,
    pub stored_filename: String,
    pub input_location: String,
    pub output_location: Option<String>,
    pub error_detail: Option<String>,
    pub processing_seconds: f64,
}

impl From<&Job> for AdminJobView {
    fn from(job: &Job) -> Self {
        Self {
            job: JobView::from(job),
            owner: job.owner.clone(),
            stored_filename: job.stored_filename.clone(),
            input_location: job.input_location.clone(),
            output_location: job.output_location.clone(),
            error_detail: job.error_detail.clone(),
            processing_seconds: job.processing_seconds(),
        }
    }
}

/// Result of an admin force-delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedJob {
    pub job_id: JobId,
    pub files_removed: u64,
}

/// System-wide counts for the admin dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemOverview {
    pub jobs: JobCounts,
    pub total_jobs: u64,
    pub success_rate_percent: f64,
    pub guests: GuestCounts,
    pub usage: UsageTotals,
    pub generated_at: DateTime<Utc>,
}

impl SystemOverview {
    pub fn new(jobs: JobCounts, guests: GuestCounts, usage: UsageTotals, now: DateTime<Utc>) -> Self {
        let finished = jobs.completed + jobs.failed;
        let success_rate_percent = if finished > 0 {
            ((jobs.completed as f64 / finished as f64) * 10_000.0).round() / 100.0
        } else {
            0.0
        };
        Self {
            total_jobs: jobs.total(),
            jobs,
            success_rate_percent,
            guests,
            usage,
            generated_at: now,
        }
    }
}
