//! Status/Query Facade plus the submission path.
//!
//! `PipelineService` is what the HTTP layer talks to: uploads, owner-scoped
//! reads and downloads, usage, and the admin surface. It never blocks on
//! worker activity.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use audioflow_auth::{Principal, authorize_owner, require_admin};
use audioflow_core::{GuestId, JobId};
use audioflow_jobs::{
    Guest, Job, JobStatus, JobTransition, LimitCheck, NewJob, Owner, ProcessingType, UsageDelta, UsageReport,
};

use crate::artifacts::{ArtifactStore, content_type_for, download_filename, extension_of};
use crate::queue::JobQueue;
use crate::retry::RetryPolicy;
use crate::store::{JobFilter, JobStoreError, PipelineStore};
use crate::usage::UsageAggregator;
use crate::workers::{ExpirySweeper, SweepReport};

pub mod error;
pub mod views;

pub use error::PipelineError;
pub use views::{AdminJobView, DeletedJob, JobView, SystemOverview};

pub const MSG_ENQUEUE_FAILED: &str = "failed to queue processing task";

/// Submission rules.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadPolicy {
    pub max_upload_bytes: u64,
    /// Lower-case extensions without the dot
    pub allowed_formats: Vec<String>,
    /// How long a job (and its files) are kept after creation
    pub retention: Duration,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_upload_bytes: 100 * 1024 * 1024,
            allowed_formats: ["wav", "mp3", "flac", "m4a", "ogg"].map(String::from).to_vec(),
            retention: Duration::hours(24),
        }
    }
}

/// One upload as received by the submission layer.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub processing_type: String,
    pub bytes: Vec<u8>,
}

/// An open, ready-to-stream processed artifact.
#[derive(Debug)]
pub struct Download {
    pub job_id: JobId,
    pub file: tokio::fs::File,
    pub filename: String,
    pub content_type: String,
    pub size: u64,
}

#[derive(Clone)]
pub struct PipelineService {
    store: Arc<dyn PipelineStore>,
    queue: Arc<dyn JobQueue>,
    artifacts: ArtifactStore,
    usage: UsageAggregator,
    sweeper: ExpirySweeper,
    policy: UploadPolicy,
    retry: RetryPolicy,
}

impl PipelineService {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        queue: Arc<dyn JobQueue>,
        artifacts: ArtifactStore,
        usage: UsageAggregator,
        sweeper: ExpirySweeper,
        policy: UploadPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            artifacts,
            usage,
            sweeper,
            policy,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn usage_aggregator(&self) -> &UsageAggregator {
        &self.usage
    }

    // ─── Submission ─────────────────────────────────────────────────────────

    /// Validate, store, record and enqueue one upload.
    #[instrument(skip(self, principal, upload), fields(owner = %principal.owner(), filename = %upload.filename), err)]
    pub async fn upload(&self, principal: &Principal, upload: Upload) -> Result<JobView, PipelineError> {
        let now = Utc::now();
        let processing_type: ProcessingType = upload
            .processing_type
            .parse()
            .map_err(|_| PipelineError::Validation(format!("unsupported processing type '{}'", upload.processing_type)))?;

        let original_filename = sanitize_filename(&upload.filename)?;
        let ext = extension_of(&original_filename)
            .ok_or_else(|| PipelineError::Validation("file has no extension".into()))?;
        let file_format = ext.trim_start_matches('.').to_string();
        if !self.policy.allowed_formats.iter().any(|f| f == &file_format) {
            return Err(PipelineError::Validation(format!(
                "unsupported file format '{ext}'; allowed: {}",
                self.policy.allowed_formats.join(", ")
            )));
        }

        let size = upload.bytes.len() as u64;
        if size == 0 {
            return Err(PipelineError::Validation("file is empty".into()));
        }
        if size > self.policy.max_upload_bytes {
            return Err(PipelineError::Validation(format!(
                "file too large; maximum is {}MB",
                self.policy.max_upload_bytes / (1024 * 1024)
            )));
        }

        // Fast rejection before the file is written; the store re-checks atomically.
        if let Some(over) = self
            .usage
            .check_limits(principal, now)
            .await?
            .into_iter()
            .find(|c| !c.within_limit)
        {
            return Err(PipelineError::LimitExceeded(over.message));
        }

        let stored_filename = format!("{}{ext}", Uuid::new_v4());
        let input = self.artifacts.save_input(&stored_filename, &upload.bytes).await?;

        let new = NewJob {
            owner: principal.owner(),
            original_filename,
            stored_filename,
            file_format,
            file_size: size,
            processing_type,
            input_location: input.to_string_lossy().into_owned(),
        };
        let store = &self.store;
        let retention = self.policy.retention;
        let limits = &self.usage.limits_for(principal);
        let created = self
            .retry
            .run("create_job", move || store.create_within_limits(new.clone(), now, retention, limits))
            .await;
        let job = match created {
            Ok(job) => job,
            Err(e) => {
                if let Err(rm) = self.artifacts.remove(&input).await {
                    warn!(path = %input.display(), error = %rm, "failed to remove orphaned upload");
                }
                return Err(e.into());
            }
        };

        let queue = &self.queue;
        let job_id = job.job_id;
        if let Err(e) = self.retry.run("enqueue", move || queue.enqueue(job_id)).await {
            error!(job_id = %job_id, error = %e, "enqueue failed after retries");
            let fail = JobTransition::fail(MSG_ENQUEUE_FAILED, Some(e.to_string()), Utc::now());
            if let Err(te) = self.store.transition(job_id, fail).await {
                error!(job_id = %job_id, error = %te, "could not mark unqueued job failed");
            }
            return Err(e.into());
        }

        info!(job_id = %job_id, processing_type = %processing_type, bytes = size, "job submitted");
        Ok(JobView::from(&job))
    }

    // ─── Owner-scoped reads ─────────────────────────────────────────────────

    async fn owned_job(&self, principal: &Principal, job_id: JobId) -> Result<Job, PipelineError> {
        let job = self.store.get(job_id).await?.ok_or(PipelineError::NotFound(job_id))?;
        authorize_owner(principal, &job.owner)?;
        Ok(job)
    }

    /// Counters outside a job transition are best-effort.
    async fn count(&self, owner: &Owner, delta: UsageDelta, now: DateTime<Utc>) {
        if let Err(e) = self.usage.increment(owner, &delta, now).await {
            warn!(owner = %owner, error = %e, "usage increment dropped");
        }
    }

    pub async fn get_status(&self, principal: &Principal, job_id: JobId) -> Result<JobView, PipelineError> {
        let job = self.owned_job(principal, job_id).await?;
        let now = Utc::now();
        self.count(&job.owner, UsageDelta::api_call(now), now).await;
        Ok(JobView::from(&job))
    }

    /// The caller's own jobs, newest first.
    pub async fn list_own_jobs(&self, principal: &Principal, skip: usize, limit: usize) -> Result<Vec<JobView>, PipelineError> {
        let filter = JobFilter {
            skip,
            limit,
            ..JobFilter::owned_by(principal.owner())
        };
        Ok(self.store.list(&filter).await?.iter().map(JobView::from).collect())
    }

    pub async fn download(&self, principal: &Principal, job_id: JobId) -> Result<Download, PipelineError> {
        let job = self.owned_job(principal, job_id).await?;
        if job.status != JobStatus::Completed {
            return Err(PipelineError::NotReady {
                job_id,
                status: job.status.to_string(),
            });
        }
        let output = job.output_location.as_deref().ok_or(PipelineError::NotFound(job_id))?;
        let size = self.artifacts.size(output).await.map_err(|e| {
            warn!(job_id = %job_id, error = %e, "completed job has no output file");
            PipelineError::NotFound(job_id)
        })?;
        let file = self.artifacts.open(output).await.map_err(|_| PipelineError::NotFound(job_id))?;

        let filename = download_filename(&job.original_filename);
        let content_type = content_type_for(&filename);
        let now = Utc::now();
        self.count(&job.owner, UsageDelta::download(now), now).await;

        Ok(Download {
            job_id,
            file,
            filename,
            content_type,
            size,
        })
    }

    pub async fn usage(&self, principal: &Principal) -> Result<UsageReport, PipelineError> {
        Ok(self.usage.report(&principal.owner(), Utc::now()).await?)
    }

    pub async fn check_limits(&self, principal: &Principal) -> Result<Vec<LimitCheck>, PipelineError> {
        Ok(self.usage.check_limits(principal, Utc::now()).await?)
    }

    /// Record that an authenticated user took over a guest session.
    pub async fn claim_guest(&self, principal: &Principal, guest_id: &GuestId) -> Result<Guest, PipelineError> {
        let Principal::AuthenticatedUser { id, .. } = principal else {
            return Err(PipelineError::Unauthenticated);
        };
        match self.store.convert_guest(guest_id, *id).await {
            Ok(guest) => {
                info!(guest_id = %guest_id, user_id = %id, "guest converted");
                Ok(guest)
            }
            Err(JobStoreError::GuestNotFound(g)) => {
                Err(PipelineError::Validation(format!("unknown guest '{g}'")))
            }
            Err(e) => Err(e.into()),
        }
    }

    // ─── Admin surface ──────────────────────────────────────────────────────

    pub async fn admin_list_jobs(&self, principal: &Principal, filter: &JobFilter) -> Result<Vec<AdminJobView>, PipelineError> {
        require_admin(principal)?;
        Ok(self.store.list(filter).await?.iter().map(AdminJobView::from).collect())
    }

    pub async fn admin_get_job(&self, principal: &Principal, job_id: JobId) -> Result<AdminJobView, PipelineError> {
        require_admin(principal)?;
        let job = self.store.get(job_id).await?.ok_or(PipelineError::NotFound(job_id))?;
        Ok(AdminJobView::from(&job))
    }

    /// Remove the row and its artifacts regardless of status.
    ///
    /// An in-flight processor is not stopped; its final write becomes a no-op.
    #[instrument(skip(self, principal), err)]
    pub async fn admin_delete_job(&self, principal: &Principal, job_id: JobId) -> Result<DeletedJob, PipelineError> {
        require_admin(principal)?;
        let job = self.store.delete(job_id).await?.ok_or(PipelineError::NotFound(job_id))?;

        let mut files_removed = 0;
        let paths = std::iter::once(job.input_location.as_str()).chain(job.output_location.as_deref());
        for path in paths {
            match self.artifacts.remove(Path::new(path)).await {
                Ok(true) => files_removed += 1,
                Ok(false) => {}
                Err(e) => warn!(job_id = %job_id, error = %e, "artifact left behind after delete"),
            }
        }
        info!(job_id = %job_id, status = %job.status, files_removed, "job force-deleted");
        Ok(DeletedJob { job_id, files_removed })
    }

    pub async fn admin_sweep_now(&self, principal: &Principal) -> Result<SweepReport, PipelineError> {
        require_admin(principal)?;
        Ok(self.sweeper.sweep_once(Utc::now()).await?)
    }

    pub async fn admin_overview(&self, principal: &Principal) -> Result<SystemOverview, PipelineError> {
        require_admin(principal)?;
        let now = Utc::now();
        let jobs = self.store.counts().await?;
        let guests = self.store.count_guests(now).await?;
        let usage = self.usage.totals().await?;
        Ok(SystemOverview::new(jobs, guests, usage, now))
    }

    pub async fn admin_usage_for(&self, principal: &Principal, owner: &Owner) -> Result<UsageReport, PipelineError> {
        require_admin(principal)?;
        Ok(self.usage.report(owner, Utc::now()).await?)
    }

    pub async fn admin_list_guests(&self, principal: &Principal, skip: usize, limit: usize) -> Result<Vec<Guest>, PipelineError> {
        require_admin(principal)?;
        let limit = limit.clamp(1, JobFilter::MAX_LIMIT);
        Ok(self.store.list_guests(skip, limit).await?)
    }
}

/// Keep only the final path component of a client-supplied name.
fn sanitize_filename(raw: &str) -> Result<String, PipelineError> {
    let name = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if name.is_empty() || name == "." || name == ".." {
        debug!(raw, "rejected filename");
        return Err(PipelineError::Validation("missing filename".into()));
    }
    Ok(name.to_string())
}
