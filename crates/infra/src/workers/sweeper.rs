//! Expiry Sweeper: periodic reclamation of expired jobs, artifacts and guests.
//!
//! Only terminal jobs are ever deleted. Jobs stuck in `processing` past the
//! stall window are failed instead, so they become reclaimable on a later
//! pass. Every step is idempotent; a pass interrupted midway leaves the rest
//! for the next one.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use audioflow_jobs::{Job, JobTransition};

use crate::artifacts::ArtifactStore;
use crate::store::{JobStoreError, PipelineStore};

pub const MSG_STALLED: &str = "processing stalled";

/// What one sweep pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub jobs_deleted: u64,
    pub files_removed: u64,
    /// Artifact files that were already gone
    pub files_missing: u64,
    pub guests_deleted: u64,
    pub stalled_failed: u64,
    /// Per-item failures that did not abort the pass
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct ExpirySweeper {
    store: Arc<dyn PipelineStore>,
    artifacts: ArtifactStore,
    batch_size: usize,
    stall_after: Duration,
}

impl ExpirySweeper {
    pub fn new(store: Arc<dyn PipelineStore>, artifacts: ArtifactStore, stall_after: Duration) -> Self {
        Self {
            store,
            artifacts,
            batch_size: 100,
            stall_after,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Run one full pass.
    #[instrument(skip(self), fields(batch_size = self.batch_size), err)]
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, JobStoreError> {
        let mut report = SweepReport::default();

        self.fail_stalled(now, &mut report).await?;
        self.delete_expired_jobs(now, &mut report).await?;
        self.delete_idle_guests(now, &mut report).await?;

        if report != SweepReport::default() {
            info!(
                jobs_deleted = report.jobs_deleted,
                files_removed = report.files_removed,
                files_missing = report.files_missing,
                guests_deleted = report.guests_deleted,
                stalled_failed = report.stalled_failed,
                errors = report.errors.len(),
                "sweep finished"
            );
        }
        Ok(report)
    }

    async fn fail_stalled(&self, now: DateTime<Utc>, report: &mut SweepReport) -> Result<(), JobStoreError> {
        let stalled = self.store.list_stalled(now - self.stall_after, self.batch_size).await?;
        for job in stalled {
            let detail = format!(
                "no progress since {}",
                job.started_at.map(|t| t.to_rfc3339()).unwrap_or_default()
            );
            match self
                .store
                .transition(job.job_id, JobTransition::fail(MSG_STALLED, Some(detail), now))
                .await
            {
                Ok(_) => {
                    warn!(job_id = %job.job_id, "stalled job failed");
                    report.stalled_failed += 1;
                }
                // Finished or deleted since it was listed
                Err(JobStoreError::InvalidTransition(_) | JobStoreError::NotFound(_)) => {}
                Err(e) => report.errors.push(format!("fail stalled {}: {e}", job.job_id)),
            }
        }
        Ok(())
    }

    async fn delete_expired_jobs(&self, now: DateTime<Utc>, report: &mut SweepReport) -> Result<(), JobStoreError> {
        loop {
            let batch = self.store.list_expired_terminal(now, self.batch_size).await?;
            let full = batch.len() == self.batch_size;
            let mut deleted = 0;

            for job in batch {
                self.remove_artifacts(&job, report).await;
                match self.store.delete(job.job_id).await {
                    Ok(Some(_)) => {
                        debug!(job_id = %job.job_id, "expired job deleted");
                        report.jobs_deleted += 1;
                        deleted += 1;
                    }
                    Ok(None) => {}
                    Err(e) => report.errors.push(format!("delete {}: {e}", job.job_id)),
                }
            }

            if !full || deleted == 0 {
                return Ok(());
            }
        }
    }

    /// Best-effort: a missing or unremovable file never fails the pass.
    async fn remove_artifacts(&self, job: &Job, report: &mut SweepReport) {
        let paths = std::iter::once(job.input_location.as_str()).chain(job.output_location.as_deref());
        for path in paths {
            match self.artifacts.remove(path).await {
                Ok(true) => report.files_removed += 1,
                Ok(false) => report.files_missing += 1,
                Err(e) => {
                    warn!(job_id = %job.job_id, error = %e, "failed to remove artifact");
                    report.errors.push(e.to_string());
                }
            }
        }
    }

    async fn delete_idle_guests(&self, now: DateTime<Utc>, report: &mut SweepReport) -> Result<(), JobStoreError> {
        // Guests that still own jobs stay listed; they are retried on later passes.
        let guests = self.store.list_expired_guests(now, self.batch_size).await?;
        for guest in guests {
            match self.store.delete_guest_if_idle(&guest.guest_id, now).await {
                Ok(true) => report.guests_deleted += 1,
                Ok(false) => {}
                Err(e) => report.errors.push(format!("delete guest {}: {e}", guest.guest_id)),
            }
        }
        Ok(())
    }

    /// Run [`sweep_once`](Self::sweep_once) every `interval` until shut down.
    pub fn spawn(self, interval: StdDuration) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs(), "expiry sweeper started");
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once(Utc::now()).await {
                            warn!(error = %e, "sweep aborted; retrying next interval");
                        }
                    }
                }
            }
            info!("expiry sweeper stopped");
        });
        SweeperHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            warn!(error = %e, "sweeper task ended abnormally");
        }
    }
}
