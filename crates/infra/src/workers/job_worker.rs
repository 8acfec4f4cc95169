//! Worker Loop: pulls job ids from the queue and drives each job to a terminal state.
//!
//! ## Per-delivery steps
//!
//! - Load the job; missing or terminal jobs are acked and skipped
//! - Deliveries past `max_deliveries` fail the job and go to the dead-letter channel
//! - Claim `pending → processing` through the store's state-machine guard; a
//!   lost race is acked and skipped
//! - Run the registered processor under a wall-clock timeout, writing progress
//! - Record `completed` or `failed` (with its usage increment) and only then ack
//!
//! Transient store/queue errors are retried with backoff. If they persist the
//! delivery is left unacked so the queue redelivers it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use audioflow_core::JobId;
use audioflow_jobs::{Job, JobTransition};

use crate::artifacts::ArtifactStore;
use crate::processors::{ProcessorError, ProcessorRegistry, ProgressReporter};
use crate::queue::{self, Delivery, JobQueue, QueueError};
use crate::retry::{RetryPolicy, Transient};
use crate::store::{JobStoreError, PipelineStore};

pub const MSG_INPUT_MISSING: &str = "input file missing";
pub const MSG_UNSUPPORTED: &str = "processing type not supported";
pub const MSG_FAILED: &str = "processing failed";
pub const MSG_STORAGE: &str = "storage error during processing";
pub const MSG_TIMED_OUT: &str = "processing timed out";
pub const MSG_EXHAUSTED: &str = "delivery attempts exhausted";

/// Progress milestones written by the worker itself.
const PROGRESS_CLAIMED: u8 = 5;
const PROGRESS_STARTED: u8 = 20;
const PROGRESS_FINISHING: u8 = 90;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Consumer name prefix, used for logging and broker consumer ids
    pub name: String,
    /// Wall-clock bound around one processor run
    pub processing_timeout: Duration,
    /// Deliveries allowed before a message is dead-lettered
    pub max_deliveries: u32,
    /// How long one receive call blocks
    pub receive_wait: Duration,
    /// Backoff for transient store/queue failures
    pub retry: RetryPolicy,
    /// Pause after a failed receive
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "audioflow-worker".to_string(),
            processing_timeout: Duration::from_secs(3300),
            max_deliveries: 5,
            receive_wait: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn with_max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = max;
        self
    }

    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Why a delivery was acked without running the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The job row no longer exists
    Missing,
    /// Redelivery of a job that already finished
    AlreadyTerminal,
    /// Another worker won the claim
    AlreadyClaimed,
    /// The job was deleted or failed elsewhere while it was processing
    Superseded,
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum DeliveryOutcome {
    Completed { job_id: JobId },
    Failed { job_id: JobId, message: String },
    Skipped { job_id: JobId, reason: SkipReason },
    DeadLettered { job_id: JobId },
}

/// Runtime statistics, shared by every task in a pool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub deliveries: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub dead_lettered: u64,
    /// Deliveries left unacked because of infrastructure errors
    pub errors: u64,
    pub in_flight: usize,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn record(&mut self, result: &Result<DeliveryOutcome, WorkerError>) {
        self.deliveries += 1;
        match result {
            Ok(DeliveryOutcome::Completed { .. }) => self.completed += 1,
            Ok(DeliveryOutcome::Failed { .. }) => self.failed += 1,
            Ok(DeliveryOutcome::Skipped { .. }) => self.skipped += 1,
            Ok(DeliveryOutcome::DeadLettered { .. }) => self.dead_lettered += 1,
            Err(_) => self.errors += 1,
        }
    }
}

/// Executes deliveries against the store, queue, artifacts and processors it
/// was constructed with.
pub struct JobWorker {
    store: Arc<dyn PipelineStore>,
    queue: Arc<dyn JobQueue>,
    artifacts: ArtifactStore,
    processors: ProcessorRegistry,
    config: WorkerConfig,
}

impl JobWorker {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        queue: Arc<dyn JobQueue>,
        artifacts: ArtifactStore,
        processors: ProcessorRegistry,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            artifacts,
            processors,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Handle one delivery end to end, acking it once the job is settled.
    ///
    /// An `Err` means the delivery was NOT acked and will be redelivered.
    pub async fn handle(&self, delivery: &Delivery) -> Result<DeliveryOutcome, WorkerError> {
        let job_id = delivery.job_id;

        let Some(job) = self.load(job_id).await? else {
            debug!(worker = %self.config.name, job_id = %job_id, "job no longer exists; dropping message");
            return self.settle(delivery, DeliveryOutcome::Skipped { job_id, reason: SkipReason::Missing }).await;
        };

        if job.is_terminal() {
            debug!(worker = %self.config.name, job_id = %job_id, status = %job.status, "redelivery of finished job");
            return self
                .settle(delivery, DeliveryOutcome::Skipped { job_id, reason: SkipReason::AlreadyTerminal })
                .await;
        }

        if delivery.attempt > self.config.max_deliveries {
            return self.dead_letter(delivery, job).await;
        }

        let input = PathBuf::from(&job.input_location);
        if !self.artifacts.exists(&input).await {
            let detail = format!("input not found at {}", input.display());
            return self.fail_and_settle(delivery, job_id, MSG_INPUT_MISSING, Some(detail)).await;
        }

        let Some(processor) = self.processors.get(job.processing_type) else {
            let detail = format!("no processor registered for {}", job.processing_type);
            return self.fail_and_settle(delivery, job_id, MSG_UNSUPPORTED, Some(detail)).await;
        };

        let job = match self.transition(job_id, JobTransition::Claim { at: Utc::now() }).await {
            Ok(job) => job,
            Err(JobStoreError::InvalidTransition(e)) => {
                debug!(worker = %self.config.name, job_id = %job_id, error = %e, "claim lost to another worker");
                return self
                    .settle(delivery, DeliveryOutcome::Skipped { job_id, reason: SkipReason::AlreadyClaimed })
                    .await;
            }
            Err(JobStoreError::NotFound(_)) => {
                return self
                    .settle(delivery, DeliveryOutcome::Skipped { job_id, reason: SkipReason::Missing })
                    .await;
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            worker = %self.config.name,
            job_id = %job_id,
            processing_type = %job.processing_type,
            attempt = delivery.attempt,
            "job claimed"
        );

        let reporter = ProgressReporter::new(job_id, self.store.clone());
        reporter.report(PROGRESS_CLAIMED).await;

        let output = self.artifacts.output_path(&job.stored_filename);
        reporter.report(PROGRESS_STARTED).await;

        let started = Instant::now();
        let mut run: JoinHandle<Result<(), ProcessorError>> = {
            let processor = processor.clone();
            let input = input.clone();
            let output = output.clone();
            let reporter = reporter.clone();
            tokio::spawn(async move { processor.process(&input, &output, &reporter).await })
        };

        let failure = match tokio::time::timeout(self.config.processing_timeout, &mut run).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => {
                let message = match e {
                    ProcessorError::Io(_) => MSG_STORAGE,
                    _ => MSG_FAILED,
                };
                Some((message, e.to_string()))
            }
            Ok(Err(join_err)) => Some((MSG_FAILED, format!("processor task aborted: {join_err}"))),
            Err(_) => {
                run.abort();
                Some((
                    MSG_TIMED_OUT,
                    format!("processor exceeded {}s", self.config.processing_timeout.as_secs()),
                ))
            }
        };

        if let Some((message, detail)) = failure {
            error!(
                worker = %self.config.name,
                job_id = %job_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                detail = %detail,
                "{message}"
            );
            self.discard_output(&output).await;
            return self.fail_and_settle(delivery, job_id, message, Some(detail)).await;
        }

        reporter.report(PROGRESS_FINISHING).await;

        let output_bytes = match self.artifacts.size(&output).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(worker = %self.config.name, job_id = %job_id, error = %e, "processor produced no output");
                return self.fail_and_settle(delivery, job_id, MSG_STORAGE, Some(e.to_string())).await;
            }
        };

        let complete = JobTransition::Complete {
            output_location: output.to_string_lossy().into_owned(),
            output_bytes,
            at: Utc::now(),
        };
        match self.transition(job_id, complete).await {
            Ok(job) => {
                info!(
                    worker = %self.config.name,
                    job_id = %job_id,
                    output_bytes,
                    processing_seconds = job.processing_seconds(),
                    "job completed"
                );
                self.settle(delivery, DeliveryOutcome::Completed { job_id }).await
            }
            Err(JobStoreError::NotFound(_) | JobStoreError::InvalidTransition(_)) => {
                warn!(worker = %self.config.name, job_id = %job_id, "job deleted or failed while processing; discarding output");
                self.discard_output(&output).await;
                self.settle(delivery, DeliveryOutcome::Skipped { job_id, reason: SkipReason::Superseded })
                    .await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn load(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let store = &self.store;
        self.config.retry.run("load_job", move || store.get(job_id)).await
    }

    async fn transition(&self, job_id: JobId, transition: JobTransition) -> Result<Job, JobStoreError> {
        let store = &self.store;
        self.config
            .retry
            .run("transition", move || store.transition(job_id, transition.clone()))
            .await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let queue = &self.queue;
        match self.config.retry.run("ack", move || queue.ack(delivery)).await {
            Err(QueueError::UnknownReceipt(receipt)) => {
                // Lease expired; the redelivery will find the job settled.
                warn!(worker = %self.config.name, job_id = %delivery.job_id, receipt, "ack after lease expiry");
                Ok(())
            }
            other => other,
        }
    }

    async fn settle(&self, delivery: &Delivery, outcome: DeliveryOutcome) -> Result<DeliveryOutcome, WorkerError> {
        self.ack(delivery).await?;
        Ok(outcome)
    }

    /// Fail the job (pending or processing) and ack.
    async fn fail_and_settle(
        &self,
        delivery: &Delivery,
        job_id: JobId,
        message: &str,
        detail: Option<String>,
    ) -> Result<DeliveryOutcome, WorkerError> {
        match self
            .transition(job_id, JobTransition::fail(message, detail, Utc::now()))
            .await
        {
            Ok(_) => {
                self.settle(
                    delivery,
                    DeliveryOutcome::Failed {
                        job_id,
                        message: message.to_string(),
                    },
                )
                .await
            }
            Err(JobStoreError::NotFound(_) | JobStoreError::InvalidTransition(_)) => {
                debug!(worker = %self.config.name, job_id = %job_id, "job settled elsewhere before failure was recorded");
                self.settle(delivery, DeliveryOutcome::Skipped { job_id, reason: SkipReason::Superseded })
                    .await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, job: Job) -> Result<DeliveryOutcome, WorkerError> {
        let job_id = job.job_id;
        let detail = format!(
            "message delivered {} times (max {})",
            delivery.attempt, self.config.max_deliveries
        );
        match self
            .transition(job_id, JobTransition::fail(MSG_EXHAUSTED, Some(detail), Utc::now()))
            .await
        {
            Ok(_) | Err(JobStoreError::NotFound(_) | JobStoreError::InvalidTransition(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let queue = &self.queue;
        self.config
            .retry
            .run("dead_letter", move || queue.dead_letter(delivery, MSG_EXHAUSTED))
            .await?;
        warn!(worker = %self.config.name, job_id = %job_id, attempts = delivery.attempt, "job dead-lettered");
        Ok(DeliveryOutcome::DeadLettered { job_id })
    }

    async fn discard_output(&self, output: &Path) {
        if !self.artifacts.exists(output).await {
            return;
        }
        if let Err(e) = self.artifacts.remove(output).await {
            warn!(worker = %self.config.name, path = %output.display(), error = %e, "failed to remove orphaned output");
        }
    }
}

/// Handle to control a running worker pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Request graceful shutdown and wait for in-flight deliveries to settle.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "worker task ended abnormally");
            }
        }
    }

    pub fn stats(&self) -> WorkerStats {
        let mut stats = lock(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

fn lock(stats: &Mutex<WorkerStats>) -> MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

/// N concurrent consumers sharing one [`JobWorker`].
pub struct WorkerPool;

impl WorkerPool {
    pub fn spawn(worker: JobWorker, concurrency: usize) -> WorkerPoolHandle {
        let worker = Arc::new(worker);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let tasks = (0..concurrency.max(1))
            .map(|i| {
                let consumer = format!("{}-{i}", worker.config.name);
                tokio::spawn(consume(worker.clone(), consumer, shutdown_rx.clone(), stats.clone()))
            })
            .collect();

        info!(worker = %worker.config.name, concurrency = concurrency.max(1), "worker pool started");
        WorkerPoolHandle {
            shutdown: shutdown_tx,
            tasks,
            stats,
            started: Instant::now(),
        }
    }
}

async fn consume(
    worker: Arc<JobWorker>,
    consumer: String,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    let mut deliveries = Box::pin(queue::deliveries(
        worker.queue.clone(),
        consumer.clone(),
        worker.config.receive_wait,
    ));

    loop {
        let next = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                lock(&stats).in_flight += 1;
                let result = worker.handle(&delivery).await;
                if let Err(e) = &result {
                    error!(consumer = %consumer, job_id = %delivery.job_id, error = %e, "delivery left unacked");
                }
                let mut s = lock(&stats);
                s.in_flight = s.in_flight.saturating_sub(1);
                s.record(&result);
            }
            Some(Err(e)) => {
                if e.is_transient() {
                    warn!(consumer = %consumer, error = %e, "receive failed; backing off");
                } else {
                    error!(consumer = %consumer, error = %e, "queue rejected receive; backing off");
                }
                tokio::time::sleep(worker.config.error_backoff).await;
            }
            None => break,
        }
    }
    info!(consumer = %consumer, "worker stopped");
}
