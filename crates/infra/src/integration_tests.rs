//! End-to-end pipeline tests on the in-memory backends.
//!
//! Tests: Upload → JobStore → Queue → Worker → Status/Download → Sweeper
//!
//! Verifies:
//! - Jobs reach exactly one terminal state with their usage recorded once
//! - Ownership is enforced on reads and downloads
//! - Redelivery, dead-lettering, timeouts and force-deletes are handled

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use tempfile::TempDir;

    use audioflow_auth::{AuthzError, Principal, Role};
    use audioflow_core::{GuestId, JobId, UserId};
    use audioflow_jobs::{JobStatus, ProcessingType};

    use crate::artifacts::ArtifactStore;
    use crate::processors::{AudioProcessor, PassthroughProcessor, ProcessorError, ProcessorRegistry, ProgressReporter};
    use crate::queue::{Delivery, InMemoryQueue, JobQueue, QueueError};
    use crate::retry::RetryPolicy;
    use crate::service::{MSG_ENQUEUE_FAILED, PipelineError, PipelineService, Upload, UploadPolicy};
    use crate::store::{InMemoryJobStore, JobFilter, JobStore, UsageLedger};
    use crate::usage::UsageAggregator;
    use crate::workers::job_worker::{MSG_EXHAUSTED, MSG_FAILED, MSG_INPUT_MISSING, MSG_TIMED_OUT};
    use crate::workers::{DeliveryOutcome, ExpirySweeper, JobWorker, SkipReason, WorkerConfig, WorkerPool};

    const WAIT: Duration = Duration::from_millis(50);

    struct FailingProcessor;

    #[async_trait]
    impl AudioProcessor for FailingProcessor {
        async fn process(&self, _: &Path, _: &Path, _: &ProgressReporter) -> Result<(), ProcessorError> {
            Err(ProcessorError::Failed("model raised: tensor shape mismatch".into()))
        }
    }

    /// Copies the input after a delay, reporting progress halfway.
    struct SlowProcessor(Duration);

    #[async_trait]
    impl AudioProcessor for SlowProcessor {
        async fn process(&self, input: &Path, output: &Path, progress: &ProgressReporter) -> Result<(), ProcessorError> {
            progress.report(50).await;
            tokio::time::sleep(self.0).await;
            tokio::fs::copy(input, output).await?;
            Ok(())
        }
    }

    struct DownQueue;

    #[async_trait]
    impl JobQueue for DownQueue {
        async fn enqueue(&self, _: JobId) -> Result<(), QueueError> {
            Err(QueueError::Unavailable("connection refused".into()))
        }
        async fn receive(&self, _: &str, _: Duration) -> Result<Option<Delivery>, QueueError> {
            Ok(None)
        }
        async fn ack(&self, _: &Delivery) -> Result<(), QueueError> {
            Ok(())
        }
        async fn dead_letter(&self, _: &Delivery, _: &str) -> Result<(), QueueError> {
            Ok(())
        }
    }

    struct Harness {
        _dir: TempDir,
        store: Arc<InMemoryJobStore>,
        queue: Arc<InMemoryQueue>,
        artifacts: ArtifactStore,
        service: PipelineService,
        sweeper: ExpirySweeper,
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::fixed(1, Duration::from_millis(1))
    }

    fn worker_config() -> WorkerConfig {
        WorkerConfig::default()
            .with_name("test-worker")
            .with_retry(fast_retry())
            .with_receive_wait(WAIT)
    }

    async fn harness_with_queue(queue: Arc<dyn JobQueue>, visibility: Duration) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactStore::new(dir.path().join("uploads"), dir.path().join("processed"));
        artifacts.ensure_dirs().await.unwrap();

        let store = InMemoryJobStore::arc();
        let sweeper = ExpirySweeper::new(store.clone(), artifacts.clone(), chrono::Duration::hours(2));
        let service = PipelineService::new(
            store.clone(),
            queue,
            artifacts.clone(),
            UsageAggregator::new(store.clone()),
            sweeper.clone(),
            UploadPolicy::default(),
        )
        .with_retry(fast_retry());

        Harness {
            _dir: dir,
            store,
            queue: Arc::new(InMemoryQueue::new(visibility)),
            artifacts,
            service,
            sweeper,
        }
    }

    async fn harness() -> Harness {
        harness_visibility(Duration::from_secs(30)).await
    }

    async fn harness_visibility(visibility: Duration) -> Harness {
        let queue = Arc::new(InMemoryQueue::new(visibility));
        let mut h = harness_with_queue(queue.clone(), visibility).await;
        h.queue = queue;
        h
    }

    impl Harness {
        fn worker(&self, processors: ProcessorRegistry, config: WorkerConfig) -> JobWorker {
            JobWorker::new(self.store.clone(), self.queue.clone(), self.artifacts.clone(), processors, config)
        }

        fn passthrough_worker(&self) -> JobWorker {
            self.worker(
                ProcessorRegistry::new().with(ProcessingType::SpeechEnhancement, Arc::new(PassthroughProcessor)),
                worker_config(),
            )
        }

        async fn next_delivery(&self) -> Delivery {
            self.queue.receive("test", WAIT).await.unwrap().expect("a queued delivery")
        }
    }

    fn guest() -> Principal {
        Principal::Guest {
            guest_id: GuestId::generate(),
            expires_at: Utc::now() + chrono::Duration::days(7),
        }
    }

    fn admin() -> Principal {
        Principal::AuthenticatedUser {
            id: UserId::new(),
            roles: vec![Role::ADMIN],
        }
    }

    fn wav(bytes: usize) -> Upload {
        Upload {
            filename: "interview.wav".into(),
            processing_type: "speech_enhancement".into(),
            bytes: vec![7u8; bytes],
        }
    }

    #[tokio::test]
    async fn guest_job_completes_and_only_its_owner_can_download() {
        let h = harness().await;
        let g1 = guest();
        let g2 = guest();

        let view = h.service.upload(&g1, wav(10 * 1024 * 1024)).await.unwrap();
        assert_eq!(view.status, JobStatus::Pending);
        assert_eq!(view.progress, 0);

        let outcome = h.passthrough_worker().handle(&h.next_delivery().await).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Completed { job_id: view.job_id });

        let status = h.service.get_status(&g1, view.job_id).await.unwrap();
        assert_eq!(status.status, JobStatus::Completed);
        assert_eq!(status.progress, 100);
        assert!(status.error_message.is_none());

        let usage = h.store.usage(&g1.owner()).await.unwrap().unwrap();
        assert_eq!(usage.files_uploaded, 1);
        assert_eq!(usage.files_processed, 1);
        assert_eq!(usage.input_bytes, 10 * 1024 * 1024);
        assert_eq!(usage.api_calls, 1);

        let download = h.service.download(&g1, view.job_id).await.unwrap();
        assert_eq!(download.filename, "processed_interview.wav");
        assert_eq!(download.content_type, "audio/wav");
        assert_eq!(download.size, 10 * 1024 * 1024);

        let other = h.service.download(&g2, view.job_id).await;
        assert!(matches!(other, Err(PipelineError::Forbidden(AuthzError::NotOwner))));

        let usage = h.store.usage(&g1.owner()).await.unwrap().unwrap();
        assert_eq!(usage.files_downloaded, 1);
        assert_eq!(h.queue.outstanding(), 0);
    }

    #[tokio::test]
    async fn processor_error_fails_job_and_blocks_download() {
        let h = harness().await;
        let g = guest();
        let view = h.service.upload(&g, wav(1024)).await.unwrap();

        let worker = h.worker(
            ProcessorRegistry::new().with(ProcessingType::SpeechEnhancement, Arc::new(FailingProcessor)),
            worker_config(),
        );
        let outcome = worker.handle(&h.next_delivery().await).await.unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Failed { ref message, .. } if message == MSG_FAILED));

        let status = h.service.get_status(&g, view.job_id).await.unwrap();
        assert_eq!(status.status, JobStatus::Failed);
        assert_eq!(status.error_message.as_deref(), Some(MSG_FAILED));
        assert!(status.progress < 100);

        // Operator detail is kept off the owner view but visible to admins.
        let admin_view = h.service.admin_get_job(&admin(), view.job_id).await.unwrap();
        assert!(admin_view.error_detail.unwrap().contains("tensor shape mismatch"));

        let usage = h.store.usage(&g.owner()).await.unwrap().unwrap();
        assert_eq!(usage.files_failed, 1);
        assert_eq!(usage.files_processed, 0);

        let download = h.service.download(&g, view.job_id).await;
        assert!(matches!(download, Err(PipelineError::NotReady { .. })));
    }

    #[tokio::test]
    async fn expired_completed_job_is_swept_and_then_not_found() {
        let h = harness().await;
        let g = guest();
        let view = h.service.upload(&g, wav(2048)).await.unwrap();
        h.passthrough_worker().handle(&h.next_delivery().await).await.unwrap();

        let job = h.store.get(view.job_id).await.unwrap().unwrap();
        let output = job.output_location.clone().unwrap();
        assert!(h.artifacts.exists(&output).await);

        let report = h.sweeper.sweep_once(job.expires_at + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(report.jobs_deleted, 1);
        assert_eq!(report.files_removed, 2);
        assert!(!h.artifacts.exists(&output).await);
        assert!(!h.artifacts.exists(&job.input_location).await);

        let status = h.service.get_status(&g, view.job_id).await;
        assert!(matches!(status, Err(PipelineError::NotFound(id)) if id == view.job_id));
    }

    #[tokio::test]
    async fn duplicate_deliveries_claim_the_job_exactly_once() {
        let h = harness().await;
        let g = guest();
        let view = h.service.upload(&g, wav(4096)).await.unwrap();
        // Same job id published twice, as a redelivering broker would.
        h.queue.enqueue(view.job_id).await.unwrap();

        let registry =
            ProcessorRegistry::new().with(ProcessingType::SpeechEnhancement, Arc::new(SlowProcessor(Duration::from_millis(50))));
        let w1 = h.worker(registry.clone(), worker_config());
        let w2 = h.worker(registry, worker_config());
        let d1 = h.next_delivery().await;
        let d2 = h.next_delivery().await;
        assert_eq!(d1.job_id, d2.job_id);

        let (r1, r2) = tokio::join!(w1.handle(&d1), w2.handle(&d2));
        let outcomes = [r1.unwrap(), r2.unwrap()];

        let completed = outcomes
            .iter()
            .filter(|o| matches!(o, DeliveryOutcome::Completed { .. }))
            .count();
        assert_eq!(completed, 1);
        assert!(outcomes.iter().any(|o| matches!(
            o,
            DeliveryOutcome::Skipped {
                reason: SkipReason::AlreadyClaimed | SkipReason::AlreadyTerminal,
                ..
            }
        )));

        let usage = h.store.usage(&g.owner()).await.unwrap().unwrap();
        assert_eq!(usage.files_processed, 1);
        assert_eq!(h.queue.outstanding(), 0);
    }

    #[tokio::test]
    async fn concurrent_completions_do_not_lose_usage_updates() {
        let h = harness().await;
        let user = Principal::user(UserId::new());
        let sizes = [1000usize, 2000, 3000, 4000, 5000, 6000, 7000, 8000];
        for size in sizes {
            h.service.upload(&user, wav(size)).await.unwrap();
        }

        let registry =
            ProcessorRegistry::new().with(ProcessingType::SpeechEnhancement, Arc::new(SlowProcessor(Duration::from_millis(10))));
        let pool = WorkerPool::spawn(h.worker(registry, worker_config()), 4);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let counts = h.store.counts().await.unwrap();
            if counts.completed == sizes.len() as u64 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "jobs did not finish: {counts:?}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let stats = pool.stats();
        pool.shutdown().await;

        assert_eq!(stats.completed, sizes.len() as u64);
        let usage = h.store.usage(&user.owner()).await.unwrap().unwrap();
        assert_eq!(usage.files_processed, sizes.len() as u64);
        assert_eq!(usage.input_bytes, sizes.iter().sum::<usize>() as u64);
    }

    #[tokio::test]
    async fn exhausted_redeliveries_fail_the_job_and_dead_letter_it() {
        let h = harness_visibility(Duration::from_millis(20)).await;
        let g = guest();
        let view = h.service.upload(&g, wav(512)).await.unwrap();

        // First delivery is taken by a consumer that dies before acking.
        let first = h.next_delivery().await;
        assert_eq!(first.attempt, 1);
        let second = h.queue.receive("test", Duration::from_millis(500)).await.unwrap().unwrap();
        assert_eq!(second.attempt, 2);

        let worker = h.worker(
            ProcessorRegistry::new().with(ProcessingType::SpeechEnhancement, Arc::new(PassthroughProcessor)),
            worker_config().with_max_deliveries(1),
        );
        let outcome = worker.handle(&second).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::DeadLettered { job_id: view.job_id });

        let job = h.store.get(view.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some(MSG_EXHAUSTED));
        assert_eq!(h.queue.dead_letters().len(), 1);
        assert_eq!(h.queue.outstanding(), 0);
    }

    #[tokio::test]
    async fn hung_processor_is_timed_out() {
        let h = harness().await;
        let g = guest();
        let view = h.service.upload(&g, wav(512)).await.unwrap();

        let worker = h.worker(
            ProcessorRegistry::new().with(ProcessingType::SpeechEnhancement, Arc::new(SlowProcessor(Duration::from_secs(30)))),
            worker_config().with_processing_timeout(Duration::from_millis(50)),
        );
        let outcome = worker.handle(&h.next_delivery().await).await.unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Failed { ref message, .. } if message == MSG_TIMED_OUT));

        let job = h.store.get(view.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.progress >= 20);
    }

    #[tokio::test]
    async fn missing_input_fails_pending_job_without_claiming() {
        let h = harness().await;
        let g = guest();
        let view = h.service.upload(&g, wav(512)).await.unwrap();
        let job = h.store.get(view.job_id).await.unwrap().unwrap();
        h.artifacts.remove(&job.input_location).await.unwrap();

        let outcome = h.passthrough_worker().handle(&h.next_delivery().await).await.unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Failed { ref message, .. } if message == MSG_INPUT_MISSING));

        let job = h.store.get(view.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.started_at.is_none());
    }

    #[tokio::test]
    async fn job_deleted_mid_processing_discards_its_output() {
        let h = harness().await;
        let g = guest();
        let view = h.service.upload(&g, wav(512)).await.unwrap();
        let job = h.store.get(view.job_id).await.unwrap().unwrap();
        let output = h.artifacts.output_path(&job.stored_filename);

        let worker = h.worker(
            ProcessorRegistry::new().with(ProcessingType::SpeechEnhancement, Arc::new(SlowProcessor(Duration::from_millis(100)))),
            worker_config(),
        );
        let delivery = h.next_delivery().await;
        let running = tokio::spawn(async move { worker.handle(&delivery).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        let deleted = h.service.admin_delete_job(&admin(), view.job_id).await.unwrap();
        assert_eq!(deleted.files_removed, 1);

        let outcome = running.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            DeliveryOutcome::Skipped {
                job_id: view.job_id,
                reason: SkipReason::Superseded
            }
        );
        assert!(!h.artifacts.exists(&output).await);
        assert!(h.store.get(view.job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_enqueue_marks_the_job_failed() {
        let h = harness_with_queue(Arc::new(DownQueue), Duration::from_secs(30)).await;
        let g = guest();

        let result = h.service.upload(&g, wav(512)).await;
        assert!(matches!(result, Err(PipelineError::Unavailable(_))));

        let jobs = h.store.list(&JobFilter::owned_by(g.owner())).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert_eq!(jobs[0].error_message.as_deref(), Some(MSG_ENQUEUE_FAILED));
    }

    #[tokio::test]
    async fn uploads_are_validated_before_anything_is_stored() {
        let h = harness().await;
        let g = guest();

        let bad_type = Upload {
            processing_type: "karaoke".into(),
            ..wav(10)
        };
        assert!(matches!(h.service.upload(&g, bad_type).await, Err(PipelineError::Validation(_))));

        let bad_ext = Upload {
            filename: "notes.txt".into(),
            ..wav(10)
        };
        assert!(matches!(h.service.upload(&g, bad_ext).await, Err(PipelineError::Validation(_))));

        assert!(matches!(h.service.upload(&g, wav(0)).await, Err(PipelineError::Validation(_))));

        assert_eq!(h.store.counts().await.unwrap().total(), 0);
        assert_eq!(h.queue.outstanding(), 0);
    }

    #[tokio::test]
    async fn guest_upload_limit_rejects_the_next_upload() {
        let h = harness().await;
        let g = guest();
        for _ in 0..5 {
            h.service.upload(&g, wav(16)).await.unwrap();
        }
        let sixth = h.service.upload(&g, wav(16)).await;
        assert!(matches!(sixth, Err(PipelineError::LimitExceeded(_))));

        let checks = h.service.check_limits(&g).await.unwrap();
        assert!(checks.iter().any(|c| !c.within_limit));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_guest_uploads_cannot_overrun_the_upload_limit() {
        let h = harness().await;
        let g = guest();

        let uploads: Vec<_> = (0..20)
            .map(|_| {
                let service = h.service.clone();
                let g = g.clone();
                tokio::spawn(async move { service.upload(&g, wav(2 * 1024 * 1024)).await })
            })
            .collect();

        let mut accepted = 0;
        for upload in uploads {
            match upload.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(PipelineError::LimitExceeded(msg)) => assert_eq!(msg, "Upload limit of 5 files reached"),
                Err(other) => panic!("unexpected upload error: {other}"),
            }
        }

        assert_eq!(accepted, 5);
        let usage = h.store.usage(&g.owner()).await.unwrap().unwrap();
        assert_eq!(usage.files_uploaded, 5);
        assert_eq!(h.store.counts().await.unwrap().pending, 5);
        let stored = std::fs::read_dir(h._dir.path().join("uploads")).unwrap().count();
        assert_eq!(stored, 5, "rejected uploads must not leave files behind");
    }

    #[tokio::test]
    async fn admin_surface_requires_admin_role() {
        let h = harness().await;
        let g = guest();
        h.service.upload(&g, wav(64)).await.unwrap();

        assert!(matches!(
            h.service.admin_overview(&g).await,
            Err(PipelineError::Forbidden(AuthzError::AdminRequired))
        ));

        let overview = h.service.admin_overview(&admin()).await.unwrap();
        assert_eq!(overview.jobs.pending, 1);
        assert_eq!(overview.total_jobs, 1);
        assert_eq!(overview.usage.files_uploaded, 1);

        let jobs = h.service.admin_list_jobs(&admin(), &JobFilter::default()).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].owner, g.owner());
    }
}
