//! Infrastructure wiring: stores, queue, processors, worker and sweeper.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use audioflow_auth::{GuestRegistry, Hs256TokenValidator, IdentityResolver};
use audioflow_infra::artifacts::{ArtifactError, ArtifactStore};
use audioflow_infra::config::{PipelineConfig, QueueBackend};
use audioflow_infra::processors::{ProcessorError, ProcessorRegistry};
use audioflow_infra::queue::{InMemoryQueue, JobQueue, PostgresQueue, QueueError};
use audioflow_infra::service::PipelineService;
use audioflow_infra::store::{InMemoryJobStore, JobStoreError, PipelineStore, PostgresJobStore};
use audioflow_infra::usage::UsageAggregator;
use audioflow_infra::workers::{ExpirySweeper, JobWorker};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Artifacts(#[from] ArtifactError),

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Processor(#[from] ProcessorError),

    #[error("queue backend '{0}' is not available in this build")]
    UnsupportedBackend(&'static str),
}

/// Shared state for request handlers.
pub struct AppServices {
    pub pipeline: PipelineService,
    pub resolver: Arc<IdentityResolver>,
    pub tokens: Arc<Hs256TokenValidator>,
    pub max_upload_bytes: u64,
}

/// Everything the binary runs: handler state plus the background parts.
pub struct Pipeline {
    pub services: Arc<AppServices>,
    pub worker: JobWorker,
    pub sweeper: ExpirySweeper,
}

/// Connect backends chosen by `config` and assemble the pipeline.
///
/// A database URL selects the Postgres job store; otherwise jobs live in
/// process memory.
pub async fn build_pipeline(config: &PipelineConfig) -> Result<Pipeline, StartupError> {
    let artifacts = ArtifactStore::new(config.upload_dir.clone(), config.output_dir.clone());
    artifacts.ensure_dirs().await?;

    match config.database_url.as_deref() {
        Some(url) => {
            let store = Arc::new(PostgresJobStore::connect(url).await?);
            store.ensure_schema().await?;
            info!("using postgres job store");

            let queue: Arc<dyn JobQueue> = if config.queue_backend == QueueBackend::Postgres {
                let queue = PostgresQueue::new(store.pool().clone(), config.visibility_timeout);
                queue.ensure_schema().await?;
                Arc::new(queue)
            } else {
                build_queue(config).await?
            };
            assemble(config, store, queue, artifacts)
        }
        None => {
            info!("using in-memory job store");
            let queue = build_queue(config).await?;
            assemble(config, InMemoryJobStore::arc(), queue, artifacts)
        }
    }
}

/// Queue backends that don't share the job store's connection.
async fn build_queue(config: &PipelineConfig) -> Result<Arc<dyn JobQueue>, StartupError> {
    match config.queue_backend {
        QueueBackend::Memory => {
            info!("using in-memory queue");
            Ok(Arc::new(InMemoryQueue::new(config.visibility_timeout)))
        }
        QueueBackend::Postgres => Err(StartupError::UnsupportedBackend("postgres without a database")),
        QueueBackend::Redis => redis_queue(config).await,
    }
}

#[cfg(feature = "redis")]
async fn redis_queue(config: &PipelineConfig) -> Result<Arc<dyn JobQueue>, StartupError> {
    use audioflow_infra::queue::RedisStreamsQueue;

    let url = config
        .redis_url
        .as_deref()
        .ok_or(StartupError::UnsupportedBackend("redis without a url"))?;
    let queue = RedisStreamsQueue::new(url, config.visibility_timeout)?;
    queue.ensure_group().await?;
    info!("using redis streams queue");
    Ok(Arc::new(queue))
}

#[cfg(not(feature = "redis"))]
async fn redis_queue(_config: &PipelineConfig) -> Result<Arc<dyn JobQueue>, StartupError> {
    Err(StartupError::UnsupportedBackend("redis"))
}

/// Wire services over an already-connected store and queue.
pub fn assemble<S>(
    config: &PipelineConfig,
    store: Arc<S>,
    queue: Arc<dyn JobQueue>,
    artifacts: ArtifactStore,
) -> Result<Pipeline, StartupError>
where
    S: PipelineStore + 'static,
{
    let registry: Arc<dyn GuestRegistry> = store.clone();
    let store: Arc<dyn PipelineStore> = store;

    let tokens = Arc::new(Hs256TokenValidator::new(config.jwt_secret.as_bytes()));
    let resolver = Arc::new(IdentityResolver::new(
        tokens.clone(),
        registry,
        config.guest_ttl(),
        config.expired_guest_policy,
    ));

    let processors = ProcessorRegistry::from_templates(&config.processors, config.passthrough_processors)?;
    info!(registered = ?processors.registered(), "processors configured");

    let sweeper = ExpirySweeper::new(store.clone(), artifacts.clone(), config.stall_after());
    let usage = UsageAggregator::new(store.clone()).with_limits(config.guest_limits, config.user_limits);
    let pipeline = PipelineService::new(
        store.clone(),
        queue.clone(),
        artifacts.clone(),
        usage,
        sweeper.clone(),
        config.upload_policy(),
    )
    .with_retry(config.retry.clone());
    let worker = JobWorker::new(store, queue, artifacts, processors, config.worker_config());

    Ok(Pipeline {
        services: Arc::new(AppServices {
            pipeline,
            resolver,
            tokens,
            max_upload_bytes: config.max_upload_mb * 1024 * 1024,
        }),
        worker,
        sweeper,
    })
}
