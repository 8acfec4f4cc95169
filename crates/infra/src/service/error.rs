use thiserror::Error;

use audioflow_auth::AuthzError;
use audioflow_core::JobId;

use crate::artifacts::ArtifactError;
use crate::queue::QueueError;
use crate::store::JobStoreError;

/// Errors surfaced by the pipeline facade.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad input at submission; nothing was stored or enqueued.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error(transparent)]
    Forbidden(#[from] AuthzError),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {job_id} is not ready (status: {status})")]
    NotReady { job_id: JobId, status: String },

    #[error("usage limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("storage failure: {0}")]
    Storage(String),

    /// Store or broker unavailable after retries.
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl From<JobStoreError> for PipelineError {
    fn from(e: JobStoreError) -> Self {
        match e {
            JobStoreError::NotFound(id) => PipelineError::NotFound(id),
            JobStoreError::Unavailable(msg) => PipelineError::Unavailable(msg),
            JobStoreError::LimitExceeded(msg) => PipelineError::LimitExceeded(msg),
            other => PipelineError::Storage(other.to_string()),
        }
    }
}

impl From<QueueError> for PipelineError {
    fn from(e: QueueError) -> Self {
        PipelineError::Unavailable(e.to_string())
    }
}

impl From<ArtifactError> for PipelineError {
    fn from(e: ArtifactError) -> Self {
        PipelineError::Storage(e.to_string())
    }
}
