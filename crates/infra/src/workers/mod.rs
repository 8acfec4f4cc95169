//! Background tasks: the job worker pool and the expiry sweeper.

pub mod job_worker;
pub mod sweeper;

pub use job_worker::{
    DeliveryOutcome, JobWorker, SkipReason, WorkerConfig, WorkerError, WorkerPool, WorkerPoolHandle, WorkerStats,
};
pub use sweeper::{ExpirySweeper, SweepReport, SweeperHandle};
