//! Job Store boundary.
//!
//! Durable record of job state, per-owner usage and guest sessions. The store
//! is the single source of truth; queues and workers only carry job ids.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use r#trait::{
    GuestCounts, GuestStore, JobCounts, JobFilter, JobStore, JobStoreError, PipelineStore, UsageLedger,
};
