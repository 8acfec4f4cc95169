//! Audio job domain module.
//!
//! This crate contains the job lifecycle rules, usage accounting and guest
//! sessions, implemented purely as deterministic domain logic (no IO, no
//! HTTP, no storage).

pub mod guest;
pub mod job;
pub mod processing;
pub mod usage;

pub use guest::Guest;
pub use job::{
    Job, JobStatus, JobTransition, NewJob, Owner, TransitionError, TransitionOutcome,
};
pub use processing::ProcessingType;
pub use usage::{
    check_limit, LimitCheck, LimitKind, UsageDelta, UsageLimits, UsageReport, UsageStats,
};
