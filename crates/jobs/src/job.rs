use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use audioflow_core::{DomainError, GuestId, JobId, UserId};

use crate::processing::ProcessingType;
use crate::usage::UsageDelta;

/// Owner of a job or a usage row: exactly one of a registered user or a guest.
///
/// Modelled as an enum so "both" and "neither" are unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Owner {
    User(UserId),
    Guest(GuestId),
}

impl Owner {
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Owner::User(id) => Some(*id),
            Owner::Guest(_) => None,
        }
    }

    pub fn guest_id(&self) -> Option<&GuestId> {
        match self {
            Owner::User(_) => None,
            Owner::Guest(id) => Some(id),
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Owner::Guest(_))
    }

    /// Rebuild an owner from nullable storage columns, enforcing XOR.
    pub fn from_columns(
        user_id: Option<UserId>,
        guest_id: Option<GuestId>,
    ) -> Result<Self, DomainError> {
        match (user_id, guest_id) {
            (Some(u), None) => Ok(Owner::User(u)),
            (None, Some(g)) => Ok(Owner::Guest(g)),
            (Some(_), Some(_)) => Err(DomainError::invariant(
                "owner has both user_id and guest_id",
            )),
            (None, None) => Err(DomainError::invariant(
                "owner has neither user_id nor guest_id",
            )),
        }
    }

    /// Stable string key (`user:<uuid>` / `guest:<id>`), used as a storage key.
    pub fn key(&self) -> String {
        match self {
            Owner::User(id) => format!("user:{id}"),
            Owner::Guest(id) => format!("guest:{id}"),
        }
    }
}

impl core::fmt::Display for Owner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.key())
    }
}

/// Job lifecycle status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created and queued, not yet claimed by a worker
    Pending,
    /// Claimed by exactly one worker
    Processing,
    /// Output produced (terminal)
    Completed,
    /// Processing or validation failed (terminal)
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// The allowed-transition table.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Pending, JobStatus::Failed)
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status '{s}'")))
    }
}

/// Descriptive metadata supplied by the submission layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub owner: Owner,
    pub original_filename: String,
    pub stored_filename: String,
    /// Extension without the leading dot (e.g. `wav`).
    pub file_format: String,
    pub file_size: u64,
    pub processing_type: ProcessingType,
    pub input_location: String,
}

/// One unit of work and its tracked lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub owner: Owner,
    pub original_filename: String,
    pub stored_filename: String,
    pub file_format: String,
    pub file_size: u64,
    pub processing_type: ProcessingType,
    pub input_location: String,
    pub output_location: Option<String>,
    pub status: JobStatus,
    /// 0..=100; non-decreasing while the job is not terminal
    pub progress: u8,
    /// Terse, user-facing failure message (set iff `status == Failed`)
    pub error_message: Option<String>,
    /// Full error chain for operators; never shown to job owners
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

/// A requested state change, with the fields it writes.
#[derive(Debug, Clone, PartialEq)]
pub enum JobTransition {
    /// pending → processing
    Claim { at: DateTime<Utc> },
    /// processing → completed
    Complete {
        output_location: String,
        output_bytes: u64,
        at: DateTime<Utc>,
    },
    /// pending|processing → failed
    Fail {
        message: String,
        detail: Option<String>,
        at: DateTime<Utc>,
    },
}

impl JobTransition {
    pub fn target(&self) -> JobStatus {
        match self {
            JobTransition::Claim { .. } => JobStatus::Processing,
            JobTransition::Complete { .. } => JobStatus::Completed,
            JobTransition::Fail { .. } => JobStatus::Failed,
        }
    }

    pub fn fail(message: impl Into<String>, detail: Option<String>, at: DateTime<Utc>) -> Self {
        JobTransition::Fail {
            message: message.into(),
            detail,
            at,
        }
    }
}

/// State-machine guard violation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition for job {job_id}: {from} -> {to}")]
pub struct TransitionError {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Result of a successfully applied transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    pub from: JobStatus,
    pub to: JobStatus,
    /// Usage increment that belongs to this transition, if any.
    pub usage: Option<UsageDelta>,
}

impl Job {
    pub const MAX_PROGRESS: u8 = 100;

    /// Build a freshly submitted job (`pending`, progress 0).
    pub fn create(
        job_id: JobId,
        new: NewJob,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Self {
        Self {
            job_id,
            owner: new.owner,
            original_filename: new.original_filename,
            stored_filename: new.stored_filename,
            file_format: new.file_format,
            file_size: new.file_size,
            processing_type: new.processing_type,
            input_location: new.input_location,
            output_location: None,
            status: JobStatus::Pending,
            progress: 0,
            error_message: None,
            error_detail: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            expires_at: now + retention,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_owned_by(&self, owner: &Owner) -> bool {
        &self.owner == owner
    }

    /// Wall-clock seconds between claim and completion (0 if never started).
    pub fn processing_seconds(&self) -> f64 {
        match (self.started_at, self.completed_at) {
            (Some(s), Some(c)) => ((c - s).num_milliseconds().max(0) as f64) / 1000.0,
            _ => 0.0,
        }
    }

    /// Usage increment recorded when this job is submitted.
    pub fn upload_usage(&self) -> UsageDelta {
        UsageDelta::upload(self.file_size, self.processing_type, self.created_at)
    }

    /// Apply a transition, enforcing the state machine.
    ///
    /// On rejection the job is left untouched.
    pub fn apply(&mut self, transition: JobTransition) -> Result<TransitionOutcome, TransitionError> {
        let from = self.status;
        let to = transition.target();
        if !from.can_transition_to(to) {
            return Err(TransitionError {
                job_id: self.job_id,
                from,
                to,
            });
        }

        let usage = match transition {
            JobTransition::Claim { at } => {
                self.started_at = Some(at);
                None
            }
            JobTransition::Complete {
                output_location,
                output_bytes,
                at,
            } => {
                self.output_location = Some(output_location);
                self.completed_at = Some(at);
                self.progress = Self::MAX_PROGRESS;
                Some(UsageDelta::processed(output_bytes, self.processing_seconds()))
            }
            JobTransition::Fail {
                message,
                detail,
                at,
            } => {
                self.error_message = Some(message);
                self.error_detail = detail;
                self.completed_at = Some(at);
                // progress stays where it was; only completed jobs reach 100
                self.progress = self.progress.min(Self::MAX_PROGRESS - 1);
                Some(UsageDelta::failed(self.processing_seconds()))
            }
        };

        self.status = to;
        Ok(TransitionOutcome { from, to, usage })
    }

    /// Record a coarse progress update.
    ///
    /// Only applies while `processing`; values are clamped below 100 (100 is
    /// reserved for completion) and lower values than the current one are
    /// ignored. Returns whether the stored value changed.
    pub fn record_progress(&mut self, progress: u8) -> Result<bool, TransitionError> {
        if self.status != JobStatus::Processing {
            return Err(TransitionError {
                job_id: self.job_id,
                from: self.status,
                to: JobStatus::Processing,
            });
        }
        let clamped = progress.min(Self::MAX_PROGRESS - 1);
        if clamped <= self.progress {
            return Ok(false);
        }
        self.progress = clamped;
        Ok(true)
    }

    /// Check the data-model invariants (used when rehydrating rows).
    pub fn check_invariants(&self) -> Result<(), DomainError> {
        if self.progress > Self::MAX_PROGRESS {
            return Err(DomainError::invariant("progress above 100"));
        }
        if (self.progress == Self::MAX_PROGRESS) != (self.status == JobStatus::Completed) {
            return Err(DomainError::invariant(
                "progress must be 100 exactly when completed",
            ));
        }
        if self.error_message.is_some() != (self.status == JobStatus::Failed) {
            return Err(DomainError::invariant(
                "error_message must be set exactly when failed",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_job(owner: Owner) -> Job {
        Job::create(
            JobId::new(),
            NewJob {
                owner,
                original_filename: "meeting.wav".into(),
                stored_filename: "abc.wav".into(),
                file_format: "wav".into(),
                file_size: 10 * 1024 * 1024,
                processing_type: ProcessingType::SpeechEnhancement,
                input_location: "/uploads/abc.wav".into(),
            },
            Utc::now(),
            Duration::hours(24),
        )
    }

    #[test]
    fn new_job_is_pending_with_zero_progress() {
        let job = sample_job(Owner::Guest(GuestId::generate()));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert_eq!(job.expires_at - job.created_at, Duration::hours(24));
        job.check_invariants().unwrap();
    }

    #[test]
    fn happy_path_reaches_completed_with_full_progress() {
        let mut job = sample_job(Owner::User(UserId::new()));
        let started = Utc::now();
        job.apply(JobTransition::Claim { at: started }).unwrap();
        assert_eq!(job.record_progress(50), Ok(true));

        let outcome = job
            .apply(JobTransition::Complete {
                output_location: "/out/processed_abc.wav".into(),
                output_bytes: 42,
                at: started + Duration::seconds(3),
            })
            .unwrap();

        assert_eq!(outcome.from, JobStatus::Processing);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert!(job.error_message.is_none());
        let usage = outcome.usage.unwrap();
        assert_eq!(usage.files_processed, 1);
        assert_eq!(usage.output_bytes, 42);
        assert!((usage.processing_seconds - 3.0).abs() < f64::EPSILON);
        job.check_invariants().unwrap();
    }

    #[test]
    fn pending_cannot_jump_to_completed() {
        let mut job = sample_job(Owner::User(UserId::new()));
        let before = job.clone();
        let err = job
            .apply(JobTransition::Complete {
                output_location: "x".into(),
                output_bytes: 0,
                at: Utc::now(),
            })
            .unwrap_err();
        assert_eq!(err.from, JobStatus::Pending);
        assert_eq!(err.to, JobStatus::Completed);
        assert_eq!(job, before);
    }

    #[test]
    fn pending_can_fail_at_claim_time() {
        let mut job = sample_job(Owner::User(UserId::new()));
        let outcome = job
            .apply(JobTransition::fail("input file missing", None, Utc::now()))
            .unwrap();
        assert_eq!(outcome.usage.unwrap().files_failed, 1);
        assert_eq!(job.status, JobStatus::Failed);
        job.check_invariants().unwrap();
    }

    #[test]
    fn terminal_states_reject_everything() {
        let mut job = sample_job(Owner::User(UserId::new()));
        job.apply(JobTransition::fail("boom", None, Utc::now())).unwrap();

        assert!(job.apply(JobTransition::Claim { at: Utc::now() }).is_err());
        assert!(job.apply(JobTransition::fail("again", None, Utc::now())).is_err());
        assert!(job.record_progress(10).is_err());
        assert_eq!(job.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn second_claim_is_rejected() {
        let mut job = sample_job(Owner::User(UserId::new()));
        job.apply(JobTransition::Claim { at: Utc::now() }).unwrap();
        let err = job.apply(JobTransition::Claim { at: Utc::now() }).unwrap_err();
        assert_eq!(err.from, JobStatus::Processing);
    }

    #[test]
    fn progress_is_monotonic_and_capped_below_completion() {
        let mut job = sample_job(Owner::User(UserId::new()));
        job.apply(JobTransition::Claim { at: Utc::now() }).unwrap();
        assert_eq!(job.record_progress(20), Ok(true));
        assert_eq!(job.record_progress(5), Ok(false));
        assert_eq!(job.progress, 20);
        job.record_progress(100).unwrap();
        assert_eq!(job.progress, 99);
    }

    #[test]
    fn owner_from_columns_enforces_xor() {
        assert!(Owner::from_columns(Some(UserId::new()), None).is_ok());
        assert!(Owner::from_columns(None, Some(GuestId::generate())).is_ok());
        assert!(Owner::from_columns(None, None).is_err());
        assert!(Owner::from_columns(Some(UserId::new()), Some(GuestId::generate())).is_err());
    }
}
