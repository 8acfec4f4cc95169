use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use audioflow_auth::{GuestRegistry, RegistryError};
use audioflow_core::{GuestId, JobId, UserId};
use audioflow_jobs::{Guest, Job, JobStatus, JobTransition, NewJob, Owner, UsageDelta, UsageLimits, UsageStats};

use super::r#trait::{
    GuestCounts, GuestStore, JobCounts, JobFilter, JobStore, JobStoreError, UsageLedger, over_limit,
};

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    usage: HashMap<Owner, UsageStats>,
    guests: HashMap<GuestId, Guest>,
}

impl State {
    fn apply_usage(&mut self, owner: &Owner, delta: &UsageDelta, now: DateTime<Utc>) -> UsageStats {
        let stats = self
            .usage
            .entry(owner.clone())
            .or_insert_with(|| UsageStats::empty(owner.clone(), now));
        stats.apply(delta, now);
        stats.clone()
    }

    fn insert_job(&mut self, job: Job, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        if self.jobs.contains_key(&job.job_id) {
            return Err(JobStoreError::AlreadyExists(job.job_id));
        }
        self.apply_usage(&job.owner, &job.upload_usage(), now);
        self.jobs.insert(job.job_id, job.clone());
        Ok(job)
    }
}

/// In-memory pipeline store for tests/dev.
///
/// One lock covers jobs, usage and guests, so a transition and its usage
/// increment are observed together or not at all.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, new: NewJob, now: DateTime<Utc>, retention: Duration) -> Result<Job, JobStoreError> {
        let mut state = self.state();
        state.insert_job(Job::create(JobId::new(), new, now, retention), now)
    }

    async fn create_within_limits(
        &self,
        new: NewJob,
        now: DateTime<Utc>,
        retention: Duration,
        limits: &UsageLimits,
    ) -> Result<Job, JobStoreError> {
        let mut state = self.state();
        match state.usage.get(&new.owner) {
            Some(stats) => over_limit(limits, stats)?,
            None => over_limit(limits, &UsageStats::empty(new.owner.clone(), now))?,
        }
        state.insert_job(Job::create(JobId::new(), new, now, retention), now)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.state().jobs.get(&job_id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let state = self.state();
        let mut jobs: Vec<&Job> = state.jobs.values().filter(|j| filter.matches(j)).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.job_id.cmp(&a.job_id)));
        Ok(jobs
            .into_iter()
            .skip(filter.skip)
            .take(filter.page_size())
            .cloned()
            .collect())
    }

    async fn transition(&self, job_id: JobId, transition: JobTransition) -> Result<Job, JobStoreError> {
        let mut state = self.state();
        let job = state.jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        // Apply to a copy so a rejected transition leaves the row untouched.
        let mut next = job.clone();
        let outcome = next.apply(transition)?;
        *job = next.clone();

        if let Some(delta) = outcome.usage {
            let now = next.completed_at.unwrap_or_else(Utc::now);
            state.apply_usage(&next.owner, &delta, now);
        }
        debug!(job_id = %job_id, from = %outcome.from, to = %outcome.to, "job transitioned");
        Ok(next)
    }

    async fn record_progress(&self, job_id: JobId, progress: u8) -> Result<bool, JobStoreError> {
        let mut state = self.state();
        let job = state.jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        Ok(job.record_progress(progress)?)
    }

    async fn delete(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.state().jobs.remove(&job_id))
    }

    async fn list_expired_terminal(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let state = self.state();
        let mut jobs: Vec<&Job> = state
            .jobs
            .values()
            .filter(|j| j.is_terminal() && j.is_expired(now))
            .collect();
        jobs.sort_by_key(|j| j.expires_at);
        Ok(jobs.into_iter().take(limit).cloned().collect())
    }

    async fn list_stalled(&self, started_before: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let state = self.state();
        let mut jobs: Vec<&Job> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Processing && j.started_at.is_some_and(|s| s < started_before))
            .collect();
        jobs.sort_by_key(|j| j.started_at);
        Ok(jobs.into_iter().take(limit).cloned().collect())
    }

    async fn counts(&self) -> Result<JobCounts, JobStoreError> {
        let mut counts = JobCounts::default();
        for job in self.state().jobs.values() {
            counts.bump(job.status);
        }
        Ok(counts)
    }
}

#[async_trait]
impl UsageLedger for InMemoryJobStore {
    async fn increment(&self, owner: &Owner, delta: &UsageDelta, now: DateTime<Utc>) -> Result<UsageStats, JobStoreError> {
        Ok(self.state().apply_usage(owner, delta, now))
    }

    async fn usage(&self, owner: &Owner) -> Result<Option<UsageStats>, JobStoreError> {
        Ok(self.state().usage.get(owner).cloned())
    }

    async fn list_usage(&self) -> Result<Vec<UsageStats>, JobStoreError> {
        let mut all: Vec<UsageStats> = self.state().usage.values().cloned().collect();
        all.sort_by(|a, b| a.owner.cmp(&b.owner));
        Ok(all)
    }
}

#[async_trait]
impl GuestRegistry for InMemoryJobStore {
    async fn find_guest(&self, guest_id: &GuestId) -> Result<Option<Guest>, RegistryError> {
        Ok(self.state().guests.get(guest_id).cloned())
    }

    async fn save_guest(&self, guest: &Guest) -> Result<(), RegistryError> {
        self.state().guests.insert(guest.guest_id.clone(), guest.clone());
        Ok(())
    }
}

#[async_trait]
impl GuestStore for InMemoryJobStore {
    async fn list_guests(&self, skip: usize, limit: usize) -> Result<Vec<Guest>, JobStoreError> {
        let state = self.state();
        let mut guests: Vec<&Guest> = state.guests.values().collect();
        guests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(guests.into_iter().skip(skip).take(limit).cloned().collect())
    }

    async fn count_guests(&self, now: DateTime<Utc>) -> Result<GuestCounts, JobStoreError> {
        let state = self.state();
        let mut counts = GuestCounts::default();
        for g in state.guests.values() {
            counts.total += 1;
            if !g.is_expired(now) {
                counts.active += 1;
            }
            if g.converted_to_user_id.is_some() {
                counts.converted += 1;
            }
        }
        Ok(counts)
    }

    async fn list_expired_guests(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Guest>, JobStoreError> {
        let state = self.state();
        let mut guests: Vec<&Guest> = state.guests.values().filter(|g| g.is_expired(now)).collect();
        guests.sort_by_key(|g| g.expires_at);
        Ok(guests.into_iter().take(limit).cloned().collect())
    }

    async fn delete_guest_if_idle(&self, guest_id: &GuestId, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let mut state = self.state();
        let expired = state.guests.get(guest_id).is_some_and(|g| g.is_expired(now));
        let owns_jobs = state
            .jobs
            .values()
            .any(|j| j.owner.guest_id() == Some(guest_id));
        if expired && !owns_jobs {
            state.guests.remove(guest_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn convert_guest(&self, guest_id: &GuestId, user_id: UserId) -> Result<Guest, JobStoreError> {
        let mut state = self.state();
        let guest = state
            .guests
            .get_mut(guest_id)
            .ok_or_else(|| JobStoreError::GuestNotFound(guest_id.clone()))?;
        guest.convert_to(user_id);
        Ok(guest.clone())
    }
}

#[cfg(test)]
mod tests {
    use audioflow_jobs::ProcessingType;

    use super::*;

    fn new_job(owner: Owner) -> NewJob {
        NewJob {
            owner,
            original_filename: "talk.wav".into(),
            stored_filename: "x.wav".into(),
            file_format: "wav".into(),
            file_size: 2048,
            processing_type: ProcessingType::SpeechEnhancement,
            input_location: "/tmp/x.wav".into(),
        }
    }

    fn guest_owner() -> Owner {
        Owner::Guest(GuestId::generate())
    }

    #[tokio::test]
    async fn create_within_limits_stops_at_the_upload_threshold() {
        let store = InMemoryJobStore::new();
        let owner = guest_owner();
        let limits = UsageLimits {
            files_uploaded: 2,
            ..UsageLimits::GUEST_DEFAULT
        };
        for _ in 0..2 {
            store
                .create_within_limits(new_job(owner.clone()), Utc::now(), Duration::hours(1), &limits)
                .await
                .unwrap();
        }

        let third = store
            .create_within_limits(new_job(owner.clone()), Utc::now(), Duration::hours(1), &limits)
            .await;
        assert!(matches!(third, Err(JobStoreError::LimitExceeded(ref m)) if m == "Upload limit of 2 files reached"));
        assert_eq!(store.usage(&owner).await.unwrap().unwrap().files_uploaded, 2);
        assert_eq!(store.counts().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn create_records_upload_usage_atomically() {
        let store = InMemoryJobStore::new();
        let owner = guest_owner();
        let job = store.create(new_job(owner.clone()), Utc::now(), Duration::hours(24)).await.unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        let usage = store.usage(&owner).await.unwrap().unwrap();
        assert_eq!(usage.files_uploaded, 1);
        assert_eq!(usage.input_bytes, 2048);
        assert_eq!(usage.processing_types.get("speech_enhancement"), Some(&1));
    }

    #[tokio::test]
    async fn rejected_transition_leaves_row_and_usage_untouched() {
        let store = InMemoryJobStore::new();
        let owner = guest_owner();
        let job = store.create(new_job(owner.clone()), Utc::now(), Duration::hours(1)).await.unwrap();

        let err = store
            .transition(
                job.job_id,
                JobTransition::Complete { output_location: "/o".into(), output_bytes: 1, at: Utc::now() },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::InvalidTransition(_)));

        let after = store.get(job.job_id).await.unwrap().unwrap();
        assert_eq!(after, job);
        assert_eq!(store.usage(&owner).await.unwrap().unwrap().files_processed, 0);
    }

    #[tokio::test]
    async fn completion_applies_processed_usage() {
        let store = InMemoryJobStore::new();
        let owner = guest_owner();
        let job = store.create(new_job(owner.clone()), Utc::now(), Duration::hours(1)).await.unwrap();
        store.transition(job.job_id, JobTransition::Claim { at: Utc::now() }).await.unwrap();
        let done = store
            .transition(
                job.job_id,
                JobTransition::Complete { output_location: "/o".into(), output_bytes: 4096, at: Utc::now() },
            )
            .await
            .unwrap();

        assert_eq!(done.progress, 100);
        let usage = store.usage(&owner).await.unwrap().unwrap();
        assert_eq!(usage.files_processed, 1);
        assert_eq!(usage.output_bytes, 4096);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = InMemoryJobStore::new();
        let job = store.create(new_job(guest_owner()), Utc::now(), Duration::hours(1)).await.unwrap();
        assert!(store.delete(job.job_id).await.unwrap().is_some());
        assert!(store.delete(job.job_id).await.unwrap().is_none());
        assert!(store.get(job.job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_and_clamps_page_size() {
        let store = InMemoryJobStore::new();
        let owner = guest_owner();
        for _ in 0..3 {
            store.create(new_job(owner.clone()), Utc::now(), Duration::hours(1)).await.unwrap();
        }
        store.create(new_job(guest_owner()), Utc::now(), Duration::hours(1)).await.unwrap();

        let mine = store.list(&JobFilter::owned_by(owner.clone())).await.unwrap();
        assert_eq!(mine.len(), 3);

        let one = store
            .list(&JobFilter { limit: 0, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(one.len(), 1);

        let processing = store
            .list(&JobFilter { status: Some(JobStatus::Processing), ..Default::default() })
            .await
            .unwrap();
        assert!(processing.is_empty());
    }

    #[tokio::test]
    async fn expired_listing_skips_non_terminal_jobs() {
        let store = InMemoryJobStore::new();
        let past = Utc::now() - Duration::days(3);
        let pending = store.create(new_job(guest_owner()), past, Duration::hours(1)).await.unwrap();
        let failed = store.create(new_job(guest_owner()), past, Duration::hours(1)).await.unwrap();
        store
            .transition(failed.job_id, JobTransition::fail("bad input", None, past))
            .await
            .unwrap();

        let expired = store.list_expired_terminal(Utc::now(), 10).await.unwrap();
        let ids: Vec<JobId> = expired.iter().map(|j| j.job_id).collect();
        assert_eq!(ids, vec![failed.job_id]);
        assert!(!ids.contains(&pending.job_id));
    }

    #[tokio::test]
    async fn idle_expired_guest_is_deleted_only_without_jobs() {
        let store = InMemoryJobStore::new();
        let long_ago = Utc::now() - Duration::days(30);
        let busy = Guest::new(GuestId::generate(), long_ago, Duration::days(7));
        let idle = Guest::new(GuestId::generate(), long_ago, Duration::days(7));
        store.save_guest(&busy).await.unwrap();
        store.save_guest(&idle).await.unwrap();
        store
            .create(new_job(Owner::Guest(busy.guest_id.clone())), Utc::now(), Duration::hours(1))
            .await
            .unwrap();

        let now = Utc::now();
        assert!(!store.delete_guest_if_idle(&busy.guest_id, now).await.unwrap());
        assert!(store.delete_guest_if_idle(&idle.guest_id, now).await.unwrap());
        assert!(store.find_guest(&idle.guest_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn convert_guest_records_user() {
        let store = InMemoryJobStore::new();
        let guest = Guest::new(GuestId::generate(), Utc::now(), Duration::days(7));
        store.save_guest(&guest).await.unwrap();
        let user = UserId::new();

        let converted = store.convert_guest(&guest.guest_id, user).await.unwrap();
        assert_eq!(converted.converted_to_user_id, Some(user));
        let counts = store.count_guests(Utc::now()).await.unwrap();
        assert_eq!(counts.converted, 1);

        let missing = store.convert_guest(&GuestId::generate(), user).await.unwrap_err();
        assert!(matches!(missing, JobStoreError::GuestNotFound(_)));
    }
}
