//! Usage Aggregator: per-owner counters and limit policy.
//!
//! Increments that belong to a job transition are applied by the job store in
//! the same atomic unit as the transition. This type covers the rest
//! (downloads, API calls), reads, and deterministic limit checks.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use audioflow_auth::Principal;
use audioflow_jobs::{
    LimitCheck, LimitKind, Owner, UsageDelta, UsageLimits, UsageReport, UsageStats, check_limit,
};

use crate::store::{JobStoreError, PipelineStore};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Sums across every owner, for the admin overview.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub owners: u64,
    pub guest_owners: u64,
    pub files_uploaded: u64,
    pub files_processed: u64,
    pub files_failed: u64,
    pub files_downloaded: u64,
    pub input_size_mb: f64,
    pub output_size_mb: f64,
    pub processing_minutes: f64,
    pub api_calls: u64,
    pub processing_types: BTreeMap<String, u64>,
}

impl UsageTotals {
    fn from_rows(rows: &[UsageStats]) -> Self {
        let mut totals = UsageTotals::default();
        let mut input_bytes = 0u64;
        let mut output_bytes = 0u64;
        let mut seconds = 0.0;
        for row in rows {
            totals.owners += 1;
            if row.owner.is_guest() {
                totals.guest_owners += 1;
            }
            totals.files_uploaded += row.files_uploaded;
            totals.files_processed += row.files_processed;
            totals.files_failed += row.files_failed;
            totals.files_downloaded += row.files_downloaded;
            totals.api_calls += row.api_calls;
            input_bytes = input_bytes.saturating_add(row.input_bytes);
            output_bytes = output_bytes.saturating_add(row.output_bytes);
            seconds += row.processing_seconds;
            for (kind, count) in &row.processing_types {
                *totals.processing_types.entry(kind.clone()).or_default() += count;
            }
        }
        totals.input_size_mb = round2(input_bytes as f64 / BYTES_PER_MB);
        totals.output_size_mb = round2(output_bytes as f64 / BYTES_PER_MB);
        totals.processing_minutes = round2(seconds / 60.0);
        totals
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[derive(Clone)]
pub struct UsageAggregator {
    store: Arc<dyn PipelineStore>,
    guest_limits: UsageLimits,
    user_limits: UsageLimits,
}

impl UsageAggregator {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self {
            store,
            guest_limits: UsageLimits::GUEST_DEFAULT,
            user_limits: UsageLimits::USER_DEFAULT,
        }
    }

    pub fn with_limits(mut self, guest_limits: UsageLimits, user_limits: UsageLimits) -> Self {
        self.guest_limits = guest_limits;
        self.user_limits = user_limits;
        self
    }

    /// Atomic counter increment for one owner.
    pub async fn increment(&self, owner: &Owner, delta: &UsageDelta, now: DateTime<Utc>) -> Result<UsageStats, JobStoreError> {
        self.store.increment(owner, delta, now).await
    }

    /// Current counters; zeroed if the owner has no activity yet.
    pub async fn snapshot(&self, owner: &Owner, now: DateTime<Utc>) -> Result<UsageStats, JobStoreError> {
        Ok(self
            .store
            .usage(owner)
            .await?
            .unwrap_or_else(|| UsageStats::empty(owner.clone(), now)))
    }

    pub async fn report(&self, owner: &Owner, now: DateTime<Utc>) -> Result<UsageReport, JobStoreError> {
        Ok(self.snapshot(owner, now).await?.report())
    }

    /// Compare one counter against a caller-supplied threshold.
    pub async fn check_limit(
        &self,
        owner: &Owner,
        kind: LimitKind,
        threshold: u64,
        now: DateTime<Utc>,
    ) -> Result<LimitCheck, JobStoreError> {
        let stats = self.snapshot(owner, now).await?;
        Ok(check_limit(&stats, kind, threshold))
    }

    pub fn limits_for(&self, principal: &Principal) -> UsageLimits {
        if principal.is_guest() {
            self.guest_limits
        } else {
            self.user_limits
        }
    }

    /// Every configured limit for the principal's class.
    pub async fn check_limits(&self, principal: &Principal, now: DateTime<Utc>) -> Result<Vec<LimitCheck>, JobStoreError> {
        let stats = self.snapshot(&principal.owner(), now).await?;
        Ok(self.limits_for(principal).check_all(&stats))
    }

    pub async fn totals(&self) -> Result<UsageTotals, JobStoreError> {
        let rows = self.store.list_usage().await?;
        Ok(UsageTotals::from_rows(&rows))
    }
}
