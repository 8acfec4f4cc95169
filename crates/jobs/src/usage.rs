//! Per-owner usage counters, increments and limit checks.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use audioflow_core::DomainError;

use crate::job::Owner;
use crate::processing::ProcessingType;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Small structured increment applied to a [`UsageStats`] row.
///
/// Fields are signed so reconciliation can issue corrective deltas.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageDelta {
    pub files_uploaded: i64,
    pub files_processed: i64,
    pub files_failed: i64,
    pub files_downloaded: i64,
    pub input_bytes: i64,
    pub output_bytes: i64,
    pub processing_seconds: f64,
    pub api_calls: i64,
    /// Processing-type label → count increment
    pub processing_types: BTreeMap<String, i64>,
    pub upload_at: Option<DateTime<Utc>>,
    pub download_at: Option<DateTime<Utc>>,
    pub api_call_at: Option<DateTime<Utc>>,
}

impl UsageDelta {
    pub fn upload(bytes: u64, processing_type: ProcessingType, at: DateTime<Utc>) -> Self {
        let mut processing_types = BTreeMap::new();
        processing_types.insert(processing_type.as_str().to_string(), 1);
        Self {
            files_uploaded: 1,
            input_bytes: saturating_i64(bytes),
            processing_types,
            upload_at: Some(at),
            ..Default::default()
        }
    }

    pub fn processed(output_bytes: u64, seconds: f64) -> Self {
        Self {
            files_processed: 1,
            output_bytes: saturating_i64(output_bytes),
            processing_seconds: seconds,
            ..Default::default()
        }
    }

    pub fn failed(seconds: f64) -> Self {
        Self {
            files_failed: 1,
            processing_seconds: seconds,
            ..Default::default()
        }
    }

    pub fn download(at: DateTime<Utc>) -> Self {
        Self {
            files_downloaded: 1,
            download_at: Some(at),
            ..Default::default()
        }
    }

    pub fn api_call(at: DateTime<Utc>) -> Self {
        Self {
            api_calls: 1,
            api_call_at: Some(at),
            ..Default::default()
        }
    }

    /// Latest timestamp carried by this delta, if any.
    pub fn activity_at(&self) -> Option<DateTime<Utc>> {
        [self.upload_at, self.download_at, self.api_call_at]
            .into_iter()
            .flatten()
            .max()
    }
}

fn saturating_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn add_signed(counter: u64, delta: i64) -> u64 {
    if delta >= 0 {
        counter.saturating_add(delta as u64)
    } else {
        counter.saturating_sub(delta.unsigned_abs())
    }
}

/// Cumulative counters for one owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub owner: Owner,
    pub files_uploaded: u64,
    pub files_processed: u64,
    pub files_failed: u64,
    pub files_downloaded: u64,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub processing_seconds: f64,
    pub processing_types: BTreeMap<String, u64>,
    pub api_calls: u64,
    pub first_upload_at: Option<DateTime<Utc>>,
    pub last_upload_at: Option<DateTime<Utc>>,
    pub last_download_at: Option<DateTime<Utc>>,
    pub last_api_call_at: Option<DateTime<Utc>>,
    pub first_activity_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl UsageStats {
    /// Zeroed counters for an owner seen for the first time.
    pub fn empty(owner: Owner, now: DateTime<Utc>) -> Self {
        Self {
            owner,
            files_uploaded: 0,
            files_processed: 0,
            files_failed: 0,
            files_downloaded: 0,
            input_bytes: 0,
            output_bytes: 0,
            processing_seconds: 0.0,
            processing_types: BTreeMap::new(),
            api_calls: 0,
            first_upload_at: None,
            last_upload_at: None,
            last_download_at: None,
            last_api_call_at: None,
            first_activity_at: now,
            last_activity_at: now,
        }
    }

    /// Apply an increment in place.
    ///
    /// Callers must hold whatever lock/transaction makes this atomic with the
    /// job change that produced the delta.
    pub fn apply(&mut self, delta: &UsageDelta, now: DateTime<Utc>) {
        self.files_uploaded = add_signed(self.files_uploaded, delta.files_uploaded);
        self.files_processed = add_signed(self.files_processed, delta.files_processed);
        self.files_failed = add_signed(self.files_failed, delta.files_failed);
        self.files_downloaded = add_signed(self.files_downloaded, delta.files_downloaded);
        self.input_bytes = add_signed(self.input_bytes, delta.input_bytes);
        self.output_bytes = add_signed(self.output_bytes, delta.output_bytes);
        self.processing_seconds = (self.processing_seconds + delta.processing_seconds).max(0.0);
        self.api_calls = add_signed(self.api_calls, delta.api_calls);

        for (label, n) in &delta.processing_types {
            let entry = self.processing_types.entry(label.clone()).or_insert(0);
            *entry = add_signed(*entry, *n);
        }

        if let Some(at) = delta.upload_at {
            self.first_upload_at.get_or_insert(at);
            self.last_upload_at = Some(at);
        }
        if let Some(at) = delta.download_at {
            self.last_download_at = Some(at);
        }
        if let Some(at) = delta.api_call_at {
            self.last_api_call_at = Some(at);
        }
        self.last_activity_at = delta.activity_at().unwrap_or(now).max(self.last_activity_at);
    }

    pub fn counter(&self, kind: LimitKind) -> f64 {
        match kind {
            LimitKind::FilesUploaded => self.files_uploaded as f64,
            LimitKind::StorageMb => self.input_bytes as f64 / BYTES_PER_MB,
            LimitKind::ProcessingMinutes => self.processing_seconds / 60.0,
        }
    }

    /// Derived, presentation-ready metrics.
    pub fn report(&self) -> UsageReport {
        let finished = self.files_processed + self.files_failed;
        UsageReport {
            owner: self.owner.clone(),
            files_uploaded: self.files_uploaded,
            files_processed: self.files_processed,
            files_failed: self.files_failed,
            files_downloaded: self.files_downloaded,
            input_size_mb: round2(self.input_bytes as f64 / BYTES_PER_MB),
            output_size_mb: round2(self.output_bytes as f64 / BYTES_PER_MB),
            average_file_size_mb: if self.files_uploaded > 0 {
                round2(self.input_bytes as f64 / self.files_uploaded as f64 / BYTES_PER_MB)
            } else {
                0.0
            },
            processing_minutes: round2(self.processing_seconds / 60.0),
            average_processing_seconds: if self.files_processed > 0 {
                round2(self.processing_seconds / self.files_processed as f64)
            } else {
                0.0
            },
            success_rate_percent: if finished > 0 {
                round2(self.files_processed as f64 / finished as f64 * 100.0)
            } else {
                0.0
            },
            processing_types: self.processing_types.clone(),
            api_calls: self.api_calls,
            first_upload_at: self.first_upload_at,
            last_upload_at: self.last_upload_at,
            last_download_at: self.last_download_at,
            last_api_call_at: self.last_api_call_at,
            first_activity_at: self.first_activity_at,
            last_activity_at: self.last_activity_at,
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Snapshot with derived metrics, as served to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub owner: Owner,
    pub files_uploaded: u64,
    pub files_processed: u64,
    pub files_failed: u64,
    pub files_downloaded: u64,
    pub input_size_mb: f64,
    pub output_size_mb: f64,
    pub average_file_size_mb: f64,
    pub processing_minutes: f64,
    pub average_processing_seconds: f64,
    pub success_rate_percent: f64,
    pub processing_types: BTreeMap<String, u64>,
    pub api_calls: u64,
    pub first_upload_at: Option<DateTime<Utc>>,
    pub last_upload_at: Option<DateTime<Utc>>,
    pub last_download_at: Option<DateTime<Utc>>,
    pub last_api_call_at: Option<DateTime<Utc>>,
    pub first_activity_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Named counter a limit can be checked against.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    FilesUploaded,
    StorageMb,
    ProcessingMinutes,
}

impl LimitKind {
    pub const ALL: [LimitKind; 3] = [
        LimitKind::FilesUploaded,
        LimitKind::StorageMb,
        LimitKind::ProcessingMinutes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::FilesUploaded => "files_uploaded",
            LimitKind::StorageMb => "storage_mb",
            LimitKind::ProcessingMinutes => "processing_minutes",
        }
    }
}

impl core::str::FromStr for LimitKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "files_uploaded" | "files_per_day" => Ok(LimitKind::FilesUploaded),
            "storage_mb" => Ok(LimitKind::StorageMb),
            "processing_minutes" => Ok(LimitKind::ProcessingMinutes),
            other => Err(DomainError::validation(format!("unknown limit kind '{other}'"))),
        }
    }
}

/// Outcome of a single limit check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitCheck {
    pub kind: LimitKind,
    pub limit: u64,
    pub within_limit: bool,
    pub message: String,
}

/// Compare a named counter against a caller-supplied threshold.
///
/// Deterministic: depends only on the snapshot and the threshold. A counter
/// that has *reached* the threshold is over the limit (the next upload would
/// exceed it).
pub fn check_limit(stats: &UsageStats, kind: LimitKind, threshold: u64) -> LimitCheck {
    let within_limit = stats.counter(kind) < threshold as f64;
    let message = if within_limit {
        "Within limits".to_string()
    } else {
        match kind {
            LimitKind::FilesUploaded => format!("Upload limit of {threshold} files reached"),
            LimitKind::StorageMb => format!("Storage limit of {threshold}MB reached"),
            LimitKind::ProcessingMinutes => {
                format!("Processing time limit of {threshold} minutes reached")
            }
        }
    };
    LimitCheck {
        kind,
        limit: threshold,
        within_limit,
        message,
    }
}

/// Thresholds for one class of principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLimits {
    pub files_uploaded: u64,
    pub storage_mb: u64,
    pub processing_minutes: u64,
}

impl UsageLimits {
    pub const GUEST_DEFAULT: UsageLimits = UsageLimits {
        files_uploaded: 5,
        storage_mb: 50,
        processing_minutes: 10,
    };

    pub const USER_DEFAULT: UsageLimits = UsageLimits {
        files_uploaded: 100,
        storage_mb: 1000,
        processing_minutes: 60,
    };

    pub fn threshold(&self, kind: LimitKind) -> u64 {
        match kind {
            LimitKind::FilesUploaded => self.files_uploaded,
            LimitKind::StorageMb => self.storage_mb,
            LimitKind::ProcessingMinutes => self.processing_minutes,
        }
    }

    pub fn check_all(&self, stats: &UsageStats) -> Vec<LimitCheck> {
        LimitKind::ALL
            .into_iter()
            .map(|k| check_limit(stats, k, self.threshold(k)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audioflow_core::{GuestId, UserId};

    fn stats() -> UsageStats {
        UsageStats::empty(Owner::User(UserId::new()), Utc::now())
    }

    #[test]
    fn upload_delta_counts_bytes_and_type() {
        let mut s = stats();
        let now = Utc::now();
        s.apply(&UsageDelta::upload(2048, ProcessingType::SpeechSeparation, now), now);
        s.apply(&UsageDelta::upload(1024, ProcessingType::SpeechSeparation, now), now);

        assert_eq!(s.files_uploaded, 2);
        assert_eq!(s.input_bytes, 3072);
        assert_eq!(s.processing_types.get("speech_separation"), Some(&2));
        assert_eq!(s.first_upload_at, Some(now));
    }

    #[test]
    fn negative_deltas_saturate_at_zero() {
        let mut s = stats();
        let delta = UsageDelta {
            files_processed: -3,
            ..Default::default()
        };
        s.apply(&delta, Utc::now());
        assert_eq!(s.files_processed, 0);
    }

    #[test]
    fn report_derives_rates() {
        let mut s = UsageStats::empty(Owner::Guest(GuestId::generate()), Utc::now());
        s.apply(&UsageDelta::processed(0, 30.0), Utc::now());
        s.apply(&UsageDelta::processed(0, 10.0), Utc::now());
        s.apply(&UsageDelta::failed(0.0), Utc::now());

        let r = s.report();
        assert_eq!(r.success_rate_percent, 66.67);
        assert_eq!(r.average_processing_seconds, 20.0);
    }

    #[test]
    fn limit_is_reached_at_threshold() {
        let mut s = stats();
        let now = Utc::now();
        for _ in 0..5 {
            s.apply(&UsageDelta::upload(1, ProcessingType::SpeechEnhancement, now), now);
        }
        let check = check_limit(&s, LimitKind::FilesUploaded, 5);
        assert!(!check.within_limit);
        assert_eq!(check.message, "Upload limit of 5 files reached");
        assert!(check_limit(&s, LimitKind::FilesUploaded, 6).within_limit);
    }

    #[test]
    fn storage_limit_uses_megabytes() {
        let mut s = stats();
        let now = Utc::now();
        s.apply(
            &UsageDelta::upload(60 * 1024 * 1024, ProcessingType::SpeechEnhancement, now),
            now,
        );
        let checks = UsageLimits::GUEST_DEFAULT.check_all(&s);
        let storage = checks.iter().find(|c| c.kind == LimitKind::StorageMb).unwrap();
        assert!(!storage.within_limit);
        assert!(checks.iter().any(|c| c.kind == LimitKind::ProcessingMinutes && c.within_limit));
    }

    #[test]
    fn limit_kind_accepts_legacy_alias() {
        assert_eq!("files_per_day".parse::<LimitKind>().unwrap(), LimitKind::FilesUploaded);
    }
}
