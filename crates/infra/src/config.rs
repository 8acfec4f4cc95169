//! Environment-driven configuration.
//!
//! Every setting is read from an `AUDIOFLOW_*` variable and has a default
//! suitable for local runs. `from_lookup` takes any key → value function so
//! tests do not have to touch the process environment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use audioflow_auth::ExpiredGuestPolicy;
use audioflow_jobs::{ProcessingType, UsageLimits};

use crate::retry::RetryPolicy;
use crate::service::UploadPolicy;
use crate::workers::WorkerConfig;

const PREFIX: &str = "AUDIOFLOW_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid { key: String, value: String, reason: String },
}

impl ConfigError {
    fn invalid(key: &str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Which queue backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    Memory,
    Postgres,
    Redis,
}

impl FromStr for QueueBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(QueueBackend::Memory),
            "postgres" => Ok(QueueBackend::Postgres),
            "redis" => Ok(QueueBackend::Redis),
            other => Err(format!("expected memory, postgres or redis, got '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub bind_addr: String,
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
    pub max_upload_mb: u64,
    pub allowed_formats: Vec<String>,
    pub retention_hours: i64,
    pub guest_ttl_days: i64,
    pub expired_guest_policy: ExpiredGuestPolicy,
    pub processing_timeout: Duration,
    pub visibility_timeout: Duration,
    pub max_deliveries: u32,
    pub worker_count: usize,
    pub sweep_interval: Duration,
    /// Backoff for transient store and queue failures
    pub retry: RetryPolicy,
    pub guest_limits: UsageLimits,
    pub user_limits: UsageLimits,
    /// Postgres store; in-memory when unset
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub queue_backend: QueueBackend,
    pub jwt_secret: String,
    /// Command templates keyed by processing type
    pub processors: HashMap<ProcessingType, String>,
    /// Register a copy-through processor for types without a command
    pub passthrough_processors: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            upload_dir: PathBuf::from("./uploads"),
            output_dir: PathBuf::from("./processed_audio"),
            max_upload_mb: 100,
            allowed_formats: ["wav", "mp3", "flac", "m4a", "ogg"].map(String::from).to_vec(),
            retention_hours: 24,
            guest_ttl_days: 7,
            expired_guest_policy: ExpiredGuestPolicy::Renew,
            processing_timeout: Duration::from_secs(3300),
            visibility_timeout: Duration::from_secs(3600),
            max_deliveries: 5,
            worker_count: 2,
            sweep_interval: Duration::from_secs(3600),
            retry: RetryPolicy::default(),
            guest_limits: UsageLimits::GUEST_DEFAULT,
            user_limits: UsageLimits::USER_DEFAULT,
            database_url: None,
            redis_url: None,
            queue_backend: QueueBackend::Memory,
            jwt_secret: "dev-secret".to_string(),
            processors: HashMap::new(),
            passthrough_processors: false,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let d = Self::default();

        let database_url = env.string("DATABASE_URL");
        let redis_url = env.string("REDIS_URL");
        let default_backend = if redis_url.is_some() {
            QueueBackend::Redis
        } else if database_url.is_some() {
            QueueBackend::Postgres
        } else {
            QueueBackend::Memory
        };

        let mut processors = HashMap::new();
        for kind in ProcessingType::ALL {
            let key = format!("PROCESSOR_{}", kind.as_str().to_ascii_uppercase());
            if let Some(template) = env.string(&key) {
                processors.insert(kind, template);
            }
        }

        let cfg = Self {
            bind_addr: env.string("BIND_ADDR").unwrap_or(d.bind_addr),
            upload_dir: env.string("UPLOAD_DIR").map(PathBuf::from).unwrap_or(d.upload_dir),
            output_dir: env.string("OUTPUT_DIR").map(PathBuf::from).unwrap_or(d.output_dir),
            max_upload_mb: env.parse("MAX_UPLOAD_MB")?.unwrap_or(d.max_upload_mb),
            allowed_formats: env
                .string("ALLOWED_FORMATS")
                .map(|raw| parse_formats(&raw))
                .unwrap_or(d.allowed_formats),
            retention_hours: env.parse("RETENTION_HOURS")?.unwrap_or(d.retention_hours),
            guest_ttl_days: env.parse("GUEST_TTL_DAYS")?.unwrap_or(d.guest_ttl_days),
            expired_guest_policy: env.parse("EXPIRED_GUEST_POLICY")?.unwrap_or(d.expired_guest_policy),
            processing_timeout: env.secs("PROCESSING_TIMEOUT_SECS")?.unwrap_or(d.processing_timeout),
            visibility_timeout: env.secs("VISIBILITY_TIMEOUT_SECS")?.unwrap_or(d.visibility_timeout),
            max_deliveries: env.parse("MAX_DELIVERIES")?.unwrap_or(d.max_deliveries),
            worker_count: env.parse("WORKER_COUNT")?.unwrap_or(d.worker_count),
            sweep_interval: env.secs("SWEEP_INTERVAL_SECS")?.unwrap_or(d.sweep_interval),
            retry: RetryPolicy {
                max_attempts: env.parse("RETRY_ATTEMPTS")?.unwrap_or(d.retry.max_attempts),
                base_delay: env.millis("RETRY_BASE_DELAY_MS")?.unwrap_or(d.retry.base_delay),
                max_delay: env.millis("RETRY_MAX_DELAY_MS")?.unwrap_or(d.retry.max_delay),
                strategy: env.parse("RETRY_BACKOFF")?.unwrap_or(d.retry.strategy),
            },
            guest_limits: UsageLimits {
                files_uploaded: env.parse("GUEST_MAX_FILES")?.unwrap_or(d.guest_limits.files_uploaded),
                storage_mb: env.parse("GUEST_MAX_STORAGE_MB")?.unwrap_or(d.guest_limits.storage_mb),
                processing_minutes: env
                    .parse("GUEST_MAX_PROCESSING_MINUTES")?
                    .unwrap_or(d.guest_limits.processing_minutes),
            },
            user_limits: UsageLimits {
                files_uploaded: env.parse("USER_MAX_FILES")?.unwrap_or(d.user_limits.files_uploaded),
                storage_mb: env.parse("USER_MAX_STORAGE_MB")?.unwrap_or(d.user_limits.storage_mb),
                processing_minutes: env
                    .parse("USER_MAX_PROCESSING_MINUTES")?
                    .unwrap_or(d.user_limits.processing_minutes),
            },
            queue_backend: env.parse("QUEUE_BACKEND")?.unwrap_or(default_backend),
            database_url,
            redis_url,
            jwt_secret: env.string("JWT_SECRET").unwrap_or(d.jwt_secret),
            processors,
            passthrough_processors: env.parse("PASSTHROUGH_PROCESSORS")?.unwrap_or(d.passthrough_processors),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_upload_mb == 0 {
            return Err(ConfigError::invalid("AUDIOFLOW_MAX_UPLOAD_MB", "0", "must be positive"));
        }
        if self.allowed_formats.is_empty() {
            return Err(ConfigError::invalid("AUDIOFLOW_ALLOWED_FORMATS", "", "at least one format required"));
        }
        if self.processing_timeout.is_zero() {
            return Err(ConfigError::invalid("AUDIOFLOW_PROCESSING_TIMEOUT_SECS", "0", "must be positive"));
        }
        if self.max_deliveries == 0 {
            return Err(ConfigError::invalid("AUDIOFLOW_MAX_DELIVERIES", "0", "must be positive"));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(ConfigError::invalid(
                "AUDIOFLOW_RETRY_MAX_DELAY_MS",
                &self.retry.max_delay.as_millis().to_string(),
                "must not be below AUDIOFLOW_RETRY_BASE_DELAY_MS",
            ));
        }
        if self.queue_backend == QueueBackend::Postgres && self.database_url.is_none() {
            return Err(ConfigError::invalid(
                "AUDIOFLOW_QUEUE_BACKEND",
                "postgres",
                "requires AUDIOFLOW_DATABASE_URL",
            ));
        }
        if self.queue_backend == QueueBackend::Redis && self.redis_url.is_none() {
            return Err(ConfigError::invalid("AUDIOFLOW_QUEUE_BACKEND", "redis", "requires AUDIOFLOW_REDIS_URL"));
        }
        Ok(())
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours)
    }

    pub fn guest_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.guest_ttl_days)
    }

    /// Processing jobs older than this are considered abandoned by the sweeper.
    pub fn stall_after(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.processing_timeout * 2).unwrap_or(chrono::Duration::hours(2))
    }

    pub fn upload_policy(&self) -> UploadPolicy {
        UploadPolicy {
            max_upload_bytes: self.max_upload_mb * 1024 * 1024,
            allowed_formats: self.allowed_formats.clone(),
            retention: self.retention(),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_processing_timeout(self.processing_timeout)
            .with_max_deliveries(self.max_deliveries)
            .with_retry(self.retry.clone())
    }
}

fn parse_formats(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|f| f.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|f| !f.is_empty())
        .collect()
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{PREFIX}{name}")).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(name) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::invalid(&format!("{PREFIX}{name}"), &raw, e.to_string())),
        }
    }

    fn secs(&self, name: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_secs))
    }

    fn millis(&self, name: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_millis))
    }
}
