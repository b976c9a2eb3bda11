//! Pipeline configuration from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::debug;

use crate::retry::RetryPolicy;

pub const STORAGE_PATH_ENV: &str = "DOCBATCH_STORAGE_PATH";
pub const WORKERS_ENV: &str = "DOCBATCH_WORKERS";
pub const MAX_ATTEMPTS_ENV: &str = "DOCBATCH_MAX_ATTEMPTS";
pub const RETRY_BASE_MS_ENV: &str = "DOCBATCH_RETRY_BASE_MS";
pub const RETRY_MAX_MS_ENV: &str = "DOCBATCH_RETRY_MAX_MS";
pub const POLL_INTERVAL_MS_ENV: &str = "DOCBATCH_POLL_INTERVAL_MS";
pub const SWEEP_INTERVAL_SECS_ENV: &str = "DOCBATCH_SWEEP_INTERVAL_SECS";
pub const FINALIZE_LEASE_SECS_ENV: &str = "DOCBATCH_FINALIZE_LEASE_SECS";
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
pub const REDIS_URL_ENV: &str = "REDIS_URL";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}")]
    Parse { key: &'static str, value: String },

    #[error("{key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root of the staging area (inputs, outputs, bundles).
    pub storage_path: PathBuf,
    /// Worker threads in the pool.
    pub workers: usize,
    pub retry: RetryPolicy,
    /// How long an idle worker blocks on the queue before re-checking
    /// for shutdown.
    pub poll_interval: Duration,
    /// Period of the sweep that finalizes jobs whose last completion
    /// signal was lost.
    pub sweep_interval: Duration,
    /// How long a finalization claim holds before another process may
    /// take the job over.
    pub finalize_lease: Duration,
    /// PostgreSQL job store when set; in-memory otherwise.
    pub database_url: Option<String>,
    /// Redis Streams queue when set (requires the `redis` feature).
    pub redis_url: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./storage"),
            workers: 4,
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_millis(100),
            sweep_interval: Duration::from_secs(30),
            finalize_lease: crate::finalizer::DEFAULT_FINALIZE_LEASE,
            database_url: None,
            redis_url: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = get(STORAGE_PATH_ENV) {
            config.storage_path = PathBuf::from(path);
        }
        if let Some(workers) = parse(&get, WORKERS_ENV)? {
            config.workers = workers;
        }
        if let Some(max_attempts) = parse(&get, MAX_ATTEMPTS_ENV)? {
            config.retry.max_attempts = max_attempts;
        }
        if let Some(ms) = parse::<u64, _>(&get, RETRY_BASE_MS_ENV)? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64, _>(&get, RETRY_MAX_MS_ENV)? {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64, _>(&get, POLL_INTERVAL_MS_ENV)? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64, _>(&get, SWEEP_INTERVAL_SECS_ENV)? {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64, _>(&get, FINALIZE_LEASE_SECS_ENV)? {
            config.finalize_lease = Duration::from_secs(secs);
        }
        config.database_url = get(DATABASE_URL_ENV);
        config.redis_url = get(REDIS_URL_ENV);

        config.validate()?;
        debug!(
            storage_path = %config.storage_path.display(),
            workers = config.workers,
            max_attempts = config.retry.max_attempts,
            persistent_store = config.database_url.is_some(),
            redis_queue = config.redis_url.is_some(),
            "pipeline configuration loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                key: WORKERS_ENV,
                reason: "at least one worker is required".into(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: MAX_ATTEMPTS_ENV,
                reason: "at least one attempt is required".into(),
            });
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::Invalid {
                key: RETRY_MAX_MS_ENV,
                reason: "must not be smaller than the base delay".into(),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: POLL_INTERVAL_MS_ENV,
                reason: "must be positive".into(),
            });
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: SWEEP_INTERVAL_SECS_ENV,
                reason: "must be positive".into(),
            });
        }
        if self.finalize_lease.is_zero() {
            return Err(ConfigError::Invalid {
                key: FINALIZE_LEASE_SECS_ENV,
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

fn parse<T, G>(get: &G, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Parse { key, value })
        })
        .transpose()
}
