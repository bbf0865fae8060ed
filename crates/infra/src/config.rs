//! Job system configuration.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::jobs::{RetryPolicy, WorkerConfig};

/// Queue, retry and worker settings, loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct JobConfig {
    /// Delivery ceiling per task (default: `3`).
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt (default: 5s).
    pub backoff_base: Duration,
    /// Retry delay cap (default: 5 min).
    pub backoff_max: Duration,
    /// Lease length before a silent worker's task is redelivered (default: 5 min).
    pub lease_duration: Duration,
    /// Per-stage execution timeout (default: 120s).
    pub stage_timeout: Duration,
    /// Workers per instance (default: `2`).
    pub worker_concurrency: usize,
    /// Idle poll interval (default: 250ms).
    pub poll_interval: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(5_000),
            backoff_max: Duration::from_millis(300_000),
            lease_duration: Duration::from_secs(300),
            stage_timeout: Duration::from_secs(120),
            worker_concurrency: 2,
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl JobConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var               | Default  |
    /// |-----------------------|----------|
    /// | `JOB_MAX_ATTEMPTS`    | `3`      |
    /// | `JOB_BACKOFF_BASE_MS` | `5000`   |
    /// | `JOB_BACKOFF_MAX_MS`  | `300000` |
    /// | `JOB_LEASE_SECS`      | `300`    |
    /// | `STAGE_TIMEOUT_SECS`  | `120`    |
    /// | `WORKER_CONCURRENCY`  | `2`      |
    /// | `WORKER_POLL_MS`      | `250`    |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`JobConfig::from_env`] with a custom variable source.
    /// Unparseable or zero values fall back to the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let config = Self {
            max_attempts: positive(&lookup, "JOB_MAX_ATTEMPTS", d.max_attempts),
            backoff_base: Duration::from_millis(positive(
                &lookup,
                "JOB_BACKOFF_BASE_MS",
                d.backoff_base.as_millis() as u64,
            )),
            backoff_max: Duration::from_millis(positive(
                &lookup,
                "JOB_BACKOFF_MAX_MS",
                d.backoff_max.as_millis() as u64,
            )),
            lease_duration: Duration::from_secs(positive(&lookup, "JOB_LEASE_SECS", d.lease_duration.as_secs())),
            stage_timeout: Duration::from_secs(positive(&lookup, "STAGE_TIMEOUT_SECS", d.stage_timeout.as_secs())),
            worker_concurrency: positive(&lookup, "WORKER_CONCURRENCY", d.worker_concurrency),
            poll_interval: Duration::from_millis(positive(
                &lookup,
                "WORKER_POLL_MS",
                d.poll_interval.as_millis() as u64,
            )),
        };

        if !config.lease_outlasts_stage() {
            warn!(
                lease_secs = config.lease_duration.as_secs(),
                stage_timeout_secs = config.stage_timeout.as_secs(),
                "JOB_LEASE_SECS is shorter than STAGE_TIMEOUT_SECS; a worker that stalls mid-stage is only detected after its lease lapses"
            );
        }
        config
    }

    /// Whether one lease covers a full stage without renewal. Workers renew
    /// while they run, so this only bounds how long a stalled one is trusted.
    pub fn lease_outlasts_stage(&self) -> bool {
        self.lease_duration >= self.stage_timeout
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.backoff_base, self.backoff_max)
    }

    pub fn worker_config(&self, name: impl Into<String>) -> WorkerConfig {
        WorkerConfig {
            name: name.into(),
            lease_duration: self.lease_duration,
            stage_timeout: self.stage_timeout,
            poll_interval: self.poll_interval,
            retry: self.retry_policy(),
        }
    }
}

fn positive<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + PartialOrd + Default + Copy + core::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(v) if v > T::default() => v,
        _ => {
            warn!(key, value = %raw, default = %default, "invalid configuration value; using default");
            default
        }
    }
}
