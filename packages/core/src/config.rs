//! Queue configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::QueueError;

/// Configuration for queue behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Submit attempts per job before the EXIT path gives up.
    pub max_submit: u32,
    /// Basename of the failure sentinel, joined onto each job's run path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_file: Option<String>,
    /// Basename of the success sentinel. `None` skips OK confirmation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok_file: Option<String>,
    /// Total time to wait for the OK file after the driver reports done (seconds).
    pub max_ok_wait_secs: u64,
    /// Interval between OK-file checks (milliseconds).
    pub ok_poll_interval_ms: u64,
    /// Sleep between idle scheduling iterations (milliseconds).
    pub poll_interval_ms: u64,
    /// Maximum submissions per scheduling iteration.
    pub submit_batch_size: usize,
    /// Number of finalizer worker threads.
    pub finalizer_threads: usize,
    /// Initial number of job slots.
    pub initial_capacity: usize,
    /// Wall-clock limit for a running job (seconds), 0 = unlimited.
    pub max_job_duration_secs: u64,
    /// Consecutive driver rejections before a job is failed, 0 = unlimited.
    pub max_driver_failures: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_submit: 2,
            exit_file: Some("EXIT".to_string()),
            ok_file: None,
            max_ok_wait_secs: 60,
            ok_poll_interval_ms: 1000,
            poll_interval_ms: 250,
            submit_batch_size: 5,
            finalizer_threads: 16,
            initial_capacity: 16,
            max_job_duration_secs: 0,
            max_driver_failures: 0,
        }
    }
}

impl QueueConfig {
    /// Set the submit attempt limit.
    pub fn with_max_submit(mut self, max_submit: u32) -> Self {
        self.max_submit = max_submit;
        self
    }

    /// Set the EXIT sentinel basename.
    pub fn with_exit_file(mut self, exit_file: impl Into<String>) -> Self {
        self.exit_file = Some(exit_file.into());
        self
    }

    /// Do not look for an EXIT sentinel.
    pub fn without_exit_file(mut self) -> Self {
        self.exit_file = None;
        self
    }

    /// Require an OK sentinel with this basename.
    pub fn with_ok_file(mut self, ok_file: impl Into<String>) -> Self {
        self.ok_file = Some(ok_file.into());
        self
    }

    /// Set how long to wait for the OK file.
    pub fn with_max_ok_wait(mut self, wait: Duration) -> Self {
        self.max_ok_wait_secs = wait.as_secs();
        self
    }

    /// Set the OK-file poll interval.
    pub fn with_ok_poll_interval(mut self, interval: Duration) -> Self {
        self.ok_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the idle sleep between scheduling iterations.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the number of finalizer threads.
    pub fn with_finalizer_threads(mut self, threads: usize) -> Self {
        self.finalizer_threads = threads;
        self
    }

    /// Set the initial slot capacity.
    pub fn with_initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Set the driver rejection bound.
    pub fn with_max_driver_failures(mut self, failures: u32) -> Self {
        self.max_driver_failures = failures;
        self
    }

    pub fn max_ok_wait(&self) -> Duration {
        Duration::from_secs(self.max_ok_wait_secs)
    }

    pub fn ok_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ok_poll_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Running-time limit, if any.
    pub fn max_job_duration(&self) -> Option<Duration> {
        (self.max_job_duration_secs > 0).then(|| Duration::from_secs(self.max_job_duration_secs))
    }

    /// Reject values the queue cannot operate with.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_submit == 0 {
            return Err(QueueError::Config("max_submit must be at least 1".into()));
        }
        if self.finalizer_threads == 0 {
            return Err(QueueError::Config("finalizer_threads must be at least 1".into()));
        }
        if self.submit_batch_size == 0 {
            return Err(QueueError::Config("submit_batch_size must be at least 1".into()));
        }
        if self.initial_capacity == 0 {
            return Err(QueueError::Config("initial_capacity must be at least 1".into()));
        }
        Ok(())
    }

    /// Parse a JSON document; missing keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self, QueueError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| QueueError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a config from environment variables.
    ///
    /// Recognized variables (all optional):
    /// - `JOBQ_MAX_SUBMIT`
    /// - `JOBQ_EXIT_FILE`, `JOBQ_OK_FILE` (empty value unsets the sentinel)
    /// - `JOBQ_MAX_OK_WAIT_SECS`
    /// - `JOBQ_POLL_INTERVAL_MS`
    /// - `JOBQ_FINALIZER_THREADS`
    /// - `JOBQ_MAX_JOB_DURATION_SECS`
    pub fn from_env() -> Result<Self, QueueError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`QueueConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, QueueError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("JOBQ_MAX_SUBMIT") {
            config.max_submit = parse_var("JOBQ_MAX_SUBMIT", &v)?;
        }
        if let Some(v) = lookup("JOBQ_EXIT_FILE") {
            config.exit_file = non_empty(v);
        }
        if let Some(v) = lookup("JOBQ_OK_FILE") {
            config.ok_file = non_empty(v);
        }
        if let Some(v) = lookup("JOBQ_MAX_OK_WAIT_SECS") {
            config.max_ok_wait_secs = parse_var("JOBQ_MAX_OK_WAIT_SECS", &v)?;
        }
        if let Some(v) = lookup("JOBQ_POLL_INTERVAL_MS") {
            config.poll_interval_ms = parse_var("JOBQ_POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("JOBQ_FINALIZER_THREADS") {
            config.finalizer_threads = parse_var("JOBQ_FINALIZER_THREADS", &v)?;
        }
        if let Some(v) = lookup("JOBQ_MAX_JOB_DURATION_SECS") {
            config.max_job_duration_secs = parse_var("JOBQ_MAX_JOB_DURATION_SECS", &v)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T, QueueError> {
    value
        .trim()
        .parse()
        .map_err(|_| QueueError::Config(format!("{key}: cannot parse '{value}'")))
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
