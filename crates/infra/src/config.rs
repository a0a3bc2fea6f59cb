//! Environment-driven configuration for a worker process.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use taskq_core::{RetryPolicy, WorkerId};

use crate::queue::PollLoopConfig;

pub const ENV_POLL_INTERVAL_MS: &str = "TASKQ_POLL_INTERVAL_MS";
pub const ENV_STALE_AFTER_SECS: &str = "TASKQ_STALE_AFTER_SECS";
pub const ENV_CLAIMS_PER_TICK: &str = "TASKQ_CLAIMS_PER_TICK";
pub const ENV_RETRY_BASE_MS: &str = "TASKQ_RETRY_BASE_MS";
pub const ENV_RETRY_MAX_DELAY_SECS: &str = "TASKQ_RETRY_MAX_DELAY_SECS";
pub const ENV_UNKNOWN_TYPE_PERMANENT: &str = "TASKQ_UNKNOWN_TYPE_PERMANENT";
pub const ENV_MAX_CONNECTIONS: &str = "TASKQ_MAX_CONNECTIONS";
pub const ENV_WORKER_ID: &str = "TASKQ_WORKER_ID";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Queue and worker settings.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub poll_interval: Duration,
    pub stale_after: Duration,
    pub claims_per_tick: usize,
    pub retry_base: Duration,
    pub retry_max_delay: Option<Duration>,
    pub unknown_type_permanent: bool,
    pub max_connections: u32,
    /// `None` means a random id is generated at startup.
    pub worker_id: Option<WorkerId>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            stale_after: Duration::from_secs(300),
            claims_per_tick: 1,
            retry_base: Duration::from_millis(5000),
            retry_max_delay: None,
            unknown_type_permanent: false,
            max_connections: 5,
            worker_id: None,
        }
    }
}

impl QueueConfig {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ENV_POLL_INTERVAL_MS) {
            config.poll_interval = Duration::from_millis(positive(ENV_POLL_INTERVAL_MS, &v)?);
        }
        if let Some(v) = get(ENV_STALE_AFTER_SECS) {
            config.stale_after = Duration::from_secs(positive(ENV_STALE_AFTER_SECS, &v)?);
        }
        if let Some(v) = get(ENV_CLAIMS_PER_TICK) {
            config.claims_per_tick = positive(ENV_CLAIMS_PER_TICK, &v)?;
        }
        if let Some(v) = get(ENV_RETRY_BASE_MS) {
            config.retry_base = Duration::from_millis(parse(ENV_RETRY_BASE_MS, &v)?);
        }
        if let Some(v) = get(ENV_RETRY_MAX_DELAY_SECS) {
            config.retry_max_delay =
                Some(Duration::from_secs(positive(ENV_RETRY_MAX_DELAY_SECS, &v)?));
        }
        if let Some(v) = get(ENV_UNKNOWN_TYPE_PERMANENT) {
            config.unknown_type_permanent = flag(ENV_UNKNOWN_TYPE_PERMANENT, &v)?;
        }
        if let Some(v) = get(ENV_MAX_CONNECTIONS) {
            config.max_connections = positive(ENV_MAX_CONNECTIONS, &v)?;
        }
        if let Some(v) = get(ENV_WORKER_ID) {
            config.worker_id = Some(
                WorkerId::new(v.clone())
                    .map_err(|e| ConfigError::invalid(ENV_WORKER_ID, &v, e.to_string()))?,
            );
        }

        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::exponential(self.retry_base);
        match self.retry_max_delay {
            Some(max) => policy.with_max_delay(max),
            None => policy,
        }
    }

    pub fn poll_loop_config(&self) -> PollLoopConfig {
        PollLoopConfig {
            interval: self.poll_interval,
            stale_after: self.stale_after,
            claims_per_tick: self.claims_per_tick,
            retry_policy: self.retry_policy(),
            unknown_type_permanent: self.unknown_type_permanent,
        }
    }

    /// Configured worker id, or a fresh random one.
    pub fn worker_id_or_random(&self) -> WorkerId {
        self.worker_id.clone().unwrap_or_else(WorkerId::random)
    }
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, value, e.to_string()))
}

fn positive<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let parsed: T = parse(key, value)?;
    if parsed <= T::default() {
        return Err(ConfigError::invalid(key, value, "must be greater than zero"));
    }
    Ok(parsed)
}

fn flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, value, "expected a boolean")),
    }
}
