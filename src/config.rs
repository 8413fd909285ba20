//! Plain-data client configuration.
//!
//! Every section deserializes with defaults for missing fields, and durations
//! are whole milliseconds, so a config loader can hand over JSON as-is.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::pool::PoolLimits;
use crate::request::{Priority, StatusPolicy};
use crate::retry::{AdaptiveRetryConfig, BackoffStrategy, RetryPolicy};

pub use crate::monitor::MonitorConfig;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub default_headers: BTreeMap<String, String>,
    pub default_params: BTreeMap<String, String>,
    /// Per-attempt transport timeout.
    pub timeout_ms: Option<u64>,
    /// Whole-pipeline deadline, including queue waits and backoff.
    pub total_timeout_ms: Option<u64>,
    pub status_policy: StatusPolicy,
    /// Request headers whose values take part in fingerprints.
    pub fingerprint_headers: Vec<String>,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub concurrency: ConcurrencyConfig,
    pub priority: PriorityConfig,
    pub monitor: MonitorConfig,
    pub pool: PoolConfig,
}

impl ClientConfig {
    pub fn from_json_str(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|error| Error::InvalidConfig {
            message: error.to_string(),
        })
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.timeout_ms == Some(0) {
            return Err(invalid("timeout_ms must be greater than zero"));
        }
        if self.total_timeout_ms == Some(0) {
            return Err(invalid("total_timeout_ms must be greater than zero"));
        }
        if self.concurrency.max_concurrent == Some(0) {
            return Err(invalid("concurrency.max_concurrent must be greater than zero"));
        }
        if self.priority.max_concurrent == Some(0) {
            return Err(invalid("priority.max_concurrent must be greater than zero"));
        }
        if self.cache.max_entries == Some(0) {
            return Err(invalid("cache.max_entries must be greater than zero"));
        }
        if self.monitor.max_metrics == 0 {
            return Err(invalid("monitor.max_metrics must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.monitor.sampling_rate) {
            return Err(invalid("monitor.sampling_rate must be within 0.0..=1.0"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(invalid("retry.jitter must be within 0.0..=1.0"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(invalid("retry.max_delay_ms must not be below retry.base_delay_ms"));
        }
        if self.pool.enabled && self.pool.max_connections == 0 {
            return Err(invalid("pool.max_connections must be greater than zero"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> Error {
    Error::InvalidConfig {
        message: message.to_owned(),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_ms: u64,
    pub max_entries: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_ms: 5 * 60 * 1000,
            max_entries: None,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub retries: usize,
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    pub retryable_status_codes: Option<Vec<u16>>,
    pub non_retryable_status_codes: Option<Vec<u16>>,
    pub adaptive: Option<AdaptiveRetryConfig>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            retries: 3,
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter: 0.25,
            retryable_status_codes: None,
            non_retryable_status_codes: None,
            adaptive: None,
        }
    }
}

impl RetryConfig {
    /// The policy this section describes; disabled sections retry nothing.
    pub fn to_policy(&self) -> RetryPolicy {
        if !self.enabled {
            return RetryPolicy::disabled();
        }
        let mut policy = RetryPolicy::standard()
            .max_retries(self.retries)
            .strategy(self.strategy)
            .base_delay(Duration::from_millis(self.base_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .jitter_ratio(self.jitter);
        if let Some(codes) = &self.retryable_status_codes {
            policy = policy.retryable_status_codes(codes.iter().copied());
        }
        if let Some(codes) = &self.non_retryable_status_codes {
            policy = policy.non_retryable_status_codes(codes.iter().copied());
        }
        policy
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// `None` leaves concurrency unbounded.
    pub max_concurrent: Option<usize>,
    pub max_queue_size: Option<usize>,
    pub deduplication: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    pub enabled: bool,
    pub default_priority: Priority,
    /// Scheduler slots; falls back to `concurrency.max_concurrent`, then 6.
    pub max_concurrent: Option<usize>,
    pub max_queue_size: Option<usize>,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_priority: Priority::NORMAL,
            max_concurrent: None,
            max_queue_size: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub enabled: bool,
    pub max_connections: usize,
    pub max_connection_age_ms: u64,
    pub idle_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let limits = PoolLimits::default();
        Self {
            enabled: false,
            max_connections: limits.max_connections,
            max_connection_age_ms: limits.max_connection_age.as_millis() as u64,
            idle_timeout_ms: limits.idle_timeout.as_millis() as u64,
            acquire_timeout_ms: 30_000,
        }
    }
}

impl PoolConfig {
    pub fn limits(&self) -> PoolLimits {
        PoolLimits {
            max_connections: self.max_connections,
            max_connection_age: Duration::from_millis(self.max_connection_age_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}
