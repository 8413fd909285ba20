use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use rand::RngExt;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::warn;

use crate::error::{Error, TimeoutPhase};
use crate::response::Response;
use crate::util::{lock_unpoisoned, parse_retry_after, saturating_millis};

const MAX_TRACKED_URLS: usize = 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base_delay` before every retry.
    Fixed,
    /// `base_delay × (n + 1)` before retry `n`.
    Linear,
    /// `base_delay × 2^n` before retry `n`.
    #[default]
    Exponential,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryReason {
    Exhausted,
    Network,
    Timeout,
    RetryableStatus(u16),
    NonRetryableStatus(u16),
    Classifier,
    NotRetryable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
    pub reason: RetryReason,
    /// The delay came from the response's `Retry-After` header.
    pub retry_after: bool,
}

impl RetryDecision {
    fn stop(reason: RetryReason) -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
            reason,
            retry_after: false,
        }
    }
}

/// Overrides the built-in error classification. The `max_retries` ceiling
/// still applies to whatever the classifier answers.
pub trait RetryClassifier: Send + Sync {
    fn should_retry(&self, error: &Error, retries_done: usize) -> bool;
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    strategy: BackoffStrategy,
    base_delay: Duration,
    max_delay: Duration,
    jitter_ratio: f64,
    retryable_status_codes: BTreeSet<u16>,
    non_retryable_status_codes: BTreeSet<u16>,
    retry_on_network: bool,
    retry_on_timeout: bool,
    retry_classifier: Option<Arc<dyn RetryClassifier>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("strategy", &self.strategy)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter_ratio", &self.jitter_ratio)
            .field("retryable_status_codes", &self.retryable_status_codes)
            .field("non_retryable_status_codes", &self.non_retryable_status_codes)
            .field("retry_on_network", &self.retry_on_network)
            .field("retry_on_timeout", &self.retry_on_timeout)
            .field("retry_classifier", &self.retry_classifier.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::standard()
        }
    }

    pub fn standard() -> Self {
        Self {
            max_retries: 3,
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.25,
            retryable_status_codes: default_retryable_status_codes(),
            non_retryable_status_codes: default_non_retryable_status_codes(),
            retry_on_network: true,
            retry_on_timeout: true,
            retry_classifier: None,
        }
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        if self.max_delay < self.base_delay {
            self.max_delay = self.base_delay;
        }
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay.max(self.base_delay);
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }

    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn non_retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.non_retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn retry_on_network(mut self, retry: bool) -> Self {
        self.retry_on_network = retry;
        self
    }

    pub fn retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    pub fn retry_classifier(mut self, retry_classifier: Arc<dyn RetryClassifier>) -> Self {
        self.retry_classifier = Some(retry_classifier);
        self
    }

    pub fn configured_max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn configured_strategy(&self) -> BackoffStrategy {
        self.strategy
    }

    pub fn is_enabled(&self) -> bool {
        self.max_retries > 0
    }

    /// Decides whether the failure that ended attempt `retries_done + 1`
    /// should be retried, and after how long.
    pub fn decide(&self, error: &Error, retries_done: usize) -> RetryDecision {
        self.decide_with(error, retries_done, self.max_retries, 1.0, SystemTime::now())
    }

    fn decide_with(
        &self,
        error: &Error,
        retries_done: usize,
        max_retries: usize,
        delay_factor: f64,
        now: SystemTime,
    ) -> RetryDecision {
        if retries_done >= max_retries.min(self.max_retries) {
            return RetryDecision::stop(RetryReason::Exhausted);
        }

        let (retry, reason) = match &self.retry_classifier {
            Some(classifier) => (
                classifier.should_retry(error, retries_done),
                RetryReason::Classifier,
            ),
            None => self.classify(error),
        };
        if !retry {
            return RetryDecision::stop(reason);
        }

        if let Some(retry_after) = error
            .response()
            .and_then(|response| parse_retry_after(response.headers(), now))
        {
            return RetryDecision {
                retry: true,
                delay: retry_after,
                reason,
                retry_after: true,
            };
        }

        let delay = self.backoff_for_retry(retries_done);
        let delay = if delay_factor > 1.0 {
            delay.mul_f64(delay_factor).min(self.max_delay)
        } else {
            delay
        };
        RetryDecision {
            retry: true,
            delay,
            reason,
            retry_after: false,
        }
    }

    fn classify(&self, error: &Error) -> (bool, RetryReason) {
        match error {
            Error::Network { .. } => (self.retry_on_network, RetryReason::Network),
            Error::Timeout {
                phase: TimeoutPhase::Transport,
                ..
            } => (self.retry_on_timeout, RetryReason::Timeout),
            Error::HttpStatus { response, .. } => {
                let code = response.status().as_u16();
                if self.non_retryable_status_codes.contains(&code) {
                    (false, RetryReason::NonRetryableStatus(code))
                } else if self.retryable_status_codes.contains(&code)
                    || response.status().is_server_error()
                {
                    (true, RetryReason::RetryableStatus(code))
                } else {
                    (false, RetryReason::NonRetryableStatus(code))
                }
            }
            _ => (false, RetryReason::NotRetryable),
        }
    }

    pub(crate) fn backoff_for_retry(&self, retries_done: usize) -> Duration {
        let base_ms = self.base_delay.as_millis();
        let max_ms = self.max_delay.as_millis().max(base_ms);
        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Linear => base_ms.saturating_mul(retries_done as u128 + 1),
            BackoffStrategy::Exponential => {
                let exponent = retries_done.min(31) as u32;
                base_ms.saturating_mul(1_u128 << exponent)
            }
        };
        let delay = Duration::from_millis(delay_ms.min(max_ms).min(u64::MAX as u128) as u64);
        self.apply_jitter(delay)
    }

    /// Spreads `delay` uniformly by `jitter_ratio` either way, never past
    /// `max_delay`.
    fn apply_jitter(&self, delay: Duration) -> Duration {
        let delay_ms = saturating_millis(delay);
        if self.jitter_ratio <= f64::EPSILON || delay_ms <= 1 {
            return delay;
        }

        let spread_ms = ((delay_ms as f64) * self.jitter_ratio).round().max(1.0) as u64;
        let ceiling_ms = saturating_millis(self.max_delay).max(1);
        let earliest_ms = delay_ms.saturating_sub(spread_ms).min(ceiling_ms);
        let latest_ms = delay_ms.saturating_add(spread_ms).min(ceiling_ms).max(earliest_ms);
        Duration::from_millis(rand::rng().random_range(earliest_ms..=latest_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

fn default_retryable_status_codes() -> BTreeSet<u16> {
    [408_u16, 429, 500, 502, 503, 504].into_iter().collect()
}

fn default_non_retryable_status_codes() -> BTreeSet<u16> {
    [400_u16, 401, 403, 404, 405, 422].into_iter().collect()
}

/// Settings for per-URL adaptive retry aggressiveness.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveRetryConfig {
    /// Outcomes remembered per URL.
    pub window: usize,
    /// Outcomes required before the window influences decisions.
    pub min_samples: usize,
    /// Failure ratio at or above which retries are halved and delays doubled.
    pub failure_threshold: f64,
}

impl Default for AdaptiveRetryConfig {
    fn default() -> Self {
        Self {
            window: 20,
            min_samples: 5,
            failure_threshold: 0.5,
        }
    }
}

#[derive(Debug)]
struct AdaptiveRetry {
    config: AdaptiveRetryConfig,
    history: Mutex<HashMap<String, VecDeque<bool>>>,
}

impl AdaptiveRetry {
    fn record(&self, url: &str, success: bool) {
        let window = self.config.window.max(1);
        let mut history = lock_unpoisoned(&self.history);
        if !history.contains_key(url) && history.len() >= MAX_TRACKED_URLS {
            if let Some(evicted) = history.keys().next().cloned() {
                history.remove(&evicted);
            }
        }
        let outcomes = history.entry(url.to_owned()).or_default();
        if outcomes.len() >= window {
            outcomes.pop_front();
        }
        outcomes.push_back(success);
    }

    fn failure_ratio(&self, url: &str) -> Option<f64> {
        let history = lock_unpoisoned(&self.history);
        let outcomes = history.get(url)?;
        if outcomes.len() < self.config.min_samples.max(1) {
            return None;
        }
        let failures = outcomes.iter().filter(|success| !**success).count();
        Some(failures as f64 / outcomes.len() as f64)
    }

    /// Returns the effective retry ceiling and delay factor for `url`.
    fn adjust(&self, url: &str, max_retries: usize) -> (usize, f64) {
        match self.failure_ratio(url) {
            Some(ratio) if ratio >= self.config.failure_threshold => (max_retries / 2, 2.0),
            _ => (max_retries, 1.0),
        }
    }
}

/// Result of a retry-wrapped execution.
#[derive(Debug)]
pub(crate) struct RetryOutcome {
    pub(crate) result: Result<Response, Error>,
    pub(crate) retries: usize,
}

/// Drives attempts under a [`RetryPolicy`], optionally adapting per URL.
#[derive(Debug, Default)]
pub struct RetryManager {
    adaptive: Option<AdaptiveRetry>,
}

impl RetryManager {
    pub fn new(adaptive: Option<AdaptiveRetryConfig>) -> Self {
        Self {
            adaptive: adaptive.map(|config| AdaptiveRetry {
                config,
                history: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn decide(
        &self,
        policy: &RetryPolicy,
        url: &str,
        error: &Error,
        retries_done: usize,
    ) -> RetryDecision {
        let (max_retries, delay_factor) = match &self.adaptive {
            Some(adaptive) => adaptive.adjust(url, policy.max_retries),
            None => (policy.max_retries, 1.0),
        };
        policy.decide_with(
            error,
            retries_done,
            max_retries,
            delay_factor,
            SystemTime::now(),
        )
    }

    pub fn record_outcome(&self, url: &str, success: bool) {
        if let Some(adaptive) = &self.adaptive {
            adaptive.record(url, success);
        }
    }

    pub(crate) fn clear(&self) {
        if let Some(adaptive) = &self.adaptive {
            lock_unpoisoned(&adaptive.history).clear();
        }
    }

    /// Runs `attempt` until it succeeds or the policy stops retrying. Only the
    /// final outcome is returned; intermediate failures are logged.
    pub(crate) async fn run<F, Fut>(
        &self,
        policy: &RetryPolicy,
        url: &str,
        mut attempt: F,
    ) -> RetryOutcome
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<Response, Error>>,
    {
        let mut retries = 0;
        loop {
            let error = match attempt(retries).await {
                Ok(response) => {
                    self.record_outcome(url, true);
                    return RetryOutcome {
                        result: Ok(response),
                        retries,
                    };
                }
                Err(error) => error,
            };

            let decision = if policy.is_enabled() {
                self.decide(policy, url, &error, retries)
            } else {
                RetryDecision::stop(RetryReason::Exhausted)
            };
            if !decision.retry {
                self.record_outcome(url, false);
                return RetryOutcome {
                    result: Err(error),
                    retries,
                };
            }

            warn!(
                retry = retries + 1,
                max_retries = policy.max_retries,
                delay_ms = saturating_millis(decision.delay),
                reason = ?decision.reason,
                error = %error,
                "retrying request after failed attempt"
            );
            if !decision.delay.is_zero() {
                sleep(decision.delay).await;
            }
            retries += 1;
        }
    }
}
