use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::Method;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::Error;
use crate::response::Response;
use crate::util::{lock_unpoisoned, saturating_millis};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    /// Ring buffer capacity.
    pub max_metrics: usize,
    pub slow_threshold_ms: u64,
    /// Fraction of requests recorded, in `0.0..=1.0`.
    pub sampling_rate: f64,
    pub stats_ttl_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_metrics: 1000,
            slow_threshold_ms: 3000,
            sampling_rate: 1.0,
            stats_ttl_ms: 1000,
        }
    }
}

/// One finished request.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricSample {
    pub request_id: u64,
    pub url: String,
    pub method: String,
    /// Milliseconds since the Unix epoch.
    pub started_at_ms: u64,
    pub ended_at_ms: u64,
    pub duration_ms: u64,
    pub status: Option<u16>,
    pub bytes: u64,
    pub from_cache: bool,
    pub error: Option<String>,
    pub retries: usize,
}

impl MetricSample {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MonitorStats {
    pub count: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub mean_ms: f64,
    pub median_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub cache_hit_rate: f64,
    pub error_rate: f64,
    pub slow_count: usize,
    pub requests_started: u64,
    pub retries: u64,
    pub in_flight: u64,
    pub status_counts: BTreeMap<u16, u64>,
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct MetricsExport {
    pub exported_at_ms: u64,
    pub stats: MonitorStats,
    pub samples: Vec<MetricSample>,
}

#[derive(Debug)]
struct PendingRequest {
    started: Instant,
    started_wall: SystemTime,
    url: String,
    method: Method,
}

#[derive(Debug, Default)]
struct MonitorState {
    samples: VecDeque<MetricSample>,
    pending: HashMap<u64, PendingRequest>,
    status_counts: BTreeMap<u16, u64>,
    error_counts: BTreeMap<String, u64>,
    cached_stats: Option<(Instant, MonitorStats)>,
}

/// Per-request timing and outcome records in a fixed-capacity ring buffer.
///
/// Recording never fails a request: every operation here is infallible.
#[derive(Debug)]
pub struct Monitor {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
    requests_started: AtomicU64,
    retries: AtomicU64,
    in_flight: AtomicU64,
}

impl Monitor {
    pub fn new(config: MonitorConfig) -> Self {
        let config = MonitorConfig {
            max_metrics: config.max_metrics.max(1),
            sampling_rate: config.sampling_rate.clamp(0.0, 1.0),
            ..config
        };
        Self {
            state: Mutex::new(MonitorState {
                samples: VecDeque::with_capacity(config.max_metrics.min(4096)),
                ..MonitorState::default()
            }),
            config,
            requests_started: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Begins tracking `request_id`. Returns `false` when sampling skipped it;
    /// the matching `end_request` is then a no-op apart from counters.
    pub fn start_request(&self, request_id: u64, url: &str, method: &Method) -> bool {
        self.requests_started.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        if !self.should_sample() {
            return false;
        }
        lock_unpoisoned(&self.state).pending.insert(
            request_id,
            PendingRequest {
                started: Instant::now(),
                started_wall: SystemTime::now(),
                url: url.to_owned(),
                method: method.clone(),
            },
        );
        true
    }

    fn should_sample(&self) -> bool {
        let rate = self.config.sampling_rate;
        if rate >= 1.0 {
            return true;
        }
        if rate <= 0.0 {
            return false;
        }
        rand::rng().random_range(0.0..1.0) < rate
    }

    pub fn end_request(&self, request_id: u64, outcome: &Result<Response, Error>, retries: usize) {
        self.release_in_flight();
        self.retries.fetch_add(retries as u64, Ordering::Relaxed);

        let mut state = lock_unpoisoned(&self.state);
        let Some(pending) = state.pending.remove(&request_id) else {
            return;
        };
        let duration = pending.started.elapsed();
        let started_at_ms = unix_millis(pending.started_wall);
        let (status, bytes, from_cache, error) = match outcome {
            Ok(response) => (
                Some(response.status().as_u16()),
                response.body_len(),
                response.from_cache(),
                None,
            ),
            Err(error) => (
                error.status().map(|status| status.as_u16()),
                error.response().map(Response::body_len).unwrap_or_default(),
                false,
                Some(error.code().as_str().to_owned()),
            ),
        };

        if let Some(status) = status {
            *state.status_counts.entry(status).or_default() += 1;
        }
        if let Some(error) = &error {
            *state.error_counts.entry(error.clone()).or_default() += 1;
        }
        if state.samples.len() >= self.config.max_metrics {
            state.samples.pop_front();
        }
        state.samples.push_back(MetricSample {
            request_id,
            url: pending.url,
            method: pending.method.as_str().to_owned(),
            started_at_ms,
            ended_at_ms: started_at_ms.saturating_add(saturating_millis(duration)),
            duration_ms: saturating_millis(duration),
            status,
            bytes,
            from_cache,
            error,
            retries,
        });
    }

    /// Aggregate statistics, recomputed at most once per `stats_ttl_ms`.
    pub fn stats(&self) -> MonitorStats {
        let now = Instant::now();
        let ttl = Duration::from_millis(self.config.stats_ttl_ms);
        let mut state = lock_unpoisoned(&self.state);
        if let Some((computed_at, stats)) = &state.cached_stats
            && now.duration_since(*computed_at) < ttl
        {
            return stats.clone();
        }
        let stats = self.compute_stats(&state);
        state.cached_stats = Some((now, stats.clone()));
        stats
    }

    fn compute_stats(&self, state: &MonitorState) -> MonitorStats {
        let count = state.samples.len();
        let mut stats = MonitorStats {
            count,
            requests_started: self.requests_started.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            status_counts: state.status_counts.clone(),
            error_counts: state.error_counts.clone(),
            ..MonitorStats::default()
        };
        if count == 0 {
            return stats;
        }

        let mut durations = state
            .samples
            .iter()
            .map(|sample| sample.duration_ms)
            .collect::<Vec<_>>();
        durations.sort_unstable();
        stats.success_count = state
            .samples
            .iter()
            .filter(|sample| sample.is_success())
            .count();
        stats.error_count = count - stats.success_count;
        stats.mean_ms = durations.iter().sum::<u64>() as f64 / count as f64;
        stats.median_ms = percentile(&durations, 50.0);
        stats.p95_ms = percentile(&durations, 95.0);
        stats.p99_ms = percentile(&durations, 99.0);
        let cache_hits = state
            .samples
            .iter()
            .filter(|sample| sample.from_cache)
            .count();
        stats.cache_hit_rate = cache_hits as f64 / count as f64;
        stats.error_rate = stats.error_count as f64 / count as f64;
        stats.slow_count = state
            .samples
            .iter()
            .filter(|sample| sample.duration_ms >= self.config.slow_threshold_ms)
            .count();
        stats
    }

    /// The newest `limit` samples, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<MetricSample> {
        let state = lock_unpoisoned(&self.state);
        let skip = state.samples.len().saturating_sub(limit);
        state.samples.iter().skip(skip).cloned().collect()
    }

    pub fn slow_requests(&self) -> Vec<MetricSample> {
        let state = lock_unpoisoned(&self.state);
        state
            .samples
            .iter()
            .filter(|sample| sample.duration_ms >= self.config.slow_threshold_ms)
            .cloned()
            .collect()
    }

    pub fn failed_requests(&self) -> Vec<MetricSample> {
        let state = lock_unpoisoned(&self.state);
        state
            .samples
            .iter()
            .filter(|sample| !sample.is_success())
            .cloned()
            .collect()
    }

    pub fn export(&self) -> MetricsExport {
        let stats = self.stats();
        let samples = lock_unpoisoned(&self.state).samples.iter().cloned().collect();
        MetricsExport {
            exported_at_ms: unix_millis(SystemTime::now()),
            stats,
            samples,
        }
    }

    pub fn export_json(&self) -> crate::Result<String> {
        serde_json::to_string(&self.export()).map_err(|source| Error::SerializeJson {
            source: std::sync::Arc::new(source),
        })
    }

    /// Drops samples and cached stats. In-flight requests keep being tracked.
    pub fn reset(&self) {
        let mut state = lock_unpoisoned(&self.state);
        state.samples.clear();
        state.status_counts.clear();
        state.error_counts.clear();
        state.cached_stats = None;
    }

    pub(crate) fn clear(&self) {
        self.reset();
        lock_unpoisoned(&self.state).pending.clear();
    }

    /// Starts tracking a request whose end is reported by the returned guard.
    pub(crate) fn track(&self, request_id: u64, url: &str, method: &Method) -> TrackedRequest<'_> {
        self.start_request(request_id, url, method);
        TrackedRequest {
            monitor: self,
            request_id,
            finished: false,
        }
    }

    /// Releases a request that never settled, without recording a sample.
    fn abandon_request(&self, request_id: u64) {
        self.release_in_flight();
        lock_unpoisoned(&self.state).pending.remove(&request_id);
    }

    fn release_in_flight(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
                value.checked_sub(1)
            });
    }
}

/// Ends a tracked request exactly once; dropping it unfinished abandons it.
pub(crate) struct TrackedRequest<'a> {
    monitor: &'a Monitor,
    request_id: u64,
    finished: bool,
}

impl TrackedRequest<'_> {
    pub(crate) fn finish(mut self, outcome: &Result<Response, Error>, retries: usize) {
        self.finished = true;
        self.monitor.end_request(self.request_id, outcome, retries);
    }
}

impl Drop for TrackedRequest<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.monitor.abandon_request(self.request_id);
        }
    }
}

fn percentile(sorted: &[u64], percentile: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(saturating_millis)
        .unwrap_or_default()
}
