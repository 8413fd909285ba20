use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, trace};

use crate::admission::QueueOrder;
use crate::cache::{CacheStats, CacheStore, MemoryCache, ResponseCache};
use crate::config::{ClientConfig, MonitorConfig, PoolConfig};
use crate::error::{CancelReason, Error, TimeoutPhase};
use crate::fingerprint::Fingerprint;
use crate::gate::{Gate, GateStats};
use crate::interceptor::Interceptors;
use crate::monitor::{MetricSample, MetricsExport, Monitor, MonitorStats};
use crate::pool::{ConnectionPool, HostPoolStats, PoolError};
use crate::request::{Priority, Request, RequestBuilder, RequestOptions, StatusPolicy};
use crate::response::Response;
use crate::retry::{AdaptiveRetryConfig, RetryManager, RetryPolicy};
use crate::scheduler::{PriorityScheduler, SchedulerStats, TaskOptions};
use crate::transport::{Transport, TransportError, classify_outcome};
use crate::util::{
    host_key, merge_headers, merge_params, parse_header_name, parse_header_value,
    redact_uri_for_logs, resolve_url, validate_base_url,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CLIENT_NAME: &str = "reqflow";
const DEFAULT_SCHEDULER_SLOTS: usize = 6;

pub struct ClientBuilder {
    config: ClientConfig,
    client_name: String,
    transport: Option<Arc<dyn Transport>>,
    default_headers: HeaderMap,
    cache_store: Option<Arc<dyn CacheStore>>,
    retry_policy: Option<RetryPolicy>,
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("client_name", &self.client_name)
            .field("default_headers", &self.default_headers)
            .finish_non_exhaustive()
    }
}

impl ClientBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            config: ClientConfig {
                base_url: base_url.into(),
                ..ClientConfig::default()
            },
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            transport: None,
            default_headers: HeaderMap::new(),
            cache_store: None,
            retry_policy: None,
        }
    }

    /// Replaces every configuration section. An empty `base_url` in `config`
    /// keeps the one the builder was created with.
    pub fn config(mut self, config: ClientConfig) -> Self {
        let base_url = std::mem::take(&mut self.config.base_url);
        self.config = config;
        if self.config.base_url.is_empty() {
            self.config.base_url = base_url;
        }
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn transport<T>(self, transport: T) -> Self
    where
        T: Transport + 'static,
    {
        self.transport_arc(Arc::new(transport))
    }

    pub fn transport_arc(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let header_name = parse_header_name(name)?;
        let header_value = parse_header_value(name, value)?;
        Ok(self.default_header(header_name, header_value))
    }

    pub fn default_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.default_params.insert(name.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_ms = Some(duration_millis(timeout));
        self
    }

    pub fn total_timeout(mut self, total_timeout: Duration) -> Self {
        self.config.total_timeout_ms = Some(duration_millis(total_timeout));
        self
    }

    pub fn status_policy(mut self, status_policy: StatusPolicy) -> Self {
        self.config.status_policy = status_policy;
        self
    }

    pub fn fingerprint_header(mut self, name: impl Into<String>) -> Self {
        self.config.fingerprint_headers.push(name.into());
        self
    }

    pub fn cache(mut self, enabled: bool) -> Self {
        self.config.cache.enabled = enabled;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache.ttl_ms = duration_millis(ttl);
        self
    }

    pub fn cache_max_entries(mut self, max_entries: usize) -> Self {
        self.config.cache.max_entries = Some(max_entries);
        self
    }

    /// Backs the response cache with `store` instead of the built-in
    /// in-memory map.
    pub fn cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    /// Overrides the policy derived from the `retry` config section.
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    pub fn adaptive_retry(mut self, adaptive: AdaptiveRetryConfig) -> Self {
        self.config.retry.adaptive = Some(adaptive);
        self
    }

    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.config.concurrency.max_concurrent = Some(max_concurrent);
        self
    }

    pub fn max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.config.concurrency.max_queue_size = Some(max_queue_size);
        self
    }

    pub fn deduplication(mut self, enabled: bool) -> Self {
        self.config.concurrency.deduplication = enabled;
        self
    }

    pub fn priority(mut self, enabled: bool) -> Self {
        self.config.priority.enabled = enabled;
        self
    }

    pub fn default_priority(mut self, priority: Priority) -> Self {
        self.config.priority.default_priority = priority;
        self
    }

    pub fn monitor(mut self, enabled: bool) -> Self {
        self.config.monitor.enabled = enabled;
        self
    }

    pub fn monitor_config(mut self, monitor: MonitorConfig) -> Self {
        self.config.monitor = monitor;
        self
    }

    pub fn connection_pool(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    pub fn try_build(self) -> crate::Result<Client> {
        let config = self.config;
        config.validate()?;
        if !config.base_url.is_empty() {
            validate_base_url(&config.base_url)?;
        }
        let Some(transport) = self.transport else {
            return Err(Error::InvalidConfig {
                message: "a transport is required".to_owned(),
            });
        };

        let mut default_headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            default_headers.insert(parse_header_name(name)?, parse_header_value(name, value)?);
        }
        default_headers.extend(self.default_headers);
        let fingerprint_headers = config
            .fingerprint_headers
            .iter()
            .map(|name| parse_header_name(name))
            .collect::<crate::Result<Vec<_>>>()?;

        let store: Arc<dyn CacheStore> = match (self.cache_store, config.cache.max_entries) {
            (Some(store), _) => store,
            (None, Some(max_entries)) => Arc::new(MemoryCache::with_max_entries(max_entries)),
            (None, None) => Arc::new(MemoryCache::new()),
        };
        // With priority on, the scheduler owns the concurrency bound and the
        // gate only deduplicates.
        let (gate_slots, gate_queue) = if config.priority.enabled {
            (None, None)
        } else {
            (
                config.concurrency.max_concurrent,
                config.concurrency.max_queue_size,
            )
        };
        let scheduler_slots = config
            .priority
            .max_concurrent
            .or(config.concurrency.max_concurrent)
            .unwrap_or(DEFAULT_SCHEDULER_SLOTS);
        let scheduler_queue = config
            .priority
            .max_queue_size
            .or(config.concurrency.max_queue_size);
        let retry_policy = self
            .retry_policy
            .unwrap_or_else(|| config.retry.to_policy());

        let inner = ClientInner {
            client_name: self.client_name,
            transport,
            default_headers,
            default_options: RequestOptions {
                timeout: Some(
                    config
                        .timeout_ms
                        .map_or(DEFAULT_REQUEST_TIMEOUT, Duration::from_millis),
                ),
                total_timeout: config.total_timeout_ms.map(Duration::from_millis),
                status_policy: Some(config.status_policy),
                dedup: Some(config.concurrency.deduplication),
                ..RequestOptions::default()
            },
            default_params: config.default_params,
            fingerprint_headers,
            interceptors: Interceptors::default(),
            cache: ResponseCache::new(store, config.cache.ttl()),
            cache_enabled: config.cache.enabled,
            gate: Gate::new(gate_slots, gate_queue, QueueOrder::Fifo),
            scheduler: PriorityScheduler::new(scheduler_slots, scheduler_queue),
            default_priority: config
                .priority
                .enabled
                .then_some(config.priority.default_priority),
            retry_policy,
            retry: RetryManager::new(config.retry.adaptive),
            pool: config.pool.enabled.then(|| PoolHandle {
                acquire_timeout: config.pool.acquire_timeout(),
                pool: ConnectionPool::new(config.pool.limits()),
            }),
            monitor: config
                .monitor
                .enabled
                .then(|| Monitor::new(config.monitor.clone())),
            base_url: config.base_url,
            root: CancellationToken::new(),
            destroyed: AtomicBool::new(false),
            next_request_id: AtomicU64::new(1),
        };
        Ok(Client {
            inner: Arc::new(inner),
        })
    }

    #[track_caller]
    pub fn build(self) -> Client {
        self.try_build().unwrap_or_else(|error| {
            panic!("failed to build reqflow client: {error}; use try_build() to handle configuration errors")
        })
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

struct PoolHandle {
    pool: ConnectionPool,
    acquire_timeout: Duration,
}

struct ClientInner {
    client_name: String,
    transport: Arc<dyn Transport>,
    base_url: String,
    default_headers: HeaderMap,
    default_params: BTreeMap<String, String>,
    default_options: RequestOptions,
    fingerprint_headers: Vec<HeaderName>,
    interceptors: Interceptors,
    cache: ResponseCache,
    cache_enabled: bool,
    gate: Gate,
    scheduler: PriorityScheduler,
    default_priority: Option<Priority>,
    retry_policy: RetryPolicy,
    retry: RetryManager,
    pool: Option<PoolHandle>,
    monitor: Option<Monitor>,
    root: CancellationToken,
    destroyed: AtomicBool,
    next_request_id: AtomicU64,
}

/// A request merged with the client defaults, plus every decision the
/// pipeline needs about it.
struct Dispatch {
    request: Arc<Request>,
    timeout: Duration,
    total_timeout: Option<Duration>,
    priority: Option<Priority>,
    cache_ttl: Option<Duration>,
    retry_policy: RetryPolicy,
    dedup: bool,
    status_policy: StatusPolicy,
    fingerprint: Option<Fingerprint>,
}

/// Request-orchestration client.
///
/// Cloning is cheap and every clone shares the same cache, in-flight
/// registry, scheduler, pool and metrics.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Client")
            .field("client_name", &self.inner.client_name)
            .field("base_url", &self.inner.base_url)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn builder(base_url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(base_url)
    }

    pub fn request(&self, method: Method, path: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, path.into())
    }

    pub fn get(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, path)
    }

    pub fn patch(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PATCH, path)
    }

    pub fn delete(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, path)
    }

    pub fn head(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::HEAD, path)
    }

    pub fn interceptors(&self) -> &Interceptors {
        &self.inner.interceptors
    }

    pub async fn execute(&self, request: Request) -> crate::Result<Response> {
        self.dispatch(request, None).await
    }

    /// Like [`Client::execute`], settling with a cancellation error as soon
    /// as `cancel` fires. Cancelling a deduplicated call only detaches this
    /// caller; the shared execution keeps running for the others.
    pub async fn execute_with_cancel(
        &self,
        request: Request,
        cancel: CancellationToken,
    ) -> crate::Result<Response> {
        self.dispatch(request, Some(cancel)).await
    }

    async fn dispatch(
        &self,
        request: Request,
        cancel: Option<CancellationToken>,
    ) -> crate::Result<Response> {
        let inner = &*self.inner;
        inner.ensure_alive()?;
        let dispatch = inner.prepare(request)?;
        let request = Arc::clone(&dispatch.request);
        let span = info_span!(
            "reqflow.request",
            client = %inner.client_name,
            request_id = request.id(),
            method = %request.method(),
            uri = %redact_uri_for_logs(request.url()),
        );

        async {
            if inner.is_fast_path(&dispatch) {
                trace!("dispatching on fast path");
                return inner
                    .guard(&dispatch, cancel.as_ref(), inner.send_once(&dispatch, (*request).clone()))
                    .await;
            }

            let tracked = inner
                .monitor
                .as_ref()
                .map(|monitor| monitor.track(request.id(), request.url(), request.method()));
            let retries = AtomicUsize::new(0);
            let result = inner
                .guard(&dispatch, cancel.as_ref(), inner.run_pipeline(&dispatch, &retries))
                .await;
            if let Some(tracked) = tracked {
                tracked.finish(&result, retries.load(Ordering::Relaxed));
            }
            if let Err(error) = &result {
                debug!(error = %error, "request failed");
            }
            result
        }
        .instrument(span)
        .await
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Tears the client down. In-flight and queued work settles with a
    /// `Destroyed` cancellation, and later calls fail with
    /// [`Error::ClientDestroyed`]. Calling it again is a no-op.
    pub fn destroy(&self) {
        let inner = &*self.inner;
        if inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(client = %inner.client_name, "destroying client");
        inner.root.cancel();
        inner.gate.close();
        inner.scheduler.close();
        if let Some(handle) = &inner.pool {
            handle.pool.close();
        }
        inner.cache.clear();
        if let Some(monitor) = &inner.monitor {
            monitor.clear();
        }
        inner.interceptors.clear();
        inner.retry.clear();
    }

    pub fn clear_cache(&self) -> crate::Result<()> {
        self.inner.ensure_alive()?;
        self.inner.cache.clear();
        Ok(())
    }

    /// Drops the cached response `request` would be served from.
    pub fn invalidate(&self, request: Request) -> crate::Result<bool> {
        self.inner.ensure_alive()?;
        let merged = self.inner.merge(request)?;
        let fingerprint = Fingerprint::of(&merged, &self.inner.fingerprint_headers);
        Ok(self.inner.cache.invalidate(&fingerprint))
    }

    /// Drops every cached response whose resolved URL starts with `url_prefix`.
    pub fn invalidate_prefix(&self, url_prefix: &str) -> crate::Result<usize> {
        self.inner.ensure_alive()?;
        Ok(self.inner.cache.invalidate_prefix(url_prefix))
    }

    /// Rejects every queued and running prioritized request.
    pub fn cancel_all(&self) -> crate::Result<usize> {
        self.inner.ensure_alive()?;
        Ok(self.inner.scheduler.cancel_all())
    }

    pub fn prune_pool(&self) -> crate::Result<usize> {
        self.inner.ensure_alive()?;
        Ok(self
            .inner
            .pool
            .as_ref()
            .map_or(0, |handle| handle.pool.prune()))
    }

    /// Aggregate request metrics; empty while monitoring is disabled.
    pub fn stats(&self) -> MonitorStats {
        self.inner
            .monitor
            .as_ref()
            .map(Monitor::stats)
            .unwrap_or_default()
    }

    pub fn recent_metrics(&self, limit: usize) -> Vec<MetricSample> {
        self.inner
            .monitor
            .as_ref()
            .map(|monitor| monitor.recent(limit))
            .unwrap_or_default()
    }

    pub fn slow_requests(&self) -> Vec<MetricSample> {
        self.inner
            .monitor
            .as_ref()
            .map(Monitor::slow_requests)
            .unwrap_or_default()
    }

    pub fn failed_requests(&self) -> Vec<MetricSample> {
        self.inner
            .monitor
            .as_ref()
            .map(Monitor::failed_requests)
            .unwrap_or_default()
    }

    pub fn export_metrics(&self) -> Option<MetricsExport> {
        self.inner.monitor.as_ref().map(Monitor::export)
    }

    pub fn reset_metrics(&self) {
        if let Some(monitor) = &self.inner.monitor {
            monitor.reset();
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn gate_stats(&self) -> GateStats {
        self.inner.gate.stats()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.inner.scheduler.stats()
    }

    pub fn pool_stats(&self) -> Vec<HostPoolStats> {
        self.inner
            .pool
            .as_ref()
            .map(|handle| handle.pool.stats())
            .unwrap_or_default()
    }
}

impl ClientInner {
    fn ensure_alive(&self) -> crate::Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(Error::ClientDestroyed);
        }
        Ok(())
    }

    fn merge(&self, request: Request) -> crate::Result<Request> {
        let Request {
            method,
            url,
            headers,
            params,
            body,
            options,
            ..
        } = request;
        Ok(Request {
            id: self.next_request_id.fetch_add(1, Ordering::Relaxed),
            url: resolve_url(&self.base_url, &url)?,
            headers: merge_headers(&self.default_headers, &headers),
            params: merge_params(&self.default_params, &params),
            options: self.default_options.overlay(&options),
            method,
            body,
        })
    }

    fn prepare(&self, request: Request) -> crate::Result<Dispatch> {
        let request = self.merge(request)?;
        let options = request.options();

        let cache_override = options.cache.or((!self.cache_enabled).then_some(false));
        let cache_ttl = ResponseCache::is_cacheable(request.method(), cache_override)
            .then(|| options.cache_ttl.unwrap_or_else(|| self.cache.default_ttl()));
        let dedup = options.dedup.unwrap_or(false);
        let fingerprint = (cache_ttl.is_some() || dedup)
            .then(|| Fingerprint::of(&request, &self.fingerprint_headers));

        Ok(Dispatch {
            timeout: options.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            total_timeout: options.total_timeout,
            priority: options.priority.or(self.default_priority),
            retry_policy: options
                .retry_policy
                .clone()
                .unwrap_or_else(|| self.retry_policy.clone()),
            status_policy: options.status_policy.unwrap_or_default(),
            cache_ttl,
            dedup,
            fingerprint,
            request: Arc::new(request),
        })
    }

    fn is_fast_path(&self, dispatch: &Dispatch) -> bool {
        self.interceptors.is_empty()
            && dispatch.priority.is_none()
            && dispatch.cache_ttl.is_none()
            && !dispatch.retry_policy.is_enabled()
            && !dispatch.dedup
            && self.monitor.is_none()
            && !self.gate.is_bounded()
            && self.pool.is_none()
    }

    /// Races `pipeline` against destruction, caller cancellation and the
    /// total deadline.
    async fn guard<F>(
        &self,
        dispatch: &Dispatch,
        cancel: Option<&CancellationToken>,
        pipeline: F,
    ) -> crate::Result<Response>
    where
        F: Future<Output = crate::Result<Response>>,
    {
        let bounded = async {
            match dispatch.total_timeout {
                Some(total_timeout) => tokio::time::timeout(total_timeout, pipeline)
                    .await
                    .unwrap_or_else(|_| {
                        Err(Error::Timeout {
                            phase: TimeoutPhase::Total,
                            timeout_ms: total_timeout.as_millis(),
                            method: dispatch.request.method().clone(),
                            uri: redact_uri_for_logs(dispatch.request.url()),
                        })
                    }),
                None => pipeline.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.root.cancelled() => Err(Error::cancelled(CancelReason::Destroyed)),
            _ = caller_cancelled(cancel) => Err(Error::cancelled(CancelReason::Explicit)),
            result = bounded => result,
        }
    }

    /// Cache lookup, then the dedup gate. Only the owner of a fingerprint is
    /// scheduled, so identical requests attach without taking a slot.
    async fn run_pipeline(&self, dispatch: &Dispatch, retries: &AtomicUsize) -> crate::Result<Response> {
        if dispatch.cache_ttl.is_some()
            && let Some(fingerprint) = &dispatch.fingerprint
            && let Some(cached) = self.cache.lookup(fingerprint)
        {
            debug!("serving cached response");
            return Ok(cached.with_request(Arc::clone(&dispatch.request)));
        }

        let key = if dispatch.dedup {
            dispatch.fingerprint.clone()
        } else {
            None
        };
        self.gate
            .run(key, dispatch.priority.unwrap_or_default(), || {
                self.run_scheduled(dispatch, retries)
            })
            .await
    }

    async fn run_scheduled(&self, dispatch: &Dispatch, retries: &AtomicUsize) -> crate::Result<Response> {
        match dispatch.priority {
            Some(priority) => {
                let options = TaskOptions::new(priority).label(
                    dispatch.request.method().clone(),
                    redact_uri_for_logs(dispatch.request.url()),
                );
                self.scheduler
                    .schedule(options, || self.run_shared(dispatch, retries))
                    .await
            }
            None => self.run_shared(dispatch, retries).await,
        }
    }

    /// Everything after the cache lookup. With deduplication this runs once
    /// per fingerprint and every attached caller receives its outcome.
    async fn run_shared(&self, dispatch: &Dispatch, retries: &AtomicUsize) -> crate::Result<Response> {
        let outcome = self
            .retry
            .run(&dispatch.retry_policy, dispatch.request.url(), |attempt| {
                self.attempt(dispatch, attempt)
            })
            .await;
        retries.store(outcome.retries, Ordering::Relaxed);

        let failed = outcome.result.is_err();
        let chain = self.interceptors.response_chain();
        let result = if chain.is_empty() {
            outcome.result
        } else {
            chain.run(outcome.result).await
        };

        if !failed
            && let Ok(response) = &result
            && let Some(ttl) = dispatch.cache_ttl
            && let Some(fingerprint) = &dispatch.fingerprint
        {
            self.cache.store(fingerprint.clone(), response.clone(), ttl);
        }
        result
    }

    async fn attempt(&self, dispatch: &Dispatch, attempt: usize) -> crate::Result<Response> {
        let _lease = match (&self.pool, host_key(dispatch.request.url())) {
            (Some(handle), Some(host)) => Some(
                handle
                    .pool
                    .acquire(&host, handle.acquire_timeout)
                    .await
                    .map_err(|error| pool_error(error, dispatch))?,
            ),
            _ => None,
        };

        let request = (*dispatch.request).clone();
        let chain = self.interceptors.request_chain();
        let request = if chain.is_empty() {
            request
        } else {
            chain.run(Ok(request)).await?
        };
        debug!(attempt = attempt + 1, "sending request");
        self.send_once(dispatch, request).await
    }

    async fn send_once(&self, dispatch: &Dispatch, request: Request) -> crate::Result<Response> {
        let sent = Arc::new(request.clone());
        let outcome = match tokio::time::timeout(dispatch.timeout, self.transport.send(request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::Timeout),
        };
        let response = classify_outcome(outcome, &sent, dispatch.timeout.as_millis())?;
        apply_status_policy(response, dispatch.status_policy)
    }
}

async fn caller_cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

fn pool_error(error: PoolError, dispatch: &Dispatch) -> Error {
    match error {
        PoolError::Timeout { timeout_ms } => Error::Timeout {
            phase: TimeoutPhase::Pool,
            timeout_ms,
            method: dispatch.request.method().clone(),
            uri: redact_uri_for_logs(dispatch.request.url()),
        },
        PoolError::Closed => Error::cancelled(CancelReason::Destroyed),
    }
}

fn apply_status_policy(response: Response, status_policy: StatusPolicy) -> crate::Result<Response> {
    let status = response.status();
    if status_policy == StatusPolicy::Error && (status.is_client_error() || status.is_server_error()) {
        let request = response.request();
        return Err(Error::HttpStatus {
            method: request.method().clone(),
            uri: redact_uri_for_logs(request.url()),
            response: Box::new(response),
        });
    }
    Ok(response)
}
