use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::StatusCode;
use reqflow::prelude::{
    Client, Error, FnTransport, Priority, Request, RetryPolicy, Transport, TransportError,
    TransportResponse,
};
use reqflow::{CancelReason, ClientConfig, MonitorConfig, PoolConfig, TimeoutPhase};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn update_max(max: &AtomicUsize, value: usize) {
    let mut current = max.load(Ordering::SeqCst);
    while value > current {
        match max.compare_exchange(current, value, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}

/// Counts calls and tracks peak concurrency and call times.
#[derive(Clone, Default)]
struct Probe {
    calls: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    call_times: Arc<Mutex<Vec<Instant>>>,
}

impl Probe {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every call sleeps `delay` and answers `status` with the request URL as body.
    fn transport(&self, status: StatusCode, delay: Duration) -> Arc<dyn Transport> {
        let probe = self.clone();
        Arc::new(FnTransport::new(move |request: Request| {
            let probe = probe.clone();
            async move {
                probe.calls.fetch_add(1, Ordering::SeqCst);
                let active = probe.active.fetch_add(1, Ordering::SeqCst) + 1;
                update_max(&probe.max_active, active);
                lock_unpoisoned(&probe.call_times).push(Instant::now());
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                probe.active.fetch_sub(1, Ordering::SeqCst);
                Ok(TransportResponse::new(status, request.full_url()))
            }
        }))
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_identical_requests_share_one_transport_call() {
    let probe = Probe::default();
    let client = Client::builder("https://api.example.com")
        .transport_arc(probe.transport(StatusCode::CREATED, Duration::from_millis(50)))
        .deduplication(true)
        .max_concurrent(1)
        .build();

    let order = serde_json::json!({"sku": "A-1", "quantity": 2});
    let send = || async {
        client
            .post("/orders")
            .json(&order)
            .expect("serializable body")
            .send()
            .await
    };
    let (first, second, third) = tokio::join!(send(), send(), send());

    for result in [first, second, third] {
        let response = result.expect("shared outcome");
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.text_lossy(), "https://api.example.com/orders");
    }
    assert_eq!(probe.calls(), 1);
    let gate = client.gate_stats();
    assert_eq!(gate.deduplicated, 2);
    assert_eq!(gate.in_flight_keys, 0);
}

#[tokio::test(start_paused = true)]
async fn prioritized_identical_requests_attach_instead_of_queueing() {
    let probe = Probe::default();
    let mut config = ClientConfig::default();
    config.priority.enabled = true;
    config.concurrency.max_concurrent = Some(1);
    config.concurrency.deduplication = true;
    let client = Client::builder("https://api.example.com")
        .config(config)
        .transport_arc(probe.transport(StatusCode::CREATED, Duration::from_millis(50)))
        .build();

    let order = serde_json::json!({"sku": "B-7", "quantity": 1});
    let send = || async {
        client
            .post("/orders")
            .json(&order)
            .expect("serializable body")
            .send()
            .await
    };
    let (first, second, third) = tokio::join!(send(), send(), send());

    for result in [first, second, third] {
        assert_eq!(result.expect("shared outcome").status(), StatusCode::CREATED);
    }
    assert_eq!(probe.calls(), 1);
    assert_eq!(client.gate_stats().deduplicated, 2);
    let scheduler = client.scheduler_stats();
    assert_eq!(scheduler.completed, 1);
    assert_eq!(scheduler.queued, 0);
}

#[tokio::test(start_paused = true)]
async fn distinct_requests_respect_max_concurrent() {
    let probe = Probe::default();
    let client = Client::builder("https://api.example.com")
        .transport_arc(probe.transport(StatusCode::OK, Duration::from_millis(20)))
        .max_concurrent(2)
        .build();

    let send = |path: &'static str| {
        let client = client.clone();
        async move { client.get(path).send().await }
    };
    let results = futures_util::future::join_all(
        ["/a", "/b", "/c", "/d", "/e"].into_iter().map(send),
    )
    .await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(probe.calls(), 5);
    assert_eq!(probe.max_active.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn cached_response_is_served_until_ttl_expires() {
    let probe = Probe::default();
    let client = Client::builder("https://api.example.com")
        .transport_arc(probe.transport(StatusCode::OK, Duration::ZERO))
        .cache(true)
        .cache_ttl(Duration::from_secs(5))
        .build();

    let first = client.get("/users").send().await.expect("first fetch");
    assert!(!first.from_cache());

    tokio::time::advance(Duration::from_secs(2)).await;
    let second = client.get("/users").send().await.expect("cached fetch");
    assert!(second.from_cache());
    assert_eq!(second.body(), first.body());
    assert_eq!(probe.calls(), 1);

    tokio::time::advance(Duration::from_secs(4)).await;
    let third = client.get("/users").send().await.expect("refetch after expiry");
    assert!(!third.from_cache());
    assert_eq!(probe.calls(), 2);

    let stats = client.cache_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.writes, 2);
}

#[tokio::test]
async fn non_idempotent_requests_are_not_cached_by_default() {
    let probe = Probe::default();
    let client = Client::builder("https://api.example.com")
        .transport_arc(probe.transport(StatusCode::OK, Duration::ZERO))
        .cache(true)
        .build();

    client.post("/events").send().await.expect("first post");
    client.post("/events").send().await.expect("second post");
    assert_eq!(probe.calls(), 2);

    client.post("/search").cache(true).send().await.expect("opted in");
    let cached = client.post("/search").cache(true).send().await.expect("cached");
    assert!(cached.from_cache());
    assert_eq!(probe.calls(), 3);
}

#[tokio::test]
async fn invalidation_drops_cached_entries() {
    let probe = Probe::default();
    let client = Client::builder("https://api.example.com")
        .transport_arc(probe.transport(StatusCode::OK, Duration::ZERO))
        .cache(true)
        .build();

    client.get("/users/1").send().await.expect("fetch user 1");
    client.get("/users/2").send().await.expect("fetch user 2");
    client.get("/teams/1").send().await.expect("fetch team");

    assert!(client.invalidate(Request::get("/teams/1")).expect("alive"));
    assert_eq!(
        client
            .invalidate_prefix("https://api.example.com/users/")
            .expect("alive"),
        2
    );
    assert_eq!(client.cache_stats().entries, 0);

    client.get("/users/1").send().await.expect("refetch");
    assert_eq!(probe.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn failing_request_is_attempted_retries_plus_one_times() {
    let probe = Probe::default();
    let client = Client::builder("https://api.example.com")
        .transport_arc(probe.transport(StatusCode::SERVICE_UNAVAILABLE, Duration::ZERO))
        .retry_policy(
            RetryPolicy::standard()
                .max_retries(3)
                .base_delay(Duration::from_millis(100))
                .jitter_ratio(0.0),
        )
        .build();

    let error = client.get("/flaky").send().await.expect_err("retries exhausted");
    assert_eq!(error.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
    assert_eq!(probe.calls(), 4);

    let times = lock_unpoisoned(&probe.call_times).clone();
    let gaps: Vec<Duration> = times.windows(2).map(|pair| pair[1] - pair[0]).collect();
    for (gap, expected_ms) in gaps.iter().zip([100_u64, 200, 400]) {
        assert!(*gap >= Duration::from_millis(expected_ms), "gap {gap:?}");
        assert!(*gap < Duration::from_millis(expected_ms + 10), "gap {gap:?}");
    }
}

#[tokio::test]
async fn non_retryable_status_fails_after_one_attempt() {
    let probe = Probe::default();
    let client = Client::builder("https://api.example.com")
        .transport_arc(probe.transport(StatusCode::NOT_FOUND, Duration::ZERO))
        .retry_policy(RetryPolicy::standard().base_delay(Duration::from_millis(1)))
        .build();

    let error = client.get("/missing").send().await.expect_err("404");
    assert_eq!(error.status(), Some(StatusCode::NOT_FOUND));
    assert_eq!(probe.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_requests_are_admitted_by_priority() {
    let release = Arc::new(Notify::new());
    let paths = Arc::new(Mutex::new(Vec::new()));
    let transport = {
        let release = Arc::clone(&release);
        let paths = Arc::clone(&paths);
        FnTransport::new(move |request: Request| {
            let release = Arc::clone(&release);
            let paths = Arc::clone(&paths);
            async move {
                let path = url::Url::parse(request.url())
                    .map(|url| url.path().to_owned())
                    .unwrap_or_default();
                if path == "/block" {
                    release.notified().await;
                }
                lock_unpoisoned(&paths).push(path);
                Ok(TransportResponse::ok("done"))
            }
        })
    };
    let mut config = ClientConfig::default();
    config.priority.enabled = true;
    config.priority.max_concurrent = Some(1);
    let client = Client::builder("https://api.example.com")
        .config(config)
        .transport(transport)
        .build();

    let blocker = {
        let client = client.clone();
        tokio::spawn(async move { client.get("/block").priority(Priority::LOW).send().await })
    };
    while client.scheduler_stats().running == 0 {
        tokio::task::yield_now().await;
    }

    let mut handles = Vec::new();
    for (path, priority) in [
        ("/low", Priority::LOW),
        ("/high", Priority::HIGH),
        ("/normal", Priority::NORMAL),
    ] {
        let task_client = client.clone();
        handles.push(tokio::spawn(async move {
            task_client.get(path).priority(priority).send().await
        }));
        while client.scheduler_stats().queued < handles.len() {
            tokio::task::yield_now().await;
        }
    }

    release.notify_one();
    blocker.await.expect("task").expect("blocker completes");
    for handle in handles {
        handle.await.expect("task").expect("request completes");
    }
    assert_eq!(
        *lock_unpoisoned(&paths),
        vec!["/block", "/high", "/normal", "/low"]
    );
}

#[tokio::test]
async fn plain_requests_take_the_fast_path() {
    let probe = Probe::default();
    let client = Client::builder("https://api.example.com")
        .transport_arc(probe.transport(StatusCode::OK, Duration::ZERO))
        .build();

    let response = client.get("/ping").send().await.expect("fast path response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(probe.calls(), 1);
    assert_eq!(client.cache_stats().misses, 0);
    assert_eq!(client.stats().count, 0);
    assert_eq!(client.gate_stats().active, 0);
}

#[tokio::test]
async fn interceptors_rewrite_requests_and_responses() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let transport = {
        let seen = Arc::clone(&seen);
        FnTransport::new(move |request: Request| {
            let seen = Arc::clone(&seen);
            async move {
                let token = request
                    .headers()
                    .get("authorization")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default()
                    .to_owned();
                lock_unpoisoned(&seen).push(token);
                Ok(TransportResponse::ok("payload"))
            }
        })
    };
    let client = Client::builder("https://api.example.com")
        .transport(transport)
        .build();

    client.interceptors().add_request_interceptor(|mut request| {
        request.headers_mut().insert(
            http::header::AUTHORIZATION,
            http::HeaderValue::from_static("Bearer first"),
        );
        Ok(request)
    });
    let second = client.interceptors().add_request_interceptor(|mut request| {
        request.headers_mut().insert(
            http::header::AUTHORIZATION,
            http::HeaderValue::from_static("Bearer second"),
        );
        Ok(request)
    });
    client.interceptors().add_response_interceptor(|mut response| {
        let body = format!("{}!", response.text_lossy());
        response.set_body(body);
        Ok(response)
    });

    let response = client.get("/me").send().await.expect("intercepted");
    assert_eq!(response.text_lossy(), "payload!");

    assert!(client.interceptors().remove(second));
    client.get("/me").send().await.expect("intercepted again");
    assert_eq!(
        *lock_unpoisoned(&seen),
        vec!["Bearer second".to_owned(), "Bearer first".to_owned()]
    );
}

#[tokio::test]
async fn error_interceptor_can_recover_a_failed_request() {
    let probe = Probe::default();
    let client = Client::builder("https://api.example.com")
        .transport_arc(probe.transport(StatusCode::BAD_GATEWAY, Duration::ZERO))
        .cache(true)
        .build();
    client.interceptors().add_error_interceptor(|error| match error.response() {
        Some(response) if response.status() == StatusCode::BAD_GATEWAY => {
            let mut fallback = response.clone();
            fallback.set_body("fallback");
            Ok(fallback)
        }
        _ => Err(error),
    });

    let recovered = client.get("/feed").send().await.expect("recovered");
    assert_eq!(recovered.text_lossy(), "fallback");
    assert_eq!(client.cache_stats().writes, 0);

    client.get("/feed").send().await.expect("recovered again");
    assert_eq!(probe.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn total_timeout_bounds_the_whole_pipeline() {
    let probe = Probe::default();
    let client = Client::builder("https://api.example.com")
        .transport_arc(probe.transport(StatusCode::OK, Duration::from_secs(10)))
        .total_timeout(Duration::from_secs(1))
        .build();

    let error = client.get("/slow").send().await.expect_err("deadline");
    assert!(matches!(
        error,
        Error::Timeout {
            phase: TimeoutPhase::Total,
            ..
        }
    ));

    let error = client
        .get("/slow")
        .timeout(Duration::from_millis(200))
        .send()
        .await
        .expect_err("attempt timeout");
    assert!(matches!(
        error,
        Error::Timeout {
            phase: TimeoutPhase::Transport,
            ..
        }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_one_waiter_leaves_the_shared_request_running() {
    let release = Arc::new(Notify::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let transport = {
        let release = Arc::clone(&release);
        let calls = Arc::clone(&calls);
        FnTransport::new(move |_request: Request| {
            let release = Arc::clone(&release);
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                release.notified().await;
                Ok(TransportResponse::ok("shared"))
            }
        })
    };
    let client = Client::builder("https://api.example.com")
        .transport(transport)
        .deduplication(true)
        .build();

    let owner = {
        let client = client.clone();
        tokio::spawn(async move { client.get("/report").send().await })
    };
    while calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }

    let token = CancellationToken::new();
    let waiter = {
        let client = client.clone();
        let token = token.clone();
        tokio::spawn(async move { client.get("/report").cancel_token(token).send().await })
    };
    while client.gate_stats().attached == 0 {
        tokio::task::yield_now().await;
    }
    token.cancel();
    let cancelled = waiter.await.expect("task").expect_err("cancelled");
    assert!(matches!(
        cancelled,
        Error::Cancelled {
            reason: CancelReason::Explicit
        }
    ));

    release.notify_one();
    let response = owner.await.expect("task").expect("owner completes");
    assert_eq!(response.text_lossy(), "shared");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn destroy_rejects_in_flight_and_later_requests() {
    let calls = Arc::new(AtomicUsize::new(0));
    let transport = {
        let calls = Arc::clone(&calls);
        FnTransport::new(move |_request: Request| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<Result<TransportResponse, TransportError>>().await
            }
        })
    };
    let client = Client::builder("https://api.example.com")
        .transport(transport)
        .max_concurrent(1)
        .deduplication(true)
        .monitor(true)
        .build();

    let running = {
        let client = client.clone();
        tokio::spawn(async move { client.get("/a").send().await })
    };
    let queued = {
        let client = client.clone();
        tokio::spawn(async move { client.get("/b").send().await })
    };
    while calls.load(Ordering::SeqCst) == 0 || client.gate_stats().queued == 0 {
        tokio::task::yield_now().await;
    }

    client.destroy();
    client.destroy();

    for handle in [running, queued] {
        let error = handle.await.expect("task").expect_err("destroyed");
        assert!(matches!(
            error,
            Error::Cancelled {
                reason: CancelReason::Destroyed
            }
        ));
    }
    let error = client.get("/c").send().await.expect_err("destroyed client");
    assert!(matches!(error, Error::ClientDestroyed));
    assert!(client.is_destroyed());
    assert_eq!(client.stats().count, 0);
}

#[tokio::test(start_paused = true)]
async fn monitor_records_outcomes_and_retries() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let transport = {
        let attempts = Arc::clone(&attempts);
        FnTransport::new(move |request: Request| {
            let attempts = Arc::clone(&attempts);
            async move {
                if request.url().ends_with("/broken") {
                    return Ok(TransportResponse::new(StatusCode::BAD_REQUEST, "bad"));
                }
                if request.url().ends_with("/flaky") && attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(TransportError::network("connection reset"));
                }
                Ok(TransportResponse::ok("ok"))
            }
        })
    };
    let client = Client::builder("https://api.example.com")
        .transport(transport)
        .monitor(true)
        .retry_policy(RetryPolicy::standard().base_delay(Duration::from_millis(10)))
        .build();

    client.get("/fine").send().await.expect("ok");
    client.get("/flaky").send().await.expect("ok after one retry");
    client.get("/broken").send().await.expect_err("400");

    let stats = client.stats();
    assert_eq!(stats.count, 3);
    assert_eq!(stats.success_count, 2);
    assert_eq!(stats.error_count, 1);
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.status_counts.get(&200), Some(&2));
    assert_eq!(stats.status_counts.get(&400), Some(&1));
    assert_eq!(client.failed_requests().len(), 1);
    assert_eq!(client.recent_metrics(2).len(), 2);

    let export = client.export_metrics().expect("monitor enabled");
    assert_eq!(export.samples.len(), 3);
}

#[tokio::test]
async fn unsampled_requests_do_not_stay_in_flight() {
    let probe = Probe::default();
    let client = Client::builder("https://api.example.com")
        .transport_arc(probe.transport(StatusCode::OK, Duration::ZERO))
        .monitor_config(MonitorConfig {
            enabled: true,
            sampling_rate: 0.0,
            ..MonitorConfig::default()
        })
        .build();

    for _ in 0..3 {
        client.get("/a").send().await.expect("ok");
    }

    let stats = client.stats();
    assert_eq!(stats.requests_started, 3);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.count, 0);
}

#[tokio::test(start_paused = true)]
async fn dropped_request_future_leaves_nothing_in_flight() {
    let client = Client::builder("https://api.example.com")
        .transport(FnTransport::new(|_request: Request| async {
            std::future::pending::<Result<TransportResponse, TransportError>>().await
        }))
        .monitor(true)
        .build();

    let outcome = tokio::time::timeout(Duration::from_millis(10), client.get("/hang").send()).await;
    assert!(outcome.is_err());

    let stats = client.stats();
    assert_eq!(stats.requests_started, 1);
    assert_eq!(stats.in_flight, 0);
    assert!(client.export_metrics().expect("monitor enabled").samples.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connection_pool_limits_slots_per_host() {
    let probe = Probe::default();
    let client = Client::builder("https://api.example.com")
        .transport_arc(probe.transport(StatusCode::OK, Duration::from_millis(20)))
        .connection_pool(PoolConfig {
            enabled: true,
            max_connections: 1,
            ..PoolConfig::default()
        })
        .build();

    let send = |path: &'static str| {
        let client = client.clone();
        async move { client.get(path).send().await }
    };
    let results = futures_util::future::join_all(["/a", "/b", "/c"].into_iter().map(send)).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(probe.max_active.load(Ordering::SeqCst), 1);

    let stats = client.pool_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].host, "api.example.com:443");
    assert_eq!(stats[0].created, 1);
    assert_eq!(stats[0].total_uses, 3);
    assert_eq!(stats[0].idle, 1);
}
