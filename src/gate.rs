//! In-flight deduplication layered over a concurrency bound.
//!
//! Per fingerprint the registry moves `absent → in-flight → settled → absent`.
//! The first request for a fingerprint owns the execution and takes an
//! admission slot; identical requests arriving while it is in flight attach to
//! it, receive a clone of its outcome and never count against the bound.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::watch;
use tracing::{debug, trace};

use crate::admission::{Admission, AdmissionStats, QueueOrder};
use crate::error::{CancelReason, Error};
use crate::fingerprint::Fingerprint;
use crate::request::Priority;
use crate::response::Response;
use crate::util::lock_unpoisoned;

type Outcome = Result<Response, Error>;

#[derive(Debug)]
struct InFlight {
    outcome: watch::Sender<Option<Outcome>>,
    waiters: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GateStats {
    /// Executions currently holding a concurrency slot.
    pub active: usize,
    /// Owners waiting for a concurrency slot.
    pub queued: usize,
    /// Fingerprints with an execution in flight.
    pub in_flight_keys: usize,
    /// Requests currently attached to another request's execution.
    pub attached: usize,
    /// Requests ever served by attaching instead of executing.
    pub deduplicated: u64,
    pub max_concurrent: Option<usize>,
}

#[derive(Debug)]
pub(crate) struct Gate {
    admission: Option<Admission>,
    in_flight: Mutex<HashMap<Fingerprint, InFlight>>,
    deduplicated: AtomicU64,
    closed: AtomicBool,
}

enum Role {
    Owner,
    Attached(watch::Receiver<Option<Outcome>>),
}

impl Gate {
    pub(crate) fn new(
        max_concurrent: Option<usize>,
        max_queue: Option<usize>,
        order: QueueOrder,
    ) -> Self {
        Self {
            admission: max_concurrent.map(|max| Admission::new(max, max_queue, order)),
            in_flight: Mutex::new(HashMap::new()),
            deduplicated: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_bounded(&self) -> bool {
        self.admission.is_some()
    }

    /// Runs `work` under the concurrency bound. With a fingerprint, identical
    /// concurrent calls share one execution of `work`.
    pub(crate) async fn run<F, Fut>(
        &self,
        key: Option<Fingerprint>,
        priority: Priority,
        work: F,
    ) -> Outcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::cancelled(CancelReason::Destroyed));
        }
        let Some(key) = key else {
            return self.run_admitted(priority, work).await;
        };

        match self.register(&key) {
            Role::Attached(receiver) => self.attach(&key, receiver).await,
            Role::Owner => {
                let mut owner = OwnerGuard {
                    gate: self,
                    key: Some(key),
                };
                let outcome = self.run_admitted(priority, work).await;
                owner.settle(outcome.clone());
                outcome
            }
        }
    }

    fn register(&self, key: &Fingerprint) -> Role {
        let mut in_flight = lock_unpoisoned(&self.in_flight);
        if let Some(entry) = in_flight.get_mut(key) {
            entry.waiters += 1;
            self.deduplicated.fetch_add(1, Ordering::Relaxed);
            trace!(fingerprint = %key, waiters = entry.waiters, "attached to in-flight request");
            return Role::Attached(entry.outcome.subscribe());
        }
        let (outcome, _) = watch::channel(None);
        in_flight.insert(
            key.clone(),
            InFlight {
                outcome,
                waiters: 0,
            },
        );
        Role::Owner
    }

    async fn attach(&self, key: &Fingerprint, mut receiver: watch::Receiver<Option<Outcome>>) -> Outcome {
        let _attachment = Attachment { gate: self, key };
        match receiver.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome)
                .clone()
                .unwrap_or_else(|| Err(Error::cancelled(CancelReason::Explicit))),
            Err(_) => Err(Error::cancelled(CancelReason::Explicit)),
        }
    }

    async fn run_admitted<F, Fut>(&self, priority: Priority, work: F) -> Outcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome>,
    {
        let _permit = match &self.admission {
            Some(admission) => Some(admission.acquire(priority).await?),
            None => None,
        };
        work().await
    }

    /// Rejects queued owners and every attached waiter with `Destroyed`.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(admission) = &self.admission {
            admission.close();
        }
        let entries = std::mem::take(&mut *lock_unpoisoned(&self.in_flight));
        for (_, entry) in entries {
            entry
                .outcome
                .send_replace(Some(Err(Error::cancelled(CancelReason::Destroyed))));
        }
    }

    pub(crate) fn stats(&self) -> GateStats {
        let admission = self
            .admission
            .as_ref()
            .map(Admission::stats)
            .unwrap_or_default();
        let (in_flight_keys, attached) = {
            let in_flight = lock_unpoisoned(&self.in_flight);
            (
                in_flight.len(),
                in_flight.values().map(|entry| entry.waiters).sum(),
            )
        };
        let AdmissionStats {
            active,
            queued,
            max_active,
        } = admission;
        GateStats {
            active,
            queued,
            in_flight_keys,
            attached,
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            max_concurrent: self.admission.as_ref().map(|_| max_active),
        }
    }
}

/// Removes the in-flight entry exactly once. If the owner is dropped before
/// settling, attached waiters are rejected.
struct OwnerGuard<'a> {
    gate: &'a Gate,
    key: Option<Fingerprint>,
}

impl OwnerGuard<'_> {
    fn settle(&mut self, outcome: Outcome) {
        let Some(key) = self.key.take() else {
            return;
        };
        let Some(entry) = lock_unpoisoned(&self.gate.in_flight).remove(&key) else {
            return;
        };
        if entry.waiters > 0 {
            debug!(fingerprint = %key, waiters = entry.waiters, "fanning out shared outcome");
        }
        entry.outcome.send_replace(Some(outcome));
    }
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let reason = if self.gate.closed.load(Ordering::Acquire) {
            CancelReason::Destroyed
        } else {
            CancelReason::Explicit
        };
        if let Some(entry) = lock_unpoisoned(&self.gate.in_flight).remove(&key) {
            entry
                .outcome
                .send_replace(Some(Err(Error::cancelled(reason))));
        }
    }
}

struct Attachment<'a> {
    gate: &'a Gate,
    key: &'a Fingerprint,
}

impl Drop for Attachment<'_> {
    fn drop(&mut self) {
        if let Some(entry) = lock_unpoisoned(&self.gate.in_flight).get_mut(self.key) {
            entry.waiters = entry.waiters.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};
    use tokio::sync::Notify;

    use super::Gate;
    use crate::admission::QueueOrder;
    use crate::error::{CancelReason, Error};
    use crate::fingerprint::Fingerprint;
    use crate::request::{Priority, Request};
    use crate::response::Response;

    fn ok_response(body: &'static str) -> Response {
        Response::new(
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(body.as_bytes()),
            Arc::new(Request::get("https://api.example.com/users")),
        )
    }

    fn key() -> Fingerprint {
        Fingerprint::of(&Request::get("https://api.example.com/users"), &[])
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn identical_requests_share_one_execution() {
        let gate = Arc::new(Gate::new(Some(1), None, QueueOrder::Fifo));
        let executions = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        let mut handles = Vec::new();
        for _ in 0..5 {
            let gate = Arc::clone(&gate);
            let executions = Arc::clone(&executions);
            let release = Arc::clone(&release);
            handles.push(tokio::spawn(async move {
                gate.run(Some(key()), Priority::NORMAL, || async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    release.notified().await;
                    Ok(ok_response("shared"))
                })
                .await
            }));
        }

        while gate.stats().attached < 4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(gate.stats().in_flight_keys, 1);
        release.notify_one();

        for handle in handles {
            let response = handle.await.expect("task").expect("shared response");
            assert_eq!(response.body().as_ref(), b"shared");
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        let stats = gate.stats();
        assert_eq!(stats.deduplicated, 4);
        assert_eq!(stats.in_flight_keys, 0);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn owner_failure_is_delivered_to_every_waiter() {
        let gate = Arc::new(Gate::new(None, None, QueueOrder::Fifo));
        let release = Arc::new(Notify::new());

        let owner = {
            let gate = Arc::clone(&gate);
            let release = Arc::clone(&release);
            tokio::spawn(async move {
                gate.run(Some(key()), Priority::NORMAL, || async move {
                    release.notified().await;
                    Err(Error::interceptor("upstream rejected"))
                })
                .await
            })
        };
        while gate.stats().in_flight_keys == 0 {
            tokio::task::yield_now().await;
        }
        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                gate.run(Some(key()), Priority::NORMAL, || async {
                    Ok(ok_response("unexpected"))
                })
                .await
            })
        };
        while gate.stats().attached == 0 {
            tokio::task::yield_now().await;
        }
        release.notify_one();

        let owner = owner.await.expect("task").expect_err("owner fails");
        let waiter = waiter.await.expect("task").expect_err("waiter fails");
        assert_eq!(owner.to_string(), waiter.to_string());
    }

    #[tokio::test]
    async fn cancelling_an_attached_waiter_leaves_the_execution_running() {
        let gate = Arc::new(Gate::new(None, None, QueueOrder::Fifo));
        let release = Arc::new(Notify::new());

        let owner = {
            let gate = Arc::clone(&gate);
            let release = Arc::clone(&release);
            tokio::spawn(async move {
                gate.run(Some(key()), Priority::NORMAL, || async move {
                    release.notified().await;
                    Ok(ok_response("done"))
                })
                .await
            })
        };
        while gate.stats().in_flight_keys == 0 {
            tokio::task::yield_now().await;
        }

        let detached = tokio::time::timeout(
            Duration::from_millis(5),
            gate.run(Some(key()), Priority::NORMAL, || async {
                Ok(ok_response("unexpected"))
            }),
        )
        .await;
        assert!(detached.is_err());
        assert_eq!(gate.stats().attached, 0);

        release.notify_one();
        let response = owner.await.expect("task").expect("owner completes");
        assert_eq!(response.body().as_ref(), b"done");
    }

    #[tokio::test]
    async fn dropping_the_owner_rejects_attached_waiters() {
        let gate = Arc::new(Gate::new(None, None, QueueOrder::Fifo));

        let owner = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                gate.run(Some(key()), Priority::NORMAL, || std::future::pending())
                    .await
            })
        };
        while gate.stats().in_flight_keys == 0 {
            tokio::task::yield_now().await;
        }
        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                gate.run(Some(key()), Priority::NORMAL, || std::future::pending())
                    .await
            })
        };
        while gate.stats().attached == 0 {
            tokio::task::yield_now().await;
        }

        owner.abort();
        let waiter = waiter.await.expect("task");
        assert!(matches!(
            waiter,
            Err(Error::Cancelled {
                reason: CancelReason::Explicit
            })
        ));
        assert_eq!(gate.stats().in_flight_keys, 0);
    }
}
