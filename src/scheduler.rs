use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use http::Method;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::admission::{Admission, QueueOrder};
use crate::error::{CancelReason, Error, TimeoutPhase};
use crate::request::Priority;
use crate::util::lock_unpoisoned;

/// Describes one unit of scheduled work.
#[derive(Clone, Debug)]
pub struct TaskOptions {
    priority: Priority,
    timeout: Option<Duration>,
    method: Method,
    label: String,
}

impl TaskOptions {
    pub fn new(priority: Priority) -> Self {
        Self {
            priority,
            timeout: None,
            method: Method::GET,
            label: "scheduled-task".to_owned(),
        }
    }

    /// Rejects the task with a scheduler timeout if it has not settled within
    /// `timeout` of being scheduled, whether it is still queued or running.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Method and URI reported by timeout errors.
    pub fn label(mut self, method: Method, uri: impl Into<String>) -> Self {
        self.method = method;
        self.label = uri.into();
        self
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub queued: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
}

/// Admits work by descending priority, FIFO within a priority.
///
/// Admitted work is never preempted. A lower-priority task that is already
/// running keeps its slot until it settles.
#[derive(Debug)]
pub struct PriorityScheduler {
    admission: Admission,
    generation: Mutex<CancellationToken>,
    next_task_id: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
}

impl PriorityScheduler {
    pub fn new(max_concurrent: usize, max_queue: Option<usize>) -> Self {
        Self {
            admission: Admission::new(max_concurrent, max_queue, QueueOrder::Priority),
            generation: Mutex::new(CancellationToken::new()),
            next_task_id: AtomicU64::new(1),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        }
    }

    pub async fn schedule<F, Fut, T>(&self, options: TaskOptions, work: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let generation = lock_unpoisoned(&self.generation).clone();
        trace!(
            task_id,
            priority = options.priority.value(),
            "scheduling task"
        );

        let admitted = async {
            let _permit = self.admission.acquire(options.priority).await?;
            trace!(task_id, "task admitted");
            work().await
        };
        let bounded = async {
            match options.timeout {
                Some(timeout) => tokio::time::timeout(timeout, admitted)
                    .await
                    .unwrap_or_else(|_| {
                        Err(Error::Timeout {
                            phase: TimeoutPhase::Scheduler,
                            timeout_ms: timeout.as_millis(),
                            method: options.method.clone(),
                            uri: options.label.clone(),
                        })
                    }),
                None => admitted.await,
            }
        };

        let result = tokio::select! {
            biased;
            _ = generation.cancelled() => Err(Error::cancelled(CancelReason::SchedulerReset)),
            result = bounded => result,
        };
        self.record(task_id, &result);
        result
    }

    fn record<T>(&self, task_id: u64, result: &Result<T, Error>) {
        let counter = match result {
            Ok(_) => &self.completed,
            Err(Error::Cancelled { .. }) => &self.cancelled,
            Err(Error::Timeout {
                phase: TimeoutPhase::Scheduler,
                ..
            }) => &self.timed_out,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if let Err(error) = result {
            trace!(task_id, error = %error, "task settled with error");
        }
    }

    /// Rejects every queued and running task with `SchedulerReset`. Tasks
    /// scheduled afterwards are unaffected.
    pub fn cancel_all(&self) -> usize {
        let previous = std::mem::replace(
            &mut *lock_unpoisoned(&self.generation),
            CancellationToken::new(),
        );
        let running = self.admission.stats().active;
        previous.cancel();
        let queued = self.admission.reject_queued(CancelReason::SchedulerReset);
        debug!(queued, running, "cancelled all scheduled tasks");
        queued + running
    }

    pub(crate) fn close(&self) {
        self.admission.close();
        lock_unpoisoned(&self.generation).cancel();
    }

    pub fn stats(&self) -> SchedulerStats {
        let admission = self.admission.stats();
        SchedulerStats {
            queued: admission.queued,
            running: admission.active,
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}
