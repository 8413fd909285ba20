//! Bounded admission with an ordered wait queue.
//!
//! Used by the concurrency gate and the priority scheduler. Waiters are keyed
//! by `(descending priority, arrival sequence)`, which gives FIFO order within
//! a priority and strict priority order across them. Releasing a permit hands
//! the slot directly to the head waiter, so a slot is never observed free
//! while someone is queued.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::trace;

use crate::error::{CancelReason, Error};
use crate::request::Priority;
use crate::util::lock_unpoisoned;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueueOrder {
    #[default]
    Fifo,
    Priority,
}

type WaitKey = (Reverse<i32>, u64);
type Grant = Result<(), CancelReason>;

#[derive(Debug)]
struct State {
    active: usize,
    max_active: usize,
    max_queue: Option<usize>,
    waiters: BTreeMap<WaitKey, oneshot::Sender<Grant>>,
    next_seq: u64,
    closed: bool,
}

impl State {
    /// Hands the released slot to the first live waiter, or frees it.
    fn release_locked(&mut self) {
        while let Some((_, sender)) = self.waiters.pop_first() {
            if sender.send(Ok(())).is_ok() {
                return;
            }
        }
        self.active = self.active.saturating_sub(1);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AdmissionStats {
    pub active: usize,
    pub queued: usize,
    pub max_active: usize,
}

#[derive(Debug)]
pub(crate) struct Admission {
    state: Arc<Mutex<State>>,
    order: QueueOrder,
}

impl Admission {
    pub(crate) fn new(max_active: usize, max_queue: Option<usize>, order: QueueOrder) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                active: 0,
                max_active: max_active.max(1),
                max_queue,
                waiters: BTreeMap::new(),
                next_seq: 0,
                closed: false,
            })),
            order,
        }
    }

    /// Waits for a slot. Dropping the returned future while queued removes
    /// the waiter from the queue.
    pub(crate) async fn acquire(&self, priority: Priority) -> Result<AdmissionPermit, Error> {
        let mut waiter = {
            let mut state = lock_unpoisoned(&self.state);
            if state.closed {
                return Err(Error::cancelled(CancelReason::Destroyed));
            }
            if state.active < state.max_active && state.waiters.is_empty() {
                state.active += 1;
                return Ok(AdmissionPermit {
                    state: Arc::clone(&self.state),
                });
            }
            if let Some(max_queue) = state.max_queue
                && state.waiters.len() >= max_queue
            {
                trace!(max_queue, "admission queue full");
                return Err(Error::cancelled(CancelReason::QueueFull));
            }

            let rank = match self.order {
                QueueOrder::Fifo => 0,
                QueueOrder::Priority => priority.value(),
            };
            let key = (Reverse(rank), state.next_seq);
            state.next_seq += 1;
            let (sender, receiver) = oneshot::channel();
            state.waiters.insert(key, sender);
            trace!(
                priority = rank,
                queued = state.waiters.len(),
                "waiting for admission"
            );
            Waiter {
                state: Arc::clone(&self.state),
                key,
                receiver,
                settled: false,
            }
        };

        let grant = (&mut waiter.receiver).await;
        waiter.settled = true;
        match grant {
            Ok(Ok(())) => Ok(AdmissionPermit {
                state: Arc::clone(&self.state),
            }),
            Ok(Err(reason)) => Err(Error::cancelled(reason)),
            Err(_) => Err(Error::cancelled(CancelReason::Destroyed)),
        }
    }

    /// Rejects every queued waiter with `reason`; active permits are untouched.
    pub(crate) fn reject_queued(&self, reason: CancelReason) -> usize {
        let waiters = std::mem::take(&mut lock_unpoisoned(&self.state).waiters);
        let rejected = waiters.len();
        for (_, sender) in waiters {
            let _ = sender.send(Err(reason));
        }
        rejected
    }

    /// Rejects queued waiters and refuses all future acquisitions.
    pub(crate) fn close(&self) {
        lock_unpoisoned(&self.state).closed = true;
        self.reject_queued(CancelReason::Destroyed);
    }

    pub(crate) fn stats(&self) -> AdmissionStats {
        let state = lock_unpoisoned(&self.state);
        AdmissionStats {
            active: state.active,
            queued: state.waiters.len(),
            max_active: state.max_active,
        }
    }
}

struct Waiter {
    state: Arc<Mutex<State>>,
    key: WaitKey,
    receiver: oneshot::Receiver<Grant>,
    settled: bool,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = lock_unpoisoned(&self.state);
        if state.waiters.remove(&self.key).is_some() {
            return;
        }
        // A slot was handed over after this waiter stopped listening.
        if let Ok(Ok(())) = self.receiver.try_recv() {
            state.release_locked();
        }
    }
}

/// One admitted slot; released when dropped.
#[derive(Debug)]
pub(crate) struct AdmissionPermit {
    state: Arc<Mutex<State>>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        lock_unpoisoned(&self.state).release_locked();
    }
}
