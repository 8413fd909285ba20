//! Logical per-host connection slots.
//!
//! Nothing here opens a socket. A slot is bookkeeping that bounds how many
//! requests per `host:port` the pipeline lets through at once, and ages slots
//! out the way a real pool would recycle connections.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::util::lock_unpoisoned;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Active,
    Closed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_connections: usize,
    pub max_connection_age: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_connections: 6,
            max_connection_age: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("timed out after {timeout_ms}ms waiting for a connection slot")]
    Timeout { timeout_ms: u128 },
    #[error("connection pool is closed")]
    Closed,
}

#[derive(Debug)]
struct Slot {
    id: u64,
    state: SlotState,
    created_at: Instant,
    last_used_at: Instant,
    use_count: u64,
}

impl Slot {
    fn is_reusable(&self, now: Instant, limits: &PoolLimits) -> bool {
        self.state == SlotState::Idle
            && now.duration_since(self.created_at) < limits.max_connection_age
            && now.duration_since(self.last_used_at) < limits.idle_timeout
    }
}

#[derive(Debug, Default)]
struct HostSlots {
    slots: Vec<Slot>,
    waiters: VecDeque<(u64, oneshot::Sender<u64>)>,
    created: u64,
}

impl HostSlots {
    fn open_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state != SlotState::Closed)
            .count()
    }

    fn close_expired(&mut self, now: Instant, limits: &PoolLimits) {
        for slot in &mut self.slots {
            if slot.state == SlotState::Idle && !slot.is_reusable(now, limits) {
                slot.state = SlotState::Closed;
            }
        }
        self.slots.retain(|slot| slot.state != SlotState::Closed);
    }

    /// Marks a reusable or newly created slot active and returns its id.
    fn claim(&mut self, now: Instant, limits: &PoolLimits, next_id: &AtomicU64) -> Option<u64> {
        self.close_expired(now, limits);
        if let Some(slot) = self
            .slots
            .iter_mut()
            .rev()
            .find(|slot| slot.is_reusable(now, limits))
        {
            slot.state = SlotState::Active;
            slot.last_used_at = now;
            slot.use_count += 1;
            return Some(slot.id);
        }
        if self.open_count() >= limits.max_connections {
            return None;
        }
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        self.slots.push(Slot {
            id,
            state: SlotState::Active,
            created_at: now,
            last_used_at: now,
            use_count: 1,
        });
        self.created += 1;
        Some(id)
    }

    fn release(&mut self, slot_id: u64, now: Instant, limits: &PoolLimits) {
        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.id == slot_id) {
            slot.last_used_at = now;
            slot.state = if now.duration_since(slot.created_at) < limits.max_connection_age {
                SlotState::Idle
            } else {
                SlotState::Closed
            };
        }
    }

    /// Hands free slots to queued waiters in arrival order.
    fn dispatch(&mut self, now: Instant, limits: &PoolLimits, next_id: &AtomicU64) {
        while !self.waiters.is_empty() {
            let Some(slot_id) = self.claim(now, limits, next_id) else {
                return;
            };
            let mut delivered = false;
            while let Some((_, sender)) = self.waiters.pop_front() {
                if sender.send(slot_id).is_ok() {
                    delivered = true;
                    break;
                }
            }
            if !delivered {
                self.release(slot_id, now, limits);
                return;
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostPoolStats {
    pub host: String,
    pub idle: usize,
    pub active: usize,
    pub waiting: usize,
    pub created: u64,
    pub total_uses: u64,
}

#[derive(Debug)]
struct PoolShared {
    limits: PoolLimits,
    hosts: Mutex<HashMap<String, HostSlots>>,
    next_slot_id: AtomicU64,
    next_waiter_id: AtomicU64,
    closed: std::sync::atomic::AtomicBool,
}

impl PoolShared {
    fn release(&self, host_key: &str, slot_id: u64) {
        let now = Instant::now();
        let mut hosts = lock_unpoisoned(&self.hosts);
        let Some(host) = hosts.get_mut(host_key) else {
            return;
        };
        host.release(slot_id, now, &self.limits);
        host.dispatch(now, &self.limits, &self.next_slot_id);
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    pub fn new(limits: PoolLimits) -> Self {
        let limits = PoolLimits {
            max_connections: limits.max_connections.max(1),
            ..limits
        };
        Self {
            shared: Arc::new(PoolShared {
                limits,
                hosts: Mutex::new(HashMap::new()),
                next_slot_id: AtomicU64::new(1),
                next_waiter_id: AtomicU64::new(1),
                closed: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    pub fn limits(&self) -> &PoolLimits {
        &self.shared.limits
    }

    /// Claims a slot for `host_key`, waiting in FIFO order behind earlier
    /// callers when the host is at `max_connections`.
    pub async fn acquire(
        &self,
        host_key: &str,
        timeout: Duration,
    ) -> Result<ConnectionLease, PoolError> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let mut waiter = {
            let now = Instant::now();
            let mut hosts = lock_unpoisoned(&shared.hosts);
            let host = hosts.entry(host_key.to_owned()).or_default();
            if host.waiters.is_empty()
                && let Some(slot_id) = host.claim(now, &shared.limits, &shared.next_slot_id)
            {
                trace!(host = host_key, slot_id, "connection slot claimed");
                return Ok(self.lease(host_key, slot_id));
            }
            let waiter_id = shared.next_waiter_id.fetch_add(1, Ordering::Relaxed);
            let (sender, receiver) = oneshot::channel();
            host.waiters.push_back((waiter_id, sender));
            trace!(
                host = host_key,
                waiting = host.waiters.len(),
                "waiting for connection slot"
            );
            SlotWaiter {
                shared: Arc::clone(shared),
                host_key: host_key.to_owned(),
                waiter_id,
                receiver,
                settled: false,
            }
        };

        let granted = tokio::time::timeout(timeout, &mut waiter.receiver).await;
        match granted {
            Ok(Ok(slot_id)) => {
                waiter.settled = true;
                Ok(self.lease(host_key, slot_id))
            }
            Ok(Err(_)) => {
                waiter.settled = true;
                Err(PoolError::Closed)
            }
            Err(_) => {
                debug!(host = host_key, timeout_ms = timeout.as_millis() as u64, "connection slot wait timed out");
                Err(PoolError::Timeout {
                    timeout_ms: timeout.as_millis(),
                })
            }
        }
    }

    fn lease(&self, host_key: &str, slot_id: u64) -> ConnectionLease {
        ConnectionLease {
            shared: Arc::clone(&self.shared),
            host_key: host_key.to_owned(),
            slot_id,
        }
    }

    /// Removes expired idle slots, and hosts left with nothing to track.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut hosts = lock_unpoisoned(&self.shared.hosts);
        let mut removed = 0;
        for host in hosts.values_mut() {
            let before = host.slots.len();
            host.close_expired(now, &self.shared.limits);
            removed += before - host.slots.len();
        }
        hosts.retain(|_, host| !host.slots.is_empty() || !host.waiters.is_empty());
        removed
    }

    pub fn stats(&self) -> Vec<HostPoolStats> {
        let hosts = lock_unpoisoned(&self.shared.hosts);
        let mut stats = hosts
            .iter()
            .map(|(host, slots)| HostPoolStats {
                host: host.clone(),
                idle: slots
                    .slots
                    .iter()
                    .filter(|slot| slot.state == SlotState::Idle)
                    .count(),
                active: slots
                    .slots
                    .iter()
                    .filter(|slot| slot.state == SlotState::Active)
                    .count(),
                waiting: slots.waiters.len(),
                created: slots.created,
                total_uses: slots.slots.iter().map(|slot| slot.use_count).sum(),
            })
            .collect::<Vec<_>>();
        stats.sort_by(|left, right| left.host.cmp(&right.host));
        stats
    }

    /// Rejects waiters and forgets every slot. Outstanding leases release
    /// into nothing.
    pub(crate) fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        lock_unpoisoned(&self.shared.hosts).clear();
    }
}

struct SlotWaiter {
    shared: Arc<PoolShared>,
    host_key: String,
    waiter_id: u64,
    receiver: oneshot::Receiver<u64>,
    settled: bool,
}

impl Drop for SlotWaiter {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        {
            let mut hosts = lock_unpoisoned(&self.shared.hosts);
            if let Some(host) = hosts.get_mut(&self.host_key) {
                let before = host.waiters.len();
                host.waiters.retain(|(id, _)| *id != self.waiter_id);
                if host.waiters.len() != before {
                    return;
                }
            }
        }
        // The slot was handed over after the caller stopped waiting.
        if let Ok(slot_id) = self.receiver.try_recv() {
            self.shared.release(&self.host_key, slot_id);
        }
    }
}

/// An active slot; returned to the host's pool when dropped.
#[derive(Debug)]
pub struct ConnectionLease {
    shared: Arc<PoolShared>,
    host_key: String,
    slot_id: u64,
}

impl ConnectionLease {
    pub fn host_key(&self) -> &str {
        &self.host_key
    }

    pub fn slot_id(&self) -> u64 {
        self.slot_id
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.shared.release(&self.host_key, self.slot_id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{ConnectionPool, PoolError, PoolLimits};

    fn pool(max_connections: usize) -> ConnectionPool {
        ConnectionPool::new(PoolLimits {
            max_connections,
            max_connection_age: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(10),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn idle_slots_are_reused_until_they_expire() {
        let pool = pool(2);
        let first = pool
            .acquire("api.example.com:443", Duration::from_secs(1))
            .await
            .expect("slot");
        let first_id = first.slot_id();
        drop(first);

        let reused = pool
            .acquire("api.example.com:443", Duration::from_secs(1))
            .await
            .expect("slot");
        assert_eq!(reused.slot_id(), first_id);
        drop(reused);

        tokio::time::advance(Duration::from_secs(11)).await;
        let fresh = pool
            .acquire("api.example.com:443", Duration::from_secs(1))
            .await
            .expect("slot");
        assert_ne!(fresh.slot_id(), first_id);

        let stats = pool.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].created, 2);
        assert_eq!(stats[0].active, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_hosts_queue_and_time_out() {
        let pool = pool(1);
        let held = pool
            .acquire("api.example.com:443", Duration::from_secs(1))
            .await
            .expect("slot");

        let other_host = pool
            .acquire("cdn.example.com:443", Duration::from_secs(1))
            .await;
        assert!(other_host.is_ok());

        let waited = pool
            .acquire("api.example.com:443", Duration::from_millis(200))
            .await;
        assert_eq!(
            waited.expect_err("saturated"),
            PoolError::Timeout { timeout_ms: 200 }
        );
        assert_eq!(pool.stats()[0].waiting, 0);
        drop(held);
    }

    #[tokio::test]
    async fn release_hands_the_slot_to_the_first_waiter() {
        let pool = pool(1);
        let held = pool
            .acquire("api.example.com:443", Duration::from_secs(1))
            .await
            .expect("slot");
        let held_id = held.slot_id();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.acquire("api.example.com:443", Duration::from_secs(5))
                    .await
                    .map(|lease| lease.slot_id())
            })
        };
        while pool.stats()[0].waiting == 0 {
            tokio::task::yield_now().await;
        }
        drop(held);

        assert_eq!(waiter.await.expect("task").expect("handed over"), held_id);
        let stats = pool.stats();
        assert_eq!(stats[0].idle, 1);
        assert_eq!(stats[0].total_uses, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn prune_drops_expired_slots_and_empty_hosts() {
        let pool = pool(2);
        drop(
            pool.acquire("api.example.com:443", Duration::from_secs(1))
                .await
                .expect("slot"),
        );
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(pool.prune(), 1);
        assert!(pool.stats().is_empty());
    }
}
