use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::Method;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::error::SharedError;
use crate::fingerprint::Fingerprint;
use crate::response::Response;
use crate::util::lock_unpoisoned;

pub type StoreResult<T> = Result<T, SharedError>;

/// Backing storage for cached responses.
///
/// Implementations must never return an entry whose TTL has elapsed. Failures
/// are logged by the client and treated as misses; they never fail a request.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &Fingerprint) -> StoreResult<Option<Response>>;

    fn set(&self, key: Fingerprint, response: Response, ttl: Duration) -> StoreResult<()>;

    fn delete(&self, key: &Fingerprint) -> StoreResult<bool>;

    /// Drops every entry whose request URL starts with `url_prefix`.
    fn delete_prefix(&self, url_prefix: &str) -> StoreResult<usize>;

    fn clear(&self) -> StoreResult<()>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct CacheEntry {
    response: Response,
    stored_at: Instant,
    ttl: Duration,
    last_access: u64,
}

impl CacheEntry {
    fn is_valid(&self, now: Instant) -> bool {
        now < self.stored_at + self.ttl
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<Fingerprint, CacheEntry>,
    tick: u64,
}

impl MemoryState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_valid(now));
        before - self.entries.len()
    }

    fn evict_least_recently_used(&mut self) -> bool {
        let Some(key) = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(key, _)| key.clone())
        else {
            return false;
        };
        self.entries.remove(&key).is_some()
    }
}

/// In-memory TTL store with an optional least-recently-used size bound.
/// Expiry is checked on read; nothing sweeps in the background.
#[derive(Debug, Default)]
pub struct MemoryCache {
    state: Mutex<MemoryState>,
    max_entries: Option<usize>,
    evictions: AtomicU64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries.max(1)),
            ..Self::default()
        }
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &Fingerprint) -> StoreResult<Option<Response>> {
        let now = Instant::now();
        let mut state = lock_unpoisoned(&self.state);
        let tick = state.next_tick();
        let expired = match state.entries.get_mut(key) {
            None => return Ok(None),
            Some(entry) if entry.is_valid(now) => {
                entry.last_access = tick;
                return Ok(Some(entry.response.cached_copy()));
            }
            Some(_) => true,
        };
        if expired {
            state.entries.remove(key);
        }
        Ok(None)
    }

    fn set(&self, key: Fingerprint, response: Response, ttl: Duration) -> StoreResult<()> {
        if ttl.is_zero() {
            return Ok(());
        }
        let now = Instant::now();
        let mut state = lock_unpoisoned(&self.state);
        if let Some(max_entries) = self.max_entries
            && !state.entries.contains_key(&key)
            && state.entries.len() >= max_entries
        {
            let mut evicted = state.purge_expired(now) as u64;
            while state.entries.len() >= max_entries && state.evict_least_recently_used() {
                evicted += 1;
            }
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
        let tick = state.next_tick();
        state.entries.insert(
            key,
            CacheEntry {
                response,
                stored_at: now,
                ttl,
                last_access: tick,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &Fingerprint) -> StoreResult<bool> {
        Ok(lock_unpoisoned(&self.state).entries.remove(key).is_some())
    }

    fn delete_prefix(&self, url_prefix: &str) -> StoreResult<usize> {
        let mut state = lock_unpoisoned(&self.state);
        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| !entry.response.request().url().starts_with(url_prefix));
        Ok(before - state.entries.len())
    }

    fn clear(&self) -> StoreResult<()> {
        lock_unpoisoned(&self.state).entries.clear();
        Ok(())
    }

    fn len(&self) -> usize {
        lock_unpoisoned(&self.state).entries.len()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub store_errors: u64,
}

/// The client's view of its cache: default TTL, method policy and counters
/// over a pluggable [`CacheStore`].
pub(crate) struct ResponseCache {
    store: Arc<dyn CacheStore>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    store_errors: AtomicU64,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ResponseCache")
            .field("default_ttl", &self.default_ttl)
            .field("entries", &self.store.len())
            .finish()
    }
}

impl ResponseCache {
    pub(crate) fn new(store: Arc<dyn CacheStore>, default_ttl: Duration) -> Self {
        Self {
            store,
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
        }
    }

    pub(crate) fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// GET and HEAD are cacheable unless the request says otherwise.
    pub(crate) fn is_cacheable(method: &Method, request_override: Option<bool>) -> bool {
        request_override.unwrap_or(matches!(*method, Method::GET | Method::HEAD))
    }

    pub(crate) fn lookup(&self, key: &Fingerprint) -> Option<Response> {
        match self.store.get(key) {
            Ok(Some(response)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(fingerprint = %key, "cache hit");
                Some(response)
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(error) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(fingerprint = %key, error = %error, "cache read failed; treating as miss");
                None
            }
        }
    }

    pub(crate) fn store(&self, key: Fingerprint, response: Response, ttl: Duration) {
        match self.store.set(key.clone(), response, ttl) {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                self.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(fingerprint = %key, error = %error, "cache write failed; ignoring");
            }
        }
    }

    pub(crate) fn invalidate(&self, key: &Fingerprint) -> bool {
        self.store.delete(key).unwrap_or_else(|error| {
            self.store_errors.fetch_add(1, Ordering::Relaxed);
            warn!(fingerprint = %key, error = %error, "cache delete failed; ignoring");
            false
        })
    }

    pub(crate) fn invalidate_prefix(&self, url_prefix: &str) -> usize {
        self.store.delete_prefix(url_prefix).unwrap_or_else(|error| {
            self.store_errors.fetch_add(1, Ordering::Relaxed);
            warn!(url_prefix, error = %error, "cache prefix delete failed; ignoring");
            0
        })
    }

    pub(crate) fn clear(&self) {
        if let Err(error) = self.store.clear() {
            self.store_errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %error, "cache clear failed; ignoring");
        }
    }

    pub(crate) fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.store.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}
