//! Ordered request and response interceptor chains.
//!
//! Each chain is an arena of records addressed by monotonically increasing
//! ids. Removal goes through an id→index map and compacts the backing vector,
//! so execution order always equals registration order.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;

use crate::error::Error;
use crate::request::Request;
use crate::response::Response;
use crate::util::lock_unpoisoned;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterceptorId(u64);

impl InterceptorId {
    pub const fn value(self) -> u64 {
        self.0
    }
}

type SyncHandler<T> = Arc<dyn Fn(T) -> Result<T, Error> + Send + Sync>;
type AsyncHandler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<T, Error>> + Send + Sync>;
type RejectHandler<T> = Arc<dyn Fn(Error) -> Result<T, Error> + Send + Sync>;

enum Handler<T> {
    Sync(SyncHandler<T>),
    Async(AsyncHandler<T>),
}

impl<T> Clone for Handler<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Sync(handler) => Self::Sync(Arc::clone(handler)),
            Self::Async(handler) => Self::Async(Arc::clone(handler)),
        }
    }
}

struct Record<T> {
    id: InterceptorId,
    fulfilled: Handler<T>,
    rejected: Option<RejectHandler<T>>,
}

impl<T> Clone for Record<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            fulfilled: self.fulfilled.clone(),
            rejected: self.rejected.clone(),
        }
    }
}

struct Arena<T> {
    records: Arc<Vec<Record<T>>>,
    index: HashMap<InterceptorId, usize>,
    async_count: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            records: Arc::new(Vec::new()),
            index: HashMap::new(),
            async_count: 0,
        }
    }
}

impl<T> Arena<T> {
    fn push(&mut self, record: Record<T>) {
        if matches!(record.fulfilled, Handler::Async(_)) {
            self.async_count += 1;
        }
        let records = Arc::make_mut(&mut self.records);
        self.index.insert(record.id, records.len());
        records.push(record);
    }

    fn remove(&mut self, id: InterceptorId) -> bool {
        let Some(position) = self.index.remove(&id) else {
            return false;
        };
        let records = Arc::make_mut(&mut self.records);
        let removed = records.remove(position);
        if matches!(removed.fulfilled, Handler::Async(_)) {
            self.async_count -= 1;
        }
        for (offset, record) in records[position..].iter().enumerate() {
            self.index.insert(record.id, position + offset);
        }
        true
    }

    fn clear(&mut self) {
        self.records = Arc::new(Vec::new());
        self.index.clear();
        self.async_count = 0;
    }

    fn snapshot(&self) -> Chain<T> {
        Chain {
            records: Arc::clone(&self.records),
            all_sync: self.async_count == 0,
        }
    }
}

/// Immutable view of a chain taken at dispatch time; registrations made while
/// a request is in flight apply to later requests only.
pub(crate) struct Chain<T> {
    records: Arc<Vec<Record<T>>>,
    all_sync: bool,
}

impl<T> Chain<T> {
    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Threads `state` through every record. A fulfilled value goes to the
    /// next record's handler; a rejection goes to its error handler, which may
    /// recover it. Records without an error handler pass rejections through.
    pub(crate) async fn run(&self, state: Result<T, Error>) -> Result<T, Error> {
        if self.all_sync {
            return self.run_sync(state);
        }
        let mut state = state;
        for record in self.records.iter() {
            state = match state {
                Ok(value) => match &record.fulfilled {
                    Handler::Sync(handler) => handler(value),
                    Handler::Async(handler) => handler(value).await,
                },
                Err(error) => match &record.rejected {
                    Some(rejected) => rejected(error),
                    None => Err(error),
                },
            };
        }
        state
    }

    fn run_sync(&self, state: Result<T, Error>) -> Result<T, Error> {
        let mut state = state;
        for record in self.records.iter() {
            state = match state {
                Ok(value) => match &record.fulfilled {
                    Handler::Sync(handler) => handler(value),
                    Handler::Async(_) => Ok(value),
                },
                Err(error) => match &record.rejected {
                    Some(rejected) => rejected(error),
                    None => Err(error),
                },
            };
        }
        state
    }
}

/// Registry of request and response interceptors owned by one client.
///
/// Request interceptors see the merged request before every transport
/// attempt. Response interceptors see the final outcome of a request: the
/// success handler receives responses, the error handler receives failures and
/// may recover them into a response.
pub struct Interceptors {
    next_id: AtomicU64,
    request: Mutex<Arena<Request>>,
    response: Mutex<Arena<Response>>,
}

impl Default for Interceptors {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            request: Mutex::new(Arena::default()),
            response: Mutex::new(Arena::default()),
        }
    }
}

impl std::fmt::Debug for Interceptors {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Interceptors")
            .field("request", &lock_unpoisoned(&self.request).records.len())
            .field("response", &lock_unpoisoned(&self.response).records.len())
            .finish()
    }
}

impl Interceptors {
    fn next_id(&self) -> InterceptorId {
        InterceptorId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn add_request_interceptor<F>(&self, interceptor: F) -> InterceptorId
    where
        F: Fn(Request) -> Result<Request, Error> + Send + Sync + 'static,
    {
        self.push_request(Handler::Sync(Arc::new(interceptor)), None)
    }

    pub fn add_request_interceptor_with_error<F, E>(&self, interceptor: F, on_error: E) -> InterceptorId
    where
        F: Fn(Request) -> Result<Request, Error> + Send + Sync + 'static,
        E: Fn(Error) -> Result<Request, Error> + Send + Sync + 'static,
    {
        self.push_request(Handler::Sync(Arc::new(interceptor)), Some(Arc::new(on_error)))
    }

    pub fn add_async_request_interceptor<F, Fut>(&self, interceptor: F) -> InterceptorId
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Request, Error>> + Send + 'static,
    {
        let handler: AsyncHandler<Request> =
            Arc::new(move |request| Box::pin(interceptor(request)));
        self.push_request(Handler::Async(handler), None)
    }

    pub fn add_response_interceptor<F>(&self, interceptor: F) -> InterceptorId
    where
        F: Fn(Response) -> Result<Response, Error> + Send + Sync + 'static,
    {
        self.push_response(Handler::Sync(Arc::new(interceptor)), None)
    }

    pub fn add_response_interceptor_with_error<F, E>(
        &self,
        interceptor: F,
        on_error: E,
    ) -> InterceptorId
    where
        F: Fn(Response) -> Result<Response, Error> + Send + Sync + 'static,
        E: Fn(Error) -> Result<Response, Error> + Send + Sync + 'static,
    {
        self.push_response(Handler::Sync(Arc::new(interceptor)), Some(Arc::new(on_error)))
    }

    /// Registers only an error handler; successful responses pass through.
    pub fn add_error_interceptor<E>(&self, on_error: E) -> InterceptorId
    where
        E: Fn(Error) -> Result<Response, Error> + Send + Sync + 'static,
    {
        self.add_response_interceptor_with_error(Ok, on_error)
    }

    pub fn add_async_response_interceptor<F, Fut>(&self, interceptor: F) -> InterceptorId
    where
        F: Fn(Response) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, Error>> + Send + 'static,
    {
        let handler: AsyncHandler<Response> =
            Arc::new(move |response| Box::pin(interceptor(response)));
        self.push_response(Handler::Async(handler), None)
    }

    fn push_request(
        &self,
        fulfilled: Handler<Request>,
        rejected: Option<RejectHandler<Request>>,
    ) -> InterceptorId {
        let id = self.next_id();
        lock_unpoisoned(&self.request).push(Record {
            id,
            fulfilled,
            rejected,
        });
        id
    }

    fn push_response(
        &self,
        fulfilled: Handler<Response>,
        rejected: Option<RejectHandler<Response>>,
    ) -> InterceptorId {
        let id = self.next_id();
        lock_unpoisoned(&self.response).push(Record {
            id,
            fulfilled,
            rejected,
        });
        id
    }

    /// Removes an interceptor from whichever chain holds it.
    pub fn remove(&self, id: InterceptorId) -> bool {
        lock_unpoisoned(&self.request).remove(id) || lock_unpoisoned(&self.response).remove(id)
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.request).clear();
        lock_unpoisoned(&self.response).clear();
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.request).records.len() + lock_unpoisoned(&self.response).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn request_chain(&self) -> Chain<Request> {
        lock_unpoisoned(&self.request).snapshot()
    }

    pub(crate) fn response_chain(&self) -> Chain<Response> {
        lock_unpoisoned(&self.response).snapshot()
    }
}
