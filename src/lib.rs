//! `reqflow` orchestrates HTTP requests for SDK clients over a pluggable
//! transport: interceptors, response caching, in-flight deduplication,
//! concurrency and priority admission, retries with backoff, logical
//! connection slots and request metrics.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use reqflow::prelude::{Client, FnTransport, Priority, Request, RetryPolicy, TransportResponse};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct User {
//!     id: u64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = FnTransport::new(|_request: Request| async {
//!         Ok(TransportResponse::ok(r#"{"id": 7}"#))
//!     });
//!     let client = Client::builder("https://api.example.com")
//!         .client_name("my-sdk")
//!         .transport(transport)
//!         .timeout(Duration::from_secs(3))
//!         .cache(true)
//!         .deduplication(true)
//!         .max_concurrent(8)
//!         .retry_policy(
//!             RetryPolicy::standard()
//!                 .max_retries(2)
//!                 .base_delay(Duration::from_millis(100)),
//!         )
//!         .try_build()?;
//!
//!     let user: User = client
//!         .get("/users/7")
//!         .priority(Priority::HIGH)
//!         .send_json()
//!         .await?;
//!
//!     println!("user id={}", user.id);
//!     client.destroy();
//!     Ok(())
//! }
//! ```
//!
//! # Fast Path
//!
//! A call that needs no interceptor, cache, deduplication, retry, priority,
//! concurrency bound, pool or monitor goes straight to the transport.

mod admission;
mod cache;
mod client;
mod config;
mod error;
mod fingerprint;
mod gate;
mod interceptor;
mod monitor;
mod pool;
mod request;
mod response;
mod retry;
mod scheduler;
mod transport;
mod util;

pub use crate::cache::{CacheStats, CacheStore, MemoryCache, StoreResult};
pub use crate::client::{Client, ClientBuilder};
pub use crate::config::{
    CacheConfig, ClientConfig, ConcurrencyConfig, MonitorConfig, PoolConfig, PriorityConfig,
    RetryConfig,
};
pub use crate::error::{CancelReason, Error, ErrorCode, SharedError, TimeoutPhase};
pub use crate::fingerprint::Fingerprint;
pub use crate::gate::GateStats;
pub use crate::interceptor::{InterceptorId, Interceptors};
pub use crate::monitor::{MetricSample, MetricsExport, Monitor, MonitorStats};
pub use crate::pool::{ConnectionLease, ConnectionPool, HostPoolStats, PoolError, PoolLimits, SlotState};
pub use crate::request::{Body, Priority, Request, RequestBuilder, RequestOptions, StatusPolicy};
pub use crate::response::Response;
pub use crate::retry::{
    AdaptiveRetryConfig, BackoffStrategy, RetryClassifier, RetryDecision, RetryManager,
    RetryPolicy, RetryReason,
};
pub use crate::scheduler::{PriorityScheduler, SchedulerStats, TaskOptions};
pub use crate::transport::{
    FnTransport, Transport, TransportError, TransportFuture, TransportResponse,
};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Body, CancelReason, Client, ClientBuilder, ClientConfig, Error, ErrorCode, FnTransport,
        Priority, Request, Response, Result, RetryPolicy, StatusPolicy, TimeoutPhase, Transport,
        TransportError, TransportResponse,
    };
}

#[cfg(test)]
mod tests;
