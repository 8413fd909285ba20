//! The boundary to the component that actually speaks HTTP.
//!
//! A transport turns a merged [`Request`] into a [`TransportResponse`] or a
//! [`TransportError`]. Everything above this trait (caching, admission,
//! retries, interceptors) is transport-agnostic.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderMap, StatusCode};
use thiserror::Error;

use crate::error::{Error, SharedError};
use crate::request::Request;
use crate::response::Response;

pub type TransportFuture = BoxFuture<'static, Result<TransportResponse, TransportError>>;

pub trait Transport: Send + Sync {
    /// Dropping the returned future aborts the call.
    fn send(&self, request: Request) -> TransportFuture;
}

impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    fn send(&self, request: Request) -> TransportFuture {
        (**self).send(request)
    }
}

#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::OK, body)
    }

    pub fn with_header(mut self, name: http::HeaderName, value: http::HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<SharedError>,
    },
    #[error("transport timed out")]
    Timeout,
    #[error("transport call aborted")]
    Aborted,
    /// Some adapters reject non-success statuses themselves.
    #[error("http status {}", .0.status.as_u16())]
    Status(TransportResponse),
    #[error("unexpected adapter failure: {0}")]
    Other(SharedError),
}

impl TransportError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    pub fn other<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Other(Arc::new(error))
    }
}

/// Maps a transport outcome into the client's response/error taxonomy.
pub(crate) fn classify_outcome(
    outcome: Result<TransportResponse, TransportError>,
    request: &Arc<Request>,
    timeout_ms: u128,
) -> Result<Response, Error> {
    let method = request.method().clone();
    let uri = crate::util::redact_uri_for_logs(request.url());
    match outcome {
        Ok(response) | Err(TransportError::Status(response)) => Ok(Response::new(
            response.status,
            response.headers,
            response.body,
            Arc::clone(request),
        )),
        Err(TransportError::Network { message, source }) => Err(Error::Network {
            method,
            uri,
            message,
            source,
        }),
        Err(TransportError::Timeout) => Err(Error::Timeout {
            phase: crate::error::TimeoutPhase::Transport,
            timeout_ms,
            method,
            uri,
        }),
        Err(TransportError::Aborted) => Err(Error::cancelled(crate::error::CancelReason::Explicit)),
        Err(TransportError::Other(source)) => Err(Error::Adapter {
            method,
            uri,
            source,
        }),
    }
}

/// Adapts an async closure into a [`Transport`].
pub struct FnTransport<F> {
    send: F,
}

impl<F, Fut> FnTransport<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TransportResponse, TransportError>> + Send + 'static,
{
    pub fn new(send: F) -> Self {
        Self { send }
    }
}

impl<F, Fut> Transport for FnTransport<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TransportResponse, TransportError>> + Send + 'static,
{
    fn send(&self, request: Request) -> TransportFuture {
        Box::pin((self.send)(request))
    }
}
