use std::sync::Arc;

use http::Method;
use thiserror::Error;

use crate::response::Response;

pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeoutPhase {
    Transport,
    Total,
    Queue,
    Pool,
    Scheduler,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Transport => "transport",
            Self::Total => "total",
            Self::Queue => "queue",
            Self::Pool => "pool",
            Self::Scheduler => "scheduler",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CancelReason {
    Explicit,
    Destroyed,
    QueueFull,
    SchedulerReset,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Explicit => "explicit",
            Self::Destroyed => "destroyed",
            Self::QueueFull => "queue_full",
            Self::SchedulerReset => "scheduler_reset",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    Network,
    Timeout,
    Cancelled,
    HttpStatus,
    Adapter,
    ClientDestroyed,
    Interceptor,
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
    SerializeJson,
    Deserialize,
    InvalidConfig,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::HttpStatus => "http_status",
            Self::Adapter => "adapter",
            Self::ClientDestroyed => "client_destroyed",
            Self::Interceptor => "interceptor",
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::SerializeJson => "serialize_json",
            Self::Deserialize => "deserialize",
            Self::InvalidConfig => "invalid_config",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Every failure a caller can observe from the client.
///
/// Cloneable so a single settled outcome can be delivered to every request
/// attached to the same in-flight execution.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("network error for {method} {uri}: {message}")]
    Network {
        method: Method,
        uri: String,
        message: String,
        #[source]
        source: Option<SharedError>,
    },
    #[error("request timed out in {phase} after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        phase: TimeoutPhase,
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("request cancelled ({reason})")]
    Cancelled { reason: CancelReason },
    #[error("http status error {status} for {method} {uri}", status = .response.status().as_u16())]
    HttpStatus {
        method: Method,
        uri: String,
        response: Box<Response>,
    },
    #[error("transport adapter failed for {method} {uri}: {source}")]
    Adapter {
        method: Method,
        uri: String,
        #[source]
        source: SharedError,
    },
    #[error("client has been destroyed")]
    ClientDestroyed,
    #[error("interceptor failed: {message}")]
    Interceptor {
        message: String,
        #[source]
        source: Option<SharedError>,
    },
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}")]
    InvalidHeaderName { name: String },
    #[error("invalid header value for {name}")]
    InvalidHeaderValue { name: String },
    #[error("failed to serialize request json: {source}")]
    SerializeJson {
        #[source]
        source: Arc<serde_json::Error>,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: Arc<serde_json::Error>,
        body: String,
    },
    #[error("invalid client configuration: {message}")]
    InvalidConfig { message: String },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Network { .. } => ErrorCode::Network,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::Adapter { .. } => ErrorCode::Adapter,
            Self::ClientDestroyed => ErrorCode::ClientDestroyed,
            Self::Interceptor { .. } => ErrorCode::Interceptor,
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::SerializeJson { .. } => ErrorCode::SerializeJson,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::InvalidConfig { .. } => ErrorCode::InvalidConfig,
        }
    }

    /// Builds the error an interceptor returns to reject a value.
    pub fn interceptor(message: impl Into<String>) -> Self {
        Self::Interceptor {
            message: message.into(),
            source: None,
        }
    }

    pub const fn cancelled(reason: CancelReason) -> Self {
        Self::Cancelled { reason }
    }

    pub fn status(&self) -> Option<http::StatusCode> {
        match self {
            Self::HttpStatus { response, .. } => Some(response.status()),
            _ => None,
        }
    }

    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::HttpStatus { response, .. } => Some(response),
            _ => None,
        }
    }

    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
