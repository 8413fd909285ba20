use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::client::Client;
use crate::error::Error;
use crate::response::Response;
use crate::retry::RetryPolicy;
use crate::util::{append_query_pairs, parse_header_name, parse_header_value};

/// Numeric admission priority. Higher values are admitted first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "PriorityRepr", into = "i32")]
pub struct Priority(i32);

impl Priority {
    pub const CRITICAL: Self = Self(100);
    pub const HIGH: Self = Self(75);
    pub const NORMAL: Self = Self(50);
    pub const LOW: Self = Self(25);

    pub const fn new(value: i32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> i32 {
        self.0
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "critical" => Some(Self::CRITICAL),
            "high" => Some(Self::HIGH),
            "normal" => Some(Self::NORMAL),
            "low" => Some(Self::LOW),
            _ => None,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<Priority> for i32 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PriorityRepr {
    Value(i32),
    Name(String),
}

impl TryFrom<PriorityRepr> for Priority {
    type Error = String;

    fn try_from(repr: PriorityRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            PriorityRepr::Value(value) => Ok(Self(value)),
            PriorityRepr::Name(name) => {
                Self::from_name(&name).ok_or_else(|| format!("unknown priority tier `{name}`"))
            }
        }
    }
}

/// How a response status maps onto success or failure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusPolicy {
    /// Statuses >= 400 fail with [`Error::HttpStatus`].
    #[default]
    Error,
    /// Every status is returned as a response.
    Response,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Bytes),
    Json(serde_json::Value),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Bytes(bytes) => bytes.is_empty(),
            Self::Json(_) => false,
        }
    }

    /// Serialized form; also the input to request fingerprints.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Empty => Bytes::new(),
            Self::Bytes(bytes) => bytes.clone(),
            Self::Json(value) => Bytes::from(serde_json::to_vec(value).unwrap_or_default()),
        }
    }
}

/// Per-request overrides layered over the client defaults.
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub total_timeout: Option<Duration>,
    pub priority: Option<Priority>,
    pub cache: Option<bool>,
    pub cache_ttl: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
    pub dedup: Option<bool>,
    pub status_policy: Option<StatusPolicy>,
}

impl RequestOptions {
    pub(crate) fn overlay(&self, overrides: &Self) -> Self {
        Self {
            timeout: overrides.timeout.or(self.timeout),
            total_timeout: overrides.total_timeout.or(self.total_timeout),
            priority: overrides.priority.or(self.priority),
            cache: overrides.cache.or(self.cache),
            cache_ttl: overrides.cache_ttl.or(self.cache_ttl),
            retry_policy: overrides
                .retry_policy
                .clone()
                .or_else(|| self.retry_policy.clone()),
            dedup: overrides.dedup.or(self.dedup),
            status_policy: overrides.status_policy.or(self.status_policy),
        }
    }
}

/// A logical request.
///
/// The client never mutates a request it was handed: every dispatch overlays
/// the request onto the client defaults and works on that merged copy.
#[derive(Clone, Debug)]
pub struct Request {
    pub(crate) id: u64,
    pub(crate) method: Method,
    pub(crate) url: String,
    pub(crate) headers: HeaderMap,
    pub(crate) params: BTreeMap<String, String>,
    pub(crate) body: Body,
    pub(crate) options: RequestOptions,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            id: 0,
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            params: BTreeMap::new(),
            body: Body::Empty,
            options: RequestOptions::default(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    /// Identifier assigned by the dispatching client; zero before dispatch.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The URL without query parameters.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The URL with query parameters appended.
    pub fn full_url(&self) -> String {
        append_query_pairs(&self.url, &self.params)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.options.timeout
    }

    pub fn priority(&self) -> Option<Priority> {
        self.options.priority
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }
}

pub struct RequestBuilder<'a> {
    client: &'a Client,
    request: Request,
    cancel: Option<CancellationToken>,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a Client, method: Method, path: String) -> Self {
        Self {
            client,
            request: Request::new(method, path),
            cancel: None,
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.request.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.params.insert(name.into(), value.into());
        self
    }

    pub fn query_pairs<K, V, I>(mut self, pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.request.params.extend(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into())),
        );
        self
    }

    pub fn query<T>(mut self, params: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded =
            serde_urlencoded::to_string(params).map_err(|error| Error::InvalidUri {
                uri: format!("{}?<{error}>", self.request.url),
            })?;
        self.request.params.extend(
            url::form_urlencoded::parse(encoded.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned())),
        );
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.request.body = Body::Bytes(body.into());
        self
    }

    pub fn json<T>(self, payload: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(payload).map_err(|source| Error::SerializeJson {
            source: Arc::new(source),
        })?;
        let mut builder = self.header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        builder.request.body = Body::Json(value);
        Ok(builder)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.request.options.timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn total_timeout(mut self, total_timeout: Duration) -> Self {
        self.request.options.total_timeout = Some(total_timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.request.options.priority = Some(priority);
        self
    }

    pub fn cache(mut self, enabled: bool) -> Self {
        self.request.options.cache = Some(enabled);
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.request.options.cache = Some(true);
        self.request.options.cache_ttl = Some(ttl);
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.request.options.retry_policy = Some(retry_policy);
        self
    }

    pub fn dedup(mut self, enabled: bool) -> Self {
        self.request.options.dedup = Some(enabled);
        self
    }

    pub fn status_policy(mut self, status_policy: StatusPolicy) -> Self {
        self.request.options.status_policy = Some(status_policy);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn build(self) -> Request {
        self.request
    }

    pub async fn send(self) -> Result<Response> {
        match self.cancel {
            Some(token) => {
                self.client
                    .execute_with_cancel(self.request, token)
                    .await
            }
            None => self.client.execute(self.request).await,
        }
    }

    pub async fn send_json<T>(self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let response = self.send().await?;
        response.json()
    }
}
