use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use crate::Result;
use crate::error::Error;
use crate::request::Request;
use crate::util::truncate_body;

#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    request: Arc<Request>,
    from_cache: bool,
}

impl Response {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes, request: Arc<Request>) -> Self {
        Self {
            status,
            headers,
            body,
            request,
            from_cache: false,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    /// The merged request that produced this response.
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    pub(crate) fn cached_copy(&self) -> Self {
        let mut copy = self.clone();
        copy.from_cache = true;
        copy
    }

    pub(crate) fn with_request(mut self, request: Arc<Request>) -> Self {
        self.request = request;
        self
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T>(&self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body).map_err(|source| Error::Deserialize {
            source: Arc::new(source),
            body: truncate_body(&self.body),
        })
    }

    pub(crate) fn body_len(&self) -> u64 {
        self.body.len() as u64
    }
}
