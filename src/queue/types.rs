//! Request configuration, dispatch results and queue options.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::ratelimit::presets::API_KEY_HEADER;
use crate::ratelimit::{header_value, Headers, Method, Request, ResponseInfo};

/// Maps a failed dispatch to the response descriptor the limiter reconciles with.
pub type ErrorResponseParser = Arc<dyn Fn(&(dyn Error + 'static)) -> ResponseInfo + Send + Sync>;

/// An outbound request plus the queue's per-request controls.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestConfig {
    pub request: Request,
    /// Outbound headers; the API key header is used for per-caller tracking
    pub headers: Headers,
    /// Fail immediately instead of waiting in the backlog
    pub skip_queue: bool,
    /// Evict the request if it is still queued at this instant
    pub max_queue_until: Option<DateTime<Utc>>,
}

impl RequestConfig {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self::from_request(Request::new(method, endpoint))
    }

    pub fn from_request(request: Request) -> Self {
        Self {
            request,
            headers: Headers::new(),
            skip_queue: false,
            max_queue_until: None,
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.request = self.request.param(key, value);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn caller(mut self, caller_id: impl Into<String>) -> Self {
        self.request = self.request.caller(caller_id);
        self
    }

    pub fn skip_queue(mut self) -> Self {
        self.skip_queue = true;
        self
    }

    pub fn max_queue_until(mut self, deadline: DateTime<Utc>) -> Self {
        self.max_queue_until = Some(deadline);
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }
}

/// Successful outcome of a dispatch function.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched<R> {
    /// Status and headers of the server response
    pub response: ResponseInfo,
    /// Value handed back to the caller
    pub data: R,
}

impl<R> Dispatched<R> {
    pub fn new(response: ResponseInfo, data: R) -> Self {
        Self { response, data }
    }
}

/// An HTTP error response, recognized by the default error parser anywhere in
/// an error's source chain.
#[derive(Debug, Clone, Error)]
#[error("HTTP {status}: {message}")]
pub struct HttpStatusError {
    pub status: u16,
    pub headers: Headers,
    pub message: String,
}

impl HttpStatusError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self { status, headers: Headers::new(), message: message.into() }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn response(&self) -> ResponseInfo {
        ResponseInfo::new(self.status).with_headers(self.headers.clone())
    }
}

/// Default failure mapping: the first [`HttpStatusError`] in the source chain,
/// or an empty descriptor.
pub fn default_error_response(error: &(dyn Error + 'static)) -> ResponseInfo {
    let mut current = Some(error);
    while let Some(err) = current {
        if let Some(http) = err.downcast_ref::<HttpStatusError>() {
            return http.response();
        }
        current = err.source();
    }
    ResponseInfo::empty()
}

/// Tuning for a [`RequestQueue`](super::RequestQueue).
#[derive(Clone)]
pub struct QueueOptions {
    /// Upper bound on requests dispatched but not yet settled
    pub max_concurrent_requests: usize,
    /// Upper bound on the backlog; unbounded when `None`
    pub max_queue_size: Option<usize>,
    /// Request header whose value identifies the caller
    pub api_key_header: String,
    pub error_response_parser: ErrorResponseParser,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 10,
            max_queue_size: None,
            api_key_header: API_KEY_HEADER.to_string(),
            error_response_parser: Arc::new(default_error_response),
        }
    }
}

impl fmt::Debug for QueueOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueOptions")
            .field("max_concurrent_requests", &self.max_concurrent_requests)
            .field("max_queue_size", &self.max_queue_size)
            .field("api_key_header", &self.api_key_header)
            .finish_non_exhaustive()
    }
}

impl QueueOptions {
    pub fn max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    pub fn max_queue_size(mut self, max: usize) -> Self {
        self.max_queue_size = Some(max);
        self
    }

    pub fn api_key_header(mut self, header: impl Into<String>) -> Self {
        self.api_key_header = header.into();
        self
    }

    pub fn error_response_parser<F>(mut self, parser: F) -> Self
    where
        F: Fn(&(dyn Error + 'static)) -> ResponseInfo + Send + Sync + 'static,
    {
        self.error_response_parser = Arc::new(parser);
        self
    }
}
