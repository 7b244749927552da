//! Admission queue: holds requests until the limiter and the concurrency cap allow them.

mod error;
mod request_queue;
mod types;

pub use error::{QueueError, QueueErrorRecord, RequestError};
pub use request_queue::{QueuedEntry, RequestQueue, ResponseFuture};
pub use types::{
    default_error_response, Dispatched, ErrorResponseParser, HttpStatusError, QueueOptions,
    RequestConfig,
};
