//! Ratequeue - Client-side Rate Limit Admission Control
//!
//! This crate keeps an API client within a server's published rate limits. A
//! [`RateLimiter`] tracks usage against several windowed rules at once and
//! reconciles its estimates with the usage the server reports back; a
//! [`RequestQueue`] holds outbound requests until the limiter and a concurrency
//! cap admit them, and backs off when the server issues a ban.

pub mod clock;
pub mod config;
pub mod error;
pub mod queue;
pub mod ratelimit;

pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use config::AppConfig;
pub use error::{RateQueueError, Result};
pub use queue::{Dispatched, QueueError, QueueOptions, RequestConfig, RequestError, RequestQueue};
pub use ratelimit::{
    LimiterConfig, LimiterEvent, Method, RateLimiter, Request, ResponseInfo, Rule, RuleCategory,
};
