//! Rate limit accounting: windows, counters, rules and the limiter.

mod caller;
mod counter;
mod limiter;
pub mod presets;
mod response;
mod rules;
mod timer;
mod window;

pub use caller::CallerAliases;
pub use counter::{CounterKind, RateLimitCounter};
pub use limiter::{LimiterEvent, RateLimiter, Request};
pub use response::{header_value, Headers, ResponseInfo, BAN_STATUS_CODES};
pub use rules::{
    normalize_endpoint, CategoryConfig, LimiterConfig, Method, Params, Rule, RuleCategory, RuleSet,
    TrackingScope, WeightConfig, WeightFn, INTERVAL_PLACEHOLDER, WILDCARD,
};
pub use timer::{BackoffTimer, ElapsedListener, MergePolicy};
pub use window::{interval_label, IntervalUnit, WindowClock};
