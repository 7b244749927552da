//! Core rate limiter implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, trace, warn};

use super::caller::CallerAliases;
use super::counter::RateLimitCounter;
use super::response::ResponseInfo;
use super::rules::{
    normalize_endpoint, CategoryConfig, LimiterConfig, Method, Params, Rule, RuleCategory, RuleSet,
    TrackingScope,
};
use super::timer::{BackoffTimer, MergePolicy};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;

/// Capacity of the limiter event channel.
const EVENT_CAPACITY: usize = 64;

/// A logical request as seen by the limiter.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub endpoint: String,
    /// Query and body parameters, merged
    pub params: Params,
    /// Explicit caller id for per-caller categories
    pub caller_id: Option<String>,
    /// API key to derive a caller id from when `caller_id` is absent
    pub api_key: Option<String>,
}

impl Request {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            params: Params::new(),
            caller_id: None,
            api_key: None,
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn caller(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = Some(caller_id.into());
        self
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

/// Notifications about server-issued bans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterEvent {
    /// A 418/429 arrived; all requests are held for this long.
    RetryIn { retry_in_ms: u64 },
    /// The ban has cleared.
    RetryElapsed,
}

/// One (rule, weight) pair a request consumes.
#[derive(Debug, Clone)]
struct RuleMatch {
    key: String,
    rule: Rule,
    weight: u64,
    usage_header: Option<String>,
}

#[derive(Debug, Default)]
struct LimiterState {
    rules: RuleSet,
    /// Counters indexed by `CATEGORY.interval[.caller]`
    counters: HashMap<String, RateLimitCounter>,
    safety_buffers: HashMap<RuleCategory, u64>,
}

impl LimiterState {
    fn counter(&mut self, m: &RuleMatch) -> &mut RateLimitCounter {
        let buffers = &self.safety_buffers;
        self.counters.entry(m.key.clone()).or_insert_with(|| {
            let buffer = buffers.get(&m.rule.category).copied().unwrap_or(0);
            debug!(key = %m.key, limit = m.rule.limit, buffer, "Creating new rate limit counter");
            RateLimitCounter::for_rule(m.rule, buffer)
        })
    }
}

/// Quota accounting authority for one API surface.
///
/// All admission checks and reconciliations run under a single lock, so a
/// check-then-dispatch is one atomic step even with concurrent callers.
pub struct RateLimiter {
    categories: BTreeMap<RuleCategory, CategoryConfig>,
    state: Mutex<LimiterState>,
    /// Server-issued ban; overrides every rule while active
    hard_stop: BackoffTimer,
    events: broadcast::Sender<LimiterEvent>,
    aliases: CallerAliases,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("categories", &self.categories.keys().collect::<Vec<_>>())
            .field("hard_stop", &self.hard_stop)
            .finish()
    }
}

impl RateLimiter {
    /// Create a limiter reading the system clock.
    pub fn new(config: LimiterConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: LimiterConfig, clock: Arc<dyn Clock>) -> Self {
        let LimiterConfig { rules, categories } = config;
        let rules = RuleSet::from_rules(rules, |c| categories.contains_key(&c));

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let hard_stop = BackoffTimer::new(MergePolicy::KeepLatest, clock.clone());
        let tx = events.clone();
        hard_stop.on_elapsed(move || {
            debug!("Ban elapsed");
            // No subscribers is fine.
            let _ = tx.send(LimiterEvent::RetryElapsed);
        });

        Self {
            categories,
            state: Mutex::new(LimiterState { rules, ..Default::default() }),
            hard_stop,
            events,
            aliases: CallerAliases::new(),
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Subscribe to ban notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<LimiterEvent> {
        self.events.subscribe()
    }

    /// Ban notifications as a stream.
    pub fn events(&self) -> BroadcastStream<LimiterEvent> {
        BroadcastStream::new(self.subscribe())
    }

    /// Decide whether `request` may be sent now.
    ///
    /// Returns 0 and records the request against every matching rule when it fits;
    /// otherwise returns the milliseconds until the slowest blocking constraint
    /// clears and records nothing.
    pub fn may_dispatch_request(&self, request: &Request) -> Result<u64> {
        let endpoint = normalize_endpoint(&request.endpoint);
        let caller = self.caller_id(request);
        let now = self.clock.now_millis();

        let mut state = self.state.lock();
        let matches =
            self.matches(&state.rules, request.method, &endpoint, &request.params, &caller)?;

        let mut wait = self.hard_stop.retry_after_ms();
        for m in &matches {
            wait = wait.max(state.counter(m).may_dispatch(m.weight, now));
        }

        trace!(
            method = %request.method,
            endpoint = %endpoint,
            rules = matches.len(),
            wait_ms = wait,
            "Checking rate limit"
        );

        if wait > 0 {
            return Ok(wait);
        }

        for m in &matches {
            state.counter(m).dispatch(m.weight, now);
        }
        Ok(0)
    }

    /// Resolve every weight `request` would consume without recording anything.
    ///
    /// Fails with [`RateQueueError::InvalidWeight`](crate::error::RateQueueError)
    /// when a weight function yields something other than a non-negative number.
    pub fn validate(&self, request: &Request) -> Result<()> {
        let endpoint = normalize_endpoint(&request.endpoint);
        let caller = self.caller_id(request);
        let state = self.state.lock();
        self.matches(&state.rules, request.method, &endpoint, &request.params, &caller)?;
        Ok(())
    }

    /// Reconcile a settled request with the server's response.
    ///
    /// Releases the request's pending weight, records server-reported usage, and
    /// arms the hard stop when the response is a ban carrying `retry-after`.
    pub fn complete_request(&self, response: &ResponseInfo, request: &Request) -> Result<()> {
        let endpoint = normalize_endpoint(&request.endpoint);
        let caller = self.caller_id(request);
        let server_time = response.server_time_ms();

        {
            let mut state = self.state.lock();
            let matches =
                self.matches(&state.rules, request.method, &endpoint, &request.params, &caller)?;
            for m in &matches {
                let usage = m.usage_header.as_deref().and_then(|h| response.usage(h));
                state.counter(m).complete(m.weight, server_time, usage);
            }
        }

        if let Some(retry_in_ms) = response.ban_duration_ms() {
            warn!(
                status = response.status.unwrap_or_default(),
                retry_in_ms,
                endpoint = %endpoint,
                "Server issued a ban; holding all requests"
            );
            let _ = self.events.send(LimiterEvent::RetryIn { retry_in_ms });
            self.hard_stop.backoff(std::time::Duration::from_millis(retry_in_ms));
        }
        Ok(())
    }

    /// Replace the rule set; rules of unconfigured categories are dropped.
    ///
    /// Existing counters are kept.
    pub fn set_rate_limit_rules<I>(&self, rules: I)
    where
        I: IntoIterator<Item = Rule>,
    {
        let rules = RuleSet::from_rules(rules, |c| self.categories.contains_key(&c));
        debug!(rules = rules.len(), "Replacing rate limit rules");
        self.state.lock().rules = rules;
    }

    /// Set per-category safety buffers for live and future counters.
    pub fn set_safety_buffers(&self, buffers: HashMap<RuleCategory, u64>) {
        let mut state = self.state.lock();
        for counter in state.counters.values_mut() {
            if let Some(buffer) = buffers.get(&counter.category()) {
                counter.set_safety_buffer(*buffer);
            }
        }
        debug!(?buffers, "Safety buffers updated");
        state.safety_buffers = buffers;
    }

    /// Snapshot of the active rule set.
    pub fn rules(&self) -> RuleSet {
        self.state.lock().rules.clone()
    }

    pub fn categories(&self) -> impl Iterator<Item = (&RuleCategory, &CategoryConfig)> {
        self.categories.iter()
    }

    /// Usage of the current window, per counter key.
    pub fn current_usage(&self) -> BTreeMap<String, u64> {
        self.usage_at(self.clock.now_millis())
    }

    /// Usage of the window containing `timestamp_ms`, per counter key.
    pub fn usage_at(&self, timestamp_ms: u64) -> BTreeMap<String, u64> {
        let state = self.state.lock();
        state
            .counters
            .iter()
            .map(|(key, counter)| (key.clone(), counter.usage_at(timestamp_ms)))
            .collect()
    }

    /// Weight admitted but not yet reconciled, per counter key.
    pub fn pending_usage(&self) -> BTreeMap<String, u64> {
        let state = self.state.lock();
        state
            .counters
            .iter()
            .map(|(key, counter)| (key.clone(), counter.pending_usage()))
            .collect()
    }

    /// Get the number of active counters.
    pub fn counter_count(&self) -> usize {
        self.state.lock().counters.len()
    }

    /// Milliseconds until a server-issued ban clears, 0 when none is active.
    pub fn retry_after_ms(&self) -> u64 {
        self.hard_stop.retry_after_ms()
    }

    pub fn is_banned(&self) -> bool {
        !self.hard_stop.is_elapsed()
    }

    fn caller_id(&self, request: &Request) -> String {
        match (&request.caller_id, &request.api_key) {
            (Some(id), _) => id.clone(),
            (None, Some(key)) => self.aliases.alias(key),
            (None, None) => String::new(),
        }
    }

    fn matches(
        &self,
        rules: &RuleSet,
        method: Method,
        endpoint: &str,
        params: &Params,
        caller: &str,
    ) -> Result<Vec<RuleMatch>> {
        let mut matches = Vec::new();
        for (category, config) in &self.categories {
            let Some(weight) = config.weight_for(method, endpoint, params)? else {
                continue;
            };
            for rule in rules.rules_for(*category) {
                matches.push(RuleMatch {
                    key: counter_key(rule, config.tracking, caller),
                    rule: *rule,
                    weight,
                    usage_header: config.usage_header_for(rule),
                });
            }
        }
        Ok(matches)
    }
}

fn counter_key(rule: &Rule, tracking: TrackingScope, caller: &str) -> String {
    match tracking {
        TrackingScope::Global => format!("{}.{}", rule.category, rule.label()),
        TrackingScope::PerCaller => format!("{}.{}.{}", rule.category, rule.label(), caller),
    }
}
