//! Rate limit counter implementation.

use std::collections::HashMap;

use super::rules::{Rule, RuleCategory};
use super::window::WindowClock;

/// Garbage collection runs once every this many windows.
const GC_EVERY_WINDOWS: u64 = 10;

/// How a counter accounts for admitted requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    /// Every admitted request consumes exactly one unit, permanently.
    Request,
    /// Admitted weight is held as pending until the server reports actual usage.
    Weight {
        /// Weight admitted but not yet reconciled with a response
        pending: u64,
    },
}

/// Usage accounting for one rule instance over epoch-aligned windows.
///
/// Counters are plain values; the limiter serializes access to them.
#[derive(Debug, Clone)]
pub struct RateLimitCounter {
    rule: Rule,
    /// Rule limit minus the safety buffer
    limit: u64,
    window: WindowClock,
    /// Window id -> cumulative usage
    usage: HashMap<u64, u64>,
    kind: CounterKind,
    next_gc_at: u64,
}

impl RateLimitCounter {
    /// Create the counter variant matching the rule's category.
    ///
    /// Request weight and order counts are reported back by the server and use
    /// weight counters; raw request counts are never reported and use request counters.
    pub fn for_rule(rule: Rule, safety_buffer: u64) -> Self {
        let kind = match rule.category {
            RuleCategory::RequestWeight | RuleCategory::Orders => {
                CounterKind::Weight { pending: 0 }
            }
            RuleCategory::RawRequests => CounterKind::Request,
        };
        Self::new(rule, safety_buffer, kind)
    }

    /// Create a counter of an explicit kind.
    pub fn new(rule: Rule, safety_buffer: u64, kind: CounterKind) -> Self {
        Self {
            rule,
            limit: rule.limit.saturating_sub(safety_buffer),
            window: rule.window(),
            usage: HashMap::new(),
            kind,
            next_gc_at: 0,
        }
    }

    /// The rule this counter enforces.
    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    /// Category of the enforced rule.
    pub fn category(&self) -> RuleCategory {
        self.rule.category
    }

    /// Accounting variant, including any pending weight.
    pub fn kind(&self) -> CounterKind {
        self.kind
    }

    /// Effective limit after the safety buffer.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Weight admitted but not yet settled; always 0 for request counters.
    pub fn pending_usage(&self) -> u64 {
        match self.kind {
            CounterKind::Weight { pending } => pending,
            CounterKind::Request => 0,
        }
    }

    /// Recompute the effective limit with a new safety buffer.
    pub fn set_safety_buffer(&mut self, buffer: u64) {
        self.limit = self.rule.limit.saturating_sub(buffer);
    }

    /// Recorded usage of the window containing `timestamp_ms`.
    pub fn usage_at(&self, timestamp_ms: u64) -> u64 {
        self.usage_of(self.window.window_id(timestamp_ms))
    }

    /// Recorded usage of the window containing `now_ms`.
    pub fn current_usage(&self, now_ms: u64) -> u64 {
        self.usage_at(now_ms)
    }

    /// Milliseconds until the next window of this rule begins.
    pub fn ms_to_next_window(&self, now_ms: u64) -> u64 {
        self.window.ms_until_next_window(now_ms)
    }

    /// Epoch millis at which the next window of this rule begins.
    pub fn next_window_start(&self, now_ms: u64) -> u64 {
        self.window.next_window_start(now_ms)
    }

    /// Milliseconds to wait before `weight` fits, or 0 if it fits now.
    ///
    /// Does not change any usage.
    pub fn may_dispatch(&self, weight: u64, now_ms: u64) -> u64 {
        let window_id = self.window.window_id(now_ms);
        let used_after = match self.kind {
            CounterKind::Request => self.usage_of(window_id).saturating_add(1),
            CounterKind::Weight { pending } => {
                self.usage_of(window_id).saturating_add(pending).saturating_add(weight)
            }
        };

        if used_after <= self.limit {
            0
        } else {
            self.window.ms_until_next_window(now_ms)
        }
    }

    /// Record an admitted request. Callers check [`may_dispatch`](Self::may_dispatch) first.
    pub fn dispatch(&mut self, weight: u64, now_ms: u64) {
        self.maybe_collect_garbage(now_ms);

        match &mut self.kind {
            CounterKind::Request => {
                let window_id = self.window.window_id(now_ms);
                *self.usage.entry(window_id).or_insert(0) += 1;
            }
            CounterKind::Weight { pending } => *pending = pending.saturating_add(weight),
        }
    }

    /// Reconcile a settled request with the usage the server reported.
    ///
    /// Responses can arrive out of order, so a window's usage only ever grows.
    pub fn complete(
        &mut self,
        weight: u64,
        server_time_ms: Option<u64>,
        server_usage: Option<u64>,
    ) {
        let CounterKind::Weight { pending } = &mut self.kind else {
            return;
        };
        *pending = pending.saturating_sub(weight);

        if let (Some(timestamp), Some(reported)) = (server_time_ms, server_usage) {
            let window_id = self.window.window_id(timestamp);
            let recorded = self.usage.entry(window_id).or_insert(0);
            if reported > *recorded {
                *recorded = reported;
            }
        }
    }

    /// Drop windows older than the one before `now_ms`.
    pub fn collect_garbage(&mut self, now_ms: u64) {
        let previous = self.window.window_id(now_ms).saturating_sub(1);
        self.usage.retain(|window_id, _| *window_id >= previous);
    }

    /// Number of windows currently held in memory.
    pub fn tracked_windows(&self) -> usize {
        self.usage.len()
    }

    fn maybe_collect_garbage(&mut self, now_ms: u64) {
        if now_ms < self.next_gc_at {
            return;
        }
        self.collect_garbage(now_ms);
        let every = self.window.size_ms().saturating_mul(GC_EVERY_WINDOWS);
        self.next_gc_at = now_ms.saturating_add(every);
    }

    fn usage_of(&self, window_id: u64) -> u64 {
        self.usage.get(&window_id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::window::IntervalUnit;

    const MINUTE: u64 = 60_000;
    /// Start of some minute window
    const T0: u64 = 1_700_000_040_000;

    fn weight_rule(limit: u64) -> Rule {
        Rule::new(RuleCategory::RequestWeight, IntervalUnit::Minute, 1, limit)
    }

    fn raw_rule(limit: u64) -> Rule {
        Rule::new(RuleCategory::RawRequests, IntervalUnit::Minute, 1, limit)
    }

    #[test]
    fn test_factory_picks_variant_by_category() {
        assert_eq!(
            RateLimitCounter::for_rule(weight_rule(10), 0).kind(),
            CounterKind::Weight { pending: 0 }
        );
        let orders = Rule::new(RuleCategory::Orders, IntervalUnit::Second, 10, 50);
        assert_eq!(
            RateLimitCounter::for_rule(orders, 0).kind(),
            CounterKind::Weight { pending: 0 }
        );
        assert_eq!(RateLimitCounter::for_rule(raw_rule(10), 0).kind(), CounterKind::Request);
    }

    #[test]
    fn test_request_counter_within_limit() {
        let mut counter = RateLimitCounter::for_rule(raw_rule(2), 0);

        assert_eq!(counter.may_dispatch(1, T0), 0);
        counter.dispatch(1, T0);
        assert_eq!(counter.may_dispatch(1, T0), 0);
        counter.dispatch(1, T0);

        assert_eq!(counter.current_usage(T0), 2);
        assert_eq!(counter.may_dispatch(1, T0 + 1_000), MINUTE - 1_000);
    }

    #[test]
    fn test_request_counter_ignores_weight_and_completion() {
        let mut counter = RateLimitCounter::for_rule(raw_rule(5), 0);

        counter.dispatch(40, T0);
        counter.complete(40, Some(T0), Some(100));

        assert_eq!(counter.current_usage(T0), 1);
        assert_eq!(counter.pending_usage(), 0);
    }

    #[test]
    fn test_request_counter_resets_next_window() {
        let mut counter = RateLimitCounter::for_rule(raw_rule(1), 0);
        counter.dispatch(1, T0);

        assert!(counter.may_dispatch(1, T0) > 0);
        assert_eq!(counter.may_dispatch(1, T0 + MINUTE), 0);
    }

    #[test]
    fn test_weight_counter_tracks_pending() {
        let mut counter = RateLimitCounter::for_rule(weight_rule(50), 0);

        assert_eq!(counter.may_dispatch(30, T0), 0);
        counter.dispatch(30, T0);
        assert_eq!(counter.pending_usage(), 30);
        // Pending weight is not written to the window map.
        assert_eq!(counter.current_usage(T0), 0);

        assert_eq!(counter.may_dispatch(20, T0), 0);
        assert_eq!(counter.may_dispatch(21, T0), MINUTE);
    }

    #[test]
    fn test_weight_counter_reconciles_with_server_usage() {
        let mut counter = RateLimitCounter::for_rule(weight_rule(50), 0);

        counter.dispatch(40, T0);
        counter.complete(40, Some(T0), Some(40));

        assert_eq!(counter.pending_usage(), 0);
        assert_eq!(counter.current_usage(T0), 40);
        assert_eq!(counter.may_dispatch(40, T0), MINUTE);
        assert_eq!(counter.may_dispatch(40, T0 + MINUTE), 0);
    }

    #[test]
    fn test_weight_counter_usage_is_monotonic() {
        let mut counter = RateLimitCounter::for_rule(weight_rule(50), 0);

        counter.dispatch(1, T0);
        counter.dispatch(1, T0);
        counter.complete(1, Some(T0 + 10), Some(10));
        counter.complete(1, Some(T0 + 5), Some(5));

        assert_eq!(counter.current_usage(T0), 10);
    }

    #[test]
    fn test_weight_counter_completion_without_headers() {
        let mut counter = RateLimitCounter::for_rule(weight_rule(50), 0);

        counter.dispatch(5, T0);
        counter.complete(5, None, Some(5));
        counter.complete(5, None, None);

        assert_eq!(counter.pending_usage(), 0);
        assert_eq!(counter.current_usage(T0), 0);
    }

    #[test]
    fn test_server_usage_lands_in_server_window() {
        let mut counter = RateLimitCounter::for_rule(weight_rule(50), 0);

        counter.dispatch(1, T0 + MINUTE);
        counter.complete(1, Some(T0 + 59_000), Some(12));

        assert_eq!(counter.usage_at(T0), 12);
        assert_eq!(counter.current_usage(T0 + MINUTE), 0);
    }

    #[test]
    fn test_safety_buffer() {
        let mut counter = RateLimitCounter::for_rule(weight_rule(50), 10);
        assert_eq!(counter.limit(), 40);
        assert!(counter.may_dispatch(41, T0) > 0);

        counter.set_safety_buffer(0);
        assert_eq!(counter.may_dispatch(41, T0), 0);

        counter.set_safety_buffer(100);
        assert_eq!(counter.limit(), 0);
    }

    #[test]
    fn test_garbage_collection_keeps_previous_window() {
        let mut counter = RateLimitCounter::for_rule(weight_rule(100), 0);

        for i in 0..5 {
            counter.complete(0, Some(T0 + i * MINUTE), Some(i + 1));
        }
        assert_eq!(counter.tracked_windows(), 5);

        counter.collect_garbage(T0 + 4 * MINUTE);
        assert_eq!(counter.tracked_windows(), 2);
        assert_eq!(counter.usage_at(T0 + 3 * MINUTE), 4);
        assert_eq!(counter.usage_at(T0), 0);
    }

    #[test]
    fn test_garbage_collection_is_amortized() {
        let mut counter = RateLimitCounter::for_rule(raw_rule(1_000), 0);

        counter.dispatch(1, T0);
        counter.dispatch(1, T0 + 3 * MINUTE);
        // Within ten windows of the last collection nothing is dropped.
        assert_eq!(counter.tracked_windows(), 2);

        counter.dispatch(1, T0 + 10 * MINUTE);
        assert_eq!(counter.tracked_windows(), 1);
    }
}
