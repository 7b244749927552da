//! Built-in configuration for the spot exchange REST API.
//!
//! Rules mirror `/api/v3/exchangeInfo`; servers may push newer ones through
//! [`RateLimiter::set_rate_limit_rules`](super::RateLimiter::set_rate_limit_rules).

use super::rules::{CategoryConfig, LimiterConfig, Params, Rule, RuleCategory, TrackingScope};
use super::window::IntervalUnit;

/// Header carrying server-side request weight usage.
pub const USED_WEIGHT_HEADER: &str = "x-mbx-used-weight-%(interval)";
/// Header carrying server-side order count usage.
pub const ORDER_COUNT_HEADER: &str = "x-mbx-order-count-%(interval)";
/// Request header holding the account API key.
pub const API_KEY_HEADER: &str = "x-mbx-apikey";

/// Rules published by the exchange.
pub fn spot_rules() -> Vec<Rule> {
    vec![
        Rule::new(RuleCategory::RequestWeight, IntervalUnit::Minute, 1, 1200),
        Rule::new(RuleCategory::Orders, IntervalUnit::Second, 10, 50),
        Rule::new(RuleCategory::Orders, IntervalUnit::Day, 1, 160_000),
        Rule::new(RuleCategory::RawRequests, IntervalUnit::Minute, 5, 6100),
    ]
}

/// Full spot configuration: rules plus weight tables for all three categories.
pub fn spot() -> LimiterConfig {
    let mut config = LimiterConfig::new()
        .category(RuleCategory::RequestWeight, spot_request_weights())
        .category(RuleCategory::Orders, spot_order_weights())
        .category(
            RuleCategory::RawRequests,
            CategoryConfig::new(TrackingScope::Global).weight("*", "*", 1),
        );
    config.rules = spot_rules();
    config
}

fn has_symbol(params: &Params) -> bool {
    params.get("symbol").is_some_and(|v| !v.is_null())
}

fn depth_weight(params: &Params) -> f64 {
    let limit = params.get("limit").and_then(|v| match v {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    });
    match limit {
        Some(500) => 5.0,
        Some(1000) => 10.0,
        Some(5000) => 50.0,
        _ => 1.0,
    }
}

fn spot_request_weights() -> CategoryConfig {
    CategoryConfig::new(TrackingScope::Global)
        .usage_header(USED_WEIGHT_HEADER)
        .weight("GET", "/api/v3/ping", 1)
        .weight("GET", "/api/v3/time", 1)
        .weight("GET", "/api/v3/exchangeInfo", 10)
        .with_weight_fn("GET", "/api/v3/depth", depth_weight)
        .weight("GET", "/api/v3/trades", 1)
        .weight("GET", "/api/v3/historicalTrades", 5)
        .weight("GET", "/api/v3/aggTrades", 1)
        .weight("GET", "/api/v3/avgPrice", 1)
        .with_weight_fn("GET", "/api/v3/ticker/24hr", |p| if has_symbol(p) { 1.0 } else { 40.0 })
        .with_weight_fn("GET", "/api/v3/ticker/price", |p| if has_symbol(p) { 1.0 } else { 2.0 })
        .with_weight_fn("GET", "/api/v3/ticker/bookTicker", |p| {
            if has_symbol(p) {
                1.0
            } else {
                2.0
            }
        })
        .weight("GET", "/api/v3/order", 2)
        .with_weight_fn("GET", "/api/v3/openOrders", |p| if has_symbol(p) { 3.0 } else { 40.0 })
        .weight("GET", "/api/v3/allOrders", 10)
        .weight("GET", "/api/v3/orderList", 2)
        .weight("GET", "/api/v3/openOrderList", 3)
        .weight("GET", "/api/v3/myTrades", 10)
        .weight("GET", "/api/v3/rateLimit/order", 20)
        .weight("POST", "/api/v3/order/test", 1)
        .weight("POST", "/api/v3/order", 1)
        .weight("POST", "/api/v3/order/oco", 1)
        .weight("POST", "/api/v3/userDataStream", 1)
        .weight("PUT", "/api/v3/userDataStream", 1)
        .weight("DELETE", "/api/v3/userDataStream", 1)
        .weight("DELETE", "/api/v3/openOrders", 1)
        .weight("DELETE", "/api/v3/orderList", 1)
}

fn spot_order_weights() -> CategoryConfig {
    CategoryConfig::new(TrackingScope::PerCaller)
        .usage_header(ORDER_COUNT_HEADER)
        .weight("POST", "/api/v3/order", 1)
        .weight("POST", "/api/v3/order/oco", 1)
}
