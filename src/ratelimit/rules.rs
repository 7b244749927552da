//! Rate limit rules and endpoint weight tables.
//!
//! Rules describe the quotas a server enforces ("50 orders per 10 seconds").
//! Endpoint weight tables describe how much of each quota a request consumes.
//! Both can be loaded from YAML; parameter-dependent weights are attached in code.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use super::window::{interval_label, IntervalUnit, WindowClock};
use crate::error::{RateQueueError, Result};

/// Request parameters (query string merged with body) handed to weight functions.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Function computing a request weight from its parameters.
pub type WeightFn = Arc<dyn Fn(&Params) -> f64 + Send + Sync>;

/// Wildcard key matching any method or any endpoint in a weight table.
pub const WILDCARD: &str = "*";

/// Placeholder substituted with the interval label in usage header templates.
pub const INTERVAL_PLACEHOLDER: &str = "%(interval)";

/// Class of quota tracked by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleCategory {
    RequestWeight,
    Orders,
    RawRequests,
}

impl RuleCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleCategory::RequestWeight => "REQUEST_WEIGHT",
            RuleCategory::Orders => "ORDERS",
            RuleCategory::RawRequests => "RAW_REQUESTS",
        }
    }
}

impl fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP verbs understood by the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = RateQueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            other => Err(RateQueueError::Config(format!("unsupported method: {}", other))),
        }
    }
}

/// A single quota, e.g. 1200 request weight per minute.
///
/// Field names follow the exchange-info payload so server-pushed limits
/// deserialize directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(rename = "rateLimitType")]
    pub category: RuleCategory,
    pub interval: IntervalUnit,
    pub interval_num: u32,
    pub limit: u64,
}

impl Rule {
    pub fn new(
        category: RuleCategory,
        interval: IntervalUnit,
        interval_num: u32,
        limit: u64,
    ) -> Self {
        Self { category, interval, interval_num, limit }
    }

    /// Interval label such as `1m`.
    pub fn label(&self) -> String {
        interval_label(self.interval, self.interval_num)
    }

    pub fn window(&self) -> WindowClock {
        WindowClock::new(self.interval, self.interval_num)
    }
}

/// Rules grouped by category, in the order they were supplied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    rules: BTreeMap<RuleCategory, Vec<Rule>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group `rules` by category, dropping rules whose category is not accepted.
    pub fn from_rules<I, F>(rules: I, accept: F) -> Self
    where
        I: IntoIterator<Item = Rule>,
        F: Fn(RuleCategory) -> bool,
    {
        let mut set = RuleSet::new();
        for rule in rules.into_iter().filter(|r| accept(r.category)) {
            set.rules.entry(rule.category).or_default().push(rule);
        }
        set
    }

    pub fn rules_for(&self, category: RuleCategory) -> &[Rule] {
        self.rules.get(&category).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.rules.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether a category's usage is shared by every caller or tracked per caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingScope {
    /// One counter per rule for the whole process (server tracks by IP).
    #[default]
    Global,
    /// One counter per rule and caller id (server tracks by account).
    PerCaller,
}

/// Weight a matching request consumes.
#[derive(Clone)]
pub enum WeightConfig {
    Fixed(u64),
    Dynamic(WeightFn),
}

impl fmt::Debug for WeightConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightConfig::Fixed(w) => f.debug_tuple("Fixed").field(w).finish(),
            WeightConfig::Dynamic(_) => f.write_str("Dynamic(<fn>)"),
        }
    }
}

impl<'de> Deserialize<'de> for WeightConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        u64::deserialize(deserializer).map(WeightConfig::Fixed)
    }
}

impl From<u64> for WeightConfig {
    fn from(weight: u64) -> Self {
        WeightConfig::Fixed(weight)
    }
}

/// Endpoint weight table plus tracking settings for one category.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CategoryConfig {
    /// Method (or `*`) -> endpoint (or `*`) -> weight
    #[serde(default)]
    pub endpoints: HashMap<String, HashMap<String, WeightConfig>>,
    #[serde(default)]
    pub tracking: TrackingScope,
    /// Response header reporting server-side usage, with `%(interval)` placeholder
    #[serde(default)]
    pub usage_header: Option<String>,
}

impl CategoryConfig {
    pub fn new(tracking: TrackingScope) -> Self {
        Self { tracking, ..Default::default() }
    }

    pub fn usage_header(mut self, template: impl Into<String>) -> Self {
        self.usage_header = Some(template.into());
        self
    }

    /// Add a constant weight. `method` and `endpoint` accept the `*` wildcard.
    pub fn weight(mut self, method: &str, endpoint: &str, weight: u64) -> Self {
        self.insert(method, endpoint, WeightConfig::Fixed(weight));
        self
    }

    /// Add a weight computed from the request parameters.
    pub fn with_weight_fn<F>(mut self, method: &str, endpoint: &str, f: F) -> Self
    where
        F: Fn(&Params) -> f64 + Send + Sync + 'static,
    {
        self.insert(method, endpoint, WeightConfig::Dynamic(Arc::new(f)));
        self
    }

    fn insert(&mut self, method: &str, endpoint: &str, weight: WeightConfig) {
        let endpoint = if endpoint == WILDCARD {
            endpoint.to_string()
        } else {
            normalize_endpoint(endpoint)
        };
        self.endpoints
            .entry(method.to_ascii_uppercase())
            .or_default()
            .insert(endpoint, weight);
    }

    /// Resolve the weight of a request, or `None` if the table does not cover it.
    ///
    /// A method table takes precedence over the `*` method table as a whole; inside
    /// the chosen table the exact endpoint takes precedence over the `*` endpoint.
    pub fn weight_for(
        &self,
        method: Method,
        endpoint: &str,
        params: &Params,
    ) -> Result<Option<u64>> {
        let table = self
            .endpoints
            .get(method.as_str())
            .or_else(|| self.endpoints.get(WILDCARD));
        let config = match table.and_then(|t| t.get(endpoint).or_else(|| t.get(WILDCARD))) {
            Some(config) => config,
            None => return Ok(None),
        };

        match config {
            WeightConfig::Fixed(weight) => Ok(Some(*weight)),
            WeightConfig::Dynamic(f) => {
                let weight = f(params);
                if !weight.is_finite() || weight < 0.0 {
                    return Err(RateQueueError::InvalidWeight {
                        method: method.to_string(),
                        endpoint: endpoint.to_string(),
                    });
                }
                Ok(Some(weight.ceil() as u64))
            }
        }
    }

    /// Usage header name for a rule, if the category reports usage.
    pub fn usage_header_for(&self, rule: &Rule) -> Option<String> {
        self.usage_header.as_ref().map(|template| {
            template
                .replace(INTERVAL_PLACEHOLDER, &rule.label())
                .to_ascii_lowercase()
        })
    }
}

/// Static limiter configuration: initial rules plus per-category weight tables.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimiterConfig {
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub categories: BTreeMap<RuleCategory, CategoryConfig>,
}

impl LimiterConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn category(mut self, category: RuleCategory, config: CategoryConfig) -> Self {
        self.categories.insert(category, config);
        self
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut config: LimiterConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RateQueueError::Config(format!("Failed to parse limiter config: {}", e)))?;

        // Keys written by hand may omit the leading slash or carry a trailing one.
        for category in config.categories.values_mut() {
            let endpoints = std::mem::take(&mut category.endpoints);
            for (method, table) in endpoints {
                for (endpoint, weight) in table {
                    category.insert(&method, &endpoint, weight);
                }
            }
        }
        Ok(config)
    }
}

/// Ensure a leading slash and strip a single trailing slash.
pub fn normalize_endpoint(endpoint: &str) -> String {
    let mut normalized = if endpoint.starts_with('/') {
        endpoint.to_string()
    } else {
        format!("/{}", endpoint)
    };
    if normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}
