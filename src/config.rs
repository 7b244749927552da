//! Configuration management for ratequeue.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::queue::QueueOptions;
use crate::ratelimit::presets::{self, API_KEY_HEADER};
use crate::ratelimit::{LimiterConfig, RuleCategory};

/// Top-level configuration for a queue and its limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Queue configuration
    #[serde(default)]
    pub queue: QueueSettings,

    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterSettings,
}

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Maximum number of dispatched, unsettled requests
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Maximum backlog length; unbounded when absent
    #[serde(default)]
    pub max_queue_size: Option<usize>,

    /// Request header identifying the caller
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_max_concurrent_requests(),
            max_queue_size: None,
            api_key_header: default_api_key_header(),
        }
    }
}

fn default_max_concurrent_requests() -> usize {
    10
}

fn default_api_key_header() -> String {
    API_KEY_HEADER.to_string()
}

/// Limiter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Path to a rules and weights file; the spot preset is used when absent
    #[serde(default)]
    pub config_path: Option<String>,

    /// Units held back from each category's limits
    #[serde(default)]
    pub safety_buffers: HashMap<RuleCategory, u64>,
}

impl AppConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> crate::error::Result<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| crate::error::RateQueueError::Config(e.to_string()))
    }

    /// Runtime queue options with the default error parser.
    pub fn queue_options(&self) -> QueueOptions {
        let options = QueueOptions::default()
            .max_concurrent_requests(self.queue.max_concurrent_requests)
            .api_key_header(self.queue.api_key_header.clone());
        match self.queue.max_queue_size {
            Some(max) => options.max_queue_size(max),
            None => options,
        }
    }

    /// Limiter rules and weights from `config_path`, or the spot preset.
    pub fn limiter_config(&self) -> crate::error::Result<LimiterConfig> {
        match &self.limiter.config_path {
            Some(path) => LimiterConfig::from_file(path),
            None => Ok(presets::spot()),
        }
    }
}
