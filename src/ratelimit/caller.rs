//! Pseudonymous caller ids derived from API keys.
//!
//! Per-caller counters are keyed by an alias instead of the raw key so that
//! credentials never show up in counter keys, usage snapshots or logs.

use dashmap::DashMap;
use uuid::Uuid;

/// Namespace for name-based (SHA-1) caller aliases.
const CALLER_NAMESPACE: Uuid = Uuid::from_u128(0x6b1e_40f5_8c2a_4f1b_9d3e_7a52_c0de_a11a);

/// Memoized one-way mapping from API key to a stable alias.
///
/// Each distinct key is hashed once for the lifetime of the cache.
#[derive(Debug, Default)]
pub struct CallerAliases {
    aliases: DashMap<String, String>,
}

impl CallerAliases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Alias for `api_key`, computing and caching it on first use.
    pub fn alias(&self, api_key: &str) -> String {
        if let Some(alias) = self.aliases.get(api_key) {
            return alias.clone();
        }
        self.aliases
            .entry(api_key.to_string())
            .or_insert_with(|| hash_key(api_key))
            .clone()
    }

    /// Number of distinct keys seen.
    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

fn hash_key(api_key: &str) -> String {
    Uuid::new_v5(&CALLER_NAMESPACE, api_key.as_bytes()).simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_is_stable_and_cached() {
        let aliases = CallerAliases::new();

        let first = aliases.alias("my-secret-key");
        let second = aliases.alias("my-secret-key");

        assert_eq!(first, second);
        assert_eq!(aliases.len(), 1);
        assert!(!first.contains("my-secret-key"));
        assert_eq!(first.len(), 32);
    }

    #[test]
    fn test_distinct_keys_get_distinct_aliases() {
        let aliases = CallerAliases::new();

        assert_ne!(aliases.alias("key-a"), aliases.alias("key-b"));
        assert_eq!(aliases.len(), 2);
    }

    #[test]
    fn test_separate_caches_agree() {
        assert_eq!(CallerAliases::new().alias("k"), CallerAliases::new().alias("k"));
    }
}
