//! # DogRS Configuration
//!
//! DogRS includes a minimal, framework-agnostic configuration
//! system based on a simple string key/value store. Relay services
//! layer it the same way every time: compiled-in defaults first,
//! then environment overrides.
//!
//! ## Setting and reading values
//! ```rust
//! use dog_core::DogConfig;
//! let mut config = DogConfig::new();
//!
//! config.set("relay.mode", "stream");
//! config.set("relay.idle_timeout_secs", "30");
//!
//! let snapshot = config.snapshot();
//! assert_eq!(snapshot.get("relay.mode"), Some("stream"));
//! assert_eq!(snapshot.get_u64("relay.idle_timeout_secs"), Some(30));
//! ```
//!
//! ## Environment overrides
//! Variables carrying a prefix are folded in with `__` mapped to `.`
//! and the remainder lower-cased:
//!
//! ```bash
//! export RELAY__STORE__KIND=s3        # store.kind = s3
//! export RELAY__RELAY__MODE=buffer    # relay.mode = buffer
//! ```
//!
//! Higher-level loaders (TOML, JSON, Consul, Vault, etc.) are
//! intentionally kept *out* of DogRS so each application remains
//! free to choose its configuration strategy.

use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct DogConfig {
    values: HashMap<String, String>,
}

impl DogConfig {
    /// Create an empty config store.
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    /// Set a configuration key to a string value.
    ///
    /// Example: config.set("relay.mode", "buffer")
    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.values.insert(key.into(), value.into());
    }

    /// Set a key only when it has no value yet.
    pub fn set_default<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.values.entry(key.into()).or_insert_with(|| value.into());
    }

    /// Get a configuration value by key.
    ///
    /// Returns None if the key is not present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    /// Check whether a key is present.
    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Fold in process environment variables starting with `prefix`.
    ///
    /// Returns how many keys were applied.
    pub fn load_env(&mut self, prefix: &str) -> usize {
        self.load_vars(prefix, std::env::vars())
    }

    /// Same as [`DogConfig::load_env`] but over an explicit variable list.
    pub fn load_vars<I>(&mut self, prefix: &str, vars: I) -> usize
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut applied = 0;
        for (key, value) in vars {
            if let Some(stripped) = key.strip_prefix(prefix) {
                let normalized = stripped.to_lowercase().replace("__", ".");
                if normalized.is_empty() {
                    continue;
                }
                self.values.insert(normalized, value);
                applied += 1;
            }
        }
        applied
    }

    pub fn snapshot(&self) -> DogConfigSnapshot {
        DogConfigSnapshot::new(self.values.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct DogConfigSnapshot {
    map: HashMap<String, String>,
}

impl DogConfigSnapshot {
    pub(crate) fn new(map: HashMap<String, String>) -> Self {
        Self { map }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map
            .get(key)
            .map(|s| s.as_str())
            .filter(|s| !s.trim().is_empty())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).map(|s| s.to_string())
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(|v| v.trim().parse::<usize>().ok())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.trim().parse::<u64>().ok())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.trim().parse::<bool>().ok())
    }

    /// Whole seconds stored under `key`.
    pub fn get_duration_secs(&self, key: &str) -> Option<Duration> {
        self.get_u64(key).map(Duration::from_secs)
    }

    /// Comma separated list, trimmed, empty entries dropped.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}
