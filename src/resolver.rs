//! Longest-prefix resolution of stream configuration
//!
//! Entries are keyed by `namespace ~ stream_key_prefix`. Lookup scans every
//! entry and keeps the longest key that is a byte-wise prefix of
//! `namespace ~ stream_key`. Among equal-length matches the entry registered
//! last wins.

use crate::config::StreamConfig;
use crate::key::NAMESPACE_SEPARATOR;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

/// No registered prefix matches a stream key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    NotFound { namespace: String, stream_key: String },
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::NotFound {
                namespace,
                stream_key,
            } => write!(
                f,
                "no config found for stream key '{}' in namespace '{}'",
                stream_key, namespace
            ),
        }
    }
}

impl std::error::Error for ResolveError {}

#[derive(Debug)]
struct ConfigEntry {
    prefix: Vec<u8>,
    config: Arc<StreamConfig>,
}

fn scoped_key(namespace: &str, rest: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(namespace.len() + 1 + rest.len());
    key.extend_from_slice(namespace.as_bytes());
    key.push(NAMESPACE_SEPARATOR);
    key.extend_from_slice(rest.as_bytes());
    key
}

#[derive(Debug, Default)]
pub struct ConfigResolver {
    entries: RwLock<Vec<ConfigEntry>>,
}

impl ConfigResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `config` for stream keys in `namespace` starting with its prefix
    pub fn configure_prefix(&self, namespace: &str, config: StreamConfig) {
        let prefix = scoped_key(namespace, &config.stream_key_prefix);
        let mut entries = self.entries.write();

        if entries.iter().any(|e| e.prefix == prefix) {
            warn!(
                "Prefix '{}' registered twice in namespace '{}'; the later config wins",
                config.stream_key_prefix, namespace
            );
        }
        debug!(
            "Registered stream prefix '{}' in namespace '{}'",
            config.stream_key_prefix, namespace
        );

        entries.push(ConfigEntry {
            prefix,
            config: Arc::new(config),
        });
    }

    /// Find the most specific config for a stream key
    pub fn resolve(
        &self,
        namespace: &str,
        stream_key: &str,
    ) -> Result<Arc<StreamConfig>, ResolveError> {
        let candidate = scoped_key(namespace, stream_key);
        let entries = self.entries.read();

        let mut best: Option<&ConfigEntry> = None;
        for entry in entries.iter() {
            if !candidate.starts_with(&entry.prefix) {
                continue;
            }
            // >= so that the last registration wins a tie
            if best.map_or(true, |b| entry.prefix.len() >= b.prefix.len()) {
                best = Some(entry);
            }
        }

        best.map(|e| Arc::clone(&e.config))
            .ok_or_else(|| ResolveError::NotFound {
                namespace: namespace.to_string(),
                stream_key: stream_key.to_string(),
            })
    }

    /// Number of registered prefixes
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Registered `(namespace~prefix)` keys in registration order
    pub fn prefixes(&self) -> Vec<Vec<u8>> {
        self.entries.read().iter().map(|e| e.prefix.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_prefix_wins() {
        let resolver = ConfigResolver::new();
        resolver.configure_prefix("a", StreamConfig::new("x"));
        resolver.configure_prefix("a", StreamConfig::new("xy"));

        let config = resolver.resolve("a", "xyz").unwrap();
        assert_eq!(config.stream_key_prefix, "xy");

        let config = resolver.resolve("a", "xa").unwrap();
        assert_eq!(config.stream_key_prefix, "x");
    }

    #[test]
    fn test_registration_order_irrelevant() {
        let resolver = ConfigResolver::new();
        resolver.configure_prefix("a", StreamConfig::new("xy"));
        resolver.configure_prefix("a", StreamConfig::new("x"));

        assert_eq!(resolver.resolve("a", "xyz").unwrap().stream_key_prefix, "xy");
    }

    #[test]
    fn test_no_match_is_error() {
        let resolver = ConfigResolver::new();
        resolver.configure_prefix("a", StreamConfig::new("x"));

        assert_eq!(
            resolver.resolve("a", "w"),
            Err(ResolveError::NotFound {
                namespace: "a".to_string(),
                stream_key: "w".to_string()
            })
        );
    }

    #[test]
    fn test_namespace_scoping() {
        let resolver = ConfigResolver::new();
        resolver.configure_prefix("ns1", StreamConfig::new("events"));

        assert!(resolver.resolve("ns1", "events-2024").is_ok());
        assert!(resolver.resolve("ns2", "events-2024").is_err());
        // "ns" is a prefix of "ns1" but the separator keeps them apart
        assert!(resolver.resolve("ns", "1~events").is_err());
    }

    #[test]
    fn test_empty_prefix_is_namespace_default() {
        let resolver = ConfigResolver::new();
        resolver.configure_prefix("ns", StreamConfig::new(""));
        resolver.configure_prefix("ns", StreamConfig::new("cpu"));

        assert_eq!(resolver.resolve("ns", "disk").unwrap().stream_key_prefix, "");
        assert_eq!(resolver.resolve("ns", "cpu0").unwrap().stream_key_prefix, "cpu");
    }

    #[test]
    fn test_duplicate_prefix_last_registration_wins() {
        let resolver = ConfigResolver::new();
        resolver.configure_prefix("ns", StreamConfig::new("cpu").with_replication_factor(1));
        resolver.configure_prefix("ns", StreamConfig::new("cpu").with_replication_factor(3));

        assert_eq!(resolver.len(), 2);
        assert_eq!(resolver.resolve("ns", "cpu.load").unwrap().replication_factor, 3);
    }
}
