//! # Client Configuration
//!
//! Purpose: Load a complete client setup (servers, behavior flags, default
//! TTL) from one serde document so hosts can keep it next to their own config.

use memc_common::{BehaviorConfig, MemcError, MemcResult, Ttl, DEFAULT_TTL};
use serde::{Deserialize, Serialize};

/// Everything `Client::with_config` needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server spec strings, e.g. `"cache-a:11211"` or `"cache-b:11211:2"`.
    /// Each entry may itself list several servers.
    pub servers: Vec<String>,
    pub behavior: BehaviorConfig,
    /// TTL in seconds used by `set`/`add` when the caller gives none.
    pub default_ttl: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            servers: Vec::new(),
            behavior: BehaviorConfig::default(),
            default_ttl: DEFAULT_TTL.as_secs(),
        }
    }
}

impl ClientConfig {
    /// Parses a JSON document; missing fields take their defaults.
    ///
    /// # Errors
    /// - `InvalidArguments` for malformed JSON, unknown enum values, or
    ///   hash/distribution kinds that are recognised but unavailable.
    ///
    /// # Examples
    /// ```rust
    /// use memc_client::ClientConfig;
    ///
    /// let config = ClientConfig::from_json(
    ///     r#"{"servers": ["127.0.0.1:11211"], "behavior": {"distribution": "consistent_ketama"}}"#,
    /// )
    /// .unwrap();
    /// assert_eq!(config.servers.len(), 1);
    /// assert_eq!(config.default_ttl, 600);
    /// ```
    pub fn from_json(input: &str) -> MemcResult<Self> {
        let config: ClientConfig = serde_json::from_str(input)
            .map_err(|err| MemcError::InvalidArguments(format!("client config: {err}")))?;
        config
            .behavior
            .validate()
            .map_err(|err| MemcError::InvalidArguments(format!("client config: {err}")))?;
        Ok(config)
    }

    /// Serializes the config back to pretty JSON.
    pub fn to_json(&self) -> MemcResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| MemcError::InvalidArguments(format!("client config: {err}")))
    }

    pub fn default_ttl(&self) -> Ttl {
        Ttl(self.default_ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memc_common::{DistributionKind, HashKind};

    #[test]
    fn empty_document_uses_defaults() {
        let config = ClientConfig::from_json("{}").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.behavior.poll_timeout_ms, 5_000);
        assert_eq!(config.default_ttl(), Ttl(600));
    }

    #[test]
    fn reads_nested_behavior() {
        let config = ClientConfig::from_json(
            r#"{
                "servers": ["a:11211", "b:11212:2"],
                "behavior": {"hash": "fnv1a_32", "binary_protocol": true, "number_of_replicas": 1},
                "default_ttl": 30
            }"#,
        )
        .unwrap();
        assert_eq!(config.servers, vec!["a:11211", "b:11212:2"]);
        assert_eq!(config.behavior.hash, HashKind::Fnv1a_32);
        assert!(config.behavior.binary_protocol);
        assert_eq!(config.behavior.number_of_replicas, 1);
        assert_eq!(config.behavior.distribution, DistributionKind::Modulo);
        assert_eq!(config.default_ttl, 30);
    }

    #[test]
    fn rejects_malformed_and_unavailable() {
        let err = ClientConfig::from_json("{\"servers\": 3}").unwrap_err();
        assert!(matches!(err, MemcError::InvalidArguments(_)));

        let err = ClientConfig::from_json(r#"{"behavior": {"hash": "hsieh"}}"#).unwrap_err();
        assert!(matches!(err, MemcError::InvalidArguments(_)));
    }

    #[test]
    fn json_round_trip_keeps_values() {
        let mut config = ClientConfig::default();
        config.servers.push("cache:11211".to_string());
        config.behavior.auto_eject_hosts = true;
        let text = config.to_json().unwrap();
        assert_eq!(ClientConfig::from_json(&text).unwrap(), config);
    }
}
