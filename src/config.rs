//! Engine configuration

use serde::Deserialize;

/// Tunables for the sharded engine.
///
/// Every field has a default, so `EngineConfig::default()` yields a working
/// engine and deployments can override fields selectively from any serde
/// format.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of shards. Defaults to one per CPU core, clamped to 1..=16.
    pub num_shards: usize,

    /// Cardinality at or above which a deleted or expired sorted set is
    /// handed to the background drop pool instead of being freed on the
    /// shard thread.
    pub async_del_threshold: usize,

    /// Interval between proactive expiry sweeps, in milliseconds.
    /// Zero disables the sweeper; expiry then happens lazily on access
    /// (or through explicit sweeps).
    pub sweep_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            num_shards: num_cpus::get().clamp(1, 16),
            async_del_threshold: 1024,
            sweep_interval_ms: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_usable() {
        let config = EngineConfig::default();
        assert!(config.num_shards >= 1);
        assert!(config.num_shards <= 16);
        assert!(config.async_del_threshold > 0);
    }

    #[test]
    fn test_partial_override_from_json() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"num_shards": 2, "sweep_interval_ms": 0}"#).unwrap();
        assert_eq!(config.num_shards, 2);
        assert_eq!(config.sweep_interval_ms, 0);
        // Untouched fields keep their defaults
        assert_eq!(config.async_del_threshold, 1024);
    }
}
