use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Policy for resolving concurrent writes to the same key from different
/// origin nodes. Both variants are deterministic: every node picks the same
/// winner regardless of merge order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Higher timestamp wins; equal timestamps fall back to lexically
    /// greater origin id.
    LastWriteWins,
    /// Lexically smaller origin id wins regardless of timestamps.
    OriginPriority,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        ConflictPolicy::LastWriteWins
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    pub node_id: String,
    pub bind_addr: String,
    #[serde(default)]
    pub seed_addrs: Vec<String>,
    #[serde(default = "defaults::gossip_interval_ms")]
    pub gossip_interval_ms: u64,
    #[serde(default = "defaults::fanout")]
    pub fanout: usize,
    /// Upper bound on state entries piggybacked per gossip payload.
    #[serde(default = "defaults::gossip_sample")]
    pub gossip_sample: usize,
    #[serde(default = "defaults::suspicion_timeout_ms")]
    pub suspicion_timeout_ms: u64,
    #[serde(default = "defaults::failure_timeout_ms")]
    pub failure_timeout_ms: u64,
    #[serde(default = "defaults::incremental_sync_interval_ms")]
    pub incremental_sync_interval_ms: u64,
    #[serde(default = "defaults::full_sync_interval_ms")]
    pub full_sync_interval_ms: u64,
    #[serde(default = "defaults::max_sync_peers")]
    pub max_sync_peers: usize,
    /// Tombstones become eligible for physical removal once older than
    /// this. Must exceed the full sync interval so deletions propagate
    /// before collection.
    #[serde(default = "defaults::tombstone_retention_ms")]
    pub tombstone_retention_ms: u64,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

mod defaults {
    pub fn gossip_interval_ms() -> u64 {
        1_000
    }
    pub fn fanout() -> usize {
        3
    }
    pub fn gossip_sample() -> usize {
        32
    }
    pub fn suspicion_timeout_ms() -> u64 {
        5_000
    }
    pub fn failure_timeout_ms() -> u64 {
        10_000
    }
    pub fn incremental_sync_interval_ms() -> u64 {
        5_000
    }
    pub fn full_sync_interval_ms() -> u64 {
        30_000
    }
    pub fn max_sync_peers() -> usize {
        3
    }
    pub fn tombstone_retention_ms() -> u64 {
        120_000
    }
}

impl GossipConfig {
    pub fn new(node_id: impl Into<String>, bind_addr: impl Into<String>) -> Self {
        GossipConfig {
            node_id: node_id.into(),
            bind_addr: bind_addr.into(),
            seed_addrs: Vec::new(),
            gossip_interval_ms: defaults::gossip_interval_ms(),
            fanout: defaults::fanout(),
            gossip_sample: defaults::gossip_sample(),
            suspicion_timeout_ms: defaults::suspicion_timeout_ms(),
            failure_timeout_ms: defaults::failure_timeout_ms(),
            incremental_sync_interval_ms: defaults::incremental_sync_interval_ms(),
            full_sync_interval_ms: defaults::full_sync_interval_ms(),
            max_sync_peers: defaults::max_sync_peers(),
            tombstone_retention_ms: defaults::tombstone_retention_ms(),
            conflict_policy: ConflictPolicy::default(),
        }
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::new(format!("cannot read config file: {}", e)))?;
        let config: GossipConfig = toml::from_str(&raw)
            .map_err(|e| ConfigError::new(format!("cannot parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Surface misconfiguration once, at startup. Runtime code assumes a
    /// validated config and degrades empty-peer rounds to no-ops.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::new("node_id must not be empty"));
        }
        if self.bind_addr.is_empty() {
            return Err(ConfigError::new("bind_addr must not be empty"));
        }
        if self.gossip_interval_ms == 0 {
            return Err(ConfigError::new("gossip_interval_ms must be > 0"));
        }
        if self.fanout == 0 {
            return Err(ConfigError::new("fanout must be >= 1"));
        }
        if self.gossip_sample == 0 {
            return Err(ConfigError::new("gossip_sample must be >= 1"));
        }
        if self.suspicion_timeout_ms == 0 || self.failure_timeout_ms == 0 {
            return Err(ConfigError::new(
                "suspicion_timeout_ms and failure_timeout_ms must be > 0",
            ));
        }
        if self.incremental_sync_interval_ms == 0 || self.full_sync_interval_ms == 0 {
            return Err(ConfigError::new("sync intervals must be > 0"));
        }
        if self.max_sync_peers == 0 {
            return Err(ConfigError::new("max_sync_peers must be >= 1"));
        }
        if self.tombstone_retention_ms <= self.full_sync_interval_ms {
            return Err(ConfigError::new(
                "tombstone_retention_ms must exceed full_sync_interval_ms",
            ));
        }
        Ok(())
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    /// Detector ticks at half the suspicion timeout so a transition is never
    /// observed more than half a timeout late.
    pub fn detector_interval(&self) -> Duration {
        Duration::from_millis((self.suspicion_timeout_ms / 2).max(1))
    }

    pub fn incremental_sync_interval(&self) -> Duration {
        Duration::from_millis(self.incremental_sync_interval_ms)
    }

    pub fn full_sync_interval(&self) -> Duration {
        Duration::from_millis(self.full_sync_interval_ms)
    }

    pub fn suspicion_timeout_secs(&self) -> f64 {
        self.suspicion_timeout_ms as f64 / 1000.0
    }

    pub fn failure_timeout_secs(&self) -> f64 {
        self.failure_timeout_ms as f64 / 1000.0
    }

    pub fn tombstone_retention_secs(&self) -> f64 {
        self.tombstone_retention_ms as f64 / 1000.0
    }
}

/// Startup-time misconfiguration. Per-message runtime failures are never
/// surfaced through this type.
#[derive(Debug, Clone)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        ConfigError {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid gossip config: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = GossipConfig::new("node-1", "127.0.0.1:7000");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_fanout_rejected() {
        let mut config = GossipConfig::new("node-1", "127.0.0.1:7000");
        config.fanout = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retention_must_exceed_full_sync_interval() {
        let mut config = GossipConfig::new("node-1", "127.0.0.1:7000");
        config.tombstone_retention_ms = config.full_sync_interval_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = GossipConfig::new("node-1", "127.0.0.1:7000");
        let raw = toml::to_string(&config).unwrap();
        let parsed: GossipConfig = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.node_id, "node-1");
        assert_eq!(parsed.conflict_policy, ConflictPolicy::LastWriteWins);
    }
}
