use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::trust::GateConfig;

/// Engine configuration. Defaults carry the documented protocol values;
/// deployments override through the daemon's TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Fetcher worker pool size; must be at least 1.
    pub fetch_workers: usize,
    /// Bounded tip queue capacity.
    pub tip_queue_capacity: usize,
    /// Announcement de-dup window. In-memory only: a restart inside the
    /// window can cause one redundant fetch per recently-seen CID.
    #[serde(with = "humantime_serde")]
    pub dedup_window: Duration,
    /// Maximum CIDs tracked inside the de-dup window.
    pub dedup_capacity: usize,
    /// Total wall-clock budget per fetch, measured from tip receipt.
    #[serde(with = "humantime_serde")]
    pub max_fetch_latency: Duration,
    /// Transport-failure retry attempts per announcer.
    pub fetch_retry_attempts: u32,
    /// First retry backoff; later attempts multiply by the factor.
    #[serde(with = "humantime_serde")]
    pub fetch_backoff_initial: Duration,
    pub fetch_backoff_multiplier: u32,
    /// Requeue budget for rate-limited tips.
    pub rate_limited_requeues: u32,
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Per-frame read/write deadline on exchange streams.
    #[serde(with = "humantime_serde")]
    pub frame_timeout: Duration,
    /// Cap on concurrently served inbound exchange streams.
    pub max_inbound_streams: usize,
    /// Streaming-session cap per client peer.
    pub session_cap_per_peer: usize,
    /// Streaming-session cap across all clients.
    pub session_cap_global: usize,
    /// Lifetime of a Single-mode session with no match.
    #[serde(with = "humantime_serde")]
    pub single_session_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub default_batch_window: Duration,
    pub default_batch_size: usize,
    /// Streaming/Batch sessions close after `factor x batch_window` without
    /// a match.
    pub inactivity_batch_factor: u32,
    pub default_messages_per_minute: u32,
    /// Priority bonus applied when the effective policy pins the record.
    pub pin_priority_bonus: u8,
    /// Additional per-schema priority bonuses.
    pub schema_priority_bonus: HashMap<String, u8>,
    /// Pump/poll granularity for the service loops.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Store prune and session sweep cadence.
    #[serde(with = "humantime_serde")]
    pub maintenance_interval: Duration,
    /// Consecutive backpressure drops before a slow peer is disconnected.
    pub slow_peer_threshold: u32,
    /// Trust gate rates and abuse handling.
    pub gate: GateConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            fetch_workers: 8,
            tip_queue_capacity: 10_000,
            dedup_window: Duration::from_secs(600),
            dedup_capacity: 100_000,
            max_fetch_latency: Duration::from_secs(30),
            fetch_retry_attempts: 3,
            fetch_backoff_initial: Duration::from_secs(1),
            fetch_backoff_multiplier: 3,
            rate_limited_requeues: 3,
            handshake_timeout: Duration::from_secs(10),
            frame_timeout: Duration::from_secs(15),
            max_inbound_streams: 64,
            session_cap_per_peer: 64,
            session_cap_global: 1024,
            single_session_ttl: Duration::from_secs(60),
            default_batch_window: Duration::from_secs(10),
            default_batch_size: 32,
            inactivity_batch_factor: 5,
            default_messages_per_minute: 600,
            pin_priority_bonus: 16,
            schema_priority_bonus: HashMap::new(),
            poll_interval: Duration::from_millis(100),
            maintenance_interval: Duration::from_secs(1),
            slow_peer_threshold: 8,
            gate: GateConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Clamps nonsensical values to their minimums.
    pub fn sanitized(mut self) -> Self {
        self.fetch_workers = self.fetch_workers.max(1);
        self.tip_queue_capacity = self.tip_queue_capacity.max(1);
        self.session_cap_per_peer = self.session_cap_per_peer.max(1);
        self.session_cap_global = self.session_cap_global.max(self.session_cap_per_peer);
        self.max_inbound_streams = self.max_inbound_streams.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::NodeConfig;

    #[test]
    fn defaults_match_documented_values() {
        let config = NodeConfig::default();
        assert_eq!(config.fetch_workers, 8);
        assert_eq!(config.tip_queue_capacity, 10_000);
        assert_eq!(config.dedup_window.as_secs(), 600);
        assert_eq!(config.max_fetch_latency.as_secs(), 30);
        assert_eq!(config.fetch_retry_attempts, 3);
        assert_eq!(config.session_cap_per_peer, 64);
        assert_eq!(config.session_cap_global, 1024);
    }

    #[test]
    fn sanitized_enforces_minimums() {
        let mut config = NodeConfig::default();
        config.fetch_workers = 0;
        config.tip_queue_capacity = 0;
        let config = config.sanitized();
        assert_eq!(config.fetch_workers, 1);
        assert_eq!(config.tip_queue_capacity, 1);
    }

    #[test]
    fn config_round_trips_through_toml_style_serde() {
        let config = NodeConfig::default();
        let json = serde_json::to_string(&config).expect("config should serialize");
        let back: NodeConfig = serde_json::from_str(&json).expect("config should deserialize");
        assert_eq!(back.fetch_workers, config.fetch_workers);
        assert_eq!(back.dedup_window, config.dedup_window);
    }
}
