//! Configuration structures for peer behavior.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::queue::OverflowPolicy;
use crate::config::duration_ms;

/// Configuration for peer behavior and reconnection parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Initial delay before attempting reconnection
    #[serde(rename = "initial_reconnect_delay_ms", with = "duration_ms")]
    pub initial_reconnect_delay: Duration,

    /// Maximum delay between reconnection attempts
    #[serde(rename = "max_reconnect_delay_ms", with = "duration_ms")]
    pub max_reconnect_delay: Duration,

    /// Maximum number of frames held in the outbound queue
    pub max_queue_size: usize,

    /// What happens when a frame is sent to a full queue
    pub overflow_policy: OverflowPolicy,

    /// Timeout for connection attempts
    #[serde(rename = "connection_timeout_ms", with = "duration_ms")]
    pub connection_timeout: Duration,

    /// Maximum number of consecutive connection failures before giving up.
    /// None means unlimited retries
    pub max_connection_failures: Option<u32>,

    /// Interval between keep-alive pings on an established connection.
    ///
    /// Set to `Duration::ZERO` to disable keep-alives.
    #[serde(rename = "ping_interval_ms", with = "duration_ms")]
    pub ping_interval: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            initial_reconnect_delay: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_secs(30),
            max_queue_size: 10_000,
            overflow_policy: OverflowPolicy::Reject,
            connection_timeout: Duration::from_secs(5),
            max_connection_failures: None, // Unlimited retries by default
            ping_interval: Duration::ZERO, // Disabled by default
        }
    }
}

impl PeerConfig {
    /// Enable keep-alive pings with the given interval.
    pub fn with_ping(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the outbound queue bound and overflow policy.
    pub fn with_queue(mut self, max_queue_size: usize, policy: OverflowPolicy) -> Self {
        self.max_queue_size = max_queue_size;
        self.overflow_policy = policy;
        self
    }

    /// Create a configuration for low-latency local networking.
    pub fn local_network() -> Self {
        Self {
            initial_reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_secs(1),
            max_queue_size: 1_000,
            overflow_policy: OverflowPolicy::Reject,
            connection_timeout: Duration::from_millis(500),
            max_connection_failures: Some(10),
            ping_interval: Duration::ZERO,
        }
    }

    /// Create a configuration for high-latency WAN networking.
    pub fn wan_network() -> Self {
        Self {
            initial_reconnect_delay: Duration::from_millis(500),
            max_reconnect_delay: Duration::from_secs(60),
            max_queue_size: 50_000,
            overflow_policy: OverflowPolicy::Reject,
            connection_timeout: Duration::from_secs(30),
            max_connection_failures: None, // Unlimited retries for WAN
            ping_interval: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_differ_in_patience() {
        let local = PeerConfig::local_network();
        let wan = PeerConfig::wan_network();
        assert!(local.connection_timeout < wan.connection_timeout);
        assert_eq!(local.max_connection_failures, Some(10));
        assert_eq!(wan.max_connection_failures, None);
    }

    #[test]
    fn test_builders() {
        let config = PeerConfig::default()
            .with_ping(Duration::from_secs(5))
            .with_queue(3, OverflowPolicy::DropOldest);
        assert_eq!(config.ping_interval, Duration::from_secs(5));
        assert_eq!(config.max_queue_size, 3);
        assert_eq!(config.overflow_policy, OverflowPolicy::DropOldest);
    }
}
