//! Transport configuration.
//!
//! Every section deserializes with defaults, so a JSON file only needs the
//! keys it overrides:
//!
//! ```json
//! {
//!   "frame": { "max_frame_size": 2000000 },
//!   "peer":  { "max_queue_size": 500, "overflow_policy": "drop_oldest" },
//!   "rpc":   { "default_timeout_ms": 30000 }
//! }
//! ```
//!
//! Durations are written in milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::peer::PeerConfig;

/// Complete transport configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Frame codec limits.
    pub frame: FrameConfig,
    /// Connection and outbound queue behavior.
    pub peer: PeerConfig,
    /// Request correlation limits.
    pub rpc: RpcConfig,
}

impl TransportConfig {
    /// Load configuration from a JSON file.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Frame codec limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Request/response frames above this size are logged and counted.
    /// They are still sent.
    pub max_frame_size: usize,

    /// Time a request/response fragment may stay incomplete before a
    /// slow-parse diagnostic is emitted.
    #[serde(rename = "slow_parse_threshold_ms", with = "duration_ms")]
    pub slow_parse_threshold: Duration,

    /// Upper bound on buffered incomplete input. Exceeding it resets the
    /// decoder.
    pub max_buffered_bytes: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 1_000_000,
            slow_parse_threshold: Duration::from_millis(500),
            max_buffered_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Request correlation limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Timeout applied when a call does not override it.
    #[serde(rename = "default_timeout_ms", with = "duration_ms")]
    pub default_timeout: Duration,

    /// Largest per-call timeout accepted.
    #[serde(rename = "max_timeout_ms", with = "duration_ms")]
    pub max_timeout: Duration,

    /// Maximum number of in-flight requests per client.
    pub max_pending: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(600),
            max_timeout: Duration::from_secs(600),
            max_pending: 65_536,
        }
    }
}

/// Serde adapter writing a [`Duration`] as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::OverflowPolicy;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.frame.max_frame_size, 1_000_000);
        assert_eq!(config.frame.slow_parse_threshold, Duration::from_millis(500));
        assert_eq!(config.rpc.default_timeout, Duration::from_secs(600));
        assert_eq!(config.rpc.max_pending, 65_536);
        assert_eq!(config.peer.max_queue_size, 10_000);
        assert_eq!(config.peer.overflow_policy, OverflowPolicy::Reject);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: TransportConfig = serde_json::from_str(
            r#"{"rpc": {"default_timeout_ms": 2500}, "peer": {"overflow_policy": "drop_oldest"}}"#,
        )
        .expect("parse");
        assert_eq!(config.rpc.default_timeout, Duration::from_millis(2500));
        assert_eq!(config.rpc.max_timeout, Duration::from_secs(600));
        assert_eq!(config.peer.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.frame, FrameConfig::default());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config =
            TransportConfig::from_json_file(dir.path().join("config.json")).expect("defaults");
        assert_eq!(config, TransportConfig::default());
    }

    #[test]
    fn test_file_is_loaded() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, r#"{{"frame": {{"max_frame_size": 42}}}}"#).expect("write");
        let config = TransportConfig::from_json_file(file.path()).expect("load");
        assert_eq!(config.frame.max_frame_size, 42);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, "{{not json").expect("write");
        let err = TransportConfig::from_json_file(file.path()).expect_err("must fail");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_durations_serialize_as_millis() {
        let value = serde_json::to_value(RpcConfig::default()).expect("serialize");
        assert_eq!(value["default_timeout_ms"], serde_json::json!(600_000));
    }
}
