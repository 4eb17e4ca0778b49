//! Connection management.
//!
//! A [`Peer`] is one TCP connection plus its outbound queue. It handles:
//! - **Lazy connect and reconnection** with exponential backoff (outbound)
//! - **Frame queuing** while no connection exists
//! - **Framing**: decoded envelopes come out of the receive channel
//!
//! # Connection Lifecycle
//!
//! ```text
//! ┌──────────┐  first frame   ┌───────────┐
//! │   Idle   ├───────────────►│ Connected │
//! └──────────┘                └─────┬─────┘
//!      ▲                            │ read/write error
//!      │ backoff                    ▼
//! ┌────┴─────┐              ┌───────────────┐
//! │Reconnect │◄─────────────┤ Disconnected  │
//! │  ing     │  outbound    │ (incoming:    │
//! └──────────┘              │  task exits)  │
//!                           └───────────────┘
//! ```
//!
//! # Backoff Strategy
//!
//! - Initial delay: configurable (default 100ms)
//! - Doubles after every failed attempt, capped at `max_reconnect_delay`
//! - Reset on success
//!
//! # Configuration
//!
//! ```
//! use std::time::Duration;
//! use skein_transport::{OverflowPolicy, PeerConfig};
//!
//! let config = PeerConfig::default()
//!     .with_queue(500, OverflowPolicy::DropOldest)
//!     .with_ping(Duration::from_secs(10));
//! assert_eq!(config.max_queue_size, 500);
//! ```

/// Core peer implementation with automatic reconnection and queuing
pub mod core;

/// Configuration structures for peer behavior
pub mod config;

/// Per-connection counters
pub mod metrics;

/// Error types specific to peer operations
pub mod error;

/// Bounded outbound frame queue
pub mod queue;

// Re-export main types
pub use config::PeerConfig;
pub use core::{Peer, PeerReceiver};
pub use error::{PeerError, PeerResult};
pub use metrics::PeerMetrics;
pub use queue::{Enqueued, OutboundQueue, OverflowPolicy};
