//! Per-connection counters and state.

use std::time::Duration;

use crate::frame::DecoderMetrics;

/// Snapshot of a peer's counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerMetrics {
    /// Whether a connection is currently established.
    pub is_connected: bool,
    /// Connection attempts made.
    pub connection_attempts: u64,
    /// Connection attempts that failed.
    pub connection_failures: u64,
    /// Backoff that will be applied before the next attempt.
    pub current_backoff: Duration,
    /// When the current connection was established.
    pub connected_at: Option<Duration>,
    /// Frames accepted into the outbound queue.
    pub frames_queued: u64,
    /// Frames written to the socket.
    pub frames_sent: u64,
    /// Frames evicted or discarded without being written.
    pub frames_dropped: u64,
    /// Bytes written to the socket.
    pub bytes_sent: u64,
    /// Bytes read from the socket.
    pub bytes_received: u64,
    /// Keep-alive pings queued.
    pub pings_sent: u64,
    /// Keep-alive pings received and dropped.
    pub pings_received: u64,
    /// Frame decoder counters for the current connection.
    pub decoder: DecoderMetrics,
}

impl PeerMetrics {
    pub(crate) fn record_connection_attempt(&mut self) {
        self.connection_attempts += 1;
    }

    pub(crate) fn record_connection_success_at(&mut self, now: Duration) {
        self.is_connected = true;
        self.connected_at = Some(now);
        self.current_backoff = Duration::ZERO;
    }

    pub(crate) fn record_connection_failure(&mut self, next_delay: Duration) {
        self.connection_failures += 1;
        self.current_backoff = next_delay;
    }

    pub(crate) fn record_disconnected(&mut self) {
        self.is_connected = false;
        self.connected_at = None;
    }

    pub(crate) fn record_frame_sent(&mut self, bytes: usize) {
        self.frames_sent += 1;
        self.bytes_sent += bytes as u64;
    }
}
