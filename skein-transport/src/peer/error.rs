//! Error types for peer operations.

use std::io;
use thiserror::Error;

/// Errors that can occur during peer operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// Connection failed and could not be established
    #[error("Connection to peer failed")]
    ConnectionFailed,

    /// Outbound queue is full and the overflow policy rejects new frames
    #[error("Outbound queue is full (capacity {capacity})")]
    QueueFull {
        /// Queue capacity.
        capacity: usize,
    },

    /// The connection task has exited; the peer cannot send anymore
    #[error("Peer is closed")]
    Closed,

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(String),

    /// Receiver has been taken via take_receiver()
    #[error("Receiver has been taken")]
    ReceiverTaken,
}

impl From<io::Error> for PeerError {
    fn from(error: io::Error) -> Self {
        PeerError::Io(error.to_string())
    }
}

/// Result type for peer operations.
pub type PeerResult<T> = Result<T, PeerError>;
