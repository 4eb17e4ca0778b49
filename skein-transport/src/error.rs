//! Error types for the skein transport layers.
//!
//! - [`RpcError`]: what a caller sees when a call does not produce a result
//! - [`BusError`]: routing and hand-off failures on a bus
//! - [`LifecycleError`]: out-of-order service host operations
//! - [`ConfigError`]: configuration loading failures

use std::time::Duration;

use serde_json::Value;

use crate::envelope::Deprecation;
use crate::frame::FrameError;
use crate::peer::PeerError;
use crate::service::LifecycleState;

/// Outcome of a call that did not yield a result.
///
/// `RemoteOpaque` and `RemoteStructured` both carry the remote error value
/// and any deprecation notice attached to the response.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    /// No response arrived before the deadline. The remote side may still
    /// have executed the request.
    #[error("request {request_id} timed out after {timeout:?}")]
    Timeout {
        /// The request that timed out.
        request_id: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The bus had no route for the destination when the request was sent.
    #[error("client not found: {entity}")]
    Unreachable {
        /// The entity that could not be reached.
        entity: String,
    },

    /// The remote handler failed with an unhandled fault (`failed = true`).
    #[error("remote fault: {error}")]
    RemoteOpaque {
        /// Error value sent by the remote side.
        error: Value,
        /// Deprecation notice attached to the response.
        deprecation: Option<Deprecation>,
    },

    /// The remote handler returned a business error the caller may branch on.
    #[error("remote error: {error}")]
    RemoteStructured {
        /// Error value sent by the remote side.
        error: Value,
        /// Deprecation notice attached to the response.
        deprecation: Option<Deprecation>,
    },

    /// The waiter was dropped before the call completed.
    #[error("connection closed before a response arrived")]
    ConnectionClosed,

    /// A request with the same id is already pending.
    #[error("request id {request_id} is already pending")]
    DuplicateRequestId {
        /// The rejected id.
        request_id: String,
    },

    /// Too many requests are pending on this client.
    #[error("too many pending requests (limit {limit})")]
    Overloaded {
        /// Configured pending limit.
        limit: usize,
    },

    /// A per-call timeout outside `0 < t <= max`.
    #[error("invalid timeout {timeout:?} (must be > 0 and <= {max:?})")]
    InvalidTimeout {
        /// Requested timeout.
        timeout: Duration,
        /// Largest accepted timeout.
        max: Duration,
    },

    /// The outbound queue of the destination connection is full.
    #[error("outbound queue full (capacity {capacity})")]
    Backpressure {
        /// Queue capacity.
        capacity: usize,
    },

    /// A response carried neither `result` nor `error`.
    #[error("invalid response to request {request_id}")]
    InvalidResponse {
        /// The request the response claimed to answer.
        request_id: String,
    },

    /// The request could not be encoded.
    #[error("serialization failed: {message}")]
    Serialization {
        /// Encoder message.
        message: String,
    },
}

impl RpcError {
    /// Deprecation notice carried by a remote error, if any.
    pub fn deprecation(&self) -> Option<&Deprecation> {
        match self {
            RpcError::RemoteOpaque { deprecation, .. }
            | RpcError::RemoteStructured { deprecation, .. } => deprecation.as_ref(),
            _ => None,
        }
    }
}

/// Errors raised while handing an envelope to a bus.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    /// Nothing is known about where to send the envelope.
    #[error("no route to {entity}")]
    NoRoute {
        /// Destination entity or node.
        entity: String,
    },

    /// The envelope could not be encoded.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The connection refused the frame.
    #[error("peer error: {0}")]
    Peer(#[from] PeerError),

    /// Binding or accepting failed.
    #[error("network error: {message}")]
    Network {
        /// Details about the network error.
        message: String,
    },

    /// The bus was dropped.
    #[error("bus closed")]
    Closed,
}

impl From<std::io::Error> for BusError {
    fn from(err: std::io::Error) -> Self {
        BusError::Network {
            message: err.to_string(),
        }
    }
}

impl From<BusError> for RpcError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::NoRoute { entity } => RpcError::Unreachable { entity },
            BusError::Peer(PeerError::QueueFull { capacity }) => {
                RpcError::Backpressure { capacity }
            }
            BusError::Frame(e) => RpcError::Serialization {
                message: e.to_string(),
            },
            BusError::Peer(_) | BusError::Network { .. } | BusError::Closed => {
                RpcError::ConnectionClosed
            }
        }
    }
}

/// Errors raised by out-of-order service host operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    /// The operation is not allowed in the current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// Attempted operation.
        operation: &'static str,
        /// Current state.
        state: LifecycleState,
    },

    /// `register` needs a bus that is listening.
    #[error("bus has no local address, call listen first")]
    NotListening,

    /// The registry refused the registration.
    #[error("registration rejected: {message}")]
    Registration {
        /// Registry message.
        message: String,
    },
}

/// Errors loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not valid configuration JSON.
    #[error("cannot parse {path}: {source}")]
    Parse {
        /// File path.
        path: String,
        /// Underlying error.
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bus_error_maps_to_rpc_error() {
        let err: RpcError = BusError::NoRoute {
            entity: "calc@1.0".into(),
        }
        .into();
        assert_eq!(
            err,
            RpcError::Unreachable {
                entity: "calc@1.0".into()
            }
        );

        let err: RpcError = BusError::Peer(PeerError::QueueFull { capacity: 3 }).into();
        assert_eq!(err, RpcError::Backpressure { capacity: 3 });

        let err: RpcError = BusError::Closed.into();
        assert_eq!(err, RpcError::ConnectionClosed);
    }

    #[test]
    fn test_deprecation_accessor() {
        let deprecation = Deprecation::new("divide");
        let err = RpcError::RemoteStructured {
            error: json!("division_by_zero"),
            deprecation: Some(deprecation.clone()),
        };
        assert_eq!(err.deprecation(), Some(&deprecation));
        assert_eq!(RpcError::ConnectionClosed.deprecation(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            RpcError::Unreachable {
                entity: "calc@1.0".into()
            }
            .to_string(),
            "client not found: calc@1.0"
        );
        assert_eq!(
            RpcError::RemoteStructured {
                error: json!("division_by_zero"),
                deprecation: None,
            }
            .to_string(),
            "remote error: \"division_by_zero\""
        );
    }
}
