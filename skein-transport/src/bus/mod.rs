//! Buses: the shared outbound channel of a process.
//!
//! A host and every client of the matching [`TransportKind`] share one bus.
//! Outbound, the bus turns an envelope into a frame and hands it to the
//! connection for its destination. Inbound, it routes each decoded envelope
//! by kind:
//!
//! | kind       | delivered to                                    |
//! |------------|-------------------------------------------------|
//! | `request`  | the attached host                               |
//! | `response` | clients of the entity, if `to` is this node     |
//! | `publish`  | clients of the publishing entity                |
//! | `ping`     | dropped                                         |

use std::rc::Weak;

use skein_core::{NodeId, TransportKind};

use crate::envelope::Envelope;
use crate::error::BusError;

mod registry;
mod tcp;

pub use registry::{Registration, Registry, RegistryError, StaticRegistry};
pub use tcp::{BusMetrics, TcpBus};

/// Consumer of inbound envelopes.
///
/// Called synchronously from the connection router; implementations hand
/// long work off to a spawned task.
pub trait EnvelopeReceiver {
    /// Handle one inbound envelope.
    fn receive(&self, envelope: Envelope);
}

/// Outbound channel bound to one transport kind.
pub trait Bus {
    /// Transport kind; decides which clients a host rebinds on attach.
    fn kind(&self) -> TransportKind;

    /// Node id written as `from` on outbound requests.
    fn node_id(&self) -> &NodeId;

    /// Address this bus accepts connections on, once listening.
    fn local_address(&self) -> Option<String>;

    /// Route a request (by entity) or a response (by destination node).
    ///
    /// Returns the address the envelope was queued for. Never waits for I/O.
    ///
    /// # Errors
    ///
    /// [`BusError::NoRoute`] when the destination is unknown, or the error of
    /// the connection that refused the frame.
    fn send(&self, envelope: Envelope) -> Result<String, BusError>;

    /// Queue an envelope for an explicit address, connecting if needed.
    ///
    /// # Errors
    ///
    /// The error of the connection that refused the frame.
    fn send_to(&self, address: &str, envelope: Envelope) -> Result<(), BusError>;

    /// Deliver inbound requests to `receiver`.
    fn attach_host(&self, receiver: Weak<dyn EnvelopeReceiver>);

    /// Deliver inbound responses and publications of `entity` to `receiver`.
    fn attach_client(&self, entity: &str, receiver: Weak<dyn EnvelopeReceiver>);
}
