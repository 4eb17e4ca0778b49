//! # skein-transport
//!
//! RPC and publish/subscribe over long-lived TCP connections.
//!
//! Messages travel as JSON [`Envelope`]s terminated by the `!<^>!` sentinel.
//! The layers, bottom up:
//!
//! - [`frame`]: sentinel framing with resynchronization on garbage
//! - [`peer`]: one connection, its outbound queue and reconnection
//! - [`bus`]: per-process routing of envelopes to hosts and clients
//! - [`rpc`]: request correlation, timeouts and call statistics
//! - [`service`]: host and client roles composed in one process
//!
//! # Calling a service
//!
//! ```rust,no_run
//! use std::rc::Rc;
//! use serde_json::{json, Map};
//! use skein_transport::{
//!     Bus, RequestContext, ServiceClient, StaticRegistry, TcpBus, TokioProviders,
//!     TransportConfig, TransportKind, ServiceIdentity,
//! };
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = StaticRegistry::new();
//! registry.add_route("calc@1.0", "127.0.0.1:4000");
//!
//! let providers = TokioProviders::new();
//! let config = TransportConfig::default();
//! let bus: Rc<dyn Bus> = Rc::new(TcpBus::new(
//!     providers.clone(),
//!     Rc::new(registry),
//!     config.clone(),
//! ));
//!
//! let calc = ServiceClient::new(
//!     ServiceIdentity::new("calc", "1.0"),
//!     TransportKind::Tcp,
//!     providers,
//!     config.rpc,
//! );
//! calc.attach_bus(&bus);
//!
//! let mut args = Map::new();
//! args.insert("a".into(), json!(2));
//! args.insert("b".into(), json!(3));
//! let sum = calc.call("add", args, &RequestContext::new()).await?;
//! assert_eq!(sum, json!(5));
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod bus;
pub mod config;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod peer;
pub mod rpc;
pub mod service;

pub use bus::{
    Bus, BusMetrics, EnvelopeReceiver, Registration, Registry, RegistryError, StaticRegistry,
    TcpBus,
};
pub use config::{FrameConfig, RpcConfig, TransportConfig};
pub use envelope::{Deprecation, Envelope, ErrorBody, PacketKind, REQUEST_ID_KEY};
pub use error::{BusError, ConfigError, LifecycleError, RpcError};
pub use frame::{DecoderMetrics, EncodedFrame, FrameDecoder, FrameError, SENTINEL, encode_frame};
pub use peer::{OverflowPolicy, Peer, PeerConfig, PeerError, PeerMetrics};
pub use rpc::{
    CallAggregate, CallObserver, CallRecord, CallStatus, ClientStats, Correlator, Reply,
    ReplyFuture, RequestContext,
};
pub use service::{
    Broadcast, EndpointMap, LifecycleState, PickOne, PublishStrategy, ServiceClient,
    ServiceFault, ServiceHost,
};

pub use skein_core::{
    NetworkProvider, NodeId, Providers, RandomProvider, ServiceIdentity, TaskProvider,
    TimeProvider, TokioProviders, TransportKind,
};
