//! TCP bus: one [`Peer`] per remote address.
//!
//! Outbound peers are created on first use and reconnect on their own.
//! Accepted connections become incoming peers; the node id of every request
//! they carry is remembered so the response can travel back over the same
//! connection.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use tokio::task::JoinHandle;

use skein_core::{
    NetworkProvider, NodeId, Providers, RandomProvider, TaskProvider, TcpListenerTrait,
    TimeProvider, TransportKind,
};

use super::{Bus, EnvelopeReceiver, Registry};
use crate::config::TransportConfig;
use crate::envelope::{Envelope, PacketKind};
use crate::error::BusError;
use crate::frame::encode_frame;
use crate::peer::{Peer, PeerMetrics, PeerReceiver};

type Listener<P> = <<P as Providers>::Network as NetworkProvider>::TcpListener;
type Stream<P> = <<P as Providers>::Network as NetworkProvider>::TcpStream;

const ACCEPT_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(100);

/// Counters for envelopes crossing a bus.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusMetrics {
    /// Envelopes handed to a connection.
    pub envelopes_sent: u64,
    /// Envelopes received from any connection.
    pub envelopes_received: u64,
    /// Request/response frames above `max_frame_size`.
    pub oversized_frames: u64,
    /// Inbound envelopes with no receiver, or responses for another node.
    pub unroutable: u64,
    /// Connections accepted by the listener.
    pub connections_accepted: u64,
}

struct BusState<P: Providers> {
    peers: HashMap<String, Peer<P>>,
    node_routes: HashMap<NodeId, String>,
    host: Option<Weak<dyn EnvelopeReceiver>>,
    clients: HashMap<String, Vec<Weak<dyn EnvelopeReceiver>>>,
    local_address: Option<String>,
    listener: Option<JoinHandle<()>>,
    metrics: BusMetrics,
}

struct BusInner<P: Providers> {
    providers: P,
    node_id: NodeId,
    registry: Rc<dyn Registry>,
    config: TransportConfig,
    state: RefCell<BusState<P>>,
}

impl<P: Providers> Drop for BusInner<P> {
    fn drop(&mut self) {
        if let Some(listener) = self.state.get_mut().listener.take() {
            listener.abort();
        }
    }
}

/// Bus speaking the sentinel-framed protocol over TCP.
///
/// Cheap to clone; clones share connections and routing tables.
pub struct TcpBus<P: Providers> {
    inner: Rc<BusInner<P>>,
}

impl<P: Providers> Clone for TcpBus<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: Providers> TcpBus<P> {
    /// Create a bus with a freshly generated node id.
    pub fn new(providers: P, registry: Rc<dyn Registry>, config: TransportConfig) -> Self {
        let node_id = NodeId::new(providers.random().unique_hex());
        Self::with_node_id(providers, node_id, registry, config)
    }

    /// Create a bus with an explicit node id.
    pub fn with_node_id(
        providers: P,
        node_id: NodeId,
        registry: Rc<dyn Registry>,
        config: TransportConfig,
    ) -> Self {
        Self {
            inner: Rc::new(BusInner {
                providers,
                node_id,
                registry,
                config,
                state: RefCell::new(BusState {
                    peers: HashMap::new(),
                    node_routes: HashMap::new(),
                    host: None,
                    clients: HashMap::new(),
                    local_address: None,
                    listener: None,
                    metrics: BusMetrics::default(),
                }),
            }),
        }
    }

    /// Bind `addr` and accept connections in the background.
    ///
    /// Returns the bound address, which differs from `addr` when binding
    /// port 0.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Network`] if binding fails.
    pub async fn listen(&self, addr: &str) -> Result<String, BusError> {
        let listener = self.inner.providers.network().bind(addr).await?;
        let local_address = listener.local_addr()?;

        let handle = self.inner.providers.task().spawn_task(
            "accept_loop",
            accept_loop::<P>(Rc::downgrade(&self.inner), listener),
        );

        let mut state = self.inner.state.borrow_mut();
        if let Some(previous) = state.listener.replace(handle) {
            previous.abort();
        }
        state.local_address = Some(local_address.clone());
        tracing::info!(
            address = %local_address,
            node_id = %self.inner.node_id,
            "bus listening"
        );
        Ok(local_address)
    }

    /// Stop listening and close every connection.
    pub async fn close(&self) {
        let peers: Vec<Peer<P>> = {
            let mut state = self.inner.state.borrow_mut();
            if let Some(listener) = state.listener.take() {
                listener.abort();
            }
            state.local_address = None;
            state.node_routes.clear();
            state.peers.drain().map(|(_, peer)| peer).collect()
        };
        tracing::debug!(connections = peers.len(), "closing bus");
        for mut peer in peers {
            peer.close().await;
        }
    }

    /// Bus counters.
    pub fn metrics(&self) -> BusMetrics {
        self.inner.state.borrow().metrics.clone()
    }

    /// Counters of the connection to `address`, if one exists.
    pub fn peer_metrics(&self, address: &str) -> Option<PeerMetrics> {
        self.inner.state.borrow().peers.get(address).map(Peer::metrics)
    }

    /// Number of open connections, inbound and outbound.
    pub fn connection_count(&self) -> usize {
        self.inner
            .state
            .borrow()
            .peers
            .values()
            .filter(|peer| !peer.is_closed())
            .count()
    }
}

impl<P: Providers> Bus for TcpBus<P> {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    fn local_address(&self) -> Option<String> {
        self.inner.state.borrow().local_address.clone()
    }

    fn send(&self, mut envelope: Envelope) -> Result<String, BusError> {
        match envelope.kind {
            PacketKind::Request => {
                let address = self.inner.registry.resolve(&envelope.entity).ok_or_else(|| {
                    BusError::NoRoute {
                        entity: envelope.entity.clone(),
                    }
                })?;
                if envelope.origin_node.is_none() {
                    envelope.origin_node = Some(self.inner.node_id.clone());
                }
                self.inner.send_frame(&address, envelope, true)?;
                Ok(address)
            }
            PacketKind::Response => {
                let Some(destination) = envelope.destination_node.clone() else {
                    return Err(BusError::NoRoute {
                        entity: envelope.entity,
                    });
                };
                let address = self
                    .inner
                    .state
                    .borrow()
                    .node_routes
                    .get(&destination)
                    .cloned()
                    .ok_or_else(|| BusError::NoRoute {
                        entity: destination.to_string(),
                    })?;
                self.inner.send_frame(&address, envelope, false)?;
                Ok(address)
            }
            PacketKind::Publish | PacketKind::Ping => {
                tracing::debug!(
                    kind = %envelope.kind,
                    entity = %envelope.entity,
                    "send needs an explicit address for this kind"
                );
                Err(BusError::NoRoute {
                    entity: envelope.entity,
                })
            }
        }
    }

    fn send_to(&self, address: &str, envelope: Envelope) -> Result<(), BusError> {
        self.inner.send_frame(address, envelope, true)
    }

    fn attach_host(&self, receiver: Weak<dyn EnvelopeReceiver>) {
        self.inner.state.borrow_mut().host = Some(receiver);
    }

    fn attach_client(&self, entity: &str, receiver: Weak<dyn EnvelopeReceiver>) {
        let mut state = self.inner.state.borrow_mut();
        let receivers = state.clients.entry(entity.to_string()).or_default();
        receivers.retain(|existing| existing.strong_count() > 0);
        if !receivers.iter().any(|existing| existing.ptr_eq(&receiver)) {
            receivers.push(receiver);
        }
    }
}

impl<P: Providers> BusInner<P> {
    /// Encode and queue an envelope for `address`.
    ///
    /// With `connect` unset only an existing open connection is used; this
    /// keeps responses on the connection the request arrived on.
    fn send_frame(
        self: &Rc<Self>,
        address: &str,
        envelope: Envelope,
        connect: bool,
    ) -> Result<(), BusError> {
        let frame = encode_frame(&envelope, &self.config.frame)?;

        let mut state = self.state.borrow_mut();
        let reusable = state
            .peers
            .get(address)
            .is_some_and(|peer| !peer.is_closed());
        if !reusable {
            if !connect {
                return Err(BusError::NoRoute {
                    entity: envelope.entity,
                });
            }
            let peer = self.open_outbound(address);
            state.peers.insert(address.to_string(), peer);
        }
        let Some(peer) = state.peers.get_mut(address) else {
            return Err(BusError::Closed);
        };
        peer.send_frame(frame.bytes)?;

        state.metrics.envelopes_sent += 1;
        if frame.oversized {
            state.metrics.oversized_frames += 1;
        }
        tracing::trace!(
            address,
            kind = %envelope.kind,
            entity = %envelope.entity,
            endpoint = envelope.endpoint_or_dash(),
            "envelope queued"
        );
        Ok(())
    }

    fn open_outbound(self: &Rc<Self>, address: &str) -> Peer<P> {
        tracing::debug!(address, "opening outbound connection");
        let mut peer = Peer::new(
            self.providers.clone(),
            address.to_string(),
            self.config.peer.clone(),
            self.config.frame.clone(),
        );
        self.spawn_router(address, &mut peer);
        peer
    }

    fn adopt_incoming(self: &Rc<Self>, stream: Stream<P>, remote: String) {
        tracing::debug!(remote = %remote, "connection accepted");
        let mut peer = Peer::new_incoming(
            self.providers.clone(),
            remote.clone(),
            stream,
            self.config.peer.clone(),
            self.config.frame.clone(),
        );
        self.spawn_router(&remote, &mut peer);

        let mut state = self.state.borrow_mut();
        state.metrics.connections_accepted += 1;
        state.peers.insert(remote, peer);
    }

    fn spawn_router(self: &Rc<Self>, address: &str, peer: &mut Peer<P>) {
        if let Some(receiver) = peer.take_receiver() {
            self.providers.task().spawn_task(
                "envelope_router",
                route_envelopes::<P>(Rc::downgrade(self), address.to_string(), receiver),
            );
        }
    }

    /// Deliver an inbound envelope. Receivers run with no bus borrow held.
    fn dispatch(&self, address: &str, envelope: Envelope) {
        let receivers = {
            let mut state = self.state.borrow_mut();
            state.metrics.envelopes_received += 1;
            match envelope.kind {
                PacketKind::Request => {
                    if let Some(origin) = &envelope.origin_node {
                        state
                            .node_routes
                            .insert(origin.clone(), address.to_string());
                    }
                    state
                        .host
                        .as_ref()
                        .and_then(Weak::upgrade)
                        .into_iter()
                        .collect::<Vec<_>>()
                }
                PacketKind::Response => {
                    if envelope.destination_node.as_ref() != Some(&self.node_id) {
                        state.metrics.unroutable += 1;
                        tracing::debug!(
                            to = ?envelope.destination_node,
                            node_id = %self.node_id,
                            "response for another node dropped"
                        );
                        return;
                    }
                    live_clients(&mut state.clients, &envelope.entity)
                }
                PacketKind::Publish => live_clients(&mut state.clients, &envelope.entity),
                PacketKind::Ping => return,
            }
        };

        if receivers.is_empty() {
            self.state.borrow_mut().metrics.unroutable += 1;
            tracing::warn!(
                kind = %envelope.kind,
                entity = %envelope.entity,
                endpoint = envelope.endpoint_or_dash(),
                "no receiver for inbound envelope"
            );
            return;
        }

        let last = receivers.len() - 1;
        let mut envelope = Some(envelope);
        for (index, receiver) in receivers.iter().enumerate() {
            let next = if index == last {
                envelope.take()
            } else {
                envelope.clone()
            };
            if let Some(next) = next {
                receiver.receive(next);
            }
        }
    }

    fn forget_peer(&self, address: &str) {
        let mut state = self.state.borrow_mut();
        let closed = state.peers.get(address).is_some_and(Peer::is_closed);
        if closed {
            state.peers.remove(address);
            state.node_routes.retain(|_, routed| routed != address);
            tracing::debug!(address, "connection removed");
        }
    }
}

fn live_clients(
    clients: &mut HashMap<String, Vec<Weak<dyn EnvelopeReceiver>>>,
    entity: &str,
) -> Vec<Rc<dyn EnvelopeReceiver>> {
    let Some(receivers) = clients.get_mut(entity) else {
        return Vec::new();
    };
    receivers.retain(|receiver| receiver.strong_count() > 0);
    receivers.iter().filter_map(Weak::upgrade).collect()
}

async fn accept_loop<P: Providers>(inner: Weak<BusInner<P>>, listener: Listener<P>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner.adopt_incoming(stream, remote);
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                let Some(time) = inner.upgrade().map(|inner| inner.providers.time().clone())
                else {
                    return;
                };
                let _ = time.sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

async fn route_envelopes<P: Providers>(
    inner: Weak<BusInner<P>>,
    address: String,
    mut receiver: PeerReceiver,
) {
    while let Some(envelope) = receiver.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.dispatch(&address, envelope);
    }
    if let Some(inner) = inner.upgrade() {
        inner.forget_peer(&address);
    }
}
