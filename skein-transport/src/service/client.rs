//! Service client: calls one remote entity and receives its publications.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use serde_json::{Map, Value};

use skein_core::{Providers, RandomProvider, ServiceIdentity, TransportKind};

use crate::bus::{Bus, EnvelopeReceiver};
use crate::config::RpcConfig;
use crate::envelope::{Envelope, PacketKind};
use crate::error::RpcError;
use crate::rpc::{CallObserver, Correlator, Reply, ReplyFuture, RequestContext};

type SubscriptionHandler = Rc<dyn Fn(Map<String, Value>)>;

struct ClientInner<P: Providers> {
    target: ServiceIdentity,
    kind: TransportKind,
    providers: P,
    correlator: Correlator<P>,
    bus: RefCell<Option<Rc<dyn Bus>>>,
    subscriptions: RefCell<HashMap<String, SubscriptionHandler>>,
}

/// Client of one remote entity.
///
/// Cheap to clone; clones share the pending-request table and
/// subscriptions.
pub struct ServiceClient<P: Providers> {
    inner: Rc<ClientInner<P>>,
}

impl<P: Providers> Clone for ServiceClient<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: Providers> ServiceClient<P> {
    /// Client for `target` over buses of `kind`.
    pub fn new(target: ServiceIdentity, kind: TransportKind, providers: P, config: RpcConfig) -> Self {
        let correlator = Correlator::new(providers.clone(), config);
        Self {
            inner: Rc::new(ClientInner {
                target,
                kind,
                providers,
                correlator,
                bus: RefCell::new(None),
                subscriptions: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// The entity this client calls.
    pub fn target(&self) -> &ServiceIdentity {
        &self.inner.target
    }

    /// Transport kind of the buses this client binds to.
    pub fn kind(&self) -> TransportKind {
        self.inner.kind
    }

    /// Bind to `bus`, replacing any previous bus.
    pub fn attach_bus(&self, bus: &Rc<dyn Bus>) {
        let weak = Rc::downgrade(&self.inner);
        let receiver: Weak<dyn EnvelopeReceiver> = weak;
        bus.attach_client(&self.inner.target.entity(), receiver);
        *self.inner.bus.borrow_mut() = Some(bus.clone());
        tracing::debug!(
            entity = %self.inner.target,
            kind = %bus.kind(),
            "client attached to bus"
        );
    }

    /// True once a bus is attached.
    pub fn is_bound(&self) -> bool {
        self.inner.bus.borrow().is_some()
    }

    /// Handle publications of the target on `endpoint`.
    ///
    /// The subscription still has to be announced to the registry, which the
    /// host does on `register`.
    pub fn subscribe<F>(&self, endpoint: &str, handler: F)
    where
        F: Fn(Map<String, Value>) + 'static,
    {
        self.inner
            .subscriptions
            .borrow_mut()
            .insert(endpoint.to_string(), Rc::new(handler));
    }

    /// Endpoints with a publication handler, sorted.
    pub fn subscribed_endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> =
            self.inner.subscriptions.borrow().keys().cloned().collect();
        endpoints.sort_unstable();
        endpoints
    }

    /// Send a request and return the future its outcome resolves.
    ///
    /// Never waits for I/O. Failures known at send time (invalid timeout,
    /// duplicate id, no route, full queue) resolve the returned future
    /// immediately and leave nothing pending.
    pub fn send(
        &self,
        endpoint: &str,
        args: Map<String, Value>,
        context: &RequestContext,
    ) -> ReplyFuture {
        let inner = &self.inner;
        let entity = inner.target.entity();
        let request_id = context
            .request_id
            .clone()
            .unwrap_or_else(|| inner.providers.random().unique_hex());

        let timeout = match inner.correlator.validate_timeout(context.timeout) {
            Ok(timeout) => timeout,
            Err(e) => return ReplyFuture::ready(request_id, Err(e)),
        };
        let Some(bus) = inner.bus.borrow().clone() else {
            tracing::debug!(entity = %entity, endpoint, "no bus attached");
            return ReplyFuture::ready(request_id, Err(RpcError::Unreachable { entity }));
        };
        let reply = match inner.correlator.register(&request_id, &entity, endpoint) {
            Ok(reply) => reply,
            Err(e) => return ReplyFuture::ready(request_id, Err(e)),
        };

        let envelope = Envelope::request(
            inner.providers.random(),
            &inner.target,
            endpoint,
            args,
            &request_id,
        )
        .with_correlation_id(context.correlation_id.clone());

        match bus.send(envelope) {
            Ok(address) => {
                inner.correlator.note_host(&request_id, &address);
                inner.correlator.schedule_timeout(&request_id, timeout);
                tracing::debug!(
                    entity = %entity,
                    endpoint,
                    request_id = %request_id,
                    address = %address,
                    "request sent"
                );
            }
            Err(e) => {
                tracing::debug!(
                    entity = %entity,
                    endpoint,
                    request_id = %request_id,
                    error = %e,
                    "request not sent"
                );
                inner.correlator.fail(&request_id, e.into());
            }
        }
        reply
    }

    /// Send a request and wait for its result value.
    ///
    /// # Errors
    ///
    /// Any [`RpcError`] the call resolves with.
    pub async fn call(
        &self,
        endpoint: &str,
        args: Map<String, Value>,
        context: &RequestContext,
    ) -> Result<Value, RpcError> {
        self.send(endpoint, args, context)
            .await
            .map(|reply: Reply| reply.result)
    }

    /// Pending-request table of this client.
    pub fn correlator(&self) -> &Correlator<P> {
        &self.inner.correlator
    }

    /// Add a per-call outcome hook.
    pub fn add_observer(&self, observer: Rc<dyn CallObserver>) {
        self.inner.correlator.add_observer(observer);
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.inner.correlator.pending_count()
    }
}

impl<P: Providers> EnvelopeReceiver for ClientInner<P> {
    fn receive(&self, envelope: Envelope) {
        match envelope.kind {
            PacketKind::Response => self.correlator.on_response(&envelope),
            PacketKind::Publish => {
                let endpoint = envelope.endpoint_or_dash();
                let handler = self.subscriptions.borrow().get(endpoint).cloned();
                match handler {
                    Some(handler) => handler(envelope.payload),
                    None => tracing::warn!(
                        entity = %envelope.entity,
                        endpoint,
                        "publication without subscription dropped"
                    ),
                }
            }
            PacketKind::Request | PacketKind::Ping => {
                tracing::debug!(kind = %envelope.kind, "client ignored envelope");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BusError;
    use serde_json::json;
    use skein_core::{NodeId, TokioProviders, TokioRandomProvider};
    use std::cell::Cell;
    use std::time::Duration;

    /// Bus recording sent envelopes; routes only `calc@1.0`.
    struct RecordingBus {
        node_id: NodeId,
        sent: RefCell<Vec<Envelope>>,
        clients: RefCell<Vec<Weak<dyn EnvelopeReceiver>>>,
    }

    impl RecordingBus {
        fn new() -> Rc<Self> {
            Rc::new(Self {
                node_id: NodeId::new("client-node"),
                sent: RefCell::new(Vec::new()),
                clients: RefCell::new(Vec::new()),
            })
        }

        fn deliver(&self, envelope: Envelope) {
            let clients: Vec<_> = self
                .clients
                .borrow()
                .iter()
                .filter_map(Weak::upgrade)
                .collect();
            for client in clients {
                client.receive(envelope.clone());
            }
        }
    }

    impl Bus for RecordingBus {
        fn kind(&self) -> TransportKind {
            TransportKind::Tcp
        }

        fn node_id(&self) -> &NodeId {
            &self.node_id
        }

        fn local_address(&self) -> Option<String> {
            None
        }

        fn send(&self, envelope: Envelope) -> Result<String, BusError> {
            if envelope.entity != "calc@1.0" {
                return Err(BusError::NoRoute {
                    entity: envelope.entity,
                });
            }
            self.sent.borrow_mut().push(envelope);
            Ok("10.0.0.1:4000".to_string())
        }

        fn send_to(&self, _address: &str, envelope: Envelope) -> Result<(), BusError> {
            self.sent.borrow_mut().push(envelope);
            Ok(())
        }

        fn attach_host(&self, _receiver: Weak<dyn EnvelopeReceiver>) {}

        fn attach_client(&self, _entity: &str, receiver: Weak<dyn EnvelopeReceiver>) {
            self.clients.borrow_mut().push(receiver);
        }
    }

    fn client(name: &str) -> (ServiceClient<TokioProviders>, Rc<RecordingBus>) {
        let client = ServiceClient::new(
            ServiceIdentity::new(name, "1.0"),
            TransportKind::Tcp,
            TokioProviders::new(),
            RpcConfig::default(),
        );
        let bus = RecordingBus::new();
        let dyn_bus: Rc<dyn Bus> = bus.clone();
        client.attach_bus(&dyn_bus);
        (client, bus)
    }

    fn args() -> Map<String, Value> {
        let mut args = Map::new();
        args.insert("a".into(), json!(2));
        args.insert("b".into(), json!(3));
        args
    }

    #[tokio::test]
    async fn test_send_then_response() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (client, bus) = client("calc");
                let context = RequestContext::new().with_correlation_id("ext-1");
                let reply = client.send("add", args(), &context);
                assert_eq!(client.pending_count(), 1);

                let request = bus.sent.borrow()[0].clone();
                assert_eq!(request.endpoint.as_deref(), Some("add"));
                assert_eq!(request.correlation_id.as_deref(), Some("ext-1"));
                assert_eq!(request.request_id(), Some(reply.request_id()));
                assert_eq!(request.payload["a"], json!(2));

                bus.deliver(Envelope::response(
                    &TokioRandomProvider::new(),
                    reply.request_id(),
                    Some(NodeId::new("client-node")),
                    "calc@1.0",
                    Ok(json!(5)),
                    None,
                ));
                let reply = reply.await.expect("reply");
                assert_eq!(reply.result, json!(5));
                assert_eq!(client.pending_count(), 0);
            })
            .await;
    }

    #[test]
    fn test_attach_registers_weak_receiver() {
        let (client, bus) = client("calc");
        assert!(client.is_bound());
        assert_eq!(bus.clients.borrow().len(), 1);
        assert!(bus.clients.borrow()[0].upgrade().is_some());

        drop(client);
        assert!(bus.clients.borrow()[0].upgrade().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_leaves_nothing_pending() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (client, _bus) = client("ghost");
                let err = client
                    .call("add", args(), &RequestContext::new())
                    .await
                    .expect_err("unreachable");
                assert_eq!(
                    err,
                    RpcError::Unreachable {
                        entity: "ghost@1.0".into()
                    }
                );
                assert_eq!(client.pending_count(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_unbound_client_is_unreachable() {
        let client: ServiceClient<TokioProviders> = ServiceClient::new(
            ServiceIdentity::new("calc", "1.0"),
            TransportKind::Tcp,
            TokioProviders::new(),
            RpcConfig::default(),
        );
        assert!(!client.is_bound());
        let err = client
            .call("add", args(), &RequestContext::new())
            .await
            .expect_err("no bus");
        assert!(matches!(err, RpcError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_invalid_timeout_and_duplicate_id() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (client, bus) = client("calc");
                let err = client
                    .call(
                        "add",
                        args(),
                        &RequestContext::new().with_timeout(Duration::ZERO),
                    )
                    .await
                    .expect_err("invalid timeout");
                assert!(matches!(err, RpcError::InvalidTimeout { .. }));
                assert!(bus.sent.borrow().is_empty());

                let context = RequestContext::new().with_request_id("fixed");
                let _first = client.send("add", args(), &context);
                let err = client
                    .send("add", args(), &context)
                    .await
                    .expect_err("duplicate");
                assert_eq!(
                    err,
                    RpcError::DuplicateRequestId {
                        request_id: "fixed".into()
                    }
                );
                assert_eq!(client.pending_count(), 1);
                assert_eq!(bus.sent.borrow().len(), 1);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_response() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (client, _bus) = client("calc");
                let context = RequestContext::new().with_timeout(Duration::from_secs(2));
                let err = client
                    .call("add", args(), &context)
                    .await
                    .expect_err("timeout");
                assert!(matches!(
                    err,
                    RpcError::Timeout { timeout, .. } if timeout == Duration::from_secs(2)
                ));
                assert_eq!(client.pending_count(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_publication_dispatch() {
        let (client, bus) = client("orders");
        let seen = Rc::new(Cell::new(0));
        let seen_by_handler = seen.clone();
        client.subscribe("created", move |payload| {
            assert_eq!(payload["id"], json!(7));
            seen_by_handler.set(seen_by_handler.get() + 1);
        });
        assert_eq!(client.subscribed_endpoints(), vec!["created".to_string()]);

        let random = TokioRandomProvider::new();
        let publisher = ServiceIdentity::new("orders", "1.0");
        let mut payload = Map::new();
        payload.insert("id".into(), json!(7));
        bus.deliver(Envelope::publish(&random, &publisher, "created", payload.clone()));
        bus.deliver(Envelope::publish(&random, &publisher, "deleted", payload));
        assert_eq!(seen.get(), 1);
    }
}
