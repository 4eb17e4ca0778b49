//! Service host: answers requests for one entity and publishes events.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use serde_json::{Map, Value};

use skein_core::{NodeId, Providers, ServiceIdentity, TaskProvider, TimeProvider};

use super::client::ServiceClient;
use super::endpoint_map::EndpointMap;
use super::strategy::{Broadcast, PublishStrategy};
use super::LifecycleState;
use crate::bus::{Bus, EnvelopeReceiver, Registration, Registry};
use crate::envelope::{Deprecation, Envelope, ErrorBody, PacketKind, REQUEST_ID_KEY};
use crate::error::{BusError, LifecycleError};
use crate::rpc::RequestContext;

struct HostState<P: Providers> {
    lifecycle: LifecycleState,
    bus: Option<Rc<dyn Bus>>,
    clients: Vec<ServiceClient<P>>,
}

struct HostInner<P: Providers> {
    identity: ServiceIdentity,
    providers: P,
    registry: Rc<dyn Registry>,
    endpoints: EndpointMap,
    this: Weak<HostInner<P>>,
    state: RefCell<HostState<P>>,
}

/// Host of one service entity.
///
/// Requests addressed to the entity are dispatched to the handler registered
/// for their endpoint, each in its own task. Only an `Active` host runs
/// handlers; requests reaching it earlier are answered with an opaque
/// failure.
pub struct ServiceHost<P: Providers> {
    inner: Rc<HostInner<P>>,
}

impl<P: Providers> ServiceHost<P> {
    /// Create an unbound host.
    pub fn new(
        identity: ServiceIdentity,
        endpoints: EndpointMap,
        providers: P,
        registry: Rc<dyn Registry>,
    ) -> Self {
        let inner = Rc::new_cyclic(|this| HostInner {
            identity,
            providers,
            registry,
            endpoints,
            this: this.clone(),
            state: RefCell::new(HostState {
                lifecycle: LifecycleState::Unbound,
                bus: None,
                clients: Vec::new(),
            }),
        });
        Self { inner }
    }

    /// Identity served by this host.
    pub fn identity(&self) -> &ServiceIdentity {
        &self.inner.identity
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.inner.state.borrow().lifecycle
    }

    /// Node id of the attached bus.
    pub fn node_id(&self) -> Option<NodeId> {
        self.inner
            .state
            .borrow()
            .bus
            .as_ref()
            .map(|bus| bus.node_id().clone())
    }

    /// Add a client owned by this host.
    ///
    /// The client is bound right away when a bus of its kind is attached.
    pub fn add_client(&self, client: ServiceClient<P>) {
        let bus = self.inner.state.borrow().bus.clone();
        if let Some(bus) = bus {
            if bus.kind() == client.kind() {
                client.attach_bus(&bus);
            }
        }
        self.inner.state.borrow_mut().clients.push(client);
    }

    /// Attach the bus of this process.
    ///
    /// Clients of the same transport kind are rebound to it; others keep
    /// their bus.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::InvalidState`] once the host is registered.
    pub fn attach_bus(&self, bus: Rc<dyn Bus>) -> Result<(), LifecycleError> {
        let clients = {
            let mut state = self.inner.state.borrow_mut();
            match state.lifecycle {
                LifecycleState::Unbound | LifecycleState::Bound => {}
                lifecycle => {
                    return Err(LifecycleError::InvalidState {
                        operation: "attach a bus",
                        state: lifecycle,
                    });
                }
            }
            state.bus = Some(bus.clone());
            state.lifecycle = LifecycleState::Bound;
            state.clients.clone()
        };

        let receiver: Weak<dyn EnvelopeReceiver> = self.inner.this.clone();
        bus.attach_host(receiver);
        let mut rebound = 0;
        for client in clients.iter().filter(|client| client.kind() == bus.kind()) {
            client.attach_bus(&bus);
            rebound += 1;
        }
        tracing::debug!(
            entity = %self.inner.identity,
            kind = %bus.kind(),
            clients = rebound,
            "host bound"
        );
        Ok(())
    }

    /// Announce the host and the subscriptions of its clients.
    ///
    /// # Errors
    ///
    /// - [`LifecycleError::InvalidState`] unless the host is `Bound`
    /// - [`LifecycleError::NotListening`] if the bus has no local address
    /// - [`LifecycleError::Registration`] if the registry refuses
    pub fn register(&self) -> Result<(), LifecycleError> {
        let (bus, clients) = {
            let state = self.inner.state.borrow();
            match (&state.bus, state.lifecycle) {
                (Some(bus), LifecycleState::Bound) => (bus.clone(), state.clients.clone()),
                (_, lifecycle) => {
                    return Err(LifecycleError::InvalidState {
                        operation: "register",
                        state: lifecycle,
                    });
                }
            }
        };
        let address = bus.local_address().ok_or(LifecycleError::NotListening)?;

        self.inner
            .registry
            .register(Registration {
                identity: self.inner.identity.clone(),
                node_id: bus.node_id().clone(),
                address: address.clone(),
                kind: bus.kind(),
            })
            .map_err(|e| LifecycleError::Registration {
                message: e.to_string(),
            })?;

        for client in &clients {
            let entity = client.target().entity();
            for endpoint in client.subscribed_endpoints() {
                self.inner.registry.subscribe(&entity, &endpoint, &address);
            }
        }

        self.inner.state.borrow_mut().lifecycle = LifecycleState::Registered;
        Ok(())
    }

    /// Start running handlers.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::InvalidState`] unless the host is `Registered`.
    pub fn serve(&self) -> Result<(), LifecycleError> {
        let mut state = self.inner.state.borrow_mut();
        if state.lifecycle != LifecycleState::Registered {
            return Err(LifecycleError::InvalidState {
                operation: "serve",
                state: state.lifecycle,
            });
        }
        state.lifecycle = LifecycleState::Active;
        tracing::info!(
            entity = %self.inner.identity,
            endpoints = ?self.inner.endpoints.names(),
            "service active"
        );
        Ok(())
    }

    /// Send a publication to every subscriber of `endpoint`.
    ///
    /// Fire-and-forget: a subscriber that cannot be reached is logged and
    /// skipped. Returns the number of subscribers the publication was queued
    /// for.
    ///
    /// # Errors
    ///
    /// [`BusError::Closed`] if no bus is attached.
    pub fn publish(&self, endpoint: &str, payload: Map<String, Value>) -> Result<usize, BusError> {
        self.targeted_publish(endpoint, payload, &Broadcast)
    }

    /// Send a publication to the subscribers `strategy` picks.
    ///
    /// # Errors
    ///
    /// [`BusError::Closed`] if no bus is attached.
    pub fn targeted_publish(
        &self,
        endpoint: &str,
        payload: Map<String, Value>,
        strategy: &dyn PublishStrategy,
    ) -> Result<usize, BusError> {
        let bus = self
            .inner
            .state
            .borrow()
            .bus
            .clone()
            .ok_or(BusError::Closed)?;
        let entity = self.inner.identity.entity();
        let subscribers = self.inner.registry.subscribers(&entity, endpoint);
        let targets = strategy.select(&subscribers);

        let mut delivered = 0;
        for address in &targets {
            let envelope = Envelope::publish(
                self.inner.providers.random(),
                &self.inner.identity,
                endpoint,
                payload.clone(),
            )
            .with_origin(bus.node_id().clone());
            match bus.send_to(address, envelope) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(
                    entity = %entity,
                    endpoint,
                    address = %address,
                    error = %e,
                    "publication not sent"
                ),
            }
        }
        tracing::debug!(
            entity = %entity,
            endpoint,
            subscribers = subscribers.len(),
            delivered,
            "published"
        );
        Ok(delivered)
    }

    /// Build the response to `request`.
    pub fn build_response(
        &self,
        request: &Envelope,
        outcome: Result<Value, ErrorBody>,
        deprecation: Option<&Deprecation>,
    ) -> Envelope {
        self.inner.build_response(request, outcome, deprecation)
    }
}

impl<P: Providers> HostInner<P> {
    fn build_response(
        &self,
        request: &Envelope,
        outcome: Result<Value, ErrorBody>,
        deprecation: Option<&Deprecation>,
    ) -> Envelope {
        Envelope::response(
            self.providers.random(),
            request.request_id().unwrap_or_default(),
            request.origin_node.clone(),
            &request.entity,
            outcome,
            deprecation,
        )
    }

    async fn handle_request(self: Rc<Self>, request: Envelope) {
        let started = self.providers.time().now();
        let endpoint = request.endpoint_or_dash().to_string();
        let active = self.state.borrow().lifecycle == LifecycleState::Active;

        let (outcome, deprecation) = match self.endpoints.get(&endpoint) {
            _ if !active => (Err(ErrorBody::unhandled("service is not active")), None),
            None => (
                Err(ErrorBody::unhandled(format!("unknown endpoint: {endpoint}"))),
                None,
            ),
            Some(entry) => {
                if let Some(deprecation) = &entry.deprecation {
                    tracing::warn!(
                        entity = %self.identity,
                        endpoint = %endpoint,
                        replacement = ?deprecation.replacement_api,
                        "deprecated endpoint called"
                    );
                }
                let handler = entry.handler.clone();
                let deprecation = entry.deprecation.clone();
                let mut args = request.payload.clone();
                args.remove(REQUEST_ID_KEY);
                let context = RequestContext::for_inbound(&request);
                let result = handler(context, args).await;
                (result.map_err(|fault| fault.into_error_body()), deprecation)
            }
        };

        let failed = outcome.is_err();
        let response = self.build_response(&request, outcome, deprecation.as_ref());
        let Some(bus) = self.state.borrow().bus.clone() else {
            tracing::warn!(entity = %self.identity, "no bus to answer on");
            return;
        };
        match bus.send(response) {
            Ok(address) => tracing::debug!(
                entity = %self.identity,
                endpoint = %endpoint,
                address = %address,
                failed,
                elapsed = ?self.providers.time().now().saturating_sub(started),
                "request handled"
            ),
            Err(e) => tracing::warn!(
                entity = %self.identity,
                endpoint = %endpoint,
                error = %e,
                "response not delivered"
            ),
        }
    }
}

impl<P: Providers> EnvelopeReceiver for HostInner<P> {
    fn receive(&self, envelope: Envelope) {
        if envelope.kind != PacketKind::Request {
            tracing::debug!(kind = %envelope.kind, "host ignored envelope");
            return;
        }
        if !self.identity.is_for_me(&envelope.entity) {
            tracing::warn!(
                entity = %envelope.entity,
                served = %self.identity,
                "request for another entity dropped"
            );
            return;
        }
        if envelope.request_id().is_none() {
            tracing::warn!(
                entity = %envelope.entity,
                endpoint = envelope.endpoint_or_dash(),
                "request without request_id dropped"
            );
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.providers
            .task()
            .spawn_task("handle_request", this.handle_request(envelope));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::StaticRegistry;
    use crate::config::RpcConfig;
    use crate::service::ServiceFault;
    use serde_json::json;
    use skein_core::{TokioProviders, TokioRandomProvider, TransportKind};
    use tokio::sync::mpsc;

    struct LoopbackBus {
        kind: TransportKind,
        node_id: NodeId,
        address: Option<String>,
        sent: mpsc::UnboundedSender<(Option<String>, Envelope)>,
        host: RefCell<Option<Weak<dyn EnvelopeReceiver>>>,
    }

    impl LoopbackBus {
        fn new(
            kind: TransportKind,
            address: Option<&str>,
        ) -> (Rc<Self>, mpsc::UnboundedReceiver<(Option<String>, Envelope)>) {
            let (sent, rx) = mpsc::unbounded_channel();
            let bus = Rc::new(Self {
                kind,
                node_id: NodeId::new("host-node"),
                address: address.map(str::to_string),
                sent,
                host: RefCell::new(None),
            });
            (bus, rx)
        }

        fn deliver(&self, envelope: Envelope) {
            let host = self.host.borrow().as_ref().and_then(Weak::upgrade);
            if let Some(host) = host {
                host.receive(envelope);
            }
        }
    }

    impl Bus for LoopbackBus {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn node_id(&self) -> &NodeId {
            &self.node_id
        }

        fn local_address(&self) -> Option<String> {
            self.address.clone()
        }

        fn send(&self, envelope: Envelope) -> Result<String, BusError> {
            let _ = self.sent.send((None, envelope));
            Ok("caller".to_string())
        }

        fn send_to(&self, address: &str, envelope: Envelope) -> Result<(), BusError> {
            let _ = self.sent.send((Some(address.to_string()), envelope));
            Ok(())
        }

        fn attach_host(&self, receiver: Weak<dyn EnvelopeReceiver>) {
            *self.host.borrow_mut() = Some(receiver);
        }

        fn attach_client(&self, _entity: &str, _receiver: Weak<dyn EnvelopeReceiver>) {}
    }

    fn calc_endpoints() -> EndpointMap {
        let mut endpoints = EndpointMap::new();
        endpoints
            .insert("add", |_context, args| async move {
                let a = args.get("a").and_then(Value::as_i64).unwrap_or_default();
                let b = args.get("b").and_then(Value::as_i64).unwrap_or_default();
                Ok(json!(a + b))
            })
            .insert("div", |_context, args| async move {
                let b = args.get("b").and_then(Value::as_i64).unwrap_or_default();
                if b == 0 {
                    return Err(ServiceFault::business("division_by_zero"));
                }
                let a = args.get("a").and_then(Value::as_i64).unwrap_or_default();
                Ok(json!(a / b))
            })
            .insert("context", |context, args| async move {
                assert!(!args.contains_key(REQUEST_ID_KEY));
                Ok(json!(context.correlation_id))
            })
            .insert_deprecated("divide", Some("div"), |_context, _args| async move {
                Ok(json!(1))
            });
        endpoints
    }

    fn host(registry: &StaticRegistry) -> ServiceHost<TokioProviders> {
        ServiceHost::new(
            ServiceIdentity::new("calc", "1.0"),
            calc_endpoints(),
            TokioProviders::new(),
            Rc::new(registry.clone()),
        )
    }

    fn active_host(
        registry: &StaticRegistry,
    ) -> (
        ServiceHost<TokioProviders>,
        Rc<LoopbackBus>,
        mpsc::UnboundedReceiver<(Option<String>, Envelope)>,
    ) {
        let host = host(registry);
        let (bus, rx) = LoopbackBus::new(TransportKind::Tcp, Some("10.0.0.9:4000"));
        host.attach_bus(bus.clone()).expect("attach");
        host.register().expect("register");
        host.serve().expect("serve");
        (host, bus, rx)
    }

    fn request(endpoint: &str, a: i64, b: i64, request_id: &str) -> Envelope {
        let mut args = Map::new();
        args.insert("a".into(), json!(a));
        args.insert("b".into(), json!(b));
        Envelope::request(
            &TokioRandomProvider::new(),
            &ServiceIdentity::new("calc", "1.0"),
            endpoint,
            args,
            request_id,
        )
        .with_origin(NodeId::new("caller-node"))
    }

    #[test]
    fn test_lifecycle_order() {
        let registry = StaticRegistry::new();
        let host = host(&registry);
        assert_eq!(host.state(), LifecycleState::Unbound);
        assert_eq!(
            host.register(),
            Err(LifecycleError::InvalidState {
                operation: "register",
                state: LifecycleState::Unbound
            })
        );
        assert!(host.serve().is_err());

        let (unlistened, _rx) = LoopbackBus::new(TransportKind::Tcp, None);
        host.attach_bus(unlistened).expect("attach");
        assert_eq!(host.register(), Err(LifecycleError::NotListening));

        let (bus, _rx) = LoopbackBus::new(TransportKind::Tcp, Some("10.0.0.9:4000"));
        host.attach_bus(bus.clone()).expect("rebind while bound");
        host.register().expect("register");
        assert_eq!(host.state(), LifecycleState::Registered);
        assert_eq!(registry.resolve("calc@1.0").as_deref(), Some("10.0.0.9:4000"));
        assert_eq!(host.node_id(), Some(NodeId::new("host-node")));

        assert!(matches!(
            host.attach_bus(bus),
            Err(LifecycleError::InvalidState { .. })
        ));
        host.serve().expect("serve");
        assert_eq!(host.state(), LifecycleState::Active);
        assert!(host.serve().is_err());
    }

    #[test]
    fn test_attach_rebinds_clients_of_same_kind() {
        let registry = StaticRegistry::new();
        let host = host(&registry);
        let providers = TokioProviders::new();
        let tcp_client = ServiceClient::new(
            ServiceIdentity::new("billing", "2"),
            TransportKind::Tcp,
            providers.clone(),
            RpcConfig::default(),
        );
        let http_client = ServiceClient::new(
            ServiceIdentity::new("search", "1"),
            TransportKind::Http,
            providers,
            RpcConfig::default(),
        );
        tcp_client.subscribe("invoiced", |_payload| {});
        host.add_client(tcp_client.clone());
        host.add_client(http_client.clone());

        let (bus, _rx) = LoopbackBus::new(TransportKind::Tcp, Some("10.0.0.9:4000"));
        host.attach_bus(bus).expect("attach");
        assert!(tcp_client.is_bound());
        assert!(!http_client.is_bound());

        host.register().expect("register");
        assert_eq!(
            registry.subscribers("billing@2", "invoiced"),
            vec!["10.0.0.9:4000".to_string()]
        );
    }

    #[tokio::test]
    async fn test_request_dispatch() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let registry = StaticRegistry::new();
                let (_host, bus, mut rx) = active_host(&registry);

                bus.deliver(request("add", 2, 3, "r1"));
                let (_, response) = rx.recv().await.expect("response");
                assert_eq!(response.kind, PacketKind::Response);
                assert_eq!(response.destination_node, Some(NodeId::new("caller-node")));
                assert_eq!(response.request_id(), Some("r1"));
                assert_eq!(response.payload["result"], json!(5));

                bus.deliver(request("div", 1, 0, "r2"));
                let (_, response) = rx.recv().await.expect("response");
                assert_eq!(response.payload["error"], json!("division_by_zero"));
                assert_eq!(response.payload["failed"], json!(false));

                bus.deliver(request("nope", 1, 1, "r3"));
                let (_, response) = rx.recv().await.expect("response");
                assert_eq!(response.payload["failed"], json!(true));

                bus.deliver(request("context", 0, 0, "r4"));
                let (_, response) = rx.recv().await.expect("response");
                assert_eq!(response.payload["result"], json!("r4"));
            })
            .await;
    }

    #[tokio::test]
    async fn test_deprecated_endpoint_response() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let registry = StaticRegistry::new();
                let (_host, bus, mut rx) = active_host(&registry);
                bus.deliver(request("divide", 4, 2, "r1"));
                let (_, response) = rx.recv().await.expect("response");
                assert_eq!(response.payload["result"], json!(1));
                assert_eq!(
                    Deprecation::from_payload(&response.payload),
                    Some(Deprecation::new("divide").with_replacement("div"))
                );
            })
            .await;
    }

    #[tokio::test]
    async fn test_inactive_host_answers_with_fault() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let registry = StaticRegistry::new();
                let host = host(&registry);
                let (bus, mut rx) = LoopbackBus::new(TransportKind::Tcp, Some("10.0.0.9:4000"));
                host.attach_bus(bus.clone()).expect("attach");

                bus.deliver(request("add", 2, 3, "r1"));
                let (_, response) = rx.recv().await.expect("response");
                assert_eq!(response.payload["failed"], json!(true));
                assert!(response.payload.get("result").is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn test_request_for_other_entity_is_dropped() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let registry = StaticRegistry::new();
                let (_host, bus, mut rx) = active_host(&registry);
                let mut other = request("add", 1, 1, "r1");
                other.entity = "calc@2.0".into();
                bus.deliver(other);
                bus.deliver(request("add", 1, 1, "r2"));
                let (_, response) = rx.recv().await.expect("response");
                assert_eq!(response.request_id(), Some("r2"));
            })
            .await;
    }

    #[tokio::test]
    async fn test_publish_to_subscribers() {
        let registry = StaticRegistry::new();
        let (host, _bus, mut rx) = active_host(&registry);
        registry.subscribe("calc@1.0", "computed", "10.0.0.1:1");
        registry.subscribe("calc@1.0", "computed", "10.0.0.2:2");

        let mut payload = Map::new();
        payload.insert("value".into(), json!(5));
        assert_eq!(host.publish("computed", payload.clone()).expect("publish"), 2);
        let (first, publication) = rx.recv().await.expect("publication");
        assert_eq!(first.as_deref(), Some("10.0.0.1:1"));
        assert_eq!(publication.kind, PacketKind::Publish);
        assert_eq!(publication.entity, "calc@1.0");
        let (second, other) = rx.recv().await.expect("publication");
        assert_eq!(second.as_deref(), Some("10.0.0.2:2"));
        assert_eq!(other.payload, publication.payload);
        assert_ne!(other.packet_id, publication.packet_id);

        let strategy = crate::service::PickOne::new(TokioRandomProvider::new());
        assert_eq!(
            host.targeted_publish("computed", payload.clone(), &strategy)
                .expect("publish"),
            1
        );
        assert_eq!(host.publish("unknown", payload).expect("publish"), 0);
    }
}
