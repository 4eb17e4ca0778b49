//! Service registry collaborator.
//!
//! The registry maps entities to the addresses serving them and keeps the
//! subscriber list of every `(entity, endpoint)` publication. Lookups are
//! synchronous: a networked registry keeps a local cache and implements
//! this trait on top of it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use skein_core::{NodeId, ServiceIdentity, TransportKind};

/// Announcement of one running host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Service identity.
    pub identity: ServiceIdentity,
    /// Node id of the process.
    pub node_id: NodeId,
    /// Address the host accepts connections on.
    pub address: String,
    /// Transport the address speaks.
    pub kind: TransportKind,
}

/// Errors returned by a registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The registration was refused.
    #[error("registration rejected: {message}")]
    Rejected {
        /// Registry message.
        message: String,
    },
}

/// Service discovery and subscription bookkeeping.
pub trait Registry {
    /// Announce a host.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the registry refuses the host.
    fn register(&self, registration: Registration) -> Result<(), RegistryError>;

    /// Address of an instance serving `entity`.
    fn resolve(&self, entity: &str) -> Option<String>;

    /// Record that `address` wants the publications of `entity` on `endpoint`.
    fn subscribe(&self, entity: &str, endpoint: &str, address: &str);

    /// Addresses subscribed to `entity` on `endpoint`.
    fn subscribers(&self, entity: &str, endpoint: &str) -> Vec<String>;
}

#[derive(Debug, Default)]
struct RegistryState {
    instances: HashMap<String, Vec<Registration>>,
    static_routes: HashMap<String, String>,
    subscriptions: HashMap<(String, String), Vec<String>>,
}

/// In-memory registry shared by cloning.
///
/// Resolution prefers the earliest registered instance, then routes added
/// with [`StaticRegistry::add_route`].
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    state: Rc<RefCell<RegistryState>>,
}

impl StaticRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `entity` to `address` without a registration.
    pub fn add_route(&self, entity: &str, address: &str) {
        self.state
            .borrow_mut()
            .static_routes
            .insert(entity.to_string(), address.to_string());
    }

    /// Remove every registration of a node.
    pub fn deregister(&self, node_id: &NodeId) {
        let mut state = self.state.borrow_mut();
        for instances in state.instances.values_mut() {
            instances.retain(|registration| &registration.node_id != node_id);
        }
        state.instances.retain(|_, instances| !instances.is_empty());
    }

    /// Registrations currently known for `entity`.
    pub fn instances(&self, entity: &str) -> Vec<Registration> {
        self.state
            .borrow()
            .instances
            .get(entity)
            .cloned()
            .unwrap_or_default()
    }
}

impl Registry for StaticRegistry {
    fn register(&self, registration: Registration) -> Result<(), RegistryError> {
        if registration.address.is_empty() {
            return Err(RegistryError::Rejected {
                message: "empty address".to_string(),
            });
        }
        tracing::info!(
            entity = %registration.identity,
            node_id = %registration.node_id,
            address = %registration.address,
            "service registered"
        );
        let mut state = self.state.borrow_mut();
        let instances = state
            .instances
            .entry(registration.identity.entity())
            .or_default();
        instances.retain(|existing| existing.node_id != registration.node_id);
        instances.push(registration);
        Ok(())
    }

    fn resolve(&self, entity: &str) -> Option<String> {
        let state = self.state.borrow();
        state
            .instances
            .get(entity)
            .and_then(|instances| instances.first())
            .map(|registration| registration.address.clone())
            .or_else(|| state.static_routes.get(entity).cloned())
    }

    fn subscribe(&self, entity: &str, endpoint: &str, address: &str) {
        let mut state = self.state.borrow_mut();
        let subscribers = state
            .subscriptions
            .entry((entity.to_string(), endpoint.to_string()))
            .or_default();
        if !subscribers.iter().any(|existing| existing == address) {
            subscribers.push(address.to_string());
        }
    }

    fn subscribers(&self, entity: &str, endpoint: &str) -> Vec<String> {
        self.state
            .borrow()
            .subscriptions
            .get(&(entity.to_string(), endpoint.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}
