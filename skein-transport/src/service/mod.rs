//! Service roles: hosts answering requests and clients making them.
//!
//! A process composes one [`ServiceHost`] with any number of
//! [`ServiceClient`]s. The host owns the bus; attaching it rebinds every
//! client of the same transport kind.
//!
//! ```text
//! Unbound --attach_bus--> Bound --register--> Registered --serve--> Active
//! ```

use std::fmt;

use serde_json::Value;

use crate::envelope::ErrorBody;

mod client;
mod endpoint_map;
mod host;
mod strategy;

pub use client::ServiceClient;
pub use endpoint_map::{Endpoint, EndpointMap, Handler, HandlerFuture};
pub use host::ServiceHost;
pub use strategy::{Broadcast, PickOne, PublishStrategy};

/// Lifecycle of a service host. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// No bus attached.
    Unbound,
    /// Bus attached, not yet announced.
    Bound,
    /// Announced to the registry.
    Registered,
    /// Serving requests.
    Active,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Unbound => "unbound",
            LifecycleState::Bound => "bound",
            LifecycleState::Registered => "registered",
            LifecycleState::Active => "active",
        };
        f.write_str(name)
    }
}

/// Failure returned by a request handler.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceFault {
    /// Expected failure the caller may branch on; sent with `failed = false`.
    #[error("business error: {0}")]
    Business(Value),

    /// Unexpected failure; sent with `failed = true`.
    #[error("unhandled fault: {0}")]
    Unhandled(String),
}

impl ServiceFault {
    /// Business error carrying `error`.
    pub fn business(error: impl Into<Value>) -> Self {
        ServiceFault::Business(error.into())
    }

    /// Unhandled fault described by `message`.
    pub fn unhandled(message: impl fmt::Display) -> Self {
        ServiceFault::Unhandled(message.to_string())
    }

    pub(crate) fn into_error_body(self) -> ErrorBody {
        match self {
            ServiceFault::Business(error) => ErrorBody::business(error),
            ServiceFault::Unhandled(message) => ErrorBody::unhandled(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fault_maps_to_failed_flag() {
        let body = ServiceFault::business("division_by_zero").into_error_body();
        assert_eq!(body.error, json!("division_by_zero"));
        assert!(!body.failed);

        let body = ServiceFault::unhandled("boom").into_error_body();
        assert_eq!(body.error, json!("boom"));
        assert!(body.failed);
    }

    #[test]
    fn test_lifecycle_display() {
        assert_eq!(LifecycleState::Registered.to_string(), "registered");
    }
}
