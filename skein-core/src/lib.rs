//! # skein-core
//!
//! Core abstractions shared by the skein transport.
//!
//! - **Provider traits**: time, task spawning, randomness and networking, so
//!   the transport runs the same way on a real Tokio runtime and under test
//!   doubles.
//! - **Identity types**: [`ServiceIdentity`] (`name@version` entities) and
//!   [`NodeId`] (one per bus).
//!
//! ## Provider Traits
//!
//! - [`TimeProvider`]: sleep, timeout and monotonic time
//! - [`TaskProvider`]: local (non-`Send`) task spawning
//! - [`RandomProvider`]: random values and opaque hex tokens
//! - [`NetworkProvider`]: TCP connect and listen
//!
//! All providers are bundled by [`Providers`] to keep type parameters short.
//!
//! ## Scheduling Model
//!
//! Everything here assumes a single-threaded cooperative scheduler
//! (`tokio::task::LocalSet`). No provider requires `Send`.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod network;
mod providers;
mod random;
mod task;
mod time;
mod types;

// Provider trait exports
pub use network::{NetworkProvider, TcpListenerTrait, TokioNetworkProvider, TokioTcpListener};
pub use providers::{Providers, TokioProviders};
pub use random::{RandomProvider, TokioRandomProvider};
pub use task::{TaskProvider, TokioTaskProvider};
pub use time::{TimeError, TimeProvider, TokioTimeProvider};

// Identity exports
pub use types::{IdentityParseError, NodeId, ServiceIdentity, TransportKind};
