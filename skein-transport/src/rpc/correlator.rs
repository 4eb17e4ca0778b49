//! Request correlator: matches responses to waiting callers.
//!
//! Each pending request is keyed by its `request_id` and resolved exactly
//! once, by whichever comes first:
//!
//! - a response carrying the same `request_id`
//! - its timeout timer
//! - a send-time failure reported through [`Correlator::fail`]
//!
//! Whatever arrives later for the same id finds no entry and is discarded.
//!
//! Timers are local tasks that hold only a `Weak` reference to the
//! correlator state, plus the generation of the entry they were armed for,
//! so a stale timer never resolves a newer request that reused the id.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;

use super::reply_future::{Reply, ReplyFuture, ReplySender};
use super::stats::{CallObserver, CallRecord, CallStatus};
use crate::config::RpcConfig;
use crate::envelope::{Deprecation, Envelope};
use crate::error::RpcError;
use skein_core::{Providers, TaskProvider, TimeProvider};

struct PendingRequest {
    generation: u64,
    sender: ReplySender,
    entity: String,
    endpoint: String,
    host: Option<String>,
    started_at: Duration,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct CorrelatorState {
    pending: HashMap<String, PendingRequest>,
    next_generation: u64,
    observers: Vec<Rc<dyn CallObserver>>,
}

/// Pending-request table of one client.
pub struct Correlator<P: Providers> {
    state: Rc<RefCell<CorrelatorState>>,
    providers: P,
    config: RpcConfig,
}

impl<P: Providers> Correlator<P> {
    /// Create an empty correlator.
    pub fn new(providers: P, config: RpcConfig) -> Self {
        Self {
            state: Rc::new(RefCell::new(CorrelatorState::default())),
            providers,
            config,
        }
    }

    /// Limits this correlator enforces.
    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Add a hook receiving one [`CallRecord`] per resolved request.
    pub fn add_observer(&self, observer: Rc<dyn CallObserver>) {
        self.state.borrow_mut().observers.push(observer);
    }

    /// Resolve the effective timeout of a call.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidTimeout`] unless `0 < timeout <= max_timeout`.
    pub fn validate_timeout(&self, timeout: Option<Duration>) -> Result<Duration, RpcError> {
        let Some(timeout) = timeout else {
            return Ok(self.config.default_timeout);
        };
        if timeout.is_zero() || timeout > self.config.max_timeout {
            return Err(RpcError::InvalidTimeout {
                timeout,
                max: self.config.max_timeout,
            });
        }
        Ok(timeout)
    }

    /// Register a pending request and return the future its outcome is
    /// delivered to.
    ///
    /// # Errors
    ///
    /// - [`RpcError::DuplicateRequestId`] if the id is already pending; the
    ///   existing entry is left untouched
    /// - [`RpcError::Overloaded`] if `max_pending` requests are in flight
    pub fn register(
        &self,
        request_id: &str,
        entity: &str,
        endpoint: &str,
    ) -> Result<ReplyFuture, RpcError> {
        let mut state = self.state.borrow_mut();
        if state.pending.contains_key(request_id) {
            tracing::warn!(request_id, entity, endpoint, "duplicate request id rejected");
            return Err(RpcError::DuplicateRequestId {
                request_id: request_id.to_string(),
            });
        }
        if state.pending.len() >= self.config.max_pending {
            tracing::warn!(
                entity,
                endpoint,
                limit = self.config.max_pending,
                "too many pending requests"
            );
            return Err(RpcError::Overloaded {
                limit: self.config.max_pending,
            });
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        let (sender, future) = ReplyFuture::channel(request_id.to_string());
        state.pending.insert(
            request_id.to_string(),
            PendingRequest {
                generation,
                sender,
                entity: entity.to_string(),
                endpoint: endpoint.to_string(),
                host: None,
                started_at: self.providers.time().now(),
                timer: None,
            },
        );
        Ok(future)
    }

    /// Remember the address a pending request was handed to.
    pub fn note_host(&self, request_id: &str, host: &str) {
        if let Some(entry) = self.state.borrow_mut().pending.get_mut(request_id) {
            entry.host = Some(host.to_string());
        }
    }

    /// Arm the timeout of a pending request.
    ///
    /// When it fires while the request is still pending, the request is
    /// resolved with [`RpcError::Timeout`] and removed. Does nothing if the
    /// request is no longer pending.
    pub fn schedule_timeout(&self, request_id: &str, timeout: Duration) {
        let Some(generation) = self
            .state
            .borrow()
            .pending
            .get(request_id)
            .map(|entry| entry.generation)
        else {
            return;
        };

        let weak_state = Rc::downgrade(&self.state);
        let time = self.providers.time().clone();
        let timer_request_id = request_id.to_string();
        let handle = self.providers.task().spawn_task("request_timeout", async move {
            if time.sleep(timeout).await.is_err() {
                return;
            }
            let Some(state) = weak_state.upgrade() else {
                return;
            };
            let entry = {
                let mut state = state.borrow_mut();
                match state.pending.get(&timer_request_id) {
                    Some(entry) if entry.generation == generation => {
                        state.pending.remove(&timer_request_id)
                    }
                    _ => None,
                }
            };
            if let Some(entry) = entry {
                tracing::debug!(
                    request_id = %timer_request_id,
                    entity = %entry.entity,
                    endpoint = %entry.endpoint,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                let outcome = Err(RpcError::Timeout {
                    request_id: timer_request_id,
                    timeout,
                });
                finish(&state, entry, outcome, time.now());
            }
        });

        match self.state.borrow_mut().pending.get_mut(request_id) {
            Some(entry) => entry.timer = Some(handle),
            None => handle.abort(),
        }
    }

    /// Resolve a pending request with a send-time failure.
    ///
    /// Returns `false` if the request was not pending.
    pub fn fail(&self, request_id: &str, error: RpcError) -> bool {
        let Some(entry) = self.take(request_id) else {
            return false;
        };
        tracing::debug!(
            request_id,
            entity = %entry.entity,
            endpoint = %entry.endpoint,
            error = %error,
            "request failed before a response"
        );
        finish(&self.state, entry, Err(error), self.providers.time().now());
        true
    }

    /// Resolve the pending request a response envelope answers.
    ///
    /// Responses for unknown, expired or already-resolved requests are
    /// logged and dropped.
    pub fn on_response(&self, envelope: &Envelope) {
        let Some(request_id) = envelope.request_id() else {
            tracing::debug!(entity = %envelope.entity, "response without request_id dropped");
            return;
        };
        let Some(entry) = self.take(request_id) else {
            tracing::debug!(
                request_id,
                entity = %envelope.entity,
                "discarding response for unknown or expired request"
            );
            return;
        };

        let payload = &envelope.payload;
        let deprecation = Deprecation::from_payload(payload);
        if let Some(deprecation) = &deprecation {
            tracing::warn!(
                entity = %envelope.entity,
                old_api = %deprecation.old_api,
                replacement_api = deprecation.replacement_api.as_deref().unwrap_or("-"),
                "called a deprecated endpoint"
            );
        }

        let outcome = if let Some(result) = payload.get("result") {
            Ok(Reply {
                result: result.clone(),
                deprecation,
            })
        } else if let Some(error) = payload.get("error") {
            let failed = payload
                .get("failed")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let error = error.clone();
            if failed {
                Err(RpcError::RemoteOpaque { error, deprecation })
            } else {
                Err(RpcError::RemoteStructured { error, deprecation })
            }
        } else {
            tracing::warn!(
                request_id,
                entity = %envelope.entity,
                "response has neither result nor error"
            );
            Err(RpcError::InvalidResponse {
                request_id: request_id.to_string(),
            })
        };

        finish(&self.state, entry, outcome, self.providers.time().now());
    }

    /// Number of requests awaiting an outcome.
    pub fn pending_count(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// Whether a request is awaiting an outcome.
    pub fn is_pending(&self, request_id: &str) -> bool {
        self.state.borrow().pending.contains_key(request_id)
    }

    fn take(&self, request_id: &str) -> Option<PendingRequest> {
        let entry = self.state.borrow_mut().pending.remove(request_id)?;
        if let Some(timer) = &entry.timer {
            timer.abort();
        }
        Some(entry)
    }
}

/// Deliver an outcome to the waiter and report it to the observers.
fn finish(
    state: &RefCell<CorrelatorState>,
    entry: PendingRequest,
    outcome: Result<Reply, RpcError>,
    now: Duration,
) {
    let status = match &outcome {
        Ok(_) => CallStatus::Ok,
        Err(RpcError::RemoteStructured { .. }) => CallStatus::RemoteError,
        Err(RpcError::RemoteOpaque { .. }) => CallStatus::RemoteFault,
        Err(RpcError::Timeout { .. }) => CallStatus::Timeout,
        Err(RpcError::Unreachable { .. }) => CallStatus::Unreachable,
        Err(_) => CallStatus::Failed,
    };
    let record = CallRecord {
        entity: entry.entity,
        endpoint: entry.endpoint,
        host: entry.host,
        status,
        success: status == CallStatus::Ok,
        duration: now.saturating_sub(entry.started_at),
    };

    if entry.sender.send(outcome).is_err() {
        tracing::trace!(endpoint = %record.endpoint, "caller dropped the reply future");
    }

    let observers = state.borrow().observers.clone();
    for observer in observers {
        observer.on_call(&record);
    }
}
