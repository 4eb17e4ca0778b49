//! Per-call request context.
//!
//! Values that would otherwise live in task-local storage are carried
//! explicitly: a handler receives the context of the request it serves and
//! passes it on to the calls it makes.

use std::time::Duration;

use crate::envelope::Envelope;

/// Explicit request context threaded through calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Id of the originating external request, propagated to nested calls.
    pub correlation_id: Option<String>,
    /// Per-call timeout overriding the client default.
    pub timeout: Option<Duration>,
    /// Caller-chosen request id. Generated when absent.
    pub request_id: Option<String>,
}

impl RequestContext {
    /// Empty context: default timeout, generated request id.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Override the timeout for this call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Choose the request id for this call.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Context handed to the handler of an inbound request.
    ///
    /// The correlation id is inherited from the envelope, falling back to
    /// the request id so that nested calls stay traceable to this request.
    pub fn for_inbound(envelope: &Envelope) -> Self {
        let correlation_id = envelope
            .correlation_id
            .clone()
            .or_else(|| envelope.request_id().map(str::to_string));
        Self {
            correlation_id,
            timeout: None,
            request_id: None,
        }
    }

    /// Context for a nested call: keeps only the correlation id.
    pub fn child(&self) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            timeout: None,
            request_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use skein_core::{ServiceIdentity, TokioRandomProvider};

    #[test]
    fn test_inbound_falls_back_to_request_id() {
        let envelope = Envelope::request(
            &TokioRandomProvider::new(),
            &ServiceIdentity::new("calc", "1.0"),
            "add",
            Map::new(),
            "r1",
        );
        assert_eq!(
            RequestContext::for_inbound(&envelope).correlation_id.as_deref(),
            Some("r1")
        );

        let envelope = envelope.with_correlation_id(Some("outer".into()));
        assert_eq!(
            RequestContext::for_inbound(&envelope).correlation_id.as_deref(),
            Some("outer")
        );
    }

    #[test]
    fn test_child_keeps_only_correlation() {
        let ctx = RequestContext::new()
            .with_correlation_id("c")
            .with_timeout(Duration::from_secs(1))
            .with_request_id("r");
        assert_eq!(ctx.child(), RequestContext::new().with_correlation_id("c"));
    }
}
