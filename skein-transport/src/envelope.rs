//! Envelope model: the unit of wire communication.
//!
//! Every message on a connection is one [`Envelope`], serialized as a JSON
//! object with these keys:
//!
//! ```text
//! {
//!   "pid":      "<32 hex chars>",      fresh per envelope
//!   "to":       "<node id>",           absent for broadcasts
//!   "from":     "<node id>",           sender, used to address replies
//!   "entity":   "name@version",
//!   "type":     "request" | "response" | "publish" | "ping",
//!   "endpoint": "<method>",            absent on responses and pings
//!   "payload":  { ... }
//! }
//! ```
//!
//! Constructors only assemble fields. Nothing is validated here; malformed
//! external envelopes are dealt with by the frame decoder and correlator.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use skein_core::{NodeId, RandomProvider, ServiceIdentity};

/// Payload key carrying the correlation key of a request/response pair.
pub const REQUEST_ID_KEY: &str = "request_id";

/// Envelope kind, serialized as the `type` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketKind {
    /// RPC call expecting exactly one response.
    Request,
    /// Reply to a request, matched by `request_id`.
    Response,
    /// Fire-and-forget publication to subscribers.
    Publish,
    /// Keep-alive, dropped on receipt.
    Ping,
}

impl PacketKind {
    /// Whether the kind takes part in request/response correlation.
    ///
    /// Size and parse-time diagnostics only apply to these kinds.
    pub fn is_rpc(self) -> bool {
        matches!(self, PacketKind::Request | PacketKind::Response)
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PacketKind::Request => "request",
            PacketKind::Response => "response",
            PacketKind::Publish => "publish",
            PacketKind::Ping => "ping",
        };
        f.write_str(s)
    }
}

/// Soft API deprecation notice attached to a response.
///
/// Forwarded to the caller untouched; it never changes whether the call
/// succeeded or how its failure is classified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deprecation {
    /// The endpoint that was called and is deprecated.
    pub old_api: String,
    /// The endpoint callers should move to, if any.
    pub replacement_api: Option<String>,
}

impl Deprecation {
    /// Deprecation with no named replacement.
    pub fn new(old_api: impl Into<String>) -> Self {
        Self {
            old_api: old_api.into(),
            replacement_api: None,
        }
    }

    /// Name the replacement endpoint.
    pub fn with_replacement(mut self, replacement: impl Into<String>) -> Self {
        self.replacement_api = Some(replacement.into());
        self
    }

    /// Read `old_api` / `replacement_api` from a response payload.
    pub fn from_payload(payload: &Map<String, Value>) -> Option<Self> {
        let old_api = payload.get("old_api")?.as_str()?.to_string();
        let replacement_api = payload
            .get("replacement_api")
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(Self {
            old_api,
            replacement_api,
        })
    }

    fn merge_into(&self, payload: &mut Map<String, Value>) {
        payload.insert("old_api".into(), Value::String(self.old_api.clone()));
        if let Some(replacement) = &self.replacement_api {
            payload.insert(
                "replacement_api".into(),
                Value::String(replacement.clone()),
            );
        }
    }
}

/// Error body of a failed response.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorBody {
    /// The error value, usually a message string.
    pub error: Value,
    /// `true` for an unhandled remote fault, `false` for a business error
    /// the caller may branch on.
    pub failed: bool,
}

impl ErrorBody {
    /// Structured business error (`failed = false`).
    pub fn business(error: impl Into<Value>) -> Self {
        Self {
            error: error.into(),
            failed: false,
        }
    }

    /// Opaque unhandled fault (`failed = true`).
    pub fn unhandled(error: impl Into<Value>) -> Self {
        Self {
            error: error.into(),
            failed: true,
        }
    }
}

/// A single framed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Opaque per-envelope token. Uniqueness is per process and unverified.
    #[serde(rename = "pid")]
    pub packet_id: String,

    /// Node that must accept the envelope; `None` for broadcasts.
    #[serde(rename = "to", default, skip_serializing_if = "Option::is_none")]
    pub destination_node: Option<NodeId>,

    /// Node that sent the envelope.
    #[serde(rename = "from", default, skip_serializing_if = "Option::is_none")]
    pub origin_node: Option<NodeId>,

    /// `name@version` of the logical service.
    pub entity: String,

    /// Envelope kind.
    #[serde(rename = "type")]
    pub kind: PacketKind,

    /// Method name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Correlation id of the originating external request, threaded
    /// explicitly through nested calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Kind-specific payload.
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Build a request envelope addressed to `target`.
    ///
    /// `request_id` is written into the payload next to the call arguments,
    /// replacing any `request_id` already present in `args`.
    pub fn request<R: RandomProvider>(
        random: &R,
        target: &ServiceIdentity,
        endpoint: &str,
        mut args: Map<String, Value>,
        request_id: &str,
    ) -> Self {
        args.insert(REQUEST_ID_KEY.into(), Value::String(request_id.to_string()));
        Self {
            packet_id: random.unique_hex(),
            destination_node: None,
            origin_node: None,
            entity: target.entity(),
            kind: PacketKind::Request,
            endpoint: Some(endpoint.to_string()),
            correlation_id: None,
            payload: args,
        }
    }

    /// Build a response envelope.
    ///
    /// Always carries a fresh packet id. `destination_node` is the origin
    /// node of the request being answered. Deprecation metadata is merged
    /// into the payload without touching `failed`.
    pub fn response<R: RandomProvider>(
        random: &R,
        request_id: &str,
        destination_node: Option<NodeId>,
        entity: &str,
        outcome: Result<Value, ErrorBody>,
        deprecation: Option<&Deprecation>,
    ) -> Self {
        let mut payload = Map::new();
        payload.insert(REQUEST_ID_KEY.into(), Value::String(request_id.to_string()));
        match outcome {
            Ok(result) => {
                payload.insert("result".into(), result);
            }
            Err(body) => {
                payload.insert("error".into(), body.error);
                payload.insert("failed".into(), Value::Bool(body.failed));
            }
        }
        if let Some(deprecation) = deprecation {
            deprecation.merge_into(&mut payload);
        }
        Self {
            packet_id: random.unique_hex(),
            destination_node,
            origin_node: None,
            entity: entity.to_string(),
            kind: PacketKind::Response,
            endpoint: None,
            correlation_id: None,
            payload,
        }
    }

    /// Build a publication from `publisher` on `endpoint`.
    pub fn publish<R: RandomProvider>(
        random: &R,
        publisher: &ServiceIdentity,
        endpoint: &str,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            packet_id: random.unique_hex(),
            destination_node: None,
            origin_node: None,
            entity: publisher.entity(),
            kind: PacketKind::Publish,
            endpoint: Some(endpoint.to_string()),
            correlation_id: None,
            payload,
        }
    }

    /// Build a keep-alive ping.
    pub fn ping<R: RandomProvider>(random: &R, origin: Option<NodeId>) -> Self {
        Self {
            packet_id: random.unique_hex(),
            destination_node: None,
            origin_node: origin,
            entity: String::new(),
            kind: PacketKind::Ping,
            endpoint: None,
            correlation_id: None,
            payload: Map::new(),
        }
    }

    /// Set the sender node.
    pub fn with_origin(mut self, origin: NodeId) -> Self {
        self.origin_node = Some(origin);
        self
    }

    /// Set the destination node.
    pub fn with_destination(mut self, destination: NodeId) -> Self {
        self.destination_node = Some(destination);
        self
    }

    /// Attach a correlation id.
    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// The `request_id` carried in the payload, if it is a string.
    pub fn request_id(&self) -> Option<&str> {
        self.payload.get(REQUEST_ID_KEY).and_then(Value::as_str)
    }

    /// Endpoint name or `"-"` for logging.
    pub fn endpoint_or_dash(&self) -> &str {
        self.endpoint.as_deref().unwrap_or("-")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skein_core::TokioRandomProvider;

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("test args must be an object"),
        }
    }

    #[test]
    fn test_request_envelope_fields() {
        let random = TokioRandomProvider::new();
        let target = ServiceIdentity::new("calc", "1.0");
        let envelope = Envelope::request(
            &random,
            &target,
            "add",
            args(json!({"a": 2, "b": 3})),
            "r1",
        )
        .with_origin(NodeId::new("node-a"));

        assert_eq!(envelope.kind, PacketKind::Request);
        assert_eq!(envelope.entity, "calc@1.0");
        assert_eq!(envelope.endpoint.as_deref(), Some("add"));
        assert_eq!(envelope.request_id(), Some("r1"));
        assert_eq!(envelope.payload.get("a"), Some(&json!(2)));
        assert_eq!(envelope.origin_node, Some(NodeId::new("node-a")));
        assert_eq!(envelope.packet_id.len(), 32);
    }

    #[test]
    fn test_request_id_overrides_args() {
        let random = TokioRandomProvider::new();
        let target = ServiceIdentity::new("calc", "1.0");
        let envelope = Envelope::request(
            &random,
            &target,
            "add",
            args(json!({"request_id": "stale"})),
            "fresh",
        );
        assert_eq!(envelope.request_id(), Some("fresh"));
    }

    #[test]
    fn test_response_success_payload() {
        let random = TokioRandomProvider::new();
        let envelope = Envelope::response(
            &random,
            "r1",
            Some(NodeId::new("caller")),
            "calc@1.0",
            Ok(json!(5)),
            None,
        );

        assert_eq!(envelope.kind, PacketKind::Response);
        assert_eq!(envelope.destination_node, Some(NodeId::new("caller")));
        assert_eq!(
            Value::Object(envelope.payload),
            json!({"request_id": "r1", "result": 5})
        );
    }

    #[test]
    fn test_response_error_payload_with_deprecation() {
        let random = TokioRandomProvider::new();
        let deprecation = Deprecation::new("divide").with_replacement("div");
        let envelope = Envelope::response(
            &random,
            "r2",
            None,
            "calc@1.0",
            Err(ErrorBody::business("division_by_zero")),
            Some(&deprecation),
        );

        assert_eq!(
            Value::Object(envelope.payload.clone()),
            json!({
                "request_id": "r2",
                "error": "division_by_zero",
                "failed": false,
                "old_api": "divide",
                "replacement_api": "div",
            })
        );
        assert_eq!(Deprecation::from_payload(&envelope.payload), Some(deprecation));
    }

    #[test]
    fn test_response_packet_ids_are_fresh() {
        let random = TokioRandomProvider::new();
        let a = Envelope::response(&random, "r", None, "e@1", Ok(Value::Null), None);
        let b = Envelope::response(&random, "r", None, "e@1", Ok(Value::Null), None);
        assert_ne!(a.packet_id, b.packet_id);
    }

    #[test]
    fn test_wire_keys() {
        let random = TokioRandomProvider::new();
        let publisher = ServiceIdentity::new("orders", "2");
        let envelope = Envelope::publish(
            &random,
            &publisher,
            "order_created",
            args(json!({"id": 7})),
        )
        .with_destination(NodeId::new("n1"));

        let value = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(value["type"], json!("publish"));
        assert_eq!(value["to"], json!("n1"));
        assert_eq!(value["entity"], json!("orders@2"));
        assert!(value.get("pid").is_some());
        assert!(value.get("from").is_none());
        assert!(value.get("correlation_id").is_none());
    }

    #[test]
    fn test_decode_minimal_external_envelope() {
        let raw = r#"{"pid":"x","entity":"calc@1.0","type":"ping"}"#;
        let envelope: Envelope = serde_json::from_str(raw).expect("decode");
        assert_eq!(envelope.kind, PacketKind::Ping);
        assert!(envelope.payload.is_empty());
        assert!(envelope.destination_node.is_none());
    }

    #[test]
    fn test_is_rpc() {
        assert!(PacketKind::Request.is_rpc());
        assert!(PacketKind::Response.is_rpc());
        assert!(!PacketKind::Publish.is_rpc());
        assert!(!PacketKind::Ping.is_rpc());
    }
}
