//! Front-Protocol Message Model
//!
//! These are the fundamental wire shapes for client communication.
//! Keep them minimal - bodies are opaque `Value`s by design.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Instant;

/// Sequence number - monotonically increasing per connection
pub type Seq = i64;

/// Session ID used for routing over a shared transport
pub type SessionId = String;

/// Request sent by either side
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub seq: Seq,
    pub command: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub arguments: Value,
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

/// Response to a request, correlated by `request_seq`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub seq: Seq,
    pub request_seq: Seq,
    pub command: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

/// Event - fire-and-forget notification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub seq: Seq,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

/// Unified protocol message, tagged by the `type` field
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProtocolMessage {
    Request(Request),
    Response(Response),
    Event(Event),
}

impl ProtocolMessage {
    /// Routing key. `None` means the root scope.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            ProtocolMessage::Request(r) => r.session_id.as_ref(),
            ProtocolMessage::Response(r) => r.session_id.as_ref(),
            ProtocolMessage::Event(e) => e.session_id.as_ref(),
        }
    }

    /// Stamp the routing key. The framing layer never calls this;
    /// only session scopes do.
    pub fn set_session_id(&mut self, session_id: Option<SessionId>) {
        match self {
            ProtocolMessage::Request(r) => r.session_id = session_id,
            ProtocolMessage::Response(r) => r.session_id = session_id,
            ProtocolMessage::Event(e) => e.session_id = session_id,
        }
    }

    pub fn seq(&self) -> Seq {
        match self {
            ProtocolMessage::Request(r) => r.seq,
            ProtocolMessage::Response(r) => r.seq,
            ProtocolMessage::Event(e) => e.seq,
        }
    }
}

/// A decoded frame plus the instant it left the wire.
///
/// The timestamp is monotonic and feeds latency telemetry only - it has
/// no protocol meaning.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message: ProtocolMessage,
    pub received_at: Instant,
}

/// Structured error payload carried in failed responses.
///
/// `format` is the human-readable message; `id` is the machine-readable
/// code a client can match on without parsing text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolError {
    pub id: u32,
    pub format: String,
    #[serde(rename = "showUser", default)]
    pub show_user: bool,
}

impl ProtocolError {
    pub const UNRECOGNIZED_REQUEST: u32 = 9221;
    pub const CONNECTION_CLOSED: u32 = 9222;
    pub const GENERIC_ERROR: u32 = 9229;

    pub fn unrecognized_request(command: &str) -> Self {
        Self {
            id: Self::UNRECOGNIZED_REQUEST,
            format: format!("Unrecognized request: {command}"),
            show_user: false,
        }
    }

    pub fn connection_closed() -> Self {
        Self {
            id: Self::CONNECTION_CLOSED,
            format: "Connection closed".to_string(),
            show_user: false,
        }
    }

    pub fn generic(format: impl Into<String>) -> Self {
        Self {
            id: Self::GENERIC_ERROR,
            format: format.into(),
            show_user: true,
        }
    }

    /// Response body shape for a failed request: `{"error": {...}}`.
    pub fn into_body(self) -> Value {
        json!({ "error": self })
    }

    /// Recover the structured payload from a failed response, falling
    /// back to the flat `message` field for foreign implementations.
    pub fn from_response(body: Option<&Value>, message: Option<&str>) -> Self {
        if let Some(error) = body.and_then(|b| b.get("error")) {
            if let Ok(parsed) = serde_json::from_value::<ProtocolError>(error.clone()) {
                return parsed;
            }
        }
        Self {
            id: Self::GENERIC_ERROR,
            format: message.unwrap_or("Unknown error").to_string(),
            show_user: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let msg = ProtocolMessage::Request(Request {
            seq: 1,
            command: "initialize".to_string(),
            arguments: json!({"adapterID": "js"}),
            session_id: None,
        });

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "request");
        assert_eq!(value["seq"], 1);
        assert_eq!(value["command"], "initialize");
        assert!(value.get("sessionId").is_none());

        let back: ProtocolMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_session_id_round_trip() {
        let mut msg = ProtocolMessage::Event(Event {
            seq: 3,
            event: "stopped".to_string(),
            body: None,
            session_id: None,
        });
        msg.set_session_id(Some("s1".to_string()));

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["sessionId"], "s1");

        let back: ProtocolMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back.session_id(), Some(&"s1".to_string()));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let raw = json!({
            "seq": 7,
            "type": "request",
            "command": "threads",
            "flavor": "unexpected"
        });
        let msg: ProtocolMessage = serde_json::from_value(raw).unwrap();
        match msg {
            ProtocolMessage::Request(r) => assert_eq!(r.command, "threads"),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_error_from_flat_message() {
        let err = ProtocolError::from_response(None, Some("boom"));
        assert_eq!(err.id, ProtocolError::GENERIC_ERROR);
        assert_eq!(err.format, "boom");
    }

    #[test]
    fn test_error_from_structured_body() {
        let body = ProtocolError::unrecognized_request("foo").into_body();
        let err = ProtocolError::from_response(Some(&body), None);
        assert_eq!(err.id, ProtocolError::UNRECOGNIZED_REQUEST);
        assert_eq!(err.format, "Unrecognized request: foo");
    }
}
