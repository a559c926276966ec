//! Back-Protocol Message Model
//!
//! Fundamental wire shapes for talking to a JavaScript runtime. Keep
//! them minimal - command payloads stay opaque `Value`s; only the
//! target-lifecycle notifications get typed structs because the
//! lifecycle manager interprets those.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request ID - monotonically increasing per connection
pub type RequestId = u64;

/// Target ID assigned by the runtime
pub type TargetId = String;

/// Session ID: the routing key for a flattened target attachment
pub type SessionId = String;

/// Command sent to the runtime
#[derive(Debug, Clone, Serialize)]
pub struct CdpRequest {
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

/// Response from the runtime, correlated by `id`
#[derive(Debug, Clone, Deserialize)]
pub struct CdpResponse {
    pub id: RequestId,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<CdpRemoteError>,
}

/// Error payload the runtime attaches to a failed command
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CdpRemoteError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Notification from the runtime (no request ID)
#[derive(Debug, Clone, Deserialize)]
pub struct CdpEvent {
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<SessionId>,
}

/// Unified inbound message (response or event)
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CdpMessage {
    Response(CdpResponse),
    Event(CdpEvent),
}

/// Descriptor for one runtime execution context
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TargetInfo {
    #[serde(rename = "targetId")]
    pub target_id: TargetId,
    #[serde(rename = "type")]
    pub target_type: String,
    pub title: String,
    pub url: String,
    pub attached: bool,
    #[serde(rename = "openerId", default, skip_serializing_if = "Option::is_none")]
    pub opener_id: Option<TargetId>,
}

/// Result of a flattened attach-to-target command
#[derive(Debug, Clone, Deserialize)]
pub struct AttachToTargetResult {
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
}

/// Params of a target-created / target-info-changed notification
#[derive(Debug, Clone, Deserialize)]
pub struct TargetInfoParams {
    #[serde(rename = "targetInfo")]
    pub target_info: TargetInfo,
    #[serde(rename = "waitingForDebugger", default)]
    pub waiting_for_debugger: bool,
}

/// Params of a detached-from-target notification
#[derive(Debug, Clone, Deserialize)]
pub struct DetachedFromTargetParams {
    #[serde(rename = "targetId", default)]
    pub target_id: Option<TargetId>,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<SessionId>,
}

/// Params of a target-destroyed notification
#[derive(Debug, Clone, Deserialize)]
pub struct TargetDestroyedParams {
    #[serde(rename = "targetId")]
    pub target_id: TargetId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inbound_message_discrimination() {
        let response: CdpMessage =
            serde_json::from_value(json!({"id": 3, "result": {"ok": true}})).unwrap();
        assert!(matches!(response, CdpMessage::Response(_)));

        let event: CdpMessage = serde_json::from_value(json!({
            "method": "Target.targetCreated",
            "params": {"targetInfo": {
                "targetId": "t1", "type": "page", "title": "", "url": "", "attached": false
            }},
            "sessionId": "s1"
        }))
        .unwrap();
        match event {
            CdpMessage::Event(e) => {
                assert_eq!(e.method, "Target.targetCreated");
                assert_eq!(e.session_id.as_deref(), Some("s1"));
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn test_request_omits_empty_fields() {
        let request = CdpRequest {
            id: 1,
            method: "Target.setDiscoverTargets".to_string(),
            params: None,
            session_id: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("params").is_none());
        assert!(value.get("sessionId").is_none());
    }

    #[test]
    fn test_target_info_parent_linkage() {
        let info: TargetInfo = serde_json::from_value(json!({
            "targetId": "frame-2",
            "type": "iframe",
            "title": "ad",
            "url": "https://ads.example",
            "attached": true,
            "openerId": "page-1"
        }))
        .unwrap();
        assert_eq!(info.opener_id.as_deref(), Some("page-1"));
    }
}
