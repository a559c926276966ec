//! CDP Session - Per-Target RPC Façade
//!
//! A thin wrapper binding one attached target's routing key to the
//! shared client: commands go out stamped with the session id, and
//! event subscriptions see only this session's traffic. All sessions
//! share the same physical connection.

use crate::client::CdpClient;
use crate::error::Result;
use crate::protocol::{AttachToTargetResult, CdpEvent, SessionId, TargetId};
use serde_json::{json, Value};
use std::sync::Arc;

/// One attached target's view of the shared connection.
#[derive(Clone)]
pub struct CdpSession {
    client: Arc<CdpClient>,
    target_id: TargetId,
    session_id: SessionId,
}

impl CdpSession {
    /// Wrap an already-established attachment (e.g. one the lifecycle
    /// manager negotiated).
    pub fn new(client: Arc<CdpClient>, target_id: TargetId, session_id: SessionId) -> Self {
        Self {
            client,
            target_id,
            session_id,
        }
    }

    /// Attach to a target (flattened) and build its session.
    pub async fn attach(client: Arc<CdpClient>, target_id: TargetId) -> Result<Self> {
        let result = client
            .send_request(
                "Target.attachToTarget",
                Some(json!({ "targetId": target_id, "flatten": true })),
                None,
            )
            .await?;
        let attach: AttachToTargetResult = serde_json::from_value(result)?;
        tracing::debug!(target = %target_id, session = %attach.session_id, "attached to target");
        Ok(Self::new(client, target_id, attach.session_id))
    }

    pub fn target_id(&self) -> &TargetId {
        &self.target_id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Send a command within this session's context.
    pub async fn send(&self, method: impl Into<String>, params: Option<Value>) -> Result<Value> {
        self.client
            .send_request(method, params, Some(self.session_id.clone()))
            .await
    }

    /// Subscribe to an event, filtered to this session's traffic only.
    pub fn on(
        &self,
        method: impl Into<String>,
        callback: impl Fn(&CdpEvent) + Send + Sync + 'static,
    ) {
        let session_id = self.session_id.clone();
        self.client.subscribe(
            method,
            Arc::new(move |event| {
                if event.session_id.as_deref() == Some(session_id.as_str()) {
                    callback(event);
                }
            }),
        );
    }

    /// Detach this session from its target. The shared connection, and
    /// every other session on it, keeps working.
    pub async fn detach(&self) -> Result<()> {
        self.client
            .send_request(
                "Target.detachFromTarget",
                Some(json!({ "sessionId": self.session_id })),
                None,
            )
            .await?;
        Ok(())
    }
}
