//! Session Router - Scoped Views Over One Physical Transport
//!
//! Many logical debug sessions (one per runtime execution context) ride
//! a single byte stream. Each message carries an optional `sessionId`;
//! the hub routes inbound frames to the scope registered under that id
//! and stamps outbound frames with the sending scope's id.
//!
//! Design: an explicit registry of scopes keyed by id, not nested
//! wrapper objects. Arbitrary session-tree depth is just more keys, so
//! routing stays O(1) and recursion never enters the picture.
//!
//! Close semantics: closing a scope detaches that one logical session -
//! its sends become no-ops and its receiver ends - while the physical
//! transport and every sibling scope keep working. Closing the physical
//! transport ends every scope exactly once.

use crate::error::Result;
use crate::protocol::{ProtocolMessage, ReceivedMessage, SessionId};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

const SCOPE_BUFFER: usize = 256;

struct HubShared {
    sender: crate::transport::TransportSender,
    scopes: DashMap<Option<SessionId>, mpsc::Sender<ReceivedMessage>>,
}

/// Owns the physical transport and the scope registry.
pub struct SessionHub {
    shared: Arc<HubShared>,
}

impl SessionHub {
    /// Take ownership of a framed transport and start routing.
    pub fn new(
        sender: crate::transport::TransportSender,
        mut receiver: crate::transport::TransportReceiver,
    ) -> Self {
        let shared = Arc::new(HubShared {
            sender,
            scopes: DashMap::new(),
        });

        let pump = shared.clone();
        tokio::spawn(async move {
            while let Some(received) = receiver.recv().await {
                let key = received.message.session_id().cloned();
                // Clone the sender out so no map shard is held across
                // the await below.
                let scope_tx = pump.scopes.get(&key).map(|entry| entry.value().clone());
                match scope_tx {
                    Some(tx) => {
                        if tx.send(received).await.is_err() {
                            pump.scopes.remove(&key);
                        }
                    }
                    None => {
                        // Scopes may close before in-flight messages
                        // drain; this is not an error.
                        tracing::trace!(session = ?key, "dropping message for unregistered scope");
                    }
                }
            }
            // Physical transport closed: dropping every scope sender
            // ends each scope's receiver exactly once.
            tracing::debug!("transport closed, ending {} scope(s)", pump.scopes.len());
            pump.scopes.clear();
        });

        Self { shared }
    }

    /// The root scope: messages with no `sessionId`.
    pub fn root(&self) -> SessionScope {
        self.register(None)
    }

    /// Open a scope for one logical session id.
    pub fn scope(&self, session_id: impl Into<SessionId>) -> SessionScope {
        self.register(Some(session_id.into()))
    }

    fn register(&self, key: Option<SessionId>) -> SessionScope {
        let (tx, rx) = mpsc::channel(SCOPE_BUFFER);
        if self.shared.scopes.insert(key.clone(), tx).is_some() {
            tracing::warn!(session = ?key, "replacing an existing scope registration");
        }
        let closed = Arc::new(AtomicBool::new(false));
        SessionScope {
            sender: ScopeSender {
                key: key.clone(),
                shared: self.shared.clone(),
                closed: closed.clone(),
            },
            rx,
            closed,
        }
    }

    /// Close the physical transport (and therefore every scope).
    pub fn close(&self) {
        self.shared.sender.close();
    }
}

/// Send half of a scope. Cheap to clone.
#[derive(Clone)]
pub struct ScopeSender {
    key: Option<SessionId>,
    shared: Arc<HubShared>,
    closed: Arc<AtomicBool>,
}

impl ScopeSender {
    /// Stamp the scope's session id and send. A closed scope swallows
    /// the message: detaching a child session must not surface errors
    /// to writers racing the teardown.
    pub async fn send(&self, mut message: ProtocolMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            tracing::trace!(session = ?self.key, "send on closed scope ignored");
            return Ok(());
        }
        message.set_session_id(self.key.clone());
        self.shared.sender.send(&message).await
    }

    /// Close this scope only. The wrapped transport, and sibling scopes
    /// riding on it, are unaffected. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the registry's sender ends the scope receiver.
        self.shared.scopes.remove(&self.key);
        tracing::debug!(session = ?self.key, "scope closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.key.as_ref()
    }
}

/// One logical session's view of the shared transport.
pub struct SessionScope {
    sender: ScopeSender,
    rx: mpsc::Receiver<ReceivedMessage>,
    closed: Arc<AtomicBool>,
}

impl SessionScope {
    pub fn sender(&self) -> ScopeSender {
        self.sender.clone()
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.sender.session_id()
    }

    /// See [`ScopeSender::send`].
    pub async fn send(&self, message: ProtocolMessage) -> Result<()> {
        self.sender.send(message).await
    }

    /// Next message routed to this scope, or `None` once the scope (or
    /// the transport under it) has closed. A closed scope delivers no
    /// further messages, buffered or not.
    pub async fn recv(&mut self) -> Option<ReceivedMessage> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        match self.rx.recv().await {
            Some(received) => Some(received),
            None => {
                self.closed.store(true, Ordering::SeqCst);
                None
            }
        }
    }

    /// See [`ScopeSender::close`].
    pub fn close(&self) {
        self.sender.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Event, ProtocolMessage};
    use crate::transport::FramedTransport;
    use serde_json::json;

    /// Hub over an in-memory duplex, plus the peer's raw transport
    /// halves for injecting and observing wire traffic.
    fn hub_pair() -> (
        SessionHub,
        crate::transport::TransportSender,
        crate::transport::TransportReceiver,
    ) {
        let (near, far) = tokio::io::duplex(16 * 1024);
        let (nr, nw) = tokio::io::split(near);
        let (fr, fw) = tokio::io::split(far);
        let (tx, rx) = FramedTransport::start(nr, nw);
        let (peer_tx, peer_rx) = FramedTransport::start(fr, fw);
        (SessionHub::new(tx, rx), peer_tx, peer_rx)
    }

    fn event(name: &str, session_id: Option<&str>) -> ProtocolMessage {
        ProtocolMessage::Event(Event {
            seq: 0,
            event: name.to_string(),
            body: Some(json!({})),
            session_id: session_id.map(str::to_string),
        })
    }

    #[tokio::test]
    async fn test_scope_isolation() {
        let (hub, peer_tx, _peer_rx) = hub_pair();
        let mut a = hub.scope("a");
        let mut b = hub.scope("b");

        peer_tx.send(&event("stopped", Some("a"))).await.unwrap();
        peer_tx.send(&event("continued", Some("b"))).await.unwrap();

        let got_b = b.recv().await.unwrap();
        assert_eq!(got_b.message.session_id(), Some(&"b".to_string()));

        let got_a = a.recv().await.unwrap();
        assert_eq!(got_a.message.session_id(), Some(&"a".to_string()));
        match got_a.message {
            ProtocolMessage::Event(e) => assert_eq!(e.event, "stopped"),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_root_scope_gets_untagged_messages() {
        let (hub, peer_tx, _peer_rx) = hub_pair();
        let mut root = hub.root();
        let _scoped = hub.scope("s1");

        peer_tx.send(&event("initialized", None)).await.unwrap();

        let got = root.recv().await.unwrap();
        assert_eq!(got.message.session_id(), None);
    }

    #[tokio::test]
    async fn test_outbound_messages_stamped_with_scope_id() {
        let (hub, _peer_tx, mut peer_rx) = hub_pair();
        let scope = hub.scope("child-7");

        scope.send(event("output", None)).await.unwrap();

        let seen = peer_rx.recv().await.unwrap();
        assert_eq!(seen.message.session_id(), Some(&"child-7".to_string()));
    }

    #[tokio::test]
    async fn test_unregistered_session_silently_dropped() {
        let (hub, peer_tx, _peer_rx) = hub_pair();
        let mut root = hub.root();

        peer_tx.send(&event("stopped", Some("ghost"))).await.unwrap();
        peer_tx.send(&event("initialized", None)).await.unwrap();

        // Only the root-tagged message arrives; the ghost one vanished.
        let got = root.recv().await.unwrap();
        match got.message {
            ProtocolMessage::Event(e) => assert_eq!(e.event, "initialized"),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_closing_scope_leaves_sibling_alive() {
        let (hub, peer_tx, mut peer_rx) = hub_pair();
        let mut a = hub.scope("a");
        let b = hub.scope("b");

        a.close();
        assert!(a.recv().await.is_none());

        // Sends from the closed scope are no-ops.
        a.send(event("output", None)).await.unwrap();

        // Sibling still sends and receives.
        b.send(event("output", None)).await.unwrap();
        let seen = peer_rx.recv().await.unwrap();
        assert_eq!(seen.message.session_id(), Some(&"b".to_string()));

        peer_tx.send(&event("stopped", Some("b"))).await.unwrap();
        let mut b = b;
        assert!(b.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_transport_close_ends_every_scope_once() {
        let (hub, _peer_tx, _peer_rx) = hub_pair();
        let mut a = hub.scope("a");
        let mut b = hub.scope("b");
        let mut root = hub.root();

        hub.close();

        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
        assert!(root.recv().await.is_none());
        // And again: closed stays closed.
        assert!(a.recv().await.is_none());
    }
}
