//! CDP Client - The Core Communication Layer
//!
//! Design decisions:
//! 1. Single physical connection per debuggee (no per-session overhead)
//! 2. Transport-agnostic core: the client reads and writes text frames
//!    over a channel pair; WebSocket is just one pump bolted onto it,
//!    and tests (or a pipe transport) supply their own
//! 3. Request/response matching via ID, events fanned out to subscribers
//! 4. Fail fast - no retries, no queuing. Let the caller decide.

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::{CdpError, Result};
use crate::protocol::{CdpEvent, CdpMessage, CdpRequest, CdpResponse, RequestId, SessionId};

const WIRE_BUFFER: usize = 256;

/// Event subscriber callback
pub type EventCallback = Arc<dyn Fn(&CdpEvent) + Send + Sync>;

/// The raw ends of a client built over in-memory channels: inject
/// inbound frames through `to_client`, observe outbound frames on
/// `from_client`. Used by tests and by alternate transports (e.g. a
/// named-pipe pump) that bridge their own IO onto these channels.
pub struct WirePair {
    pub to_client: mpsc::Sender<String>,
    pub from_client: mpsc::Receiver<String>,
}

/// Back-protocol RPC client over one shared connection.
pub struct CdpClient {
    /// Stable identity for log correlation across tasks
    id: Uuid,

    /// Monotonic request ID counter
    next_id: AtomicU64,

    /// Pending commands waiting for responses
    pending: DashMap<RequestId, oneshot::Sender<CdpResponse>>,

    /// Event subscribers, keyed by method name
    subscribers: DashMap<String, Vec<EventCallback>>,

    /// Outbound text frames toward the wire
    outbound: mpsc::Sender<String>,

    closed: AtomicBool,
    closed_tx: broadcast::Sender<()>,
}

impl CdpClient {
    /// Connect to a runtime's WebSocket debugging endpoint.
    pub async fn connect(ws_url: &str) -> Result<Arc<Self>> {
        let parsed =
            url::Url::parse(ws_url).map_err(|e| CdpError::InvalidUrl(format!("{ws_url}: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(CdpError::InvalidUrl(format!(
                "expected ws:// or wss:// endpoint, got {ws_url}"
            )));
        }

        let (ws_stream, _) = connect_async(ws_url).await?;
        let (mut sink, mut stream) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(WIRE_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<String>(WIRE_BUFFER);

        let client = Self::over_channels(out_tx, in_rx);
        tracing::info!(endpoint = %ws_url, "connected to runtime");

        // Wire → client.
        let mut shutdown = client.closed_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = stream.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(text).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::info!("runtime connection closed");
                            break;
                        }
                        Some(Err(e)) => {
                            tracing::error!("runtime connection error: {e}");
                            break;
                        }
                        _ => {}
                    },
                    _ = shutdown.recv() => break,
                }
            }
            // Dropping `in_tx` ends the dispatch task, which settles
            // every pending command.
        });

        // Client → wire.
        let mut shutdown = client.closed_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = out_rx.recv() => match frame {
                        Some(text) => {
                            if let Err(e) = sink.send(Message::Text(text)).await {
                                tracing::error!("runtime send error: {e}");
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
            let _ = sink.close().await;
        });

        Ok(client)
    }

    /// Build a client over in-memory channels, returning the wire ends.
    pub fn pair() -> (Arc<Self>, WirePair) {
        let (out_tx, out_rx) = mpsc::channel(WIRE_BUFFER);
        let (in_tx, in_rx) = mpsc::channel(WIRE_BUFFER);
        let client = Self::over_channels(out_tx, in_rx);
        (
            client,
            WirePair {
                to_client: in_tx,
                from_client: out_rx,
            },
        )
    }

    fn over_channels(outbound: mpsc::Sender<String>, mut inbound: mpsc::Receiver<String>) -> Arc<Self> {
        let (closed_tx, _) = broadcast::channel(1);
        let client = Arc::new(Self {
            id: Uuid::now_v7(),
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            subscribers: DashMap::new(),
            outbound,
            closed: AtomicBool::new(false),
            closed_tx,
        });

        let dispatch = client.clone();
        tokio::spawn(async move {
            while let Some(text) = inbound.recv().await {
                if let Err(e) = dispatch.handle_frame(&text) {
                    tracing::warn!("failed to handle inbound frame: {e}");
                }
            }
            dispatch.finish();
        });

        client
    }

    /// Send a command and wait for its response.
    ///
    /// `session_id` scopes the command to one attached target; `None`
    /// addresses the browser-level connection itself.
    pub async fn send_request(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        session_id: Option<SessionId>,
    ) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CdpError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = CdpRequest {
            id,
            method: method.into(),
            params,
            session_id,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let json = serde_json::to_string(&request)?;
        if self.outbound.send(json).await.is_err() {
            self.pending.remove(&id);
            return Err(CdpError::Closed);
        }

        let response = rx.await.map_err(|_| CdpError::Closed)?;

        if let Some(error) = response.error {
            return Err(CdpError::Protocol {
                code: error.code,
                message: error.message,
            });
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Subscribe to runtime events by method name. Every subscriber for
    /// a method sees every matching event.
    pub fn subscribe(&self, method: impl Into<String>, callback: EventCallback) {
        self.subscribers
            .entry(method.into())
            .or_default()
            .push(callback);
    }

    /// Observe connection closure. Fires once.
    pub fn on_closed(&self) -> broadcast::Receiver<()> {
        self.closed_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the connection. All pending commands are rejected exactly
    /// once; idempotent.
    pub fn close(&self) {
        self.finish();
    }

    fn handle_frame(&self, text: &str) -> Result<()> {
        let message: CdpMessage = serde_json::from_str(text)?;

        match message {
            CdpMessage::Response(response) => {
                if let Some((_, tx)) = self.pending.remove(&response.id) {
                    // The caller may have abandoned the future.
                    let _ = tx.send(response);
                } else {
                    tracing::warn!(client = %self.id, id = response.id, "response for unknown request");
                }
            }
            CdpMessage::Event(event) => {
                let callbacks = self
                    .subscribers
                    .get(&event.method)
                    .map(|entry| entry.value().clone());
                if let Some(callbacks) = callbacks {
                    for callback in &callbacks {
                        callback(&event);
                    }
                } else {
                    tracing::trace!(method = %event.method, "event with no subscribers");
                }
            }
        }

        Ok(())
    }

    fn finish(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the pending senders rejects every waiter with
        // `Closed`, exactly once each.
        self.pending.clear();
        let _ = self.closed_tx.send(());
        tracing::debug!(client = %self.id, "client finished");
    }
}
