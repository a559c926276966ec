//! Front-Protocol Connection - Request Correlation and Dispatch
//!
//! The request/response/event protocol over one session scope.
//!
//! Design decisions:
//! 1. The sequence counter is owned by this connection alone; responses
//!    are matched by `request_seq` through a single-shot pending table
//! 2. Inbound requests run inline on the dispatch task - one logical
//!    thread of control per connection, no locks around handler state
//! 3. Typed commands go through the [`Command`] trait, an explicit seam
//!    instead of the reflective proxy the protocol invites

use crate::error::{DapError, Result};
use crate::protocol::{
    Event, ProtocolError, ProtocolMessage, ReceivedMessage, Request, Response, Seq,
};
use crate::router::{ScopeSender, SessionScope};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};
use uuid::Uuid;

/// A known command: its wire name and typed argument/result pair.
///
/// The generic send/handle paths operate on this table; the connection
/// itself never interprets bodies.
pub trait Command {
    const NAME: &'static str;
    type Args: Serialize + Send;
    type Body: DeserializeOwned;
}

/// Event subscriber callback.
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Hook invoked for errors that never propagate to a caller (framing
/// and protocol violations). Passed in explicitly by the process entry
/// point; there is no process-wide mutable default.
pub type ErrorHook = Arc<dyn Fn(&ProtocolError) + Send + Sync>;

type RequestHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, std::result::Result<Value, ProtocolError>> + Send + Sync>;

type PendingReply = oneshot::Sender<std::result::Result<Option<Value>, ProtocolError>>;

struct ConnectionInner {
    id: Uuid,
    sender: ScopeSender,
    next_seq: AtomicI64,
    pending: DashMap<Seq, PendingReply>,
    handlers: DashMap<String, RequestHandler>,
    listeners: DashMap<String, Vec<EventCallback>>,
    initialized: AtomicBool,
    initialized_notify: Notify,
    error_hook: Option<ErrorHook>,
}

/// One front-protocol connection over a session scope.
///
/// Cheap to clone; all clones share the same dispatch task and state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn new(scope: SessionScope) -> Self {
        Self::with_error_hook(scope, None)
    }

    pub fn with_error_hook(scope: SessionScope, error_hook: Option<ErrorHook>) -> Self {
        let inner = Arc::new(ConnectionInner {
            id: Uuid::now_v7(),
            sender: scope.sender(),
            next_seq: AtomicI64::new(1),
            pending: DashMap::new(),
            handlers: DashMap::new(),
            listeners: DashMap::new(),
            initialized: AtomicBool::new(false),
            initialized_notify: Notify::new(),
            error_hook,
        });

        let dispatch = inner.clone();
        let mut scope = scope;
        tokio::spawn(async move {
            while let Some(received) = scope.recv().await {
                dispatch.dispatch(received).await;
            }
            tracing::info!(connection = %dispatch.id, "connection closed");
            dispatch.reject_all_pending();
        });

        Self { inner }
    }

    /// Issue a request and await the response body.
    ///
    /// The returned future resolves when the matching response arrives,
    /// in whatever order responses come back. Abandoning the future is
    /// allowed; the eventual resolution is simply ignored.
    pub async fn send_request(&self, command: &str, arguments: Value) -> Result<Option<Value>> {
        let inner = &self.inner;
        let seq = inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(seq, tx);

        let message = ProtocolMessage::Request(Request {
            seq,
            command: command.to_string(),
            arguments,
            session_id: None,
        });

        if let Err(e) = inner.sender.send(message).await {
            inner.pending.remove(&seq);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(protocol_error)) => Err(DapError::Request(protocol_error)),
            // Sender dropped without resolving: teardown.
            Err(_) => Err(DapError::Closed),
        }
    }

    /// Typed variant of [`Connection::send_request`].
    pub async fn request<C: Command>(&self, args: C::Args) -> Result<C::Body> {
        let arguments = serde_json::to_value(args)?;
        let body = self.send_request(C::NAME, arguments).await?;
        Ok(serde_json::from_value(body.unwrap_or(Value::Null))?)
    }

    /// Fire-and-forget event to the remote side.
    pub async fn send_event(&self, name: &str, body: Value) -> Result<()> {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let message = ProtocolMessage::Event(Event {
            seq,
            event: name.to_string(),
            body: if body.is_null() { None } else { Some(body) },
            session_id: None,
        });
        self.inner.sender.send(message).await
    }

    /// Register a handler for an inbound command. Replaces any handler
    /// previously registered for the same command.
    pub fn on_request<F, Fut>(&self, command: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, ProtocolError>> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(move |args| Box::pin(handler(args)));
        self.inner.handlers.insert(command.into(), handler);
    }

    /// Typed variant of [`Connection::on_request`].
    pub fn on_command<C, F, Fut>(&self, handler: F)
    where
        C: Command,
        C::Args: DeserializeOwned,
        C::Body: Serialize,
        F: Fn(C::Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<C::Body, ProtocolError>> + Send + 'static,
    {
        self.on_request(C::NAME, move |raw| {
            let parsed = serde_json::from_value::<C::Args>(raw)
                .map_err(|e| ProtocolError::generic(format!("Invalid arguments: {e}")));
            let fut = parsed.map(&handler);
            async move {
                let body = fut?.await?;
                serde_json::to_value(body)
                    .map_err(|e| ProtocolError::generic(format!("Invalid response body: {e}")))
            }
        });
    }

    /// Drop the handler for a command, if any.
    pub fn remove_request_handler(&self, command: &str) {
        self.inner.handlers.remove(command);
    }

    /// Subscribe to an inbound event by name. Multiple subscribers per
    /// event are supported; each gets every matching event.
    pub fn on_event(&self, name: impl Into<String>, callback: EventCallback) {
        self.inner
            .listeners
            .entry(name.into())
            .or_default()
            .push(callback);
    }

    /// Resolves once the remote side has answered an `initialize`
    /// request on this connection. One-shot: stays resolved forever.
    pub async fn wait_initialized(&self) {
        let notified = self.inner.initialized_notify.notified();
        if self.inner.initialized.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }

    /// Close this connection's scope. Every outstanding request is
    /// rejected with a cancellation-class error exactly once.
    pub fn close(&self) {
        self.inner.sender.close();
        self.inner.reject_all_pending();
    }
}

impl ConnectionInner {
    async fn dispatch(&self, received: ReceivedMessage) {
        match received.message {
            ProtocolMessage::Request(request) => {
                self.handle_request(request, received.received_at).await;
            }
            ProtocolMessage::Response(response) => self.handle_response(response),
            ProtocolMessage::Event(event) => self.handle_event(event),
        }
    }

    async fn handle_request(&self, request: Request, received_at: std::time::Instant) {
        let handler = self
            .handlers
            .get(&request.command)
            .map(|entry| entry.value().clone());

        let (success, message, body) = match handler {
            Some(handler) => match handler(request.arguments.clone()).await {
                Ok(body) => (true, None, Some(body)),
                Err(protocol_error) => {
                    let message = protocol_error.format.clone();
                    (false, Some(message), Some(protocol_error.into_body()))
                }
            },
            None => {
                let protocol_error = ProtocolError::unrecognized_request(&request.command);
                tracing::warn!(
                    connection = %self.id,
                    command = %request.command,
                    "no handler registered for inbound request"
                );
                let message = protocol_error.format.clone();
                (false, Some(message), Some(protocol_error.into_body()))
            }
        };

        tracing::trace!(
            connection = %self.id,
            command = %request.command,
            latency_us = received_at.elapsed().as_micros() as u64,
            success,
            "handled inbound request"
        );

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let response = ProtocolMessage::Response(Response {
            seq,
            request_seq: request.seq,
            command: request.command,
            success,
            message,
            body,
            session_id: None,
        });
        if let Err(e) = self.sender.send(response).await {
            tracing::debug!(connection = %self.id, "failed to send response: {e}");
        }
    }

    fn handle_response(&self, response: Response) {
        if response.command == "initialize" && !self.initialized.swap(true, Ordering::SeqCst) {
            self.initialized_notify.notify_waiters();
        }

        let Some((_, reply)) = self.pending.remove(&response.request_seq) else {
            // Protocol violation: a stale or duplicate response. The
            // slot was consumed at first dispatch, so this can never
            // resolve an already-used caller.
            let violation = ProtocolError::generic(format!(
                "Response for unknown request {}",
                response.request_seq
            ));
            tracing::warn!(connection = %self.id, "{}", violation.format);
            if let Some(hook) = &self.error_hook {
                hook(&violation);
            }
            return;
        };

        let outcome = if response.success {
            Ok(response.body)
        } else {
            Err(ProtocolError::from_response(
                response.body.as_ref(),
                response.message.as_deref(),
            ))
        };
        // The caller may have abandoned the future; that is allowed.
        let _ = reply.send(outcome);
    }

    fn handle_event(&self, event: Event) {
        let callbacks = self
            .listeners
            .get(&event.event)
            .map(|entry| entry.value().clone());
        match callbacks {
            Some(callbacks) => {
                for callback in &callbacks {
                    callback(&event);
                }
            }
            None => {
                tracing::trace!(connection = %self.id, event = %event.event, "event with no listeners");
            }
        }
    }

    /// Reject every outstanding request with a connection-closed error.
    /// Entries are removed as they are rejected, so a racing resolve
    /// and a racing reject can never both fire.
    fn reject_all_pending(&self) {
        let seqs: Vec<Seq> = self.pending.iter().map(|entry| *entry.key()).collect();
        for seq in seqs {
            if let Some((_, reply)) = self.pending.remove(&seq) {
                let _ = reply.send(Err(ProtocolError::connection_closed()));
            }
        }
    }
}
