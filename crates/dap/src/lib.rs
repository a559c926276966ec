//! Front-Protocol Core - Transport, Routing, and Request Correlation
//!
//! This crate implements the client-facing half of the debug bridge:
//! a `Content-Length`-framed JSON protocol multiplexed into logical
//! sessions over one physical byte stream.
//!
//! # Architecture Philosophy
//!
//! 1. **Layered, leaf-first**: framing knows nothing about sessions,
//!    sessions know nothing about request correlation
//! 2. **Single writer per instance**: each connection's mutable state is
//!    touched only from its own dispatch task - no locks on the hot path
//! 3. **Opaque payloads**: bodies stay `serde_json::Value`; this layer
//!    never interprets command semantics

pub mod connection;
pub mod error;
pub mod protocol;
pub mod router;
pub mod transport;

pub use connection::{Command, Connection, ErrorHook, EventCallback};
pub use error::{DapError, Result};
pub use protocol::{Event, ProtocolError, ProtocolMessage, ReceivedMessage, Request, Response};
pub use router::{ScopeSender, SessionHub, SessionScope};
pub use transport::{FrameDecoder, FramedTransport, TransportReceiver, TransportSender};
