//! Back-Protocol Core - Runtime-Side RPC and Target Lifecycle
//!
//! This crate speaks the runtime half of the debug bridge: a JSON
//! request/response/event protocol multiplexed over one WebSocket (or
//! any text-frame duplex), plus the state machine that tracks the
//! dynamic tree of debuggable targets as they appear and disappear.
//!
//! # Architecture Philosophy
//!
//! 1. Single physical connection per debuggee; attached targets are
//!    multiplexed over it by session id ("flattened" attachment)
//! 2. The target tree has exactly one writer: the lifecycle queue's
//!    consumer task. Everyone else sees snapshots via events
//! 3. Fail fast - no retries, no queuing beyond the lifecycle queue.
//!    Let the caller decide.

pub mod client;
pub mod error;
pub mod protocol;
pub mod session;
pub mod targets;

pub use client::{CdpClient, WirePair};
pub use error::{CdpError, Result};
pub use protocol::{CdpEvent, CdpMessage, CdpRemoteError, CdpRequest, CdpResponse, TargetInfo};
pub use session::CdpSession;
pub use targets::{
    ResumePolicy, TargetBackend, TargetEvent, TargetFilter, TargetManager, TargetManagerConfig,
    TargetNotification, TargetSnapshot, TargetState,
};
