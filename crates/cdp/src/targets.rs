//! Target Lifecycle Manager - The Attach/Detach State Machine
//!
//! Tracks the tree of attached runtime targets for one debuggee and
//! mediates the races between attach round-trips and the notifications
//! that keep arriving while they are in flight.
//!
//! Design decisions:
//! 1. Actor model: one consumer task owns the target tree. Every
//!    notification, query, and command flows through a single ordered
//!    queue, and each operation - including its nested back-protocol
//!    round-trips - completes fully before the next begins
//! 2. External consumers never touch the tree; they get read-only
//!    snapshots via broadcast events
//! 3. The resume-on-attach question is configuration, not a guess
//!
//! Known liveness risk: a hung attach round-trip stalls the whole queue
//! for its manager. That is deliberate - processing later notifications
//! before a pending attach resolves would reorder the lifecycle. Put a
//! watchdog outside this layer if the debuggee cannot be trusted.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::client::CdpClient;
use crate::error::Result;
use crate::protocol::{
    AttachToTargetResult, DetachedFromTargetParams, SessionId, TargetDestroyedParams, TargetId,
    TargetInfo, TargetInfoParams,
};

const QUEUE_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 1024;

/// Caller-supplied predicate deciding which discovered targets get
/// surfaced. Targets that fail it are silently resumed instead.
pub type TargetFilter = Arc<dyn Fn(&TargetInfo) -> bool + Send + Sync>;

/// What the lifecycle manager needs from its back-protocol collaborator.
///
/// `attach_to_target` is flattened: it returns the routing key for the
/// new sub-session rather than opening a new physical connection.
#[async_trait]
pub trait TargetBackend: Send + Sync {
    async fn set_discover_targets(&self, discover: bool) -> Result<()>;
    async fn attach_to_target(&self, target_id: &TargetId) -> Result<SessionId>;
    async fn detach_from_target(&self, session_id: &SessionId) -> Result<()>;
    /// Enable auto-attach on an attached target's own session so its
    /// children (iframes, workers) are discovered too.
    async fn set_auto_attach(&self, session_id: &SessionId) -> Result<()>;
    /// Let a target paused at entry start running.
    async fn resume(&self, session_id: &SessionId) -> Result<()>;
    /// Tear down the debuggee itself (used when the manager owns it).
    async fn close_debuggee(&self) -> Result<()>;
}

#[async_trait]
impl TargetBackend for CdpClient {
    async fn set_discover_targets(&self, discover: bool) -> Result<()> {
        self.send_request(
            "Target.setDiscoverTargets",
            Some(json!({ "discover": discover })),
            None,
        )
        .await?;
        Ok(())
    }

    async fn attach_to_target(&self, target_id: &TargetId) -> Result<SessionId> {
        let result = self
            .send_request(
                "Target.attachToTarget",
                Some(json!({ "targetId": target_id, "flatten": true })),
                None,
            )
            .await?;
        let attach: AttachToTargetResult = serde_json::from_value(result)?;
        Ok(attach.session_id)
    }

    async fn detach_from_target(&self, session_id: &SessionId) -> Result<()> {
        self.send_request(
            "Target.detachFromTarget",
            Some(json!({ "sessionId": session_id })),
            None,
        )
        .await?;
        Ok(())
    }

    async fn set_auto_attach(&self, session_id: &SessionId) -> Result<()> {
        self.send_request(
            "Target.setAutoAttach",
            Some(json!({
                "autoAttach": true,
                "waitForDebuggerOnStart": true,
                "flatten": true,
            })),
            Some(session_id.clone()),
        )
        .await?;
        Ok(())
    }

    async fn resume(&self, session_id: &SessionId) -> Result<()> {
        self.send_request(
            "Runtime.runIfWaitingForDebugger",
            None,
            Some(session_id.clone()),
        )
        .await?;
        Ok(())
    }

    async fn close_debuggee(&self) -> Result<()> {
        self.close();
        Ok(())
    }
}

/// Per-target lifecycle state.
///
/// Only reached-after-attach states appear here: a target that is
/// merely discovered, or whose attach round-trip is still in flight,
/// lives in the discovery map and the queue, not in the tree, so no
/// snapshot can observe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Attached,
    /// Attached, but execution is paused at entry pending an explicit
    /// resume (top-level pages, so breakpoints land before first script).
    AttachedWaitingForDebugger,
    Detaching,
    Detached,
}

/// Whether newly-attached targets paused at entry get resumed.
///
/// Historical debuggers disagree on the right default for non-page
/// targets, so it is explicit here. Service workers are always resumed
/// regardless - leaving one paused wedges the browser's worker queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePolicy {
    /// Pages wait for the client; everything else resumes immediately.
    ResumeNonPages,
    /// Every waiting target stays paused until an explicit resume.
    WaitForAll,
}

impl ResumePolicy {
    fn should_resume(self, target_type: &str) -> bool {
        match target_type {
            "service_worker" => true,
            "page" => false,
            _ => self == ResumePolicy::ResumeNonPages,
        }
    }
}

/// Manager configuration.
#[derive(Clone, Default)]
pub struct TargetManagerConfig {
    pub resume_policy: ResumePolicy,
    /// True when the debuggee was launched by us (not attached to an
    /// already-running process): the last target going away closes it.
    pub owns_debuggee: bool,
    pub filter: Option<TargetFilter>,
}

impl Default for ResumePolicy {
    fn default() -> Self {
        ResumePolicy::ResumeNonPages
    }
}

/// Read-only view of one tracked target, delivered via events.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSnapshot {
    pub info: TargetInfo,
    pub session_id: SessionId,
    pub parent_id: Option<TargetId>,
    pub waiting_for_debugger: bool,
    pub state: TargetState,
}

/// Lifecycle events for consumers of the target tree.
#[derive(Debug, Clone)]
pub enum TargetEvent {
    Added(TargetSnapshot),
    Removed(TargetSnapshot),
    /// Fired for *all* tracked targets when any one changes: a changed
    /// title can create or resolve duplicate-name ambiguity anywhere in
    /// the tree.
    Changed(Vec<TargetSnapshot>),
}

/// Raw lifecycle notifications from the back protocol. `parent_session_id`
/// is the session the notification arrived on, which identifies the
/// parent target when an attach happens from within one.
#[derive(Debug, Clone)]
pub enum TargetNotification {
    Created {
        info: TargetInfo,
        parent_session_id: Option<SessionId>,
        waiting_for_debugger: bool,
    },
    InfoChanged {
        info: TargetInfo,
        parent_session_id: Option<SessionId>,
    },
    Detached {
        target_id: Option<TargetId>,
        session_id: Option<SessionId>,
    },
}

enum Op {
    Notify(TargetNotification),
    Detach(TargetId),
    Resume(TargetId),
    Snapshot(oneshot::Sender<Vec<TargetSnapshot>>),
    Dispose(oneshot::Sender<()>),
}

/// Handle to one debuggee's target lifecycle actor. Cheap to clone;
/// all clones feed the same queue.
#[derive(Clone)]
pub struct TargetManager {
    ops: mpsc::Sender<Op>,
    events: broadcast::Sender<TargetEvent>,
}

impl TargetManager {
    /// Enable target discovery on the backend and start the lifecycle
    /// consumer.
    pub async fn start(
        backend: Arc<dyn TargetBackend>,
        config: TargetManagerConfig,
    ) -> Result<Self> {
        backend.set_discover_targets(true).await?;

        let (ops_tx, ops_rx) = mpsc::channel(QUEUE_BUFFER);
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);

        let consumer = Lifecycle {
            backend,
            config,
            targets: HashMap::new(),
            by_session: HashMap::new(),
            discovered: HashMap::new(),
            events: events_tx.clone(),
        };
        tokio::spawn(consumer.run(ops_rx));

        Ok(Self {
            ops: ops_tx,
            events: events_tx,
        })
    }

    /// Subscribe to added/removed/changed events.
    pub fn subscribe(&self) -> broadcast::Receiver<TargetEvent> {
        self.events.subscribe()
    }

    /// Queue a lifecycle notification.
    pub async fn notify(&self, notification: TargetNotification) {
        if self.ops.send(Op::Notify(notification)).await.is_err() {
            tracing::debug!("lifecycle queue is gone, dropping notification");
        }
    }

    /// Queue a notification from synchronous context (event callbacks).
    /// Arrival order is preserved because callbacks for one connection
    /// run serially; an overflowing queue drops the notification.
    pub fn notify_sync(&self, notification: TargetNotification) {
        if let Err(e) = self.ops.try_send(Op::Notify(notification)) {
            tracing::warn!("lifecycle queue rejected notification: {e}");
        }
    }

    /// Ask the backend to detach a tracked target. Removal happens when
    /// the corresponding detached notification comes back.
    pub async fn detach(&self, target_id: impl Into<TargetId>) {
        let _ = self.ops.send(Op::Detach(target_id.into())).await;
    }

    /// Resume a target left paused at entry.
    pub async fn resume(&self, target_id: impl Into<TargetId>) {
        let _ = self.ops.send(Op::Resume(target_id.into())).await;
    }

    /// Snapshot of the current tree, consistent with every operation
    /// queued before this call.
    pub async fn targets(&self) -> Vec<TargetSnapshot> {
        let (tx, rx) = oneshot::channel();
        if self.ops.send(Op::Snapshot(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Tear the manager down, synthesizing detach-everything semantics.
    pub async fn dispose(&self) {
        let (tx, rx) = oneshot::channel();
        if self.ops.send(Op::Dispose(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Subscribe a client's target notifications into this manager.
    pub fn wire(&self, client: &Arc<CdpClient>) {
        let manager = self.clone();
        client.subscribe(
            "Target.targetCreated",
            Arc::new(move |event| {
                let Some(params) = event.params.clone() else { return };
                match serde_json::from_value::<TargetInfoParams>(params) {
                    Ok(p) => manager.notify_sync(TargetNotification::Created {
                        info: p.target_info,
                        parent_session_id: event.session_id.clone(),
                        waiting_for_debugger: p.waiting_for_debugger,
                    }),
                    Err(e) => tracing::warn!("bad targetCreated payload: {e}"),
                }
            }),
        );

        let manager = self.clone();
        client.subscribe(
            "Target.targetInfoChanged",
            Arc::new(move |event| {
                let Some(params) = event.params.clone() else { return };
                match serde_json::from_value::<TargetInfoParams>(params) {
                    Ok(p) => manager.notify_sync(TargetNotification::InfoChanged {
                        info: p.target_info,
                        parent_session_id: event.session_id.clone(),
                    }),
                    Err(e) => tracing::warn!("bad targetInfoChanged payload: {e}"),
                }
            }),
        );

        let manager = self.clone();
        client.subscribe(
            "Target.detachedFromTarget",
            Arc::new(move |event| {
                let Some(params) = event.params.clone() else { return };
                match serde_json::from_value::<DetachedFromTargetParams>(params) {
                    Ok(p) => manager.notify_sync(TargetNotification::Detached {
                        target_id: p.target_id,
                        session_id: p.session_id,
                    }),
                    Err(e) => tracing::warn!("bad detachedFromTarget payload: {e}"),
                }
            }),
        );

        // A destroyed target is a detach whose session is already gone.
        let manager = self.clone();
        client.subscribe(
            "Target.targetDestroyed",
            Arc::new(move |event| {
                let Some(params) = event.params.clone() else { return };
                match serde_json::from_value::<TargetDestroyedParams>(params) {
                    Ok(p) => manager.notify_sync(TargetNotification::Detached {
                        target_id: Some(p.target_id),
                        session_id: None,
                    }),
                    Err(e) => tracing::warn!("bad targetDestroyed payload: {e}"),
                }
            }),
        );
    }
}

struct TrackedTarget {
    info: TargetInfo,
    session_id: SessionId,
    parent_id: Option<TargetId>,
    children: Vec<TargetId>,
    waiting_for_debugger: bool,
    state: TargetState,
}

impl TrackedTarget {
    fn snapshot(&self) -> TargetSnapshot {
        TargetSnapshot {
            info: self.info.clone(),
            session_id: self.session_id.clone(),
            parent_id: self.parent_id.clone(),
            waiting_for_debugger: self.waiting_for_debugger,
            state: self.state,
        }
    }
}

/// The queue consumer. Sole writer of the target tree.
struct Lifecycle {
    backend: Arc<dyn TargetBackend>,
    config: TargetManagerConfig,
    targets: HashMap<TargetId, TrackedTarget>,
    by_session: HashMap<SessionId, TargetId>,
    /// Latest descriptor for every target we have heard of, attached
    /// or not; feeds filtered-out → filtered-in transitions.
    discovered: HashMap<TargetId, TargetInfo>,
    events: broadcast::Sender<TargetEvent>,
}

impl Lifecycle {
    async fn run(mut self, mut ops: mpsc::Receiver<Op>) {
        while let Some(op) = ops.recv().await {
            match op {
                Op::Notify(notification) => self.handle_notification(notification).await,
                Op::Detach(target_id) => self.handle_detach_request(&target_id).await,
                Op::Resume(target_id) => self.handle_resume(&target_id).await,
                Op::Snapshot(reply) => {
                    let _ = reply.send(self.snapshots());
                }
                Op::Dispose(done) => {
                    self.dispose().await;
                    let _ = done.send(());
                    return;
                }
            }
        }
        tracing::debug!("lifecycle queue ended without dispose");
    }

    async fn handle_notification(&mut self, notification: TargetNotification) {
        match notification {
            TargetNotification::Created {
                info,
                parent_session_id,
                waiting_for_debugger,
            } => {
                self.handle_created(info, parent_session_id, waiting_for_debugger)
                    .await;
            }
            TargetNotification::InfoChanged {
                info,
                parent_session_id,
            } => {
                self.handle_info_changed(info, parent_session_id).await;
            }
            TargetNotification::Detached {
                target_id,
                session_id,
            } => {
                self.handle_detached(target_id, session_id).await;
            }
        }
    }

    fn eligible(&self, info: &TargetInfo) -> bool {
        self.config.filter.as_ref().map_or(true, |f| f(info))
    }

    async fn handle_created(
        &mut self,
        info: TargetInfo,
        parent_session_id: Option<SessionId>,
        waiting_for_debugger: bool,
    ) {
        let target_id = info.target_id.clone();
        self.discovered.insert(target_id.clone(), info.clone());

        if self.targets.contains_key(&target_id) {
            tracing::debug!(target = %target_id, "created notification for tracked target");
            self.apply_info(info);
            return;
        }

        if !self.eligible(&info) {
            if waiting_for_debugger {
                self.silently_release(&target_id).await;
            } else {
                tracing::debug!(target = %target_id, "target filtered out");
            }
            return;
        }

        self.attach(info, parent_session_id, waiting_for_debugger)
            .await;
    }

    /// A filtered-out target paused at entry must not stay paused
    /// forever: attach just long enough to let it run, then let go.
    async fn silently_release(&mut self, target_id: &TargetId) {
        tracing::debug!(target = %target_id, "resuming filtered-out target");
        match self.backend.attach_to_target(target_id).await {
            Ok(session_id) => {
                if let Err(e) = self.backend.resume(&session_id).await {
                    tracing::warn!(target = %target_id, "failed to resume filtered target: {e}");
                }
                if let Err(e) = self.backend.detach_from_target(&session_id).await {
                    tracing::debug!(target = %target_id, "failed to release filtered target: {e}");
                }
            }
            Err(e) => {
                tracing::warn!(target = %target_id, "failed to reach filtered target: {e}");
            }
        }
    }

    async fn attach(
        &mut self,
        info: TargetInfo,
        parent_session_id: Option<SessionId>,
        waiting_for_debugger: bool,
    ) {
        let target_id = info.target_id.clone();
        tracing::debug!(target = %target_id, kind = %info.target_type, "attaching");

        let session_id = match self.backend.attach_to_target(&target_id).await {
            Ok(session_id) => session_id,
            Err(e) => {
                // The queue continues; the target stays discovered so a
                // later info change can retry.
                tracing::warn!(target = %target_id, "attach failed: {e}");
                return;
            }
        };

        // Notifications that raced the attach round-trip are queued
        // behind this operation; the freshest info we can start from is
        // whatever discovery has recorded so far.
        let info = self
            .discovered
            .get(&target_id)
            .cloned()
            .unwrap_or(info);

        let parent_id = parent_session_id
            .as_ref()
            .and_then(|sid| self.by_session.get(sid).cloned());

        let state = if waiting_for_debugger {
            TargetState::AttachedWaitingForDebugger
        } else {
            TargetState::Attached
        };
        let target = TrackedTarget {
            info: info.clone(),
            session_id: session_id.clone(),
            parent_id: parent_id.clone(),
            children: Vec::new(),
            waiting_for_debugger,
            state,
        };

        if let Some(parent_id) = &parent_id {
            if let Some(parent) = self.targets.get_mut(parent_id) {
                parent.children.push(target_id.clone());
            }
        }
        self.by_session.insert(session_id.clone(), target_id.clone());
        let snapshot = target.snapshot();
        self.targets.insert(target_id.clone(), target);

        tracing::info!(target = %target_id, session = %session_id, "target attached");
        let _ = self.events.send(TargetEvent::Added(snapshot));

        if let Err(e) = self.backend.set_auto_attach(&session_id).await {
            tracing::warn!(target = %target_id, "failed to enable auto-attach: {e}");
        }

        if waiting_for_debugger && self.config.resume_policy.should_resume(&info.target_type) {
            match self.backend.resume(&session_id).await {
                Ok(()) => {
                    if let Some(target) = self.targets.get_mut(&target_id) {
                        target.waiting_for_debugger = false;
                        target.state = TargetState::Attached;
                    }
                }
                Err(e) => {
                    tracing::warn!(target = %target_id, "failed to resume on attach: {e}");
                }
            }
        }
    }

    async fn handle_info_changed(
        &mut self,
        info: TargetInfo,
        parent_session_id: Option<SessionId>,
    ) {
        self.discovered
            .insert(info.target_id.clone(), info.clone());

        if self.targets.contains_key(&info.target_id) {
            self.apply_info(info);
        } else if self.eligible(&info) {
            // Filtered-out before, filtered-in now (e.g. it navigated
            // somewhere we care about).
            self.attach(info, parent_session_id, false).await;
        }
    }

    fn apply_info(&mut self, info: TargetInfo) {
        let target_id = info.target_id.clone();
        if let Some(target) = self.targets.get_mut(&target_id) {
            target.info = info;
        }
        // Every tracked target, not just the changed one: a new title
        // can create or resolve duplicate names elsewhere in the tree.
        let _ = self.events.send(TargetEvent::Changed(self.snapshots()));
    }

    async fn handle_detached(
        &mut self,
        target_id: Option<TargetId>,
        session_id: Option<SessionId>,
    ) {
        let resolved = target_id.or_else(|| {
            session_id
                .as_ref()
                .and_then(|sid| self.by_session.get(sid).cloned())
        });
        let Some(target_id) = resolved else {
            tracing::debug!("detached notification without a resolvable target");
            return;
        };

        let Some((state, session_id)) = self
            .targets
            .get(&target_id)
            .map(|t| (t.state, t.session_id.clone()))
        else {
            self.discovered.remove(&target_id);
            return;
        };

        // Children first, so consumers never observe an orphan.
        for id in self.collect_subtree(&target_id) {
            self.remove_target(&id);
        }

        // Acknowledge unless the detach was initiated through this
        // manager (in which case the detach command already went out).
        if state != TargetState::Detaching {
            if let Err(e) = self.backend.detach_from_target(&session_id).await {
                tracing::debug!(target = %target_id, "detach acknowledgment failed: {e}");
            }
        }

        self.close_if_empty().await;
    }

    async fn handle_detach_request(&mut self, target_id: &TargetId) {
        let Some(target) = self.targets.get_mut(target_id) else {
            tracing::debug!(target = %target_id, "detach requested for unknown target");
            return;
        };
        if target.state == TargetState::Detaching {
            return;
        }
        let session_id = target.session_id.clone();
        target.state = TargetState::Detaching;

        if let Err(e) = self.backend.detach_from_target(&session_id).await {
            tracing::warn!(target = %target_id, "detach failed: {e}");
            if let Some(target) = self.targets.get_mut(target_id) {
                target.state = TargetState::Attached;
            }
        }
        // Removal happens when the detached notification arrives.
    }

    async fn handle_resume(&mut self, target_id: &TargetId) {
        let Some(target) = self.targets.get(target_id) else {
            return;
        };
        if target.state != TargetState::AttachedWaitingForDebugger {
            return;
        }
        let session_id = target.session_id.clone();
        match self.backend.resume(&session_id).await {
            Ok(()) => {
                if let Some(target) = self.targets.get_mut(target_id) {
                    target.waiting_for_debugger = false;
                    target.state = TargetState::Attached;
                }
            }
            Err(e) => tracing::warn!(target = %target_id, "resume failed: {e}"),
        }
    }

    /// Subtree ids in children-before-parents order.
    fn collect_subtree(&self, root: &TargetId) -> Vec<TargetId> {
        let mut preorder = Vec::new();
        let mut stack = vec![root.clone()];
        while let Some(id) = stack.pop() {
            if let Some(target) = self.targets.get(&id) {
                stack.extend(target.children.iter().cloned());
            }
            preorder.push(id);
        }
        preorder.reverse();
        preorder
    }

    fn remove_target(&mut self, target_id: &TargetId) {
        let Some(mut target) = self.targets.remove(target_id) else {
            return;
        };
        self.by_session.remove(&target.session_id);
        self.discovered.remove(target_id);
        if let Some(parent_id) = &target.parent_id {
            if let Some(parent) = self.targets.get_mut(parent_id) {
                parent.children.retain(|c| c != target_id);
            }
        }
        target.state = TargetState::Detached;
        tracing::info!(target = %target_id, "target removed");
        let _ = self.events.send(TargetEvent::Removed(target.snapshot()));
    }

    async fn close_if_empty(&mut self) {
        if !self.targets.is_empty() || !self.config.owns_debuggee {
            return;
        }
        tracing::info!("last target gone, closing debuggee");
        if let Err(e) = self.backend.close_debuggee().await {
            tracing::warn!("failed to close debuggee: {e}");
        }
    }

    async fn dispose(&mut self) {
        tracing::debug!("disposing target manager ({} targets)", self.targets.len());
        let roots: Vec<TargetId> = self
            .targets
            .values()
            .filter(|t| t.parent_id.is_none())
            .map(|t| t.info.target_id.clone())
            .collect();

        for root in roots {
            for id in self.collect_subtree(&root) {
                let session_id = self.targets.get(&id).map(|t| t.session_id.clone());
                self.remove_target(&id);
                if let Some(session_id) = session_id {
                    if let Err(e) = self.backend.detach_from_target(&session_id).await {
                        tracing::debug!(target = %id, "detach during dispose failed: {e}");
                    }
                }
            }
        }

        // Anything left had a parent we never tracked; sweep it too.
        let leftovers: Vec<TargetId> = self.targets.keys().cloned().collect();
        for id in leftovers {
            self.remove_target(&id);
        }

        if self.config.owns_debuggee {
            if let Err(e) = self.backend.close_debuggee().await {
                tracing::warn!("failed to close debuggee: {e}");
            }
        }
    }

    fn snapshots(&self) -> Vec<TargetSnapshot> {
        let mut all: Vec<TargetSnapshot> = self.targets.values().map(|t| t.snapshot()).collect();
        all.sort_by(|a, b| a.info.target_id.cmp(&b.info.target_id));
        all
    }
}
