//! Session handles and the process-wide session registry.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::approval::{ApprovalBroker, PendingApproval, ResolveOutcome};
use crate::core::types::{SessionId, ToolCallId};
use crate::error::{ApprovalError, EngineError};
use crate::events::{Event, EventEmitter, EventSink, SubscriptionId};
use crate::tree::TreeSnapshot;

/// Everything outside the session loop needs to observe or steer a session.
///
/// Cheap to clone; every clone refers to the same session.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: SessionId,
    broker: Arc<ApprovalBroker>,
    emitter: EventEmitter,
    cancel: CancellationToken,
    snapshots: watch::Receiver<TreeSnapshot>,
}

impl SessionHandle {
    pub(crate) fn new(
        session_id: SessionId,
        broker: Arc<ApprovalBroker>,
        emitter: EventEmitter,
        cancel: CancellationToken,
        snapshots: watch::Receiver<TreeSnapshot>,
    ) -> Self {
        Self {
            session_id,
            broker,
            emitter,
            cancel,
            snapshots,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn resolve_approval(
        &self,
        tool_call_id: &ToolCallId,
        approved: bool,
    ) -> Result<ResolveOutcome, ApprovalError> {
        self.broker.resolve(tool_call_id, approved)
    }

    pub fn pending_approvals(&self) -> Vec<PendingApproval> {
        self.broker.pending()
    }

    /// Stop the session: outstanding approval waits resolve as cancelled and
    /// the loop exits before its next node.
    pub fn cancel(&self) {
        info!(session_id = %self.session_id, "session cancelled");
        self.cancel.cancel();
        self.broker.cancel_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> TreeSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self, sink: Arc<dyn EventSink>) -> SubscriptionId {
        self.emitter.subscribe(sink)
    }

    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<Event>) {
        self.emitter.subscribe_channel()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.emitter.unsubscribe(id)
    }
}

/// Map of live sessions, shared by whatever transport fronts the engine.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: SessionHandle) -> Result<(), EngineError> {
        let id = handle.session_id().clone();
        match self.sessions.entry(id) {
            Entry::Occupied(entry) => Err(EngineError::DuplicateSession(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(handle);
                Ok(())
            }
        }
    }

    pub fn get(&self, session_id: &SessionId) -> Result<SessionHandle, EngineError> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::UnknownSession(session_id.clone()))
    }

    pub fn resolve_approval(
        &self,
        session_id: &SessionId,
        tool_call_id: &ToolCallId,
        approved: bool,
    ) -> Result<ResolveOutcome, EngineError> {
        Ok(self.get(session_id)?.resolve_approval(tool_call_id, approved)?)
    }

    pub fn cancel(&self, session_id: &SessionId) -> Result<(), EngineError> {
        self.get(session_id)?.cancel();
        Ok(())
    }

    pub fn snapshot(&self, session_id: &SessionId) -> Result<TreeSnapshot, EngineError> {
        Ok(self.get(session_id)?.snapshot())
    }

    pub fn remove(&self, session_id: &SessionId) -> Option<SessionHandle> {
        self.sessions.remove(session_id).map(|(_, handle)| handle)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
