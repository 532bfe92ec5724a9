//! Approval broker: per-session registry of human sign-off requests.
//!
//! Each request owns a oneshot channel used only as a wake-up signal. The
//! record's slot, guarded by the broker lock, is the single source of truth
//! for how a request was resolved: whichever of `resolve`, the timeout or
//! cancellation settles the slot first wins, and everyone else observes
//! that outcome.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::types::{NodeId, ToolCallId};
use crate::error::ApprovalError;

/// Why an approval request ended in rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// A human answered no.
    Denied,
    /// Nobody answered before the request's timeout.
    ApprovalTimeout,
    /// The session stopped waiting.
    Cancelled,
}

impl RejectReason {
    pub fn describe(self) -> &'static str {
        match self {
            RejectReason::Denied => "rejected by reviewer",
            RejectReason::ApprovalTimeout => "approval timed out",
            RejectReason::Cancelled => "session cancelled while waiting for approval",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected { reason: RejectReason },
}

impl Decision {
    pub fn is_approved(self) -> bool {
        matches!(self, Decision::Approved)
    }
}

/// Result of a `resolve` call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved,
    /// The wait was cancelled first; the late answer is dropped.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Unresolved,
    Settled(Decision),
    Cancelled,
}

struct ApprovalRecord {
    node_id: NodeId,
    created_at: DateTime<Utc>,
    timeout: Duration,
    slot: Slot,
    wake: Option<oneshot::Sender<()>>,
    wait: Option<oneshot::Receiver<()>>,
}

impl ApprovalRecord {
    /// Settle an unresolved slot and wake the waiter. No-op otherwise.
    fn settle(&mut self, slot: Slot) -> bool {
        if self.slot != Slot::Unresolved {
            return false;
        }
        self.slot = slot;
        if let Some(wake) = self.wake.take() {
            let _ = wake.send(());
        }
        true
    }

    fn outcome(&self) -> Option<Decision> {
        match self.slot {
            Slot::Unresolved => None,
            Slot::Settled(decision) => Some(decision),
            Slot::Cancelled => Some(Decision::Rejected {
                reason: RejectReason::Cancelled,
            }),
        }
    }
}

/// An unresolved approval request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingApproval {
    pub tool_call_id: ToolCallId,
    pub node_id: NodeId,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct ApprovalBroker {
    records: Mutex<HashMap<ToolCallId, ApprovalRecord>>,
}

impl ApprovalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unresolved record for `tool_call_id`.
    pub fn register(
        &self,
        node_id: &NodeId,
        tool_call_id: &ToolCallId,
        timeout: Duration,
    ) -> Result<(), ApprovalError> {
        let mut records = self.records.lock();
        if records.contains_key(tool_call_id) {
            return Err(ApprovalError::DuplicateApproval(tool_call_id.clone()));
        }
        let (wake, wait) = oneshot::channel();
        records.insert(
            tool_call_id.clone(),
            ApprovalRecord {
                node_id: node_id.clone(),
                created_at: Utc::now(),
                timeout,
                slot: Slot::Unresolved,
                wake: Some(wake),
                wait: Some(wait),
            },
        );
        debug!(
            tool_call_id = %tool_call_id,
            node_id = %node_id,
            timeout_ms = timeout.as_millis() as u64,
            "approval registered"
        );
        Ok(())
    }

    /// Wait until the request is resolved, times out, or `cancel` fires.
    ///
    /// Timeouts and cancellation resolve to a rejection; a later `resolve`
    /// reports `AlreadyResolved` after a timeout and is ignored after a
    /// cancellation.
    pub async fn await_resolution(
        &self,
        tool_call_id: &ToolCallId,
        cancel: &CancellationToken,
    ) -> Result<Decision, ApprovalError> {
        let (wait, timeout) = {
            let mut records = self.records.lock();
            let record = records
                .get_mut(tool_call_id)
                .ok_or_else(|| ApprovalError::UnknownApproval(tool_call_id.clone()))?;
            if let Some(decision) = record.outcome() {
                record.wait = None;
                return Ok(decision);
            }
            let wait = record
                .wait
                .take()
                .ok_or_else(|| ApprovalError::AlreadyAwaited(tool_call_id.clone()))?;
            (wait, record.timeout)
        };

        tokio::select! {
            biased;
            _ = wait => {}
            _ = cancel.cancelled() => {
                self.settle(tool_call_id, Slot::Cancelled);
            }
            _ = tokio::time::sleep(timeout) => {
                let timed_out = Slot::Settled(Decision::Rejected {
                    reason: RejectReason::ApprovalTimeout,
                });
                if self.settle(tool_call_id, timed_out) {
                    info!(tool_call_id = %tool_call_id, "approval timed out");
                }
            }
        }

        let records = self.records.lock();
        let decision = records
            .get(tool_call_id)
            .and_then(ApprovalRecord::outcome)
            .unwrap_or(Decision::Rejected {
                reason: RejectReason::Cancelled,
            });
        Ok(decision)
    }

    /// Resolve an unresolved request exactly once.
    pub fn resolve(
        &self,
        tool_call_id: &ToolCallId,
        approved: bool,
    ) -> Result<ResolveOutcome, ApprovalError> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(tool_call_id)
            .ok_or_else(|| ApprovalError::UnknownApproval(tool_call_id.clone()))?;
        match record.slot {
            Slot::Settled(_) => Err(ApprovalError::AlreadyResolved(tool_call_id.clone())),
            Slot::Cancelled => {
                debug!(tool_call_id = %tool_call_id, "late resolution ignored");
                Ok(ResolveOutcome::Ignored)
            }
            Slot::Unresolved => {
                let decision = if approved {
                    Decision::Approved
                } else {
                    Decision::Rejected {
                        reason: RejectReason::Denied,
                    }
                };
                record.settle(Slot::Settled(decision));
                info!(
                    tool_call_id = %tool_call_id,
                    node_id = %record.node_id,
                    approved,
                    "approval resolved"
                );
                Ok(ResolveOutcome::Resolved)
            }
        }
    }

    /// Cancel every unresolved request, waking its waiter.
    pub fn cancel_all(&self) -> usize {
        let mut records = self.records.lock();
        records
            .values_mut()
            .map(|record| record.settle(Slot::Cancelled))
            .filter(|settled| *settled)
            .count()
    }

    /// Unresolved requests, oldest first.
    pub fn pending(&self) -> Vec<PendingApproval> {
        let records = self.records.lock();
        let mut pending: Vec<_> = records
            .iter()
            .filter(|(_, record)| record.slot == Slot::Unresolved)
            .map(|(id, record)| PendingApproval {
                tool_call_id: id.clone(),
                node_id: record.node_id.clone(),
                created_at: record.created_at,
            })
            .collect();
        pending.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.tool_call_id.cmp(&b.tool_call_id))
        });
        pending
    }

    fn settle(&self, tool_call_id: &ToolCallId, slot: Slot) -> bool {
        let mut records = self.records.lock();
        records
            .get_mut(tool_call_id)
            .is_some_and(|record| record.settle(slot))
    }
}
