//! Node lifecycle states and the legal transition table.
//!
//! Every status change in a tree goes through [`is_legal_transition`]; nothing
//! else in the crate decides which transitions are allowed.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Created, awaiting expansion.
    Stub,
    Planning,
    Planned,
    /// Concrete, awaiting execution.
    Pending,
    WaitingApproval,
    Approved,
    Executing,
    Completed,
    Rejected,
    Failed,
}

/// `(from, to)` pairs the tree accepts.
pub const TRANSITIONS: &[(NodeStatus, NodeStatus)] = &[
    (NodeStatus::Stub, NodeStatus::Planning),
    (NodeStatus::Planning, NodeStatus::Planned),
    (NodeStatus::Planning, NodeStatus::Failed),
    (NodeStatus::Planned, NodeStatus::Pending),
    (NodeStatus::Pending, NodeStatus::Executing),
    (NodeStatus::Pending, NodeStatus::WaitingApproval),
    (NodeStatus::WaitingApproval, NodeStatus::Approved),
    (NodeStatus::WaitingApproval, NodeStatus::Rejected),
    (NodeStatus::Approved, NodeStatus::Executing),
    (NodeStatus::Executing, NodeStatus::Completed),
    (NodeStatus::Executing, NodeStatus::Failed),
    (NodeStatus::Executing, NodeStatus::WaitingApproval),
];

/// True if `(from, to)` appears in [`TRANSITIONS`].
pub fn is_legal_transition(from: NodeStatus, to: NodeStatus) -> bool {
    TRANSITIONS.contains(&(from, to))
}

impl NodeStatus {
    pub const ALL: [NodeStatus; 10] = [
        NodeStatus::Stub,
        NodeStatus::Planning,
        NodeStatus::Planned,
        NodeStatus::Pending,
        NodeStatus::WaitingApproval,
        NodeStatus::Approved,
        NodeStatus::Executing,
        NodeStatus::Completed,
        NodeStatus::Rejected,
        NodeStatus::Failed,
    ];

    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Rejected | NodeStatus::Failed
        )
    }

    /// States that keep a tree from being complete.
    pub fn is_outstanding(self) -> bool {
        matches!(
            self,
            NodeStatus::Stub
                | NodeStatus::Pending
                | NodeStatus::WaitingApproval
                | NodeStatus::Executing
                | NodeStatus::Planning
        )
    }

    /// States the selector hands to the orchestrator.
    pub fn is_selectable(self) -> bool {
        matches!(self, NodeStatus::Stub | NodeStatus::Pending)
    }

    pub fn label(self) -> &'static str {
        match self {
            NodeStatus::Stub => "stub",
            NodeStatus::Planning => "planning",
            NodeStatus::Planned => "planned",
            NodeStatus::Pending => "pending",
            NodeStatus::WaitingApproval => "waiting_approval",
            NodeStatus::Approved => "approved",
            NodeStatus::Executing => "executing",
            NodeStatus::Completed => "completed",
            NodeStatus::Rejected => "rejected",
            NodeStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
