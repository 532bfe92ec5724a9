//! Typed error hierarchy for the engine.
//!
//! Tree and broker errors are contract violations. Collaborator errors are
//! recovered per node by the orchestrator; only [`EngineError`] ever reaches
//! the caller of a session loop.

use crate::core::status::NodeStatus;
use crate::core::types::{NodeId, SessionId, ToolCallId};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("tree already has a root")]
    AlreadyInitialized,
    #[error("unknown node '{0}'")]
    UnknownNode(NodeId),
    #[error("illegal transition for node '{node}': {from} -> {to}")]
    IllegalTransition {
        node: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },
    #[error("unknown tool call '{tool_call}' on node '{node}'")]
    UnknownToolCall { node: NodeId, tool_call: ToolCallId },
    #[error("execution result already set for node '{0}'")]
    ResultAlreadySet(NodeId),
    #[error("invalid snapshot: {}", .0.join("; "))]
    InvalidSnapshot(Vec<String>),
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval already registered for tool call '{0}'")]
    DuplicateApproval(ToolCallId),
    #[error("approval for tool call '{0}' already resolved")]
    AlreadyResolved(ToolCallId),
    #[error("no approval registered for tool call '{0}'")]
    UnknownApproval(ToolCallId),
    #[error("approval for tool call '{0}' is already being awaited")]
    AlreadyAwaited(ToolCallId),
}

/// Failures reported by the planner or executor collaborators.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("planning failed: {0}")]
    Planning(String),
    #[error("tool extraction failed: {0}")]
    ToolExtraction(String),
    #[error("tool validation failed: {0}")]
    ToolValidation(String),
    #[error("tool execution failed: {0}")]
    ToolExecution(String),
}

impl CollaboratorError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Planning(_) => "planning",
            Self::ToolExtraction(_) => "tool_extraction",
            Self::ToolValidation(_) => "tool_validation",
            Self::ToolExecution(_) => "tool_execution",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error("unknown session '{0}'")]
    UnknownSession(SessionId),
    #[error("session '{0}' already exists")]
    DuplicateSession(SessionId),
}

impl EngineError {
    /// Fatal errors abort the session loop instead of failing one node.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Tree(TreeError::IllegalTransition { .. }) | Self::Tree(TreeError::UnknownNode(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn illegal_transition_message_names_states() {
        let err = TreeError::IllegalTransition {
            node: NodeId::from("node_1"),
            from: NodeStatus::Completed,
            to: NodeStatus::Executing,
        };
        assert_eq!(
            err.to_string(),
            "illegal transition for node 'node_1': completed -> executing"
        );
    }

    #[test]
    fn invalid_snapshot_joins_messages() {
        let err = TreeError::InvalidSnapshot(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(err.to_string(), "invalid snapshot: a; b");
    }

    #[test]
    fn fatal_classification() {
        let illegal = EngineError::from(TreeError::IllegalTransition {
            node: NodeId::from("n"),
            from: NodeStatus::Stub,
            to: NodeStatus::Completed,
        });
        assert!(illegal.is_fatal());

        let planning = EngineError::from(CollaboratorError::Planning("boom".into()));
        assert!(!planning.is_fatal());
        assert_eq!(
            CollaboratorError::ToolValidation("bad".into()).error_kind(),
            "tool_validation"
        );
    }
}
