//! Collaborator interfaces the orchestrator drives.
//!
//! The planner turns intents into code and children; the executor finds and
//! runs tool calls. Both are shared across sessions, so implementations must
//! be `Send + Sync`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::types::{NodeId, ToolCall, ToolResult};
use crate::error::{CollaboratorError, TreeError};
use crate::tree::{Node, NodeTree};

/// Initial plan for a new tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub payload: String,
    pub summary: String,
}

/// One child produced by expanding a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expansion {
    pub payload: String,
    pub intent: String,
}

/// What a planner sees about a node's ancestors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AncestorFrame {
    pub intent: String,
    pub payload: String,
    pub depth: u32,
}

/// Ancestors of a node, root first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AncestorContext {
    pub frames: Vec<AncestorFrame>,
}

impl AncestorContext {
    pub fn for_node(tree: &NodeTree, id: &NodeId) -> Result<Self, TreeError> {
        let mut frames: Vec<_> = tree
            .ancestors(id)?
            .into_iter()
            .map(|node| AncestorFrame {
                intent: node.intent.clone(),
                payload: node.payload.clone(),
                depth: node.depth,
            })
            .collect();
        frames.reverse();
        Ok(Self { frames })
    }

    /// Intents from the root down to the direct parent.
    pub fn intents(&self) -> impl Iterator<Item = &str> {
        self.frames.iter().map(|frame| frame.intent.as_str())
    }
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn create_plan(&self, intent: &str) -> Result<Plan, CollaboratorError>;

    /// Children for `node`. An empty result means the node is concrete.
    async fn expand(
        &self,
        node: &Node,
        context: &AncestorContext,
    ) -> Result<Vec<Expansion>, CollaboratorError>;
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Tool calls in `payload`, in source order.
    async fn extract_tool_calls(&self, payload: &str) -> Result<Vec<ToolCall>, CollaboratorError>;

    async fn execute_tool(&self, call: &ToolCall) -> Result<ToolResult, CollaboratorError>;
}
