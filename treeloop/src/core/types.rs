//! Shared deterministic types for the engine core.
//!
//! These types define stable contracts between the tree, the selector, the
//! orchestrator and the collaborators. They carry no I/O and serialize to the
//! same JSON shape that snapshots and events use.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh id with a short random suffix.
            pub fn generate() -> Self {
                let hex = Uuid::new_v4().simple().to_string();
                Self(format!(concat!($prefix, "_{}"), &hex[..8]))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier of a node within one tree.
    NodeId,
    "node"
);
string_id!(
    /// Identifier of a single tool call, unique per session.
    ToolCallId,
    "tool"
);
string_id!(
    /// Identifier of an orchestration session.
    SessionId,
    "session"
);

/// A request to perform a side-effecting operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: ToolCallId,
    pub name: String,
    pub args: Value,
    pub requires_approval: bool,
    /// Human-readable description shown on approval prompts.
    pub description: String,
}

/// Outcome of executing a tool call.
///
/// When `task_id` is set, `success=true` means the external task was
/// submitted, not that it finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
            task_id: None,
            error: None,
        }
    }

    pub fn submitted(task_id: impl Into<String>, output: Value) -> Self {
        Self {
            success: true,
            output,
            task_id: Some(task_id.into()),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            task_id: None,
            error: Some(error.into()),
        }
    }
}

/// A tool call attached to a node, plus what happened to it.
///
/// `result` is `None` until the call has been executed. A record without a
/// result on a node in `WAITING_APPROVAL` is the call the orchestrator is
/// suspended on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub call: ToolCall,
    #[serde(default)]
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
}

impl ToolCallRecord {
    pub fn new(call: ToolCall) -> Self {
        Self {
            call,
            approved: false,
            result: None,
        }
    }
}
