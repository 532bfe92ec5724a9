//! Validation of exported snapshot files.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::selector::{is_complete, suspended_on};
use crate::core::status::NodeStatus;
use crate::core::types::{NodeId, ToolCallId};
use crate::io::snapshot_store::load_snapshot;
use crate::tree::NodeTree;

/// Summary of a valid snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidateOutcome {
    pub root_id: Option<NodeId>,
    pub node_count: usize,
    pub complete: bool,
    pub statuses: BTreeMap<&'static str, usize>,
    /// The tool call the session was waiting on when the snapshot was taken.
    pub suspended_on: Option<(NodeId, ToolCallId)>,
}

/// Check a snapshot file against the schema and the tree invariants.
pub fn validate_snapshot_file(path: &Path) -> Result<ValidateOutcome> {
    let snapshot = load_snapshot(path)?;
    let tree = NodeTree::from_snapshot(&snapshot)
        .with_context(|| format!("rebuild tree from {}", path.display()))?;

    let mut statuses = BTreeMap::new();
    for node in tree.nodes() {
        *statuses.entry(node.status.label()).or_insert(0) += 1;
    }

    Ok(ValidateOutcome {
        root_id: tree.root().map(|root| root.id.clone()),
        node_count: tree.len(),
        complete: is_complete(&tree),
        statuses,
        suspended_on: suspended_on(&tree),
    })
}

impl ValidateOutcome {
    pub fn count(&self, status: NodeStatus) -> usize {
        self.statuses.get(status.label()).copied().unwrap_or(0)
    }
}
