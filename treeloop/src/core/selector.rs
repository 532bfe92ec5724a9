//! Deterministic selection logic for the node tree.

use crate::core::status::NodeStatus;
use crate::core::types::{NodeId, ToolCallId};
use crate::tree::{Node, NodeTree};

/// Find the first `stub` or `pending` node via depth-first, leftmost-first
/// traversal.
///
/// A selectable node is returned before any of its children are considered.
/// Returns `None` if no node is selectable.
pub fn find_next_pending(tree: &NodeTree) -> Option<&Node> {
    let root = tree.root()?;
    first_selectable(tree, root)
}

fn first_selectable<'a>(tree: &'a NodeTree, node: &'a Node) -> Option<&'a Node> {
    if node.status.is_selectable() {
        return Some(node);
    }

    for child in tree.children(&node.id) {
        if let Some(found) = first_selectable(tree, child) {
            return Some(found);
        }
    }

    None
}

/// Returns true if the tree has a root and every node is settled
/// (no node is stub, planning, pending, waiting for approval or executing).
pub fn is_complete(tree: &NodeTree) -> bool {
    !tree.is_empty() && tree.nodes().all(|node| !node.status.is_outstanding())
}

/// The node and tool call a session is suspended on, if any.
///
/// Calls run in order, so this is the first tool-call record without a
/// result on a node that is waiting for approval.
pub fn suspended_on(tree: &NodeTree) -> Option<(NodeId, ToolCallId)> {
    tree.nodes()
        .filter(|node| node.status == NodeStatus::WaitingApproval)
        .find_map(|node| {
            node.tool_calls
                .iter()
                .find(|record| record.result.is_none())
                .map(|record| (node.id.clone(), record.call.id.clone()))
        })
}
