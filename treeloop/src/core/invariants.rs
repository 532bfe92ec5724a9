//! Structural invariants of a tree snapshot.

use std::collections::{HashMap, HashSet};

use crate::core::status::NodeStatus;
use crate::core::types::NodeId;
use crate::tree::{Node, TreeSnapshot};

/// Check structural invariants of a snapshot:
/// - No duplicate ids
/// - Exactly one root, listed as `root_id`, at depth 0
/// - Every child points back to the parent that lists it, exactly once
/// - `depth == parent.depth + 1`
/// - Every node is reachable from the root (no orphans, no cycles)
/// - Approval flags agree with the status
/// - An execution result only exists on a settled node
///
/// Returns stable error messages (empty on success).
pub fn validate_snapshot(snapshot: &TreeSnapshot) -> Vec<String> {
    let mut errors = Vec::new();

    let mut by_id: HashMap<&NodeId, &Node> = HashMap::new();
    for node in &snapshot.nodes {
        if by_id.insert(&node.id, node).is_some() {
            errors.push(format!("duplicate id '{}'", node.id));
        }
    }

    let Some(root_id) = snapshot.root_id.as_ref() else {
        if !snapshot.nodes.is_empty() {
            errors.push("snapshot has nodes but no root".to_string());
        }
        return errors;
    };

    let Some(root) = by_id.get(root_id) else {
        errors.push(format!("root '{}' missing from nodes", root_id));
        return errors;
    };
    if root.parent.is_some() {
        errors.push(format!("root '{}' must not have a parent", root_id));
    }
    if root.depth != 0 {
        errors.push(format!("root '{}': depth {} must be 0", root_id, root.depth));
    }

    for node in &snapshot.nodes {
        if &node.id != root_id && node.parent.is_none() {
            errors.push(format!("node '{}' has no parent but is not the root", node.id));
        }
        if let Some(parent_id) = &node.parent {
            check_parent_link(node, parent_id, &by_id, &mut errors);
        }
        check_children(node, &by_id, &mut errors);
        check_flags(node, &mut errors);
    }

    let mut visited = HashSet::new();
    visit(root_id, &by_id, &mut visited, &mut errors);
    for node in &snapshot.nodes {
        if !visited.contains(&node.id) {
            errors.push(format!("node '{}' is not reachable from the root", node.id));
        }
    }

    errors
}

fn check_parent_link(
    node: &Node,
    parent_id: &NodeId,
    by_id: &HashMap<&NodeId, &Node>,
    errors: &mut Vec<String>,
) {
    let Some(parent) = by_id.get(parent_id) else {
        errors.push(format!(
            "node '{}': parent '{}' missing from nodes",
            node.id, parent_id
        ));
        return;
    };
    let listed = parent.children.iter().filter(|id| *id == &node.id).count();
    if listed != 1 {
        errors.push(format!(
            "node '{}': listed {} times by parent '{}' (expected 1)",
            node.id, listed, parent_id
        ));
    }
    if node.depth != parent.depth + 1 {
        errors.push(format!(
            "node '{}': depth {} does not follow parent depth {}",
            node.id, node.depth, parent.depth
        ));
    }
}

fn check_children(node: &Node, by_id: &HashMap<&NodeId, &Node>, errors: &mut Vec<String>) {
    for child_id in &node.children {
        match by_id.get(child_id) {
            None => errors.push(format!(
                "node '{}': child '{}' missing from nodes",
                node.id, child_id
            )),
            Some(child) if child.parent.as_ref() != Some(&node.id) => errors.push(format!(
                "node '{}': child '{}' does not point back to it",
                node.id, child_id
            )),
            Some(_) => {}
        }
    }
}

fn check_flags(node: &Node, errors: &mut Vec<String>) {
    let gated = matches!(
        node.status,
        NodeStatus::WaitingApproval | NodeStatus::Approved
    );
    if (node.approved || gated) && !node.approval_required {
        errors.push(format!(
            "node '{}': {} without approval_required",
            node.id,
            if node.approved { "approved" } else { node.status.label() }
        ));
    }
    let settled = matches!(
        node.status,
        NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Rejected
    );
    if node.execution_result.is_some() && !settled {
        errors.push(format!(
            "node '{}': execution_result set while {}",
            node.id, node.status
        ));
    }
}

fn visit<'a>(
    id: &'a NodeId,
    by_id: &HashMap<&'a NodeId, &'a Node>,
    visited: &mut HashSet<&'a NodeId>,
    errors: &mut Vec<String>,
) {
    if !visited.insert(id) {
        errors.push(format!("cycle detected at node '{}'", id));
        return;
    }
    let Some(&node) = by_id.get(id) else {
        return;
    };
    for child in &node.children {
        visit(child, by_id, visited, errors);
    }
}
