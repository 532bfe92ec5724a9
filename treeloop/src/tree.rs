//! The node tree: an arena of work items with a strict status lifecycle.
//!
//! The tree owns every node. Parents refer to children by id and children
//! refer back to their parent by id only, so there is no ownership cycle.
//! All status changes go through [`NodeTree::update_status`], which consults
//! the central transition table.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::invariants::validate_snapshot;
use crate::core::status::{NodeStatus, is_legal_transition};
use crate::core::types::{NodeId, ToolCall, ToolCallId, ToolCallRecord, ToolResult};
use crate::error::TreeError;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    /// Opaque content (code or text) the node represents.
    pub payload: String,
    /// Human-readable purpose.
    pub intent: String,
    pub status: NodeStatus,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub depth: u32,
    pub tool_calls: Vec<ToolCallRecord>,
    pub approval_required: bool,
    pub approved: bool,
    pub execution_result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    fn new(payload: String, intent: String, parent: Option<NodeId>, depth: u32) -> Self {
        let now = Utc::now();
        Self {
            id: NodeId::generate(),
            payload,
            intent,
            status: NodeStatus::Stub,
            parent,
            children: Vec::new(),
            depth,
            tool_calls: Vec::new(),
            approval_required: false,
            approved: false,
            execution_result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    fn record_mut(&mut self, tool_call: &ToolCallId) -> Result<&mut ToolCallRecord, TreeError> {
        let node = self.id.clone();
        self.tool_calls
            .iter_mut()
            .find(|record| &record.call.id == tool_call)
            .ok_or_else(|| TreeError::UnknownToolCall {
                node,
                tool_call: tool_call.clone(),
            })
    }
}

/// Immutable point-in-time copy of a tree.
///
/// Nodes are listed in creation order; edges are carried by each node's
/// `parent` and `children` ids.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TreeSnapshot {
    pub root_id: Option<NodeId>,
    pub nodes: Vec<Node>,
    pub taken_at: DateTime<Utc>,
}

impl TreeSnapshot {
    pub fn empty() -> Self {
        Self {
            root_id: None,
            nodes: Vec::new(),
            taken_at: Utc::now(),
        }
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|node| &node.id == id)
    }
}

#[derive(Debug, Default)]
pub struct NodeTree {
    root: Option<NodeId>,
    nodes: Vec<Node>,
    index: HashMap<NodeId, usize>,
}

impl NodeTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn root(&self) -> Option<&Node> {
        self.root.as_ref().and_then(|id| self.get(id))
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.index.get(id).map(|&slot| &self.nodes[slot])
    }

    /// Like [`get`](Self::get) but reports unknown ids as errors.
    pub fn node(&self, id: &NodeId) -> Result<&Node, TreeError> {
        self.get(id).ok_or_else(|| TreeError::UnknownNode(id.clone()))
    }

    /// All nodes in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Children of `id` in creation order.
    pub fn children(&self, id: &NodeId) -> impl Iterator<Item = &Node> {
        self.get(id)
            .into_iter()
            .flat_map(|node| node.children.iter())
            .filter_map(|child| self.get(child))
    }

    /// Ancestors of `id`, nearest parent first.
    pub fn ancestors(&self, id: &NodeId) -> Result<Vec<&Node>, TreeError> {
        let mut ancestors = Vec::new();
        let mut current = self.node(id)?.parent.as_ref();
        while let Some(parent_id) = current {
            let parent = self.node(parent_id)?;
            ancestors.push(parent);
            current = parent.parent.as_ref();
        }
        Ok(ancestors)
    }

    pub fn create_root(
        &mut self,
        payload: impl Into<String>,
        intent: impl Into<String>,
    ) -> Result<&Node, TreeError> {
        if self.root.is_some() {
            return Err(TreeError::AlreadyInitialized);
        }
        let node = Node::new(payload.into(), intent.into(), None, 0);
        self.root = Some(node.id.clone());
        Ok(self.insert(node))
    }

    /// Append a new `stub` child to `parent`.
    pub fn add_node(
        &mut self,
        parent: &NodeId,
        payload: impl Into<String>,
        intent: impl Into<String>,
    ) -> Result<&Node, TreeError> {
        let depth = self.node(parent)?.depth + 1;
        let node = Node::new(payload.into(), intent.into(), Some(parent.clone()), depth);
        let child_id = node.id.clone();
        self.node_mut(parent)?.children.push(child_id);
        Ok(self.insert(node))
    }

    /// Apply a legal transition and return the prior status.
    ///
    /// Illegal transitions leave the node untouched.
    pub fn update_status(&mut self, id: &NodeId, to: NodeStatus) -> Result<NodeStatus, TreeError> {
        let node = self.node_mut(id)?;
        let from = node.status;
        if !is_legal_transition(from, to) {
            return Err(TreeError::IllegalTransition {
                node: id.clone(),
                from,
                to,
            });
        }
        node.status = to;
        node.updated_at = Utc::now().max(node.updated_at);
        Ok(from)
    }

    /// Append a tool call to the node's record list.
    pub fn attach_tool_call(&mut self, id: &NodeId, call: ToolCall) -> Result<(), TreeError> {
        self.node_mut(id)?.tool_calls.push(ToolCallRecord::new(call));
        Ok(())
    }

    pub fn mark_approval_required(&mut self, id: &NodeId) -> Result<(), TreeError> {
        self.node_mut(id)?.approval_required = true;
        Ok(())
    }

    pub fn mark_approved(&mut self, id: &NodeId, tool_call: &ToolCallId) -> Result<(), TreeError> {
        let node = self.node_mut(id)?;
        node.record_mut(tool_call)?.approved = true;
        node.approved = true;
        Ok(())
    }

    pub fn record_tool_result(
        &mut self,
        id: &NodeId,
        tool_call: &ToolCallId,
        result: ToolResult,
    ) -> Result<(), TreeError> {
        self.node_mut(id)?.record_mut(tool_call)?.result = Some(result);
        Ok(())
    }

    /// Set the node's execution result. A result can be set once.
    pub fn set_execution_result(&mut self, id: &NodeId, result: Value) -> Result<(), TreeError> {
        let node = self.node_mut(id)?;
        if node.execution_result.is_some() {
            return Err(TreeError::ResultAlreadySet(id.clone()));
        }
        node.execution_result = Some(result);
        Ok(())
    }

    pub fn set_error(&mut self, id: &NodeId, message: impl Into<String>) -> Result<(), TreeError> {
        self.node_mut(id)?.error = Some(message.into());
        Ok(())
    }

    /// Deep copy of every node and edge, detached from this tree.
    pub fn export_snapshot(&self) -> TreeSnapshot {
        TreeSnapshot {
            root_id: self.root.clone(),
            nodes: self.nodes.clone(),
            taken_at: Utc::now(),
        }
    }

    /// Rebuild a tree from a snapshot, rejecting snapshots that break the
    /// tree invariants.
    pub fn from_snapshot(snapshot: &TreeSnapshot) -> Result<Self, TreeError> {
        let errors = validate_snapshot(snapshot);
        if !errors.is_empty() {
            return Err(TreeError::InvalidSnapshot(errors));
        }
        let mut tree = Self {
            root: snapshot.root_id.clone(),
            ..Self::default()
        };
        for node in &snapshot.nodes {
            tree.insert(node.clone());
        }
        Ok(tree)
    }

    fn insert(&mut self, node: Node) -> &Node {
        let slot = self.nodes.len();
        self.index.insert(node.id.clone(), slot);
        self.nodes.push(node);
        &self.nodes[slot]
    }

    fn node_mut(&mut self, id: &NodeId) -> Result<&mut Node, TreeError> {
        match self.index.get(id) {
            Some(&slot) => Ok(&mut self.nodes[slot]),
            None => Err(TreeError::UnknownNode(id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::tool_call;
    use serde_json::json;

    fn two_level_tree() -> (NodeTree, NodeId, NodeId, NodeId) {
        let mut tree = NodeTree::new();
        let root = tree.create_root("solve()", "root").expect("root").id.clone();
        let a = tree.add_node(&root, "a()", "a").expect("a").id.clone();
        let b = tree.add_node(&root, "b()", "b").expect("b").id.clone();
        (tree, root, a, b)
    }

    #[test]
    fn create_root_starts_as_stub_at_depth_zero() {
        let mut tree = NodeTree::new();
        assert!(tree.is_empty());
        let root = tree.create_root("code", "intent").expect("root");
        assert_eq!(root.status, NodeStatus::Stub);
        assert_eq!(root.depth, 0);
        assert!(root.is_root());
        assert!(!tree.is_empty());
    }

    #[test]
    fn second_root_is_rejected() {
        let mut tree = NodeTree::new();
        tree.create_root("code", "intent").expect("root");
        assert_eq!(
            tree.create_root("again", "again").unwrap_err(),
            TreeError::AlreadyInitialized
        );
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn add_node_links_parent_and_child() {
        let (tree, root, a, b) = two_level_tree();
        let root_node = tree.get(&root).expect("root");
        assert_eq!(root_node.children, vec![a.clone(), b.clone()]);
        let a_node = tree.get(&a).expect("a");
        assert_eq!(a_node.parent.as_ref(), Some(&root));
        assert_eq!(a_node.depth, 1);
        assert_eq!(a_node.status, NodeStatus::Stub);
        let ids: Vec<_> = tree.children(&root).map(|n| n.id.clone()).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn add_node_to_unknown_parent_fails() {
        let (mut tree, ..) = two_level_tree();
        let missing = NodeId::from("node_missing");
        assert_eq!(
            tree.add_node(&missing, "x", "x").unwrap_err(),
            TreeError::UnknownNode(missing)
        );
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn update_status_returns_prior_and_refreshes_timestamp() {
        let (mut tree, root, ..) = two_level_tree();
        let before = tree.get(&root).expect("root").updated_at;
        let prior = tree
            .update_status(&root, NodeStatus::Planning)
            .expect("transition");
        assert_eq!(prior, NodeStatus::Stub);
        let node = tree.get(&root).expect("root");
        assert_eq!(node.status, NodeStatus::Planning);
        assert!(node.updated_at >= before);
    }

    #[test]
    fn illegal_transition_leaves_state_unchanged() {
        let (mut tree, root, ..) = two_level_tree();
        let before = tree.get(&root).expect("root").clone();
        let err = tree
            .update_status(&root, NodeStatus::Completed)
            .unwrap_err();
        assert_eq!(
            err,
            TreeError::IllegalTransition {
                node: root.clone(),
                from: NodeStatus::Stub,
                to: NodeStatus::Completed,
            }
        );
        assert_eq!(tree.get(&root).expect("root"), &before);
    }

    #[test]
    fn ancestors_are_nearest_first() {
        let (mut tree, root, a, _) = two_level_tree();
        let a1 = tree.add_node(&a, "a1()", "a1").expect("a1").id.clone();
        let ids: Vec<_> = tree
            .ancestors(&a1)
            .expect("ancestors")
            .into_iter()
            .map(|n| n.id.clone())
            .collect();
        assert_eq!(ids, vec![a, root]);
        assert_eq!(tree.get(&a1).expect("a1").depth, 2);
    }

    #[test]
    fn tool_call_records_are_appended_in_order() {
        let (mut tree, _, a, _) = two_level_tree();
        let first = tool_call("first", false);
        let second = tool_call("second", true);
        tree.attach_tool_call(&a, first.clone()).expect("attach");
        tree.attach_tool_call(&a, second.clone()).expect("attach");
        tree.mark_approved(&a, &second.id).expect("approve");
        tree.record_tool_result(&a, &first.id, ToolResult::ok(json!(1)))
            .expect("record");

        let node = tree.get(&a).expect("a");
        let names: Vec<_> = node.tool_calls.iter().map(|r| r.call.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert!(node.tool_calls[0].result.is_some());
        assert!(node.tool_calls[1].approved);
        assert!(node.approved);
    }

    #[test]
    fn unknown_tool_call_is_reported() {
        let (mut tree, _, a, _) = two_level_tree();
        let missing = ToolCallId::from("tool_missing");
        assert!(matches!(
            tree.mark_approved(&a, &missing),
            Err(TreeError::UnknownToolCall { .. })
        ));
    }

    #[test]
    fn execution_result_is_set_once() {
        let (mut tree, _, a, _) = two_level_tree();
        tree.set_execution_result(&a, json!("first")).expect("set");
        assert_eq!(
            tree.set_execution_result(&a, json!("second")).unwrap_err(),
            TreeError::ResultAlreadySet(a.clone())
        );
        assert_eq!(
            tree.get(&a).expect("a").execution_result,
            Some(json!("first"))
        );
    }

    #[test]
    fn snapshot_is_detached_from_the_live_tree() {
        let (mut tree, root, ..) = two_level_tree();
        let snapshot = tree.export_snapshot();
        tree.update_status(&root, NodeStatus::Planning)
            .expect("transition");
        assert_eq!(
            snapshot.node(&root).expect("root").status,
            NodeStatus::Stub
        );
    }

    #[test]
    fn snapshot_round_trip_preserves_nodes_and_edges() {
        let (mut tree, root, a, _) = two_level_tree();
        tree.update_status(&root, NodeStatus::Planning)
            .expect("transition");
        tree.update_status(&root, NodeStatus::Planned)
            .expect("transition");
        tree.attach_tool_call(&a, tool_call("ask", false))
            .expect("attach");

        let snapshot = tree.export_snapshot();
        let json = serde_json::to_string(&snapshot).expect("serialize");
        let decoded: TreeSnapshot = serde_json::from_str(&json).expect("deserialize");
        let rebuilt = NodeTree::from_snapshot(&decoded).expect("rebuild");

        assert_eq!(rebuilt.root().map(|n| &n.id), Some(&root));
        let original: Vec<_> = tree.nodes().cloned().collect();
        let restored: Vec<_> = rebuilt.nodes().cloned().collect();
        assert_eq!(original, restored);
    }

    #[test]
    fn from_snapshot_rejects_broken_edges() {
        let (tree, _, a, _) = two_level_tree();
        let mut snapshot = tree.export_snapshot();
        for node in &mut snapshot.nodes {
            if node.id == a {
                node.depth = 5;
            }
        }
        let err = NodeTree::from_snapshot(&snapshot).unwrap_err();
        assert!(matches!(
            err,
            TreeError::InvalidSnapshot(ref errors) if errors.iter().any(|e| e.contains("depth"))
        ));
    }
}
