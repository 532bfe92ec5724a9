//! Helpers for rendering deterministic node paths.

use crate::core::types::NodeId;
use crate::tree::NodeTree;

/// Return the `/`-separated id path to `target`, rooted at the tree root.
pub fn node_path(tree: &NodeTree, target: &NodeId) -> Option<String> {
    let node = tree.get(target)?;
    let mut path: Vec<&str> = tree
        .ancestors(target)
        .ok()?
        .into_iter()
        .map(|ancestor| ancestor.id.as_str())
        .collect();
    path.reverse();
    path.push(node.id.as_str());
    Some(path.join("/"))
}
