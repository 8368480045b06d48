//! Ancestry checks over a flat node list.
//!
//! # Invariants
//! - Walks never loop: each id is visited at most once, so pre-existing
//!   cyclic corruption terminates the walk instead of hanging it.

use crate::model::document::{DocumentNode, NodeId};
use std::collections::{HashMap, HashSet};

/// Returns whether `candidate_ancestor_id` appears on the parent chain that
/// starts at `node_id` (the start node included).
///
/// The walk stops at a parentless node, at an id missing from `all_nodes`,
/// or at the first revisited id; all three return `false`.
pub fn is_descendant(
    candidate_ancestor_id: NodeId,
    node_id: NodeId,
    all_nodes: &[DocumentNode],
) -> bool {
    let parents: HashMap<NodeId, Option<NodeId>> = all_nodes
        .iter()
        .map(|node| (node.id, node.parent_id))
        .collect();

    let mut visited = HashSet::new();
    let mut cursor = Some(node_id);
    while let Some(current) = cursor {
        if current == candidate_ancestor_id {
            return true;
        }
        if !visited.insert(current) {
            return false;
        }
        cursor = parents.get(&current).copied().flatten();
    }
    false
}

/// Collects every descendant of `root_id`, deepest first.
///
/// Each node appears after all of its own descendants, so deleting in the
/// returned order never leaves a child whose parent is already gone. The root
/// itself is not included.
pub fn collect_descendants(root_id: NodeId, all_nodes: &[DocumentNode]) -> Vec<NodeId> {
    let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for node in all_nodes {
        if let Some(parent_id) = node.parent_id {
            children.entry(parent_id).or_default().push(node.id);
        }
    }

    let mut preorder = Vec::new();
    let mut visited = HashSet::from([root_id]);
    let mut stack: Vec<NodeId> = children.get(&root_id).cloned().unwrap_or_default();
    while let Some(current) = stack.pop() {
        if !visited.insert(current) {
            continue;
        }
        preorder.push(current);
        if let Some(grandchildren) = children.get(&current) {
            stack.extend(grandchildren.iter().copied());
        }
    }
    preorder.reverse();
    preorder
}
