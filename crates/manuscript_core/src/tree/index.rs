//! In-memory parent→children index over a flat node list.
//!
//! # Responsibility
//! - Group nodes by parent with deterministic sibling ordering.
//! - Compute aggregate word counts and visible rows on read.
//!
//! # Invariants
//! - Sibling order is `order ASC, created_at ASC, id ASC`.
//! - Building an index has no side effects; empty input yields an empty index.
//! - Walks are iterative and visit each node at most once.

use crate::client::view_state::ViewState;
use crate::model::document::{DocumentNode, NodeId};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// Grouping key for children lists. Parentless nodes live under `Root`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParentKey {
    Root,
    Node(NodeId),
}

impl From<Option<NodeId>> for ParentKey {
    fn from(value: Option<NodeId>) -> Self {
        match value {
            Some(id) => ParentKey::Node(id),
            None => ParentKey::Root,
        }
    }
}

/// One rendered row of the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeRow<'a> {
    pub node: &'a DocumentNode,
    pub depth: usize,
    pub has_children: bool,
    pub expanded: bool,
}

/// Read-only index built from a flat node slice.
#[derive(Debug, Clone)]
pub struct TreeIndex<'a> {
    by_id: HashMap<NodeId, &'a DocumentNode>,
    children: HashMap<ParentKey, Vec<&'a DocumentNode>>,
}

impl<'a> TreeIndex<'a> {
    /// Builds the index. Safe to call on every render or request.
    pub fn build(nodes: &'a [DocumentNode]) -> Self {
        let mut by_id = HashMap::with_capacity(nodes.len());
        let mut children: HashMap<ParentKey, Vec<&'a DocumentNode>> = HashMap::new();
        for node in nodes {
            by_id.insert(node.id, node);
            children
                .entry(ParentKey::from(node.parent_id))
                .or_default()
                .push(node);
        }
        for siblings in children.values_mut() {
            siblings.sort_by(|left, right| sibling_order(left, right));
        }
        Self { by_id, children }
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn get(&self, id: NodeId) -> Option<&'a DocumentNode> {
        self.by_id.get(&id).copied()
    }

    /// Sorted root-level nodes.
    pub fn roots(&self) -> &[&'a DocumentNode] {
        self.children_of(ParentKey::Root)
    }

    /// Sorted direct children of `parent` (`None` means root level).
    pub fn children(&self, parent: Option<NodeId>) -> &[&'a DocumentNode] {
        self.children_of(ParentKey::from(parent))
    }

    /// Sorted direct children under one grouping key.
    pub fn children_of(&self, key: ParentKey) -> &[&'a DocumentNode] {
        self.children.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Sum of the node's own word count and all descendants' counts.
    ///
    /// Returns `0` for unknown ids.
    pub fn aggregate_word_count(&self, id: NodeId) -> u64 {
        let Some(start) = self.get(id) else {
            return 0;
        };
        let mut total = 0_u64;
        let mut visited = HashSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if !visited.insert(node.id) {
                continue;
            }
            total += u64::from(node.word_count);
            stack.extend(self.children(Some(node.id)).iter().copied());
        }
        total
    }

    /// Aggregate word counts for every indexed node.
    pub fn aggregate_word_counts(&self) -> HashMap<NodeId, u64> {
        self.by_id
            .keys()
            .map(|id| (*id, self.aggregate_word_count(*id)))
            .collect()
    }

    /// Depth-first rows visible under the given view state.
    ///
    /// Children are only emitted for expanded containers.
    pub fn visible_rows(&self, view: &ViewState) -> Vec<TreeRow<'a>> {
        let mut rows = Vec::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<(&'a DocumentNode, usize)> =
            self.roots().iter().rev().map(|node| (*node, 0)).collect();
        while let Some((node, depth)) = stack.pop() {
            if !visited.insert(node.id) {
                continue;
            }
            let children = self.children(Some(node.id));
            let expanded = view.is_expanded(node.id);
            rows.push(TreeRow {
                node,
                depth,
                has_children: !children.is_empty(),
                expanded,
            });
            if expanded {
                stack.extend(children.iter().rev().map(|child| (*child, depth + 1)));
            }
        }
        rows
    }

    /// Parent→children edges, used to compare tree shapes.
    pub fn edges(&self) -> Vec<(Option<NodeId>, NodeId)> {
        let mut edges: Vec<_> = self
            .by_id
            .values()
            .map(|node| (node.parent_id, node.id))
            .collect();
        edges.sort();
        edges
    }
}

fn sibling_order(left: &DocumentNode, right: &DocumentNode) -> Ordering {
    left.order
        .cmp(&right.order)
        .then(left.created_at.cmp(&right.created_at))
        .then(left.id.cmp(&right.id))
}
