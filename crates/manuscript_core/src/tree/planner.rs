//! Mutation planning over a flat node list.
//!
//! # Responsibility
//! - Validate create/move/delete requests against tree invariants.
//! - Describe the effect of a mutation without touching any store.
//!
//! # Invariants
//! - Only container kinds become parents.
//! - A move plan changes the moved node's parent and nothing else.
//! - Delete plans list descendants before their ancestors; the target is last.

use crate::error::{InvalidMoveReason, TreeError, TreeResult};
use crate::model::document::{DocumentKind, DocumentNode, NodeId, ProjectId};
use crate::tree::cycle::{collect_descendants, is_descendant};
use once_cell::sync::Lazy;
use regex::Regex;

static WHITESPACE_RUN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

/// Input for a create plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub title: String,
    pub kind: DocumentKind,
    pub project_id: Option<ProjectId>,
    /// Currently selected node, if any. Drives effective parent resolution.
    pub selection: Option<NodeId>,
}

/// Resolved creation: where the new node goes and what it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePlan {
    pub project_id: ProjectId,
    pub parent_id: Option<NodeId>,
    pub kind: DocumentKind,
    /// Normalized title.
    pub title: String,
}

/// Parent change for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovePlan {
    pub node_id: NodeId,
    pub from_parent: Option<NodeId>,
    pub to_parent: Option<NodeId>,
}

/// Subtree removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePlan {
    pub node_id: NodeId,
    /// Every removed id, deepest first, ending with `node_id`.
    pub removed: Vec<NodeId>,
}

impl DeletePlan {
    /// Number of nodes the plan removes, target included.
    pub fn removed_count(&self) -> usize {
        self.removed.len()
    }
}

/// Any planned mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationPlan {
    Create(CreatePlan),
    Move(MovePlan),
    Delete(DeletePlan),
}

impl MutationPlan {
    /// Move and delete are structural; at most one may be in flight per client.
    pub fn is_structural(&self) -> bool {
        matches!(self, MutationPlan::Move(_) | MutationPlan::Delete(_))
    }
}

/// Plans creation of one node relative to the current selection.
///
/// # Errors
/// - `Validation` for a blank title, a missing project, or a selection that
///   belongs to another project.
/// - `NodeNotFound` when the selection is not in `nodes`.
pub fn plan_create(request: &CreateRequest, nodes: &[DocumentNode]) -> TreeResult<CreatePlan> {
    let title = normalize_title(&request.title)?;
    let project_id = request
        .project_id
        .ok_or_else(|| TreeError::Validation("project is required".to_string()))?;

    let parent_id = match request.selection {
        None => None,
        Some(selected_id) => {
            let selected = find(nodes, selected_id)?;
            if selected.project_id != project_id {
                return Err(TreeError::Validation(format!(
                    "selection {selected_id} belongs to another project"
                )));
            }
            if selected.is_container() {
                Some(selected.id)
            } else {
                selected.parent_id
            }
        }
    };

    Ok(CreatePlan {
        project_id,
        parent_id,
        kind: request.kind,
        title,
    })
}

/// Plans a parent change. `new_parent_id == None` moves the node to root level.
///
/// # Errors
/// - `NodeNotFound` when the node or target is unknown.
/// - `InvalidMove` for self-parenting, a leaf target, a cross-project target,
///   or a target inside the node's own subtree.
pub fn plan_move(
    node_id: NodeId,
    new_parent_id: Option<NodeId>,
    nodes: &[DocumentNode],
) -> TreeResult<MovePlan> {
    let node = find(nodes, node_id)?;
    let Some(target_id) = new_parent_id else {
        return Ok(MovePlan {
            node_id,
            from_parent: node.parent_id,
            to_parent: None,
        });
    };

    let reject = |reason| TreeError::InvalidMove {
        node_id,
        target_id: Some(target_id),
        reason,
    };
    if target_id == node_id {
        return Err(reject(InvalidMoveReason::SelfParent));
    }
    let target = find(nodes, target_id)?;
    if !target.is_container() {
        return Err(reject(InvalidMoveReason::TargetNotContainer));
    }
    if target.project_id != node.project_id {
        return Err(reject(InvalidMoveReason::CrossProject));
    }
    if is_descendant(node_id, target_id, nodes) {
        return Err(reject(InvalidMoveReason::Cycle));
    }

    Ok(MovePlan {
        node_id,
        from_parent: node.parent_id,
        to_parent: Some(target_id),
    })
}

/// Plans removal of a node and its whole subtree.
///
/// # Errors
/// - `NodeNotFound` when the node is unknown.
/// - `NonEmptyContainer` when `force` is false and a container still has
///   descendants; carries the count and a shallow child listing.
pub fn plan_delete(node_id: NodeId, force: bool, nodes: &[DocumentNode]) -> TreeResult<DeletePlan> {
    let node = find(nodes, node_id)?;
    let mut removed = collect_descendants(node_id, nodes);

    if node.is_container() && !removed.is_empty() && !force {
        let mut children: Vec<&DocumentNode> = nodes
            .iter()
            .filter(|candidate| candidate.parent_id == Some(node_id))
            .collect();
        children.sort_by_key(|child| (child.order, child.created_at, child.id));
        return Err(TreeError::NonEmptyContainer {
            node_id,
            descendant_count: removed.len(),
            children: children.into_iter().map(DocumentNode::summary).collect(),
        });
    }

    removed.push(node_id);
    Ok(DeletePlan { node_id, removed })
}

/// Trims a title and collapses internal whitespace runs.
///
/// # Errors
/// - `Validation` when nothing remains after trimming.
pub fn normalize_title(raw: &str) -> TreeResult<String> {
    let collapsed = WHITESPACE_RUN_RE.replace_all(raw.trim(), " ");
    if collapsed.is_empty() {
        return Err(TreeError::Validation("title must not be blank".to_string()));
    }
    Ok(collapsed.into_owned())
}

fn find(nodes: &[DocumentNode], id: NodeId) -> TreeResult<&DocumentNode> {
    nodes
        .iter()
        .find(|node| node.id == id)
        .ok_or_else(|| TreeError::NodeNotFound(id.to_string()))
}
