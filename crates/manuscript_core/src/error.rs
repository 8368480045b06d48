//! Domain error taxonomy shared by planner, client, service and sync driver.
//!
//! # Invariants
//! - Structural errors (`InvalidMove`, `NonEmptyContainer`) are raised before
//!   any store write.
//! - `ExternalStore` never rolls back a committed cache write.

use crate::external::ExternalStoreError;
use crate::model::document::{ChildSummary, NodeId, ProjectId};
use crate::repo::cache_store::CacheStoreError;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Result alias for tree operations.
pub type TreeResult<T> = Result<T, TreeError>;

/// Why a move was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidMoveReason {
    /// Target parent equals the moved node.
    SelfParent,
    /// Target parent is a leaf kind.
    TargetNotContainer,
    /// Target parent lies inside the moved node's subtree.
    Cycle,
    /// Target parent belongs to another project.
    CrossProject,
}

impl Display for InvalidMoveReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SelfParent => write!(f, "node cannot be its own parent"),
            Self::TargetNotContainer => write!(f, "target is not a container"),
            Self::Cycle => write!(f, "target is inside the moved subtree"),
            Self::CrossProject => write!(f, "target belongs to another project"),
        }
    }
}

/// Errors surfaced by hierarchy operations.
#[derive(Debug)]
pub enum TreeError {
    /// Malformed input such as a blank title or missing project.
    Validation(String),
    /// Referenced node does not exist.
    NodeNotFound(String),
    /// Referenced project does not exist.
    ProjectNotFound(ProjectId),
    /// Acting principal does not own the project.
    Authorization { user_id: String, project_id: ProjectId },
    /// Self-move, non-container target, or cycle.
    InvalidMove {
        node_id: NodeId,
        target_id: Option<NodeId>,
        reason: InvalidMoveReason,
    },
    /// Delete without `force` on a container that still has descendants.
    NonEmptyContainer {
        node_id: NodeId,
        descendant_count: usize,
        children: Vec<ChildSummary>,
    },
    /// A structural mutation is already in flight on this client.
    Busy,
    /// A concurrent write changed the node between validation and apply.
    Conflict(NodeId),
    /// External store call failed or timed out.
    ExternalStore(ExternalStoreError),
    /// Cache store failure.
    Store(CacheStoreError),
}

impl TreeError {
    /// Returns whether the error was raised before any store write.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::InvalidMove { .. } | Self::NonEmptyContainer { .. }
        )
    }
}

impl Display for TreeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(message) => write!(f, "validation failed: {message}"),
            Self::NodeNotFound(key) => write!(f, "document not found: {key}"),
            Self::ProjectNotFound(id) => write!(f, "project not found: {id}"),
            Self::Authorization {
                user_id,
                project_id,
            } => write!(f, "user `{user_id}` does not own project {project_id}"),
            Self::InvalidMove {
                node_id,
                target_id,
                reason,
            } => match target_id {
                Some(target_id) => {
                    write!(f, "cannot move {node_id} under {target_id}: {reason}")
                }
                None => write!(f, "cannot move {node_id} to root: {reason}"),
            },
            Self::NonEmptyContainer {
                node_id,
                descendant_count,
                ..
            } => write!(
                f,
                "container {node_id} still holds {descendant_count} document(s); force required"
            ),
            Self::Busy => write!(f, "another structural change is still in flight"),
            Self::Conflict(id) => write!(f, "document {id} changed concurrently"),
            Self::ExternalStore(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl Error for TreeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::ExternalStore(err) => Some(err),
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CacheStoreError> for TreeError {
    fn from(value: CacheStoreError) -> Self {
        match value {
            CacheStoreError::NodeNotFound(id) => Self::NodeNotFound(id.to_string()),
            CacheStoreError::ProjectNotFound(id) => Self::ProjectNotFound(id),
            other => Self::Store(other),
        }
    }
}

impl From<ExternalStoreError> for TreeError {
    fn from(value: ExternalStoreError) -> Self {
        Self::ExternalStore(value)
    }
}
