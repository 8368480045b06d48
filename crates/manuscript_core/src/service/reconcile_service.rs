//! Server-side authority over the document hierarchy.
//!
//! # Responsibility
//! - Resolve node keys, authorize the acting principal and re-validate every
//!   structural mutation independently of the client.
//! - Write the cache store, then mirror the change to the external store.
//! - Expose delete pre-checks, tree listings and on-demand sync.
//!
//! # Invariants
//! - The cache write must succeed or the request fails.
//! - A mirror failure never reverts a committed cache write; it is logged and,
//!   in inline mode, returned as a warning.
//! - Writes touching a node are serialized per node id.
//! - Moves go through the parent-guarded update, so a concurrent move of the
//!   same node yields `Conflict` instead of a lost update.

use crate::config::{ConfigError, EngineConfig, MirrorMode};
use crate::error::{InvalidMoveReason, TreeError, TreeResult};
use crate::external::{bounded, DocumentFields, ExternalStore, ExternalStoreError};
use crate::model::document::{
    count_words, now_epoch_ms, ChildSummary, DocumentKind, DocumentNode, DocumentStatus, NodeId,
    NodeKey, ProjectId,
};
use crate::model::project::{Principal, Project};
use crate::repo::cache_store::{CacheStore, NewProject, ParentUpdate};
use crate::service::node_locks::NodeLocks;
use crate::service::sync_driver::{SyncDriver, SyncReport};
use crate::tree::index::TreeIndex;
use crate::tree::planner::{normalize_title, plan_create, plan_delete, plan_move, CreateRequest};
use log::{info, warn};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

const MOVE_LOCK_ATTEMPTS: usize = 4;

/// Non-fatal mirror failure attached to a successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorWarning {
    pub node_id: NodeId,
    pub operation: &'static str,
    pub message: String,
}

impl Display for MirrorWarning {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "external mirror `{}` failed for {}: {}",
            self.operation, self.node_id, self.message
        )
    }
}

/// Canonical result of a mutation plus any mirror warnings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied<T> {
    pub value: T,
    pub warnings: Vec<MirrorWarning>,
}

impl<T> Applied<T> {
    fn clean(value: T) -> Self {
        Self {
            value,
            warnings: Vec::new(),
        }
    }
}

/// Result of a subtree delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub node_id: NodeId,
    /// Number of cache rows removed, target included.
    pub deleted_count: usize,
    /// Removed ids, deepest first.
    pub removed: Vec<NodeId>,
}

/// Delete pre-check. `can_delete` holds iff there are no direct children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanDelete {
    pub can_delete: bool,
    pub child_count: usize,
    pub children: Vec<ChildSummary>,
}

/// Partial descriptive update. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataPatch {
    pub title: Option<String>,
    pub synopsis: Option<String>,
    pub tags: Option<Vec<String>>,
    pub status: Option<DocumentStatus>,
    pub include_in_compile: Option<bool>,
}

impl MetadataPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One project's forest with aggregate word counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectTree {
    pub project: Project,
    pub nodes: Vec<DocumentNode>,
    /// Own plus descendant word counts per node.
    pub word_totals: HashMap<NodeId, u64>,
}

/// Document as the cache held it when its create was mirrored.
#[derive(Debug, Clone)]
struct PendingCreate {
    node_id: NodeId,
    title: String,
    kind: DocumentKind,
    parent_ref: String,
}

/// External write derived from a committed cache change.
#[derive(Debug, Clone)]
enum MirrorOp {
    Create(PendingCreate),
    Update {
        node_id: NodeId,
        document_ref: String,
        fields: DocumentFields,
    },
    Delete {
        node_id: NodeId,
        document_refs: Vec<String>,
    },
}

impl MirrorOp {
    fn node_id(&self) -> NodeId {
        match self {
            Self::Create(create) => create.node_id,
            Self::Update { node_id, .. } | Self::Delete { node_id, .. } => *node_id,
        }
    }

    fn operation(&self) -> &'static str {
        match self {
            Self::Create(create) if create.kind.is_container() => "create_container",
            Self::Create(_) => "create_leaf_document",
            Self::Update { .. } => "update_document",
            Self::Delete { .. } => "delete_document",
        }
    }
}

/// Hierarchy service facade over one cache store and one external store.
pub struct ReconciliationService<C: CacheStore + 'static> {
    cache: Arc<C>,
    external: Arc<dyn ExternalStore>,
    config: EngineConfig,
    locks: NodeLocks,
    sync: SyncDriver<C>,
}

impl<C: CacheStore + 'static> ReconciliationService<C> {
    /// # Errors
    /// - `ConfigError::Invalid` when `config` fails validation.
    pub fn new(
        cache: Arc<C>,
        external: Arc<dyn ExternalStore>,
        config: EngineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let locks = NodeLocks::new();
        let sync = SyncDriver::new(
            Arc::clone(&cache),
            Arc::clone(&external),
            config.external_timeout(),
            locks.clone(),
        );
        Ok(Self {
            cache,
            external,
            config,
            locks,
            sync,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Creates a project owned by `principal`.
    pub fn create_project(
        &self,
        principal: &Principal,
        title: &str,
        external_ref: Option<String>,
    ) -> TreeResult<Project> {
        let title = normalize_title(title)?;
        let project = self.cache.create_project(&NewProject {
            owner_id: principal.user_id.clone(),
            title,
            external_ref,
        })?;
        info!(
            "event=project_create module=reconcile status=ok project_id={} linked={}",
            project.id,
            project.external_ref.is_some()
        );
        Ok(project)
    }

    /// Resolves a cache id or external ref to the cached node.
    ///
    /// External refs are only unique within a project, so they are looked up
    /// among the projects `principal` owns.
    ///
    /// # Errors
    /// - `NodeNotFound` when neither alias names a reachable cached node.
    pub fn resolve(&self, principal: &Principal, key: &NodeKey) -> TreeResult<DocumentNode> {
        if let Some(node_id) = key.as_node_id() {
            if let Some(node) = self.cache.get_node(node_id)? {
                return Ok(node);
            }
        }
        self.cache
            .find_owned_by_external_ref(&principal.user_id, key.as_str())?
            .ok_or_else(|| TreeError::NodeNotFound(key.to_string()))
    }

    /// Loads `project_id` and checks that `principal` owns it.
    pub fn authorize(&self, principal: &Principal, project_id: ProjectId) -> TreeResult<Project> {
        let project = self
            .cache
            .get_project(project_id)?
            .ok_or(TreeError::ProjectNotFound(project_id))?;
        if !principal.owns(&project) {
            warn!(
                "event=authorize module=reconcile status=denied project_id={project_id} user_id={}",
                principal.user_id
            );
            return Err(TreeError::Authorization {
                user_id: principal.user_id.clone(),
                project_id,
            });
        }
        Ok(project)
    }

    /// Creates one node under the parent derived from the request selection.
    pub async fn create_node(
        &self,
        principal: &Principal,
        request: &CreateRequest,
    ) -> TreeResult<Applied<DocumentNode>> {
        let project_id = request
            .project_id
            .ok_or_else(|| TreeError::Validation("project is required".to_string()))?;
        let project = self.authorize(principal, project_id)?;
        let nodes = self.cache.list_project_nodes(project.id)?;
        let plan = plan_create(request, &nodes)?;

        let lock_ids: Vec<NodeId> = plan.parent_id.into_iter().collect();
        let _guard = self.locks.acquire(&lock_ids).await;

        let mut node = DocumentNode::new(plan.project_id, plan.parent_id, plan.kind, plan.title);
        node.order = self.cache.next_sort_order(project.id, plan.parent_id)?;
        let stored = self.cache.insert_node(&node)?;
        info!(
            "event=node_create module=reconcile status=ok node_id={} project_id={} kind={}",
            stored.id, project.id, stored.kind
        );

        let op = self.parent_ref_for(&project, stored.parent_id).map(|parent_ref| {
            MirrorOp::Create(PendingCreate {
                node_id: stored.id,
                title: stored.title.clone(),
                kind: stored.kind,
                parent_ref,
            })
        });
        let warnings = self.mirror(&project, stored.id, op).await;
        let value = match self.config.mirror_mode {
            MirrorMode::Inline => self.cache.get_node(stored.id)?.unwrap_or(stored),
            MirrorMode::Detached => stored,
        };
        Ok(Applied { value, warnings })
    }

    /// Moves a node under `new_parent`, or to root level when `None`.
    ///
    /// # Errors
    /// - `InvalidMove` for self-parenting, a leaf target, a cross-project
    ///   target or a cycle.
    /// - `Conflict` when the node's parent changed under the guard or kept
    ///   changing while its locks were taken.
    pub async fn move_node(
        &self,
        principal: &Principal,
        key: &NodeKey,
        new_parent: Option<&NodeKey>,
    ) -> TreeResult<Applied<DocumentNode>> {
        let node = self.resolve(principal, key)?;
        let project = self.authorize(principal, node.project_id)?;
        let target = new_parent
            .map(|parent| self.resolve(principal, parent))
            .transpose()?;
        let target_id = target.as_ref().map(|target| target.id);

        // The current parent is locked too, so a delete of it cannot overtake
        // this move's mirror write.
        let mut expected_parent = node.parent_id;
        let mut attempts = 0;
        let (_guard, mut nodes) = loop {
            let mut lock_ids = vec![node.id];
            lock_ids.extend(target_id);
            lock_ids.extend(expected_parent);
            let guard = self.locks.acquire(&lock_ids).await;
            let nodes = self.cache.list_project_nodes(project.id)?;
            let current_parent = nodes
                .iter()
                .find(|candidate| candidate.id == node.id)
                .map(|current| current.parent_id)
                .ok_or_else(|| TreeError::NodeNotFound(node.id.to_string()))?;
            if current_parent == expected_parent {
                break (guard, nodes);
            }
            attempts += 1;
            if attempts >= MOVE_LOCK_ATTEMPTS {
                warn!(
                    "event=node_move module=reconcile status=conflict node_id={} reason=parent_unstable",
                    node.id
                );
                return Err(TreeError::Conflict(node.id));
            }
            expected_parent = current_parent;
        };
        if let Some(target) = target.filter(|target| target.project_id != project.id) {
            nodes.push(target);
        }
        let plan = plan_move(node.id, target_id, &nodes)?;
        if plan.from_parent == plan.to_parent {
            let current = self.require_node(node.id)?;
            return Ok(Applied::clean(current));
        }

        match self
            .cache
            .update_parent_if_matches(plan.node_id, plan.from_parent, plan.to_parent)?
        {
            ParentUpdate::Applied => {}
            ParentUpdate::ParentChanged => {
                warn!(
                    "event=node_move module=reconcile status=conflict node_id={}",
                    plan.node_id
                );
                return Err(TreeError::Conflict(plan.node_id));
            }
            ParentUpdate::WouldCycle => {
                return Err(TreeError::InvalidMove {
                    node_id: plan.node_id,
                    target_id: plan.to_parent,
                    reason: InvalidMoveReason::Cycle,
                });
            }
        }
        let moved = self.require_node(plan.node_id)?;
        info!(
            "event=node_move module=reconcile status=ok node_id={} from={} to={}",
            moved.id,
            display_parent(plan.from_parent),
            display_parent(plan.to_parent)
        );

        let op = match (
            moved.external_ref.clone(),
            self.parent_ref_for(&project, plan.to_parent),
        ) {
            (Some(document_ref), Ok(parent_ref)) => Ok(MirrorOp::Update {
                node_id: moved.id,
                document_ref,
                fields: DocumentFields {
                    parent_ref: Some(parent_ref),
                    ..DocumentFields::default()
                },
            }),
            (None, _) => Err(not_mirrored(moved.id)),
            (_, Err(message)) => Err(message),
        };
        let warnings = self.mirror(&project, moved.id, op).await;
        Ok(Applied {
            value: moved,
            warnings,
        })
    }

    /// Deletes a node and, with `force`, its whole subtree.
    ///
    /// # Errors
    /// - `NonEmptyContainer` when `force` is false and descendants exist.
    /// - `Conflict` when the subtree changed while waiting for its locks.
    pub async fn delete_node(
        &self,
        principal: &Principal,
        key: &NodeKey,
        force: bool,
    ) -> TreeResult<Applied<DeleteOutcome>> {
        let node = self.resolve(principal, key)?;
        let project = self.authorize(principal, node.project_id)?;
        let nodes = self.cache.list_project_nodes(project.id)?;
        let plan = plan_delete(node.id, force, &nodes)?;

        let _guard = self.locks.acquire(&plan.removed).await;
        let nodes = self.cache.list_project_nodes(project.id)?;
        let confirmed = plan_delete(node.id, force, &nodes)?;
        if confirmed != plan {
            warn!(
                "event=node_delete module=reconcile status=conflict node_id={}",
                node.id
            );
            return Err(TreeError::Conflict(node.id));
        }

        let refs: HashMap<NodeId, &str> = nodes
            .iter()
            .filter_map(|node| node.external_ref.as_deref().map(|value| (node.id, value)))
            .collect();
        let document_refs: Vec<String> = confirmed
            .removed
            .iter()
            .filter_map(|id| refs.get(id).map(|value| value.to_string()))
            .collect();

        let deleted_count = self.cache.delete_nodes(&confirmed.removed)?;
        info!(
            "event=node_delete module=reconcile status=ok node_id={} deleted_count={deleted_count} force={force}",
            node.id
        );

        let op = if document_refs.is_empty() {
            Err(not_mirrored(node.id))
        } else {
            Ok(MirrorOp::Delete {
                node_id: node.id,
                document_refs,
            })
        };
        let warnings = self.mirror(&project, node.id, op).await;
        Ok(Applied {
            value: DeleteOutcome {
                node_id: node.id,
                deleted_count,
                removed: confirmed.removed,
            },
            warnings,
        })
    }

    /// Reports whether a node has direct children, with a shallow listing.
    pub fn can_delete(&self, principal: &Principal, key: &NodeKey) -> TreeResult<CanDelete> {
        let node = self.resolve(principal, key)?;
        self.authorize(principal, node.project_id)?;
        let children: Vec<ChildSummary> = self
            .cache
            .list_children(node.id)?
            .iter()
            .map(DocumentNode::summary)
            .collect();
        Ok(CanDelete {
            can_delete: children.is_empty(),
            child_count: children.len(),
            children,
        })
    }

    /// Applies a descriptive metadata patch.
    pub async fn update_metadata(
        &self,
        principal: &Principal,
        key: &NodeKey,
        patch: &MetadataPatch,
    ) -> TreeResult<Applied<DocumentNode>> {
        if patch.is_empty() {
            return Err(TreeError::Validation("metadata patch is empty".to_string()));
        }
        let title = patch.title.as_deref().map(normalize_title).transpose()?;
        let tags = patch.tags.as_deref().map(normalize_tags);

        let node = self.resolve(principal, key)?;
        let project = self.authorize(principal, node.project_id)?;
        let _guard = self.locks.acquire(&[node.id]).await;

        let mut next = self.require_node(node.id)?;
        if let Some(title) = &title {
            next.title = title.clone();
        }
        if let Some(synopsis) = &patch.synopsis {
            next.synopsis = synopsis.trim().to_string();
        }
        if let Some(tags) = &tags {
            next.tags = tags.clone();
        }
        if let Some(status) = patch.status {
            next.status = status;
        }
        if let Some(include_in_compile) = patch.include_in_compile {
            next.include_in_compile = include_in_compile;
        }
        let stored = self.cache.update_node(&next)?;
        info!(
            "event=node_metadata module=reconcile status=ok node_id={}",
            stored.id
        );

        let fields = DocumentFields {
            title,
            synopsis: patch.synopsis.as_ref().map(|_| stored.synopsis.clone()),
            tags,
            status: patch.status,
            include_in_compile: patch.include_in_compile,
            ..DocumentFields::default()
        };
        let op = self.update_op(&stored, fields);
        let warnings = self.mirror(&project, stored.id, op).await;
        Ok(Applied {
            value: stored,
            warnings,
        })
    }

    /// Replaces the content body, recomputing word count and edit time.
    pub async fn update_content(
        &self,
        principal: &Principal,
        key: &NodeKey,
        content: &str,
    ) -> TreeResult<Applied<DocumentNode>> {
        let node = self.resolve(principal, key)?;
        let project = self.authorize(principal, node.project_id)?;
        let _guard = self.locks.acquire(&[node.id]).await;

        let mut next = self.require_node(node.id)?;
        next.content = content.to_string();
        next.word_count = count_words(content);
        next.last_edited_at = Some(now_epoch_ms());
        let stored = self.cache.update_node(&next)?;
        info!(
            "event=node_content module=reconcile status=ok node_id={} word_count={}",
            stored.id, stored.word_count
        );

        let op = self.update_op(
            &stored,
            DocumentFields {
                content: Some(stored.content.clone()),
                ..DocumentFields::default()
            },
        );
        let warnings = self.mirror(&project, stored.id, op).await;
        Ok(Applied {
            value: stored,
            warnings,
        })
    }

    /// Lists a project's nodes with aggregate word counts.
    pub fn list_tree(&self, principal: &Principal, project_id: ProjectId) -> TreeResult<ProjectTree> {
        let project = self.authorize(principal, project_id)?;
        let nodes = self.cache.list_project_nodes(project_id)?;
        let word_totals = TreeIndex::build(&nodes).aggregate_word_counts();
        Ok(ProjectTree {
            project,
            nodes,
            word_totals,
        })
    }

    /// Runs a full sync pass for one project.
    pub async fn request_sync(
        &self,
        principal: &Principal,
        project_id: ProjectId,
    ) -> TreeResult<SyncReport> {
        let project = self.authorize(principal, project_id)?;
        self.sync.run(&project).await
    }

    fn require_node(&self, node_id: NodeId) -> TreeResult<DocumentNode> {
        self.cache
            .get_node(node_id)?
            .ok_or_else(|| TreeError::NodeNotFound(node_id.to_string()))
    }

    /// External parent for a cache parent; root level maps to the project root.
    fn parent_ref_for(&self, project: &Project, parent_id: Option<NodeId>) -> Result<String, String> {
        let Some(parent_id) = parent_id else {
            return project
                .external_ref
                .clone()
                .ok_or_else(|| "project has no external root".to_string());
        };
        match self.cache.get_node(parent_id) {
            Ok(Some(parent)) => parent.external_ref.ok_or_else(|| {
                format!("parent {parent_id} has not been mirrored yet")
            }),
            Ok(None) => Err(format!("parent {parent_id} no longer exists")),
            Err(err) => Err(err.to_string()),
        }
    }

    fn update_op(&self, node: &DocumentNode, fields: DocumentFields) -> Result<MirrorOp, String> {
        match &node.external_ref {
            Some(document_ref) => Ok(MirrorOp::Update {
                node_id: node.id,
                document_ref: document_ref.clone(),
                fields,
            }),
            None => Err(not_mirrored(node.id)),
        }
    }

    /// Dispatches a mirror write according to the configured mode.
    async fn mirror(
        &self,
        project: &Project,
        node_id: NodeId,
        op: Result<MirrorOp, String>,
    ) -> Vec<MirrorWarning> {
        let (op, project_ref) = match (op, project.external_ref.clone()) {
            (Ok(op), Some(project_ref)) => (op, project_ref),
            (Ok(_), None) => {
                return self.skipped(node_id, "project has no external root".to_string());
            }
            (Err(reason), _) => return self.skipped(node_id, reason),
        };

        match self.config.mirror_mode {
            MirrorMode::Inline => {
                let mirror = Mirror {
                    cache: self.cache.as_ref(),
                    external: self.external.as_ref(),
                    timeout: self.config.external_timeout(),
                    locks: None,
                };
                mirror.run(&project_ref, &op).await.err().into_iter().collect()
            }
            MirrorMode::Detached => {
                let cache = Arc::clone(&self.cache);
                let external = Arc::clone(&self.external);
                let locks = self.locks.clone();
                let timeout = self.config.external_timeout();
                tokio::spawn(async move {
                    let mirror = Mirror {
                        cache: cache.as_ref(),
                        external: external.as_ref(),
                        timeout,
                        locks: Some(&locks),
                    };
                    let _ = mirror.run(&project_ref, &op).await;
                });
                Vec::new()
            }
        }
    }

    fn skipped(&self, node_id: NodeId, reason: String) -> Vec<MirrorWarning> {
        warn!(
            "event=mirror module=reconcile status=skipped node_id={node_id} reason={reason:?}"
        );
        match self.config.mirror_mode {
            MirrorMode::Inline => vec![MirrorWarning {
                node_id,
                operation: "mirror",
                message: reason,
            }],
            MirrorMode::Detached => Vec::new(),
        }
    }
}

/// Executes mirror writes against the external store.
///
/// `locks` is set for detached writes, which run after the request released
/// its node locks.
struct Mirror<'a, C: CacheStore + ?Sized> {
    cache: &'a C,
    external: &'a dyn ExternalStore,
    timeout: Duration,
    locks: Option<&'a NodeLocks>,
}

impl<C: CacheStore + ?Sized> Mirror<'_, C> {
    /// Runs one mirror write, single attempt. Failures are logged and returned.
    async fn run(&self, project_ref: &str, op: &MirrorOp) -> Result<(), MirrorWarning> {
        match self.apply(project_ref, op).await {
            Ok(()) => {
                info!(
                    "event=mirror module=reconcile status=ok node_id={} operation={}",
                    op.node_id(),
                    op.operation()
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    "event=mirror module=reconcile status=error node_id={} operation={} error={err}",
                    op.node_id(),
                    op.operation()
                );
                Err(MirrorWarning {
                    node_id: op.node_id(),
                    operation: op.operation(),
                    message: err.to_string(),
                })
            }
        }
    }

    async fn apply(&self, project_ref: &str, op: &MirrorOp) -> TreeResult<()> {
        match op {
            MirrorOp::Create(create) => {
                let document_ref = if create.kind.is_container() {
                    bounded(
                        "create_container",
                        self.timeout,
                        self.external
                            .create_container(&create.title, &create.parent_ref),
                    )
                    .await?
                } else {
                    bounded(
                        "create_leaf_document",
                        self.timeout,
                        self.external.create_leaf_document(
                            &create.title,
                            &create.parent_ref,
                            create.kind,
                        ),
                    )
                    .await?
                };
                self.settle_created(project_ref, &document_ref, create).await
            }
            MirrorOp::Update {
                document_ref,
                fields,
                ..
            } => {
                bounded(
                    "update_document",
                    self.timeout,
                    self.external.update_document(project_ref, document_ref, fields),
                )
                .await?;
                Ok(())
            }
            MirrorOp::Delete { document_refs, .. } => {
                for document_ref in document_refs {
                    self.delete_tolerant(project_ref, document_ref).await?;
                }
                Ok(())
            }
        }
    }

    /// Records the new ref and brings the external document up to the cache
    /// row as it is now. Moves and edits issued before the ref existed could
    /// not be mirrored on their own.
    async fn settle_created(
        &self,
        project_ref: &str,
        document_ref: &str,
        create: &PendingCreate,
    ) -> TreeResult<()> {
        let node_id = create.node_id;
        let _guard = match self.locks {
            Some(locks) => Some(locks.acquire(&[node_id]).await),
            None => None,
        };
        let Some(current) = self.cache.get_node(node_id)? else {
            info!(
                "event=mirror module=reconcile status=orphan node_id={node_id} reason=deleted_during_create"
            );
            return self.delete_tolerant(project_ref, document_ref).await;
        };
        self.cache.set_external_ref(node_id, document_ref)?;

        let current_parent_ref = match current.parent_id {
            None => Some(project_ref.to_string()),
            Some(parent_id) => self
                .cache
                .get_node(parent_id)?
                .and_then(|parent| parent.external_ref),
        };
        let fields = DocumentFields {
            // Containers are created as plain folders; stamp the real kind.
            kind: (current.kind != DocumentKind::Folder && current.kind.is_container())
                .then_some(current.kind),
            order: Some(current.order),
            title: (current.title != create.title).then(|| current.title.clone()),
            parent_ref: current_parent_ref
                .filter(|parent_ref| *parent_ref != create.parent_ref),
            synopsis: (!current.synopsis.is_empty()).then(|| current.synopsis.clone()),
            tags: (!current.tags.is_empty()).then(|| current.tags.clone()),
            status: (current.status != DocumentStatus::default()).then_some(current.status),
            include_in_compile: (!current.include_in_compile).then_some(false),
            content: (!current.content.is_empty()).then(|| current.content.clone()),
        };
        bounded(
            "update_document",
            self.timeout,
            self.external.update_document(project_ref, document_ref, &fields),
        )
        .await?;
        Ok(())
    }

    async fn delete_tolerant(&self, project_ref: &str, document_ref: &str) -> TreeResult<()> {
        match bounded(
            "delete_document",
            self.timeout,
            self.external.delete_document(project_ref, document_ref),
        )
        .await
        {
            Ok(()) | Err(ExternalStoreError::NotFound(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let trimmed = tag.trim();
        if !trimmed.is_empty() && !normalized.iter().any(|existing| existing == trimmed) {
            normalized.push(trimmed.to_string());
        }
    }
    normalized
}

fn not_mirrored(node_id: NodeId) -> String {
    format!("document {node_id} has not been mirrored yet")
}

fn display_parent(parent_id: Option<NodeId>) -> String {
    parent_id.map_or_else(|| "root".to_string(), |id| id.to_string())
}
