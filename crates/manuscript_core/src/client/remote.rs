//! Client-facing remote seam and its in-process binding.

use crate::error::TreeResult;
use crate::model::document::{DocumentNode, NodeId, NodeKey, ProjectId};
use crate::model::project::Principal;
use crate::repo::cache_store::CacheStore;
use crate::service::reconcile_service::{CanDelete, MirrorWarning, ReconciliationService};
use crate::service::sync_driver::SyncReport;
use crate::tree::planner::CreateRequest;
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;

/// Server operations the optimistic client depends on.
#[async_trait]
pub trait TreeRemote: Send + Sync {
    async fn create_node(&self, request: &CreateRequest) -> TreeResult<DocumentNode>;
    async fn move_node(
        &self,
        node_id: NodeId,
        new_parent: Option<NodeId>,
    ) -> TreeResult<DocumentNode>;
    /// Returns the number of deleted nodes.
    async fn delete_node(&self, node_id: NodeId, force: bool) -> TreeResult<usize>;
    async fn can_delete(&self, node_id: NodeId) -> TreeResult<CanDelete>;
    async fn request_sync(&self, project_id: ProjectId) -> TreeResult<SyncReport>;
}

/// Binds a [`ReconciliationService`] to one acting principal.
pub struct LocalRemote<C: CacheStore + 'static> {
    service: Arc<ReconciliationService<C>>,
    principal: Principal,
}

impl<C: CacheStore + 'static> LocalRemote<C> {
    pub fn new(service: Arc<ReconciliationService<C>>, principal: Principal) -> Self {
        Self { service, principal }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }
}

fn note_warnings(operation: &str, warnings: &[MirrorWarning]) {
    if !warnings.is_empty() {
        debug!(
            "event=remote_call module=client status=warn operation={operation} mirror_warnings={}",
            warnings.len()
        );
    }
}

#[async_trait]
impl<C: CacheStore + 'static> TreeRemote for LocalRemote<C> {
    async fn create_node(&self, request: &CreateRequest) -> TreeResult<DocumentNode> {
        let applied = self.service.create_node(&self.principal, request).await?;
        note_warnings("create_node", &applied.warnings);
        Ok(applied.value)
    }

    async fn move_node(
        &self,
        node_id: NodeId,
        new_parent: Option<NodeId>,
    ) -> TreeResult<DocumentNode> {
        let parent_key = new_parent.map(NodeKey::from);
        let applied = self
            .service
            .move_node(&self.principal, &NodeKey::from(node_id), parent_key.as_ref())
            .await?;
        note_warnings("move_node", &applied.warnings);
        Ok(applied.value)
    }

    async fn delete_node(&self, node_id: NodeId, force: bool) -> TreeResult<usize> {
        let applied = self
            .service
            .delete_node(&self.principal, &NodeKey::from(node_id), force)
            .await?;
        note_warnings("delete_node", &applied.warnings);
        Ok(applied.value.deleted_count)
    }

    async fn can_delete(&self, node_id: NodeId) -> TreeResult<CanDelete> {
        self.service
            .can_delete(&self.principal, &NodeKey::from(node_id))
    }

    async fn request_sync(&self, project_id: ProjectId) -> TreeResult<SyncReport> {
        self.service.request_sync(&self.principal, project_id).await
    }
}
