//! Optimistic tree mutation on the client side.
//!
//! # Responsibility
//! - Apply planned mutations to the local node list immediately.
//! - Fold canonical server state in on success; restore on failure.
//!
//! # Invariants
//! - A failed mutation leaves every touched node exactly as it was; no partial
//!   plan stays visible.
//! - At most one structural mutation (move or delete) is pending at a time.
//! - A move expands its destination whatever the outcome.

use crate::client::remote::TreeRemote;
use crate::client::view_state::{Notice, ViewState};
use crate::error::{TreeError, TreeResult};
use crate::model::document::{DocumentNode, NodeId};
use crate::tree::index::TreeIndex;
use crate::tree::planner::{
    plan_create, plan_delete, plan_move, CreatePlan, CreateRequest, DeletePlan, MovePlan,
    MutationPlan,
};
use log::{debug, warn};

/// Handle for one applied, unconfirmed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(u64);

#[derive(Debug, Clone)]
struct Pending {
    ticket: Ticket,
    plan: MutationPlan,
    /// Pre-mutation copies of every node the plan changed or removed.
    snapshot: Vec<DocumentNode>,
    focus_before: Option<NodeId>,
    /// Removed ids that were expanded before a delete.
    expanded_before: Vec<NodeId>,
    /// Local id of a node inserted by a create plan.
    provisional: Option<NodeId>,
}

/// Local tree plus view state with optimistic mutation support.
#[derive(Debug, Clone, Default)]
pub struct OptimisticClient {
    nodes: Vec<DocumentNode>,
    view: ViewState,
    pending: Vec<Pending>,
    next_ticket: u64,
}

impl OptimisticClient {
    pub fn new(nodes: Vec<DocumentNode>) -> Self {
        Self::with_view(nodes, ViewState::default())
    }

    pub fn with_view(nodes: Vec<DocumentNode>, view: ViewState) -> Self {
        Self {
            nodes,
            view,
            pending: Vec::new(),
            next_ticket: 0,
        }
    }

    pub fn nodes(&self) -> &[DocumentNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&DocumentNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut ViewState {
        &mut self.view
    }

    pub fn index(&self) -> TreeIndex<'_> {
        TreeIndex::build(&self.nodes)
    }

    /// Replaces the local tree with a fresh listing.
    ///
    /// # Errors
    /// - `Busy` while any mutation is still pending.
    pub fn replace_nodes(&mut self, nodes: Vec<DocumentNode>) -> TreeResult<()> {
        if !self.pending.is_empty() {
            return Err(TreeError::Busy);
        }
        let gone: Vec<NodeId> = self
            .nodes
            .iter()
            .map(|node| node.id)
            .filter(|id| !nodes.iter().any(|node| node.id == *id))
            .collect();
        self.view.forget(&gone);
        if self.view.focused().is_some_and(|id| gone.contains(&id)) {
            self.view.focus(None);
        }
        self.nodes = nodes;
        Ok(())
    }

    pub fn structural_in_flight(&self) -> bool {
        self.pending.iter().any(|pending| pending.plan.is_structural())
    }

    pub fn plan_create(&self, request: &CreateRequest) -> TreeResult<CreatePlan> {
        plan_create(request, &self.nodes)
    }

    pub fn plan_move(&self, node_id: NodeId, new_parent: Option<NodeId>) -> TreeResult<MovePlan> {
        plan_move(node_id, new_parent, &self.nodes)
    }

    pub fn plan_delete(&self, node_id: NodeId, force: bool) -> TreeResult<DeletePlan> {
        plan_delete(node_id, force, &self.nodes)
    }

    /// Applies `plan` to the local tree and returns its ticket.
    ///
    /// # Errors
    /// - `Busy` when `plan` is structural and another structural plan is
    ///   still pending.
    /// - `NodeNotFound` when the plan targets a node that is not local.
    pub fn apply_optimistic(&mut self, plan: MutationPlan) -> TreeResult<Ticket> {
        if plan.is_structural() && self.structural_in_flight() {
            return Err(TreeError::Busy);
        }

        let focus_before = self.view.focused();
        let mut snapshot = Vec::new();
        let mut expanded_before = Vec::new();
        let mut provisional = None;

        match &plan {
            MutationPlan::Create(create) => {
                let mut node = DocumentNode::new(
                    create.project_id,
                    create.parent_id,
                    create.kind,
                    create.title.clone(),
                );
                node.order = self
                    .nodes
                    .iter()
                    .filter(|sibling| {
                        sibling.project_id == create.project_id
                            && sibling.parent_id == create.parent_id
                    })
                    .map(|sibling| sibling.order + 1)
                    .max()
                    .unwrap_or(0);
                provisional = Some(node.id);
                if let Some(parent_id) = create.parent_id {
                    self.view.expand(parent_id);
                }
                self.nodes.push(node);
            }
            MutationPlan::Move(movement) => {
                let position = self.position(movement.node_id)?;
                snapshot.push(self.nodes[position].clone());
                self.nodes[position].parent_id = movement.to_parent;
                if let Some(target_id) = movement.to_parent {
                    self.view.expand(target_id);
                }
            }
            MutationPlan::Delete(delete) => {
                self.position(delete.node_id)?;
                let (removed, kept): (Vec<DocumentNode>, Vec<DocumentNode>) = self
                    .nodes
                    .drain(..)
                    .partition(|node| delete.removed.contains(&node.id));
                self.nodes = kept;
                expanded_before = delete
                    .removed
                    .iter()
                    .copied()
                    .filter(|id| self.view.is_expanded(*id))
                    .collect();
                self.view.forget(&delete.removed);
                if focus_before.is_some_and(|id| delete.removed.contains(&id)) {
                    self.view.focus(None);
                }
                snapshot = removed;
            }
        }

        let ticket = Ticket(self.next_ticket);
        self.next_ticket += 1;
        debug!(
            "event=optimistic_apply module=client status=ok ticket={} structural={}",
            ticket.0,
            plan.is_structural()
        );
        self.pending.push(Pending {
            ticket,
            plan,
            snapshot,
            focus_before,
            expanded_before,
            provisional,
        });
        Ok(ticket)
    }

    /// Accepts the server outcome of `ticket`, folding in canonical fields.
    ///
    /// For creates the provisional node is replaced by `canonical`, which
    /// carries the server-assigned id.
    pub fn confirm(&mut self, ticket: Ticket, canonical: Option<DocumentNode>) -> TreeResult<()> {
        let pending = self.take(ticket)?;
        let Some(canonical) = canonical else {
            return Ok(());
        };

        let local_id = pending.provisional.unwrap_or(canonical.id);
        if let Some(position) = self.nodes.iter().position(|node| node.id == local_id) {
            if self.view.focused() == Some(local_id) {
                self.view.focus(Some(canonical.id));
            }
            self.nodes[position] = canonical;
        }
        Ok(())
    }

    /// Restores the pre-mutation state of `ticket` and records a notice for
    /// failed moves and deletes.
    pub fn revert_optimistic(&mut self, ticket: Ticket, error: &TreeError) -> TreeResult<()> {
        let pending = self.take(ticket)?;
        warn!(
            "event=optimistic_revert module=client status=reverted ticket={} error={error}",
            ticket.0
        );

        match &pending.plan {
            MutationPlan::Create(_) => {
                if let Some(local_id) = pending.provisional {
                    self.nodes.retain(|node| node.id != local_id);
                    if self.view.focused() == Some(local_id) {
                        self.view.focus(pending.focus_before);
                    }
                }
            }
            MutationPlan::Move(movement) => {
                for original in &pending.snapshot {
                    if let Some(position) =
                        self.nodes.iter().position(|node| node.id == original.id)
                    {
                        self.nodes[position] = original.clone();
                    }
                }
                self.notice_for(movement.node_id, &pending.snapshot, error);
            }
            MutationPlan::Delete(delete) => {
                self.nodes.extend(pending.snapshot.iter().cloned());
                for id in &pending.expanded_before {
                    self.view.expand(*id);
                }
                self.view.focus(pending.focus_before);
                self.notice_for(delete.node_id, &pending.snapshot, error);
            }
        }
        Ok(())
    }

    /// Plans, applies and sends a create; reverts on remote failure.
    pub async fn create_node(
        &mut self,
        remote: &dyn TreeRemote,
        request: &CreateRequest,
    ) -> TreeResult<DocumentNode> {
        let plan = self.plan_create(request)?;
        let remote_request = CreateRequest {
            title: plan.title.clone(),
            kind: plan.kind,
            project_id: Some(plan.project_id),
            selection: plan.parent_id,
        };
        let ticket = self.apply_optimistic(MutationPlan::Create(plan))?;
        match remote.create_node(&remote_request).await {
            Ok(canonical) => {
                self.confirm(ticket, Some(canonical.clone()))?;
                Ok(canonical)
            }
            Err(err) => {
                self.revert_optimistic(ticket, &err)?;
                Err(err)
            }
        }
    }

    /// Plans, applies and sends a move; reverts on remote failure.
    pub async fn move_node(
        &mut self,
        remote: &dyn TreeRemote,
        node_id: NodeId,
        new_parent: Option<NodeId>,
    ) -> TreeResult<DocumentNode> {
        let plan = match self.plan_move(node_id, new_parent) {
            Ok(plan) => plan,
            Err(err) => {
                self.notice_for(node_id, &[], &err);
                return Err(err);
            }
        };
        let ticket = self.apply_optimistic(MutationPlan::Move(plan))?;
        match remote.move_node(node_id, new_parent).await {
            Ok(canonical) => {
                self.confirm(ticket, Some(canonical.clone()))?;
                Ok(canonical)
            }
            Err(err) => {
                self.revert_optimistic(ticket, &err)?;
                Err(err)
            }
        }
    }

    /// Plans, applies and sends a delete; reverts on remote failure.
    ///
    /// Returns the server-side deleted count.
    pub async fn delete_node(
        &mut self,
        remote: &dyn TreeRemote,
        node_id: NodeId,
        force: bool,
    ) -> TreeResult<usize> {
        // Non-empty containers surface their children for a force prompt.
        let plan = self.plan_delete(node_id, force)?;
        let ticket = self.apply_optimistic(MutationPlan::Delete(plan))?;
        match remote.delete_node(node_id, force).await {
            Ok(deleted_count) => {
                self.confirm(ticket, None)?;
                Ok(deleted_count)
            }
            Err(err) => {
                self.revert_optimistic(ticket, &err)?;
                Err(err)
            }
        }
    }

    fn position(&self, id: NodeId) -> TreeResult<usize> {
        self.nodes
            .iter()
            .position(|node| node.id == id)
            .ok_or_else(|| TreeError::NodeNotFound(id.to_string()))
    }

    fn take(&mut self, ticket: Ticket) -> TreeResult<Pending> {
        let position = self
            .pending
            .iter()
            .position(|pending| pending.ticket == ticket)
            .ok_or_else(|| TreeError::Validation(format!("unknown ticket {}", ticket.0)))?;
        Ok(self.pending.remove(position))
    }

    fn notice_for(&mut self, node_id: NodeId, snapshot: &[DocumentNode], error: &TreeError) {
        let document_title = snapshot
            .iter()
            .chain(self.nodes.iter())
            .find(|node| node.id == node_id)
            .map(|node| node.title.clone())
            .unwrap_or_else(|| node_id.to_string());
        self.view.push_notice(Notice {
            document_title,
            message: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::OptimisticClient;
    use crate::error::TreeError;
    use crate::model::document::{DocumentKind, DocumentNode};
    use crate::tree::planner::{CreateRequest, MutationPlan};
    use uuid::Uuid;

    fn sample() -> (OptimisticClient, DocumentNode, DocumentNode, DocumentNode) {
        let project_id = Uuid::new_v4();
        let part = DocumentNode::new(project_id, None, DocumentKind::Part, "Part");
        let chapter = DocumentNode::new(project_id, Some(part.id), DocumentKind::Chapter, "Ch");
        let scene = DocumentNode::new(project_id, Some(chapter.id), DocumentKind::Scene, "Scene");
        let client =
            OptimisticClient::new(vec![part.clone(), chapter.clone(), scene.clone()]);
        (client, part, chapter, scene)
    }

    #[test]
    fn second_structural_mutation_is_busy_but_create_is_not() {
        let (mut client, part, chapter, scene) = sample();
        let plan = client.plan_move(scene.id, Some(part.id)).unwrap();
        client.apply_optimistic(MutationPlan::Move(plan)).unwrap();

        let delete = client.plan_delete(chapter.id, true).unwrap();
        assert!(matches!(
            client.apply_optimistic(MutationPlan::Delete(delete)),
            Err(TreeError::Busy)
        ));

        let create = client
            .plan_create(&CreateRequest {
                title: "New".to_string(),
                kind: DocumentKind::Note,
                project_id: Some(part.project_id),
                selection: None,
            })
            .unwrap();
        assert!(client.apply_optimistic(MutationPlan::Create(create)).is_ok());
    }

    #[test]
    fn failed_move_reverts_and_keeps_destination_expanded() {
        let (mut client, part, _chapter, scene) = sample();
        let before = client.index().edges();
        let plan = client.plan_move(scene.id, Some(part.id)).unwrap();
        let ticket = client.apply_optimistic(MutationPlan::Move(plan)).unwrap();
        assert_eq!(client.node(scene.id).unwrap().parent_id, Some(part.id));

        client
            .revert_optimistic(ticket, &TreeError::Conflict(scene.id))
            .unwrap();
        assert_eq!(client.index().edges(), before);
        assert!(client.view().is_expanded(part.id));
        assert_eq!(client.view().notices().len(), 1);
        assert_eq!(client.view().notices()[0].document_title, "Scene");
    }

    #[test]
    fn delete_clears_focus_and_revert_restores_it() {
        let (mut client, _part, chapter, scene) = sample();
        client.view_mut().focus(Some(scene.id));
        client.view_mut().expand(chapter.id);

        let plan = client.plan_delete(chapter.id, true).unwrap();
        let ticket = client.apply_optimistic(MutationPlan::Delete(plan)).unwrap();
        assert_eq!(client.view().focused(), None);
        assert_eq!(client.nodes().len(), 1);

        client
            .revert_optimistic(ticket, &TreeError::Busy)
            .unwrap();
        assert_eq!(client.nodes().len(), 3);
        assert_eq!(client.view().focused(), Some(scene.id));
        assert!(client.view().is_expanded(chapter.id));
    }

    #[test]
    fn confirm_replaces_provisional_create_with_canonical_node() {
        let (mut client, part, _chapter, _scene) = sample();
        let plan = client
            .plan_create(&CreateRequest {
                title: "  Fresh   idea ".to_string(),
                kind: DocumentKind::Note,
                project_id: Some(part.project_id),
                selection: Some(part.id),
            })
            .unwrap();
        let ticket = client.apply_optimistic(MutationPlan::Create(plan)).unwrap();
        assert_eq!(client.nodes().len(), 4);

        let canonical = DocumentNode::new(
            part.project_id,
            Some(part.id),
            DocumentKind::Note,
            "Fresh idea",
        );
        client.confirm(ticket, Some(canonical.clone())).unwrap();
        assert_eq!(client.nodes().len(), 4);
        assert_eq!(client.node(canonical.id), Some(&canonical));
    }

    #[test]
    fn unknown_ticket_is_rejected() {
        let (mut client, _part, _chapter, scene) = sample();
        let plan = client.plan_move(scene.id, None).unwrap();
        let ticket = client.apply_optimistic(MutationPlan::Move(plan)).unwrap();
        client.confirm(ticket, None).unwrap();
        assert!(matches!(
            client.confirm(ticket, None),
            Err(TreeError::Validation(_))
        ));
    }
}
