//! Full reconciliation pass between cache store and external store.
//!
//! # Responsibility
//! - Pull the external listing and metadata of one project.
//! - Create, delete and refresh cache nodes keyed by external ref.
//! - Record `syncing`/`synced`/`error` on the project.
//!
//! # Invariants
//! - A pass never returns with the project left at `syncing`.
//! - Parents of existing cache nodes are never changed from the external side.
//! - Content and word count are never overwritten.
//! - A second pass with no external change writes nothing.
//! - At most one pass per project runs in this process at a time.
//! - Every node write holds that node's lock from the shared `NodeLocks`.

use crate::error::{TreeError, TreeResult};
use crate::external::{bounded, ExternalDocument, ExternalStore};
use crate::model::document::{DocumentNode, NodeId, ProjectId};
use crate::model::project::{Project, SyncStatus};
use crate::repo::cache_store::{CacheStore, ParentUpdate};
use crate::service::node_locks::NodeLocks;
use log::{error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Outcome of one sync request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub project_id: ProjectId,
    /// Project status after the pass.
    pub status: SyncStatus,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Surviving children moved to root because their parent vanished.
    pub rehomed: usize,
    /// External title differed and was taken.
    pub project_renamed: bool,
    /// Failure message recorded on the project.
    pub error: Option<String>,
    /// Another pass for the same project was already running.
    pub skipped: bool,
}

impl SyncReport {
    fn empty(project_id: ProjectId, status: SyncStatus) -> Self {
        Self {
            project_id,
            status,
            created: 0,
            updated: 0,
            deleted: 0,
            rehomed: 0,
            project_renamed: false,
            error: None,
            skipped: false,
        }
    }

    /// Returns whether the pass wrote anything to the cache store.
    pub fn changed(&self) -> bool {
        self.created + self.updated + self.deleted + self.rehomed > 0 || self.project_renamed
    }
}

/// Runs sync passes for projects backed by one cache and one external store.
pub struct SyncDriver<C: CacheStore> {
    cache: Arc<C>,
    external: Arc<dyn ExternalStore>,
    timeout: Duration,
    locks: NodeLocks,
    running: Mutex<HashSet<ProjectId>>,
}

struct RunningGuard<'a> {
    running: &'a Mutex<HashSet<ProjectId>>,
    project_id: ProjectId,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&self.project_id);
        }
    }
}

impl<C: CacheStore> SyncDriver<C> {
    /// `locks` must be the registry the mutating service writes under.
    pub fn new(
        cache: Arc<C>,
        external: Arc<dyn ExternalStore>,
        timeout: Duration,
        locks: NodeLocks,
    ) -> Self {
        Self {
            cache,
            external,
            timeout,
            locks,
            running: Mutex::new(HashSet::new()),
        }
    }

    /// Runs one full pass for `project`.
    ///
    /// External failures do not surface as `Err`; they end the pass with
    /// `error` status and the message in the report. `Err` is returned only
    /// when the cache store itself fails while recording the status.
    pub async fn run(&self, project: &Project) -> TreeResult<SyncReport> {
        let Some(_guard) = self.try_enter(project.id) else {
            warn!(
                "event=sync_run module=sync status=skipped project_id={} reason=already_running",
                project.id
            );
            let mut report = SyncReport::empty(project.id, project.sync_status);
            report.skipped = true;
            return Ok(report);
        };
        if project.sync_status == SyncStatus::Syncing {
            warn!(
                "event=sync_run module=sync status=warn project_id={} reason=stale_syncing_status",
                project.id
            );
        }

        let started_at = Instant::now();
        info!(
            "event=sync_run module=sync status=start project_id={}",
            project.id
        );
        self.cache
            .set_sync_status(project.id, SyncStatus::Syncing, None)?;

        let mut report = SyncReport::empty(project.id, SyncStatus::Syncing);
        match self.reconcile(project, &mut report).await {
            Ok(()) => {
                let stored = self
                    .cache
                    .set_sync_status(project.id, SyncStatus::Synced, None)?;
                report.status = stored.sync_status;
                info!(
                    "event=sync_run module=sync status=ok project_id={} created={} updated={} deleted={} rehomed={} duration_ms={}",
                    project.id,
                    report.created,
                    report.updated,
                    report.deleted,
                    report.rehomed,
                    started_at.elapsed().as_millis()
                );
            }
            Err(err) => {
                let message = err.to_string();
                let stored =
                    self.cache
                        .set_sync_status(project.id, SyncStatus::Error, Some(&message))?;
                report.status = stored.sync_status;
                report.error = Some(message);
                error!(
                    "event=sync_run module=sync status=error project_id={} duration_ms={} error={err}",
                    project.id,
                    started_at.elapsed().as_millis()
                );
            }
        }
        Ok(report)
    }

    fn try_enter(&self, project_id: ProjectId) -> Option<RunningGuard<'_>> {
        let mut running = self.running.lock().ok()?;
        if !running.insert(project_id) {
            return None;
        }
        Some(RunningGuard {
            running: &self.running,
            project_id,
        })
    }

    async fn reconcile(&self, project: &Project, report: &mut SyncReport) -> TreeResult<()> {
        let project_ref = project.external_ref.as_deref().ok_or_else(|| {
            TreeError::Validation(format!(
                "project {} has no external root to sync from",
                project.id
            ))
        })?;

        // Refs recorded after the listing is fetched are not evidence of a
        // vanished document.
        let known: HashSet<String> = self
            .cache
            .list_project_nodes(project.id)?
            .into_iter()
            .filter_map(|node| node.external_ref)
            .collect();

        let metadata = bounded(
            "get_project_metadata",
            self.timeout,
            self.external.get_project_metadata(project_ref),
        )
        .await?;
        let listing = bounded(
            "list_documents",
            self.timeout,
            self.external.list_documents(project_ref),
        )
        .await?;

        if metadata.title != project.title {
            self.cache.rename_project(project.id, &metadata.title)?;
            report.project_renamed = true;
        }

        let remote: HashMap<&str, &ExternalDocument> = listing
            .iter()
            .map(|document| (document.external_ref.as_str(), document))
            .collect();

        self.remove_vanished(project.id, &known, &remote, report)
            .await?;
        self.create_discovered(project, project_ref, &listing, report)
            .await?;
        self.refresh_descriptive_fields(project.id, &remote, report)
            .await?;
        Ok(())
    }

    async fn remove_vanished(
        &self,
        project_id: ProjectId,
        known: &HashSet<String>,
        remote: &HashMap<&str, &ExternalDocument>,
        report: &mut SyncReport,
    ) -> TreeResult<()> {
        let cached = self.cache.list_project_nodes(project_id)?;
        let candidates: Vec<NodeId> = vanished_nodes(&cached, known, remote).into_iter().collect();
        if candidates.is_empty() {
            return Ok(());
        }

        // Creates and moves into a vanished node hold its lock; re-read under ours.
        let _guard = self.locks.acquire(&candidates).await;
        let cached = self.cache.list_project_nodes(project_id)?;
        let vanished: HashSet<NodeId> = vanished_nodes(&cached, known, remote)
            .into_iter()
            .filter(|id| candidates.contains(id))
            .collect();

        for node in &cached {
            let Some(parent_id) = node.parent_id else {
                continue;
            };
            if vanished.contains(&parent_id) && !vanished.contains(&node.id) {
                match self
                    .cache
                    .update_parent_if_matches(node.id, Some(parent_id), None)?
                {
                    ParentUpdate::Applied => {
                        report.rehomed += 1;
                        info!(
                            "event=sync_rehome module=sync status=ok node_id={} former_parent={parent_id}",
                            node.id
                        );
                    }
                    outcome => warn!(
                        "event=sync_rehome module=sync status=skipped node_id={} outcome={outcome:?}",
                        node.id
                    ),
                }
            }
        }

        let doomed = deepest_first(&vanished, &cached);
        report.deleted += self.cache.delete_nodes(&doomed)?;
        Ok(())
    }

    async fn create_discovered(
        &self,
        project: &Project,
        project_ref: &str,
        listing: &[ExternalDocument],
        report: &mut SyncReport,
    ) -> TreeResult<()> {
        let mut by_ref: HashMap<String, DocumentNode> = self
            .cache
            .list_project_nodes(project.id)?
            .into_iter()
            .filter_map(|node| {
                node.external_ref
                    .clone()
                    .map(|external_ref| (external_ref, node))
            })
            .collect();

        let mut discovered: Vec<&ExternalDocument> = listing
            .iter()
            .filter(|document| !by_ref.contains_key(&document.external_ref))
            .collect();
        let depths = external_depths(listing, project_ref);
        discovered.sort_by(|left, right| {
            let left_depth = depths.get(left.external_ref.as_str()).copied();
            let right_depth = depths.get(right.external_ref.as_str()).copied();
            left_depth
                .cmp(&right_depth)
                .then(left.order.cmp(&right.order))
                .then(left.external_ref.cmp(&right.external_ref))
        });

        for document in discovered {
            let wanted_parent = match document.parent_ref.as_deref() {
                None => None,
                Some(parent_ref) if parent_ref == project_ref => None,
                Some(parent_ref) => match by_ref.get(parent_ref) {
                    Some(parent) if parent.is_container() => Some(parent.id),
                    _ => {
                        warn!(
                            "event=sync_create module=sync status=warn external_ref={} parent_ref={parent_ref} reason=parent_unresolved placed=root",
                            document.external_ref
                        );
                        None
                    }
                },
            };

            let lock_ids: Vec<NodeId> = wanted_parent.into_iter().collect();
            let _guard = self.locks.acquire(&lock_ids).await;
            if self
                .cache
                .find_by_external_ref(Some(project.id), &document.external_ref)?
                .is_some()
            {
                continue;
            }
            let parent_id = match wanted_parent {
                Some(parent_id) => self
                    .cache
                    .get_node(parent_id)?
                    .filter(DocumentNode::is_container)
                    .map(|parent| parent.id),
                None => None,
            };

            let mut node =
                DocumentNode::new(project.id, parent_id, document.kind, document.title.clone());
            node.order = document.order;
            node.synopsis = document.synopsis.clone();
            node.external_ref = Some(document.external_ref.clone());
            let stored = self.cache.insert_node(&node)?;
            by_ref.insert(document.external_ref.clone(), stored);
            report.created += 1;
        }
        Ok(())
    }

    async fn refresh_descriptive_fields(
        &self,
        project_id: ProjectId,
        remote: &HashMap<&str, &ExternalDocument>,
        report: &mut SyncReport,
    ) -> TreeResult<()> {
        for node in self.cache.list_project_nodes(project_id)? {
            let Some(document) = node
                .external_ref
                .as_deref()
                .and_then(|external_ref| remote.get(external_ref))
            else {
                continue;
            };
            if !describes_differently(&node, document) {
                continue;
            }

            // Moves and creates lock their target parent, so the child check
            // below cannot go stale before the write.
            let _guard = self.locks.acquire(&[node.id]).await;
            let Some(current) = self.cache.get_node(node.id)? else {
                continue;
            };
            let has_children = !self.cache.list_children(current.id)?.is_empty();
            let next = take_descriptive_fields(&current, document, has_children);
            if next != current {
                self.cache.update_descriptive_fields(&next)?;
                report.updated += 1;
            }
        }
        Ok(())
    }
}

/// Nodes whose ref was known before the listing and is absent from it.
fn vanished_nodes(
    cached: &[DocumentNode],
    known: &HashSet<String>,
    remote: &HashMap<&str, &ExternalDocument>,
) -> HashSet<NodeId> {
    cached
        .iter()
        .filter(|node| {
            node.external_ref.as_deref().is_some_and(|external_ref| {
                known.contains(external_ref) && !remote.contains_key(external_ref)
            })
        })
        .map(|node| node.id)
        .collect()
}

fn describes_differently(node: &DocumentNode, document: &ExternalDocument) -> bool {
    node.title != document.title
        || node.order != document.order
        || node.synopsis != document.synopsis
        || node.kind != document.kind
}

/// Copies the externally owned fields onto `current`.
///
/// A kind change that would leave children under a leaf is dropped.
fn take_descriptive_fields(
    current: &DocumentNode,
    document: &ExternalDocument,
    has_children: bool,
) -> DocumentNode {
    let mut next = current.clone();
    next.title = document.title.clone();
    next.order = document.order;
    next.synopsis = document.synopsis.clone();
    if document.kind != current.kind {
        if has_children && !document.kind.is_container() {
            warn!(
                "event=sync_update module=sync status=warn node_id={} reason=kind_would_orphan_children kept={} external={}",
                current.id, current.kind, document.kind
            );
        } else {
            next.kind = document.kind;
        }
    }
    next
}

/// Orders `ids` so every node precedes its ancestors.
fn deepest_first(ids: &HashSet<NodeId>, nodes: &[DocumentNode]) -> Vec<NodeId> {
    let parents: HashMap<NodeId, Option<NodeId>> =
        nodes.iter().map(|node| (node.id, node.parent_id)).collect();

    let mut ranked: Vec<(usize, NodeId)> = ids
        .iter()
        .map(|id| {
            let mut depth = 0;
            let mut seen = HashSet::from([*id]);
            let mut cursor = parents.get(id).copied().flatten();
            while let Some(current) = cursor {
                if !seen.insert(current) {
                    break;
                }
                depth += 1;
                cursor = parents.get(&current).copied().flatten();
            }
            (depth, *id)
        })
        .collect();
    ranked.sort_by(|left, right| right.cmp(left));
    ranked.into_iter().map(|(_, id)| id).collect()
}

/// Depth of each listed document below the project root; unreachable chains
/// get the length walked before the chain broke.
fn external_depths<'a>(listing: &'a [ExternalDocument], project_ref: &str) -> HashMap<&'a str, usize> {
    let parents: HashMap<&str, Option<&str>> = listing
        .iter()
        .map(|document| {
            (
                document.external_ref.as_str(),
                document.parent_ref.as_deref(),
            )
        })
        .collect();

    listing
        .iter()
        .map(|document| {
            let start = document.external_ref.as_str();
            let mut depth = 0;
            let mut seen = HashSet::from([start]);
            let mut cursor = document.parent_ref.as_deref();
            while let Some(current) = cursor {
                if current == project_ref || !seen.insert(current) {
                    break;
                }
                depth += 1;
                cursor = parents.get(current).copied().flatten();
            }
            (start, depth)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{deepest_first, vanished_nodes, SyncDriver};
    use crate::db::open_db_in_memory;
    use crate::external::memory::InMemoryExternalStore;
    use crate::external::{ExternalDocument, ExternalStore};
    use crate::model::document::{DocumentKind, DocumentNode};
    use crate::model::project::SyncStatus;
    use crate::repo::cache_store::{CacheStore, NewProject, SqliteCacheStore};
    use crate::service::node_locks::NodeLocks;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    struct Fixture {
        cache: Arc<SqliteCacheStore>,
        external: Arc<InMemoryExternalStore>,
        driver: Arc<SyncDriver<SqliteCacheStore>>,
        locks: NodeLocks,
    }

    fn fixture() -> Fixture {
        let cache = Arc::new(SqliteCacheStore::try_new(open_db_in_memory().unwrap()).unwrap());
        let external = Arc::new(InMemoryExternalStore::new());
        let locks = NodeLocks::new();
        let driver = Arc::new(SyncDriver::new(
            Arc::clone(&cache),
            Arc::clone(&external) as Arc<dyn ExternalStore>,
            Duration::from_secs(1),
            locks.clone(),
        ));
        Fixture {
            cache,
            external,
            driver,
            locks,
        }
    }

    fn linked_project(fx: &Fixture, root: &str) -> crate::model::project::Project {
        fx.cache
            .create_project(&NewProject {
                owner_id: "u1".to_string(),
                title: "Novel".to_string(),
                external_ref: Some(root.to_string()),
            })
            .unwrap()
    }

    #[test]
    fn deepest_first_orders_children_before_parents() {
        let project_id = Uuid::new_v4();
        let top = DocumentNode::new(project_id, None, DocumentKind::Part, "top");
        let mid = DocumentNode::new(project_id, Some(top.id), DocumentKind::Chapter, "mid");
        let leaf = DocumentNode::new(project_id, Some(mid.id), DocumentKind::Scene, "leaf");
        let ids = HashSet::from([top.id, mid.id, leaf.id]);
        let nodes = vec![top.clone(), mid.clone(), leaf.clone()];

        assert_eq!(deepest_first(&ids, &nodes), vec![leaf.id, mid.id, top.id]);
    }

    #[tokio::test]
    async fn nested_discoveries_keep_external_parents() {
        let fx = fixture();
        let root = fx.external.add_project("Novel");
        let part = fx
            .external
            .seed_document(&root, "Part One", DocumentKind::Part)
            .unwrap();
        let scene = fx
            .external
            .seed_document(&part, "Opening", DocumentKind::Scene)
            .unwrap();
        let project = linked_project(&fx, &root);
        let cache = &fx.cache;

        let report = fx.driver.run(&project).await.unwrap();
        assert_eq!(report.status, SyncStatus::Synced);
        assert_eq!(report.created, 2);

        let part_node = cache.find_by_external_ref(Some(project.id), &part).unwrap().unwrap();
        let scene_node = cache.find_by_external_ref(Some(project.id), &scene).unwrap().unwrap();
        assert_eq!(part_node.parent_id, None);
        assert_eq!(scene_node.parent_id, Some(part_node.id));
    }

    #[tokio::test]
    async fn missing_external_root_ends_in_error_status() {
        let fx = fixture();
        let (cache, driver) = (&fx.cache, &fx.driver);
        let project = cache
            .create_project(&NewProject {
                owner_id: "u1".to_string(),
                title: "Loose".to_string(),
                external_ref: None,
            })
            .unwrap();

        let report = driver.run(&project).await.unwrap();
        assert_eq!(report.status, SyncStatus::Error);
        assert!(report.error.is_some());
        let stored = cache.get_project(project.id).unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Error);
    }

    #[test]
    fn refs_recorded_after_the_listing_are_not_vanished() {
        let project_id = Uuid::new_v4();
        let mut old = DocumentNode::new(project_id, None, DocumentKind::Scene, "old");
        old.external_ref = Some("doc-1".to_string());
        let mut fresh = DocumentNode::new(project_id, None, DocumentKind::Scene, "fresh");
        fresh.external_ref = Some("doc-9".to_string());
        let known = HashSet::from(["doc-1".to_string()]);
        let remote: HashMap<&str, &ExternalDocument> = HashMap::new();

        let gone = vanished_nodes(&[old.clone(), fresh], &known, &remote);
        assert_eq!(gone, HashSet::from([old.id]));
    }

    #[tokio::test]
    async fn kind_change_rechecks_children_under_the_node_lock() {
        let fx = fixture();
        let root = fx.external.add_project("Novel");
        let box_ref = fx
            .external
            .seed_document(&root, "Box", DocumentKind::Folder)
            .unwrap();
        let project = linked_project(&fx, &root);
        fx.driver.run(&project).await.unwrap();
        let folder = fx
            .cache
            .find_by_external_ref(Some(project.id), &box_ref)
            .unwrap()
            .unwrap();
        let loose = fx
            .cache
            .insert_node(&DocumentNode::new(project.id, None, DocumentKind::Scene, "Loose"))
            .unwrap();
        fx.external
            .edit_document(&box_ref, |document| document.kind = DocumentKind::Scene);

        let held = fx.locks.acquire(&[folder.id]).await;
        let pass = {
            let driver = Arc::clone(&fx.driver);
            let project = project.clone();
            tokio::spawn(async move { driver.run(&project).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pass.is_finished());

        // A move into the folder commits while the pass waits for its lock.
        fx.cache
            .update_parent_if_matches(loose.id, None, Some(folder.id))
            .unwrap();
        drop(held);

        let report = pass.await.unwrap().unwrap();
        assert_eq!(report.status, SyncStatus::Synced);
        assert_eq!(report.updated, 0);
        let stored = fx.cache.get_node(folder.id).unwrap().unwrap();
        assert_eq!(stored.kind, DocumentKind::Folder);
        assert_eq!(
            fx.cache.get_node(loose.id).unwrap().unwrap().parent_id,
            Some(folder.id)
        );
    }
}
