//! In-process external store with failure injection.
//!
//! Backs tests and local demos. Deleting a container removes its whole
//! subtree, matching folder semantics of hosted document stores.

use super::{
    DocumentFields, ExternalDocument, ExternalResult, ExternalStore, ExternalStoreError,
    ProjectMetadata,
};
use crate::model::document::DocumentKind;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone)]
struct StoredDocument {
    project_ref: String,
    document: ExternalDocument,
    content: String,
}

#[derive(Debug, Default)]
struct State {
    projects: BTreeMap<String, ProjectMetadata>,
    documents: BTreeMap<String, StoredDocument>,
    next_ref: u64,
    failing_operations: BTreeSet<&'static str>,
    fail_all: bool,
    latency: Option<Duration>,
}

impl State {
    fn allocate_ref(&mut self, prefix: &str) -> String {
        self.next_ref += 1;
        format!("{prefix}-{}", self.next_ref)
    }

    fn check(&self, operation: &'static str) -> ExternalResult<()> {
        if self.fail_all || self.failing_operations.contains(operation) {
            return Err(ExternalStoreError::Unavailable(format!(
                "injected failure for `{operation}`"
            )));
        }
        Ok(())
    }

    fn project_of(&self, parent_ref: &str) -> ExternalResult<String> {
        if self.projects.contains_key(parent_ref) {
            return Ok(parent_ref.to_string());
        }
        self.documents
            .get(parent_ref)
            .map(|stored| stored.project_ref.clone())
            .ok_or_else(|| ExternalStoreError::NotFound(parent_ref.to_string()))
    }

    fn next_order(&self, parent_ref: &str) -> i64 {
        self.documents
            .values()
            .filter(|stored| stored.document.parent_ref.as_deref() == Some(parent_ref))
            .map(|stored| stored.document.order + 1)
            .max()
            .unwrap_or(0)
    }

    fn insert_child(
        &mut self,
        name: &str,
        parent_ref: &str,
        kind: DocumentKind,
    ) -> ExternalResult<String> {
        let project_ref = self.project_of(parent_ref)?;
        let external_ref = self.allocate_ref("doc");
        let order = self.next_order(parent_ref);
        self.documents.insert(
            external_ref.clone(),
            StoredDocument {
                project_ref,
                document: ExternalDocument {
                    external_ref: external_ref.clone(),
                    parent_ref: Some(parent_ref.to_string()),
                    title: name.to_string(),
                    kind,
                    order,
                    synopsis: String::new(),
                },
                content: String::new(),
            },
        );
        Ok(external_ref)
    }
}

/// Thread-safe in-memory external store.
#[derive(Debug, Default)]
pub struct InMemoryExternalStore {
    state: Mutex<State>,
}

impl InMemoryExternalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only happens after a test panic; keep serving.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a project and returns its root ref.
    pub fn add_project(&self, title: &str) -> String {
        let mut state = self.state();
        let root_ref = state.allocate_ref("root");
        state.projects.insert(
            root_ref.clone(),
            ProjectMetadata {
                title: title.to_string(),
                root_ref: root_ref.clone(),
            },
        );
        root_ref
    }

    /// Renames a project, as if edited outside this system.
    pub fn rename_project(&self, root_ref: &str, title: &str) {
        if let Some(project) = self.state().projects.get_mut(root_ref) {
            project.title = title.to_string();
        }
    }

    /// Creates a document directly, bypassing failure injection.
    pub fn seed_document(
        &self,
        parent_ref: &str,
        title: &str,
        kind: DocumentKind,
    ) -> ExternalResult<String> {
        self.state().insert_child(title, parent_ref, kind)
    }

    /// Edits a document directly, as if changed outside this system.
    pub fn edit_document(&self, document_ref: &str, edit: impl FnOnce(&mut ExternalDocument)) {
        if let Some(stored) = self.state().documents.get_mut(document_ref) {
            edit(&mut stored.document);
        }
    }

    /// Removes a document subtree directly, bypassing failure injection.
    pub fn remove_document(&self, document_ref: &str) {
        remove_subtree(&mut self.state(), document_ref);
    }

    pub fn document(&self, document_ref: &str) -> Option<ExternalDocument> {
        self.state()
            .documents
            .get(document_ref)
            .map(|stored| stored.document.clone())
    }

    pub fn content(&self, document_ref: &str) -> Option<String> {
        self.state()
            .documents
            .get(document_ref)
            .map(|stored| stored.content.clone())
    }

    pub fn document_count(&self) -> usize {
        self.state().documents.len()
    }

    /// Makes every call fail with `Unavailable`.
    pub fn set_failing(&self, failing: bool) {
        self.state().fail_all = failing;
    }

    /// Makes one named operation fail with `Unavailable`.
    pub fn fail_operation(&self, operation: &'static str) {
        self.state().failing_operations.insert(operation);
    }

    /// Delays every call by `latency` before it is served.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    async fn enter(&self, operation: &'static str) -> ExternalResult<()> {
        let latency = self.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.state().check(operation)
    }
}

fn remove_subtree(state: &mut State, document_ref: &str) -> usize {
    let mut doomed = vec![document_ref.to_string()];
    let mut seen = BTreeSet::from([document_ref.to_string()]);
    let mut cursor = 0;
    while cursor < doomed.len() {
        let parent = doomed[cursor].clone();
        for stored in state.documents.values() {
            let reference = &stored.document.external_ref;
            if stored.document.parent_ref.as_deref() == Some(parent.as_str())
                && seen.insert(reference.clone())
            {
                doomed.push(reference.clone());
            }
        }
        cursor += 1;
    }
    doomed
        .iter()
        .filter(|reference| state.documents.remove(reference.as_str()).is_some())
        .count()
}

#[async_trait]
impl ExternalStore for InMemoryExternalStore {
    async fn create_container(&self, name: &str, parent_ref: &str) -> ExternalResult<String> {
        self.enter("create_container").await?;
        self.state()
            .insert_child(name, parent_ref, DocumentKind::Folder)
    }

    async fn create_leaf_document(
        &self,
        name: &str,
        parent_ref: &str,
        kind: DocumentKind,
    ) -> ExternalResult<String> {
        self.enter("create_leaf_document").await?;
        if kind.is_container() {
            return Err(ExternalStoreError::Rejected(format!(
                "`{kind}` is not a leaf kind"
            )));
        }
        self.state().insert_child(name, parent_ref, kind)
    }

    async fn list_documents(&self, project_ref: &str) -> ExternalResult<Vec<ExternalDocument>> {
        self.enter("list_documents").await?;
        let state = self.state();
        if !state.projects.contains_key(project_ref) {
            return Err(ExternalStoreError::NotFound(project_ref.to_string()));
        }
        Ok(state
            .documents
            .values()
            .filter(|stored| stored.project_ref == project_ref)
            .map(|stored| stored.document.clone())
            .collect())
    }

    async fn update_document(
        &self,
        project_ref: &str,
        document_ref: &str,
        fields: &DocumentFields,
    ) -> ExternalResult<()> {
        self.enter("update_document").await?;
        let mut state = self.state();
        let stored = state
            .documents
            .get_mut(document_ref)
            .filter(|stored| stored.project_ref == project_ref)
            .ok_or_else(|| ExternalStoreError::NotFound(document_ref.to_string()))?;
        if let Some(title) = &fields.title {
            stored.document.title = title.clone();
        }
        if let Some(kind) = fields.kind {
            stored.document.kind = kind;
        }
        if let Some(synopsis) = &fields.synopsis {
            stored.document.synopsis = synopsis.clone();
        }
        if let Some(parent_ref) = &fields.parent_ref {
            stored.document.parent_ref = Some(parent_ref.clone());
        }
        if let Some(order) = fields.order {
            stored.document.order = order;
        }
        if let Some(content) = &fields.content {
            stored.content = content.clone();
        }
        Ok(())
    }

    async fn delete_document(&self, project_ref: &str, document_ref: &str) -> ExternalResult<()> {
        self.enter("delete_document").await?;
        let mut state = self.state();
        let belongs = state
            .documents
            .get(document_ref)
            .is_some_and(|stored| stored.project_ref == project_ref);
        if !belongs {
            return Err(ExternalStoreError::NotFound(document_ref.to_string()));
        }
        remove_subtree(&mut state, document_ref);
        Ok(())
    }

    async fn get_project_metadata(&self, project_ref: &str) -> ExternalResult<ProjectMetadata> {
        self.enter("get_project_metadata").await?;
        self.state()
            .projects
            .get(project_ref)
            .cloned()
            .ok_or_else(|| ExternalStoreError::NotFound(project_ref.to_string()))
    }
}
