//! External document store seam.
//!
//! # Responsibility
//! - Define the collaborator contract of the authoritative document store.
//! - Bound every call with a timeout so no operation blocks indefinitely.
//!
//! # Invariants
//! - A call that exceeds its bound is reported as `ExternalStoreError::Timeout`
//!   and treated like any other failure.
//! - Root-level documents are parented to the project's root ref.

use crate::model::document::{DocumentKind, DocumentStatus};
use async_trait::async_trait;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::time::Duration;

pub mod memory;

/// Errors reported by the external store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalStoreError {
    /// Call did not complete within its bound.
    Timeout {
        operation: &'static str,
        after_ms: u128,
    },
    /// Transport or service failure.
    Unavailable(String),
    /// Referenced document or project is unknown to the store.
    NotFound(String),
    /// Store refused the request.
    Rejected(String),
}

impl Display for ExternalStoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout {
                operation,
                after_ms,
            } => write!(f, "external store `{operation}` timed out after {after_ms}ms"),
            Self::Unavailable(message) => write!(f, "external store unavailable: {message}"),
            Self::NotFound(reference) => write!(f, "external document not found: {reference}"),
            Self::Rejected(message) => write!(f, "external store rejected request: {message}"),
        }
    }
}

impl Error for ExternalStoreError {}

pub type ExternalResult<T> = Result<T, ExternalStoreError>;

/// Metadata of one document as listed by the external store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalDocument {
    pub external_ref: String,
    /// Containing document or project root ref.
    pub parent_ref: Option<String>,
    pub title: String,
    pub kind: DocumentKind,
    pub order: i64,
    pub synopsis: String,
}

/// Project-level metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectMetadata {
    pub title: String,
    pub root_ref: String,
}

/// Partial document update. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentFields {
    pub title: Option<String>,
    pub kind: Option<DocumentKind>,
    pub synopsis: Option<String>,
    pub parent_ref: Option<String>,
    pub order: Option<i64>,
    pub tags: Option<Vec<String>>,
    pub status: Option<DocumentStatus>,
    pub include_in_compile: Option<bool>,
    pub content: Option<String>,
}

impl DocumentFields {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Authoritative document store, authenticated by the auth collaborator.
#[async_trait]
pub trait ExternalStore: Send + Sync {
    async fn create_container(&self, name: &str, parent_ref: &str) -> ExternalResult<String>;
    async fn create_leaf_document(
        &self,
        name: &str,
        parent_ref: &str,
        kind: DocumentKind,
    ) -> ExternalResult<String>;
    async fn list_documents(&self, project_ref: &str) -> ExternalResult<Vec<ExternalDocument>>;
    async fn update_document(
        &self,
        project_ref: &str,
        document_ref: &str,
        fields: &DocumentFields,
    ) -> ExternalResult<()>;
    async fn delete_document(&self, project_ref: &str, document_ref: &str) -> ExternalResult<()>;
    async fn get_project_metadata(&self, project_ref: &str) -> ExternalResult<ProjectMetadata>;
}

/// Runs one external call under a timeout.
pub async fn bounded<T, F>(operation: &'static str, limit: Duration, call: F) -> ExternalResult<T>
where
    F: Future<Output = ExternalResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ExternalStoreError::Timeout {
            operation,
            after_ms: limit.as_millis(),
        }),
    }
}
