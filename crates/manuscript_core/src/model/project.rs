//! Project model and sync status.
//!
//! # Invariants
//! - A project owns exactly one forest of document nodes.
//! - `sync_status` is never left at `Syncing` once a sync pass returns.

use crate::model::document::ProjectId;
use serde::{Deserialize, Serialize};

/// Reconciliation state between cache store and external store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Synced,
    Syncing,
    Error,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "synced" => Some(SyncStatus::Synced),
            "syncing" => Some(SyncStatus::Syncing),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }
}

/// Project record owning one document forest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    /// Principal that owns the project.
    pub owner_id: String,
    pub title: String,
    /// External root folder anchor; also used as the project ref for listing.
    pub external_ref: Option<String>,
    pub sync_status: SyncStatus,
    /// Epoch ms of the last successful sync pass.
    pub last_synced_at: Option<i64>,
    /// Message captured by the last failed sync pass.
    pub sync_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Acting principal of one request, as established by the auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal {
    pub user_id: String,
}

impl Principal {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    /// Returns whether this principal owns `project`.
    pub fn owns(&self, project: &Project) -> bool {
        self.user_id == project.owner_id
    }
}
