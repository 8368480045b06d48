//! Core engine for manuscript document hierarchies.
//! Keeps a local cache of the tree consistent with an external document store.

pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod external;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;
pub mod tree;

pub use client::optimistic::{OptimisticClient, Ticket};
pub use client::remote::{LocalRemote, TreeRemote};
pub use client::view_state::{Notice, ViewState};
pub use config::{load_config, EngineConfig, MirrorMode};
pub use error::{InvalidMoveReason, TreeError, TreeResult};
pub use external::{ExternalDocument, ExternalStore, ExternalStoreError};
pub use logging::{
    default_log_level, init_logging, init_logging_from_config, logging_status, LogSettings,
    LoggingError,
};
pub use model::document::{
    ChildSummary, DocumentKind, DocumentNode, DocumentStatus, NodeId, NodeKey, ProjectId,
};
pub use model::project::{Principal, Project, SyncStatus};
pub use repo::cache_store::{CacheStore, CacheStoreError, SqliteCacheStore};
pub use service::reconcile_service::{
    Applied, CanDelete, DeleteOutcome, MetadataPatch, MirrorWarning, ProjectTree,
    ReconciliationService,
};
pub use service::sync_driver::{SyncDriver, SyncReport};
pub use tree::cycle::{collect_descendants, is_descendant};
pub use tree::index::TreeIndex;
pub use tree::planner::{plan_create, plan_delete, plan_move, CreateRequest, MutationPlan};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
