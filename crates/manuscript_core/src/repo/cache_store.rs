//! Cache-store contracts and SQLite implementation.
//!
//! # Responsibility
//! - Persist projects and document nodes for fast local querying.
//! - Provide the atomic primitives the reconciliation layer relies on.
//!
//! # Invariants
//! - Child listing is deterministic: `sort_order ASC, created_at ASC, node_uuid ASC`.
//! - `update_parent_if_matches` only writes when the stored parent equals the
//!   expected parent, so concurrent moves cannot silently overwrite each other.
//! - `delete_nodes` runs in one transaction; foreign keys reject any order that
//!   would orphan a child.

use crate::db::migrations::latest_version;
use crate::db::DbError;
use crate::model::document::{DocumentKind, DocumentNode, DocumentStatus, NodeId, ProjectId};
use crate::model::project::{Project, SyncStatus};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const DOCUMENT_COLUMNS: &str = "node_uuid,
    project_uuid,
    parent_uuid,
    kind,
    sort_order,
    title,
    synopsis,
    tags,
    status,
    include_in_compile,
    word_count,
    content,
    external_ref,
    created_at,
    updated_at,
    last_edited_at";

const PROJECT_COLUMNS: &str = "project_uuid,
    owner_id,
    title,
    external_ref,
    sync_status,
    last_synced_at,
    sync_error,
    created_at,
    updated_at";

/// Result type used by cache-store operations.
pub type CacheResult<T> = Result<T, CacheStoreError>;

/// Errors from cache-store operations.
#[derive(Debug)]
pub enum CacheStoreError {
    /// Underlying SQLite/bootstrap error.
    Db(DbError),
    /// Target node does not exist.
    NodeNotFound(NodeId),
    /// Target project does not exist.
    ProjectNotFound(ProjectId),
    /// Connection schema is not at the expected migrated version.
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    /// Required table is missing.
    MissingRequiredTable(&'static str),
    /// Persisted data cannot be converted to a valid read model.
    InvalidData(String),
    /// Connection mutex was poisoned by a panicking writer.
    LockPoisoned,
}

impl Display for CacheStoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::NodeNotFound(id) => write!(f, "cached document not found: {id}"),
            Self::ProjectNotFound(id) => write!(f, "cached project not found: {id}"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "cache store requires schema version {expected_version}, got {actual_version}"
            ),
            Self::MissingRequiredTable(table) => {
                write!(f, "cache store requires table `{table}`")
            }
            Self::InvalidData(message) => write!(f, "invalid cached data: {message}"),
            Self::LockPoisoned => write!(f, "cache store connection lock poisoned"),
        }
    }
}

impl Error for CacheStoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for CacheStoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for CacheStoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Outcome of a guarded parent update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentUpdate {
    /// Parent was written.
    Applied,
    /// Stored parent no longer matched the expected parent; nothing written.
    ParentChanged,
    /// New parent lies inside the node's subtree; nothing written.
    WouldCycle,
}

/// Input for creating one project row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProject {
    pub owner_id: String,
    pub title: String,
    pub external_ref: Option<String>,
}

/// Repository interface for the cache store.
pub trait CacheStore: Send + Sync {
    /// Creates one project in `synced` state.
    fn create_project(&self, project: &NewProject) -> CacheResult<Project>;
    /// Loads one project by id.
    fn get_project(&self, project_id: ProjectId) -> CacheResult<Option<Project>>;
    /// Overwrites the project title.
    fn rename_project(&self, project_id: ProjectId, title: &str) -> CacheResult<()>;
    /// Records sync status; `Synced` also refreshes `last_synced_at`.
    fn set_sync_status(
        &self,
        project_id: ProjectId,
        status: SyncStatus,
        error: Option<&str>,
    ) -> CacheResult<Project>;
    /// Inserts one node as given and returns the stored row.
    fn insert_node(&self, node: &DocumentNode) -> CacheResult<DocumentNode>;
    /// Next free sibling order under `parent_id` within a project.
    fn next_sort_order(
        &self,
        project_id: ProjectId,
        parent_id: Option<NodeId>,
    ) -> CacheResult<i64>;
    /// Loads one node by cache id.
    fn get_node(&self, node_id: NodeId) -> CacheResult<Option<DocumentNode>>;
    /// Loads one node by external-store key, optionally scoped to a project.
    fn find_by_external_ref(
        &self,
        project_id: Option<ProjectId>,
        external_ref: &str,
    ) -> CacheResult<Option<DocumentNode>>;
    /// Finds a node by external ref among projects owned by `owner_id`.
    fn find_owned_by_external_ref(
        &self,
        owner_id: &str,
        external_ref: &str,
    ) -> CacheResult<Option<DocumentNode>>;
    /// Lists every node of one project.
    fn list_project_nodes(&self, project_id: ProjectId) -> CacheResult<Vec<DocumentNode>>;
    /// Lists direct children of one node.
    fn list_children(&self, parent_id: NodeId) -> CacheResult<Vec<DocumentNode>>;
    /// Writes descriptive and content fields; parent and project are untouched.
    fn update_node(&self, node: &DocumentNode) -> CacheResult<DocumentNode>;
    /// Writes only the externally owned fields: kind, order, title, synopsis.
    fn update_descriptive_fields(&self, node: &DocumentNode) -> CacheResult<DocumentNode>;
    /// Sets `parent_id` only when the stored parent equals `expected_parent`
    /// and `new_parent` is not inside the node's own subtree.
    ///
    /// The guard check and the write happen atomically.
    fn update_parent_if_matches(
        &self,
        node_id: NodeId,
        expected_parent: Option<NodeId>,
        new_parent: Option<NodeId>,
    ) -> CacheResult<ParentUpdate>;
    /// Records the external-store key of one node.
    fn set_external_ref(&self, node_id: NodeId, external_ref: &str) -> CacheResult<()>;
    /// Deletes nodes in the given order inside one transaction.
    ///
    /// Returns the number of rows removed.
    fn delete_nodes(&self, node_ids: &[NodeId]) -> CacheResult<usize>;
}

/// SQLite-backed cache store.
pub struct SqliteCacheStore {
    conn: Mutex<Connection>,
}

impl SqliteCacheStore {
    /// Creates the store from a migrated connection.
    ///
    /// # Errors
    /// - `UninitializedConnection` when migrations have not been applied.
    /// - `MissingRequiredTable` when the schema is incomplete.
    pub fn try_new(conn: Connection) -> CacheResult<Self> {
        ensure_cache_connection_ready(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> CacheResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| CacheStoreError::LockPoisoned)
    }
}

impl CacheStore for SqliteCacheStore {
    fn create_project(&self, project: &NewProject) -> CacheResult<Project> {
        let conn = self.lock()?;
        let project_id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO projects (project_uuid, owner_id, title, external_ref, sync_status)
             VALUES (?1, ?2, ?3, ?4, 'synced');",
            params![
                project_id.to_string(),
                project.owner_id,
                project.title,
                project.external_ref,
            ],
        )?;
        load_required_project(&conn, project_id)
    }

    fn get_project(&self, project_id: ProjectId) -> CacheResult<Option<Project>> {
        let conn = self.lock()?;
        load_project(&conn, project_id)
    }

    fn rename_project(&self, project_id: ProjectId, title: &str) -> CacheResult<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE projects
             SET title = ?2,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE project_uuid = ?1;",
            params![project_id.to_string(), title],
        )?;
        if changed == 0 {
            return Err(CacheStoreError::ProjectNotFound(project_id));
        }
        Ok(())
    }

    fn set_sync_status(
        &self,
        project_id: ProjectId,
        status: SyncStatus,
        error: Option<&str>,
    ) -> CacheResult<Project> {
        let conn = self.lock()?;
        let changed = match status {
            SyncStatus::Synced => conn.execute(
                "UPDATE projects
                 SET sync_status = 'synced',
                     sync_error = NULL,
                     last_synced_at = (strftime('%s', 'now') * 1000),
                     updated_at = (strftime('%s', 'now') * 1000)
                 WHERE project_uuid = ?1;",
                [project_id.to_string()],
            )?,
            SyncStatus::Syncing | SyncStatus::Error => conn.execute(
                "UPDATE projects
                 SET sync_status = ?2,
                     sync_error = ?3,
                     updated_at = (strftime('%s', 'now') * 1000)
                 WHERE project_uuid = ?1;",
                params![project_id.to_string(), status.as_str(), error],
            )?,
        };
        if changed == 0 {
            return Err(CacheStoreError::ProjectNotFound(project_id));
        }
        load_required_project(&conn, project_id)
    }

    fn insert_node(&self, node: &DocumentNode) -> CacheResult<DocumentNode> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO documents (
                node_uuid,
                project_uuid,
                parent_uuid,
                kind,
                sort_order,
                title,
                synopsis,
                tags,
                status,
                include_in_compile,
                word_count,
                content,
                external_ref,
                created_at,
                updated_at,
                last_edited_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16);",
            params![
                node.id.to_string(),
                node.project_id.to_string(),
                node.parent_id.map(|value| value.to_string()),
                node.kind.as_str(),
                node.order,
                node.title,
                node.synopsis,
                encode_tags(&node.tags)?,
                node.status.as_str(),
                bool_to_int(node.include_in_compile),
                node.word_count,
                node.content,
                node.external_ref,
                node.created_at,
                node.updated_at,
                node.last_edited_at,
            ],
        )?;
        load_required_node(&conn, node.id)
    }

    fn next_sort_order(
        &self,
        project_id: ProjectId,
        parent_id: Option<NodeId>,
    ) -> CacheResult<i64> {
        let conn = self.lock()?;
        let next = conn.query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1
             FROM documents
             WHERE project_uuid = ?1
               AND parent_uuid IS ?2;",
            params![
                project_id.to_string(),
                parent_id.map(|value| value.to_string())
            ],
            |row| row.get(0),
        )?;
        Ok(next)
    }

    fn get_node(&self, node_id: NodeId) -> CacheResult<Option<DocumentNode>> {
        let conn = self.lock()?;
        load_node(&conn, node_id)
    }

    fn find_by_external_ref(
        &self,
        project_id: Option<ProjectId>,
        external_ref: &str,
    ) -> CacheResult<Option<DocumentNode>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS}
             FROM documents
             WHERE external_ref = ?1
               AND (?2 IS NULL OR project_uuid = ?2)
             ORDER BY created_at ASC, node_uuid ASC
             LIMIT 1;"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![
            external_ref,
            project_id.map(|value| value.to_string())
        ])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_document_row(row)?));
        }
        Ok(None)
    }

    fn find_owned_by_external_ref(
        &self,
        owner_id: &str,
        external_ref: &str,
    ) -> CacheResult<Option<DocumentNode>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS}
             FROM documents
             WHERE external_ref = ?1
               AND project_uuid IN (SELECT project_uuid FROM projects WHERE owner_id = ?2)
             ORDER BY created_at ASC, node_uuid ASC
             LIMIT 1;"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![external_ref, owner_id])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_document_row(row)?));
        }
        Ok(None)
    }

    fn list_project_nodes(&self, project_id: ProjectId) -> CacheResult<Vec<DocumentNode>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS}
             FROM documents
             WHERE project_uuid = ?1
             ORDER BY sort_order ASC, created_at ASC, node_uuid ASC;"
        );
        query_documents(&conn, &sql, &project_id.to_string())
    }

    fn list_children(&self, parent_id: NodeId) -> CacheResult<Vec<DocumentNode>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS}
             FROM documents
             WHERE parent_uuid = ?1
             ORDER BY sort_order ASC, created_at ASC, node_uuid ASC;"
        );
        query_documents(&conn, &sql, &parent_id.to_string())
    }

    fn update_node(&self, node: &DocumentNode) -> CacheResult<DocumentNode> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE documents
             SET kind = ?2,
                 sort_order = ?3,
                 title = ?4,
                 synopsis = ?5,
                 tags = ?6,
                 status = ?7,
                 include_in_compile = ?8,
                 word_count = ?9,
                 content = ?10,
                 last_edited_at = ?11,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE node_uuid = ?1;",
            params![
                node.id.to_string(),
                node.kind.as_str(),
                node.order,
                node.title,
                node.synopsis,
                encode_tags(&node.tags)?,
                node.status.as_str(),
                bool_to_int(node.include_in_compile),
                node.word_count,
                node.content,
                node.last_edited_at,
            ],
        )?;
        if changed == 0 {
            return Err(CacheStoreError::NodeNotFound(node.id));
        }
        load_required_node(&conn, node.id)
    }

    fn update_descriptive_fields(&self, node: &DocumentNode) -> CacheResult<DocumentNode> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE documents
             SET kind = ?2,
                 sort_order = ?3,
                 title = ?4,
                 synopsis = ?5,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE node_uuid = ?1;",
            params![
                node.id.to_string(),
                node.kind.as_str(),
                node.order,
                node.title,
                node.synopsis,
            ],
        )?;
        if changed == 0 {
            return Err(CacheStoreError::NodeNotFound(node.id));
        }
        load_required_node(&conn, node.id)
    }

    fn update_parent_if_matches(
        &self,
        node_id: NodeId,
        expected_parent: Option<NodeId>,
        new_parent: Option<NodeId>,
    ) -> CacheResult<ParentUpdate> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<Option<String>> = tx
            .query_row(
                "SELECT parent_uuid FROM documents WHERE node_uuid = ?1;",
                [node_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Err(CacheStoreError::NodeNotFound(node_id));
        };
        let current = current
            .map(|value| parse_uuid(&value, "documents.parent_uuid"))
            .transpose()?;
        if current != expected_parent {
            return Ok(ParentUpdate::ParentChanged);
        }

        if let Some(new_parent) = new_parent {
            let would_cycle: i64 = tx.query_row(
                "WITH RECURSIVE chain(node_uuid) AS (
                    SELECT ?1
                    UNION
                    SELECT d.parent_uuid
                    FROM documents d
                    INNER JOIN chain c ON d.node_uuid = c.node_uuid
                    WHERE d.parent_uuid IS NOT NULL
                )
                SELECT EXISTS(SELECT 1 FROM chain WHERE node_uuid = ?2);",
                params![new_parent.to_string(), node_id.to_string()],
                |row| row.get(0),
            )?;
            if would_cycle == 1 {
                return Ok(ParentUpdate::WouldCycle);
            }
        }

        tx.execute(
            "UPDATE documents
             SET parent_uuid = ?2,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE node_uuid = ?1;",
            params![
                node_id.to_string(),
                new_parent.map(|value| value.to_string()),
            ],
        )?;
        tx.commit()?;
        Ok(ParentUpdate::Applied)
    }

    fn set_external_ref(&self, node_id: NodeId, external_ref: &str) -> CacheResult<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE documents
             SET external_ref = ?2
             WHERE node_uuid = ?1;",
            params![node_id.to_string(), external_ref],
        )?;
        if changed == 0 {
            return Err(CacheStoreError::NodeNotFound(node_id));
        }
        Ok(())
    }

    fn delete_nodes(&self, node_ids: &[NodeId]) -> CacheResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut removed = 0;
        for node_id in node_ids {
            removed += tx.execute(
                "DELETE FROM documents WHERE node_uuid = ?1;",
                [node_id.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(removed)
    }
}

fn query_documents(conn: &Connection, sql: &str, key: &str) -> CacheResult<Vec<DocumentNode>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([key])?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(parse_document_row(row)?);
    }
    Ok(items)
}

fn load_node(conn: &Connection, node_id: NodeId) -> CacheResult<Option<DocumentNode>> {
    let sql = format!(
        "SELECT {DOCUMENT_COLUMNS}
         FROM documents
         WHERE node_uuid = ?1;"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([node_id.to_string()])?;
    if let Some(row) = rows.next()? {
        return Ok(Some(parse_document_row(row)?));
    }
    Ok(None)
}

fn load_required_node(conn: &Connection, node_id: NodeId) -> CacheResult<DocumentNode> {
    load_node(conn, node_id)?.ok_or(CacheStoreError::NodeNotFound(node_id))
}

fn load_project(conn: &Connection, project_id: ProjectId) -> CacheResult<Option<Project>> {
    let sql = format!(
        "SELECT {PROJECT_COLUMNS}
         FROM projects
         WHERE project_uuid = ?1;"
    );
    conn.query_row(&sql, [project_id.to_string()], |row| Ok(parse_project_row(row)))
        .optional()?
        .transpose()
}

fn load_required_project(conn: &Connection, project_id: ProjectId) -> CacheResult<Project> {
    load_project(conn, project_id)?.ok_or(CacheStoreError::ProjectNotFound(project_id))
}

fn parse_document_row(row: &Row<'_>) -> CacheResult<DocumentNode> {
    let id = parse_uuid(&row.get::<_, String>("node_uuid")?, "documents.node_uuid")?;
    let project_id = parse_uuid(
        &row.get::<_, String>("project_uuid")?,
        "documents.project_uuid",
    )?;
    let parent_id = row
        .get::<_, Option<String>>("parent_uuid")?
        .map(|value| parse_uuid(&value, "documents.parent_uuid"))
        .transpose()?;

    let kind_text: String = row.get("kind")?;
    let kind = DocumentKind::parse(&kind_text).ok_or_else(|| {
        CacheStoreError::InvalidData(format!("invalid kind `{kind_text}` in documents.kind"))
    })?;
    let status_text: String = row.get("status")?;
    let status = DocumentStatus::parse(&status_text).ok_or_else(|| {
        CacheStoreError::InvalidData(format!(
            "invalid status `{status_text}` in documents.status"
        ))
    })?;
    let tags_text: String = row.get("tags")?;
    let tags: Vec<String> = serde_json::from_str(&tags_text).map_err(|err| {
        CacheStoreError::InvalidData(format!("invalid tags `{tags_text}` in documents.tags: {err}"))
    })?;

    Ok(DocumentNode {
        id,
        project_id,
        parent_id,
        kind,
        order: row.get("sort_order")?,
        title: row.get("title")?,
        synopsis: row.get("synopsis")?,
        tags,
        status,
        include_in_compile: int_to_bool(row.get("include_in_compile")?, "include_in_compile")?,
        word_count: row.get("word_count")?,
        content: row.get("content")?,
        external_ref: row.get("external_ref")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        last_edited_at: row.get("last_edited_at")?,
    })
}

fn parse_project_row(row: &Row<'_>) -> CacheResult<Project> {
    let id = parse_uuid(
        &row.get::<_, String>("project_uuid")?,
        "projects.project_uuid",
    )?;
    let status_text: String = row.get("sync_status")?;
    let sync_status = SyncStatus::parse(&status_text).ok_or_else(|| {
        CacheStoreError::InvalidData(format!(
            "invalid sync status `{status_text}` in projects.sync_status"
        ))
    })?;
    Ok(Project {
        id,
        owner_id: row.get("owner_id")?,
        title: row.get("title")?,
        external_ref: row.get("external_ref")?,
        sync_status,
        last_synced_at: row.get("last_synced_at")?,
        sync_error: row.get("sync_error")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn encode_tags(tags: &[String]) -> CacheResult<String> {
    serde_json::to_string(tags)
        .map_err(|err| CacheStoreError::InvalidData(format!("unencodable tags: {err}")))
}

fn bool_to_int(value: bool) -> i64 {
    i64::from(value)
}

fn int_to_bool(value: i64, column: &'static str) -> CacheResult<bool> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(CacheStoreError::InvalidData(format!(
            "invalid boolean `{other}` in documents.{column}"
        ))),
    }
}

fn parse_uuid(value: &str, column: &'static str) -> CacheResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| CacheStoreError::InvalidData(format!("invalid uuid `{value}` in {column}")))
}

fn ensure_cache_connection_ready(conn: &Connection) -> CacheResult<()> {
    let expected_version = latest_version();
    let actual_version: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if actual_version != expected_version {
        return Err(CacheStoreError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    for table in ["projects", "documents"] {
        let exists: i64 = conn.query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM sqlite_master
                WHERE type = 'table' AND name = ?1
            );",
            [table],
            |row| row.get(0),
        )?;
        if exists != 1 {
            return Err(CacheStoreError::MissingRequiredTable(table));
        }
    }
    Ok(())
}
