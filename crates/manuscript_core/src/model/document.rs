//! Manuscript document node model.
//!
//! # Responsibility
//! - Define the canonical node record shared by planner, client and service.
//! - Classify document kinds into container and leaf kinds.
//! - Model the cache-key / external-key alias as one boundary type.
//!
//! # Invariants
//! - `id` is stable and never reused for another node.
//! - Only container kinds (`folder|part|chapter`) may be a `parent_id`.
//! - `word_count` is the node's own count; aggregates are computed on read.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Stable cache-store identifier of one document node.
pub type NodeId = Uuid;

/// Stable identifier of one project.
pub type ProjectId = Uuid;

/// Document kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Folder,
    Part,
    Chapter,
    Scene,
    Character,
    Setting,
    Place,
    Note,
    Research,
}

impl DocumentKind {
    /// All kinds in declaration order.
    pub const ALL: [DocumentKind; 9] = [
        DocumentKind::Folder,
        DocumentKind::Part,
        DocumentKind::Chapter,
        DocumentKind::Scene,
        DocumentKind::Character,
        DocumentKind::Setting,
        DocumentKind::Place,
        DocumentKind::Note,
        DocumentKind::Research,
    ];

    /// Returns whether nodes of this kind may hold children.
    pub fn is_container(self) -> bool {
        matches!(
            self,
            DocumentKind::Folder | DocumentKind::Part | DocumentKind::Chapter
        )
    }

    /// Stable storage/wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentKind::Folder => "folder",
            DocumentKind::Part => "part",
            DocumentKind::Chapter => "chapter",
            DocumentKind::Scene => "scene",
            DocumentKind::Character => "character",
            DocumentKind::Setting => "setting",
            DocumentKind::Place => "place",
            DocumentKind::Note => "note",
            DocumentKind::Research => "research",
        }
    }

    /// Parses a storage/wire name.
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value.trim())
    }
}

impl Display for DocumentKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Editorial status of one document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    #[default]
    Draft,
    Review,
    Final,
    Published,
}

impl DocumentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Draft => "draft",
            DocumentStatus::Review => "review",
            DocumentStatus::Final => "final",
            DocumentStatus::Published => "published",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "draft" => Some(DocumentStatus::Draft),
            "review" => Some(DocumentStatus::Review),
            "final" => Some(DocumentStatus::Final),
            "published" => Some(DocumentStatus::Published),
            _ => None,
        }
    }
}

/// Canonical manuscript unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentNode {
    /// Stable cache-store id.
    pub id: NodeId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Containing node. `None` means root-level node.
    pub parent_id: Option<NodeId>,
    pub kind: DocumentKind,
    /// Sibling sort key.
    pub order: i64,
    pub title: String,
    pub synopsis: String,
    pub tags: Vec<String>,
    pub status: DocumentStatus,
    pub include_in_compile: bool,
    /// Own word count, excluding descendants.
    pub word_count: u32,
    /// Opaque text body.
    pub content: String,
    /// Key of the mirrored document in the external store, once known.
    pub external_ref: Option<String>,
    /// Epoch ms creation timestamp.
    pub created_at: i64,
    /// Epoch ms update timestamp.
    pub updated_at: i64,
    /// Epoch ms timestamp of the last content edit.
    pub last_edited_at: Option<i64>,
}

impl DocumentNode {
    /// Creates a node with a generated id and default descriptive fields.
    pub fn new(
        project_id: ProjectId,
        parent_id: Option<NodeId>,
        kind: DocumentKind,
        title: impl Into<String>,
    ) -> Self {
        let now = now_epoch_ms();
        Self {
            id: Uuid::new_v4(),
            project_id,
            parent_id,
            kind,
            order: 0,
            title: title.into(),
            synopsis: String::new(),
            tags: Vec::new(),
            status: DocumentStatus::Draft,
            include_in_compile: true,
            word_count: 0,
            content: String::new(),
            external_ref: None,
            created_at: now,
            updated_at: now,
            last_edited_at: None,
        }
    }

    pub fn is_container(&self) -> bool {
        self.kind.is_container()
    }

    /// Shallow summary used by delete confirmations.
    pub fn summary(&self) -> ChildSummary {
        ChildSummary {
            id: self.id,
            title: self.title.clone(),
            kind: self.kind,
        }
    }
}

/// Shallow listing entry for one direct child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildSummary {
    pub id: NodeId,
    pub title: String,
    pub kind: DocumentKind,
}

/// Node address accepted at the service boundary.
///
/// Callers may hold either the cache-store id or the external-store key of a
/// node; both name the same logical node and are resolved to one `NodeId`
/// before any internal logic runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeKey(String);

impl NodeKey {
    /// Wraps a raw key. Returns `None` for blank input.
    pub fn parse(raw: impl AsRef<str>) -> Option<Self> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    /// Returns the cache id this key names when it is a well-formed UUID.
    pub fn as_node_id(&self) -> Option<NodeId> {
        Uuid::parse_str(&self.0).ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<NodeId> for NodeKey {
    fn from(value: NodeId) -> Self {
        Self(value.to_string())
    }
}

impl Display for NodeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Counts whitespace-separated words in a content body.
pub fn count_words(content: &str) -> u32 {
    u32::try_from(content.split_whitespace().count()).unwrap_or(u32::MAX)
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
