pub mod content_type;
pub mod path;
pub mod query;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type NodeId = Uuid;
pub type OwnerId = i64;

/// The administrative principal. Admin sees and may mutate every node.
pub const ADMIN: OwnerId = 0;

/// One row of the tree: either a file or a directory.
///
/// The surrogate row id stays inside the storage layer; `uuid` is the
/// stable external identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub uuid: NodeId,
    pub owner_id: OwnerId,
    pub doc_root_key: String,
    /// Slash-joined ancestor names, no leading or trailing slash.
    /// Empty string for children of the root.
    pub parent_path: String,
    pub filename: String,
    /// Sibling ordering key, unique within `(doc_root_key, parent_path)`.
    pub ordinal: i32,
    pub is_directory: bool,
    pub is_public: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_text: Option<String>,
    #[serde(skip)]
    pub content_binary: Option<Vec<u8>>,
    pub is_binary: bool,
    pub content_type: String,
    pub size_bytes: i64,
    pub created_time: DateTime<Utc>,
    pub modified_time: DateTime<Utc>,
}

impl Node {
    /// Full path of this node relative to the tree root.
    pub fn full_path(&self) -> String {
        path::join(&[&self.parent_path, &self.filename])
    }
}

/// POSIX-ish stat result. The root is synthesized by the engine and
/// never stored as a row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub is_directory: bool,
    pub is_public: bool,
    pub birthtime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,
    pub size: i64,
}

/// Content of a file node. Exactly one column is populated per row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    Text(String),
    Binary(Vec<u8>),
}

impl FileContent {
    pub fn len(&self) -> usize {
        match self {
            FileContent::Text(s) => s.len(),
            FileContent::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, FileContent::Binary(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SearchMode {
    MatchAny,
    MatchAll,
    Regex,
}

impl Default for SearchMode {
    fn default() -> Self {
        SearchMode::MatchAny
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SearchOrder {
    ModTime,
    Filename,
}

impl Default for SearchOrder {
    fn default() -> Self {
        SearchOrder::ModTime
    }
}

/// Direction for sibling reorder operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
}

/// Paste semantics: relocate the source rows or clone them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PasteMode {
    Move,
    Copy,
}
