use std::collections::HashMap;

use async_trait::async_trait;

use vfs::{
    Direction, FileContent, Node, NodeId, OwnerId, PasteMode, SearchMode, SearchOrder, Stats,
};

use crate::error::VfsError;
use crate::search::SearchHit;

/// The engine capability set.
///
/// One implementation ships: the SQLite-backed [`crate::SqliteVfs`]. The
/// trait keeps the seam so the document service and tests stay agnostic
/// of the concrete store. Path normalization and joining are pure
/// functions in `vfs::path`, not store operations.
///
/// Every method is one atomic unit of work: a single transaction that
/// either commits or leaves no trace. The composed operations
/// (`create_folder_at`, `paste_items`, `move_up_or_down`) span all their
/// sub-steps in that same single transaction, so sibling uniqueness is
/// never observably violated.
#[async_trait]
pub trait DocStore: Send + Sync {
    // --- Presence & lookup ---

    /// Cheap presence check; does not enforce ownership. The root
    /// (`"", ""`) always exists.
    async fn exists(&self, parent: &str, name: &str, root: &str) -> Result<bool, VfsError>;

    async fn get_node_by_name(
        &self,
        parent: &str,
        name: &str,
        root: &str,
    ) -> Result<Option<Node>, VfsError>;

    /// Stable lookup by external identity; survives renames of ancestors.
    async fn get_node_by_uuid(&self, uuid: NodeId, root: &str)
        -> Result<Option<Node>, VfsError>;

    /// Stat a full path. The root is synthesized (private directory
    /// owned by admin).
    async fn stat(&self, caller: OwnerId, path: &str, root: &str) -> Result<Stats, VfsError>;

    /// True iff `caller` is admin, owns the row, or the row is public and
    /// the intent is read-only. Supplying `expect_directory` additionally
    /// asserts the row's kind; a mismatch is `BadArgument`.
    async fn check_auth(
        &self,
        caller: OwnerId,
        parent: &str,
        name: &str,
        root: &str,
        expect_directory: Option<bool>,
        write: bool,
    ) -> Result<bool, VfsError>;

    /// True if the directory has at least one child visible to `caller`.
    async fn children_exist(
        &self,
        caller: OwnerId,
        parent: &str,
        root: &str,
    ) -> Result<bool, VfsError>;

    // --- Directory listing ---

    /// Children of `parent` visible to `caller`, ordered
    /// `(ordinal ASC, filename ASC)`.
    async fn readdir(
        &self,
        caller: OwnerId,
        parent: &str,
        root: &str,
    ) -> Result<Vec<Node>, VfsError>;

    /// Like [`DocStore::readdir`] but restricted to rows owned by `owner`.
    async fn readdir_by_owner(
        &self,
        caller: OwnerId,
        owner: OwnerId,
        parent: &str,
        root: &str,
    ) -> Result<Vec<Node>, VfsError>;

    // --- Creation & content ---

    async fn mkdir(
        &self,
        owner: OwnerId,
        parent: &str,
        name: &str,
        root: &str,
        ordinal: i32,
        is_public: bool,
    ) -> Result<NodeId, VfsError>;

    /// Insert any missing directory ancestors of `path`, each appended at
    /// `max_ordinal + 1`, owned by `owner`, private. Idempotent. Returns
    /// true when at least one row was created.
    async fn ensure_path(&self, owner: OwnerId, path: &str, root: &str)
        -> Result<bool, VfsError>;

    /// Upsert a text file. On insert the supplied ordinal is assigned; on
    /// conflict content, size, content type, public flag and modified
    /// time are updated. Ownership never changes.
    async fn write_text(
        &self,
        owner: OwnerId,
        parent: &str,
        name: &str,
        root: &str,
        content: &str,
        ordinal: i32,
        is_public: bool,
    ) -> Result<NodeId, VfsError>;

    async fn write_binary(
        &self,
        owner: OwnerId,
        parent: &str,
        name: &str,
        root: &str,
        content: &[u8],
        ordinal: i32,
        is_public: bool,
    ) -> Result<NodeId, VfsError>;

    async fn read_file(
        &self,
        caller: OwnerId,
        parent: &str,
        name: &str,
        root: &str,
    ) -> Result<FileContent, VfsError>;

    // --- Deletion ---

    /// Delete exactly one non-directory row. Missing, directory, and
    /// unauthorized all surface as `NotFound`.
    async fn unlink(
        &self,
        caller: OwnerId,
        parent: &str,
        name: &str,
        root: &str,
    ) -> Result<(), VfsError>;

    /// Delete a directory and every descendant in one transaction;
    /// returns the number of rows removed.
    async fn rmdir(
        &self,
        caller: OwnerId,
        parent: &str,
        name: &str,
        root: &str,
    ) -> Result<u64, VfsError>;

    /// Dispatch to `unlink` or `rmdir`. With `force` a missing target is
    /// a no-op; deleting the root is always an error.
    async fn rm(
        &self,
        caller: OwnerId,
        path: &str,
        root: &str,
        recursive: bool,
        force: bool,
    ) -> Result<u64, VfsError>;

    // --- Rename & visibility ---

    /// Move/rename a node; for directories every descendant's
    /// `parent_path` is rewritten in the same transaction. The ordinal is
    /// preserved within the same parent, else appended.
    async fn rename(
        &self,
        caller: OwnerId,
        old_parent: &str,
        old_name: &str,
        new_parent: &str,
        new_name: &str,
        root: &str,
    ) -> Result<(), VfsError>;

    async fn set_public(
        &self,
        caller: OwnerId,
        parent: &str,
        name: &str,
        root: &str,
        is_public: bool,
        recursive: bool,
    ) -> Result<(), VfsError>;

    // --- Ordinals ---

    /// Maximum ordinal among the directory's children, 0 when empty.
    async fn get_max_ordinal(&self, parent: &str, root: &str) -> Result<i32, VfsError>;

    /// Unconditional ordinal update. Can violate sibling uniqueness on
    /// its own; callers use it inside the two-phase protocol only.
    async fn set_ordinal(
        &self,
        uuid: NodeId,
        root: &str,
        new_ordinal: i32,
    ) -> Result<(), VfsError>;

    /// Atomic swap of two siblings' ordinals. Never observable in a state
    /// where only one side has moved.
    async fn swap_ordinals(&self, a: NodeId, b: NodeId, root: &str) -> Result<(), VfsError>;

    /// Add `slots` to every ordinal `>= insert_ordinal` in the group,
    /// freeing a contiguous band. Returns the old-path → new-path map,
    /// which is always empty for the database engine (filenames do not
    /// change); the shape survives for callers that track paths.
    async fn shift_ordinals_down(
        &self,
        owner: OwnerId,
        parent: &str,
        root: &str,
        insert_ordinal: i32,
        slots: i32,
    ) -> Result<HashMap<String, String>, VfsError>;

    // --- Composed operations (single transaction each) ---

    /// Create a directory positioned after the sibling with ordinal
    /// `insert_after` (append when `None`). Returns the new node id and
    /// its assigned ordinal.
    async fn create_folder_at(
        &self,
        owner: OwnerId,
        parent: &str,
        name: &str,
        root: &str,
        insert_after: Option<i32>,
    ) -> Result<(NodeId, i32), VfsError>;

    /// Paste `items` (by uuid) into `dest_parent` after `anchor`
    /// (`None` = top). Same-folder pastes reorder via the two-phase
    /// protocol; cross-folder pastes move or clone. Returns the number of
    /// items placed.
    async fn paste_items(
        &self,
        caller: OwnerId,
        dest_parent: &str,
        root: &str,
        anchor: Option<NodeId>,
        items: &[NodeId],
        mode: PasteMode,
    ) -> Result<usize, VfsError>;

    /// Swap the named node with its adjacent visible sibling.
    async fn move_up_or_down(
        &self,
        caller: OwnerId,
        parent: &str,
        name: &str,
        root: &str,
        direction: Direction,
    ) -> Result<(), VfsError>;

    // --- Search ---

    async fn search_text(
        &self,
        caller: OwnerId,
        query: &str,
        scope: &str,
        root: &str,
        mode: SearchMode,
        order: SearchOrder,
    ) -> Result<Vec<SearchHit>, VfsError>;
}
