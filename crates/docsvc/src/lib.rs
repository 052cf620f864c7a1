pub mod tags;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;

use storage::{DocStore, SearchHit, VfsError};
use vfs::{
    content_type, path as vpath, Direction, FileContent, Node, NodeId, OwnerId, PasteMode,
    SearchMode, SearchOrder,
};

pub use tags::{TagCategory, TagReport, TagScanReport};

const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// User-facing operations composed from engine primitives.
///
/// The service owns the ordinal discipline the front end relies on:
/// folders created at an insert position, pastes that keep sibling
/// ordinals dense and unique, adjacent swaps for move-up/move-down.
/// Every engine round-trip runs under a deadline; an elapsed deadline
/// surfaces as [`VfsError::Timeout`] with no partial state visible.
pub struct DocService<S> {
    store: Arc<S>,
    op_timeout: Duration,
}

impl<S: DocStore> DocService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    pub fn with_timeout(store: Arc<S>, op_timeout: Duration) -> Self {
        Self { store, op_timeout }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    async fn deadline<T>(
        &self,
        fut: impl Future<Output = Result<T, VfsError>>,
    ) -> Result<T, VfsError> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(VfsError::Timeout),
        }
    }

    // --- Folders ---

    /// Create `name` under `parent`, positioned after the sibling named
    /// `insert_after` (append when `None` or unknown).
    pub async fn create_folder(
        &self,
        caller: OwnerId,
        parent: &str,
        name: &str,
        root: &str,
        insert_after: Option<&str>,
    ) -> Result<(NodeId, i32), VfsError> {
        let parent = vpath::normalize(parent);
        if !vpath::valid_name(name) {
            return Err(VfsError::InvalidName(name.to_string()));
        }

        let anchor_ordinal = match insert_after {
            None | Some("") => None,
            Some(sibling) => self
                .deadline(self.store.get_node_by_name(&parent, sibling, root))
                .await?
                .map(|n| n.ordinal),
        };

        self.deadline(
            self.store
                .create_folder_at(caller, &parent, name, root, anchor_ordinal),
        )
        .await
    }

    // --- Files ---

    /// Save a file, dispatching on the extension classification: text
    /// content is stored verbatim, binary content arrives base64-encoded.
    /// Missing ancestor directories are created first.
    pub async fn save_file(
        &self,
        caller: OwnerId,
        parent: &str,
        name: &str,
        root: &str,
        content: &str,
    ) -> Result<NodeId, VfsError> {
        let parent = vpath::normalize(parent);
        if !vpath::valid_name(name) {
            return Err(VfsError::InvalidName(name.to_string()));
        }
        self.deadline(self.store.ensure_path(caller, &parent, root))
            .await?;

        let existing = self
            .deadline(self.store.get_node_by_name(&parent, name, root))
            .await?;
        let (ordinal, is_public) = match &existing {
            Some(n) => (n.ordinal, n.is_public),
            None => (
                self.deadline(self.store.get_max_ordinal(&parent, root))
                    .await?
                    + 1,
                false,
            ),
        };

        if content_type::is_binary_name(name) {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(content.trim())
                .map_err(|e| VfsError::BadArgument(format!("invalid base64 content: {}", e)))?;
            self.deadline(self.store.write_binary(
                caller, &parent, name, root, &bytes, ordinal, is_public,
            ))
            .await
        } else {
            self.deadline(self.store.write_text(
                caller, &parent, name, root, content, ordinal, is_public,
            ))
            .await
        }
    }

    /// Read a file with its row metadata. Binary content is returned
    /// as raw bytes; the wire layer encodes it.
    pub async fn read_file(
        &self,
        caller: OwnerId,
        path: &str,
        root: &str,
    ) -> Result<(Node, FileContent), VfsError> {
        let norm = vpath::normalize(path);
        let (parent, name) = vpath::split(&norm);
        let node = self
            .deadline(self.store.get_node_by_name(&parent, &name, root))
            .await?
            .ok_or(VfsError::NotFound)?;
        let content = self
            .deadline(self.store.read_file(caller, &parent, &name, root))
            .await?;
        Ok((node, content))
    }

    // --- Listing ---

    /// Ordered, visibility-filtered children of a folder.
    pub async fn tree(
        &self,
        caller: OwnerId,
        parent: &str,
        root: &str,
    ) -> Result<Vec<Node>, VfsError> {
        self.deadline(self.store.readdir(caller, parent, root)).await
    }

    // --- Reordering & structure ---

    pub async fn paste_items(
        &self,
        caller: OwnerId,
        dest_parent: &str,
        root: &str,
        anchor: Option<NodeId>,
        items: &[NodeId],
        mode: PasteMode,
    ) -> Result<usize, VfsError> {
        self.deadline(
            self.store
                .paste_items(caller, dest_parent, root, anchor, items, mode),
        )
        .await
    }

    pub async fn move_up_or_down(
        &self,
        caller: OwnerId,
        parent: &str,
        name: &str,
        root: &str,
        direction: Direction,
    ) -> Result<(), VfsError> {
        self.deadline(
            self.store
                .move_up_or_down(caller, parent, name, root, direction),
        )
        .await
    }

    /// Move/rename by full paths.
    pub async fn rename_path(
        &self,
        caller: OwnerId,
        old_path: &str,
        new_path: &str,
        root: &str,
    ) -> Result<(), VfsError> {
        let (old_parent, old_name) = vpath::split(old_path);
        let (new_parent, new_name) = vpath::split(new_path);
        if old_name.is_empty() || new_name.is_empty() {
            return Err(VfsError::BadArgument(
                "the root cannot be renamed".to_string(),
            ));
        }
        self.deadline(self.store.rename(
            caller,
            &old_parent,
            &old_name,
            &new_parent,
            &new_name,
            root,
        ))
        .await
    }

    pub async fn set_public_path(
        &self,
        caller: OwnerId,
        path: &str,
        root: &str,
        is_public: bool,
        recursive: bool,
    ) -> Result<(), VfsError> {
        let (parent, name) = vpath::split(path);
        if name.is_empty() {
            return Err(VfsError::BadArgument(
                "the root visibility is fixed".to_string(),
            ));
        }
        self.deadline(
            self.store
                .set_public(caller, &parent, &name, root, is_public, recursive),
        )
        .await
    }

    /// Recursive delete of each path; returns the total row count removed.
    pub async fn delete_items(
        &self,
        caller: OwnerId,
        paths: &[String],
        root: &str,
    ) -> Result<u64, VfsError> {
        let mut total = 0;
        for p in paths {
            total += self
                .deadline(self.store.rm(caller, p, root, true, false))
                .await?;
        }
        Ok(total)
    }

    // --- Search ---

    pub async fn search(
        &self,
        caller: OwnerId,
        query: &str,
        scope: &str,
        root: &str,
        mode: SearchMode,
        order: SearchOrder,
    ) -> Result<Vec<SearchHit>, VfsError> {
        self.deadline(
            self.store
                .search_text(caller, query, scope, root, mode, order),
        )
        .await
    }

    // --- Tags ---

    pub async fn extract_tags(&self, caller: OwnerId, root: &str) -> Result<TagReport, VfsError> {
        tags::extract(self, caller, root).await
    }

    pub async fn scan_and_update_tags(
        &self,
        caller: OwnerId,
        root: &str,
    ) -> Result<TagScanReport, VfsError> {
        tags::scan_and_update(self, caller, root).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use storage::SqliteVfs;

    const ROOT: &str = "main";
    const USER: OwnerId = 7;

    fn service() -> DocService<SqliteVfs> {
        DocService::new(Arc::new(SqliteVfs::memory().unwrap()))
    }

    async fn names(svc: &DocService<SqliteVfs>, parent: &str) -> Vec<(String, i32)> {
        svc.tree(USER, parent, ROOT)
            .await
            .unwrap()
            .into_iter()
            .map(|n| (n.filename, n.ordinal))
            .collect()
    }

    #[tokio::test]
    async fn create_folder_appends_then_inserts() {
        let svc = service();
        svc.create_folder(USER, "", "a", ROOT, None).await.unwrap();
        svc.create_folder(USER, "", "b", ROOT, None).await.unwrap();
        // insert after "a": lands between the two
        svc.create_folder(USER, "", "mid", ROOT, Some("a"))
            .await
            .unwrap();
        let listing = names(&svc, "").await;
        assert_eq!(
            listing.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            vec!["a", "mid", "b"]
        );
    }

    #[tokio::test]
    async fn create_folder_unknown_anchor_appends() {
        let svc = service();
        svc.create_folder(USER, "", "a", ROOT, None).await.unwrap();
        svc.create_folder(USER, "", "z", ROOT, Some("no-such"))
            .await
            .unwrap();
        let listing = names(&svc, "").await;
        assert_eq!(listing.last().unwrap().0, "z");
    }

    #[tokio::test]
    async fn save_file_creates_ancestors_and_keeps_ordinal_on_update() {
        let svc = service();
        svc.save_file(USER, "docs/notes", "a.md", ROOT, "first")
            .await
            .unwrap();
        let node = svc
            .store()
            .get_node_by_name("docs/notes", "a.md", ROOT)
            .await
            .unwrap()
            .unwrap();
        let first_ordinal = node.ordinal;
        assert!(!node.is_binary);
        assert_eq!(node.content_type, "text/markdown");

        svc.save_file(USER, "docs/notes", "a.md", ROOT, "second")
            .await
            .unwrap();
        let node = svc
            .store()
            .get_node_by_name("docs/notes", "a.md", ROOT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(node.ordinal, first_ordinal);
        assert_eq!(node.content_text.as_deref(), Some("second"));
        assert_eq!(node.size_bytes, 6);
    }

    #[tokio::test]
    async fn save_file_binary_dispatch() {
        let svc = service();
        let payload = base64::engine::general_purpose::STANDARD.encode([0xDEu8, 0xAD, 0xBE]);
        svc.save_file(USER, "", "img.png", ROOT, &payload)
            .await
            .unwrap();
        let (node, content) = svc.read_file(USER, "img.png", ROOT).await.unwrap();
        assert!(node.is_binary);
        assert_eq!(node.content_type, "image/png");
        assert_eq!(content, FileContent::Binary(vec![0xDE, 0xAD, 0xBE]));
    }

    #[tokio::test]
    async fn save_file_rejects_garbage_base64() {
        let svc = service();
        let err = svc
            .save_file(USER, "", "img.png", ROOT, "not base64!!!")
            .await
            .unwrap_err();
        assert!(matches!(err, VfsError::BadArgument(_)));
    }

    #[tokio::test]
    async fn same_folder_paste_reorders_three_items() {
        // Seed [folder, file, file2], then paste-at-top in permuted order.
        let svc = service();
        let (folder_id, _) = svc.create_folder(USER, "", "folder", ROOT, None).await.unwrap();
        let file_id = svc.save_file(USER, "", "file", ROOT, "x").await.unwrap();
        let file2_id = svc.save_file(USER, "", "file2", ROOT, "y").await.unwrap();

        // Paste all three at the top in the permuted order.
        svc.paste_items(
            USER,
            "",
            ROOT,
            None,
            &[file2_id, file_id, folder_id],
            PasteMode::Move,
        )
        .await
        .unwrap();

        let listing = names(&svc, "").await;
        assert_eq!(
            listing.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            vec!["file2", "file", "folder"]
        );
        // Ordinals are unique (the unique index would have rejected
        // anything else) and ascending per readdir's contract.
        let ords: Vec<i32> = listing.iter().map(|(_, o)| *o).collect();
        let mut sorted = ords.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 3);
    }

    #[tokio::test]
    async fn cross_folder_paste_moves_subtree() {
        let svc = service();
        svc.create_folder(USER, "", "src", ROOT, None).await.unwrap();
        svc.create_folder(USER, "", "dst", ROOT, None).await.unwrap();
        let (moved_id, _) = svc.create_folder(USER, "src", "inner", ROOT, None).await.unwrap();
        svc.save_file(USER, "src/inner", "deep.md", ROOT, "text")
            .await
            .unwrap();

        svc.paste_items(USER, "dst", ROOT, None, &[moved_id], PasteMode::Move)
            .await
            .unwrap();

        assert!(svc
            .store()
            .exists("dst/inner", "deep.md", ROOT)
            .await
            .unwrap());
        assert!(!svc.store().exists("src", "inner", ROOT).await.unwrap());
    }

    #[tokio::test]
    async fn cross_folder_paste_copy_clones_content() {
        let svc = service();
        svc.create_folder(USER, "", "dst", ROOT, None).await.unwrap();
        let id = svc.save_file(USER, "", "orig.md", ROOT, "body").await.unwrap();

        svc.paste_items(USER, "dst", ROOT, None, &[id], PasteMode::Copy)
            .await
            .unwrap();

        // Source still present, copy readable, identities distinct.
        let (_, src) = svc.read_file(USER, "orig.md", ROOT).await.unwrap();
        let (copy_node, copy) = svc.read_file(USER, "dst/orig.md", ROOT).await.unwrap();
        assert_eq!(src, copy);
        assert_ne!(copy_node.uuid, id);
    }

    #[tokio::test]
    async fn move_up_at_top_is_rejected() {
        let svc = service();
        svc.save_file(USER, "", "only.md", ROOT, "x").await.unwrap();
        let err = svc
            .move_up_or_down(USER, "", "only.md", ROOT, Direction::Up)
            .await
            .unwrap_err();
        assert!(matches!(err, VfsError::BadArgument(_)));
    }

    #[tokio::test]
    async fn move_down_swaps_neighbors() {
        let svc = service();
        svc.save_file(USER, "", "a.md", ROOT, "1").await.unwrap();
        svc.save_file(USER, "", "b.md", ROOT, "2").await.unwrap();
        svc.move_up_or_down(USER, "", "a.md", ROOT, Direction::Down)
            .await
            .unwrap();
        let listing = names(&svc, "").await;
        assert_eq!(
            listing.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            vec!["b.md", "a.md"]
        );
    }

    #[tokio::test]
    async fn delete_items_counts_rows() {
        let svc = service();
        svc.create_folder(USER, "", "d", ROOT, None).await.unwrap();
        svc.save_file(USER, "d", "x.md", ROOT, "x").await.unwrap();
        svc.save_file(USER, "", "top.md", ROOT, "y").await.unwrap();
        let deleted = svc
            .delete_items(USER, &["d".to_string(), "top.md".to_string()], ROOT)
            .await
            .unwrap();
        assert_eq!(deleted, 3);
    }

    #[tokio::test]
    async fn rename_restores_round_trip() {
        let svc = service();
        svc.create_folder(USER, "", "a", ROOT, None).await.unwrap();
        svc.save_file(USER, "a", "f.md", ROOT, "body").await.unwrap();
        svc.rename_path(USER, "a", "b", ROOT).await.unwrap();
        assert!(svc.store().exists("b", "f.md", ROOT).await.unwrap());
        svc.rename_path(USER, "b", "a", ROOT).await.unwrap();
        assert!(svc.store().exists("a", "f.md", ROOT).await.unwrap());
        assert!(!svc.store().exists("b", "f.md", ROOT).await.unwrap());
    }
}
