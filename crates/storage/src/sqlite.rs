use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tokio::sync::Mutex;
use uuid::Uuid;

use vfs::{
    content_type, path as vpath, Direction, FileContent, Node, NodeId, OwnerId, PasteMode,
    SearchMode, SearchOrder, Stats, ADMIN,
};

use crate::backend::DocStore;
use crate::error::VfsError;
use crate::search::{self, SearchHit};

// --- Migration system ---

const MIGRATIONS: &[&str] = &[
    // v1: the node table and its uniqueness contracts
    r#"
    CREATE TABLE IF NOT EXISTS nodes (
        id INTEGER PRIMARY KEY,
        uuid TEXT NOT NULL UNIQUE,
        owner_id INTEGER NOT NULL,
        doc_root_key TEXT NOT NULL,
        parent_path TEXT NOT NULL,
        filename TEXT NOT NULL,
        ordinal INTEGER NOT NULL,
        is_directory INTEGER NOT NULL,
        is_public INTEGER NOT NULL DEFAULT 0,
        content_text TEXT,
        content_binary BLOB,
        is_binary INTEGER NOT NULL DEFAULT 0,
        content_type TEXT NOT NULL,
        size_bytes INTEGER NOT NULL DEFAULT 0,
        created_time TEXT NOT NULL,
        modified_time TEXT NOT NULL,
        UNIQUE (doc_root_key, parent_path, filename),
        UNIQUE (doc_root_key, parent_path, ordinal)
    );
    CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(doc_root_key, parent_path);
    CREATE INDEX IF NOT EXISTS idx_nodes_owner ON nodes(owner_id);
    CREATE INDEX IF NOT EXISTS idx_nodes_parent_ordinal ON nodes(doc_root_key, parent_path, ordinal);
    "#,
];

fn run_migrations(conn: &Connection) -> Result<(), VfsError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
    )?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i64;
        if version > current_version {
            conn.execute_batch(migration)?;
            conn.execute(
                "INSERT INTO migrations (version, applied_at) VALUES (?1, ?2)",
                params![version, Utc::now().to_rfc3339()],
            )?;
            tracing::info!(version, "applied migration");
        }
    }

    Ok(())
}

// --- Row mapping ---

const NODE_COLUMNS: &str = "uuid, owner_id, doc_root_key, parent_path, filename, ordinal, \
     is_directory, is_public, content_text, content_binary, is_binary, content_type, \
     size_bytes, created_time, modified_time";

fn parse_time(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn node_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Node> {
    let uuid_str: String = row.get(0)?;
    let uuid = uuid_str.parse::<Uuid>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let created_str: String = row.get(13)?;
    let modified_str: String = row.get(14)?;
    Ok(Node {
        uuid,
        owner_id: row.get(1)?,
        doc_root_key: row.get(2)?,
        parent_path: row.get(3)?,
        filename: row.get(4)?,
        ordinal: row.get(5)?,
        is_directory: row.get(6)?,
        is_public: row.get(7)?,
        content_text: row.get(8)?,
        content_binary: row.get(9)?,
        is_binary: row.get(10)?,
        content_type: row.get(11)?,
        size_bytes: row.get(12)?,
        created_time: parse_time(13, &created_str)?,
        modified_time: parse_time(14, &modified_str)?,
    })
}

fn visible_to(caller: OwnerId, node: &Node) -> bool {
    caller == ADMIN || node.owner_id == caller || node.is_public
}

fn can_write(caller: OwnerId, node: &Node) -> bool {
    caller == ADMIN || node.owner_id == caller
}

/// Base path of a subtree: `parent/name` (or `name` at the root).
fn base_of(parent: &str, name: &str) -> String {
    vpath::join(&[parent, name])
}

// --- Stored operations ---
//
// Each function below runs against an open transaction so composed
// operations can span several of them atomically. Public methods open
// the transaction, call through, and commit.

fn lookup_tx(
    tx: &Transaction<'_>,
    root: &str,
    parent: &str,
    name: &str,
) -> Result<Option<Node>, VfsError> {
    let mut stmt = tx.prepare(&format!(
        "SELECT {NODE_COLUMNS} FROM nodes \
         WHERE doc_root_key = ?1 AND parent_path = ?2 AND filename = ?3"
    ))?;
    let node = stmt
        .query_row(params![root, parent, name], node_from_row)
        .optional()?;
    Ok(node)
}

fn lookup_uuid_tx(
    tx: &Transaction<'_>,
    root: &str,
    uuid: NodeId,
) -> Result<Option<Node>, VfsError> {
    let mut stmt = tx.prepare(&format!(
        "SELECT {NODE_COLUMNS} FROM nodes WHERE doc_root_key = ?1 AND uuid = ?2"
    ))?;
    let node = stmt
        .query_row(params![root, uuid.to_string()], node_from_row)
        .optional()?;
    Ok(node)
}

fn max_ordinal_tx(tx: &Transaction<'_>, root: &str, parent: &str) -> Result<i32, VfsError> {
    let max: Option<i32> = tx.query_row(
        "SELECT MAX(ordinal) FROM nodes WHERE doc_root_key = ?1 AND parent_path = ?2",
        params![root, parent],
        |row| row.get(0),
    )?;
    Ok(max.unwrap_or(0))
}

/// Require that `parent` names an existing directory (the root always
/// qualifies). Guards the no-orphans invariant on every insert path.
fn require_parent_dir_tx(tx: &Transaction<'_>, root: &str, parent: &str) -> Result<(), VfsError> {
    if parent.is_empty() {
        return Ok(());
    }
    let (grand, name) = vpath::split(parent);
    match lookup_tx(tx, root, &grand, &name)? {
        Some(n) if n.is_directory => Ok(()),
        Some(_) => Err(VfsError::BadArgument(format!(
            "path component is a file: {}",
            name
        ))),
        None => Err(VfsError::NotFound),
    }
}

fn insert_dir_tx(
    tx: &Transaction<'_>,
    owner: OwnerId,
    root: &str,
    parent: &str,
    name: &str,
    ordinal: i32,
    is_public: bool,
) -> Result<NodeId, VfsError> {
    let uuid = Uuid::new_v4();
    let now = Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO nodes (uuid, owner_id, doc_root_key, parent_path, filename, ordinal, \
         is_directory, is_public, content_text, content_binary, is_binary, content_type, \
         size_bytes, created_time, modified_time) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, NULL, NULL, 0, ?8, 0, ?9, ?9)",
        params![
            uuid.to_string(),
            owner,
            root,
            parent,
            name,
            ordinal,
            is_public,
            content_type::DIRECTORY,
            now,
        ],
    )?;
    Ok(uuid)
}

fn insert_file_tx(
    tx: &Transaction<'_>,
    owner: OwnerId,
    root: &str,
    parent: &str,
    name: &str,
    ordinal: i32,
    is_public: bool,
    content: &FileContent,
) -> Result<NodeId, VfsError> {
    let uuid = Uuid::new_v4();
    let now = Utc::now().to_rfc3339();
    let ctype = content_type::content_type_for(name);
    let size = content.len() as i64;
    let (text, binary, is_binary): (Option<&str>, Option<&[u8]>, bool) = match content {
        FileContent::Text(s) => (Some(s.as_str()), None, false),
        FileContent::Binary(b) => (None, Some(b.as_slice()), true),
    };
    tx.execute(
        "INSERT INTO nodes (uuid, owner_id, doc_root_key, parent_path, filename, ordinal, \
         is_directory, is_public, content_text, content_binary, is_binary, content_type, \
         size_bytes, created_time, modified_time) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
        params![
            uuid.to_string(),
            owner,
            root,
            parent,
            name,
            ordinal,
            is_public,
            text,
            binary,
            is_binary,
            ctype,
            size,
            now,
        ],
    )?;
    Ok(uuid)
}

fn write_file_tx(
    tx: &Transaction<'_>,
    owner: OwnerId,
    root: &str,
    parent: &str,
    name: &str,
    content: &FileContent,
    ordinal: i32,
    is_public: bool,
) -> Result<NodeId, VfsError> {
    if !vpath::valid_name(name) {
        return Err(VfsError::InvalidName(name.to_string()));
    }
    if !vpath::valid_path(parent) {
        return Err(VfsError::InvalidPath(parent.to_string()));
    }
    match lookup_tx(tx, root, parent, name)? {
        Some(existing) => {
            if existing.is_directory {
                return Err(VfsError::BadArgument(format!(
                    "cannot write file content to a folder: {}",
                    name
                )));
            }
            if !can_write(owner, &existing) {
                return Err(VfsError::Unauthorized);
            }
            let now = Utc::now().to_rfc3339();
            let ctype = content_type::content_type_for(name);
            let size = content.len() as i64;
            let (text, binary, is_binary): (Option<&str>, Option<&[u8]>, bool) = match content {
                FileContent::Text(s) => (Some(s.as_str()), None, false),
                FileContent::Binary(b) => (None, Some(b.as_slice()), true),
            };
            // Ordinal and ownership are insert-time attributes; an update
            // touches neither.
            tx.execute(
                "UPDATE nodes SET content_text = ?1, content_binary = ?2, is_binary = ?3, \
                 content_type = ?4, size_bytes = ?5, is_public = ?6, modified_time = ?7 \
                 WHERE doc_root_key = ?8 AND parent_path = ?9 AND filename = ?10",
                params![text, binary, is_binary, ctype, size, is_public, now, root, parent, name],
            )?;
            Ok(existing.uuid)
        }
        None => {
            require_parent_dir_tx(tx, root, parent)?;
            insert_file_tx(tx, owner, root, parent, name, ordinal, is_public, content)
        }
    }
}

/// Free a contiguous ordinal band: add `slots` to every ordinal
/// `>= insert_ordinal` in the sibling group. SQLite checks uniqueness
/// per updated row, so the shift detours through the reserved negative
/// range and flips back, all inside the enclosing transaction.
fn shift_ordinals_tx(
    tx: &Transaction<'_>,
    root: &str,
    parent: &str,
    insert_ordinal: i32,
    slots: i32,
) -> Result<usize, VfsError> {
    let now = Utc::now().to_rfc3339();
    let shifted = tx.execute(
        "UPDATE nodes SET ordinal = -(ordinal + ?1), modified_time = ?2 \
         WHERE doc_root_key = ?3 AND parent_path = ?4 AND ordinal >= ?5",
        params![slots, now, root, parent, insert_ordinal],
    )?;
    if shifted > 0 {
        tx.execute(
            "UPDATE nodes SET ordinal = -ordinal \
             WHERE doc_root_key = ?1 AND parent_path = ?2 AND ordinal < 0",
            params![root, parent],
        )?;
    }
    Ok(shifted)
}

fn set_ordinal_tx(
    tx: &Transaction<'_>,
    root: &str,
    uuid: NodeId,
    new_ordinal: i32,
) -> Result<(), VfsError> {
    let now = Utc::now().to_rfc3339();
    let changed = tx.execute(
        "UPDATE nodes SET ordinal = ?1, modified_time = ?2 \
         WHERE doc_root_key = ?3 AND uuid = ?4",
        params![new_ordinal, now, root, uuid.to_string()],
    )?;
    if changed == 0 {
        return Err(VfsError::NotFound);
    }
    Ok(())
}

/// Swap two rows' ordinals through the reserved `i32::MIN` temporary so
/// the unique index never observes a duplicate, even for the adjacent
/// 0/1 pair.
fn swap_ordinals_tx(
    tx: &Transaction<'_>,
    root: &str,
    a: NodeId,
    b: NodeId,
) -> Result<(), VfsError> {
    let node_a = lookup_uuid_tx(tx, root, a)?.ok_or(VfsError::NotFound)?;
    let node_b = lookup_uuid_tx(tx, root, b)?.ok_or(VfsError::NotFound)?;
    set_ordinal_tx(tx, root, a, i32::MIN)?;
    set_ordinal_tx(tx, root, b, node_a.ordinal)?;
    set_ordinal_tx(tx, root, a, node_b.ordinal)?;
    Ok(())
}

fn rename_tx(
    tx: &Transaction<'_>,
    caller: OwnerId,
    old_parent: &str,
    old_name: &str,
    new_parent: &str,
    new_name: &str,
    root: &str,
) -> Result<(), VfsError> {
    if !vpath::valid_name(new_name) {
        return Err(VfsError::InvalidName(new_name.to_string()));
    }
    if !vpath::valid_path(new_parent) {
        return Err(VfsError::InvalidPath(new_parent.to_string()));
    }

    let node = lookup_tx(tx, root, old_parent, old_name)?.ok_or(VfsError::NotFound)?;
    if !visible_to(caller, &node) {
        return Err(VfsError::NotFound);
    }
    if !can_write(caller, &node) {
        return Err(VfsError::Unauthorized);
    }

    let old_base = base_of(old_parent, old_name);
    let new_base = base_of(new_parent, new_name);
    if node.is_directory
        && (new_parent == old_base || new_parent.starts_with(&format!("{}/", old_base)))
    {
        return Err(VfsError::BadArgument(
            "cannot move a folder into itself".to_string(),
        ));
    }

    if lookup_tx(tx, root, new_parent, new_name)?.is_some() {
        return Err(VfsError::AlreadyExists(new_base));
    }

    let same_parent = old_parent == new_parent;
    let ordinal = if same_parent {
        node.ordinal
    } else {
        require_parent_dir_tx(tx, root, new_parent)?;
        max_ordinal_tx(tx, root, new_parent)? + 1
    };

    let now = Utc::now().to_rfc3339();
    tx.execute(
        "UPDATE nodes SET parent_path = ?1, filename = ?2, ordinal = ?3, modified_time = ?4 \
         WHERE doc_root_key = ?5 AND uuid = ?6",
        params![new_parent, new_name, ordinal, now, root, node.uuid.to_string()],
    )?;

    if node.is_directory {
        // One bulk rewrite covers the directory's own child group and
        // every deeper group.
        tx.execute(
            "UPDATE nodes SET parent_path = ?1 || substr(parent_path, length(?2) + 1), \
             modified_time = ?3 \
             WHERE doc_root_key = ?4 AND (parent_path = ?2 \
                OR substr(parent_path, 1, length(?2) + 1) = ?2 || '/')",
            params![new_base, old_base, now, root],
        )?;
    }
    Ok(())
}

fn set_public_tx(
    tx: &Transaction<'_>,
    caller: OwnerId,
    parent: &str,
    name: &str,
    root: &str,
    is_public: bool,
    recursive: bool,
) -> Result<(), VfsError> {
    let node = lookup_tx(tx, root, parent, name)?.ok_or(VfsError::NotFound)?;
    if !visible_to(caller, &node) {
        return Err(VfsError::NotFound);
    }
    if !can_write(caller, &node) {
        return Err(VfsError::Unauthorized);
    }

    let now = Utc::now().to_rfc3339();
    tx.execute(
        "UPDATE nodes SET is_public = ?1, modified_time = ?2 \
         WHERE doc_root_key = ?3 AND uuid = ?4",
        params![is_public, now, root, node.uuid.to_string()],
    )?;

    if node.is_directory && recursive {
        let base = base_of(parent, name);
        tx.execute(
            "UPDATE nodes SET is_public = ?1, modified_time = ?2 \
             WHERE doc_root_key = ?3 AND (parent_path = ?4 \
                OR substr(parent_path, 1, length(?4) + 1) = ?4 || '/')",
            params![is_public, now, root, base],
        )?;
    }
    Ok(())
}

fn rmdir_tx(
    tx: &Transaction<'_>,
    caller: OwnerId,
    parent: &str,
    name: &str,
    root: &str,
) -> Result<u64, VfsError> {
    let node = lookup_tx(tx, root, parent, name)?.ok_or(VfsError::NotFound)?;
    if !visible_to(caller, &node) {
        return Err(VfsError::NotFound);
    }
    if !node.is_directory {
        return Err(VfsError::BadArgument(format!("not a folder: {}", name)));
    }
    if !can_write(caller, &node) {
        return Err(VfsError::Unauthorized);
    }

    let base = base_of(parent, name);
    let deleted = tx.execute(
        "DELETE FROM nodes WHERE doc_root_key = ?1 AND \
         ((parent_path = ?2 AND filename = ?3) \
            OR parent_path = ?4 \
            OR substr(parent_path, 1, length(?4) + 1) = ?4 || '/')",
        params![root, parent, name, base],
    )?;
    Ok(deleted as u64)
}

fn unlink_tx(
    tx: &Transaction<'_>,
    caller: OwnerId,
    parent: &str,
    name: &str,
    root: &str,
) -> Result<(), VfsError> {
    // Missing, directory and unauthorized are indistinguishable here.
    let node = lookup_tx(tx, root, parent, name)?.ok_or(VfsError::NotFound)?;
    if node.is_directory || !can_write(caller, &node) {
        return Err(VfsError::NotFound);
    }
    tx.execute(
        "DELETE FROM nodes WHERE doc_root_key = ?1 AND uuid = ?2",
        params![root, node.uuid.to_string()],
    )?;
    Ok(())
}

fn ensure_path_tx(
    tx: &Transaction<'_>,
    owner: OwnerId,
    path: &str,
    root: &str,
) -> Result<bool, VfsError> {
    let norm = vpath::normalize(path);
    if norm.is_empty() {
        return Ok(false);
    }
    if !vpath::valid_path(&norm) {
        return Err(VfsError::InvalidPath(norm));
    }
    let mut created = false;
    let mut parent = String::new();
    for segment in norm.split('/') {
        match lookup_tx(tx, root, &parent, segment)? {
            Some(n) if n.is_directory => {}
            Some(_) => {
                return Err(VfsError::BadArgument(format!(
                    "path component is a file: {}",
                    segment
                )))
            }
            None => {
                let ordinal = max_ordinal_tx(tx, root, &parent)? + 1;
                insert_dir_tx(tx, owner, root, &parent, segment, ordinal, false)?;
                created = true;
            }
        }
        parent = base_of(&parent, segment);
    }
    Ok(created)
}

fn readdir_tx(
    tx: &Transaction<'_>,
    caller: OwnerId,
    parent: &str,
    root: &str,
    owner_filter: Option<OwnerId>,
) -> Result<Vec<Node>, VfsError> {
    let mut sql = format!(
        "SELECT {NODE_COLUMNS} FROM nodes \
         WHERE doc_root_key = ?1 AND parent_path = ?2 \
           AND (?3 = 0 OR owner_id = ?3 OR is_public = 1)"
    );
    if owner_filter.is_some() {
        sql.push_str(" AND owner_id = ?4");
    }
    sql.push_str(" ORDER BY ordinal ASC, filename ASC");

    let mut stmt = tx.prepare(&sql)?;
    let rows: Vec<Node> = match owner_filter {
        Some(owner) => stmt
            .query_map(params![root, parent, caller, owner], node_from_row)?
            .collect::<Result<_, _>>()?,
        None => stmt
            .query_map(params![root, parent, caller], node_from_row)?
            .collect::<Result<_, _>>()?,
    };
    Ok(rows)
}

fn clone_subtree_tx(
    tx: &Transaction<'_>,
    owner: OwnerId,
    src: &Node,
    dest_parent: &str,
    root: &str,
    ordinal: i32,
) -> Result<(), VfsError> {
    if lookup_tx(tx, root, dest_parent, &src.filename)?.is_some() {
        return Err(VfsError::AlreadyExists(base_of(dest_parent, &src.filename)));
    }
    if src.is_directory {
        insert_dir_tx(
            tx,
            owner,
            root,
            dest_parent,
            &src.filename,
            ordinal,
            src.is_public,
        )?;
        let src_base = src.full_path();
        let dest_base = base_of(dest_parent, &src.filename);
        let mut stmt = tx.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes \
             WHERE doc_root_key = ?1 AND (parent_path = ?2 \
                OR substr(parent_path, 1, length(?2) + 1) = ?2 || '/')"
        ))?;
        let descendants: Vec<Node> = stmt
            .query_map(params![root, src_base], node_from_row)?
            .collect::<Result<_, _>>()?;
        let now = Utc::now().to_rfc3339();
        for d in descendants {
            let new_parent = format!("{}{}", dest_base, &d.parent_path[src_base.len()..]);
            tx.execute(
                "INSERT INTO nodes (uuid, owner_id, doc_root_key, parent_path, filename, \
                 ordinal, is_directory, is_public, content_text, content_binary, is_binary, \
                 content_type, size_bytes, created_time, modified_time) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
                params![
                    Uuid::new_v4().to_string(),
                    owner,
                    root,
                    new_parent,
                    d.filename,
                    d.ordinal,
                    d.is_directory,
                    d.is_public,
                    d.content_text,
                    d.content_binary,
                    d.is_binary,
                    d.content_type,
                    d.size_bytes,
                    now,
                ],
            )?;
        }
    } else {
        let content = match (&src.content_text, &src.content_binary) {
            (Some(t), _) => FileContent::Text(t.clone()),
            (_, Some(b)) => FileContent::Binary(b.clone()),
            _ => return Err(VfsError::Database("file row missing content".to_string())),
        };
        insert_file_tx(
            tx,
            owner,
            root,
            dest_parent,
            &src.filename,
            ordinal,
            src.is_public,
            &content,
        )?;
    }
    Ok(())
}

// --- The engine ---

/// SQLite-backed node store. One connection, serialized by a mutex;
/// every public operation is a single transaction.
pub struct SqliteVfs {
    conn: Mutex<Connection>,
}

impl SqliteVfs {
    pub fn open(path: &Path) -> Result<Self, VfsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VfsError::Database(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(VfsError::from)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn memory() -> Result<Self, VfsError> {
        let conn = Connection::open_in_memory().map_err(VfsError::from)?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl DocStore for SqliteVfs {
    async fn exists(&self, parent: &str, name: &str, root: &str) -> Result<bool, VfsError> {
        let parent = vpath::normalize(parent);
        if parent.is_empty() && name.is_empty() {
            return Ok(true);
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let found = lookup_tx(&tx, root, &parent, name)?.is_some();
        tx.commit()?;
        Ok(found)
    }

    async fn get_node_by_name(
        &self,
        parent: &str,
        name: &str,
        root: &str,
    ) -> Result<Option<Node>, VfsError> {
        let parent = vpath::normalize(parent);
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let node = lookup_tx(&tx, root, &parent, name)?;
        tx.commit()?;
        Ok(node)
    }

    async fn get_node_by_uuid(
        &self,
        uuid: NodeId,
        root: &str,
    ) -> Result<Option<Node>, VfsError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let node = lookup_uuid_tx(&tx, root, uuid)?;
        tx.commit()?;
        Ok(node)
    }

    async fn stat(&self, caller: OwnerId, path: &str, root: &str) -> Result<Stats, VfsError> {
        let norm = vpath::normalize(path);
        if norm.is_empty() {
            // The root has no row; report it as a private admin directory.
            return Ok(Stats {
                is_directory: true,
                is_public: false,
                birthtime: DateTime::<Utc>::UNIX_EPOCH,
                mtime: DateTime::<Utc>::UNIX_EPOCH,
                size: 0,
            });
        }
        let (parent, name) = vpath::split(&norm);
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let node = lookup_tx(&tx, root, &parent, &name)?.ok_or(VfsError::NotFound)?;
        tx.commit()?;
        if !visible_to(caller, &node) {
            return Err(VfsError::NotFound);
        }
        Ok(Stats {
            is_directory: node.is_directory,
            is_public: node.is_public,
            birthtime: node.created_time,
            mtime: node.modified_time,
            size: node.size_bytes,
        })
    }

    async fn check_auth(
        &self,
        caller: OwnerId,
        parent: &str,
        name: &str,
        root: &str,
        expect_directory: Option<bool>,
        write: bool,
    ) -> Result<bool, VfsError> {
        let parent = vpath::normalize(parent);
        if parent.is_empty() && name.is_empty() {
            // The synthesized root: readable by anyone, writable by admin.
            if let Some(false) = expect_directory {
                return Err(VfsError::BadArgument(
                    "expected a file, found a folder".to_string(),
                ));
            }
            return Ok(!write || caller == ADMIN);
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let node = lookup_tx(&tx, root, &parent, name)?;
        tx.commit()?;
        let Some(node) = node else {
            return Ok(false);
        };
        if let Some(expected) = expect_directory {
            if node.is_directory != expected {
                return Err(VfsError::BadArgument(if expected {
                    format!("expected a folder, found a file: {}", name)
                } else {
                    format!("expected a file, found a folder: {}", name)
                }));
            }
        }
        Ok(if write {
            can_write(caller, &node)
        } else {
            visible_to(caller, &node)
        })
    }

    async fn children_exist(
        &self,
        caller: OwnerId,
        parent: &str,
        root: &str,
    ) -> Result<bool, VfsError> {
        let parent = vpath::normalize(parent);
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let found: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM nodes WHERE doc_root_key = ?1 AND parent_path = ?2 \
                 AND (?3 = 0 OR owner_id = ?3 OR is_public = 1) LIMIT 1",
                params![root, parent, caller],
                |row| row.get(0),
            )
            .optional()?;
        tx.commit()?;
        Ok(found.is_some())
    }

    async fn readdir(
        &self,
        caller: OwnerId,
        parent: &str,
        root: &str,
    ) -> Result<Vec<Node>, VfsError> {
        let parent = vpath::normalize(parent);
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let rows = readdir_tx(&tx, caller, &parent, root, None)?;
        tx.commit()?;
        Ok(rows)
    }

    async fn readdir_by_owner(
        &self,
        caller: OwnerId,
        owner: OwnerId,
        parent: &str,
        root: &str,
    ) -> Result<Vec<Node>, VfsError> {
        let parent = vpath::normalize(parent);
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let rows = readdir_tx(&tx, caller, &parent, root, Some(owner))?;
        tx.commit()?;
        Ok(rows)
    }

    async fn mkdir(
        &self,
        owner: OwnerId,
        parent: &str,
        name: &str,
        root: &str,
        ordinal: i32,
        is_public: bool,
    ) -> Result<NodeId, VfsError> {
        let parent = vpath::normalize(parent);
        if !vpath::valid_name(name) {
            return Err(VfsError::InvalidName(name.to_string()));
        }
        if !vpath::valid_path(&parent) {
            return Err(VfsError::InvalidPath(parent));
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        if lookup_tx(&tx, root, &parent, name)?.is_some() {
            return Err(VfsError::AlreadyExists(base_of(&parent, name)));
        }
        require_parent_dir_tx(&tx, root, &parent)?;
        let uuid = insert_dir_tx(&tx, owner, root, &parent, name, ordinal, is_public)?;
        tx.commit()?;
        tracing::debug!(%uuid, parent = %parent, name, "mkdir");
        Ok(uuid)
    }

    async fn ensure_path(
        &self,
        owner: OwnerId,
        path: &str,
        root: &str,
    ) -> Result<bool, VfsError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let created = ensure_path_tx(&tx, owner, path, root)?;
        tx.commit()?;
        Ok(created)
    }

    async fn write_text(
        &self,
        owner: OwnerId,
        parent: &str,
        name: &str,
        root: &str,
        content: &str,
        ordinal: i32,
        is_public: bool,
    ) -> Result<NodeId, VfsError> {
        let parent = vpath::normalize(parent);
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let uuid = write_file_tx(
            &tx,
            owner,
            root,
            &parent,
            name,
            &FileContent::Text(content.to_string()),
            ordinal,
            is_public,
        )?;
        tx.commit()?;
        tracing::trace!(%uuid, parent = %parent, name, bytes = content.len(), "write_text");
        Ok(uuid)
    }

    async fn write_binary(
        &self,
        owner: OwnerId,
        parent: &str,
        name: &str,
        root: &str,
        content: &[u8],
        ordinal: i32,
        is_public: bool,
    ) -> Result<NodeId, VfsError> {
        let parent = vpath::normalize(parent);
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let uuid = write_file_tx(
            &tx,
            owner,
            root,
            &parent,
            name,
            &FileContent::Binary(content.to_vec()),
            ordinal,
            is_public,
        )?;
        tx.commit()?;
        tracing::trace!(%uuid, parent = %parent, name, bytes = content.len(), "write_binary");
        Ok(uuid)
    }

    async fn read_file(
        &self,
        caller: OwnerId,
        parent: &str,
        name: &str,
        root: &str,
    ) -> Result<FileContent, VfsError> {
        let parent = vpath::normalize(parent);
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let node = lookup_tx(&tx, root, &parent, name)?.ok_or(VfsError::NotFound)?;
        tx.commit()?;
        if !visible_to(caller, &node) {
            return Err(VfsError::NotFound);
        }
        if node.is_directory {
            return Err(VfsError::BadArgument(format!(
                "cannot read a folder: {}",
                name
            )));
        }
        match (node.is_binary, node.content_text, node.content_binary) {
            (false, Some(text), _) => Ok(FileContent::Text(text)),
            (true, _, Some(bytes)) => Ok(FileContent::Binary(bytes)),
            _ => Err(VfsError::Database("file row missing content".to_string())),
        }
    }

    async fn unlink(
        &self,
        caller: OwnerId,
        parent: &str,
        name: &str,
        root: &str,
    ) -> Result<(), VfsError> {
        let parent = vpath::normalize(parent);
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        unlink_tx(&tx, caller, &parent, name, root)?;
        tx.commit()?;
        tracing::debug!(parent = %parent, name, "unlink");
        Ok(())
    }

    async fn rmdir(
        &self,
        caller: OwnerId,
        parent: &str,
        name: &str,
        root: &str,
    ) -> Result<u64, VfsError> {
        let parent = vpath::normalize(parent);
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let deleted = rmdir_tx(&tx, caller, &parent, name, root)?;
        tx.commit()?;
        tracing::debug!(parent = %parent, name, deleted, "rmdir");
        Ok(deleted)
    }

    async fn rm(
        &self,
        caller: OwnerId,
        path: &str,
        root: &str,
        recursive: bool,
        force: bool,
    ) -> Result<u64, VfsError> {
        let norm = vpath::normalize(path);
        if norm.is_empty() {
            return Err(VfsError::BadArgument(
                "cannot remove the root".to_string(),
            ));
        }
        let (parent, name) = vpath::split(&norm);
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let node = lookup_tx(&tx, root, &parent, &name)?;
        let deleted = match node {
            None => {
                if force {
                    0
                } else {
                    return Err(VfsError::NotFound);
                }
            }
            Some(n) if n.is_directory => {
                if !recursive {
                    return Err(VfsError::BadArgument(format!(
                        "is a folder (recursive delete required): {}",
                        name
                    )));
                }
                rmdir_tx(&tx, caller, &parent, &name, root)?
            }
            Some(_) => {
                unlink_tx(&tx, caller, &parent, &name, root)?;
                1
            }
        };
        tx.commit()?;
        Ok(deleted)
    }

    async fn rename(
        &self,
        caller: OwnerId,
        old_parent: &str,
        old_name: &str,
        new_parent: &str,
        new_name: &str,
        root: &str,
    ) -> Result<(), VfsError> {
        let old_parent = vpath::normalize(old_parent);
        let new_parent = vpath::normalize(new_parent);
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        rename_tx(&tx, caller, &old_parent, old_name, &new_parent, new_name, root)?;
        tx.commit()?;
        tracing::debug!(
            from = %base_of(&old_parent, old_name),
            to = %base_of(&new_parent, new_name),
            "rename"
        );
        Ok(())
    }

    async fn set_public(
        &self,
        caller: OwnerId,
        parent: &str,
        name: &str,
        root: &str,
        is_public: bool,
        recursive: bool,
    ) -> Result<(), VfsError> {
        let parent = vpath::normalize(parent);
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        set_public_tx(&tx, caller, &parent, name, root, is_public, recursive)?;
        tx.commit()?;
        Ok(())
    }

    async fn get_max_ordinal(&self, parent: &str, root: &str) -> Result<i32, VfsError> {
        let parent = vpath::normalize(parent);
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let max = max_ordinal_tx(&tx, root, &parent)?;
        tx.commit()?;
        Ok(max)
    }

    async fn set_ordinal(
        &self,
        uuid: NodeId,
        root: &str,
        new_ordinal: i32,
    ) -> Result<(), VfsError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        set_ordinal_tx(&tx, root, uuid, new_ordinal)?;
        tx.commit()?;
        Ok(())
    }

    async fn swap_ordinals(&self, a: NodeId, b: NodeId, root: &str) -> Result<(), VfsError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        swap_ordinals_tx(&tx, root, a, b)?;
        tx.commit()?;
        tracing::debug!(%a, %b, "swap_ordinals");
        Ok(())
    }

    async fn shift_ordinals_down(
        &self,
        owner: OwnerId,
        parent: &str,
        root: &str,
        insert_ordinal: i32,
        slots: i32,
    ) -> Result<HashMap<String, String>, VfsError> {
        let parent = vpath::normalize(parent);
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let shifted = shift_ordinals_tx(&tx, root, &parent, insert_ordinal, slots)?;
        tx.commit()?;
        tracing::debug!(owner, parent = %parent, insert_ordinal, slots, shifted, "shift_ordinals_down");
        // Filenames never change in the database engine, so the path
        // mapping is always empty.
        Ok(HashMap::new())
    }

    async fn create_folder_at(
        &self,
        owner: OwnerId,
        parent: &str,
        name: &str,
        root: &str,
        insert_after: Option<i32>,
    ) -> Result<(NodeId, i32), VfsError> {
        let parent = vpath::normalize(parent);
        if !vpath::valid_name(name) {
            return Err(VfsError::InvalidName(name.to_string()));
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        if lookup_tx(&tx, root, &parent, name)?.is_some() {
            return Err(VfsError::AlreadyExists(base_of(&parent, name)));
        }
        require_parent_dir_tx(&tx, root, &parent)?;
        let ordinal = match insert_after {
            None => max_ordinal_tx(&tx, root, &parent)? + 1,
            Some(k) => {
                shift_ordinals_tx(&tx, root, &parent, k + 1, 1)?;
                k + 1
            }
        };
        let uuid = insert_dir_tx(&tx, owner, root, &parent, name, ordinal, false)?;
        tx.commit()?;
        tracing::debug!(%uuid, parent = %parent, name, ordinal, "create_folder_at");
        Ok((uuid, ordinal))
    }

    async fn paste_items(
        &self,
        caller: OwnerId,
        dest_parent: &str,
        root: &str,
        anchor: Option<NodeId>,
        items: &[NodeId],
        mode: PasteMode,
    ) -> Result<usize, VfsError> {
        if items.is_empty() {
            return Ok(0);
        }
        let dest_parent = vpath::normalize(dest_parent);
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        require_parent_dir_tx(&tx, root, &dest_parent)?;

        let insert_ordinal = match anchor {
            None => 0,
            Some(anchor_id) => {
                let anchor_node =
                    lookup_uuid_tx(&tx, root, anchor_id)?.ok_or(VfsError::NotFound)?;
                if anchor_node.parent_path != dest_parent {
                    return Err(VfsError::BadArgument(
                        "anchor is not in the destination folder".to_string(),
                    ));
                }
                anchor_node.ordinal + 1
            }
        };

        // Resolve and authorize every item before touching anything.
        let mut sources = Vec::with_capacity(items.len());
        for id in items {
            let node = lookup_uuid_tx(&tx, root, *id)?.ok_or(VfsError::NotFound)?;
            if !visible_to(caller, &node) {
                return Err(VfsError::NotFound);
            }
            if mode == PasteMode::Move && !can_write(caller, &node) {
                return Err(VfsError::Unauthorized);
            }
            if mode == PasteMode::Copy && node.parent_path == dest_parent {
                return Err(VfsError::AlreadyExists(node.full_path()));
            }
            sources.push(node);
        }

        shift_ordinals_tx(&tx, root, &dest_parent, insert_ordinal, items.len() as i32)?;

        // Phase 1: park every same-folder row on a reserved negative
        // temporary so the final assignments below can never collide.
        for (i, node) in sources.iter().enumerate() {
            if mode == PasteMode::Move && node.parent_path == dest_parent {
                set_ordinal_tx(&tx, root, node.uuid, i32::MIN + i as i32)?;
            }
        }

        // Phase 2: place each item on its slot.
        for (i, node) in sources.iter().enumerate() {
            let slot = insert_ordinal + i as i32;
            match mode {
                PasteMode::Move => {
                    if node.parent_path == dest_parent {
                        set_ordinal_tx(&tx, root, node.uuid, slot)?;
                    } else {
                        rename_into_slot_tx(&tx, node, &dest_parent, root, slot)?;
                    }
                }
                PasteMode::Copy => {
                    clone_subtree_tx(&tx, caller, node, &dest_parent, root, slot)?;
                }
            }
        }

        tx.commit()?;
        tracing::info!(
            count = items.len(),
            dest = %dest_parent,
            ?mode,
            "paste_items"
        );
        Ok(items.len())
    }

    async fn move_up_or_down(
        &self,
        caller: OwnerId,
        parent: &str,
        name: &str,
        root: &str,
        direction: Direction,
    ) -> Result<(), VfsError> {
        let parent = vpath::normalize(parent);
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let siblings = readdir_tx(&tx, caller, &parent, root, None)?;
        let i = siblings
            .iter()
            .position(|n| n.filename == name)
            .ok_or(VfsError::NotFound)?;
        if !can_write(caller, &siblings[i]) {
            return Err(VfsError::Unauthorized);
        }
        let j = match direction {
            Direction::Up => {
                if i == 0 {
                    return Err(VfsError::BadArgument("already at the top".to_string()));
                }
                i - 1
            }
            Direction::Down => {
                if i + 1 >= siblings.len() {
                    return Err(VfsError::BadArgument("already at the bottom".to_string()));
                }
                i + 1
            }
        };
        swap_ordinals_tx(&tx, root, siblings[i].uuid, siblings[j].uuid)?;
        tx.commit()?;
        tracing::debug!(parent = %parent, name, ?direction, "move_up_or_down");
        Ok(())
    }

    async fn search_text(
        &self,
        caller: OwnerId,
        query: &str,
        scope: &str,
        root: &str,
        mode: SearchMode,
        order: SearchOrder,
    ) -> Result<Vec<SearchHit>, VfsError> {
        let scope = vpath::normalize(scope);
        let compiled = search::compile(query, mode)?;

        let order_sql = match order {
            SearchOrder::ModTime => "modified_time DESC",
            SearchOrder::Filename => "filename ASC",
        };
        let sql = format!(
            "SELECT filename, parent_path, size_bytes, modified_time, content_type, content_text \
             FROM nodes \
             WHERE doc_root_key = ?1 AND is_directory = 0 AND is_binary = 0 \
               AND (?2 = 0 OR owner_id = ?2 OR is_public = 1) \
               AND (?3 = '' OR parent_path = ?3 \
                  OR substr(parent_path, 1, length(?3) + 1) = ?3 || '/') \
             ORDER BY {order_sql}"
        );

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let mut stmt = tx.prepare(&sql)?;
        let rows = stmt.query_map(params![root, caller, scope], |row| {
            let filename: String = row.get(0)?;
            let parent_path: String = row.get(1)?;
            let size_bytes: i64 = row.get(2)?;
            let modified_str: String = row.get(3)?;
            let content_type: String = row.get(4)?;
            let content_text: Option<String> = row.get(5)?;
            Ok((
                filename,
                parent_path,
                size_bytes,
                parse_time(3, &modified_str)?,
                content_type,
                content_text,
            ))
        })?;

        let mut hits = Vec::new();
        for row in rows {
            let (filename, parent_path, size_bytes, modified_time, ctype, content) = row?;
            let content = content.unwrap_or_default();
            if search::matches(&compiled, mode, &content) {
                hits.push(SearchHit {
                    full_path: vpath::join(&[&parent_path, &filename]),
                    file: filename,
                    size_bytes,
                    modified_time,
                    content_type: ctype,
                });
            }
        }
        drop(stmt);
        tx.commit()?;
        tracing::debug!(count = hits.len(), scope = %scope, ?mode, "search_text");
        Ok(hits)
    }
}

/// Move one source row (and, for directories, its subtree) into
/// `dest_parent` at `slot`.
fn rename_into_slot_tx(
    tx: &Transaction<'_>,
    node: &Node,
    dest_parent: &str,
    root: &str,
    slot: i32,
) -> Result<(), VfsError> {
    if lookup_tx(tx, root, dest_parent, &node.filename)?.is_some() {
        return Err(VfsError::AlreadyExists(base_of(dest_parent, &node.filename)));
    }
    let old_base = node.full_path();
    let new_base = base_of(dest_parent, &node.filename);
    if node.is_directory
        && (dest_parent == old_base || dest_parent.starts_with(&format!("{}/", old_base)))
    {
        return Err(VfsError::BadArgument(
            "cannot move a folder into itself".to_string(),
        ));
    }
    let now = Utc::now().to_rfc3339();
    tx.execute(
        "UPDATE nodes SET parent_path = ?1, ordinal = ?2, modified_time = ?3 \
         WHERE doc_root_key = ?4 AND uuid = ?5",
        params![dest_parent, slot, now, root, node.uuid.to_string()],
    )?;
    if node.is_directory {
        tx.execute(
            "UPDATE nodes SET parent_path = ?1 || substr(parent_path, length(?2) + 1), \
             modified_time = ?3 \
             WHERE doc_root_key = ?4 AND (parent_path = ?2 \
                OR substr(parent_path, 1, length(?2) + 1) = ?2 || '/')",
            params![new_base, old_base, now, root],
        )?;
    }
    Ok(())
}
