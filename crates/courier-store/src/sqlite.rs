//! SQLite implementation of the Store trait.
//!
//! This is the primary storage backend for Courier. It uses rusqlite with
//! bundled SQLite, wrapped in async via tokio::spawn_blocking.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;

use courier_core::{
    ChangeRecord, ChangeSession, FieldValue, Node, NodeId, Object, ObjectKey, PackageName, Route,
    SessionId,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{
    IdentityEntry, LogEntry, PackageDirection, PackageEvent, Store, StoredPackage, WriteBatch,
};

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| {
                StoreError::Database(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
                    Some(format!("mutex poisoned: {}", e)),
                ))
            })?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Blocking(e.to_string()))?
    }
}

fn encode_blob<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn decode_blob<T: DeserializeOwned>(idx: usize, blob: &[u8]) -> rusqlite::Result<T> {
    ciborium::from_reader(blob)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Blob, e.to_string().into()))
}

fn row_to_node(row: &Row<'_>) -> rusqlite::Result<Node> {
    Ok(Node {
        id: NodeId::new(row.get::<_, String>("id")?),
        address: row.get("address")?,
        is_current: row.get("is_current")?,
        disabled: row.get("disabled")?,
        last_saved_seq: row.get::<_, i64>("last_saved_seq")? as u64,
        last_loaded_seq: row.get::<_, i64>("last_loaded_seq")? as u64,
        last_saved_snapshot_seq: row.get::<_, i64>("last_saved_snapshot_seq")? as u64,
        last_loaded_snapshot_seq: row.get::<_, i64>("last_loaded_snapshot_seq")? as u64,
        snapshot_watermark: row.get("snapshot_watermark")?,
        bootstrap_watermark: row.get("bootstrap_watermark")?,
    })
}

fn row_to_object(row: &Row<'_>) -> rusqlite::Result<Object> {
    let class: String = row.get(0)?;
    let id: String = row.get(1)?;
    let blob: Vec<u8> = row.get(2)?;
    let fields: std::collections::BTreeMap<String, FieldValue> = decode_blob(2, &blob)?;
    Ok(Object {
        key: ObjectKey::new(class, id),
        fields,
    })
}

fn row_to_identity(row: &Row<'_>) -> rusqlite::Result<IdentityEntry> {
    Ok(IdentityEntry {
        peer: NodeId::new(row.get::<_, String>(0)?),
        class: row.get(1)?,
        remote_id: row.get(2)?,
        local_id: row.get(3)?,
    })
}

fn session_id(idx: usize, bytes: Vec<u8>) -> rusqlite::Result<SessionId> {
    let bytes: [u8; 16] = bytes
        .try_into()
        .map_err(|_| rusqlite::Error::InvalidColumnType(idx, "session_id".into(), Type::Blob))?;
    Ok(SessionId::from_bytes(bytes))
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<ChangeSession> {
    let id = session_id(0, row.get(0)?)?;
    let parent = match row.get::<_, Option<Vec<u8>>>(1)? {
        Some(bytes) => Some(session_id(1, bytes)?),
        None => None,
    };
    let route: String = row.get(3)?;
    let records_blob: Vec<u8> = row.get(5)?;
    let records: Vec<ChangeRecord> = decode_blob(5, &records_blob)?;
    Ok(ChangeSession {
        id,
        parent,
        committed_at: row.get(2)?,
        route: Route::from_trail(&route),
        saved: row.get(4)?,
        records,
    })
}

fn parse_name(idx: usize, stem: &str) -> rusqlite::Result<PackageName> {
    PackageName::parse(stem)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_package(row: &Row<'_>) -> rusqlite::Result<StoredPackage> {
    let name: String = row.get(0)?;
    let direction: String = row.get(1)?;
    let bytes: Vec<u8> = row.get(3)?;
    Ok(StoredPackage {
        name: parse_name(0, &name)?,
        direction: PackageDirection::parse(&direction)
            .ok_or_else(|| rusqlite::Error::InvalidColumnType(1, "direction".into(), Type::Text))?,
        created_at: row.get(2)?,
        bytes: Bytes::from(bytes),
    })
}

fn row_to_log(row: &Row<'_>) -> rusqlite::Result<LogEntry> {
    let package: String = row.get(0)?;
    let event: Vec<u8> = row.get(2)?;
    let event: PackageEvent = decode_blob(2, &event)?;
    Ok(LogEntry {
        package: parse_name(0, &package)?,
        at: row.get(1)?,
        event,
        message: row.get(3)?,
    })
}

/// Apply a batch inside an open transaction.
fn apply_batch(conn: &Connection, batch: &WriteBatch) -> Result<()> {
    for node in &batch.nodes {
        if node.is_current {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM nodes WHERE is_current = 1 AND id != ?1",
                    params![node.id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(existing) = existing {
                return Err(StoreError::DuplicateCurrentNode {
                    existing: NodeId::new(existing),
                    new: node.id.clone(),
                });
            }
        }
        conn.execute(
            "INSERT INTO nodes (
                id, address, is_current, disabled, last_saved_seq, last_loaded_seq,
                last_saved_snapshot_seq, last_loaded_snapshot_seq,
                snapshot_watermark, bootstrap_watermark
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
                address = excluded.address,
                is_current = excluded.is_current,
                disabled = excluded.disabled,
                last_saved_seq = excluded.last_saved_seq,
                last_loaded_seq = excluded.last_loaded_seq,
                last_saved_snapshot_seq = excluded.last_saved_snapshot_seq,
                last_loaded_snapshot_seq = excluded.last_loaded_snapshot_seq,
                snapshot_watermark = excluded.snapshot_watermark,
                bootstrap_watermark = excluded.bootstrap_watermark",
            params![
                node.id.as_str(),
                node.address,
                node.is_current,
                node.disabled,
                node.last_saved_seq as i64,
                node.last_loaded_seq as i64,
                node.last_saved_snapshot_seq as i64,
                node.last_loaded_snapshot_seq as i64,
                node.snapshot_watermark,
                node.bootstrap_watermark,
            ],
        )?;
    }

    for key in &batch.objects_deleted {
        conn.execute(
            "DELETE FROM objects WHERE class = ?1 AND id = ?2",
            params![key.class, key.id],
        )?;
        conn.execute(
            "DELETE FROM identities WHERE class = ?1 AND local_id = ?2",
            params![key.class, key.id],
        )?;
    }

    for object in &batch.objects_put {
        conn.execute(
            "INSERT OR REPLACE INTO objects (class, id, fields) VALUES (?1, ?2, ?3)",
            params![object.key.class, object.key.id, encode_blob(&object.fields)?],
        )?;
    }

    for entry in &batch.identities {
        conn.execute(
            "INSERT OR REPLACE INTO identities (peer, class, remote_id, local_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![entry.peer.as_str(), entry.class, entry.remote_id, entry.local_id],
        )?;
    }

    for session in &batch.sessions {
        conn.execute(
            "INSERT OR IGNORE INTO sessions (
                session_id, parent_id, committed_at, route, saved, records, inserted
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6,
                (SELECT COALESCE(MAX(inserted), 0) + 1 FROM sessions))",
            params![
                session.id.as_bytes().as_slice(),
                session.parent.as_ref().map(|p| p.as_bytes().to_vec()),
                session.committed_at,
                session.route.to_trail(),
                session.saved,
                encode_blob(&session.records)?,
            ],
        )?;
    }

    for id in &batch.sessions_saved {
        conn.execute(
            "UPDATE sessions SET saved = 1 WHERE session_id = ?1",
            params![id.as_bytes().as_slice()],
        )?;
    }

    for package in &batch.packages {
        conn.execute(
            "INSERT OR REPLACE INTO packages (name, direction, created_at, bytes)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                package.name.stem(),
                package.direction.as_str(),
                package.created_at,
                package.bytes.as_ref(),
            ],
        )?;
    }

    for entry in &batch.log {
        conn.execute(
            "INSERT INTO package_log (package, at, event, message) VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.package.stem(),
                entry.at,
                encode_blob(&entry.event)?,
                entry.message,
            ],
        )?;
    }

    Ok(())
}

const NODE_COLUMNS: &str = "id, address, is_current, disabled, last_saved_seq, last_loaded_seq,
    last_saved_snapshot_seq, last_loaded_snapshot_seq, snapshot_watermark, bootstrap_watermark";

#[async_trait]
impl Store for SqliteStore {
    async fn current_node(&self) -> Result<Option<Node>> {
        self.blocking(|conn| {
            conn.query_row(
                &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE is_current = 1"),
                [],
                row_to_node,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn get_node(&self, id: &NodeId) -> Result<Option<Node>> {
        let id = id.clone();
        self.blocking(move |conn| {
            conn.query_row(
                &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"),
                params![id.as_str()],
                row_to_node,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {NODE_COLUMNS} FROM nodes ORDER BY id"))?;
            let nodes = stmt
                .query_map([], row_to_node)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(nodes)
        })
        .await
    }

    async fn delete_node(&self, id: &NodeId) -> Result<()> {
        let id = id.clone();
        self.blocking(move |conn| {
            let is_current: Option<bool> = conn
                .query_row(
                    "SELECT is_current FROM nodes WHERE id = ?1",
                    params![id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            match is_current {
                None => Err(StoreError::NotFound(format!("node {id}"))),
                Some(true) => Err(StoreError::CurrentNodeDeletion(id)),
                Some(false) => {
                    conn.execute("DELETE FROM nodes WHERE id = ?1", params![id.as_str()])?;
                    Ok(())
                }
            }
        })
        .await
    }

    async fn get_object(&self, key: &ObjectKey) -> Result<Option<Object>> {
        let key = key.clone();
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT class, id, fields FROM objects WHERE class = ?1 AND id = ?2",
                params![key.class, key.id],
                row_to_object,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn list_objects(&self, class: &str) -> Result<Vec<Object>> {
        let class = class.to_string();
        self.blocking(move |conn| {
            let mut stmt =
                conn.prepare("SELECT class, id, fields FROM objects WHERE class = ?1 ORDER BY id")?;
            let objects = stmt
                .query_map(params![class], row_to_object)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(objects)
        })
        .await
    }

    async fn lookup_identity(
        &self,
        peer: &NodeId,
        class: &str,
        remote_id: &str,
    ) -> Result<Option<IdentityEntry>> {
        let (peer, class, remote_id) = (peer.clone(), class.to_string(), remote_id.to_string());
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT peer, class, remote_id, local_id FROM identities
                 WHERE peer = ?1 AND class = ?2 AND remote_id = ?3",
                params![peer.as_str(), class, remote_id],
                row_to_identity,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn identities_for(&self, key: &ObjectKey) -> Result<Vec<IdentityEntry>> {
        let key = key.clone();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT peer, class, remote_id, local_id FROM identities
                 WHERE class = ?1 AND local_id = ?2 ORDER BY peer",
            )?;
            let entries = stmt
                .query_map(params![key.class, key.id], row_to_identity)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
        .await
    }

    async fn unsaved_sessions(&self) -> Result<Vec<ChangeSession>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, parent_id, committed_at, route, saved, records
                 FROM sessions WHERE saved = 0 ORDER BY committed_at, inserted",
            )?;
            let sessions = stmt
                .query_map([], row_to_session)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(sessions)
        })
        .await
    }

    async fn has_session(&self, id: &SessionId) -> Result<bool> {
        let id = *id;
        self.blocking(move |conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM sessions WHERE session_id = ?1)",
                params![id.as_bytes().as_slice()],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
        .await
    }

    async fn get_package(&self, name: &PackageName) -> Result<Option<StoredPackage>> {
        let stem = name.stem();
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT name, direction, created_at, bytes FROM packages WHERE name = ?1",
                params![stem],
                row_to_package,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn list_packages(&self, direction: PackageDirection) -> Result<Vec<StoredPackage>> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT name, direction, created_at, bytes FROM packages
                 WHERE direction = ?1 ORDER BY created_at, name",
            )?;
            let packages = stmt
                .query_map(params![direction.as_str()], row_to_package)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(packages)
        })
        .await
    }

    async fn package_log(&self, name: &PackageName) -> Result<Vec<LogEntry>> {
        let stem = name.stem();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT package, at, event, message FROM package_log
                 WHERE package = ?1 ORDER BY entry_id",
            )?;
            let entries = stmt
                .query_map(params![stem], row_to_log)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
        .await
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            apply_batch(&tx, &batch)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::StoreExt;
    use courier_core::{ChangeKind, ObjectRef, PackageKind, Recipient, Scalar};

    fn object(id: &str, amount: i64) -> Object {
        Object::new(ObjectKey::new("Invoice", id)).with("amount", Scalar::Int(amount))
    }

    fn session(id: u128, committed_at: i64) -> ChangeSession {
        let mut s = ChangeSession::new(SessionId::from_u128(id), committed_at);
        s.records.push(ChangeRecord::new(
            ChangeKind::ObjectCreated,
            Some(ObjectRef::new("Invoice", "1")),
            committed_at,
        ));
        s
    }

    fn name(seq: u64) -> PackageName {
        PackageName::new("App", NodeId::new("A"), Recipient::AllNodes, seq, PackageKind::Protocol)
            .unwrap()
    }

    #[tokio::test]
    async fn test_nodes_and_current() {
        let store = SqliteStore::open_memory().unwrap();
        assert!(store.current_node().await.unwrap().is_none());

        store.put_node(Node::current(NodeId::new("A"), "")).await.unwrap();
        let mut peer = Node::new(NodeId::new("B"), "/tmp/b");
        peer.snapshot_watermark = Some(42);
        store.put_node(peer.clone()).await.unwrap();

        assert_eq!(store.require_current().await.unwrap().id, NodeId::new("A"));
        assert_eq!(store.get_node(&NodeId::new("B")).await.unwrap(), Some(peer));
        assert_eq!(store.list_nodes().await.unwrap().len(), 2);

        let second = store.put_node(Node::current(NodeId::new("C"), "")).await;
        assert!(matches!(second, Err(StoreError::DuplicateCurrentNode { .. })));
    }

    #[tokio::test]
    async fn test_current_node_cannot_be_deleted() {
        let store = SqliteStore::open_memory().unwrap();
        store.put_node(Node::current(NodeId::new("A"), "")).await.unwrap();
        store.put_node(Node::new(NodeId::new("B"), "")).await.unwrap();

        let result = store.delete_node(&NodeId::new("A")).await;
        assert!(matches!(result, Err(StoreError::CurrentNodeDeletion(_))));

        store.delete_node(&NodeId::new("B")).await.unwrap();
        assert!(store.get_node(&NodeId::new("B")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_object_delete_drops_identities() {
        let store = SqliteStore::open_memory().unwrap();
        let mut batch = WriteBatch::new();
        batch.objects_put.push(object("local1", 100));
        batch
            .identities
            .push(IdentityEntry::new(NodeId::new("A"), "Invoice", "1", "local1"));
        store.commit(batch).await.unwrap();

        let entry = store
            .lookup_identity(&NodeId::new("A"), "Invoice", "1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.local_key(), ObjectKey::new("Invoice", "local1"));
        assert_eq!(
            store
                .identities_for(&ObjectKey::new("Invoice", "local1"))
                .await
                .unwrap()
                .len(),
            1
        );

        let mut batch = WriteBatch::new();
        batch.objects_deleted.push(ObjectKey::new("Invoice", "local1"));
        store.commit(batch).await.unwrap();
        assert!(store
            .get_object(&ObjectKey::new("Invoice", "local1"))
            .await
            .unwrap()
            .is_none());
        assert!(store
            .lookup_identity(&NodeId::new("A"), "Invoice", "1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_sessions_saved_flag() {
        let store = SqliteStore::open_memory().unwrap();
        let mut batch = WriteBatch::new();
        batch.sessions.push(session(2, 20));
        batch.sessions.push(session(1, 10));
        store.commit(batch).await.unwrap();

        let unsaved = store.unsaved_sessions().await.unwrap();
        assert_eq!(
            unsaved.iter().map(|s| s.id).collect::<Vec<_>>(),
            vec![SessionId::from_u128(1), SessionId::from_u128(2)]
        );
        assert_eq!(unsaved[0].records.len(), 1);

        let mut batch = WriteBatch::new();
        batch.sessions_saved.push(SessionId::from_u128(1));
        store.commit(batch).await.unwrap();
        assert_eq!(store.unsaved_sessions().await.unwrap().len(), 1);
        assert!(store.has_session(&SessionId::from_u128(1)).await.unwrap());
        assert!(!store.has_session(&SessionId::from_u128(9)).await.unwrap());
    }

    #[tokio::test]
    async fn test_packages_and_log() {
        let store = SqliteStore::open_memory().unwrap();
        let mut batch = WriteBatch::new();
        batch.packages.push(StoredPackage {
            name: name(1),
            direction: PackageDirection::Outgoing,
            created_at: 5,
            bytes: Bytes::from_static(b"pkg"),
        });
        batch.log.push(LogEntry::new(name(1), 5, PackageEvent::Created, "2 sessions"));
        store.commit(batch).await.unwrap();
        store
            .append_log(LogEntry::new(name(1), 6, PackageEvent::Sent, ""))
            .await
            .unwrap();

        let stored = store.get_package(&name(1)).await.unwrap().unwrap();
        assert_eq!(stored.bytes.as_ref(), b"pkg");
        assert_eq!(
            store
                .list_packages(PackageDirection::Outgoing)
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(store
            .list_packages(PackageDirection::Incoming)
            .await
            .unwrap()
            .is_empty());

        let log = store.package_log(&name(1)).await.unwrap();
        assert_eq!(
            log.iter().map(|e| e.event.clone()).collect::<Vec<_>>(),
            vec![PackageEvent::Created, PackageEvent::Sent]
        );
    }

    #[tokio::test]
    async fn test_reopen_persists_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.put_node(Node::current(NodeId::new("A"), "")).await.unwrap();
            let mut batch = WriteBatch::new();
            batch.objects_put.push(object("1", 7));
            store.commit(batch).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.require_current().await.unwrap().id, NodeId::new("A"));
        let obj = store
            .get_object(&ObjectKey::new("Invoice", "1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(obj.get("amount"), &FieldValue::Scalar(Scalar::Int(7)));
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_nothing() {
        let store = SqliteStore::open_memory().unwrap();
        store.put_node(Node::current(NodeId::new("A"), "")).await.unwrap();

        let mut batch = WriteBatch::new();
        batch.objects_put.push(object("1", 1));
        batch.nodes.push(Node::current(NodeId::new("B"), ""));
        assert!(store.commit(batch).await.is_err());
        assert!(store
            .get_object(&ObjectKey::new("Invoice", "1"))
            .await
            .unwrap()
            .is_none());
    }
}
