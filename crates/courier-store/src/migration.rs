//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use courier_core::now_millis;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
        tracing::debug!(version = CURRENT_VERSION, "store schema migrated");
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Peers and the local node
        CREATE TABLE nodes (
            id TEXT PRIMARY KEY,
            address TEXT NOT NULL,
            is_current INTEGER NOT NULL DEFAULT 0,
            disabled INTEGER NOT NULL DEFAULT 0,
            last_saved_seq INTEGER NOT NULL DEFAULT 0,
            last_loaded_seq INTEGER NOT NULL DEFAULT 0,
            last_saved_snapshot_seq INTEGER NOT NULL DEFAULT 0,
            last_loaded_snapshot_seq INTEGER NOT NULL DEFAULT 0,
            snapshot_watermark INTEGER,         -- Unix ms, nullable
            bootstrap_watermark INTEGER         -- Unix ms, nullable
        );

        -- Local object graph
        CREATE TABLE objects (
            class TEXT NOT NULL,
            id TEXT NOT NULL,
            fields BLOB NOT NULL,               -- CBOR map of field values
            PRIMARY KEY (class, id)
        );

        -- Identity map: remote object on a peer -> local object
        CREATE TABLE identities (
            peer TEXT NOT NULL,
            class TEXT NOT NULL,
            remote_id TEXT NOT NULL,
            local_id TEXT NOT NULL,
            PRIMARY KEY (peer, class, remote_id)
        );

        -- Change log
        CREATE TABLE sessions (
            session_id BLOB PRIMARY KEY,        -- 16 bytes
            parent_id BLOB,                     -- 16 bytes, nullable
            committed_at INTEGER NOT NULL,
            route TEXT NOT NULL,                -- newline-joined node ids
            saved INTEGER NOT NULL DEFAULT 0,
            records BLOB NOT NULL,              -- CBOR array of change records
            inserted INTEGER NOT NULL           -- insertion order tiebreak
        );

        -- Sealed packages, both directions
        CREATE TABLE packages (
            name TEXT PRIMARY KEY,              -- file name stem
            direction TEXT NOT NULL,            -- 'out' | 'in'
            created_at INTEGER NOT NULL,
            bytes BLOB NOT NULL
        );

        -- Package log
        CREATE TABLE package_log (
            entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
            package TEXT NOT NULL,
            at INTEGER NOT NULL,
            event BLOB NOT NULL,                -- CBOR PackageEvent
            message TEXT NOT NULL
        );

        CREATE INDEX idx_identities_local ON identities(class, local_id);
        CREATE INDEX idx_sessions_saved ON sessions(saved, committed_at);
        CREATE INDEX idx_packages_direction ON packages(direction, created_at);
        CREATE INDEX idx_package_log_package ON package_log(package);
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "nodes",
            "objects",
            "identities",
            "sessions",
            "packages",
            "package_log",
            "schema_migrations",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, 1);
    }
}
