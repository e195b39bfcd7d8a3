use super::{Backend, BackendKind, Entry, KeyRange};
use crate::error::{Result, StorageError};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    namespace TEXT NOT NULL,
    key       TEXT NOT NULL,
    value     BLOB NOT NULL,
    PRIMARY KEY (namespace, key)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS metadata (
    namespace TEXT PRIMARY KEY,
    value     BLOB NOT NULL
);
"#;

/// Single-file relational backend.
///
/// Namespaces are a key column. Every statement runs under one connection
/// lock in autocommit mode; batches run as one transaction under the same lock.
pub struct SqliteBackend {
    conn: Mutex<Option<Connection>>,
    path: PathBuf,
}

impl SqliteBackend {
    /// Open (or create) the database file at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::BackendUnavailable(format!("{}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(path)
            .map_err(|e| StorageError::BackendUnavailable(format!("{}: {}", path.display(), e)))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StorageError::BackendUnavailable(format!("schema init failed: {}", e)))?;

        info!("Opened SQLite database at {}", path.display());

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock();
        match guard.as_mut() {
            Some(conn) => f(conn),
            None => Err(StorageError::BackendUnavailable(format!(
                "SQLite database at {} is closed",
                self.path.display()
            ))),
        }
    }

    fn query_one(&self, sql: &str, namespace: &str, key: Option<&str>) -> Result<Option<Entry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let row = match key {
                Some(key) => stmt
                    .query_row(params![namespace, key], |row| Ok((row.get(0)?, row.get(1)?)))
                    .optional()?,
                None => stmt
                    .query_row(params![namespace], |row| Ok((row.get(0)?, row.get(1)?)))
                    .optional()?,
            };
            Ok(row)
        })
    }
}

impl Backend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn open_namespace(&self, _namespace: &str) -> Result<()> {
        self.with_conn(|_| Ok(()))
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT value FROM records WHERE namespace = ?1 AND key = ?2")?;
            let value = stmt
                .query_row(params![namespace, key], |row| row.get(0))
                .optional()?;
            Ok(value)
        })
    }

    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        self.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT OR REPLACE INTO records (namespace, key, value) VALUES (?1, ?2, ?3)",
            )?
            .execute(params![namespace, key, value])?;
            Ok(())
        })
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn
                .prepare_cached("DELETE FROM records WHERE namespace = ?1 AND key = ?2")?
                .execute(params![namespace, key])?;
            Ok(changed > 0)
        })
    }

    fn range(&self, namespace: &str, range: &KeyRange) -> Result<Vec<Entry>> {
        self.with_conn(|conn| {
            // NULL bounds mean unbounded
            let mut stmt = conn.prepare_cached(
                "SELECT key, value FROM records
                 WHERE namespace = ?1
                   AND (?2 IS NULL OR key >= ?2)
                   AND (?3 IS NULL OR key < ?3)
                 ORDER BY key ASC",
            )?;
            let rows = stmt.query_map(
                params![namespace, range.start.as_deref(), range.end.as_deref()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?);
            }
            Ok(entries)
        })
    }

    fn neighbor_before(&self, namespace: &str, key: &str) -> Result<Option<Entry>> {
        self.query_one(
            "SELECT key, value FROM records WHERE namespace = ?1 AND key < ?2
             ORDER BY key DESC LIMIT 1",
            namespace,
            Some(key),
        )
    }

    fn neighbor_at_or_after(&self, namespace: &str, key: &str) -> Result<Option<Entry>> {
        self.query_one(
            "SELECT key, value FROM records WHERE namespace = ?1 AND key >= ?2
             ORDER BY key ASC LIMIT 1",
            namespace,
            Some(key),
        )
    }

    fn first(&self, namespace: &str) -> Result<Option<Entry>> {
        self.query_one(
            "SELECT key, value FROM records WHERE namespace = ?1 ORDER BY key ASC LIMIT 1",
            namespace,
            None,
        )
    }

    fn last(&self, namespace: &str) -> Result<Option<Entry>> {
        self.query_one(
            "SELECT key, value FROM records WHERE namespace = ?1 ORDER BY key DESC LIMIT 1",
            namespace,
            None,
        )
    }

    fn put_batch(&self, namespace: &str, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR REPLACE INTO records (namespace, key, value) VALUES (?1, ?2, ?3)",
                )?;
                for (key, value) in entries {
                    stmt.execute(params![namespace, key, value])?;
                }
            }
            tx.commit()?;
            debug!("SQLite put_batch: {} entries into '{}'", entries.len(), namespace);
            Ok(())
        })
    }

    fn delete_batch(&self, namespace: &str, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut deleted = 0;
            {
                let mut stmt =
                    tx.prepare_cached("DELETE FROM records WHERE namespace = ?1 AND key = ?2")?;
                for key in keys {
                    deleted += stmt.execute(params![namespace, key])?;
                }
            }
            tx.commit()?;
            debug!(
                "SQLite delete_batch: {} of {} keys from '{}'",
                deleted,
                keys.len(),
                namespace
            );
            Ok(deleted)
        })
    }

    fn count(&self, namespace: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn
                .prepare_cached("SELECT COUNT(*) FROM records WHERE namespace = ?1")?
                .query_row(params![namespace], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    fn save_metadata(&self, namespace: &str, value: &[u8]) -> Result<()> {
        self.with_conn(|conn| {
            conn.prepare_cached("INSERT OR REPLACE INTO metadata (namespace, value) VALUES (?1, ?2)")?
                .execute(params![namespace, value])?;
            Ok(())
        })
    }

    fn load_metadata(&self, namespace: &str) -> Result<Option<Vec<u8>>> {
        self.with_conn(|conn| {
            let value = conn
                .prepare_cached("SELECT value FROM metadata WHERE namespace = ?1")?
                .query_row(params![namespace], |row| row.get(0))
                .optional()?;
            Ok(value)
        })
    }

    fn flush(&self) -> Result<()> {
        // autocommit leaves nothing buffered
        self.with_conn(|_| Ok(()))
    }

    fn close(&self) -> Result<()> {
        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            conn.close().map_err(|(_, e)| StorageError::Backend(e.to_string()))?;
            info!("Closed SQLite database at {}", self.path.display());
        }
        Ok(())
    }
}
