use super::{Backend, BackendKind, BackendOptions, Entry, KeyRange, METADATA_NAMESPACE};
use crate::error::{Result, StorageError};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions, RoTxn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

type Table = Database<Str, Bytes>;

/// Memory-mapped backend with one LMDB sub-database per namespace.
///
/// Writers take `write_lock`; readers open their own snapshot transaction
/// and never block on a writer.
pub struct LmdbBackend {
    env: Env,
    path: PathBuf,
    metadata: Table,
    tables: RwLock<HashMap<String, Table>>,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl LmdbBackend {
    /// Open (or create) the environment in directory `path`
    pub fn open(path: &Path, options: &BackendOptions) -> Result<Self> {
        std::fs::create_dir_all(path).map_err(|e| {
            StorageError::BackendUnavailable(format!("{}: {}", path.display(), e))
        })?;

        // SAFETY: the environment is opened once per process through the backend registry
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(options.map_size)
                .max_dbs(options.max_dbs)
                .open(path)
        }
        .map_err(|e| StorageError::BackendUnavailable(format!("{}: {}", path.display(), e)))?;

        let metadata = {
            let mut wtxn = env.write_txn()?;
            let table: Table = env.create_database(&mut wtxn, Some(METADATA_NAMESPACE))?;
            wtxn.commit()?;
            table
        };

        info!(
            "Opened LMDB environment at {} (map_size: {} bytes, max_dbs: {})",
            path.display(),
            options.map_size,
            options.max_dbs
        );

        Ok(Self {
            env,
            path: path.to_path_buf(),
            metadata,
            tables: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::BackendUnavailable(format!(
                "LMDB environment at {} is closed",
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Existing table, `None` if the namespace was never created.
    ///
    /// A handle opened in a transaction only becomes shared once that
    /// transaction commits, so first lookups go through a short write txn.
    fn table(&self, namespace: &str) -> Result<Option<Table>> {
        if let Some(table) = self.tables.read().get(namespace) {
            return Ok(Some(*table));
        }
        let _guard = self.write_lock.lock();
        if let Some(table) = self.tables.read().get(namespace) {
            return Ok(Some(*table));
        }
        let wtxn = self.env.write_txn()?;
        let table: Option<Table> = self.env.open_database(&wtxn, Some(namespace))?;
        wtxn.commit()?;
        if let Some(table) = table {
            self.tables.write().insert(namespace.to_string(), table);
        }
        Ok(table)
    }

    /// Table for writes, created on demand. Caller holds `write_lock`.
    fn table_for_write(&self, namespace: &str) -> Result<Table> {
        if let Some(table) = self.tables.read().get(namespace) {
            return Ok(*table);
        }
        let mut wtxn = self.env.write_txn()?;
        let table: Table = self.env.create_database(&mut wtxn, Some(namespace))?;
        wtxn.commit()?;
        self.tables.write().insert(namespace.to_string(), table);
        debug!("Created LMDB sub-database '{}'", namespace);
        Ok(table)
    }

    fn read_one<F>(&self, namespace: &str, f: F) -> Result<Option<Entry>>
    where
        F: for<'t> FnOnce(&Table, &'t RoTxn) -> heed::Result<Option<(&'t str, &'t [u8])>>,
    {
        self.ensure_open()?;
        let Some(table) = self.table(namespace)? else {
            return Ok(None);
        };
        let rtxn = self.env.read_txn()?;
        let found = f(&table, &rtxn)?;
        Ok(found.map(|(key, value)| (key.to_string(), value.to_vec())))
    }
}

impl Backend for LmdbBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Lmdb
    }

    fn open_namespace(&self, namespace: &str) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock();
        self.table_for_write(namespace).map(|_| ())
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        let Some(table) = self.table(namespace)? else {
            return Ok(None);
        };
        let rtxn = self.env.read_txn()?;
        Ok(table.get(&rtxn, key)?.map(|value| value.to_vec()))
    }

    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock();
        let table = self.table_for_write(namespace)?;
        let mut wtxn = self.env.write_txn()?;
        table.put(&mut wtxn, key, value)?;
        wtxn.commit()?;
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock();
        let table = self.table_for_write(namespace)?;
        let mut wtxn = self.env.write_txn()?;
        let existed = table.delete(&mut wtxn, key)?;
        wtxn.commit()?;
        Ok(existed)
    }

    fn range(&self, namespace: &str, range: &KeyRange) -> Result<Vec<Entry>> {
        self.ensure_open()?;
        let Some(table) = self.table(namespace)? else {
            return Ok(Vec::new());
        };
        let rtxn = self.env.read_txn()?;

        let start = match range.start.as_deref() {
            Some(key) => Bound::Included(key),
            None => Bound::Unbounded,
        };
        let end = match range.end.as_deref() {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        if let (Some(start), Some(end)) = (range.start.as_deref(), range.end.as_deref()) {
            if start >= end {
                return Ok(Vec::new());
            }
        }

        let mut entries = Vec::new();
        for item in table.range(&rtxn, &(start, end))? {
            let (key, value) = item?;
            entries.push((key.to_string(), value.to_vec()));
        }
        Ok(entries)
    }

    fn neighbor_before(&self, namespace: &str, key: &str) -> Result<Option<Entry>> {
        self.read_one(namespace, |table, rtxn| {
            let bounds: (Bound<&str>, Bound<&str>) = (Bound::Unbounded, Bound::Excluded(key));
            table.rev_range(rtxn, &bounds)?.next().transpose()
        })
    }

    fn neighbor_at_or_after(&self, namespace: &str, key: &str) -> Result<Option<Entry>> {
        self.read_one(namespace, |table, rtxn| {
            let bounds: (Bound<&str>, Bound<&str>) = (Bound::Included(key), Bound::Unbounded);
            table.range(rtxn, &bounds)?.next().transpose()
        })
    }

    fn first(&self, namespace: &str) -> Result<Option<Entry>> {
        self.read_one(namespace, |table, rtxn| table.first(rtxn))
    }

    fn last(&self, namespace: &str) -> Result<Option<Entry>> {
        self.read_one(namespace, |table, rtxn| table.last(rtxn))
    }

    fn put_batch(&self, namespace: &str, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.ensure_open()?;
        let _guard = self.write_lock.lock();
        let table = self.table_for_write(namespace)?;
        let mut wtxn = self.env.write_txn()?;
        for (key, value) in entries {
            table.put(&mut wtxn, key, value)?;
        }
        wtxn.commit()?;
        debug!("LMDB put_batch: {} entries into '{}'", entries.len(), namespace);
        Ok(())
    }

    fn delete_batch(&self, namespace: &str, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.ensure_open()?;
        let _guard = self.write_lock.lock();
        let table = self.table_for_write(namespace)?;
        let mut wtxn = self.env.write_txn()?;
        let mut deleted = 0;
        for key in keys {
            if table.delete(&mut wtxn, key)? {
                deleted += 1;
            }
        }
        wtxn.commit()?;
        debug!("LMDB delete_batch: {} of {} keys from '{}'", deleted, keys.len(), namespace);
        Ok(deleted)
    }

    fn count(&self, namespace: &str) -> Result<usize> {
        self.ensure_open()?;
        let Some(table) = self.table(namespace)? else {
            return Ok(0);
        };
        let rtxn = self.env.read_txn()?;
        Ok(table.len(&rtxn)? as usize)
    }

    fn save_metadata(&self, namespace: &str, value: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock();
        let mut wtxn = self.env.write_txn()?;
        self.metadata.put(&mut wtxn, namespace, value)?;
        wtxn.commit()?;
        Ok(())
    }

    fn load_metadata(&self, namespace: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        let rtxn = self.env.read_txn()?;
        Ok(self.metadata.get(&rtxn, namespace)?.map(|value| value.to_vec()))
    }

    fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.env.force_sync()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.env.force_sync()?;
        info!("Closed LMDB environment at {}", self.path.display());
        Ok(())
    }
}
