//! Storage backends and the process-wide backend registry.

pub mod lmdb;
pub mod sqlite;

pub use lmdb::LmdbBackend;
pub use sqlite::SqliteBackend;

use crate::error::{Result, StorageError};
use crate::timestamp::Timestamp;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reserved name, not usable as a namespace
pub const METADATA_NAMESPACE: &str = "__metadata__";

/// A key/value pair read from a backend
pub type Entry = (String, Vec<u8>);

/// Available backend implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Memory-mapped LMDB environment
    Lmdb,
    /// Single SQLite file
    Sqlite,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Lmdb => write!(f, "lmdb"),
            BackendKind::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Backend tuning options
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Address space reserved by the LMDB map
    pub map_size: usize,
    /// Maximum number of LMDB sub-databases
    pub max_dbs: u32,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            map_size: 10 * 1024 * 1024 * 1024,
            max_dbs: 128,
        }
    }
}

/// Half-open key range, `None` meaning unbounded on that side
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

impl KeyRange {
    /// Key range for `[start, end)`; sentinels become unbounded sides
    pub fn between(start: Timestamp, end: Timestamp) -> Self {
        Self {
            start: start.to_key(),
            end: end.to_key(),
        }
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.start.as_deref().map_or(true, |start| key >= start)
            && self.end.as_deref().map_or(true, |end| key < end)
    }
}

/// Ordered byte store partitioned into namespaces.
///
/// Keys are timestamp keys, so lexicographic key order is time order.
#[cfg_attr(test, mockall::automock)]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Prepare a namespace for use. Idempotent.
    fn open_namespace(&self, namespace: &str) -> Result<()>;

    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()>;

    /// Returns whether the key existed
    fn delete(&self, namespace: &str, key: &str) -> Result<bool>;

    /// Entries in key order
    fn range(&self, namespace: &str, range: &KeyRange) -> Result<Vec<Entry>>;

    /// Nearest entry strictly before `key`
    fn neighbor_before(&self, namespace: &str, key: &str) -> Result<Option<Entry>>;

    /// Nearest entry at or after `key`
    fn neighbor_at_or_after(&self, namespace: &str, key: &str) -> Result<Option<Entry>>;

    fn first(&self, namespace: &str) -> Result<Option<Entry>>;

    fn last(&self, namespace: &str) -> Result<Option<Entry>>;

    /// Write all entries atomically
    fn put_batch(&self, namespace: &str, entries: &[Entry]) -> Result<()>;

    /// Delete all keys atomically, returning how many existed
    fn delete_batch(&self, namespace: &str, keys: &[String]) -> Result<usize>;

    fn count(&self, namespace: &str) -> Result<usize>;

    fn save_metadata(&self, namespace: &str, value: &[u8]) -> Result<()>;

    fn load_metadata(&self, namespace: &str) -> Result<Option<Vec<u8>>>;

    /// Force buffered writes to disk
    fn flush(&self) -> Result<()>;

    /// Flush and refuse further operations
    fn close(&self) -> Result<()>;
}

/// Reject empty and reserved namespace names
pub fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty() {
        return Err(StorageError::InvalidParameters(
            "namespace must not be empty".to_string(),
        ));
    }
    if namespace == METADATA_NAMESPACE {
        return Err(StorageError::InvalidParameters(format!(
            "namespace '{}' is reserved",
            METADATA_NAMESPACE
        )));
    }
    Ok(())
}

struct Registered {
    path: PathBuf,
    backend: Arc<dyn Backend>,
    holders: usize,
}

static REGISTRY: Mutex<BTreeMap<BackendKind, Registered>> =
    parking_lot::const_mutex(BTreeMap::new());

/// Location of a backend kind inside the data directory
pub fn backend_path(kind: BackendKind, data_dir: &Path) -> PathBuf {
    match kind {
        BackendKind::Lmdb => data_dir.join("lmdb"),
        BackendKind::Sqlite => data_dir.join("records.sqlite3"),
    }
}

/// Open the process-wide backend of `kind`, or return the one already open.
///
/// Every call takes a hold on the backend; pair it with [`release_backend`].
pub fn open_backend(
    kind: BackendKind,
    data_dir: &Path,
    options: &BackendOptions,
) -> Result<Arc<dyn Backend>> {
    let path = backend_path(kind, data_dir);
    let mut registry = REGISTRY.lock();

    if let Some(existing) = registry.get_mut(&kind) {
        if existing.path != path {
            warn!(
                "{} backend already open at {}, ignoring {}",
                kind,
                existing.path.display(),
                path.display()
            );
        }
        existing.holders += 1;
        return Ok(existing.backend.clone());
    }

    let backend: Arc<dyn Backend> = match kind {
        BackendKind::Lmdb => Arc::new(LmdbBackend::open(&path, options)?),
        BackendKind::Sqlite => Arc::new(SqliteBackend::open(&path)?),
    };

    info!("Registered {} backend at {}", kind, path.display());
    registry.insert(
        kind,
        Registered {
            path,
            backend: backend.clone(),
            holders: 1,
        },
    );

    Ok(backend)
}

/// Drop one hold taken by [`open_backend`]. The backend is closed when the
/// last holder releases it; returns true in that case.
pub fn release_backend(kind: BackendKind) -> Result<bool> {
    let mut registry = REGISTRY.lock();
    let Some(registered) = registry.get_mut(&kind) else {
        return Ok(false);
    };

    registered.holders = registered.holders.saturating_sub(1);
    if registered.holders > 0 {
        debug!("{} backend still has {} holders", kind, registered.holders);
        return Ok(false);
    }

    let Some(registered) = registry.remove(&kind) else {
        return Ok(false);
    };
    drop(registry);
    registered.backend.close()?;
    info!("Closed {} backend", kind);
    Ok(true)
}

/// Close one registered backend regardless of its holders.
/// Returns false if it was not open.
pub fn shutdown_backend(kind: BackendKind) -> Result<bool> {
    let registered = REGISTRY.lock().remove(&kind);
    match registered {
        Some(registered) => {
            registered.backend.close()?;
            info!("Closed {} backend", kind);
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Close every registered backend
pub fn shutdown_backends() -> Result<()> {
    let drained: Vec<(BackendKind, Registered)> =
        std::mem::take(&mut *REGISTRY.lock()).into_iter().collect();

    let mut first_error = None;
    for (kind, registered) in drained {
        match registered.backend.close() {
            Ok(()) => info!("Closed {} backend", kind),
            Err(e) => {
                warn!("Closing {} backend failed: {}", kind, e);
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
