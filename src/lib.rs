//! Embedded time-series persistence for home energy management
//!
//! Data providers (forecasts, meter readings, prices) keep their history in
//! namespaces of timestamp-keyed records. This crate provides the in-memory
//! record store they work against, persistence to LMDB or SQLite, and the
//! retention pipeline that downsamples and trims old history.
//!
//! # Features
//!
//! - Sorted per-namespace record stores with lazy, range-driven loading
//! - Change tracking with batched write-back
//! - Optional gzip compression of stored records
//! - Tiered compaction (hourly after 14 days, quarter-hourly after 2 hours)
//! - Vacuum of history beyond a keep horizon
//! - Background autosave and maintenance on tokio
//!
//! # Example
//!
//! ```no_run
//! use hems_storage::{
//!     BackendKind, FieldRecord, NamespaceProvider, StorageConfig, StorageEngine, Timestamp,
//!     Window,
//! };
//!
//! struct PvForecast;
//!
//! impl NamespaceProvider for PvForecast {
//!     fn namespace_id(&self) -> String {
//!         "pv_forecast".to_string()
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StorageConfig::with_backend(BackendKind::Lmdb, "data");
//!     let mut engine = StorageEngine::new(config)?;
//!     let store = engine.open::<FieldRecord, _>(&PvForecast)?;
//!
//!     let now = Timestamp::now();
//!     store.lock().insert(FieldRecord::new(now).with_field("pv_wh", 812.0))?;
//!     let found = store.lock().get(now, Window::Exact)?.cloned();
//!     assert!(found.is_some());
//!
//!     engine.shutdown()?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod store;
pub mod timestamp;
pub mod types;

// Include backend module from parent directory
#[path = "../backend/mod.rs"]
pub mod backend_impl;
pub mod backend {
    pub use super::backend_impl::*;
}

// Include retention module from parent directory
#[path = "../retention/mod.rs"]
pub mod retention_impl;
pub mod retention {
    pub use super::retention_impl::*;
}

// Re-export main types
pub use backend::{
    open_backend, release_backend, shutdown_backend, shutdown_backends, Backend, BackendKind,
    BackendOptions, KeyRange, LmdbBackend, SqliteBackend,
};
pub use codec::Codec;
pub use config::{PersistenceConfig, RetentionConfig, StorageConfig, StoreConfig};
pub use engine::{SharedStore, StorageEngine};
pub use error::{Result, StorageError};
pub use store::{RecordStore, SaveSummary, StoreSettings};
pub use timestamp::Timestamp;
pub use types::{
    default_compaction_tiers, CompactionReport, CompactionTier, CorruptRecord, FieldRecord,
    FieldValue, Keep, LoadPhase, LoadedRange, MaintenanceReport, NamespaceMetadata,
    NamespaceProvider, RetentionReport, StorageStats, TierReport, TimeSeriesRecord, Window,
};

// Re-export retention types
pub use retention::{
    CompactionEngine, Maintainable, RetentionManager, RetentionSchedule, RetentionScheduler,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize tracing subscriber (for demos and tests)
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("hems_storage=info"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_default_config() {
        let config = StorageConfig::default();
        assert!(config.persistence.provider.is_none());
        assert_eq!(config.store.batch_size, 1000);
    }
}
