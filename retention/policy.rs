use crate::config::RetentionConfig;
use crate::error::{Result, StorageError};
use crate::store::{RecordStore, SaveSummary};
use crate::timestamp::Timestamp;
use crate::types::{
    CompactionReport, Keep, MaintenanceReport, RetentionReport, StorageStats, TimeSeriesRecord,
};
use chrono::Duration;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, info, warn};

/// The maintenance surface of a record store, independent of its record type
pub trait Maintainable: Send {
    fn namespace(&self) -> &str;

    fn compact_at(&mut self, now: Timestamp) -> Result<CompactionReport>;

    fn vacuum(&mut self, keep: Keep) -> Result<RetentionReport>;

    fn save(&mut self) -> Result<SaveSummary>;

    fn stats(&self) -> Result<StorageStats>;
}

impl<T: TimeSeriesRecord> Maintainable for RecordStore<T> {
    fn namespace(&self) -> &str {
        RecordStore::namespace(self)
    }

    fn compact_at(&mut self, now: Timestamp) -> Result<CompactionReport> {
        RecordStore::compact_at(self, now)
    }

    fn vacuum(&mut self, keep: Keep) -> Result<RetentionReport> {
        RecordStore::vacuum(self, keep)
    }

    fn save(&mut self) -> Result<SaveSummary> {
        RecordStore::save(self)
    }

    fn stats(&self) -> Result<StorageStats> {
        RecordStore::stats(self)
    }
}

/// A store shared between its owner and the maintenance tasks
pub type SharedMaintainable = Arc<Mutex<dyn Maintainable>>;

/// When a namespace gets compacted and vacuumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionSchedule {
    /// Minimum time between compactions, `None` disables compaction
    pub compaction_interval: Option<Duration>,
    /// History kept behind the newest record, `None` disables vacuum
    pub keep: Option<Duration>,
}

impl RetentionSchedule {
    pub fn from_config(config: &RetentionConfig) -> Self {
        Self {
            compaction_interval: config
                .compaction_interval_sec
                .map(|secs| Duration::seconds(secs as i64)),
            keep: config.keep_duration_h.map(Duration::hours),
        }
    }
}

struct ManagedNamespace {
    store: SharedMaintainable,
    schedule: RetentionSchedule,
    last_compaction: Option<Timestamp>,
}

/// Runs compaction and vacuum for every registered namespace.
///
/// Within one cycle a namespace is compacted before it is vacuumed, and both
/// steps run under the same store lock.
#[derive(Default)]
pub struct RetentionManager {
    namespaces: Mutex<IndexMap<String, ManagedNamespace>>,
}

impl RetentionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a store. Registering a namespace twice is an error.
    pub fn register(&self, store: SharedMaintainable, schedule: RetentionSchedule) -> Result<()> {
        let namespace = store.lock().namespace().to_string();
        if let Some(keep) = schedule.keep {
            if keep < Duration::zero() {
                return Err(StorageError::RetentionError(format!(
                    "negative keep duration for '{}'",
                    namespace
                )));
            }
        }

        let mut namespaces = self.namespaces.lock();
        if namespaces.contains_key(&namespace) {
            return Err(StorageError::RetentionError(format!(
                "namespace '{}' is already managed",
                namespace
            )));
        }

        info!(
            "Managing retention for '{}' (compaction every {:?}s, keep {:?}h)",
            namespace,
            schedule.compaction_interval.map(|d| d.num_seconds()),
            schedule.keep.map(|d| d.num_hours())
        );
        namespaces.insert(
            namespace,
            ManagedNamespace {
                store,
                schedule,
                last_compaction: None,
            },
        );
        Ok(())
    }

    pub fn unregister(&self, namespace: &str) -> bool {
        self.namespaces.lock().shift_remove(namespace).is_some()
    }

    /// Managed namespaces in registration order
    pub fn namespaces(&self) -> Vec<String> {
        self.namespaces.lock().keys().cloned().collect()
    }

    /// Run one maintenance cycle now
    pub fn run_cycle(&self) -> Vec<MaintenanceReport> {
        self.run_cycle_at(Timestamp::now())
    }

    /// Run one maintenance cycle as if the time were `now`.
    ///
    /// A failure in one namespace is reported and does not stop the others.
    pub fn run_cycle_at(&self, now: Timestamp) -> Vec<MaintenanceReport> {
        let mut namespaces = self.namespaces.lock();
        let mut reports = Vec::with_capacity(namespaces.len());

        for (namespace, managed) in namespaces.iter_mut() {
            let report = Self::maintain(namespace, managed, now);
            if let Some(e) = &report.error {
                error!("Maintenance of '{}' failed: {}", namespace, e);
            }
            reports.push(report);
        }

        reports
    }

    fn maintain(namespace: &str, managed: &mut ManagedNamespace, now: Timestamp) -> MaintenanceReport {
        let mut report = MaintenanceReport {
            namespace: namespace.to_string(),
            compaction: None,
            vacuum: None,
            error: None,
        };
        let mut store = managed.store.lock();

        let compaction_due = match (managed.schedule.compaction_interval, managed.last_compaction) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(interval), Some(last)) => now >= last + interval,
        };

        if compaction_due {
            match store.compact_at(now) {
                Ok(compaction) => {
                    managed.last_compaction = Some(now);
                    report.compaction = Some(compaction);
                }
                Err(e) => {
                    // vacuum must not run over history that was not compacted
                    report.error = Some(e.to_string());
                    return report;
                }
            }
        }

        if let Some(keep) = managed.schedule.keep {
            match store.vacuum(Keep::Hours(keep.num_hours())) {
                Ok(vacuum) => report.vacuum = Some(vacuum),
                Err(e) => report.error = Some(e.to_string()),
            }
        }

        report
    }

    /// Save every managed store, returning the first error
    pub fn save_all(&self) -> Result<()> {
        let namespaces = self.namespaces.lock();
        let mut first_error = None;

        for (namespace, managed) in namespaces.iter() {
            if let Err(e) = managed.store.lock().save() {
                warn!("Saving '{}' failed: {}", namespace, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stats of every managed store
    pub fn stats(&self) -> Result<Vec<StorageStats>> {
        self.namespaces
            .lock()
            .values()
            .map(|managed| managed.store.lock().stats())
            .collect()
    }
}
