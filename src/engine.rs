use crate::backend::{self, Backend, BackendKind};
use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::retention::{RetentionManager, RetentionSchedule, RetentionScheduler, SharedMaintainable};
use crate::store::{RecordStore, StoreSettings};
use crate::types::{MaintenanceReport, NamespaceProvider, StorageStats, TimeSeriesRecord};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// A record store shared with the engine's background tasks
pub type SharedStore<T> = Arc<Mutex<RecordStore<T>>>;

/// Owns the backend handle, the open stores and their maintenance.
///
/// Engines configured with the same backend kind share one registry handle;
/// the backend closes when the last of them shuts down. Dropping an engine
/// without [`shutdown`](Self::shutdown) still saves its stores, so no store
/// lock may be held by the dropping thread.
pub struct StorageEngine {
    config: StorageConfig,
    backend: Option<Arc<dyn Backend>>,
    retention: Arc<RetentionManager>,
    stores: Vec<SharedMaintainable>,
    tasks: Vec<JoinHandle<()>>,
    background: bool,
    closed: bool,
    warnings: Vec<String>,
}

impl StorageEngine {
    /// Validate the configuration and open the configured backend
    pub fn new(config: StorageConfig) -> Result<Self> {
        info!("Initializing StorageEngine");

        let warnings = config.validate()?;
        let backend = match config.persistence.provider {
            Some(kind) => Some(backend::open_backend(
                kind,
                &config.persistence.data_dir,
                &config.persistence.backend_options(),
            )?),
            None => None,
        };

        Ok(Self {
            config,
            backend,
            retention: Arc::new(RetentionManager::new()),
            stores: Vec::new(),
            tasks: Vec::new(),
            background: false,
            closed: false,
            warnings,
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.config.persistence.provider
    }

    /// Warnings produced by configuration validation
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn retention(&self) -> Arc<RetentionManager> {
        self.retention.clone()
    }

    /// Open the store for a provider's namespace and put it under maintenance
    pub fn open<T, P>(&mut self, provider: &P) -> Result<SharedStore<T>>
    where
        T: TimeSeriesRecord,
        P: NamespaceProvider + ?Sized,
    {
        let namespace = provider.namespace_id();
        if self.retention.namespaces().contains(&namespace) {
            return Err(StorageError::InvalidParameters(format!(
                "namespace '{}' is already open",
                namespace
            )));
        }

        let store = RecordStore::open(
            provider,
            self.backend.clone(),
            StoreSettings::from_config(&self.config),
        )?;
        let shared: SharedStore<T> = Arc::new(Mutex::new(store));
        let erased: SharedMaintainable = shared.clone();

        self.retention.register(
            erased.clone(),
            RetentionSchedule::from_config(&self.config.retention),
        )?;
        if self.background {
            self.spawn_autosave(namespace, erased.clone());
        }
        self.stores.push(erased);

        Ok(shared)
    }

    /// Spawn autosave for every store and the maintenance scheduler.
    ///
    /// Must be called inside a tokio runtime. Stores opened afterwards get
    /// their autosave task on open.
    pub fn start_background(&mut self) -> Result<()> {
        if self.background {
            return Ok(());
        }
        tokio::runtime::Handle::try_current().map_err(|e| {
            StorageError::Internal(format!("background tasks need a tokio runtime: {}", e))
        })?;

        let scheduler = RetentionScheduler::new(
            self.retention.clone(),
            self.config.retention.maintenance_interval_sec,
        );
        self.tasks.push(tokio::spawn(scheduler.start()));

        self.background = true;
        let stores: Vec<SharedMaintainable> = self.stores.clone();
        for store in stores {
            let namespace = store.lock().namespace().to_string();
            self.spawn_autosave(namespace, store);
        }
        Ok(())
    }

    fn spawn_autosave(&mut self, namespace: String, store: SharedMaintainable) {
        let Some(period) = self.config.store.autosave_interval() else {
            return;
        };
        if self.backend.is_none() {
            return;
        }

        debug!("Autosaving '{}' every {:?}", namespace, period);
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let store = store.clone();
                let saved = tokio::task::spawn_blocking(move || {
                    let mut store = store.lock();
                    store.save()
                });
                match saved.await {
                    Ok(Ok(summary)) => {
                        if summary.written + summary.deleted > 0 {
                            debug!(
                                "Autosaved '{}': {} written, {} deleted",
                                namespace, summary.written, summary.deleted
                            );
                        }
                    }
                    Ok(Err(e)) => error!("Autosave of '{}' failed: {}", namespace, e),
                    Err(e) => error!("Autosave task for '{}' panicked: {}", namespace, e),
                }
            }
        }));
    }

    /// Run one maintenance cycle over every open namespace now
    pub fn run_maintenance(&self) -> Vec<MaintenanceReport> {
        self.retention.run_cycle()
    }

    /// Save every open store
    pub fn save_all(&self) -> Result<()> {
        self.retention.save_all()
    }

    pub fn stats(&self) -> Result<Vec<StorageStats>> {
        self.retention.stats()
    }

    /// Stop background tasks, save every store and release the backend
    pub fn shutdown(mut self) -> Result<()> {
        info!("Shutting down StorageEngine");
        self.close()
    }

    fn close(&mut self) -> Result<()> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let saved = self.retention.save_all();
        if let Err(e) = &saved {
            warn!("Final save incomplete: {}", e);
        }

        if let Some(backend) = self.backend.take() {
            backend.flush()?;
            backend::release_backend(backend.kind())?;
        }

        saved
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let pending: usize = self
            .retention
            .stats()
            .map(|stats| stats.iter().map(|s| s.pending_writes + s.pending_deletes).sum())
            .unwrap_or(0);
        if pending > 0 && self.backend.is_some() {
            warn!(
                "StorageEngine dropped without shutdown, saving {} pending changes",
                pending
            );
        }
        if let Err(e) = self.close() {
            error!("Closing StorageEngine on drop failed: {}", e);
        }
    }
}
