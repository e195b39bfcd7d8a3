//! Per-namespace record store with lazy loading and change tracking.
//!
//! A [`RecordStore`] keeps a sorted in-memory index over part or all of a
//! namespace. Ranges are pulled from the backend on first access and the
//! loaded span only ever grows: `None -> Initial -> Full`. Mutations are
//! tracked in three disjoint sets (`dirty`, `new`, `deleted`) and written
//! back on [`RecordStore::save`].
//!
//! The store has no internal locking. It is meant to be driven by a single
//! owner; [`StorageEngine`](crate::engine::StorageEngine) wraps each store in
//! a mutex when background tasks need it.

use crate::backend::{validate_namespace, Backend, BackendKind, Entry, KeyRange};
use crate::codec::Codec;
use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::retention::CompactionEngine;
use crate::timestamp::Timestamp;
use crate::types::{
    CompactionReport, CompactionTier, CorruptRecord, Keep, LoadPhase, LoadedRange,
    NamespaceMetadata, NamespaceProvider, RetentionReport, StorageStats, TimeSeriesRecord, Window,
};
use chrono::{Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Store behaviour taken from the configuration
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// gzip level for written records, 0 disables compression
    pub compression_level: u32,
    /// Half-width of the window loaded on first access, `None` loads everything
    pub initial_load_window: Option<Duration>,
    /// Maximum entries per backend batch
    pub batch_size: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            compression_level: 0,
            initial_load_window: None,
            batch_size: 1000,
        }
    }
}

impl StoreSettings {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            compression_level: config.persistence.compression_level,
            initial_load_window: config.store.initial_load_window_h.map(Duration::hours),
            batch_size: config.store.batch_size.max(1),
        }
    }
}

/// What a save wrote to the backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveSummary {
    pub written: usize,
    pub deleted: usize,
}

fn one_second() -> Duration {
    Duration::seconds(1)
}

/// In-memory view of one namespace
pub struct RecordStore<T: TimeSeriesRecord> {
    namespace: String,
    backend: Option<Arc<dyn Backend>>,
    codec: Codec,
    settings: StoreSettings,
    tiers: Vec<CompactionTier>,
    metadata: NamespaceMetadata,
    records: BTreeMap<Timestamp, T>,
    phase: LoadPhase,
    loaded: Option<LoadedRange>,
    dirty: BTreeSet<Timestamp>,
    new: BTreeSet<Timestamp>,
    deleted: BTreeSet<Timestamp>,
    corrupt: Vec<CorruptRecord>,
}

impl<T: TimeSeriesRecord> RecordStore<T> {
    /// Bind a store to the provider's namespace.
    ///
    /// Without a backend the store is purely in-memory and starts fully loaded.
    pub fn open<P: NamespaceProvider + ?Sized>(
        provider: &P,
        backend: Option<Arc<dyn Backend>>,
        settings: StoreSettings,
    ) -> Result<Self> {
        let namespace = provider.namespace_id();
        validate_namespace(&namespace)?;
        let codec = Codec::new(settings.compression_level)?;
        let kind = backend.as_ref().map(|b| b.kind());

        let metadata = match &backend {
            Some(backend) => {
                backend.open_namespace(&namespace)?;
                load_or_init_metadata(backend.as_ref(), &namespace, settings.compression_level)?
            }
            None => NamespaceMetadata::new(None, settings.compression_level),
        };

        let (phase, loaded) = match backend {
            Some(_) => (LoadPhase::None, None),
            None => (
                LoadPhase::Full,
                Some(LoadedRange::new(Timestamp::UNBOUND_START, Timestamp::UNBOUND_END)),
            ),
        };

        info!(
            "Opened record store '{}' (backend: {}, compression: {}, initial window: {:?})",
            namespace,
            kind.map(|k| k.to_string()).unwrap_or_else(|| "none".to_string()),
            settings.compression_level,
            settings.initial_load_window.map(|w| w.num_hours())
        );

        Ok(Self {
            namespace,
            backend,
            codec,
            settings,
            tiers: provider.compaction_tiers(),
            metadata,
            records: BTreeMap::new(),
            phase,
            loaded,
            dirty: BTreeSet::new(),
            new: BTreeSet::new(),
            deleted: BTreeSet::new(),
            corrupt: Vec::new(),
        })
    }

    /// Purely in-memory store
    pub fn in_memory<P: NamespaceProvider + ?Sized>(provider: &P) -> Result<Self> {
        Self::open(provider, None, StoreSettings::default())
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.backend.as_ref().map(|b| b.kind())
    }

    pub fn metadata(&self) -> &NamespaceMetadata {
        &self.metadata
    }

    pub fn compaction_tiers(&self) -> &[CompactionTier] {
        &self.tiers
    }

    pub fn load_phase(&self) -> LoadPhase {
        self.phase
    }

    pub fn loaded_range(&self) -> Option<LoadedRange> {
        self.loaded
    }

    /// Records currently in memory
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of timestamps waiting for the next save
    pub fn pending_changes(&self) -> usize {
        self.dirty.len() + self.new.len() + self.deleted.len()
    }

    /// Drain the corrupt records seen by loads so far
    pub fn take_corrupt(&mut self) -> Vec<CorruptRecord> {
        std::mem::take(&mut self.corrupt)
    }

    /// Insert a record and track it for the next save
    pub fn insert(&mut self, record: T) -> Result<()> {
        self.insert_with(record, true)
    }

    /// Insert a record. With `mark_dirty = false` it is kept in memory only,
    /// unless it replaces a pending tombstone.
    pub fn insert_with(&mut self, record: T, mark_dirty: bool) -> Result<()> {
        let ts = record.timestamp();
        if ts.is_unbounded() {
            return Err(StorageError::InvalidTimestamp(
                "records need a real timestamp".to_string(),
            ));
        }
        record.validate()?;

        self.ensure_loaded(ts, ts + one_second())?;
        if self.records.contains_key(&ts) {
            return Err(StorageError::DuplicateRecord(ts.to_string()));
        }

        self.records.insert(ts, record);
        if self.deleted.remove(&ts) {
            // the stored copy still exists, so this is an overwrite
            self.dirty.insert(ts);
        } else if mark_dirty {
            self.new.insert(ts);
        }
        Ok(())
    }

    /// Replace the record at the same timestamp, or insert it
    pub fn upsert(&mut self, record: T) -> Result<()> {
        let ts = record.timestamp();
        if ts.is_unbounded() {
            return Err(StorageError::InvalidTimestamp(
                "records need a real timestamp".to_string(),
            ));
        }
        record.validate()?;

        self.ensure_loaded(ts, ts + one_second())?;
        match self.records.get_mut(&ts) {
            Some(existing) => {
                *existing = record;
                if !self.new.contains(&ts) {
                    self.dirty.insert(ts);
                }
                Ok(())
            }
            None => self.insert(record),
        }
    }

    /// Look up a record.
    ///
    /// `Window::Exact` matches `target` only. `Window::Unbounded` returns the
    /// nearest record in the whole namespace, `Window::Span(d)` the nearest
    /// within `[target - d, target + d]`. Ties go to the earlier record.
    pub fn get(&mut self, target: Timestamp, window: Window) -> Result<Option<&T>> {
        match window {
            Window::Exact => {
                if target.is_unbounded() {
                    return Ok(None);
                }
                self.ensure_loaded(target, target + one_second())?;
                Ok(self.records.get(&target))
            }
            Window::Unbounded => {
                self.ensure_loaded(Timestamp::UNBOUND_START, Timestamp::UNBOUND_END)?;
                Ok(self
                    .nearest(target, Timestamp::UNBOUND_START, Timestamp::UNBOUND_END)
                    .and_then(|ts| self.records.get(&ts)))
            }
            Window::Span(span) => {
                let lo = target - span;
                let hi = target + span;
                self.ensure_loaded(lo, hi + one_second())?;
                Ok(self
                    .nearest(target, lo, hi)
                    .and_then(|ts| self.records.get(&ts)))
            }
        }
    }

    /// Mutable access to the record at `target`; the record is marked dirty
    pub fn get_mut(&mut self, target: Timestamp) -> Result<Option<&mut T>> {
        if target.is_unbounded() {
            return Ok(None);
        }
        self.ensure_loaded(target, target + one_second())?;
        if self.records.contains_key(&target) && !self.new.contains(&target) {
            self.dirty.insert(target);
        }
        Ok(self.records.get_mut(&target))
    }

    /// Records in `[start, end)` in time order
    pub fn range(&mut self, start: Timestamp, end: Timestamp) -> Result<Vec<&T>> {
        if start >= end {
            return Ok(Vec::new());
        }
        self.ensure_loaded(start, end)?;
        Ok(self.records.range(start..end).map(|(_, r)| r).collect())
    }

    /// Remove every record in `[start, end)`.
    ///
    /// Persisted records become tombstones removed on the next save; records
    /// never saved are forgotten without any I/O.
    pub fn delete(&mut self, start: Timestamp, end: Timestamp) -> Result<usize> {
        if start >= end {
            return Ok(0);
        }
        self.ensure_loaded(start, end)?;

        let doomed: Vec<Timestamp> = self.records.range(start..end).map(|(ts, _)| *ts).collect();
        for ts in &doomed {
            self.remove_in_memory(*ts);
        }

        debug!("Deleted {} records from '{}'", doomed.len(), self.namespace);
        Ok(doomed.len())
    }

    fn remove_in_memory(&mut self, ts: Timestamp) {
        self.records.remove(&ts);
        self.dirty.remove(&ts);
        if !self.new.remove(&ts) {
            self.deleted.insert(ts);
        }
    }

    /// Write pending changes: records first, then tombstones
    pub fn save(&mut self) -> Result<SaveSummary> {
        let Some(backend) = self.backend.clone() else {
            self.clear_pending();
            return Ok(SaveSummary::default());
        };
        if self.pending_changes() == 0 {
            return Ok(SaveSummary::default());
        }

        let batch_size = self.settings.batch_size.max(1);
        let mut summary = SaveSummary::default();

        let to_write: Vec<Timestamp> = self.dirty.union(&self.new).copied().collect();
        // records changed through get_mut are only checked here
        for ts in &to_write {
            if let Some(record) = self.records.get(ts) {
                record.validate()?;
            }
        }
        for chunk in to_write.chunks(batch_size) {
            let mut entries: Vec<Entry> = Vec::with_capacity(chunk.len());
            for ts in chunk {
                let (Some(record), Some(key)) = (self.records.get(ts), ts.to_key()) else {
                    continue;
                };
                entries.push((key, self.codec.encode(record)?));
            }
            backend.put_batch(&self.namespace, &entries)?;
            summary.written += entries.len();
        }

        let tombstones: Vec<String> = self.deleted.iter().filter_map(|ts| ts.to_key()).collect();
        for chunk in tombstones.chunks(batch_size) {
            summary.deleted += backend.delete_batch(&self.namespace, chunk)?;
        }

        self.clear_pending();
        info!(
            "Saved '{}': {} written, {} deleted",
            self.namespace, summary.written, summary.deleted
        );
        Ok(summary)
    }

    fn clear_pending(&mut self) {
        self.dirty.clear();
        self.new.clear();
        self.deleted.clear();
    }

    /// Run every compaction tier against the current time
    pub fn compact(&mut self) -> Result<CompactionReport> {
        self.compact_at(Timestamp::now())
    }

    /// Run every compaction tier as if the time were `now`
    pub fn compact_at(&mut self, now: Timestamp) -> Result<CompactionReport> {
        let engine = CompactionEngine::new(self.tiers.clone());
        engine.run(self, now)
    }

    /// Permanently delete history older than the keep horizon.
    ///
    /// Removal hits memory and the backend immediately; nothing is left pending.
    pub fn vacuum(&mut self, keep: Keep) -> Result<RetentionReport> {
        let started = Utc::now();
        let cutoff = match keep {
            Keep::Until(ts) => Some(ts),
            Keep::Hours(hours) if hours < 0 => {
                return Err(StorageError::InvalidParameters(format!(
                    "keep hours must not be negative, got {}",
                    hours
                )));
            }
            Keep::Hours(hours) => self.max_timestamp()?.map(|max| max - Duration::hours(hours)),
        };

        let Some(cutoff) = cutoff else {
            return Ok(RetentionReport {
                namespace: self.namespace.clone(),
                cutoff: None,
                records_deleted: 0,
                executed_at: started,
                duration_ms: 0,
            });
        };

        let mut removed: BTreeSet<Timestamp> = BTreeSet::new();
        let doomed: Vec<Timestamp> = self.records.range(..cutoff).map(|(ts, _)| *ts).collect();
        for ts in doomed {
            self.records.remove(&ts);
            self.dirty.remove(&ts);
            self.new.remove(&ts);
            removed.insert(ts);
        }
        // stored tombstones below the cutoff go with the range delete
        self.deleted.retain(|ts| *ts >= cutoff);

        if let Some(backend) = self.backend.clone() {
            let keys: Vec<String> = backend
                .range(&self.namespace, &KeyRange::between(Timestamp::UNBOUND_START, cutoff))?
                .into_iter()
                .map(|(key, _)| key)
                .collect();
            for chunk in keys.chunks(self.settings.batch_size.max(1)) {
                backend.delete_batch(&self.namespace, chunk)?;
            }
            removed.extend(keys.iter().filter_map(|key| Timestamp::from_key(key).ok()));
        }

        let finished = Utc::now();
        info!(
            "Vacuumed '{}': {} records older than {} deleted",
            self.namespace,
            removed.len(),
            cutoff
        );

        Ok(RetentionReport {
            namespace: self.namespace.clone(),
            cutoff: Some(cutoff),
            records_deleted: removed.len(),
            executed_at: finished,
            duration_ms: (finished - started).num_milliseconds(),
        })
    }

    /// Newest record in the namespace, including unsaved ones
    pub fn max_timestamp(&mut self) -> Result<Option<Timestamp>> {
        let in_memory = self.records.keys().next_back().copied();
        let stored = match self.backend.clone() {
            Some(backend) => {
                let mut candidate = backend.last(&self.namespace)?;
                let mut found = None;
                while let Some((key, _)) = candidate {
                    match Timestamp::from_key(&key) {
                        Ok(ts) if !self.deleted.contains(&ts) => {
                            found = Some(ts);
                            break;
                        }
                        _ => candidate = backend.neighbor_before(&self.namespace, &key)?,
                    }
                }
                found
            }
            None => None,
        };
        Ok(in_memory.max(stored))
    }

    /// Oldest record in the namespace, including unsaved ones
    pub fn min_timestamp(&mut self) -> Result<Option<Timestamp>> {
        self.first_at_or_after(Timestamp::UNBOUND_START)
    }

    /// Oldest record at or after `from`, consulting the backend without loading it
    pub fn first_at_or_after(&mut self, from: Timestamp) -> Result<Option<Timestamp>> {
        let in_memory = self.records.range(from..).next().map(|(ts, _)| *ts);
        let stored = match self.backend.clone() {
            Some(backend) => {
                let mut candidate = match from.to_key() {
                    Some(key) => backend.neighbor_at_or_after(&self.namespace, &key)?,
                    None if from == Timestamp::UNBOUND_START => backend.first(&self.namespace)?,
                    None => None,
                };
                let mut found = None;
                while let Some((key, _)) = candidate {
                    let parsed = Timestamp::from_key(&key);
                    if let Ok(ts) = parsed {
                        if !self.deleted.contains(&ts) {
                            found = Some(ts);
                            break;
                        }
                    }
                    // step past this key; keys are whole seconds
                    let next = parsed
                        .ok()
                        .and_then(|ts| (ts + one_second()).to_key())
                        .unwrap_or_else(|| format!("{}\u{0}", key));
                    candidate = backend.neighbor_at_or_after(&self.namespace, &next)?;
                }
                found
            }
            None => None,
        };
        Ok(match (in_memory, stored) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        })
    }

    pub fn stats(&self) -> Result<StorageStats> {
        let records_stored = match &self.backend {
            Some(backend) => Some(backend.count(&self.namespace)?),
            None => None,
        };
        Ok(StorageStats {
            namespace: self.namespace.clone(),
            backend: self.backend_kind(),
            records_in_memory: self.records.len(),
            records_stored,
            pending_writes: self.dirty.len() + self.new.len(),
            pending_deletes: self.deleted.len(),
            load_phase: self.phase,
        })
    }

    /// Move a tier cursor forward and persist the metadata
    pub(crate) fn advance_cursor(&mut self, tier: &CompactionTier, to: Timestamp) -> Result<()> {
        let mut metadata = self.metadata.clone();
        metadata.advance_cursor(tier, to);
        if let Some(backend) = &self.backend {
            let bytes = serde_json::to_vec(&metadata)?;
            backend.save_metadata(&self.namespace, &bytes)?;
        }
        self.metadata = metadata;
        Ok(())
    }

    /// Swap `originals` for `replacements` in memory; persisted by the next save
    pub(crate) fn replace(&mut self, originals: &[Timestamp], replacements: Vec<T>) -> Result<()> {
        for ts in originals {
            if self.records.contains_key(ts) {
                self.remove_in_memory(*ts);
            }
        }
        for record in replacements {
            self.insert(record)?;
        }
        Ok(())
    }

    /// Cloned records in `[start, end)`
    pub(crate) fn snapshot(&mut self, start: Timestamp, end: Timestamp) -> Result<Vec<T>> {
        Ok(self.range(start, end)?.into_iter().cloned().collect())
    }

    fn nearest(&self, target: Timestamp, lo: Timestamp, hi: Timestamp) -> Option<Timestamp> {
        if target == Timestamp::UNBOUND_START {
            return self.records.range(lo..=hi).next().map(|(ts, _)| *ts);
        }
        if target == Timestamp::UNBOUND_END {
            return self.records.range(lo..=hi).next_back().map(|(ts, _)| *ts);
        }

        let before = self
            .records
            .range(..=target)
            .next_back()
            .map(|(ts, _)| *ts)
            .filter(|ts| *ts >= lo);
        let after = self
            .records
            .range(target..)
            .next()
            .map(|(ts, _)| *ts)
            .filter(|ts| *ts <= hi);

        match (before, after) {
            (Some(b), Some(a)) => {
                let db = target.duration_since(b).unwrap_or_else(Duration::zero);
                let da = a.duration_since(target).unwrap_or_else(Duration::zero);
                if da < db {
                    Some(a)
                } else {
                    Some(b)
                }
            }
            (b, a) => b.or(a),
        }
    }

    /// Make sure `[start, end)` is materialized, advancing the load state machine
    fn ensure_loaded(&mut self, start: Timestamp, end: Timestamp) -> Result<()> {
        let Some(backend) = self.backend.clone() else {
            return Ok(());
        };
        let wants_everything = start.is_unbounded() || end.is_unbounded();

        match self.phase {
            LoadPhase::Full => Ok(()),
            LoadPhase::None => {
                if wants_everything {
                    return self.load_full(backend.as_ref());
                }
                match self.settings.initial_load_window {
                    None => self.load_full(backend.as_ref()),
                    Some(window) => {
                        let now = Timestamp::now();
                        let lo = start.min(now - window);
                        let hi = end.max(now + window);
                        let range = self.load_bounded(backend.as_ref(), lo, hi)?;
                        debug!(
                            "Initial load of '{}': [{}, {}), {} records",
                            self.namespace,
                            range.start,
                            range.end,
                            self.records.len()
                        );
                        self.set_loaded(range);
                        Ok(())
                    }
                }
            }
            LoadPhase::Initial => {
                if wants_everything {
                    return self.load_full(backend.as_ref());
                }
                let Some(current) = self.loaded else {
                    return self.load_full(backend.as_ref());
                };
                if current.covers(start, end) {
                    return Ok(());
                }

                let mut grown = current;
                if start < current.start {
                    let left = self.load_bounded(backend.as_ref(), start, current.start)?;
                    grown.start = left.start;
                    debug!("Expanded '{}' left to {}", self.namespace, grown.start);
                }
                if end > current.end {
                    let right = self.load_bounded(backend.as_ref(), current.end, end)?;
                    grown.end = right.end;
                    debug!("Expanded '{}' right to {}", self.namespace, grown.end);
                }
                self.set_loaded(grown);
                Ok(())
            }
        }
    }

    fn set_loaded(&mut self, range: LoadedRange) {
        if range.is_everything() {
            self.phase = LoadPhase::Full;
        } else {
            self.phase = LoadPhase::Initial;
        }
        self.loaded = Some(range);
    }

    fn load_full(&mut self, backend: &dyn Backend) -> Result<()> {
        let entries = backend.range(&self.namespace, &KeyRange::all())?;
        let count = entries.len();
        self.merge(entries);
        self.phase = LoadPhase::Full;
        self.loaded = Some(LoadedRange::new(
            Timestamp::UNBOUND_START,
            Timestamp::UNBOUND_END,
        ));
        debug!("Full load of '{}': {} stored records", self.namespace, count);
        Ok(())
    }

    /// Load `[start, end)` plus the nearest stored record on either side.
    ///
    /// The returned range is what is now known: it reaches back to the left
    /// neighbor and forward past the right neighbor, or to the sentinel when
    /// no neighbor exists.
    fn load_bounded(
        &mut self,
        backend: &dyn Backend,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<LoadedRange> {
        let mut entries = Vec::new();

        let known_start = match start.to_key() {
            Some(key) => match backend.neighbor_before(&self.namespace, &key)? {
                Some(entry) => {
                    let ts = Timestamp::from_key(&entry.0).unwrap_or(start);
                    entries.push(entry);
                    ts
                }
                None => Timestamp::UNBOUND_START,
            },
            None => Timestamp::UNBOUND_START,
        };

        entries.extend(backend.range(&self.namespace, &KeyRange::between(start, end))?);

        let known_end = match end.to_key() {
            Some(key) => match backend.neighbor_at_or_after(&self.namespace, &key)? {
                Some(entry) => {
                    let ts = Timestamp::from_key(&entry.0).unwrap_or(end);
                    entries.push(entry);
                    (ts + one_second()).max(end)
                }
                None => Timestamp::UNBOUND_END,
            },
            None => Timestamp::UNBOUND_END,
        };

        self.merge(entries);
        Ok(LoadedRange::new(known_start.min(start), known_end))
    }

    /// Decode loaded entries into the index. In-memory state always wins and
    /// tombstoned timestamps are never resurrected.
    fn merge(&mut self, entries: Vec<Entry>) {
        for (key, bytes) in entries {
            let ts = match Timestamp::from_key(&key) {
                Ok(ts) => ts,
                Err(e) => {
                    self.report_corrupt(key, e.to_string());
                    continue;
                }
            };
            if self.deleted.contains(&ts) || self.records.contains_key(&ts) {
                continue;
            }
            match self.codec.decode::<T>(&key, &bytes) {
                Ok(mut record) => {
                    record.set_timestamp(ts);
                    self.records.insert(ts, record);
                }
                Err(e) => self.report_corrupt(key, e.to_string()),
            }
        }
    }

    fn report_corrupt(&mut self, key: String, reason: String) {
        if self.corrupt.iter().any(|c| c.key == key) {
            return;
        }
        warn!("Corrupt record '{}' in '{}': {}", key, self.namespace, reason);
        self.corrupt.push(CorruptRecord { key, reason });
    }
}

fn load_or_init_metadata(
    backend: &dyn Backend,
    namespace: &str,
    compression_level: u32,
) -> Result<NamespaceMetadata> {
    let existing = match backend.load_metadata(namespace)? {
        Some(bytes) => Some(serde_json::from_slice::<NamespaceMetadata>(&bytes).map_err(|e| {
            StorageError::DataCorruption {
                key: format!("{}/metadata", namespace),
                reason: e.to_string(),
            }
        })?),
        None => None,
    };

    let mut metadata = match existing {
        Some(metadata) => {
            if metadata.backend.is_some() && metadata.backend != Some(backend.kind()) {
                warn!(
                    "Namespace '{}' was created on {:?}, now opened on {}",
                    namespace,
                    metadata.backend,
                    backend.kind()
                );
            }
            if metadata.compression_level == compression_level {
                return Ok(metadata);
            }
            info!(
                "Namespace '{}' compression level {} -> {}",
                namespace, metadata.compression_level, compression_level
            );
            metadata
        }
        None => {
            debug!("Initializing metadata for namespace '{}'", namespace);
            NamespaceMetadata::new(Some(backend.kind()), compression_level)
        }
    };

    metadata.compression_level = compression_level;
    backend.save_metadata(namespace, &serde_json::to_vec(&metadata)?)?;
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteBackend;
    use crate::types::FieldRecord;

    struct Meter;

    impl NamespaceProvider for Meter {
        fn namespace_id(&self) -> String {
            "meter".to_string()
        }
    }

    fn ts(text: &str) -> Timestamp {
        Timestamp::parse(text).unwrap()
    }

    fn reading(at: &str, wh: f64) -> FieldRecord {
        FieldRecord::new(ts(at)).with_field("wh", wh)
    }

    fn sqlite_store(settings: StoreSettings) -> (tempfile::TempDir, Arc<dyn Backend>, RecordStore<FieldRecord>) {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn Backend> =
            Arc::new(SqliteBackend::open(&dir.path().join("db.sqlite3")).unwrap());
        let store = RecordStore::open(&Meter, Some(backend.clone()), settings).unwrap();
        (dir, backend, store)
    }

    #[test]
    fn test_duplicate_insert_leaves_store_unchanged() {
        let mut store = RecordStore::in_memory(&Meter).unwrap();
        store.insert(reading("2024-06-01T12:00:00Z", 1.0)).unwrap();

        let err = store.insert(reading("2024-06-01T12:00:00Z", 2.0)).unwrap_err();
        assert!(matches!(err, StorageError::DuplicateRecord(_)));

        let kept = store.get(ts("2024-06-01T12:00:00Z"), Window::Exact).unwrap().unwrap();
        assert_eq!(kept.number("wh"), Some(1.0));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_windows() {
        let mut store = RecordStore::in_memory(&Meter).unwrap();
        store.insert(reading("2024-06-01T12:00:00Z", 1.0)).unwrap();
        store.insert(reading("2024-06-01T13:00:00Z", 2.0)).unwrap();

        let target = ts("2024-06-01T12:40:00Z");
        assert!(store.get(target, Window::Exact).unwrap().is_none());

        let nearest = store.get(target, Window::Unbounded).unwrap().unwrap();
        assert_eq!(nearest.number("wh"), Some(2.0));

        assert!(store
            .get(target, Window::Span(Duration::minutes(10)))
            .unwrap()
            .is_none());
        let within = store
            .get(target, Window::Span(Duration::minutes(45)))
            .unwrap()
            .unwrap();
        assert_eq!(within.number("wh"), Some(2.0));

        // equidistant resolves to the earlier record
        let tie = store
            .get(ts("2024-06-01T12:30:00Z"), Window::Unbounded)
            .unwrap()
            .unwrap();
        assert_eq!(tie.number("wh"), Some(1.0));
    }

    #[test]
    fn test_delete_of_unsaved_insert_needs_no_io() {
        let (_dir, backend, mut store) = sqlite_store(StoreSettings::default());
        store.insert(reading("2024-06-01T12:00:00Z", 1.0)).unwrap();
        assert_eq!(store.delete(ts("2024-06-01T00:00:00Z"), ts("2024-06-02T00:00:00Z")).unwrap(), 1);
        assert_eq!(store.pending_changes(), 0);

        assert_eq!(store.save().unwrap(), SaveSummary::default());
        assert_eq!(backend.count("meter").unwrap(), 0);
    }

    #[test]
    fn test_save_writes_then_deletes() {
        let (_dir, backend, mut store) = sqlite_store(StoreSettings::default());
        store.insert(reading("2024-06-01T12:00:00Z", 1.0)).unwrap();
        store.insert(reading("2024-06-01T13:00:00Z", 2.0)).unwrap();
        let summary = store.save().unwrap();
        assert_eq!(summary.written, 2);
        assert_eq!(backend.count("meter").unwrap(), 2);

        store.delete(ts("2024-06-01T12:00:00Z"), ts("2024-06-01T12:00:01Z")).unwrap();
        store
            .get_mut(ts("2024-06-01T13:00:00Z"))
            .unwrap()
            .unwrap()
            .set_number("wh", 5.0);
        assert_eq!(store.pending_changes(), 2);

        let summary = store.save().unwrap();
        assert_eq!(summary, SaveSummary { written: 1, deleted: 1 });
        assert_eq!(backend.count("meter").unwrap(), 1);
        assert_eq!(store.pending_changes(), 0);
    }

    #[test]
    fn test_reinsert_after_delete_overwrites_stored_copy() {
        let (_dir, backend, mut store) = sqlite_store(StoreSettings::default());
        store.insert(reading("2024-06-01T12:00:00Z", 1.0)).unwrap();
        store.save().unwrap();

        store.delete(ts("2024-06-01T12:00:00Z"), ts("2024-06-01T12:00:01Z")).unwrap();
        store.insert(reading("2024-06-01T12:00:00Z", 9.0)).unwrap();
        store.save().unwrap();

        let bytes = backend.get("meter", "20240601T120000Z").unwrap().unwrap();
        let stored: FieldRecord = Codec::default().decode("k", &bytes).unwrap();
        assert_eq!(stored.number("wh"), Some(9.0));

        // and a delete of that overwrite must still reach the backend
        store.delete(ts("2024-06-01T12:00:00Z"), ts("2024-06-01T12:00:01Z")).unwrap();
        store.save().unwrap();
        assert_eq!(backend.count("meter").unwrap(), 0);
    }

    #[test]
    fn test_non_finite_numbers_rejected() {
        let (_dir, backend, mut store) = sqlite_store(StoreSettings::default());
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let record = reading("2024-06-01T12:00:00Z", 1.0).with_field("wh", bad);
            assert!(matches!(store.insert(record.clone()), Err(StorageError::InvalidParameters(_))));
            assert!(matches!(store.upsert(record), Err(StorageError::InvalidParameters(_))));
        }
        assert!(store.is_empty());
        assert_eq!(store.pending_changes(), 0);

        store.insert(reading("2024-06-01T12:00:00Z", 1.0)).unwrap();
        store.insert(reading("2024-06-01T13:00:00Z", 2.0)).unwrap();
        store
            .get_mut(ts("2024-06-01T13:00:00Z"))
            .unwrap()
            .unwrap()
            .set_number("wh", f64::NAN);

        // nothing reaches the backend while one record cannot be stored
        assert!(matches!(store.save(), Err(StorageError::InvalidParameters(_))));
        assert_eq!(backend.count("meter").unwrap(), 0);
        assert_eq!(store.pending_changes(), 2);

        store
            .get_mut(ts("2024-06-01T13:00:00Z"))
            .unwrap()
            .unwrap()
            .set_number("wh", 2.5);
        assert_eq!(store.save().unwrap().written, 2);

        let mut reopened: RecordStore<FieldRecord> =
            RecordStore::open(&Meter, Some(backend), StoreSettings::default()).unwrap();
        let back = reopened.get(ts("2024-06-01T13:00:00Z"), Window::Exact).unwrap().unwrap();
        assert_eq!(back.number("wh"), Some(2.5));
        assert!(reopened.take_corrupt().is_empty());
    }

    #[test]
    fn test_lazy_state_machine() {
        let (_dir, backend, mut writer) = sqlite_store(StoreSettings::default());
        let now = Timestamp::now().floor(Duration::hours(1));
        for day in 0..30 {
            let at = now - Duration::days(day);
            writer.insert(FieldRecord::new(at).with_field("wh", day as f64)).unwrap();
        }
        writer.save().unwrap();

        let settings = StoreSettings {
            initial_load_window: Some(Duration::hours(48)),
            ..StoreSettings::default()
        };
        let mut store: RecordStore<FieldRecord> =
            RecordStore::open(&Meter, Some(backend), settings).unwrap();
        assert_eq!(store.load_phase(), LoadPhase::None);

        store.get(now, Window::Exact).unwrap();
        assert_eq!(store.load_phase(), LoadPhase::Initial);
        // two days either side plus the boundary neighbors
        assert!(store.len() <= 5);
        let initial = store.loaded_range().unwrap();

        store.get(now - Duration::days(10), Window::Exact).unwrap();
        assert_eq!(store.load_phase(), LoadPhase::Initial);
        assert!(store.loaded_range().unwrap().start < initial.start);

        store.get(now, Window::Unbounded).unwrap();
        assert_eq!(store.load_phase(), LoadPhase::Full);
        assert_eq!(store.len(), 30);
    }

    #[test]
    fn test_vacuum_is_immediate() {
        let (_dir, backend, mut store) = sqlite_store(StoreSettings::default());
        let end = ts("2024-06-30T00:00:00Z");
        for hour in 0..(24 * 10) {
            store
                .insert(FieldRecord::new(end - Duration::hours(hour)).with_field("wh", 1.0))
                .unwrap();
        }
        store.save().unwrap();

        let report = store.vacuum(Keep::Hours(24)).unwrap();
        assert_eq!(report.cutoff, Some(end - Duration::hours(24)));
        assert_eq!(report.records_deleted, 24 * 10 - 25);
        assert_eq!(backend.count("meter").unwrap(), 25);
        assert_eq!(store.pending_changes(), 0);
        assert_eq!(store.min_timestamp().unwrap(), Some(end - Duration::hours(24)));
    }

    #[test]
    fn test_negative_keep_rejected() {
        let mut store: RecordStore<FieldRecord> = RecordStore::in_memory(&Meter).unwrap();
        assert!(matches!(
            store.vacuum(Keep::Hours(-1)),
            Err(StorageError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_corrupt_record_does_not_abort_load() {
        let (_dir, backend, _store) = sqlite_store(StoreSettings::default());
        let good = Codec::default().encode(&reading("2024-06-01T12:00:00Z", 1.0)).unwrap();
        backend.put("meter", "20240601T120000Z", &good).unwrap();
        backend.put("meter", "20240601T130000Z", b"\x1f\x8bgarbage").unwrap();

        let mut store: RecordStore<FieldRecord> =
            RecordStore::open(&Meter, Some(backend), StoreSettings::default()).unwrap();
        let all = store
            .range(Timestamp::UNBOUND_START, Timestamp::UNBOUND_END)
            .unwrap();
        assert_eq!(all.len(), 1);

        let corrupt = store.take_corrupt();
        assert_eq!(corrupt.len(), 1);
        assert_eq!(corrupt[0].key, "20240601T130000Z");
    }

    #[test]
    fn test_metadata_initialized_on_open() {
        let (_dir, backend, store) = sqlite_store(StoreSettings {
            compression_level: 6,
            ..StoreSettings::default()
        });
        assert_eq!(store.metadata().compression_level, 6);
        assert_eq!(store.metadata().backend, Some(BackendKind::Sqlite));

        let bytes = backend.load_metadata("meter").unwrap().unwrap();
        let stored: NamespaceMetadata = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(stored.compression_level, 6);
    }
}
