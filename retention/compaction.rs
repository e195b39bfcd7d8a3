use crate::error::{Result, StorageError};
use crate::store::RecordStore;
use crate::timestamp::Timestamp;
use crate::types::{CompactionReport, CompactionTier, TierReport, TimeSeriesRecord};
use chrono::{Duration, Utc};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Downsamples old history tier by tier.
///
/// Each tier owns a cursor in the namespace metadata. A run only looks at
/// `[cursor, cutoff)` where `cutoff = floor(now - age, resolution)`, so
/// buckets are aligned to the epoch and a finished window is never revisited.
///
/// Merged buckets are persisted with [`RecordStore::save`], which writes every
/// pending change of the store, not only the compaction result. The cursor
/// moves only after that save succeeds.
pub struct CompactionEngine {
    tiers: Vec<CompactionTier>,
}

/// Result of bucketing one window
#[derive(Debug, Clone)]
pub struct Downsampled<T> {
    /// Timestamps of the records that were merged away
    pub replaced: Vec<Timestamp>,
    /// One synthetic record per merged bucket, stamped with the bucket start
    pub records: Vec<T>,
}

impl CompactionEngine {
    pub fn new(tiers: Vec<CompactionTier>) -> Self {
        Self { tiers }
    }

    pub fn tiers(&self) -> &[CompactionTier] {
        &self.tiers
    }

    /// Run every tier in order against `store`
    pub fn run<T: TimeSeriesRecord>(
        &self,
        store: &mut RecordStore<T>,
        now: Timestamp,
    ) -> Result<CompactionReport> {
        let started = Utc::now();
        let mut tiers = Vec::with_capacity(self.tiers.len());

        for tier in &self.tiers {
            tiers.push(self.compact_tier(store, tier, now)?);
        }

        let finished = Utc::now();
        let report = CompactionReport {
            namespace: store.namespace().to_string(),
            tiers,
            executed_at: finished,
            duration_ms: (finished - started).num_milliseconds(),
        };

        info!(
            "Compaction of '{}' complete: {} records merged into {} in {}ms",
            report.namespace,
            report.records_removed(),
            report.records_written(),
            report.duration_ms
        );

        Ok(report)
    }

    fn compact_tier<T: TimeSeriesRecord>(
        &self,
        store: &mut RecordStore<T>,
        tier: &CompactionTier,
        now: Timestamp,
    ) -> Result<TierReport> {
        if tier.resolution.num_seconds() <= 0 || tier.age < Duration::zero() {
            return Err(StorageError::InvalidParameters(format!(
                "invalid compaction tier {}",
                tier.label()
            )));
        }

        let cutoff = (now - tier.age).floor(tier.resolution);
        let cursor = store.metadata().cursor(tier);
        let mut report = TierReport {
            tier: tier.label(),
            window_start: None,
            window_end: cutoff,
            records_removed: 0,
            records_written: 0,
            skipped: None,
        };

        if cutoff.is_unbounded() {
            report.skipped = Some("cutoff outside the representable range".to_string());
            return Ok(report);
        }
        if cursor >= cutoff {
            report.skipped = Some(format!("already compacted up to {}", cursor));
            return Ok(report);
        }

        let start = if cursor.is_unbounded() {
            match store.first_at_or_after(cursor)? {
                Some(first) if first < cutoff => first.floor(tier.resolution),
                _ => {
                    store.advance_cursor(tier, cutoff)?;
                    report.skipped = Some("no records before cutoff".to_string());
                    return Ok(report);
                }
            }
        } else {
            cursor
        };
        report.window_start = Some(start);

        let records = store.snapshot(start, cutoff)?;
        let buckets = bucket_count(start, cutoff, tier.resolution);
        if records.len() as i64 <= buckets {
            debug!(
                "Tier {} of '{}': {} records for {} buckets, leaving window as is",
                report.tier,
                store.namespace(),
                records.len(),
                buckets
            );
            store.advance_cursor(tier, cutoff)?;
            report.skipped = Some(format!(
                "sparse window: {} records for {} buckets",
                records.len(),
                buckets
            ));
            return Ok(report);
        }

        let downsampled = downsample(&records, start, tier.resolution)?;
        report.records_removed = downsampled.replaced.len();
        report.records_written = downsampled.records.len();

        if !downsampled.replaced.is_empty() {
            store.replace(&downsampled.replaced, downsampled.records)?;
            store.save()?;
        }
        store.advance_cursor(tier, cutoff)?;

        debug!(
            "Tier {} of '{}': [{}, {}) {} -> {}",
            report.tier,
            store.namespace(),
            start,
            cutoff,
            report.records_removed,
            report.records_written
        );
        Ok(report)
    }
}

fn bucket_count(start: Timestamp, end: Timestamp, resolution: Duration) -> i64 {
    let span = end
        .duration_since(start)
        .map(|d| d.num_seconds())
        .unwrap_or(0)
        .max(0);
    let step = resolution.num_seconds().max(1);
    (span + step - 1) / step
}

struct Sample {
    timestamp: Timestamp,
    seconds: i64,
    fields: Map<String, Value>,
}

/// Merge every bucket of `resolution` holding two or more records into one
/// record at the bucket start.
///
/// Numeric fields become the time-weighted mean of the linear interpolant
/// through the window's samples, clipped to the bucket. Fields that were
/// integers in every merged record stay integers. Everything else is taken
/// from the bucket's first record. Buckets with a single record are left alone.
pub fn downsample<T: TimeSeriesRecord>(
    records: &[T],
    window_start: Timestamp,
    resolution: Duration,
) -> Result<Downsampled<T>> {
    let step = resolution.num_seconds();
    if step <= 0 {
        return Err(StorageError::InvalidParameters(format!(
            "resolution must be at least one second, got {}s",
            step
        )));
    }
    let origin = window_start.unix_seconds().ok_or_else(|| {
        StorageError::InvalidParameters("compaction window needs a real start".to_string())
    })?;

    let mut samples = Vec::with_capacity(records.len());
    for record in records {
        let timestamp = record.timestamp();
        let Some(seconds) = timestamp.unix_seconds() else {
            continue;
        };
        let fields = match serde_json::to_value(record)? {
            Value::Object(fields) => fields,
            other => {
                return Err(StorageError::SerializationError(format!(
                    "compaction needs records that serialize to objects, got {}",
                    other
                )))
            }
        };
        samples.push(Sample {
            timestamp,
            seconds,
            fields,
        });
    }

    let mut series: BTreeMap<String, Vec<(f64, f64)>> = BTreeMap::new();
    for sample in &samples {
        for (name, value) in &sample.fields {
            if let Some(v) = value.as_f64() {
                series
                    .entry(name.clone())
                    .or_default()
                    .push((sample.seconds as f64, v));
            }
        }
    }

    let mut buckets: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (index, sample) in samples.iter().enumerate() {
        let bucket = (sample.seconds - origin).div_euclid(step);
        buckets.entry(bucket).or_default().push(index);
    }

    let mut downsampled = Downsampled {
        replaced: Vec::new(),
        records: Vec::new(),
    };

    for (bucket, members) in buckets {
        if members.len() < 2 {
            continue;
        }
        let bucket_start = origin + bucket * step;
        let bucket_end = bucket_start + step;
        let mut fields = samples[members[0]].fields.clone();

        for (name, points) in &series {
            let values: Vec<&Value> = members
                .iter()
                .filter_map(|&i| samples[i].fields.get(name))
                .filter(|v| v.is_number())
                .collect();
            if values.is_empty() {
                continue;
            }

            let mean = time_weighted_mean(points, bucket_start as f64, bucket_end as f64)
                .unwrap_or_else(|| {
                    values.iter().filter_map(|v| v.as_f64()).sum::<f64>() / values.len() as f64
                });
            if !mean.is_finite() {
                return Err(StorageError::InvalidParameters(format!(
                    "field '{}' averages to {} in bucket {}",
                    name,
                    mean,
                    Timestamp::from_unix(bucket_start)?
                )));
            }
            let averaged = if values.iter().all(|v| v.is_i64() || v.is_u64()) {
                Value::from(mean.round() as i64)
            } else {
                Number::from_f64(mean).map_or(Value::Null, Value::Number)
            };
            fields.insert(name.clone(), averaged);
        }

        let mut record: T = serde_json::from_value(Value::Object(fields))?;
        record.set_timestamp(Timestamp::from_unix(bucket_start)?);

        downsampled
            .replaced
            .extend(members.iter().map(|&i| samples[i].timestamp));
        downsampled.records.push(record);
    }

    Ok(downsampled)
}

/// Mean of the piecewise-linear curve through `points` over the part of
/// `[lo, hi)` the samples span. `None` when that overlap is empty.
fn time_weighted_mean(points: &[(f64, f64)], lo: f64, hi: f64) -> Option<f64> {
    let first = points.first()?.0;
    let last = points.last()?.0;
    let lo = lo.max(first);
    let hi = hi.min(last);
    if hi <= lo {
        return None;
    }

    let begin = points.partition_point(|(t, _)| *t <= lo).saturating_sub(1);
    let mut area = 0.0;
    for pair in points[begin..].windows(2) {
        let (t0, v0) = pair[0];
        let (t1, v1) = pair[1];
        if t0 >= hi {
            break;
        }
        let a = t0.max(lo);
        let b = t1.min(hi);
        if b <= a {
            continue;
        }
        let at = |t: f64| v0 + (v1 - v0) * (t - t0) / (t1 - t0);
        area += (at(a) + at(b)) / 2.0 * (b - a);
    }

    Some(area / (hi - lo))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, BackendKind, MockBackend, SqliteBackend};
    use crate::store::StoreSettings;
    use crate::types::{FieldRecord, NamespaceProvider};
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    struct Pv;

    impl NamespaceProvider for Pv {
        fn namespace_id(&self) -> String {
            "pv".to_string()
        }
    }

    fn ts(text: &str) -> Timestamp {
        Timestamp::parse(text).unwrap()
    }

    fn minutes(start: Timestamp, count: i64) -> Vec<FieldRecord> {
        (0..count)
            .map(|i| {
                FieldRecord::new(start + Duration::minutes(i))
                    .with_field("wh", i as f64)
                    .with_field("unit", "Wh")
            })
            .collect()
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Counter {
        timestamp: Timestamp,
        pulses: i64,
        label: String,
    }

    impl TimeSeriesRecord for Counter {
        fn timestamp(&self) -> Timestamp {
            self.timestamp
        }

        fn set_timestamp(&mut self, timestamp: Timestamp) {
            self.timestamp = timestamp;
        }
    }

    #[test]
    fn test_hour_bucket_mean() {
        let start = ts("2024-06-01T00:00:00Z");
        let records = minutes(start, 120);
        let out = downsample(&records, start, Duration::hours(1)).unwrap();

        assert_eq!(out.records.len(), 2);
        assert_eq!(out.replaced.len(), 120);
        assert_eq!(out.records[0].timestamp, start);
        assert_eq!(out.records[1].timestamp, start + Duration::hours(1));

        // first bucket interpolates up to the next bucket's first sample
        assert!((out.records[0].number("wh").unwrap() - 30.0).abs() < 1e-9);
        // last bucket ends at its last sample
        assert!((out.records[1].number("wh").unwrap() - 89.5).abs() < 1e-9);
        assert_eq!(
            out.records[0].fields.get("unit"),
            Some(&crate::types::FieldValue::Text("Wh".to_string()))
        );
    }

    #[test]
    fn test_irregular_samples_are_time_weighted() {
        let start = ts("2024-06-01T00:00:00Z");
        let records = vec![
            FieldRecord::new(start).with_field("w", 0.0),
            FieldRecord::new(start + Duration::minutes(1)).with_field("w", 100.0),
            FieldRecord::new(start + Duration::minutes(59)).with_field("w", 100.0),
        ];
        let out = downsample(&records, start, Duration::hours(1)).unwrap();
        let w = out.records[0].number("w").unwrap();

        // plain mean would be 66.7
        let expected = (50.0 + 58.0 * 100.0) / 59.0;
        assert!((w - expected).abs() < 1e-9);
    }

    #[test]
    fn test_single_record_buckets_untouched() {
        let start = ts("2024-06-01T00:00:00Z");
        let records: Vec<FieldRecord> = (0..5)
            .map(|h| FieldRecord::new(start + Duration::hours(h)).with_field("wh", 1.0))
            .collect();
        let out = downsample(&records, start, Duration::hours(1)).unwrap();
        assert!(out.records.is_empty());
        assert!(out.replaced.is_empty());
    }

    #[test]
    fn test_integer_fields_stay_integer() {
        let start = ts("2024-06-01T00:00:00Z");
        let records: Vec<Counter> = (0..6)
            .map(|i| Counter {
                timestamp: start + Duration::minutes(i * 5),
                pulses: [10, 11, 11, 12, 12, 13][i as usize],
                label: format!("c{}", i),
            })
            .collect();

        let out = downsample(&records, start, Duration::minutes(15)).unwrap();
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.records[0].label, "c0");
        assert_eq!(out.records[0].pulses, 11);
        assert_eq!(out.records[1].label, "c3");
        assert_eq!(out.records[1].pulses, 12);
        assert_eq!(out.records[1].timestamp, start + Duration::minutes(15));
    }

    #[test]
    fn test_compaction_save_flushes_unrelated_changes() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn Backend> =
            Arc::new(SqliteBackend::open(&dir.path().join("db.sqlite3")).unwrap());
        let mut store = RecordStore::open(&Pv, Some(backend.clone()), StoreSettings::default())
            .unwrap();
        let now = ts("2024-06-20T12:00:00Z");
        for record in minutes(now - Duration::hours(6), 6 * 60) {
            store.insert(record).unwrap();
        }
        store.save().unwrap();

        store
            .insert(FieldRecord::new(now).with_field("wh", 7.0))
            .unwrap();
        let report = store.compact_at(now).unwrap();
        assert!(report.records_removed() > 0);

        assert_eq!(store.pending_changes(), 0);
        assert!(backend.get("pv", "20240620T120000Z").unwrap().is_some());
    }

    #[test]
    fn test_overflowing_mean_is_an_error() {
        let start = ts("2024-06-01T00:00:00Z");
        let records = vec![
            FieldRecord::new(start).with_field("wh", 1.0e308),
            FieldRecord::new(start + Duration::minutes(30)).with_field("wh", 1.7e308),
        ];
        assert!(matches!(
            downsample(&records, start, Duration::hours(1)),
            Err(StorageError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_rejects_zero_resolution() {
        let start = ts("2024-06-01T00:00:00Z");
        assert!(matches!(
            downsample(&minutes(start, 3), start, Duration::zero()),
            Err(StorageError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_second_run_is_a_no_op() {
        let mut store = RecordStore::in_memory(&Pv).unwrap();
        let now = ts("2024-06-20T12:00:00Z");
        for record in minutes(now - Duration::hours(6), 6 * 60) {
            store.insert(record).unwrap();
        }

        let first = store.compact_at(now).unwrap();
        assert!(first.records_removed() > 0);
        let count = store.len();

        let second = store.compact_at(now).unwrap();
        assert_eq!(second.records_removed(), 0);
        assert_eq!(store.len(), count);
        assert!(second.tiers.iter().all(|t| t.skipped.is_some()));
    }

    #[test]
    fn test_failed_save_keeps_cursor() {
        let mut backend = MockBackend::new();
        backend.expect_kind().return_const(BackendKind::Sqlite);
        backend.expect_open_namespace().returning(|_| Ok(()));
        backend.expect_load_metadata().returning(|_| Ok(None));
        // only the initial metadata write at open
        backend.expect_save_metadata().times(1).returning(|_, _| Ok(()));
        backend.expect_range().returning(|_, _| Ok(Vec::new()));
        backend.expect_first().returning(|_| Ok(None));
        backend
            .expect_neighbor_at_or_after()
            .returning(|_, _| Ok(None));
        backend
            .expect_put_batch()
            .returning(|_, _| Err(StorageError::Backend("disk full".to_string())));

        let tier = CompactionTier::new(Duration::hours(2), Duration::minutes(15));
        let mut store: RecordStore<FieldRecord> = RecordStore::open(
            &Pv,
            Some(Arc::new(backend) as Arc<dyn crate::backend::Backend>),
            StoreSettings::default(),
        )
        .unwrap();

        let now = ts("2024-06-20T12:00:00Z");
        for record in minutes(now - Duration::hours(4), 60) {
            store.insert(record).unwrap();
        }

        let engine = CompactionEngine::new(vec![tier]);
        assert!(engine.run(&mut store, now).is_err());
        assert_eq!(store.metadata().cursor(&tier), Timestamp::UNBOUND_START);
    }
}
