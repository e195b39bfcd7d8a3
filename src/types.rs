use crate::backend::BackendKind;
use crate::error::{Result, StorageError};
use crate::timestamp::Timestamp;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Current layout of [`NamespaceMetadata`]
pub const SCHEMA_VERSION: u32 = 1;

/// A value stored in a namespace, keyed by exactly one timestamp.
///
/// Records must serialize to a JSON object; compaction averages the numeric
/// members of that object and rebuilds the record through `Deserialize`.
pub trait TimeSeriesRecord:
    Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static
{
    fn timestamp(&self) -> Timestamp;

    fn set_timestamp(&mut self, timestamp: Timestamp);

    /// Reject values that would not decode back to the same record.
    /// Called on insert and before every save.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Field value of a [`FieldRecord`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

/// Record with an open set of named fields, for namespaces without a typed record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRecord {
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl FieldRecord {
    /// Create an empty record at `timestamp`
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            fields: BTreeMap::new(),
        }
    }

    /// Add a field to the record
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Numeric field value, if present and numeric
    pub fn number(&self, name: &str) -> Option<f64> {
        match self.fields.get(name) {
            Some(FieldValue::Number(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn set_number(&mut self, name: impl Into<String>, value: f64) {
        self.fields.insert(name.into(), FieldValue::Number(value));
    }
}

impl TimeSeriesRecord for FieldRecord {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    fn set_timestamp(&mut self, timestamp: Timestamp) {
        self.timestamp = timestamp;
    }

    // JSON has no NaN or infinity; serde_json writes them as null
    fn validate(&self) -> Result<()> {
        for (name, value) in &self.fields {
            if let FieldValue::Number(v) = value {
                if !v.is_finite() {
                    return Err(StorageError::InvalidParameters(format!(
                        "field '{}' at {} is {}, only finite numbers can be stored",
                        name, self.timestamp, v
                    )));
                }
            }
        }
        Ok(())
    }
}

/// One compaction rule: records older than `age` are downsampled to `resolution`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionTier {
    pub age: Duration,
    pub resolution: Duration,
}

impl CompactionTier {
    pub fn new(age: Duration, resolution: Duration) -> Self {
        Self { age, resolution }
    }

    /// Stable name used to store the tier's cursor
    pub fn label(&self) -> String {
        format!("{}s@{}s", self.age.num_seconds(), self.resolution.num_seconds())
    }
}

/// Default policy: hourly after 14 days, quarter-hourly after 2 hours
pub fn default_compaction_tiers() -> Vec<CompactionTier> {
    vec![
        CompactionTier::new(Duration::days(14), Duration::hours(1)),
        CompactionTier::new(Duration::hours(2), Duration::minutes(15)),
    ]
}

/// Implemented by data providers to tell the store where and how their records live
pub trait NamespaceProvider {
    /// Name of the namespace holding the provider's records
    fn namespace_id(&self) -> String;

    /// Compaction policy, coarsest age first. Empty disables compaction.
    fn compaction_tiers(&self) -> Vec<CompactionTier> {
        default_compaction_tiers()
    }
}

/// Search window for [`RecordStore::get`](crate::store::RecordStore::get)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    /// Exact timestamp match only
    Exact,
    /// Nearest record anywhere in the namespace
    Unbounded,
    /// Nearest record within `[target - d, target + d]`
    Span(Duration),
}

/// How much history a vacuum keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keep {
    /// Keep this many hours before the newest record
    Hours(i64),
    /// Keep everything at or after this timestamp
    Until(Timestamp),
}

/// Lazy loading state of a record store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadPhase {
    None,
    Initial,
    Full,
}

impl std::fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadPhase::None => write!(f, "none"),
            LoadPhase::Initial => write!(f, "initial"),
            LoadPhase::Full => write!(f, "full"),
        }
    }
}

/// Half-open `[start, end)` span of the timeline materialized in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl LoadedRange {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Whether `[start, end)` lies inside this range
    pub fn covers(&self, start: Timestamp, end: Timestamp) -> bool {
        self.start <= start && end <= self.end
    }

    pub fn is_everything(&self) -> bool {
        self.start == Timestamp::UNBOUND_START && self.end == Timestamp::UNBOUND_END
    }
}

/// Namespace-level bookkeeping stored apart from the records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceMetadata {
    pub schema_version: u32,
    pub created_at: Timestamp,
    pub backend: Option<BackendKind>,
    pub compression_level: u32,
    #[serde(default)]
    pub compaction_cursors: BTreeMap<String, Timestamp>,
}

impl NamespaceMetadata {
    pub fn new(backend: Option<BackendKind>, compression_level: u32) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            created_at: Timestamp::now(),
            backend,
            compression_level,
            compaction_cursors: BTreeMap::new(),
        }
    }

    /// Last processed point of a tier, `UNBOUND_START` if it never ran
    pub fn cursor(&self, tier: &CompactionTier) -> Timestamp {
        self.compaction_cursors
            .get(&tier.label())
            .copied()
            .unwrap_or(Timestamp::UNBOUND_START)
    }

    /// Move a tier cursor forward. Never moves it back.
    pub fn advance_cursor(&mut self, tier: &CompactionTier, to: Timestamp) {
        let entry = self
            .compaction_cursors
            .entry(tier.label())
            .or_insert(Timestamp::UNBOUND_START);
        if to > *entry {
            *entry = to;
        }
    }
}

/// A stored record that failed to decode during a load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptRecord {
    pub key: String,
    pub reason: String,
}

/// Outcome of one tier in a compaction run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierReport {
    pub tier: String,
    pub window_start: Option<Timestamp>,
    pub window_end: Timestamp,
    pub records_removed: usize,
    pub records_written: usize,
    pub skipped: Option<String>,
}

/// Compaction run report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionReport {
    pub namespace: String,
    pub tiers: Vec<TierReport>,
    pub executed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl CompactionReport {
    pub fn records_removed(&self) -> usize {
        self.tiers.iter().map(|t| t.records_removed).sum()
    }

    pub fn records_written(&self) -> usize {
        self.tiers.iter().map(|t| t.records_written).sum()
    }
}

/// Vacuum report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionReport {
    pub namespace: String,
    pub cutoff: Option<Timestamp>,
    pub records_deleted: usize,
    pub executed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

/// What one maintenance cycle did for one namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub namespace: String,
    pub compaction: Option<CompactionReport>,
    pub vacuum: Option<RetentionReport>,
    /// Set when a step failed; later steps of the cycle were skipped
    pub error: Option<String>,
}

/// Snapshot of a store's state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStats {
    pub namespace: String,
    pub backend: Option<BackendKind>,
    pub records_in_memory: usize,
    pub records_stored: Option<usize>,
    pub pending_writes: usize,
    pub pending_deletes: usize,
    pub load_phase: LoadPhase,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_record_builder() {
        let ts = Timestamp::parse("2024-06-01T12:00:00Z").unwrap();
        let record = FieldRecord::new(ts)
            .with_field("load_wh", 420.5)
            .with_field("source", "meter");

        assert_eq!(record.number("load_wh"), Some(420.5));
        assert_eq!(record.number("source"), None);
        assert_eq!(record.fields.len(), 2);
    }

    #[test]
    fn test_field_record_json_shape() {
        let ts = Timestamp::parse("2024-06-01T12:00:00Z").unwrap();
        let record = FieldRecord::new(ts).with_field("pv_wh", 12.0);
        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(value["timestamp"], "20240601T120000Z");
        assert_eq!(value["pv_wh"], 12.0);
    }

    #[test]
    fn test_cursor_is_monotonic() {
        let tier = CompactionTier::new(Duration::hours(2), Duration::minutes(15));
        let mut meta = NamespaceMetadata::new(None, 0);
        assert_eq!(meta.cursor(&tier), Timestamp::UNBOUND_START);

        let later = Timestamp::parse("2024-06-01T12:00:00Z").unwrap();
        let earlier = Timestamp::parse("2024-05-01T12:00:00Z").unwrap();
        meta.advance_cursor(&tier, later);
        meta.advance_cursor(&tier, earlier);
        assert_eq!(meta.cursor(&tier), later);
    }

    #[test]
    fn test_loaded_range_covers() {
        let a = Timestamp::parse("2024-06-01T00:00:00Z").unwrap();
        let b = Timestamp::parse("2024-06-02T00:00:00Z").unwrap();
        let range = LoadedRange::new(a, b);
        assert!(range.covers(a, b));
        assert!(!range.covers(Timestamp::UNBOUND_START, b));
        assert!(LoadedRange::new(Timestamp::UNBOUND_START, Timestamp::UNBOUND_END).is_everything());
    }
}
