//! Record wire format.
//!
//! Records are stored as JSON. With a non-zero compression level the JSON is
//! gzip-compressed; decoding looks only at the gzip magic to decide whether to
//! inflate, so a namespace may hold a mix of both forms.

use crate::error::{Result, StorageError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

/// Leading bytes of every gzip stream
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Highest accepted compression level
pub const MAX_COMPRESSION_LEVEL: u32 = 9;

/// Encoder/decoder bound to one namespace's compression level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    compression_level: u32,
}

impl Codec {
    /// Create a codec. Levels above 9 are rejected.
    pub fn new(compression_level: u32) -> Result<Self> {
        if compression_level > MAX_COMPRESSION_LEVEL {
            return Err(StorageError::ConfigError(format!(
                "compression_level must be 0-{}, got {}",
                MAX_COMPRESSION_LEVEL, compression_level
            )));
        }
        Ok(Self { compression_level })
    }

    pub fn compression_level(&self) -> u32 {
        self.compression_level
    }

    pub fn encode<T: Serialize>(&self, record: &T) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(record)?;
        if self.compression_level == 0 {
            return Ok(json);
        }

        let mut encoder = GzEncoder::new(
            Vec::with_capacity(json.len() / 2),
            Compression::new(self.compression_level),
        );
        encoder
            .write_all(&json)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| StorageError::SerializationError(e.to_string()))
    }

    /// Decode bytes stored under `key`. `key` only labels the error.
    pub fn decode<T: DeserializeOwned>(&self, key: &str, bytes: &[u8]) -> Result<T> {
        let corrupt = |reason: String| StorageError::DataCorruption {
            key: key.to_string(),
            reason,
        };

        if is_compressed(bytes) {
            let mut json = Vec::with_capacity(bytes.len() * 4);
            GzDecoder::new(bytes)
                .read_to_end(&mut json)
                .map_err(|e| corrupt(format!("decompression failed: {}", e)))?;
            serde_json::from_slice(&json).map_err(|e| corrupt(e.to_string()))
        } else {
            serde_json::from_slice(bytes).map_err(|e| corrupt(e.to_string()))
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self {
            compression_level: 0,
        }
    }
}

/// Whether `bytes` start with the gzip magic
pub fn is_compressed(bytes: &[u8]) -> bool {
    bytes.starts_with(&GZIP_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::Timestamp;
    use crate::types::{FieldRecord, FieldValue, TimeSeriesRecord};
    use proptest::prelude::*;

    fn sample() -> FieldRecord {
        FieldRecord::new(Timestamp::parse("2024-06-01T12:00:00Z").unwrap())
            .with_field("load_wh", 812.25)
            .with_field("price_ct", 31.7)
            .with_field("tariff", "dynamic")
    }

    #[test]
    fn test_uncompressed_is_plain_json() {
        let codec = Codec::new(0).unwrap();
        let bytes = codec.encode(&sample()).unwrap();
        assert_eq!(bytes[0], b'{');
        assert!(!is_compressed(&bytes));
    }

    #[test]
    fn test_compressed_has_magic() {
        let codec = Codec::new(6).unwrap();
        let bytes = codec.encode(&sample()).unwrap();
        assert!(is_compressed(&bytes));
    }

    #[test]
    fn test_mixed_levels_decode() {
        let plain = Codec::new(0).unwrap().encode(&sample()).unwrap();
        let packed = Codec::new(9).unwrap().encode(&sample()).unwrap();

        for codec in [Codec::new(0).unwrap(), Codec::new(9).unwrap()] {
            let a: FieldRecord = codec.decode("k", &plain).unwrap();
            let b: FieldRecord = codec.decode("k", &packed).unwrap();
            assert_eq!(a, sample());
            assert_eq!(b, sample());
        }
    }

    #[test]
    fn test_non_finite_number_does_not_decode() {
        let record = sample().with_field("load_wh", f64::NAN);
        assert!(matches!(
            record.validate(),
            Err(StorageError::InvalidParameters(_))
        ));

        let bytes = Codec::new(0).unwrap().encode(&record).unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("\"load_wh\":null"));
        assert!(matches!(
            Codec::default().decode::<FieldRecord>("k", &bytes),
            Err(StorageError::DataCorruption { .. })
        ));
    }

    #[test]
    fn test_rejects_level_above_nine() {
        assert!(matches!(Codec::new(10), Err(StorageError::ConfigError(_))));
    }

    #[test]
    fn test_corrupt_bytes() {
        let codec = Codec::new(3).unwrap();
        let mut bytes = codec.encode(&sample()).unwrap();
        bytes.truncate(bytes.len() / 2);

        match codec.decode::<FieldRecord>("20240601T120000Z", &bytes) {
            Err(StorageError::DataCorruption { key, .. }) => assert_eq!(key, "20240601T120000Z"),
            other => panic!("expected DataCorruption, got {:?}", other),
        }

        let garbage = b"not json at all";
        assert!(matches!(
            codec.decode::<FieldRecord>("x", garbage),
            Err(StorageError::DataCorruption { .. })
        ));
    }

    fn field_value() -> impl Strategy<Value = FieldValue> {
        prop_oneof![
            8 => (-1.0e12f64..1.0e12).prop_map(FieldValue::Number),
            8 => "[a-z]{1,12}".prop_map(FieldValue::Text),
            1 => prop_oneof![
                Just(f64::NAN),
                Just(f64::INFINITY),
                Just(f64::NEG_INFINITY)
            ]
            .prop_map(FieldValue::Number),
        ]
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            seconds in 0i64..4_000_000_000,
            fields in proptest::collection::btree_map("[a-z_]{1,10}", field_value(), 0..8),
            level in 0u32..=9,
        ) {
            let mut record = FieldRecord::new(Timestamp::from_unix(seconds).unwrap());
            record.fields = fields;
            record.fields.remove("timestamp");

            // a record is either refused up front or decodes back unchanged
            let finite = record
                .fields
                .values()
                .all(|v| !matches!(v, FieldValue::Number(n) if !n.is_finite()));
            prop_assert_eq!(record.validate().is_ok(), finite);
            prop_assume!(finite);

            let codec = Codec::new(level).unwrap();
            let bytes = codec.encode(&record).unwrap();
            let back: FieldRecord = codec.decode("k", &bytes).unwrap();
            prop_assert_eq!(back, record);
        }
    }
}
