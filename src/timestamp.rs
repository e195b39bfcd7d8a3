use crate::error::{Result, StorageError};
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

/// Sortable key layout, UTC, second precision
pub const KEY_FORMAT: &str = "%Y%m%dT%H%M%S";

// 0000-01-01T00:00:00Z and 9999-12-31T23:59:59Z, the span a four-digit year keeps sortable
const MIN_SECONDS: i64 = -62_167_219_200;
const MAX_SECONDS: i64 = 253_402_300_799;

const UNBOUND_START_NAME: &str = "UNBOUND_START";
const UNBOUND_END_NAME: &str = "UNBOUND_END";

/// Variant order is the sort order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Point {
    Start,
    At(i64),
    End,
}

/// UTC time key with unbounded sentinels.
///
/// Real timestamps hold whole seconds since the Unix epoch. `UNBOUND_START`
/// sorts before and `UNBOUND_END` after every real timestamp, so open ranges
/// need no optional bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(Point);

impl Timestamp {
    pub const UNBOUND_START: Timestamp = Timestamp(Point::Start);
    pub const UNBOUND_END: Timestamp = Timestamp(Point::End);

    /// Build from any zoned instant, normalizing to UTC and truncating to seconds
    pub fn from_instant<Tz: TimeZone>(instant: DateTime<Tz>) -> Result<Self> {
        Self::from_unix(instant.timestamp())
    }

    /// Build from seconds since the Unix epoch
    pub fn from_unix(seconds: i64) -> Result<Self> {
        if !(MIN_SECONDS..=MAX_SECONDS).contains(&seconds) {
            return Err(StorageError::InvalidTimestamp(format!(
                "{} seconds is outside the sortable range",
                seconds
            )));
        }
        Ok(Self(Point::At(seconds)))
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        Self(Point::At(Utc::now().timestamp()))
    }

    /// Wall-clock instant, `None` for the sentinels
    pub fn to_instant(&self) -> Option<DateTime<Utc>> {
        match self.0 {
            Point::At(seconds) => Utc.timestamp_opt(seconds, 0).single(),
            _ => None,
        }
    }

    pub fn unix_seconds(&self) -> Option<i64> {
        match self.0 {
            Point::At(seconds) => Some(seconds),
            _ => None,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        !matches!(self.0, Point::At(_))
    }

    /// Backend key (`20241027T123456Z`), `None` for the sentinels
    pub fn to_key(&self) -> Option<String> {
        self.to_instant()
            .map(|instant| format!("{}Z", instant.format(KEY_FORMAT)))
    }

    /// Parse a backend key. The trailing `Z` is optional because keys are UTC by definition.
    pub fn from_key(key: &str) -> Result<Self> {
        let body = key.strip_suffix('Z').unwrap_or(key);
        if body.len() != 15 {
            return Err(StorageError::InvalidTimestamp(format!(
                "malformed key '{}'",
                key
            )));
        }
        let naive = NaiveDateTime::parse_from_str(body, KEY_FORMAT)
            .map_err(|e| StorageError::InvalidTimestamp(format!("key '{}': {}", key, e)))?;
        Self::from_unix(naive.and_utc().timestamp())
    }

    /// Parse user input. Accepts RFC 3339 with an offset or the key form with
    /// its `Z`; anything without a zone designator is rejected.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        match text {
            UNBOUND_START_NAME => return Ok(Self::UNBOUND_START),
            UNBOUND_END_NAME => return Ok(Self::UNBOUND_END),
            _ => {}
        }

        if text.len() == 16 && text.ends_with('Z') && text.as_bytes()[8] == b'T' {
            return Self::from_key(text);
        }

        if let Ok(instant) = DateTime::parse_from_rfc3339(text) {
            return Self::from_instant(instant);
        }

        let naive = NaiveDateTime::parse_from_str(text, KEY_FORMAT).is_ok()
            || NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S").is_ok()
            || NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").is_ok();
        if naive {
            return Err(StorageError::InvalidTimestamp(format!(
                "'{}' has no timezone",
                text
            )));
        }

        Err(StorageError::InvalidTimestamp(format!(
            "unrecognized time '{}'",
            text
        )))
    }

    /// Round down to a multiple of `resolution` counted from the epoch
    pub fn floor(&self, resolution: Duration) -> Self {
        let step = resolution.num_seconds();
        match self.0 {
            Point::At(seconds) if step > 0 => {
                let floored = seconds.div_euclid(step) * step;
                Self(Point::At(floored.max(MIN_SECONDS)))
            }
            _ => *self,
        }
    }

    /// Signed distance `self - earlier`, `None` if either side is a sentinel
    pub fn duration_since(&self, earlier: Timestamp) -> Option<Duration> {
        match (self.0, earlier.0) {
            (Point::At(a), Point::At(b)) => Some(Duration::seconds(a - b)),
            _ => None,
        }
    }

    fn shift(&self, seconds: i64) -> Self {
        match self.0 {
            Point::At(current) => {
                let shifted = current.saturating_add(seconds);
                if shifted < MIN_SECONDS {
                    Self::UNBOUND_START
                } else if shifted > MAX_SECONDS {
                    Self::UNBOUND_END
                } else {
                    Self(Point::At(shifted))
                }
            }
            _ => *self,
        }
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        self.shift(rhs.num_seconds())
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Timestamp {
        self.shift(rhs.num_seconds().saturating_neg())
    }
}

impl TryFrom<DateTime<Utc>> for Timestamp {
    type Error = StorageError;

    fn try_from(instant: DateTime<Utc>) -> Result<Self> {
        Self::from_instant(instant)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Point::Start => write!(f, "{}", UNBOUND_START_NAME),
            Point::End => write!(f, "{}", UNBOUND_END_NAME),
            Point::At(_) => write!(f, "{}", self.to_key().unwrap_or_default()),
        }
    }
}

impl FromStr for Timestamp {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        match text.as_str() {
            UNBOUND_START_NAME => Ok(Self::UNBOUND_START),
            UNBOUND_END_NAME => Ok(Self::UNBOUND_END),
            _ => Self::from_key(&text).map_err(serde::de::Error::custom),
        }
    }
}
