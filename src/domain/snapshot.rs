//! Model snapshots, the latest pointer, and inference results.
//!
//! Snapshots are immutable and keyed by their creation time at second
//! precision. The latest pointer is the only mutable record per family.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Object-key timestamp format (`05-17-2024 13-04-59`)
pub const KEY_FORMAT: &str = "%m-%d-%Y %H-%M-%S";

/// Version key of a snapshot: its creation time, truncated to seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotKey(DateTime<Utc>);

impl SnapshotKey {
    /// Key for the current second
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Key for an arbitrary instant (sub-second part is dropped)
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.with_nanosecond(0).unwrap_or(at))
    }

    /// The instant this key stands for
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(KEY_FORMAT))
    }
}

impl FromStr for SnapshotKey {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let naive = NaiveDateTime::parse_from_str(s, KEY_FORMAT)?;
        Ok(Self(Utc.from_utc_datetime(&naive)))
    }
}

impl Serialize for SnapshotKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SnapshotKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Metrics recorded alongside a trained model
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    /// Accuracy on the held-out split (0.0 - 1.0)
    pub accuracy: f64,
}

impl TrainingMetrics {
    pub fn new(accuracy: f64) -> Self {
        Self { accuracy }
    }
}

/// Metadata persisted next to a snapshot blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub family: String,
    pub key: SnapshotKey,
    pub created_at: DateTime<Utc>,
    pub metrics: TrainingMetrics,
    /// Hex SHA-256 of the blob
    pub sha256: String,
    pub size_bytes: u64,
}

/// One immutable, timestamped serialized model
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSnapshot {
    pub family: String,
    pub key: SnapshotKey,
    pub blob: Vec<u8>,
    pub metrics: TrainingMetrics,
}

impl ModelSnapshot {
    /// Object-store reference (`{family}/{key}`)
    pub fn reference(&self) -> String {
        format!("{}/{}", self.family, self.key)
    }
}

/// Mutable pointer to the production-current snapshot of a family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestPointer {
    pub family: String,
    pub target: SnapshotKey,
    pub updated_at: DateTime<Utc>,
}

/// One scoring pass over the held-out split
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub generated_at: SnapshotKey,
    pub predictions: Vec<String>,
    pub accuracy: f64,
    /// `{family}/{key}` of the snapshot that produced the predictions
    pub source_snapshot: String,
}
