//! Versioned artifact store for trained models.
//!
//! Snapshots are immutable objects keyed by `{family}/{timestamp}`; each
//! family has one mutable `latest` pointer that is only ever moved onto a
//! fully written snapshot.

pub mod fs;
pub mod results;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::domain::{LatestPointer, ModelSnapshot, SnapshotKey, TrainingMetrics};

pub use fs::FsArtifactStore;
pub use results::ResultStore;

/// Errors raised by the artifact store contract
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage write failed for {path}: {message}")]
    StorageWrite { path: String, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Object already exists (immutable): {0}")]
    AlreadyExists(String),

    #[error("Object {path} is corrupt: {message}")]
    Corrupt { path: String, message: String },

    #[error("Invalid family name: {0:?}")]
    InvalidFamily(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl StoreError {
    pub(crate) fn write(path: impl std::fmt::Display, message: impl std::fmt::Display) -> Self {
        Self::StorageWrite {
            path: path.to_string(),
            message: message.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Contract of the model artifact store
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Write an immutable snapshot under an explicit key.
    ///
    /// Fails with `AlreadyExists` if the key is taken and with
    /// `StorageWrite` if the write does not complete; in both cases nothing
    /// becomes visible under the key.
    async fn put_snapshot_at(
        &self,
        family: &str,
        key: SnapshotKey,
        blob: &[u8],
        metrics: &TrainingMetrics,
    ) -> Result<SnapshotKey, StoreError>;

    /// Write an immutable snapshot keyed by the current second
    async fn put_snapshot(
        &self,
        family: &str,
        blob: &[u8],
        metrics: &TrainingMetrics,
    ) -> Result<SnapshotKey, StoreError> {
        self.put_snapshot_at(family, SnapshotKey::now(), blob, metrics)
            .await
    }

    /// Atomically repoint `{family}/latest` at an existing snapshot
    async fn update_latest(&self, family: &str, key: SnapshotKey)
        -> Result<LatestPointer, StoreError>;

    /// Read the latest pointer without loading the snapshot
    async fn latest_pointer(&self, family: &str) -> Result<LatestPointer, StoreError>;

    /// Load the snapshot the latest pointer references
    async fn get_latest(&self, family: &str) -> Result<ModelSnapshot, StoreError>;

    async fn get_snapshot(&self, family: &str, key: SnapshotKey)
        -> Result<ModelSnapshot, StoreError>;

    /// All snapshot keys of a family, oldest first
    async fn list_snapshots(&self, family: &str) -> Result<Vec<SnapshotKey>, StoreError>;
}

/// Training write path: store the snapshot, then move `latest` onto it.
///
/// The pointer is left untouched when the snapshot write fails.
pub async fn publish_snapshot(
    store: &dyn ArtifactStore,
    family: &str,
    blob: &[u8],
    metrics: &TrainingMetrics,
) -> Result<SnapshotKey, StoreError> {
    let key = store.put_snapshot(family, blob, metrics).await?;
    store.update_latest(family, key).await?;

    info!(%family, %key, accuracy = metrics.accuracy, "Published snapshot");
    Ok(key)
}

/// Family names become object-key prefixes
pub(crate) fn validate_family(family: &str) -> Result<(), StoreError> {
    let reserved = family.is_empty()
        || family == "."
        || family == ".."
        || family == fs::LATEST_DIR
        || family.starts_with('.')
        || family.contains(['/', '\\']);

    if reserved {
        return Err(StoreError::InvalidFamily(family.to_string()));
    }
    Ok(())
}
