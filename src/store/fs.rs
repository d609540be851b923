//! Filesystem-backed artifact store.
//!
//! Object layout under the bucket root:
//!
//! ```text
//! {family}/{MM-DD-YYYY HH-MM-SS}/{artifact_name}   immutable blob
//! {family}/{MM-DD-YYYY HH-MM-SS}/snapshot.json     immutable metadata
//! {family}/latest/pointer.json                     mutable pointer
//! {family}/latest/{artifact_name}                  copy of the latest blob
//! ```
//!
//! Snapshots are staged in a hidden directory and renamed into place, so a
//! partially written snapshot never becomes visible. The pointer is swapped
//! by rename under a per-family file lock.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{LatestPointer, ModelSnapshot, SnapshotKey, SnapshotMetadata, TrainingMetrics};

use super::{validate_family, ArtifactStore, StoreError};

/// Directory holding the mutable pointer
pub const LATEST_DIR: &str = "latest";

/// Default blob name, matching the serving image's expectation
pub const DEFAULT_ARTIFACT_NAME: &str = "finalized_model.sav";

const METADATA_FILE: &str = "snapshot.json";
const POINTER_FILE: &str = "pointer.json";
const LOCK_FILE: &str = ".latest.lock";
const STAGING_PREFIX: &str = ".staging-";

/// Artifact store rooted at a bucket directory
pub struct FsArtifactStore {
    root: PathBuf,
    artifact_name: String,
}

impl FsArtifactStore {
    /// Open a store rooted at `root` (the bucket directory)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_artifact_name(root, DEFAULT_ARTIFACT_NAME)
    }

    pub fn with_artifact_name(root: impl Into<PathBuf>, artifact_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            artifact_name: artifact_name.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_name(&self) -> &str {
        &self.artifact_name
    }

    fn family_dir(&self, family: &str) -> Result<PathBuf, StoreError> {
        validate_family(family)?;
        Ok(self.root.join(family))
    }

    fn latest_dir(&self, family: &str) -> Result<PathBuf, StoreError> {
        Ok(self.family_dir(family)?.join(LATEST_DIR))
    }

    /// Object path of a snapshot's blob
    pub fn snapshot_path(&self, family: &str, key: SnapshotKey) -> Result<PathBuf, StoreError> {
        Ok(self
            .family_dir(family)?
            .join(key.to_string())
            .join(&self.artifact_name))
    }

    async fn read_metadata(&self, family: &str, key: SnapshotKey) -> Result<SnapshotMetadata, StoreError> {
        let path = self.family_dir(family)?.join(key.to_string()).join(METADATA_FILE);

        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(format!("{}/{}", family, key)));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(serde_json::from_slice(&content)?)
    }

    async fn write_staged(
        &self,
        staging: &Path,
        blob: &[u8],
        metadata: &SnapshotMetadata,
    ) -> Result<(), StoreError> {
        fs::create_dir(staging)
            .await
            .map_err(|e| StoreError::write(staging.display(), e))?;

        let metadata_json = serde_json::to_vec_pretty(metadata)?;
        write_synced(&staging.join(&self.artifact_name), blob).await?;
        write_synced(&staging.join(METADATA_FILE), &metadata_json).await?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put_snapshot_at(
        &self,
        family: &str,
        key: SnapshotKey,
        blob: &[u8],
        metrics: &TrainingMetrics,
    ) -> Result<SnapshotKey, StoreError> {
        let family_dir = self.family_dir(family)?;
        let final_dir = family_dir.join(key.to_string());
        let object = format!("{}/{}", family, key);

        if fs::try_exists(&final_dir).await? {
            return Err(StoreError::AlreadyExists(object));
        }

        fs::create_dir_all(&family_dir)
            .await
            .map_err(|e| StoreError::write(family_dir.display(), e))?;

        let metadata = SnapshotMetadata {
            family: family.to_string(),
            key,
            created_at: Utc::now(),
            metrics: *metrics,
            sha256: digest(blob),
            size_bytes: blob.len() as u64,
        };

        let staging = family_dir.join(format!("{}{}", STAGING_PREFIX, Uuid::new_v4()));
        if let Err(e) = self.write_staged(&staging, blob, &metadata).await {
            discard(&staging).await;
            return Err(e);
        }

        // A non-empty target makes the rename fail, so a concurrent writer
        // that won the race is never overwritten.
        if let Err(e) = fs::rename(&staging, &final_dir).await {
            discard(&staging).await;
            if fs::try_exists(&final_dir).await.unwrap_or(false) {
                return Err(StoreError::AlreadyExists(object));
            }
            return Err(StoreError::write(final_dir.display(), e));
        }

        debug!(%family, %key, size = blob.len(), "Snapshot written");
        Ok(key)
    }

    async fn update_latest(
        &self,
        family: &str,
        key: SnapshotKey,
    ) -> Result<LatestPointer, StoreError> {
        let snapshot = match self.get_snapshot(family, key).await {
            Ok(snapshot) => snapshot,
            Err(StoreError::NotFound(object)) => {
                return Err(StoreError::write(
                    format!("{}/{}", family, LATEST_DIR),
                    format!("target snapshot {} does not exist", object),
                ));
            }
            Err(e) => return Err(e),
        };

        let pointer = LatestPointer {
            family: family.to_string(),
            target: key,
            updated_at: Utc::now(),
        };

        let family_dir = self.family_dir(family)?;
        let artifact_name = self.artifact_name.clone();
        let pointer_json = serde_json::to_vec_pretty(&pointer)?;

        tokio::task::spawn_blocking(move || {
            repoint_blocking(&family_dir, &artifact_name, &snapshot.blob, &pointer_json)
        })
        .await
        .map_err(|e| StoreError::write(format!("{}/{}", family, LATEST_DIR), e))??;

        debug!(%family, %key, "Latest pointer updated");
        Ok(pointer)
    }

    async fn latest_pointer(&self, family: &str) -> Result<LatestPointer, StoreError> {
        let path = self.latest_dir(family)?.join(POINTER_FILE);

        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(format!("{}/{}", family, LATEST_DIR)));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(serde_json::from_slice(&content)?)
    }

    async fn get_latest(&self, family: &str) -> Result<ModelSnapshot, StoreError> {
        let pointer = self.latest_pointer(family).await?;

        match self.get_snapshot(family, pointer.target).await {
            Err(StoreError::NotFound(object)) => Err(StoreError::Corrupt {
                path: format!("{}/{}", family, LATEST_DIR),
                message: format!("pointer targets missing snapshot {}", object),
            }),
            other => other,
        }
    }

    async fn get_snapshot(
        &self,
        family: &str,
        key: SnapshotKey,
    ) -> Result<ModelSnapshot, StoreError> {
        let metadata = self.read_metadata(family, key).await?;
        let blob_path = self.snapshot_path(family, key)?;
        let object = format!("{}/{}", family, key);

        let blob = match fs::read(&blob_path).await {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::Corrupt {
                    path: object,
                    message: "metadata present but blob missing".to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        if blob.len() as u64 != metadata.size_bytes || digest(&blob) != metadata.sha256 {
            return Err(StoreError::Corrupt {
                path: object,
                message: "blob does not match recorded checksum".to_string(),
            });
        }

        Ok(ModelSnapshot {
            family: metadata.family,
            key: metadata.key,
            blob,
            metrics: metadata.metrics,
        })
    }

    async fn list_snapshots(&self, family: &str) -> Result<Vec<SnapshotKey>, StoreError> {
        let family_dir = self.family_dir(family)?;
        let mut keys = Vec::new();

        if !fs::try_exists(&family_dir).await? {
            return Ok(keys);
        }

        let mut entries = fs::read_dir(&family_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(key) = name.parse::<SnapshotKey>() else {
                continue;
            };
            if fs::try_exists(entry.path().join(METADATA_FILE)).await? {
                keys.push(key);
            }
        }

        keys.sort();
        Ok(keys)
    }
}

/// Swap the latest blob copy and pointer under the family lock
fn repoint_blocking(
    family_dir: &Path,
    artifact_name: &str,
    blob: &[u8],
    pointer_json: &[u8],
) -> Result<(), StoreError> {
    let latest_dir = family_dir.join(LATEST_DIR);
    std::fs::create_dir_all(&latest_dir).map_err(|e| StoreError::write(latest_dir.display(), e))?;

    let lock_path = family_dir.join(LOCK_FILE);
    let lock = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)
        .map_err(|e| StoreError::write(lock_path.display(), e))?;
    lock.lock_exclusive()
        .map_err(|e| StoreError::write(lock_path.display(), e))?;

    // Pointer goes last: readers resolve through it, never through the copy.
    replace_file(&latest_dir.join(artifact_name), blob)?;
    replace_file(&latest_dir.join(POINTER_FILE), pointer_json)?;

    if let Err(e) = lock.unlock() {
        warn!(path = %lock_path.display(), error = %e, "Failed to release latest lock");
    }
    Ok(())
}

/// Write to a sibling temp file and rename over `target`
pub(crate) fn replace_file(target: &Path, content: &[u8]) -> Result<(), StoreError> {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = target.with_file_name(format!(".{}.tmp-{}", file_name, Uuid::new_v4()));

    let result = (|| -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(content)?;
        file.sync_all()?;
        std::fs::rename(&tmp, target)
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(StoreError::write(target.display(), e));
    }
    Ok(())
}

pub(crate) async fn write_synced(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    use tokio::io::AsyncWriteExt;

    let mut file = fs::File::create(path)
        .await
        .map_err(|e| StoreError::write(path.display(), e))?;
    file.write_all(content)
        .await
        .map_err(|e| StoreError::write(path.display(), e))?;
    file.sync_all()
        .await
        .map_err(|e| StoreError::write(path.display(), e))?;
    Ok(())
}

pub(crate) async fn discard(staging: &Path) {
    if let Err(e) = fs::remove_dir_all(staging).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %staging.display(), error = %e, "Failed to remove staging directory");
        }
    }
}

/// Hex SHA-256 of a blob
pub fn digest(blob: &[u8]) -> String {
    hex::encode(Sha256::digest(blob))
}
