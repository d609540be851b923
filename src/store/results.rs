//! Immutable inference result objects.
//!
//! Layout: `inference-results/{MM-DD-YYYY HH-MM-SS}/prediction.csv`, with a
//! `result.json` describing the run next to it.

use std::path::{Path, PathBuf};

use tokio::fs;
use uuid::Uuid;

use crate::domain::InferenceResult;

use super::fs::{discard, write_synced};
use super::StoreError;

pub const RESULTS_PREFIX: &str = "inference-results";
pub const PREDICTION_FILE: &str = "prediction.csv";
const RESULT_METADATA_FILE: &str = "result.json";

/// Writes one immutable object per inference run
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the prediction object for a result
    pub fn prediction_path(&self, result: &InferenceResult) -> PathBuf {
        self.root
            .join(RESULTS_PREFIX)
            .join(result.generated_at.to_string())
            .join(PREDICTION_FILE)
    }

    /// Persist a result; an existing result with the same timestamp is an error
    pub async fn write(&self, result: &InferenceResult) -> Result<PathBuf, StoreError> {
        let prefix = self.root.join(RESULTS_PREFIX);
        let final_dir = prefix.join(result.generated_at.to_string());
        let object = format!("{}/{}", RESULTS_PREFIX, result.generated_at);

        if fs::try_exists(&final_dir).await? {
            return Err(StoreError::AlreadyExists(object));
        }

        fs::create_dir_all(&prefix)
            .await
            .map_err(|e| StoreError::write(prefix.display(), e))?;

        let staging = prefix.join(format!(".staging-{}", Uuid::new_v4()));
        let staged = async {
            fs::create_dir(&staging)
                .await
                .map_err(|e| StoreError::write(staging.display(), e))?;
            write_synced(&staging.join(PREDICTION_FILE), &prediction_csv(result)?).await?;
            write_synced(
                &staging.join(RESULT_METADATA_FILE),
                &serde_json::to_vec_pretty(result)?,
            )
            .await
        };

        if let Err(e) = staged.await {
            discard(&staging).await;
            return Err(e);
        }

        if let Err(e) = fs::rename(&staging, &final_dir).await {
            discard(&staging).await;
            if fs::try_exists(&final_dir).await.unwrap_or(false) {
                return Err(StoreError::AlreadyExists(object));
            }
            return Err(StoreError::write(final_dir.display(), e));
        }

        Ok(final_dir.join(PREDICTION_FILE))
    }
}

/// Indexed single-column CSV (`,prediction` header)
pub fn prediction_csv(result: &InferenceResult) -> Result<Vec<u8>, StoreError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["", "prediction"])?;
    for (idx, label) in result.predictions.iter().enumerate() {
        writer.write_record([idx.to_string().as_str(), label.as_str()])?;
    }
    writer.into_inner().map_err(|e| StoreError::Io(e.into_error()))
}
