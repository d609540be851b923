//! Inference execution stage.
//!
//! Loads the latest (or a pinned) snapshot, predicts the held-out split and
//! writes an immutable, timestamped result object.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::domain::{InferenceResult, SnapshotKey};
use crate::store::{ArtifactStore, ResultStore};

use super::dataset::{Dataset, DEFAULT_TEST_FRACTION};
use super::knn::{accuracy, KnnClassifier};

/// What an inference run produced
#[derive(Debug, Clone)]
pub struct InferenceReport {
    pub result: InferenceResult,
    pub prediction_path: PathBuf,
}

pub struct InferenceStage {
    store: Arc<dyn ArtifactStore>,
    results: ResultStore,
    test_fraction: f64,
}

impl InferenceStage {
    pub fn new(store: Arc<dyn ArtifactStore>, results: ResultStore) -> Self {
        Self {
            store,
            results,
            test_fraction: DEFAULT_TEST_FRACTION,
        }
    }

    pub fn with_test_fraction(mut self, test_fraction: f64) -> Self {
        self.test_fraction = test_fraction;
        self
    }

    /// Score the held-out split with `snapshot` (the latest when `None`)
    #[instrument(skip(self, dataset), fields(rows = dataset.len()))]
    pub async fn run(
        &self,
        family: &str,
        dataset: &Dataset,
        snapshot: Option<SnapshotKey>,
    ) -> Result<InferenceReport> {
        let snapshot = match snapshot {
            Some(key) => self.store.get_snapshot(family, key).await,
            None => self.store.get_latest(family).await,
        }
        .with_context(|| format!("Failed to load model snapshot of '{}'", family))?;

        let model = KnnClassifier::from_bytes(&snapshot.blob)
            .with_context(|| format!("Snapshot {} is not a classifier", snapshot.reference()))?;

        let (_, test) = dataset.split(self.test_fraction);
        let predictions = model.predict(&test)?;
        let score = accuracy(&predictions, &test);

        let result = InferenceResult {
            generated_at: SnapshotKey::now(),
            predictions,
            accuracy: score,
            source_snapshot: snapshot.reference(),
        };
        let prediction_path = self
            .results
            .write(&result)
            .await
            .context("Failed to write inference result")?;

        info!(
            snapshot = %result.source_snapshot,
            accuracy = score,
            path = %prediction_path.display(),
            "Inference result written"
        );

        Ok(InferenceReport {
            result,
            prediction_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::dataset::tests::iris_sample;
    use crate::ml::dataset::DatasetSchema;
    use crate::ml::training::{TrainingConfig, TrainingStage};
    use crate::store::FsArtifactStore;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_inference_writes_prediction_csv() {
        let temp = TempDir::new().unwrap();
        let store: Arc<dyn ArtifactStore> = Arc::new(FsArtifactStore::new(temp.path().join("bucket")));
        let dataset = Dataset::from_csv(&iris_sample(), &DatasetSchema::default()).unwrap();

        let trained = TrainingStage::new(store.clone(), TrainingConfig::default())
            .run("iris", &dataset)
            .await
            .unwrap();

        let stage = InferenceStage::new(store, ResultStore::new(temp.path().join("results")));
        let report = stage.run("iris", &dataset, None).await.unwrap();

        assert_eq!(report.result.predictions.len(), 9);
        assert_eq!(report.result.source_snapshot, format!("iris/{}", trained.key));

        let csv = std::fs::read_to_string(&report.prediction_path).unwrap();
        assert!(csv.starts_with(",prediction\n0,Iris-setosa\n"));
        assert_eq!(csv.lines().count(), 10);
    }

    #[tokio::test]
    async fn test_inference_without_snapshot_fails() {
        let temp = TempDir::new().unwrap();
        let store: Arc<dyn ArtifactStore> = Arc::new(FsArtifactStore::new(temp.path().join("bucket")));
        let dataset = Dataset::from_csv(&iris_sample(), &DatasetSchema::default()).unwrap();

        let stage = InferenceStage::new(store, ResultStore::new(temp.path().join("results")));
        assert!(stage.run("iris", &dataset, None).await.is_err());
    }
}
