//! Training execution stage.
//!
//! Fits the classifier on the training split, scores it on the held-out
//! split and publishes the result as a new snapshot of the family. The
//! latest pointer only moves once the snapshot is fully written.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, instrument};

use crate::domain::{SnapshotKey, TrainingMetrics};
use crate::store::{publish_snapshot, ArtifactStore};

use super::dataset::{Dataset, DEFAULT_TEST_FRACTION};
use super::knn::{accuracy, KnnClassifier, DEFAULT_K};

/// Training hyper-parameters
#[derive(Debug, Clone, Copy)]
pub struct TrainingConfig {
    pub k: usize,
    pub test_fraction: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            test_fraction: DEFAULT_TEST_FRACTION,
        }
    }
}

/// What a training run produced
#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub family: String,
    pub key: SnapshotKey,
    pub accuracy: f64,
    pub train_size: usize,
    pub test_size: usize,
}

pub struct TrainingStage {
    store: Arc<dyn ArtifactStore>,
    config: TrainingConfig,
}

impl TrainingStage {
    pub fn new(store: Arc<dyn ArtifactStore>, config: TrainingConfig) -> Self {
        Self { store, config }
    }

    /// Train on `dataset` and publish the model as the family's latest
    #[instrument(skip(self, dataset), fields(rows = dataset.len()))]
    pub async fn run(&self, family: &str, dataset: &Dataset) -> Result<TrainingReport> {
        let (train, test) = dataset.split(self.config.test_fraction);
        if test.is_empty() {
            anyhow::bail!("Dataset of {} rows leaves no held-out rows", dataset.len());
        }

        let model = KnnClassifier::fit(self.config.k, &train)?;
        let predictions = model.predict(&test)?;
        let score = accuracy(&predictions, &test);
        info!(accuracy = score, train = train.len(), test = test.len(), "Model trained");

        let blob = model.to_bytes()?;
        let key = publish_snapshot(self.store.as_ref(), family, &blob, &TrainingMetrics::new(score))
            .await
            .with_context(|| format!("Failed to publish snapshot of '{}'", family))?;

        Ok(TrainingReport {
            family: family.to_string(),
            key,
            accuracy: score,
            train_size: train.len(),
            test_size: test.len(),
        })
    }
}
