//! k-nearest-neighbours classifier.

use std::cmp::Ordering;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::dataset::{Dataset, Sample};

/// Neighbours consulted per prediction
pub const DEFAULT_K: usize = 3;

/// A fitted classifier: the training points plus `k`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnnClassifier {
    k: usize,
    feature_names: Vec<String>,
    points: Vec<Sample>,
}

impl KnnClassifier {
    /// Fit on a training set
    pub fn fit(k: usize, train: &Dataset) -> Result<Self> {
        if k == 0 {
            bail!("k must be positive");
        }
        if train.is_empty() {
            bail!("No training samples");
        }

        let dims = train.schema().features.len();
        if let Some(bad) = train.samples().iter().find(|s| s.features.len() != dims) {
            bail!(
                "Sample labelled '{}' has {} features, expected {}",
                bad.label,
                bad.features.len(),
                dims
            );
        }

        Ok(Self {
            k,
            feature_names: train.schema().features.clone(),
            points: train.samples().to_vec(),
        })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    /// Predict the label of one feature vector.
    ///
    /// Majority vote among the `k` nearest points (Euclidean); ties go to
    /// the label whose nearest member is closest.
    pub fn predict_one(&self, features: &[f64]) -> Result<&str> {
        if features.len() != self.feature_names.len() {
            bail!(
                "Expected {} features, got {}",
                self.feature_names.len(),
                features.len()
            );
        }

        let mut neighbours: Vec<(f64, &Sample)> = self
            .points
            .iter()
            .map(|p| (squared_distance(&p.features, features), p))
            .collect();
        neighbours.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
        neighbours.truncate(self.k);

        // (label, votes), in order of first appearance among the neighbours
        let mut votes: Vec<(&str, usize)> = Vec::new();
        for (_, point) in &neighbours {
            match votes.iter_mut().find(|(label, _)| *label == point.label) {
                Some((_, count)) => *count += 1,
                None => votes.push((point.label.as_str(), 1)),
            }
        }

        let mut best: Option<(&str, usize)> = None;
        for (label, count) in votes {
            if best.map_or(true, |(_, top)| count > top) {
                best = Some((label, count));
            }
        }

        best.map(|(label, _)| label)
            .context("Classifier has no training points")
    }

    /// Predict every sample of a dataset, in order
    pub fn predict(&self, dataset: &Dataset) -> Result<Vec<String>> {
        dataset
            .samples()
            .iter()
            .map(|s| self.predict_one(&s.features).map(str::to_string))
            .collect()
    }

    /// Serialized model blob stored in the artifact store
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("Failed to serialize classifier")
    }

    pub fn from_bytes(blob: &[u8]) -> Result<Self> {
        let model: Self = serde_json::from_slice(blob).context("Failed to deserialize classifier")?;
        if model.k == 0 || model.points.is_empty() {
            bail!("Serialized classifier is empty");
        }
        Ok(model)
    }
}

/// Share of predictions that match the dataset labels
pub fn accuracy(predictions: &[String], truth: &Dataset) -> f64 {
    if predictions.is_empty() || predictions.len() != truth.len() {
        return 0.0;
    }

    let correct = predictions
        .iter()
        .zip(truth.labels())
        .filter(|(predicted, actual)| predicted.as_str() == *actual)
        .count();

    correct as f64 / predictions.len() as f64
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}
