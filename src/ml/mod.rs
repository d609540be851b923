//! Training and inference execution stages.
//!
//! Training writes new model snapshots through the artifact store; the
//! orchestrator picks them up on its next run. Inference reads the latest
//! snapshot back and writes timestamped prediction objects.

pub mod dataset;
pub mod inference;
pub mod knn;
pub mod training;

pub use dataset::{Dataset, DatasetSchema, Sample};
pub use inference::{InferenceReport, InferenceStage};
pub use knn::KnnClassifier;
pub use training::{TrainingConfig, TrainingReport, TrainingStage};
