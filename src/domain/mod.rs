//! Domain types for the retrain orchestrator.
//!
//! This module contains the core data structures:
//! - Events: Immutable records of run transitions
//! - Run: Retrain pipeline execution state
//! - Snapshot: Versioned model artifacts and the latest pointer
//! - Build: Asynchronous build jobs
//! - Deployment: The inference endpoint record

pub mod build;
pub mod deployment;
pub mod events;
pub mod run;
pub mod snapshot;

// Re-export commonly used types
pub use build::{BuildJob, BuildStatus, JobId, JobSpec, IMAGE_URI_OUTPUT};
pub use deployment::{DeployAction, InferenceDeployment};
pub use events::{Event, EventType, StepStatus};
pub use run::{FailureReason, PipelineRun, RunState, RunStatus, Stage, StageResult};
pub use snapshot::{
    InferenceResult, LatestPointer, ModelSnapshot, SnapshotKey, SnapshotMetadata, TrainingMetrics,
};
