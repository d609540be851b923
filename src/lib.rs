//! retrain - Event-sourced model retrain and redeploy orchestrator
//!
//! Keeps a served ML model current: training publishes immutable,
//! timestamped model snapshots, and a retrain run rebuilds the serving
//! image from the latest snapshot and redeploys the inference endpoint.
//!
//! # Architecture
//!
//! The system is built around event sourcing:
//! - Every run transition is recorded as an immutable event
//! - Run status is derived by replaying events
//! - Failed runs are terminal; a new trigger starts a fresh run
//!
//! # Modules
//!
//! - `adapters`: Build job launchers (local process, HTTP build service)
//! - `core`: Orchestration logic (EventStore, Pipeline, Poller, Orchestrator)
//! - `deploy`: Inference endpoint deployment
//! - `domain`: Data structures (Event, PipelineRun, BuildJob, ModelSnapshot)
//! - `ml`: Training and inference execution stages
//! - `store`: Versioned artifact store and inference results
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Train and publish a snapshot
//! retrain train iris --data Iris.csv
//!
//! # Rebuild the image and redeploy
//! retrain run iris
//!
//! # Check run status
//! retrain status <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod deploy;
pub mod domain;
pub mod ml;
pub mod store;

// Re-export main types at crate root for convenience
pub use core::{Orchestrator, Pipeline, TriggerError};
pub use domain::{Event, EventType, FailureReason, PipelineRun, RunState};
pub use store::{ArtifactStore, FsArtifactStore};
