//! Build job launchers.
//!
//! A launcher starts an asynchronous build and reports its status on
//! request. Starting and polling are separate calls so the orchestrator can
//! apply one timeout/backoff policy across every backend.

pub mod http;
pub mod process;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{BuildJob, JobId, JobSpec};

pub use http::HttpLauncher;
pub use process::{ProcessLauncher, ProjectCommand};

/// Reasons a build could not be started
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Unknown build project: {0}")]
    UnknownProject(String),

    #[error("Build project '{project}' rejected the request: {message}")]
    Rejected { project: String, message: String },

    #[error("Build backend unavailable: {0}")]
    Backend(String),
}

/// Trait for build backends
#[async_trait]
pub trait BuildLauncher: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Enqueue a build and return immediately
    async fn start(&self, spec: &JobSpec) -> Result<JobId, LaunchError>;

    /// Current status of a job
    async fn poll(&self, job_id: &JobId) -> Result<BuildJob>;

    /// Best-effort cancellation of a running job
    async fn cancel(&self, job_id: &JobId) -> Result<()>;
}
