//! Inference deployment stage.
//!
//! Binds the fixed inference endpoint to a new image reference, creating
//! the endpoint if it does not exist. Deploying the image an endpoint
//! already serves is a no-op.

pub mod job;
pub mod registry;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::adapters::BuildLauncher;
use crate::core::pipeline::{DeployStage, Pipeline};
use crate::domain::{DeployAction, InferenceDeployment};

pub use job::BuildJobDeployer;
pub use registry::RegistryDeployer;

/// Reasons a deployment did not complete
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Not allowed to update endpoint '{endpoint}': {message}")]
    Unauthorized { endpoint: String, message: String },

    #[error("Deployment backend error: {0}")]
    Backend(String),

    #[error("Deploy job failed: {0}")]
    Job(String),
}

/// Result of a successful deploy call
#[derive(Debug, Clone, Serialize)]
pub struct DeployOutcome {
    pub deployment: InferenceDeployment,
    pub action: DeployAction,
}

/// Trait for deployment backends
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Endpoint this deployer manages
    fn endpoint(&self) -> &str;

    /// Currently deployed record, if the endpoint exists
    async fn current(&self) -> Result<Option<InferenceDeployment>, DeployError>;

    /// Create or update the endpoint so it serves `image_ref`
    async fn deploy(&self, image_ref: &str) -> Result<DeployOutcome, DeployError>;
}

/// Deployment backend for a pipeline's `deploy` mode
pub fn for_pipeline(
    pipeline: &Pipeline,
    launcher: Arc<dyn BuildLauncher>,
    endpoints_dir: &Path,
) -> Arc<dyn Deployer> {
    let registry = RegistryDeployer::new(endpoints_dir, &pipeline.endpoint);

    match &pipeline.deploy {
        DeployStage::Direct => Arc::new(registry),
        DeployStage::BuildJob { project, variables } => {
            let mut merged = pipeline.variables.clone();
            merged.extend(variables.iter().map(|(k, v)| (k.clone(), v.clone())));

            Arc::new(BuildJobDeployer::new(
                launcher,
                project.as_str(),
                merged,
                pipeline.poll.clone(),
                pipeline.stage_timeout(),
                registry,
            ))
        }
    }
}
