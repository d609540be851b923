//! Deployment carried out by a build job.
//!
//! The deploy project receives the image as `INFERENCE_IMAGE_URI`; once the
//! job succeeds the served image is recorded in the endpoint registry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::adapters::{BuildLauncher, LaunchError};
use crate::core::pipeline::{PollPolicy, VAR_INFERENCE_IMAGE_URI};
use crate::core::poller::{wait_for_terminal, PollError};
use crate::domain::{BuildStatus, DeployAction, InferenceDeployment, JobSpec};

use super::registry::RegistryDeployer;
use super::{DeployError, DeployOutcome, Deployer};

/// Runs the deploy project, then records the endpoint binding
pub struct BuildJobDeployer {
    launcher: Arc<dyn BuildLauncher>,
    project: String,
    variables: BTreeMap<String, String>,
    poll: PollPolicy,
    timeout: Duration,
    registry: RegistryDeployer,
}

impl BuildJobDeployer {
    pub fn new(
        launcher: Arc<dyn BuildLauncher>,
        project: impl Into<String>,
        variables: BTreeMap<String, String>,
        poll: PollPolicy,
        timeout: Duration,
        registry: RegistryDeployer,
    ) -> Self {
        Self {
            launcher,
            project: project.into(),
            variables,
            poll,
            timeout,
            registry,
        }
    }

    fn job_spec(&self, image_ref: &str) -> JobSpec {
        JobSpec::new(&self.project)
            .with_variables(&self.variables)
            .with_variable(VAR_INFERENCE_IMAGE_URI, image_ref)
    }
}

#[async_trait]
impl Deployer for BuildJobDeployer {
    fn endpoint(&self) -> &str {
        self.registry.endpoint()
    }

    async fn current(&self) -> Result<Option<InferenceDeployment>, DeployError> {
        self.registry.current().await
    }

    async fn deploy(&self, image_ref: &str) -> Result<DeployOutcome, DeployError> {
        if let Some(deployment) = self.registry.current().await? {
            if deployment.image_ref == image_ref {
                info!(endpoint = %self.endpoint(), image_ref, "Endpoint already serves image");
                return Ok(DeployOutcome {
                    deployment,
                    action: DeployAction::Unchanged,
                });
            }
        }

        let spec = self.job_spec(image_ref);
        let job_id = self.launcher.start(&spec).await.map_err(|e| match e {
            LaunchError::Rejected { project, message } => DeployError::Unauthorized {
                endpoint: self.registry.endpoint().to_string(),
                message: format!("{} rejected the deploy: {}", project, message),
            },
            other => DeployError::Backend(other.to_string()),
        })?;
        info!(%job_id, project = %self.project, "Deploy job launched");

        let job = match wait_for_terminal(
            self.launcher.as_ref(),
            &job_id,
            &self.poll,
            self.timeout,
            None,
        )
        .await
        {
            Ok(job) => job,
            Err(e) => {
                if matches!(e, PollError::Timeout { .. } | PollError::Backend { .. }) {
                    if let Err(cancel_err) = self.launcher.cancel(&job_id).await {
                        warn!(%job_id, error = %cancel_err, "Failed to cancel deploy job");
                    }
                }
                return Err(DeployError::Job(e.to_string()));
            }
        };

        if job.status != BuildStatus::Succeeded {
            return Err(DeployError::Job(
                job.error
                    .unwrap_or_else(|| format!("deploy job {} finished as {}", job.id, job.status)),
            ));
        }

        self.registry.deploy(image_ref).await
    }
}
