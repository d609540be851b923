//! Shared fakes for the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use retrain::adapters::{BuildLauncher, LaunchError};
use retrain::core::{Orchestrator, Pipeline, PollPolicy};
use retrain::deploy::{DeployError, DeployOutcome, Deployer, RegistryDeployer};
use retrain::domain::{
    BuildJob, BuildStatus, InferenceDeployment, JobId, JobSpec, SnapshotKey, TrainingMetrics,
    IMAGE_URI_OUTPUT,
};
use retrain::store::{ArtifactStore, FsArtifactStore};

pub const IMAGE_URI: &str = "1234.dkr.ecr.us-east-1.amazonaws.com/inference-ecr:abc";
pub const ENDPOINT: &str = "inference-lambda";
pub const PRIOR_IMAGE_URI: &str = "1234.dkr.ecr.us-east-1.amazonaws.com/inference-ecr:prev";

/// One scripted answer to a poll
#[derive(Debug, Clone)]
pub enum Step {
    Status(BuildStatus),
    /// Succeeded without an IMAGE_URI output
    SucceededBare,
    /// Failed with a backend message
    Failed(&'static str),
    /// The poll call itself errors
    PollError,
    /// Failed with a backend message and a logs reference
    FailedWithLogs(&'static str, &'static str),
    /// The poll call never answers
    Stall,
}

/// Build launcher answering polls from a script; the last step repeats
pub struct ScriptedLauncher {
    script: Mutex<VecDeque<Step>>,
    start_error: Mutex<Option<LaunchError>>,
    pub starts: Mutex<Vec<JobSpec>>,
    pub cancels: Mutex<Vec<JobId>>,
    polls: AtomicUsize,
}

impl ScriptedLauncher {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            start_error: Mutex::new(None),
            starts: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            polls: AtomicUsize::new(0),
        }
    }

    /// Pending, Running, then Succeeded with an image
    pub fn succeeding() -> Self {
        Self::new(vec![
            Step::Status(BuildStatus::Pending),
            Step::Status(BuildStatus::Running),
            Step::Status(BuildStatus::Succeeded),
        ])
    }

    /// Never leaves Running
    pub fn hanging() -> Self {
        Self::new(vec![Step::Status(BuildStatus::Running)])
    }

    pub fn failing_start(error: LaunchError) -> Self {
        let launcher = Self::new(vec![Step::Status(BuildStatus::Running)]);
        *launcher.start_error.lock().unwrap() = Some(error);
        launcher
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> usize {
        self.starts.lock().unwrap().len()
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.lock().unwrap().len()
    }

    fn next_step(&self) -> Step {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap_or(Step::Status(BuildStatus::Running))
        }
    }
}

#[async_trait]
impl BuildLauncher for ScriptedLauncher {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn start(&self, spec: &JobSpec) -> Result<JobId, LaunchError> {
        if let Some(error) = self.start_error.lock().unwrap().take() {
            return Err(error);
        }
        let mut starts = self.starts.lock().unwrap();
        starts.push(spec.clone());
        Ok(JobId::new(format!("{}:{}", spec.project, starts.len())))
    }

    async fn poll(&self, job_id: &JobId) -> Result<BuildJob> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let mut job = BuildJob::pending(job_id.clone(), "scripted");

        match self.next_step() {
            Step::Status(BuildStatus::Succeeded) => {
                job.status = BuildStatus::Succeeded;
                job.result.insert(IMAGE_URI_OUTPUT.to_string(), IMAGE_URI.to_string());
            }
            Step::Status(status) => job.status = status,
            Step::SucceededBare => job.status = BuildStatus::Succeeded,
            Step::Failed(message) => {
                job.status = BuildStatus::Failed;
                job.error = Some(message.to_string());
            }
            Step::FailedWithLogs(message, logs_ref) => {
                job.status = BuildStatus::Failed;
                job.error = Some(message.to_string());
                job.logs_ref = Some(logs_ref.to_string());
            }
            Step::PollError => anyhow::bail!("build service returned 503"),
            Step::Stall => return std::future::pending().await,
        }

        Ok(job)
    }

    async fn cancel(&self, job_id: &JobId) -> Result<()> {
        self.cancels.lock().unwrap().push(job_id.clone());
        Ok(())
    }
}

/// Deployer that always rejects the update
pub struct FailingDeployer;

#[async_trait]
impl Deployer for FailingDeployer {
    fn endpoint(&self) -> &str {
        ENDPOINT
    }

    async fn current(&self) -> Result<Option<InferenceDeployment>, DeployError> {
        Ok(None)
    }

    async fn deploy(&self, _image_ref: &str) -> Result<DeployOutcome, DeployError> {
        Err(DeployError::Unauthorized {
            endpoint: ENDPOINT.to_string(),
            message: "AccessDenied".to_string(),
        })
    }
}

/// Fast polling so real-time tests finish quickly
pub fn fast_poll() -> PollPolicy {
    PollPolicy {
        initial_interval_ms: 10,
        max_interval_ms: 40,
        backoff_multiplier: 2.0,
        max_poll_errors: 3,
    }
}

pub fn iris_pipeline(poll: PollPolicy) -> Pipeline {
    let mut pipeline = Pipeline::from_yaml(
        r#"
family: iris
endpoint: inference-lambda
variables:
  AWS_ACCOUNT_ID: "1234"
  AWS_DEFAULT_REGION: us-east-1
  IMAGE_REPO_NAME: inference-ecr
image_build:
  project: inference-image-codebuild-project
"#,
    )
    .unwrap();
    pipeline.poll = poll;
    pipeline
}

pub fn snapshot_key(second: u32) -> SnapshotKey {
    SnapshotKey::from_datetime(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, second).unwrap())
}

/// Workspace with an artifact store, an endpoint registry and an orchestrator
pub struct Harness {
    pub temp: TempDir,
    pub store: Arc<FsArtifactStore>,
    pub launcher: Arc<ScriptedLauncher>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new(launcher: ScriptedLauncher, pipeline: Pipeline) -> Self {
        Self::build(launcher, pipeline, None)
    }

    pub fn with_deployer(
        launcher: ScriptedLauncher,
        pipeline: Pipeline,
        deployer: Arc<dyn Deployer>,
    ) -> Self {
        Self::build(launcher, pipeline, Some(deployer))
    }

    fn build(launcher: ScriptedLauncher, pipeline: Pipeline, deployer: Option<Arc<dyn Deployer>>) -> Self {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(FsArtifactStore::new(temp.path().join("bucket")));
        let launcher = Arc::new(launcher);

        let deployer = deployer.unwrap_or_else(|| {
            Arc::new(RegistryDeployer::new(temp.path().join("endpoints"), &pipeline.endpoint))
        });

        let orchestrator = Orchestrator::new(
            temp.path().join("runs"),
            temp.path().join("locks"),
            store.clone(),
            launcher.clone(),
        )
        .with_pipeline(pipeline, deployer)
        .with_cancel_watch_interval(Duration::from_millis(20));

        Self {
            temp,
            store,
            launcher,
            orchestrator,
        }
    }

    pub fn registry(&self) -> RegistryDeployer {
        RegistryDeployer::new(self.temp.path().join("endpoints"), ENDPOINT)
    }

    /// Publish a snapshot and point `latest` at it
    pub async fn publish(&self, key: SnapshotKey) -> SnapshotKey {
        self.store
            .put_snapshot_at("iris", key, b"knn-model", &TrainingMetrics::new(0.97))
            .await
            .unwrap();
        self.store.update_latest("iris", key).await.unwrap();
        key
    }
}
