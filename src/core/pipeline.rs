//! Retrain pipeline definitions and loading.
//!
//! One pipeline is defined per model family in YAML (`pipelines/<family>.yaml`).
//! It names the endpoint, the build project for each stage, the variables
//! injected into the build jobs and the polling policy.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::{JobSpec, SnapshotKey};

/// Variable carrying the family name into stage 1
pub const VAR_MODEL_FAMILY: &str = "MODEL_FAMILY";

/// Variable carrying the resolved snapshot key into stage 1
pub const VAR_MODEL_KEY: &str = "MODEL_KEY";

/// Variable carrying the stage-1 image reference into stage 2
pub const VAR_INFERENCE_IMAGE_URI: &str = "INFERENCE_IMAGE_URI";

/// A complete retrain pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Model family this pipeline retrains (used in CLI)
    pub family: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Fixed identifier of the inference endpoint
    pub endpoint: String,

    /// Variables shared by both stages (account, region, repository, ...)
    #[serde(default)]
    pub variables: BTreeMap<String, String>,

    /// Stage 1: rebuild the serving image
    pub image_build: BuildStage,

    /// Stage 2: create or update the endpoint
    #[serde(default)]
    pub deploy: DeployStage,

    /// Polling policy for build jobs
    #[serde(default)]
    pub poll: PollPolicy,

    /// Hard per-stage timeout in seconds (default: 900)
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_seconds: u64,
}

fn default_stage_timeout() -> u64 {
    900
}

impl Pipeline {
    /// Load a pipeline from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Invalid pipeline file: {}", path.display()))
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// Load and validate every `*.yaml` pipeline in a directory
    pub fn load_dir(dir: &Path) -> Result<Vec<Self>> {
        let mut pipelines = Vec::new();

        if !dir.exists() {
            return Ok(pipelines);
        }

        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read pipelines directory: {}", dir.display()))?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let pipeline = Self::from_file(&path)?;
            pipeline.validate()?;
            pipelines.push(pipeline);
        }

        pipelines.sort_by(|a, b| a.family.cmp(&b.family));
        Ok(pipelines)
    }

    /// Validate the pipeline definition
    pub fn validate(&self) -> Result<()> {
        if self.family.trim().is_empty() {
            anyhow::bail!("Pipeline family cannot be empty");
        }

        if self.endpoint.trim().is_empty() {
            anyhow::bail!("Pipeline '{}' has an empty endpoint", self.family);
        }

        if self.image_build.project.trim().is_empty() {
            anyhow::bail!("Pipeline '{}' has an empty image build project", self.family);
        }

        if let DeployStage::BuildJob { ref project, .. } = self.deploy {
            if project.trim().is_empty() {
                anyhow::bail!("Pipeline '{}' has an empty deploy project", self.family);
            }
        }

        if self.stage_timeout_seconds == 0 {
            anyhow::bail!("Pipeline '{}' stage timeout must be positive", self.family);
        }

        self.poll
            .validate()
            .with_context(|| format!("Pipeline '{}' has an invalid poll policy", self.family))
    }

    /// Effective per-stage timeout
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_seconds)
    }

    /// Job spec for stage 1, built from the resolved snapshot
    pub fn image_build_spec(&self, snapshot_key: SnapshotKey) -> JobSpec {
        JobSpec::new(&self.image_build.project)
            .with_variables(&self.variables)
            .with_variables(&self.image_build.variables)
            .with_variable(VAR_MODEL_FAMILY, &self.family)
            .with_variable(VAR_MODEL_KEY, snapshot_key.to_string())
    }
}

/// A stage executed as a build job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStage {
    /// Build project identifier
    pub project: String,

    /// Stage-specific variables (override the shared ones)
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

/// How stage 2 is carried out
///
/// ```yaml
/// deploy:
///   mode: direct
/// ```
/// or
/// ```yaml
/// deploy:
///   mode: build_job
///   project: create-or-update-inference-lambda-project
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeployStage {
    /// Update the endpoint registry directly
    Direct,

    /// Run a second build job with the image reference as input
    BuildJob {
        project: String,
        #[serde(default)]
        variables: BTreeMap<String, String>,
    },
}

impl Default for DeployStage {
    fn default() -> Self {
        Self::Direct
    }
}

/// Bounded exponential backoff for polling build jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollPolicy {
    /// First interval between polls in milliseconds
    #[serde(default = "default_initial_interval")]
    pub initial_interval_ms: u64,

    /// Cap on the interval between polls in milliseconds
    #[serde(default = "default_max_interval")]
    pub max_interval_ms: u64,

    /// Backoff multiplier (interval *= multiplier after each poll)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Consecutive poll errors tolerated before giving up on the job
    #[serde(default = "default_max_poll_errors")]
    pub max_poll_errors: u32,
}

fn default_initial_interval() -> u64 {
    5_000
}
fn default_max_interval() -> u64 {
    60_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_poll_errors() -> u32 {
    5
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval(),
            max_interval_ms: default_max_interval(),
            backoff_multiplier: default_backoff_multiplier(),
            max_poll_errors: default_max_poll_errors(),
        }
    }
}

impl PollPolicy {
    /// Interval before poll number `attempt + 1` (attempt is 1-indexed)
    pub fn interval_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_interval_ms.min(self.max_interval_ms));
        }

        let interval = self.initial_interval_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = interval.min(self.max_interval_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_interval_ms == 0 {
            anyhow::bail!("initial_interval_ms must be positive");
        }
        if self.max_interval_ms < self.initial_interval_ms {
            anyhow::bail!(
                "max_interval_ms ({}) is below initial_interval_ms ({})",
                self.max_interval_ms,
                self.initial_interval_ms
            );
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            anyhow::bail!("backoff_multiplier must be >= 1.0");
        }
        if self.max_poll_errors == 0 {
            anyhow::bail!("max_poll_errors must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_PIPELINE_YAML: &str = r#"
family: iris
description: Iris classifier serving pipeline
endpoint: inference-lambda

variables:
  AWS_ACCOUNT_ID: "1234"
  IMAGE_REPO_NAME: inference-ecr

image_build:
  project: inference-image-codebuild-project

deploy:
  mode: build_job
  project: create-or-update-inference-lambda-project
  variables:
    INFERENCE_RESULTS_BUCKET: iris-results

poll:
  initial_interval_ms: 1000
  max_interval_ms: 10000

stage_timeout_seconds: 600
"#;

    #[test]
    fn test_pipeline_parsing() {
        let pipeline = Pipeline::from_yaml(TEST_PIPELINE_YAML).unwrap();

        assert_eq!(pipeline.family, "iris");
        assert_eq!(pipeline.endpoint, "inference-lambda");
        assert_eq!(pipeline.stage_timeout(), Duration::from_secs(600));
        assert_eq!(pipeline.poll.backoff_multiplier, 2.0);
        assert!(matches!(pipeline.deploy, DeployStage::BuildJob { ref project, .. }
            if project == "create-or-update-inference-lambda-project"));
    }

    #[test]
    fn test_pipeline_defaults() {
        let yaml = r#"
family: iris
endpoint: inference-lambda
image_build:
  project: build-image
"#;
        let pipeline = Pipeline::from_yaml(yaml).unwrap();

        assert_eq!(pipeline.deploy, DeployStage::Direct);
        assert_eq!(pipeline.stage_timeout_seconds, 900);
        assert_eq!(pipeline.poll.initial_interval_ms, 5_000);
        assert!(pipeline.validate().is_ok());
    }

    #[test]
    fn test_pipeline_validation() {
        let pipeline = Pipeline::from_yaml(TEST_PIPELINE_YAML).unwrap();
        assert!(pipeline.validate().is_ok());

        let mut invalid = pipeline.clone();
        invalid.endpoint = String::new();
        assert!(invalid.validate().is_err());

        let mut invalid = pipeline.clone();
        invalid.stage_timeout_seconds = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = pipeline;
        invalid.poll.max_interval_ms = 10;
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_image_build_spec_variables() {
        let pipeline = Pipeline::from_yaml(TEST_PIPELINE_YAML).unwrap();
        let key: SnapshotKey = "05-17-2024 13-04-59".parse().unwrap();

        let spec = pipeline.image_build_spec(key);

        assert_eq!(spec.project, "inference-image-codebuild-project");
        assert_eq!(spec.variables["AWS_ACCOUNT_ID"], "1234");
        assert_eq!(spec.variables[VAR_MODEL_FAMILY], "iris");
        assert_eq!(spec.variables[VAR_MODEL_KEY], "05-17-2024 13-04-59");
        assert!(!spec.variables.contains_key("INFERENCE_RESULTS_BUCKET"));
    }

    #[test]
    fn test_poll_intervals() {
        let policy = PollPolicy {
            initial_interval_ms: 1000,
            backoff_multiplier: 2.0,
            max_interval_ms: 10000,
            ..Default::default()
        };

        assert_eq!(policy.interval_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.interval_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.interval_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.interval_for_attempt(4), Duration::from_millis(8000));
        assert_eq!(policy.interval_for_attempt(5), Duration::from_millis(10000)); // Capped
    }
}
