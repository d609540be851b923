//! Build jobs: asynchronous, pollable units of work.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result payload key holding the produced image reference
pub const IMAGE_URI_OUTPUT: &str = "IMAGE_URI";

/// Identifier assigned by the build backend when a job is started
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What to build: a project plus named string variables
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Build project identifier
    pub project: String,

    /// Variables exposed to the build (account, region, repository, ...)
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl JobSpec {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            variables: BTreeMap::new(),
        }
    }

    /// Add or replace a variable
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Merge a set of variables; entries already present are overwritten
    pub fn with_variables<'a, I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (name, value) in vars {
            self.variables.insert(name.clone(), value.clone());
        }
        self
    }
}

/// Status reported by a build backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// One asynchronous build invocation as last seen by the poller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildJob {
    pub id: JobId,
    pub project: String,
    pub status: BuildStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    /// Named outputs produced by the build (e.g. `IMAGE_URI`)
    #[serde(default)]
    pub result: BTreeMap<String, String>,

    /// Where the build logs can be read
    #[serde(default)]
    pub logs_ref: Option<String>,

    /// Failure detail reported by the backend
    #[serde(default)]
    pub error: Option<String>,
}

impl BuildJob {
    /// A freshly enqueued job
    pub fn pending(id: JobId, project: impl Into<String>) -> Self {
        Self {
            id,
            project: project.into(),
            status: BuildStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            result: BTreeMap::new(),
            logs_ref: None,
            error: None,
        }
    }

    /// Image reference produced by an image build, if any
    pub fn image_ref(&self) -> Option<&str> {
        self.result.get(IMAGE_URI_OUTPUT).map(String::as_str)
    }
}
