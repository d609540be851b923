//! Remote build service backend.
//!
//! Protocol:
//! - `POST {base}/projects/{project}/builds` with `{"variables": {...}}` → `{"id": "..."}`
//! - `GET {base}/builds/{id}` → build job
//! - `POST {base}/builds/{id}/cancel`

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::{BuildJob, JobId, JobSpec};

use super::{BuildLauncher, LaunchError};

/// Upper bound on a single request to the build service
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct StartRequest<'a> {
    variables: &'a BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    id: String,
}

/// Build launcher talking to a remote build service
pub struct HttpLauncher {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpLauncher {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("Invalid build service URL: {}", base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Build service URL cannot be a base: {}", base_url);
        }

        Ok(Self {
            base_url,
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .context("Failed to build HTTP client")?,
        })
    }

    /// Build an API URL from path segments (each segment is escaped)
    fn api_url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

#[async_trait]
impl BuildLauncher for HttpLauncher {
    fn name(&self) -> &str {
        "http"
    }

    async fn start(&self, spec: &JobSpec) -> Result<JobId, LaunchError> {
        let url = self.api_url(&["projects", &spec.project, "builds"]);

        let response = self
            .client
            .post(url)
            .json(&StartRequest {
                variables: &spec.variables,
            })
            .send()
            .await
            .map_err(|e| LaunchError::Backend(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(LaunchError::UnknownProject(spec.project.clone()));
        }
        if status.is_client_error() {
            let message = response.text().await.unwrap_or_default();
            return Err(LaunchError::Rejected {
                project: spec.project.clone(),
                message: format!("{}: {}", status, message.trim()),
            });
        }
        if !status.is_success() {
            return Err(LaunchError::Backend(format!("build service returned {}", status)));
        }

        let started: StartResponse = response
            .json()
            .await
            .map_err(|e| LaunchError::Backend(format!("invalid start response: {}", e)))?;

        info!(job_id = %started.id, project = %spec.project, "Remote build started");
        Ok(JobId::new(started.id))
    }

    async fn poll(&self, job_id: &JobId) -> Result<BuildJob> {
        let url = self.api_url(&["builds", job_id.as_str()]);

        let job = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to poll build {}", job_id))?
            .error_for_status()
            .with_context(|| format!("Build service rejected poll for {}", job_id))?
            .json::<BuildJob>()
            .await
            .context("Failed to parse build status")?;

        Ok(job)
    }

    async fn cancel(&self, job_id: &JobId) -> Result<()> {
        let url = self.api_url(&["builds", job_id.as_str(), "cancel"]);

        self.client
            .post(url)
            .send()
            .await
            .with_context(|| format!("Failed to cancel build {}", job_id))?
            .error_for_status()
            .with_context(|| format!("Build service rejected cancel for {}", job_id))?;

        Ok(())
    }
}
