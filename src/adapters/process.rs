//! Local process build backend.
//!
//! Each build project maps to a command. The job spec variables are passed
//! as environment variables, stdout lines of the form `NAME=VALUE` become
//! the job's result payload, and the combined output is kept as the job log.
//!
//! A finished job is forgotten once a poll has reported it; finished jobs
//! nobody polls are pruned after [`FINISHED_RETENTION_MINUTES`].

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{BuildJob, BuildStatus, JobId, JobSpec};

use super::{BuildLauncher, LaunchError};

/// Command run for one build project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectCommand {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

/// How long an unpolled finished job stays in the table
pub const FINISHED_RETENTION_MINUTES: i64 = 10;

struct TrackedJob {
    job: BuildJob,
    abort: Option<AbortHandle>,
}

type JobTable = Arc<Mutex<HashMap<JobId, TrackedJob>>>;

/// Build launcher running local commands
pub struct ProcessLauncher {
    projects: HashMap<String, ProjectCommand>,

    /// Directory receiving `{job}.log` files
    logs_dir: PathBuf,

    jobs: JobTable,
}

impl ProcessLauncher {
    pub fn new(projects: HashMap<String, ProjectCommand>, logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            projects,
            logs_dir: logs_dir.into(),
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn update(jobs: &JobTable, job_id: &JobId, f: impl FnOnce(&mut TrackedJob)) {
        let mut table = jobs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tracked) = table.get_mut(job_id) {
            f(tracked);
        }
    }

    fn prune_finished(&self) {
        let cutoff = Utc::now() - chrono::Duration::minutes(FINISHED_RETENTION_MINUTES);
        let mut table = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        table.retain(|_, tracked| match tracked.job.finished_at {
            Some(finished_at) => !tracked.job.status.is_terminal() || finished_at > cutoff,
            None => true,
        });
    }

    /// Number of jobs currently tracked
    pub fn tracked_jobs(&self) -> usize {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl BuildLauncher for ProcessLauncher {
    fn name(&self) -> &str {
        "process"
    }

    async fn start(&self, spec: &JobSpec) -> Result<JobId, LaunchError> {
        let command = self
            .projects
            .get(&spec.project)
            .ok_or_else(|| LaunchError::UnknownProject(spec.project.clone()))?;

        self.prune_finished();

        tokio::fs::create_dir_all(&self.logs_dir)
            .await
            .map_err(|e| LaunchError::Backend(format!("cannot create log directory: {}", e)))?;

        let suffix = Uuid::new_v4();
        let job_id = JobId::new(format!("{}:{}", spec.project, suffix));
        let log_path = self.logs_dir.join(format!("{}.log", suffix));

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&spec.variables)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|e| LaunchError::Rejected {
            project: spec.project.clone(),
            message: format!("failed to spawn '{}': {}", command.program, e),
        })?;

        let mut job = BuildJob::pending(job_id.clone(), spec.project.clone());
        job.status = BuildStatus::Running;
        job.logs_ref = Some(log_path.display().to_string());

        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id.clone(), TrackedJob { job, abort: None });

        let jobs = Arc::clone(&self.jobs);
        let id = job_id.clone();
        let task = tokio::spawn(async move {
            let output = child.wait_with_output().await;
            finish(&jobs, &id, output, log_path).await;
        });

        let abort = task.abort_handle();
        Self::update(&self.jobs, &job_id, |tracked| tracked.abort = Some(abort));

        info!(job_id = %job_id, program = %command.program, "Build process started");
        Ok(job_id)
    }

    async fn poll(&self, job_id: &JobId) -> Result<BuildJob> {
        let mut table = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let job = table
            .get(job_id)
            .map(|tracked| tracked.job.clone())
            .with_context(|| format!("Unknown build job: {}", job_id))?;

        if job.status.is_terminal() {
            table.remove(job_id);
        }
        Ok(job)
    }

    async fn cancel(&self, job_id: &JobId) -> Result<()> {
        let mut table = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let tracked = table
            .get_mut(job_id)
            .with_context(|| format!("Unknown build job: {}", job_id))?;

        if tracked.job.status.is_terminal() {
            return Ok(());
        }

        // Dropping the waiting task drops the child, which kills it.
        if let Some(abort) = tracked.abort.take() {
            abort.abort();
        }
        tracked.job.status = BuildStatus::Failed;
        tracked.job.finished_at = Some(Utc::now());
        tracked.job.error = Some("cancelled".to_string());

        info!(job_id = %job_id, "Build process cancelled");
        Ok(())
    }
}

async fn finish(
    jobs: &JobTable,
    job_id: &JobId,
    output: std::io::Result<Output>,
    log_path: PathBuf,
) {
    let (status, result, error, log) = match output {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let log = format!("{}{}", stdout, stderr);

            if output.status.success() {
                (BuildStatus::Succeeded, parse_outputs(&stdout), None, log)
            } else {
                let exit_code = output.status.code().unwrap_or(-1);
                let last_line = stderr.lines().last().unwrap_or_default().trim().to_string();
                let error = format!("exit code {}: {}", exit_code, last_line);
                (BuildStatus::Failed, BTreeMap::new(), Some(error), log)
            }
        }
        Err(e) => {
            let error = format!("failed to wait for build process: {}", e);
            (BuildStatus::Failed, BTreeMap::new(), Some(error.clone()), error)
        }
    };

    if let Err(e) = tokio::fs::write(&log_path, log).await {
        warn!(path = %log_path.display(), error = %e, "Failed to write build log");
    }

    ProcessLauncher::update(jobs, job_id, |tracked| {
        if tracked.job.status.is_terminal() {
            return;
        }
        tracked.job.status = status;
        tracked.job.finished_at = Some(Utc::now());
        tracked.job.result = result;
        tracked.job.error = error;
        tracked.abort = None;
    });

    debug!(job_id = %job_id, %status, "Build process finished");
}

/// Collect `NAME=VALUE` lines where NAME is an upper-case identifier
pub fn parse_outputs(stdout: &str) -> BTreeMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().split_once('='))
        .filter(|(name, _)| is_output_name(name))
        .map(|(name, value)| (name.to_string(), value.trim().to_string()))
        .collect()
}

fn is_output_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}
