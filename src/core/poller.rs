//! Poll-to-terminal loop for build jobs.
//!
//! Polls with bounded exponential backoff until the job reaches a terminal
//! status, the stage timeout elapses, or the run is cancelled.

use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, warn};

use crate::adapters::BuildLauncher;
use crate::domain::{BuildJob, BuildStatus, JobId};

use super::cancel::CancelToken;
use super::pipeline::PollPolicy;

/// Why polling stopped without a terminal status
#[derive(Debug, Error)]
pub enum PollError {
    #[error("Build {job_id} not finished after {}s (last status {last_status})", .elapsed.as_secs())]
    Timeout {
        job_id: JobId,
        elapsed: Duration,
        last_status: BuildStatus,
    },

    #[error("Polling of build {job_id} cancelled (last status {last_status})")]
    Cancelled {
        job_id: JobId,
        last_status: BuildStatus,
    },

    #[error("Lost track of build {job_id} after {errors} failed polls: {last_error}")]
    Backend {
        job_id: JobId,
        errors: u32,
        last_error: String,
    },
}

/// Poll `job_id` until it is terminal, `timeout` elapses, or `cancel` fires.
///
/// Each poll call is itself bounded by the stage deadline and interrupted
/// by cancellation, so a stalled backend cannot outlive the stage.
pub async fn wait_for_terminal(
    launcher: &dyn BuildLauncher,
    job_id: &JobId,
    policy: &PollPolicy,
    timeout: Duration,
    mut cancel: Option<&mut CancelToken>,
) -> Result<BuildJob, PollError> {
    let started = Instant::now();
    let deadline = started + timeout;
    let mut attempt = 0u32;
    let mut consecutive_errors = 0u32;
    let mut last_status = BuildStatus::Pending;

    loop {
        if cancel.as_deref().is_some_and(CancelToken::is_cancelled) {
            return Err(PollError::Cancelled {
                job_id: job_id.clone(),
                last_status,
            });
        }

        let poll = timeout_at(deadline, launcher.poll(job_id));
        let polled = match cancel.as_deref_mut() {
            Some(token) => {
                tokio::select! {
                    polled = poll => polled,
                    _ = token.cancelled() => {
                        return Err(PollError::Cancelled {
                            job_id: job_id.clone(),
                            last_status,
                        });
                    }
                }
            }
            None => poll.await,
        };

        let polled = match polled {
            Ok(polled) => polled,
            Err(_) => {
                warn!(%job_id, "Build poll did not answer before the stage deadline");
                return Err(PollError::Timeout {
                    job_id: job_id.clone(),
                    elapsed: Instant::now() - started,
                    last_status,
                });
            }
        };

        match polled {
            Ok(job) => {
                consecutive_errors = 0;
                last_status = job.status;
                if job.status.is_terminal() {
                    debug!(%job_id, status = %job.status, attempts = attempt + 1, "Build reached terminal status");
                    return Ok(job);
                }
            }
            Err(e) => {
                consecutive_errors += 1;
                if consecutive_errors >= policy.max_poll_errors {
                    return Err(PollError::Backend {
                        job_id: job_id.clone(),
                        errors: consecutive_errors,
                        last_error: format!("{:#}", e),
                    });
                }
                warn!(%job_id, errors = consecutive_errors, error = %e, "Build poll failed");
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PollError::Timeout {
                job_id: job_id.clone(),
                elapsed: now - started,
                last_status,
            });
        }

        attempt += 1;
        let delay = policy.interval_for_attempt(attempt).min(deadline - now);
        debug!(%job_id, status = %last_status, delay_ms = delay.as_millis() as u64, "Waiting for build");

        match cancel.as_deref_mut() {
            Some(token) => {
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = token.cancelled() => {
                        return Err(PollError::Cancelled {
                            job_id: job_id.clone(),
                            last_status,
                        });
                    }
                }
            }
            None => sleep(delay).await,
        }
    }
}
