//! Retrain orchestrator.
//!
//! Drives one `PipelineRun` per trigger through the state machine
//! INIT -> BUILDING_IMAGE -> DEPLOYING -> SUCCEEDED, with FAILED reachable
//! from every non-terminal state. Every transition is appended to the run's
//! event log before it is applied, so the status interface (a replay of the
//! log) always reflects the last known state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::BuildLauncher;
use crate::deploy::Deployer;
use crate::domain::{
    BuildStatus, Event, EventType, FailureReason, JobId, PipelineRun, Stage, StepStatus,
};
use crate::store::ArtifactStore;

use super::cancel::{cancel_pair, CancelHandle, CancelToken};
use super::event_store::{generate_idempotency_key, EventStore};
use super::flight::{Acquire, FlightControl};
use super::pipeline::Pipeline;
use super::poller::{wait_for_terminal, PollError};

/// How often a run checks its log for cancel requests from other processes
const DEFAULT_CANCEL_WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// Reasons a run could not be started
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("No pipeline defined for family '{0}'")]
    UnknownFamily(String),

    #[error(
        "Family '{family}' already has an active run{}",
        .run_id.map(|id| format!(" ({})", id)).unwrap_or_default()
    )]
    AlreadyRunning { family: String, run_id: Option<Uuid> },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Clone)]
struct Registered {
    pipeline: Arc<Pipeline>,
    deployer: Arc<dyn Deployer>,
}

/// A run that has been accepted and is executing in the background
pub struct RunTicket {
    pub run_id: Uuid,
    handle: JoinHandle<Result<PipelineRun>>,
}

impl RunTicket {
    /// Wait for the run to reach a terminal state
    pub async fn wait(self) -> Result<PipelineRun> {
        self.handle.await.context("Run task panicked")?
    }
}

/// Main retrain orchestrator
#[derive(Clone)]
pub struct Orchestrator {
    runs_dir: PathBuf,
    store: Arc<dyn ArtifactStore>,
    launcher: Arc<dyn BuildLauncher>,
    pipelines: HashMap<String, Registered>,
    flights: FlightControl,
    cancel_watch_interval: Duration,
}

impl Orchestrator {
    /// Create an orchestrator persisting runs under `runs_dir` and
    /// single-flight locks under `locks_dir`
    pub fn new(
        runs_dir: impl Into<PathBuf>,
        locks_dir: impl Into<PathBuf>,
        store: Arc<dyn ArtifactStore>,
        launcher: Arc<dyn BuildLauncher>,
    ) -> Self {
        Self {
            runs_dir: runs_dir.into(),
            store,
            launcher,
            pipelines: HashMap::new(),
            flights: FlightControl::new(locks_dir),
            cancel_watch_interval: DEFAULT_CANCEL_WATCH_INTERVAL,
        }
    }

    /// Register the pipeline of a family and its deployment backend
    pub fn with_pipeline(mut self, pipeline: Pipeline, deployer: Arc<dyn Deployer>) -> Self {
        self.pipelines.insert(
            pipeline.family.clone(),
            Registered {
                pipeline: Arc::new(pipeline),
                deployer,
            },
        );
        self
    }

    pub fn with_cancel_watch_interval(mut self, interval: Duration) -> Self {
        self.cancel_watch_interval = interval;
        self
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    pub fn launcher(&self) -> &dyn BuildLauncher {
        self.launcher.as_ref()
    }

    /// Registered families, sorted
    pub fn families(&self) -> Vec<&str> {
        let mut families: Vec<&str> = self.pipelines.keys().map(String::as_str).collect();
        families.sort_unstable();
        families
    }

    /// Run currently active for a family in this process
    pub fn active_run(&self, family: &str) -> Option<Uuid> {
        self.flights.active_run(family)
    }

    /// Start a run for `family` and return immediately.
    ///
    /// The `run_started` event is on disk when this returns, so the run id
    /// can be queried right away.
    #[instrument(skip(self))]
    pub async fn trigger(&self, family: &str) -> Result<RunTicket, TriggerError> {
        let registered = self
            .pipelines
            .get(family)
            .cloned()
            .ok_or_else(|| TriggerError::UnknownFamily(family.to_string()))?;

        let run_id = Uuid::new_v4();
        let (handle, token) = cancel_pair();

        let guard = match self.flights.try_acquire(family, run_id, handle.clone())? {
            Acquire::Acquired(guard) => guard,
            Acquire::Busy(active) => {
                warn!(%family, active = ?active, "Rejecting trigger, run already active");
                return Err(TriggerError::AlreadyRunning {
                    family: family.to_string(),
                    run_id: active,
                });
            }
        };

        let events = EventStore::open(&self.runs_dir, run_id).await?;
        let mut ctx = RunContext {
            run: PipelineRun::new(run_id, family.to_string()),
            events,
        };

        let start_event = Event::new(
            run_id,
            family,
            None,
            EventType::RunStarted,
            format!("{}:start", run_id),
            format!("Retrain of '{}' started", family),
            StepStatus::Running,
        );
        ctx.record(start_event).await?;
        info!(%run_id, %family, "Run accepted");

        let orchestrator = self.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            let watcher = watch_cancel_requests(
                orchestrator.runs_dir.clone(),
                run_id,
                handle,
                orchestrator.cancel_watch_interval,
            );

            let result = orchestrator.execute(&mut ctx, &registered, token).await;
            watcher.abort();

            if let Err(ref e) = result {
                error!(%run_id, error = %e, "Run aborted by an infrastructure failure");
            }
            result.map(|_| ctx.run)
        });

        Ok(RunTicket {
            run_id,
            handle: task,
        })
    }

    /// Trigger a run and wait for it to finish
    pub async fn run(&self, family: &str) -> Result<PipelineRun, TriggerError> {
        let ticket = self.trigger(family).await?;
        Ok(ticket.wait().await?)
    }

    /// Drive an accepted run to a terminal state
    #[instrument(skip_all, fields(run_id = %ctx.run.id, family = %ctx.run.family))]
    async fn execute(
        &self,
        ctx: &mut RunContext,
        registered: &Registered,
        mut token: CancelToken,
    ) -> Result<()> {
        let pipeline = registered.pipeline.as_ref();
        let family = pipeline.family.as_str();

        // INIT: resolve the snapshot the image will be built from
        let snapshot = match self.store.get_latest(family).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let message = format!("Could not resolve latest snapshot of '{}': {}", family, e);
                return ctx.fail(None, FailureReason::ArtifactStore, message, None).await;
            }
        };
        let reference = snapshot.reference();
        let resolved = ctx
            .event(
                None,
                EventType::SnapshotResolved,
                &reference,
                format!("Resolved latest snapshot {}", reference),
                StepStatus::Completed,
            )
            .with_snapshot(reference.clone());
        ctx.record(resolved).await?;

        if token.is_cancelled() {
            return ctx
                .fail(None, FailureReason::Cancelled, "Cancelled before image build".to_string(), None)
                .await;
        }

        // BUILDING_IMAGE
        let spec = pipeline.image_build_spec(snapshot.key);
        let stage_input = format!("{}:{}", spec.project, reference);
        let started = ctx.event(
            Some(Stage::BuildImage),
            EventType::StageStarted,
            &stage_input,
            format!("Building image with project '{}'", spec.project),
            StepStatus::Running,
        );
        ctx.record(started).await?;
        let stage_start = Instant::now();

        let job_id = match self.launcher.start(&spec).await {
            Ok(job_id) => job_id,
            Err(e) => {
                return ctx
                    .fail(Some(Stage::BuildImage), FailureReason::LaunchError, e.to_string(), Some(stage_start))
                    .await;
            }
        };
        let launched = ctx
            .event(
                Some(Stage::BuildImage),
                EventType::BuildLaunched,
                &stage_input,
                format!("Build {} launched on {}", job_id, self.launcher.name()),
                StepStatus::Running,
            )
            .with_job(job_id.as_str());
        ctx.record(launched).await?;
        info!(%job_id, project = %spec.project, "Image build launched");

        let outcome = wait_for_terminal(
            self.launcher.as_ref(),
            &job_id,
            &pipeline.poll,
            pipeline.stage_timeout(),
            Some(&mut token),
        )
        .await;

        let image_ref = match outcome {
            Ok(job) if job.status == BuildStatus::Succeeded => match job.image_ref() {
                Some(image_ref) => image_ref.to_string(),
                None => {
                    let message = format!("Build {} succeeded without an image reference", job_id);
                    return ctx
                        .fail(Some(Stage::BuildImage), FailureReason::BuildFailed, message, Some(stage_start))
                        .await;
                }
            },
            Ok(job) => {
                let mut message = job
                    .error
                    .unwrap_or_else(|| format!("Build {} finished as {}", job_id, job.status));
                if let Some(logs_ref) = &job.logs_ref {
                    message.push_str(&format!(" (logs: {})", logs_ref));
                }
                return ctx
                    .fail(Some(Stage::BuildImage), FailureReason::BuildFailed, message, Some(stage_start))
                    .await;
            }
            Err(e) => {
                self.cancel_job(&job_id).await;
                let reason = match e {
                    PollError::Timeout { .. } => FailureReason::BuildTimeout,
                    PollError::Cancelled { .. } => FailureReason::Cancelled,
                    PollError::Backend { .. } => FailureReason::BuildFailed,
                };
                return ctx
                    .fail(Some(Stage::BuildImage), reason, e.to_string(), Some(stage_start))
                    .await;
            }
        };

        let built = ctx
            .event(
                Some(Stage::BuildImage),
                EventType::StageCompleted,
                &stage_input,
                format!("Image {} built", image_ref),
                StepStatus::Completed,
            )
            .with_job(job_id.as_str())
            .with_image(image_ref.clone())
            .with_duration(elapsed_ms(stage_start));
        ctx.record(built).await?;

        // Last point at which a cancel request stops the run
        if token.is_cancelled() {
            return ctx
                .fail(None, FailureReason::Cancelled, "Cancelled before deployment".to_string(), None)
                .await;
        }

        // DEPLOYING
        let deployer = registered.deployer.as_ref();
        let started = ctx.event(
            Some(Stage::Deploy),
            EventType::StageStarted,
            &image_ref,
            format!("Deploying {} to '{}'", image_ref, deployer.endpoint()),
            StepStatus::Running,
        );
        ctx.record(started).await?;
        let stage_start = Instant::now();

        let deployed = match deployer.deploy(&image_ref).await {
            Ok(deployed) => deployed,
            Err(e) => {
                return ctx
                    .fail(Some(Stage::Deploy), FailureReason::DeployFailed, e.to_string(), Some(stage_start))
                    .await;
            }
        };

        let completed = ctx
            .event(
                Some(Stage::Deploy),
                EventType::StageCompleted,
                &image_ref,
                format!("Endpoint '{}' {}", deployed.deployment.endpoint, deployed.action),
                StepStatus::Completed,
            )
            .with_image(image_ref.clone())
            .with_duration(elapsed_ms(stage_start));
        ctx.record(completed).await?;

        let run_id = ctx.run.id;
        let succeeded = Event::new(
            run_id,
            family,
            None,
            EventType::RunSucceeded,
            format!("{}:complete", run_id),
            format!("Endpoint '{}' serves {}", deployer.endpoint(), image_ref),
            StepStatus::Completed,
        )
        .with_image(image_ref);
        ctx.record(succeeded).await?;

        info!(image_ref = ?ctx.run.image_ref, "Run succeeded");
        Ok(())
    }

    async fn cancel_job(&self, job_id: &JobId) {
        match self.launcher.cancel(job_id).await {
            Ok(()) => debug!(%job_id, "Build job cancelled"),
            Err(e) => warn!(%job_id, error = %e, "Failed to cancel build job"),
        }
    }

    /// Request cancellation of a run.
    ///
    /// Returns false when the run has already finished. Takes effect between
    /// polls; once deployment has begun the request is only recorded.
    #[instrument(skip(self))]
    pub async fn cancel(&self, run_id: Uuid) -> Result<bool> {
        let store = EventStore::open_existing(&self.runs_dir, run_id)
            .await?
            .with_context(|| format!("Run {} not found", run_id))?;

        let events = store.replay().await?;
        let run = PipelineRun::from_events(&events)
            .with_context(|| format!("Run {} has an empty log", run_id))?;

        if run.is_finished() {
            info!(state = %run.state, "Run already finished, nothing to cancel");
            return Ok(false);
        }

        let event = Event::new(
            run_id,
            run.family.as_str(),
            run.current(),
            EventType::CancelRequested,
            format!("{}:cancel", run_id),
            format!("Cancel requested in state {}", run.state),
            StepStatus::Running,
        );
        store.append(&event).await?;

        if let Some(handle) = self.flights.cancel_handle(run_id) {
            handle.cancel();
        }

        info!("Cancel requested");
        Ok(true)
    }

    /// Get status of a run by ID
    pub async fn status(&self, run_id: Uuid) -> Result<PipelineRun> {
        let store = EventStore::open_existing(&self.runs_dir, run_id)
            .await?
            .with_context(|| format!("Run {} not found", run_id))?;
        let events = store.replay().await?;

        PipelineRun::from_events(&events).context("Failed to reconstruct run state")
    }

    /// List recent runs, newest first
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<PipelineRun>> {
        let run_ids = EventStore::list_runs(&self.runs_dir).await?;
        let mut runs = Vec::new();

        for run_id in run_ids {
            match self.status(run_id).await {
                Ok(run) => runs.push(run),
                Err(e) => debug!(%run_id, error = %e, "Skipping unreadable run"),
            }
        }

        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);

        Ok(runs)
    }
}

/// Event log and folded state of the run being executed
struct RunContext {
    run: PipelineRun,
    events: EventStore,
}

impl RunContext {
    fn event(
        &self,
        stage: Option<Stage>,
        event_type: EventType,
        input: &str,
        summary: String,
        status: StepStatus,
    ) -> Event {
        let scope = stage.map(|s| s.as_str()).unwrap_or("run");
        Event::new(
            self.run.id,
            self.run.family.as_str(),
            stage,
            event_type,
            generate_idempotency_key(self.run.id, scope, input),
            summary,
            status,
        )
    }

    /// Append an event, then fold it into the in-memory run
    async fn record(&mut self, event: Event) -> Result<()> {
        self.events.append(&event).await?;
        self.run.apply_event(&event);
        Ok(())
    }

    /// Record a failed stage (if any) and the terminal failure of the run
    async fn fail(
        &mut self,
        stage: Option<Stage>,
        reason: FailureReason,
        message: String,
        stage_start: Option<Instant>,
    ) -> Result<()> {
        error!(?stage, %reason, error = %message, "Run failed");

        if let Some(stage) = stage {
            let mut failed = self
                .event(
                    Some(stage),
                    EventType::StageFailed,
                    &message,
                    format!("Stage {} failed: {}", stage, message),
                    StepStatus::Failed,
                )
                .with_error(message.clone())
                .with_reason(reason);
            if let Some(start) = stage_start {
                failed = failed.with_duration(elapsed_ms(start));
            }
            self.record(failed).await?;
        }

        let run_failed = Event::new(
            self.run.id,
            self.run.family.as_str(),
            stage,
            EventType::RunFailed,
            format!("{}:complete", self.run.id),
            format!("Run failed ({}): {}", reason, message),
            StepStatus::Failed,
        )
        .with_error(message)
        .with_reason(reason);
        self.record(run_failed).await
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Relay `cancel_requested` events written by other processes
fn watch_cancel_requests(
    runs_dir: PathBuf,
    run_id: Uuid,
    handle: CancelHandle,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(every).await;
            if handle.is_cancelled() {
                return;
            }

            let store = match EventStore::open_existing(&runs_dir, run_id).await {
                Ok(Some(store)) => store,
                Ok(None) => continue,
                Err(e) => {
                    debug!(%run_id, error = %e, "Cancel watch could not open run log");
                    continue;
                }
            };

            match store.has_event(EventType::CancelRequested).await {
                Ok(true) => {
                    info!(%run_id, "Cancel request found in run log");
                    handle.cancel();
                    return;
                }
                Ok(false) => {}
                Err(e) => debug!(%run_id, error = %e, "Cancel watch could not read run log"),
            }
        }
    })
}
