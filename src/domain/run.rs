//! Run state and reconstruction from events.
//!
//! A PipelineRun is one end-to-end execution of the retrain stages:
//! `INIT -> BUILDING_IMAGE -> DEPLOYING -> SUCCEEDED`, with `FAILED`
//! absorbing from any non-terminal state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::events::{Event, EventType, StepStatus};

/// The ordered stages of a retrain run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Rebuild and push the serving image
    BuildImage,

    /// Create or update the inference endpoint
    Deploy,
}

impl Stage {
    /// All stages in execution order
    pub const ALL: [Stage; 2] = [Stage::BuildImage, Stage::Deploy];

    pub fn index(&self) -> usize {
        match self {
            Self::BuildImage => 0,
            Self::Deploy => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BuildImage => "build_image",
            Self::Deploy => "deploy",
        }
    }

    /// Run state while this stage is executing
    pub fn running_state(&self) -> RunState {
        match self {
            Self::BuildImage => RunState::BuildingImage,
            Self::Deploy => RunState::Deploying,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run ended in FAILED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The build could not be started (configuration/permission issue)
    LaunchError,

    /// The build ran and reported failure
    BuildFailed,

    /// Polling exceeded the stage timeout
    BuildTimeout,

    /// The deployment call failed
    DeployFailed,

    /// The artifact store is missing the model or is inconsistent
    ArtifactStore,

    /// The caller cancelled the run
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LaunchError => "LaunchError",
            Self::BuildFailed => "BuildFailed",
            Self::BuildTimeout => "BuildTimeout",
            Self::DeployFailed => "DeployFailed",
            Self::ArtifactStore => "ArtifactStore",
            Self::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// State of the retrain state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum RunState {
    Init,
    BuildingImage,
    Deploying,
    Succeeded,
    Failed { reason: FailureReason, error: String },
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }

    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: &RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Init, BuildingImage)
                | (Init, Failed { .. })
                | (BuildingImage, Deploying)
                | (BuildingImage, Failed { .. })
                | (Deploying, Succeeded)
                | (Deploying, Failed { .. })
        )
    }

    /// Coarse status reported to callers
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Succeeded => RunStatus::Succeeded,
            Self::Failed { .. } => RunStatus::Failed,
            _ => RunStatus::Running,
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::Init
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => f.write_str("INIT"),
            Self::BuildingImage => f.write_str("BUILDING_IMAGE"),
            Self::Deploying => f.write_str("DEPLOYING"),
            Self::Succeeded => f.write_str("SUCCEEDED"),
            Self::Failed { reason, .. } => write!(f, "FAILED ({})", reason),
        }
    }
}

/// Overall status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

/// Outcome of one stage within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Build job backing the stage, if any
    pub job_id: Option<String>,

    /// Image reference the stage produced (build) or now serves (deploy)
    pub output: Option<String>,

    pub error: Option<String>,
}

/// A retrain pipeline execution run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Model family being retrained/redeployed
    pub family: String,

    /// Current state of the run
    pub state: RunState,

    pub started_at: DateTime<Utc>,

    /// When the run reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,

    /// Index of the current stage
    pub current_stage: usize,

    /// Ordered stage results
    pub stages: Vec<StageResult>,

    /// `{family}/{key}` of the snapshot the image was built from
    pub source_snapshot: Option<String>,

    /// Image reference produced by stage 1
    pub image_ref: Option<String>,

    /// A cancel request was recorded
    pub cancel_requested: bool,
}

impl PipelineRun {
    /// Create a new run for a family
    pub fn new(id: Uuid, family: String) -> Self {
        Self {
            id,
            family,
            state: RunState::Init,
            started_at: Utc::now(),
            completed_at: None,
            current_stage: 0,
            stages: Vec::new(),
            source_snapshot: None,
            image_ref: None,
            cancel_requested: false,
        }
    }

    /// Reconstruct run state from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first_event = events.first()?;

        let mut run = Self::new(first_event.run_id, first_event.family.clone());
        run.started_at = first_event.timestamp;

        for event in events {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state.
    ///
    /// Terminal states are absorbing: anything recorded after SUCCEEDED or
    /// FAILED is ignored.
    pub fn apply_event(&mut self, event: &Event) {
        if self.state.is_terminal() {
            return;
        }

        match event.event_type {
            EventType::RunStarted => {
                self.state = RunState::Init;
                self.started_at = event.timestamp;
            }
            EventType::SnapshotResolved => {
                self.source_snapshot = event.snapshot.clone();
            }
            EventType::StageStarted => {
                if let Some(stage) = event.stage {
                    if !self.transition(stage.running_state()) {
                        return;
                    }
                    self.current_stage = stage.index();
                    self.stages.push(StageResult {
                        stage,
                        status: StepStatus::Running,
                        started_at: event.timestamp,
                        finished_at: None,
                        job_id: None,
                        output: None,
                        error: None,
                    });
                }
            }
            EventType::BuildLaunched => {
                if let Some(result) = self.stage_result_mut(event.stage) {
                    result.job_id = event.job_id.clone();
                }
            }
            EventType::StageCompleted => {
                if event.stage == Some(Stage::BuildImage) {
                    self.image_ref = event.image_ref.clone();
                }
                let output = event.image_ref.clone();
                if let Some(result) = self.stage_result_mut(event.stage) {
                    result.status = StepStatus::Completed;
                    result.finished_at = Some(event.timestamp);
                    result.output = output;
                }
            }
            EventType::StageFailed => {
                if let Some(result) = self.stage_result_mut(event.stage) {
                    result.status = StepStatus::Failed;
                    result.finished_at = Some(event.timestamp);
                    result.error = event.error.clone();
                }
            }
            EventType::CancelRequested => {
                self.cancel_requested = true;
            }
            EventType::RunSucceeded => {
                if self.transition(RunState::Succeeded) {
                    self.completed_at = Some(event.timestamp);
                }
            }
            EventType::RunFailed => {
                let failed = RunState::Failed {
                    reason: event.reason.unwrap_or(FailureReason::BuildFailed),
                    error: event.error.clone().unwrap_or_default(),
                };
                if self.transition(failed) {
                    self.completed_at = Some(event.timestamp);
                }
            }
        }
    }

    fn transition(&mut self, next: RunState) -> bool {
        if !self.state.can_transition_to(&next) {
            warn!(run_id = %self.id, from = %self.state, to = %next, "Ignoring invalid transition");
            return false;
        }
        self.state = next;
        true
    }

    fn stage_result_mut(&mut self, stage: Option<Stage>) -> Option<&mut StageResult> {
        let stage = stage?;
        self.stages.iter_mut().rev().find(|r| r.stage == stage)
    }

    /// Result of a stage, if it has started
    pub fn stage_result(&self, stage: Stage) -> Option<&StageResult> {
        self.stages.iter().rev().find(|r| r.stage == stage)
    }

    pub fn status(&self) -> RunStatus {
        self.state.status()
    }

    pub fn is_running(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Stage currently (or last) executing
    pub fn current(&self) -> Option<Stage> {
        self.stages.last().map(|r| r.stage)
    }

    /// Failure reason, if the run failed
    pub fn reason(&self) -> Option<FailureReason> {
        match &self.state {
            RunState::Failed { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}
