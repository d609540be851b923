//! Run log records.
//!
//! Each state change of a retrain run is one immutable `Event`; the run
//! itself is the fold of its events (see `PipelineRun::from_events`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::run::{FailureReason, Stage};

/// One line of a run's event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event id
    pub id: Uuid,

    /// Recorded at (RFC 3339 on disk)
    pub timestamp: DateTime<Utc>,

    pub run_id: Uuid,

    /// Model family the run retrains
    pub family: String,

    /// Stage this event concerns (if applicable)
    pub stage: Option<Stage>,

    pub event_type: EventType,

    /// Idempotency key format: "{run_id}:{stage}:{input_hash}"
    pub idempotency_key: String,

    /// Short operator-facing description; never carries credentials
    pub payload_summary: String,

    /// Current status of the stage/run
    pub status: StepStatus,

    /// Time taken in milliseconds (for finished stages)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Failure detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Structured failure reason (terminal failures only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,

    /// Build job the stage launched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    /// Image reference produced by the image build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,

    /// Snapshot reference the run was built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
}

impl Event {
    /// Event stamped with the current time
    pub fn new(
        run_id: Uuid,
        family: impl Into<String>,
        stage: Option<Stage>,
        event_type: EventType,
        idempotency_key: String,
        payload_summary: String,
        status: StepStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            family: family.into(),
            stage,
            event_type,
            idempotency_key,
            payload_summary,
            status,
            duration_ms: None,
            error: None,
            reason: None,
            job_id: None,
            image_ref: None,
            snapshot: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_reason(mut self, reason: FailureReason) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_image(mut self, image_ref: impl Into<String>) -> Self {
        self.image_ref = Some(image_ref.into());
        self
    }

    pub fn with_snapshot(mut self, snapshot: impl Into<String>) -> Self {
        self.snapshot = Some(snapshot.into());
        self
    }
}

/// Types of events that can occur during a retrain run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new run has been triggered (state INIT)
    RunStarted,

    /// The family's latest snapshot was resolved
    SnapshotResolved,

    /// A stage has started
    StageStarted,

    /// A build job was accepted by the backend
    BuildLaunched,

    /// A stage completed successfully
    StageCompleted,

    /// A stage failed
    StageFailed,

    /// The caller asked for the run to stop
    CancelRequested,

    /// The run reached SUCCEEDED
    RunSucceeded,

    /// The run reached FAILED
    RunFailed,
}

/// Status of a stage or run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = Event::new(
            Uuid::new_v4(),
            "iris",
            Some(Stage::BuildImage),
            EventType::StageStarted,
            "test-key".to_string(),
            "Starting image build".to_string(),
            StepStatus::Running,
        );

        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.event_type, EventType::StageStarted);
        assert_eq!(parsed.stage, Some(Stage::BuildImage));
        assert_eq!(parsed.status, StepStatus::Running);
        assert!(!json.contains("image_ref"));
    }

    #[test]
    fn test_event_with_failure_details() {
        let event = Event::new(
            Uuid::new_v4(),
            "iris",
            None,
            EventType::RunFailed,
            "test-key".to_string(),
            "Run failed".to_string(),
            StepStatus::Failed,
        )
        .with_reason(FailureReason::BuildTimeout)
        .with_error("no terminal status after 900s".to_string())
        .with_duration(900_000);

        assert_eq!(event.reason, Some(FailureReason::BuildTimeout));
        assert_eq!(event.duration_ms, Some(900_000));

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"reason\":\"build_timeout\""));
    }
}
