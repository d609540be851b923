//! Orchestrator Integration Tests
//!
//! Drives full runs against a filesystem artifact store, the endpoint
//! registry and a scripted build backend.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    fast_poll, iris_pipeline, snapshot_key, FailingDeployer, Harness, ScriptedLauncher, Step, IMAGE_URI,
    PRIOR_IMAGE_URI,
};
use retrain::adapters::LaunchError;
use retrain::core::{Orchestrator, PollPolicy, TriggerError};
use retrain::deploy::Deployer;
use retrain::domain::{
    BuildStatus, DeployAction, EventType, FailureReason, RunState, RunStatus, Stage, StepStatus,
};
use retrain::ml::{Dataset, DatasetSchema, TrainingConfig, TrainingStage};
use retrain::core::EventStore;
use retrain::store::ArtifactStore;
use uuid::Uuid;

async fn wait_for_launch(harness: &Harness, run_id: Uuid) {
    for _ in 0..500 {
        let run = harness.orchestrator.status(run_id).await.unwrap();
        if run.stage_result(Stage::BuildImage).and_then(|r| r.job_id.as_ref()).is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("build of run {} never launched", run_id);
}

fn iris_csv() -> String {
    let mut csv = String::from("Id,SepalLengthCm,SepalWidthCm,PetalLengthCm,PetalWidthCm,Species\n");
    let classes = [
        ("Iris-setosa", [5.0, 3.4, 1.5, 0.2]),
        ("Iris-versicolor", [5.9, 2.8, 4.3, 1.3]),
        ("Iris-virginica", [6.6, 3.0, 5.6, 2.1]),
    ];
    let mut id = 1;
    for (label, base) in classes {
        for j in 0..10 {
            let jitter = (j as f64 - 4.5) * 0.02;
            csv.push_str(&format!(
                "{},{:.2},{:.2},{:.2},{:.2},{}\n",
                id,
                base[0] + jitter,
                base[1] - jitter,
                base[2] + jitter,
                base[3],
                label
            ));
            id += 1;
        }
    }
    csv
}

#[tokio::test]
async fn test_train_then_retrain_deploys_new_image() {
    let harness = Harness::new(ScriptedLauncher::succeeding(), iris_pipeline(fast_poll()));

    // Training publishes the snapshot the run must pick up
    let dataset = Dataset::from_csv(&iris_csv(), &DatasetSchema::default()).unwrap();
    let report = TrainingStage::new(harness.store.clone(), TrainingConfig::default())
        .run("iris", &dataset)
        .await
        .unwrap();

    let run = harness.orchestrator.run("iris").await.unwrap();

    assert_eq!(run.state, RunState::Succeeded);
    assert_eq!(run.status(), RunStatus::Succeeded);
    assert_eq!(run.image_ref.as_deref(), Some(IMAGE_URI));
    assert_eq!(run.source_snapshot, Some(format!("iris/{}", report.key)));
    assert!(run.completed_at.is_some());

    // Stage 1 received the resolved snapshot and the shared variables
    let starts = harness.launcher.starts.lock().unwrap().clone();
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].project, "inference-image-codebuild-project");
    assert_eq!(starts[0].variables["MODEL_FAMILY"], "iris");
    assert_eq!(starts[0].variables["MODEL_KEY"], report.key.to_string());
    assert_eq!(starts[0].variables["IMAGE_REPO_NAME"], "inference-ecr");
    assert_eq!(harness.launcher.polls(), 3);

    // The endpoint now serves the new image
    let deployed = harness.registry().current().await.unwrap().unwrap();
    assert_eq!(deployed.image_ref, IMAGE_URI);

    // Status is a replay of the log and agrees with the returned run
    let replayed = harness.orchestrator.status(run.id).await.unwrap();
    assert_eq!(replayed.state, RunState::Succeeded);
    assert_eq!(replayed.image_ref.as_deref(), Some(IMAGE_URI));
    assert_eq!(replayed.stages.len(), 2);
    assert!(replayed.stages.iter().all(|s| s.status == StepStatus::Completed));
}

#[tokio::test]
async fn test_event_log_records_every_transition() {
    let harness = Harness::new(ScriptedLauncher::succeeding(), iris_pipeline(fast_poll()));
    harness.publish(snapshot_key(0)).await;

    let run = harness.orchestrator.run("iris").await.unwrap();

    let store = EventStore::open_existing(harness.orchestrator.runs_dir(), run.id)
        .await
        .unwrap()
        .unwrap();
    let types: Vec<EventType> = store.replay().await.unwrap().iter().map(|e| e.event_type).collect();

    assert_eq!(
        types,
        vec![
            EventType::RunStarted,
            EventType::SnapshotResolved,
            EventType::StageStarted,
            EventType::BuildLaunched,
            EventType::StageCompleted,
            EventType::StageStarted,
            EventType::StageCompleted,
            EventType::RunSucceeded,
        ]
    );
}

#[tokio::test]
async fn test_redeploying_same_image_leaves_endpoint_unchanged() {
    let harness = Harness::new(ScriptedLauncher::succeeding(), iris_pipeline(fast_poll()));
    harness.publish(snapshot_key(0)).await;

    let first = harness.orchestrator.run("iris").await.unwrap();
    assert_eq!(first.state, RunState::Succeeded);
    let before = harness.registry().current().await.unwrap().unwrap();

    // The script has run out, so the second build succeeds immediately
    let second = harness.orchestrator.run("iris").await.unwrap();
    assert_eq!(second.state, RunState::Succeeded);

    let after = harness.registry().current().await.unwrap().unwrap();
    assert_eq!(after, before);

    let outcome = harness.registry().deploy(IMAGE_URI).await.unwrap();
    assert_eq!(outcome.action, DeployAction::Unchanged);
}

#[tokio::test]
async fn test_cold_start_fails_without_launching() {
    let harness = Harness::new(ScriptedLauncher::succeeding(), iris_pipeline(fast_poll()));

    let run = harness.orchestrator.run("iris").await.unwrap();

    assert_eq!(run.reason(), Some(FailureReason::ArtifactStore));
    assert!(run.stages.is_empty());
    assert_eq!(harness.launcher.start_count(), 0);
    assert!(harness.registry().current().await.unwrap().is_none());
}

#[tokio::test]
async fn test_launch_error_fails_run() {
    let launcher = ScriptedLauncher::failing_start(LaunchError::Rejected {
        project: "inference-image-codebuild-project".to_string(),
        message: "AccessDenied".to_string(),
    });
    let harness = Harness::new(launcher, iris_pipeline(fast_poll()));
    harness.publish(snapshot_key(0)).await;

    let run = harness.orchestrator.run("iris").await.unwrap();

    assert_eq!(run.reason(), Some(FailureReason::LaunchError));
    let stage = run.stage_result(Stage::BuildImage).unwrap();
    assert_eq!(stage.status, StepStatus::Failed);
    assert!(stage.error.as_deref().unwrap().contains("AccessDenied"));
    assert_eq!(harness.launcher.polls(), 0);
}

#[tokio::test]
async fn test_failed_build_never_deploys() {
    let launcher = ScriptedLauncher::new(vec![
        Step::Status(BuildStatus::Running),
        Step::FailedWithLogs("docker push denied", "build-logs/build-image-1.log"),
    ]);
    let harness = Harness::new(launcher, iris_pipeline(fast_poll()));
    harness.publish(snapshot_key(0)).await;

    // Endpoint already serving an earlier image
    let registry = harness.registry();
    registry.deploy(PRIOR_IMAGE_URI).await.unwrap();
    let before = std::fs::read(registry.record_path()).unwrap();

    let run = harness.orchestrator.run("iris").await.unwrap();

    match &run.state {
        RunState::Failed { reason, error } => {
            assert_eq!(*reason, FailureReason::BuildFailed);
            assert!(error.starts_with("docker push denied"), "error {:?}", error);
            assert!(error.contains("build-logs/build-image-1.log"), "error {:?}", error);
        }
        other => panic!("expected FAILED, got {}", other),
    }
    assert!(run.image_ref.is_none());
    assert!(run.stage_result(Stage::Deploy).is_none());

    // Record untouched, last_updated included
    assert_eq!(std::fs::read(registry.record_path()).unwrap(), before);
    assert_eq!(registry.current().await.unwrap().unwrap().image_ref, PRIOR_IMAGE_URI);
}

#[tokio::test]
async fn test_build_without_image_output_fails() {
    let harness = Harness::new(ScriptedLauncher::new(vec![Step::SucceededBare]), iris_pipeline(fast_poll()));
    harness.publish(snapshot_key(0)).await;

    let run = harness.orchestrator.run("iris").await.unwrap();

    assert_eq!(run.reason(), Some(FailureReason::BuildFailed));
    assert!(harness.registry().current().await.unwrap().is_none());
}

#[tokio::test]
async fn test_lost_build_backend_fails_run() {
    let harness = Harness::new(ScriptedLauncher::new(vec![Step::PollError]), iris_pipeline(fast_poll()));
    harness.publish(snapshot_key(0)).await;

    let run = harness.orchestrator.run("iris").await.unwrap();

    assert_eq!(run.reason(), Some(FailureReason::BuildFailed));
    assert_eq!(harness.launcher.polls(), 3);
    assert_eq!(harness.launcher.cancel_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_build_times_out_after_stage_timeout() {
    let mut harness = Harness::new(ScriptedLauncher::hanging(), iris_pipeline(PollPolicy::default()));
    harness.orchestrator = harness
        .orchestrator
        .clone()
        .with_cancel_watch_interval(Duration::from_secs(60));
    harness.publish(snapshot_key(0)).await;
    let registry = harness.registry();
    let prior = registry.deploy(PRIOR_IMAGE_URI).await.unwrap().deployment;

    let started = tokio::time::Instant::now();
    let run = harness.orchestrator.run("iris").await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(run.reason(), Some(FailureReason::BuildTimeout));
    assert!(elapsed >= Duration::from_secs(900), "gave up after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(960), "gave up after {:?}", elapsed);

    // The job is abandoned with a best-effort cancel and the endpoint keeps
    // serving its prior image
    assert_eq!(harness.launcher.cancel_count(), 1);
    assert!(run.stage_result(Stage::Deploy).is_none());
    assert_eq!(registry.current().await.unwrap(), Some(prior));
}

#[tokio::test]
async fn test_deploy_failure_keeps_latest_snapshot() {
    let harness = Harness::with_deployer(
        ScriptedLauncher::succeeding(),
        iris_pipeline(fast_poll()),
        Arc::new(FailingDeployer),
    );
    let key = harness.publish(snapshot_key(0)).await;

    let run = harness.orchestrator.run("iris").await.unwrap();

    assert_eq!(run.reason(), Some(FailureReason::DeployFailed));
    // Stage 1 completed before the deploy failed
    assert_eq!(run.image_ref.as_deref(), Some(IMAGE_URI));
    let deploy = run.stage_result(Stage::Deploy).unwrap();
    assert_eq!(deploy.status, StepStatus::Failed);
    assert!(deploy.error.as_deref().unwrap().contains("AccessDenied"));

    let pointer = harness.store.latest_pointer("iris").await.unwrap();
    assert_eq!(pointer.target, key);
}

#[tokio::test]
async fn test_second_trigger_rejected_while_running() {
    let harness = Harness::new(ScriptedLauncher::hanging(), iris_pipeline(fast_poll()));
    harness.publish(snapshot_key(0)).await;

    let first = harness.orchestrator.trigger("iris").await.unwrap();
    assert_eq!(harness.orchestrator.active_run("iris"), Some(first.run_id));

    match harness.orchestrator.trigger("iris").await {
        Err(TriggerError::AlreadyRunning { family, run_id }) => {
            assert_eq!(family, "iris");
            assert_eq!(run_id, Some(first.run_id));
        }
        Err(e) => panic!("unexpected error: {}", e),
        Ok(ticket) => panic!("second run {} was accepted", ticket.run_id),
    }

    assert!(harness.orchestrator.cancel(first.run_id).await.unwrap());
    let run = first.wait().await.unwrap();
    assert_eq!(run.reason(), Some(FailureReason::Cancelled));

    // The family is free again once the run is terminal
    assert_eq!(harness.orchestrator.active_run("iris"), None);
    let next = harness.orchestrator.trigger("iris").await.unwrap();
    assert!(harness.orchestrator.cancel(next.run_id).await.unwrap());
    next.wait().await.unwrap();
}

#[tokio::test]
async fn test_cancel_while_polling() {
    let harness = Harness::new(ScriptedLauncher::hanging(), iris_pipeline(fast_poll()));
    harness.publish(snapshot_key(0)).await;

    let ticket = harness.orchestrator.trigger("iris").await.unwrap();
    let run_id = ticket.run_id;
    wait_for_launch(&harness, run_id).await;

    assert!(harness.orchestrator.cancel(run_id).await.unwrap());
    let run = ticket.wait().await.unwrap();

    assert_eq!(run.reason(), Some(FailureReason::Cancelled));
    assert!(run.cancel_requested);
    assert_eq!(harness.launcher.cancel_count(), 1);
    assert!(harness.registry().current().await.unwrap().is_none());

    // A finished run cannot be cancelled again
    assert!(!harness.orchestrator.cancel(run_id).await.unwrap());
}

#[tokio::test]
async fn test_cancel_from_another_orchestrator() {
    let harness = Harness::new(ScriptedLauncher::hanging(), iris_pipeline(fast_poll()));
    harness.publish(snapshot_key(0)).await;

    let ticket = harness.orchestrator.trigger("iris").await.unwrap();
    wait_for_launch(&harness, ticket.run_id).await;

    // Shares the run logs but not the in-process cancel handles
    let other = Orchestrator::new(
        harness.temp.path().join("runs"),
        harness.temp.path().join("other-locks"),
        harness.store.clone(),
        harness.launcher.clone(),
    );
    assert!(other.cancel(ticket.run_id).await.unwrap());

    let run = ticket.wait().await.unwrap();
    assert_eq!(run.reason(), Some(FailureReason::Cancelled));
}

#[tokio::test]
async fn test_unknown_family_rejected() {
    let harness = Harness::new(ScriptedLauncher::succeeding(), iris_pipeline(fast_poll()));

    let err = harness.orchestrator.trigger("mnist").await.err().unwrap();
    assert!(matches!(err, TriggerError::UnknownFamily(ref family) if family == "mnist"));
    assert!(EventStore::list_runs(harness.orchestrator.runs_dir())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_status_of_unknown_run() {
    let harness = Harness::new(ScriptedLauncher::succeeding(), iris_pipeline(fast_poll()));

    let err = harness.orchestrator.status(Uuid::new_v4()).await.unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[tokio::test]
async fn test_list_runs_newest_first() {
    let harness = Harness::new(ScriptedLauncher::succeeding(), iris_pipeline(fast_poll()));

    // Cold start: fails fast, which is all this test needs
    let first = harness.orchestrator.run("iris").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = harness.orchestrator.run("iris").await.unwrap();

    let runs = harness.orchestrator.list_runs(10).await.unwrap();
    let ids: Vec<Uuid> = runs.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![second.id, first.id]);

    let limited = harness.orchestrator.list_runs(1).await.unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].id, second.id);
}
