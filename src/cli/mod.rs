//! Command-line interface for retrain.
//!
//! Provides commands for triggering retrain runs, checking status, listing
//! and cancelling runs, and running the training and inference stages.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::adapters::{BuildLauncher, HttpLauncher, ProcessLauncher};
use crate::config::{self, BuilderBackend, ResolvedConfig};
use crate::core::{Orchestrator, Pipeline};
use crate::deploy;
use crate::domain::{PipelineRun, RunState, SnapshotKey};
use crate::ml::{Dataset, DatasetSchema, InferenceStage, TrainingConfig, TrainingStage};
use crate::store::{ArtifactStore, FsArtifactStore, ResultStore};

/// retrain - Model retrain and redeploy orchestrator
#[derive(Parser, Debug)]
#[command(name = "retrain")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Rebuild the serving image from the latest snapshot and redeploy
    Run {
        /// Model family (will look for pipelines/<family>.yaml)
        family: String,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,

        /// Print the run as JSON
        #[arg(long)]
        json: bool,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Cancel an active run (takes effect before deployment starts)
    Cancel {
        /// Run ID to cancel
        run_id: String,
    },

    /// Train a model and publish it as the family's latest snapshot
    Train {
        /// Model family
        family: String,

        /// Labelled CSV dataset
        #[arg(short, long)]
        data: PathBuf,

        /// Neighbours consulted per prediction
        #[arg(short, long, default_value = "3")]
        k: usize,
    },

    /// Score the held-out split and write a prediction result
    Infer {
        /// Model family
        family: String,

        /// Labelled CSV dataset
        #[arg(short, long)]
        data: PathBuf,

        /// Snapshot key to use instead of latest ("MM-DD-YYYY HH-MM-SS")
        #[arg(short, long)]
        snapshot: Option<String>,
    },

    /// List the snapshots of a family
    Snapshots {
        /// Model family
        family: String,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run { family } => run_family(&family).await,
            Commands::Status { run_id, json } => show_status(&run_id, json).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Cancel { run_id } => cancel_run(&run_id).await,
            Commands::Train { family, data, k } => train(&family, &data, k).await,
            Commands::Infer {
                family,
                data,
                snapshot,
            } => infer(&family, &data, snapshot.as_deref()).await,
            Commands::Snapshots { family } => list_snapshots(&family).await,
            Commands::Config => show_config().await,
        }
    }
}

/// Build launcher for the configured backend
pub fn build_launcher(cfg: &ResolvedConfig) -> Result<Arc<dyn BuildLauncher>> {
    match cfg.builder.backend {
        BuilderBackend::Process => Ok(Arc::new(ProcessLauncher::new(
            cfg.builder.projects.clone(),
            cfg.builds_dir(),
        ))),
        BuilderBackend::Http => {
            let base_url = cfg
                .builder
                .base_url
                .as_deref()
                .context("builder.base_url is required for the http backend")?;
            Ok(Arc::new(HttpLauncher::new(base_url)?))
        }
    }
}

fn artifact_store(cfg: &ResolvedConfig) -> Arc<dyn ArtifactStore> {
    Arc::new(FsArtifactStore::with_artifact_name(
        cfg.bucket_root(),
        cfg.store.artifact_name.clone(),
    ))
}

/// Orchestrator with every pipeline of the pipelines directory registered
pub fn build_orchestrator(cfg: &ResolvedConfig) -> Result<Orchestrator> {
    let launcher = build_launcher(cfg)?;
    let mut orchestrator = Orchestrator::new(
        cfg.runs_dir(),
        cfg.locks_dir(),
        artifact_store(cfg),
        launcher.clone(),
    );

    for pipeline in Pipeline::load_dir(&cfg.pipelines)? {
        let deployer = deploy::for_pipeline(&pipeline, launcher.clone(), &cfg.endpoints_dir());
        orchestrator = orchestrator.with_pipeline(pipeline, deployer);
    }

    Ok(orchestrator)
}

fn parse_run_id(run_id_str: &str) -> Result<Uuid> {
    Uuid::parse_str(run_id_str).with_context(|| format!("Invalid run ID: {}", run_id_str))
}

/// Trigger a run and wait for its outcome
async fn run_family(family: &str) -> Result<()> {
    let cfg = config::config()?;
    let orchestrator = build_orchestrator(cfg)?;

    let ticket = orchestrator.trigger(family).await?;
    eprintln!("[Run {} started for '{}']", ticket.run_id, family);

    let run = ticket.wait().await?;

    match &run.state {
        RunState::Succeeded => {
            if let Some(image_ref) = &run.image_ref {
                println!("{}", image_ref);
            }
            eprintln!("\n[Run {} succeeded]", run.id);
        }
        RunState::Failed { reason, error } => {
            eprintln!("\n[Run {} failed ({}): {}]", run.id, reason, error);
            std::process::exit(1);
        }
        state => {
            eprintln!("\n[Run {} in state: {}]", run.id, state);
        }
    }

    Ok(())
}

/// Show the status of a run
async fn show_status(run_id_str: &str, json: bool) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;

    let cfg = config::config()?;
    let orchestrator = build_orchestrator(cfg)?;
    let run = orchestrator.status(run_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }

    print_run(&run);
    Ok(())
}

fn print_run(run: &PipelineRun) {
    println!("Run ID: {}", run.id);
    println!("Family: {}", run.family);
    println!("State: {}", run.state);
    println!("Started: {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }
    if let Some(snapshot) = &run.source_snapshot {
        println!("Snapshot: {}", snapshot);
    }
    if let Some(image_ref) = &run.image_ref {
        println!("Image: {}", image_ref);
    }
    if run.cancel_requested {
        println!("Cancel requested: yes");
    }

    println!("\nStages:");
    for result in &run.stages {
        let mut line = format!("  {}: {:?}", result.stage, result.status);
        if let Some(job_id) = &result.job_id {
            line.push_str(&format!(" (job {})", job_id));
        }
        if let Some(error) = &result.error {
            line.push_str(&format!(" - {}", error));
        }
        println!("{}", line);
    }
}

/// List recent runs
async fn list_runs(limit: usize) -> Result<()> {
    let cfg = config::config()?;
    let orchestrator = build_orchestrator(cfg)?;
    let runs = orchestrator.list_runs(limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<16} {:<28} {:<20}", "RUN ID", "FAMILY", "STATE", "STARTED");
    println!("{}", "-".repeat(104));

    for run in runs {
        println!(
            "{:<38} {:<16} {:<28} {:<20}",
            run.id,
            run.family,
            run.state.to_string(),
            run.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// Cancel an active run
async fn cancel_run(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;

    let cfg = config::config()?;
    let orchestrator = build_orchestrator(cfg)?;

    if orchestrator.cancel(run_id).await? {
        eprintln!("[Cancel requested for run {}]", run_id);
    } else {
        eprintln!("[Run {} already finished]", run_id);
    }

    Ok(())
}

/// Train and publish a snapshot
async fn train(family: &str, data: &Path, k: usize) -> Result<()> {
    let cfg = config::config()?;
    let dataset = Dataset::load(data, &DatasetSchema::default())?;

    let config = TrainingConfig {
        k,
        ..Default::default()
    };
    let report = TrainingStage::new(artifact_store(cfg), config)
        .run(family, &dataset)
        .await?;

    println!("{}", report.key);
    eprintln!(
        "\n[Published {}/{} - accuracy {:.3} on {} held-out rows]",
        report.family, report.key, report.accuracy, report.test_size
    );

    Ok(())
}

/// Score the held-out split with a snapshot
async fn infer(family: &str, data: &Path, snapshot: Option<&str>) -> Result<()> {
    let cfg = config::config()?;
    let dataset = Dataset::load(data, &DatasetSchema::default())?;

    let snapshot = snapshot
        .map(|s| s.parse::<SnapshotKey>())
        .transpose()
        .context("Invalid snapshot key")?;

    let stage = InferenceStage::new(artifact_store(cfg), ResultStore::new(&cfg.results));
    let report = stage.run(family, &dataset, snapshot).await?;

    println!("{}", report.prediction_path.display());
    eprintln!(
        "\n[{} predictions from {} - accuracy {:.3}]",
        report.result.predictions.len(),
        report.result.source_snapshot,
        report.result.accuracy
    );

    Ok(())
}

/// List the snapshots of a family
async fn list_snapshots(family: &str) -> Result<()> {
    let cfg = config::config()?;
    let store = artifact_store(cfg);

    let keys = store.list_snapshots(family).await?;
    if keys.is_empty() {
        println!("No snapshots for '{}'", family);
        return Ok(());
    }

    let latest = match store.latest_pointer(family).await {
        Ok(pointer) => Some(pointer.target),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e.into()),
    };

    for key in keys {
        let marker = if Some(key) == latest { "  <- latest" } else { "" };
        println!("{}{}", key, marker);
    }

    Ok(())
}

/// Show resolved configuration
async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("Retrain Configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", cfg.home.display());
    println!("  Runs:                {}", cfg.runs_dir().display());
    println!("  Endpoints:           {}", cfg.endpoints_dir().display());
    println!("  Pipelines:           {}", cfg.pipelines.display());
    println!("  Artifact bucket:     {}", cfg.bucket_root().display());
    println!("  Results:             {}", cfg.results.display());
    println!();
    println!("Store:");
    println!("  Bucket:        {}", cfg.store.bucket);
    println!("  Artifact name: {}", cfg.store.artifact_name);
    println!();
    println!("Builder:");
    match cfg.builder.backend {
        BuilderBackend::Process => {
            println!("  Backend: process");
            let mut projects: Vec<_> = cfg.builder.projects.keys().collect();
            projects.sort();
            for project in projects {
                println!("  Project: {}", project);
            }
        }
        BuilderBackend::Http => {
            println!("  Backend: http");
            println!("  Base URL: {}", cfg.builder.base_url.as_deref().unwrap_or("(unset)"));
        }
    }
    println!();
    println!("Pipelines:");
    match Pipeline::load_dir(&cfg.pipelines) {
        Ok(pipelines) if pipelines.is_empty() => println!("  (none)"),
        Ok(pipelines) => {
            for pipeline in pipelines {
                println!(
                    "  {} -> {} (timeout {}s)",
                    pipeline.family, pipeline.endpoint, pipeline.stage_timeout_seconds
                );
            }
        }
        Err(e) => println!("  (invalid: {:#})", e),
    }

    Ok(())
}
