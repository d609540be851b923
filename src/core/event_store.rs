//! Append-only event store with file-based persistence.
//!
//! One JSONL log per run at `{runs_dir}/{run_id}/events.jsonl`. A run's
//! state is never stored directly; it is the fold of this log.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

use crate::domain::{Event, EventType};

/// Event log of a single run
pub struct EventStore {
    run_dir: PathBuf,
    events_path: PathBuf,
}

impl EventStore {
    /// Create or open the event store of a run
    pub async fn open(runs_dir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = runs_dir.join(run_id.to_string());

        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;

        let events_path = run_dir.join("events.jsonl");

        Ok(Self {
            run_dir,
            events_path,
        })
    }

    /// Open the store of an existing run without creating anything
    pub async fn open_existing(runs_dir: &Path, run_id: Uuid) -> Result<Option<Self>> {
        let run_dir = runs_dir.join(run_id.to_string());
        let events_path = run_dir.join("events.jsonl");

        if !fs::try_exists(&events_path).await? {
            return Ok(None);
        }

        Ok(Some(Self {
            run_dir,
            events_path,
        }))
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Append an event to the log and sync it to disk.
    ///
    /// The line is written with a single `write_all` on an `O_APPEND`
    /// handle, so appends from a second process (cancel requests) never
    /// interleave with the run's own writes.
    pub async fn append(&self, event: &Event) -> Result<()> {
        let mut line = serde_json::to_vec(event).context("Failed to serialize event")?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        file.write_all(&line)
            .await
            .with_context(|| format!("Failed to append to {}", self.events_path.display()))?;
        file.sync_data().await.context("Failed to sync event log")?;

        Ok(())
    }

    /// Replay all events in append order.
    ///
    /// A torn final line (the writer died mid-append) is dropped; a bad line
    /// anywhere else is an error.
    pub async fn replay(&self) -> Result<Vec<Event>> {
        let content = match fs::read_to_string(&self.events_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read events file: {}", self.events_path.display())
                })
            }
        };

        let complete = content.ends_with('\n');
        let lines: Vec<&str> = content.lines().collect();
        let mut events = Vec::with_capacity(lines.len());

        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(line) {
                Ok(event) => events.push(event),
                Err(e) if !complete && index + 1 == lines.len() => {
                    warn!(path = %self.events_path.display(), error = %e, "Ignoring torn last event");
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("{}: line {} is not a valid event", self.events_path.display(), index + 1)
                    })
                }
            }
        }

        Ok(events)
    }

    /// Whether an event of the given type has been recorded
    pub async fn has_event(&self, event_type: EventType) -> Result<bool> {
        Ok(self.last_event_of_type(event_type).await?.is_some())
    }

    /// Most recent event of a type
    pub async fn last_event_of_type(&self, event_type: EventType) -> Result<Option<Event>> {
        let events = self.replay().await?;
        Ok(events.into_iter().rev().find(|e| e.event_type == event_type))
    }

    /// Ids of every run directory under `runs_dir`, in no particular order
    pub async fn list_runs(runs_dir: &Path) -> Result<Vec<Uuid>> {
        let mut entries = match fs::read_dir(runs_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to read runs directory"),
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let run_id = entry.file_name().to_str().and_then(|name| Uuid::parse_str(name).ok());
            runs.extend(run_id);
        }

        Ok(runs)
    }
}

/// Idempotency key `{run_id}:{scope}:{hash}` of an event
pub fn generate_idempotency_key(run_id: Uuid, scope: &str, input: &str) -> String {
    format!("{}:{}:{}", run_id, scope, hash_input(input))
}

/// First 8 bytes of the SHA-256 of `input`, hex encoded
pub fn hash_input(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}
