//! Single-flight control: at most one active run per model family.
//!
//! An in-process registry tracks the active run and its cancel handle; an
//! exclusive advisory lock on `{locks_dir}/{family}.lock` extends the rule
//! across processes. Both are released when the guard is dropped.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use fs2::FileExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::cancel::CancelHandle;

struct ActiveFlight {
    run_id: Uuid,
    cancel: CancelHandle,
}

type Registry = Arc<Mutex<HashMap<String, ActiveFlight>>>;

/// Outcome of trying to start a run for a family
pub enum Acquire {
    Acquired(FlightGuard),

    /// Another run holds the family; its id if known
    Busy(Option<Uuid>),
}

/// Tracks which family has an active run
#[derive(Clone)]
pub struct FlightControl {
    locks_dir: PathBuf,
    active: Registry,
}

impl FlightControl {
    pub fn new(locks_dir: impl Into<PathBuf>) -> Self {
        Self {
            locks_dir: locks_dir.into(),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveFlight>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the family for `run_id`, or report who holds it
    pub fn try_acquire(&self, family: &str, run_id: Uuid, cancel: CancelHandle) -> Result<Acquire> {
        let mut active = self.registry();

        if let Some(flight) = active.get(family) {
            return Ok(Acquire::Busy(Some(flight.run_id)));
        }

        std::fs::create_dir_all(&self.locks_dir).with_context(|| {
            format!("Failed to create locks directory: {}", self.locks_dir.display())
        })?;

        let lock_path = self.locks_dir.join(format!("{}.lock", family));
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                return Ok(Acquire::Busy(read_holder(&mut file)));
            }
            return Err(e).with_context(|| format!("Failed to lock {}", lock_path.display()));
        }

        file.set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)))
            .and_then(|_| file.write_all(run_id.to_string().as_bytes()))
            .and_then(|_| file.flush())
            .with_context(|| format!("Failed to record holder in {}", lock_path.display()))?;

        active.insert(family.to_string(), ActiveFlight { run_id, cancel });
        debug!(%family, %run_id, "Family claimed");

        Ok(Acquire::Acquired(FlightGuard {
            family: family.to_string(),
            run_id,
            lock: file,
            active: Arc::clone(&self.active),
        }))
    }

    /// Active run of a family in this process
    pub fn active_run(&self, family: &str) -> Option<Uuid> {
        self.registry().get(family).map(|f| f.run_id)
    }

    /// Cancel handle of a run active in this process
    pub fn cancel_handle(&self, run_id: Uuid) -> Option<CancelHandle> {
        self.registry()
            .values()
            .find(|f| f.run_id == run_id)
            .map(|f| f.cancel.clone())
    }
}

fn read_holder(file: &mut File) -> Option<Uuid> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut content).ok()?;
    Uuid::parse_str(content.trim()).ok()
}

/// Held for the lifetime of a run; releases the family on drop
pub struct FlightGuard {
    family: String,
    run_id: Uuid,
    lock: File,
    active: Registry,
}

impl FlightGuard {
    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.get(&self.family).map(|f| f.run_id) == Some(self.run_id) {
            active.remove(&self.family);
        }
        drop(active);

        if let Err(e) = self.lock.unlock() {
            warn!(family = %self.family, error = %e, "Failed to release family lock");
        }
        debug!(family = %self.family, run_id = %self.run_id, "Family released");
    }
}
