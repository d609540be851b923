//! Core orchestration logic.
//!
//! This module contains:
//! - EventStore: Append-only event logging per run
//! - Pipeline: Per-family pipeline definitions and loading
//! - Poller: Poll-to-terminal loop with backoff, timeout and cancellation
//! - FlightControl: One active run per family
//! - Orchestrator: The retrain state machine

pub mod cancel;
pub mod event_store;
pub mod flight;
pub mod orchestrator;
pub mod pipeline;
pub mod poller;

// Re-export commonly used types
pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use event_store::{generate_idempotency_key, hash_input, EventStore};
pub use flight::{Acquire, FlightControl, FlightGuard};
pub use orchestrator::{Orchestrator, RunTicket, TriggerError};
pub use pipeline::{BuildStage, DeployStage, Pipeline, PollPolicy};
pub use poller::{wait_for_terminal, PollError};
