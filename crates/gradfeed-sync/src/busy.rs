//! Single-flight guard for ingestion runs.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Where the current run is. `Idle` means no run holds the guard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Idle,
    Claiming,
    Fetching,
    Cleaning,
    Enriching,
    Loading,
    Releasing,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Idle => "idle",
            RunPhase::Claiming => "claiming",
            RunPhase::Fetching => "fetching",
            RunPhase::Cleaning => "cleaning",
            RunPhase::Enriching => "enriching",
            RunPhase::Loading => "loading",
            RunPhase::Releasing => "releasing",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned instead of queueing when a run is already in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[error("an ingestion run is already in progress (phase: {phase})")]
pub struct BusyConflict {
    pub phase: RunPhase,
}

/// Process-wide busy flag. Cloning shares the same flag.
#[derive(Debug, Clone, Default)]
pub struct BusyState {
    phase: Arc<Mutex<RunPhase>>,
}

impl BusyState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_busy(&self) -> bool {
        self.phase() != RunPhase::Idle
    }

    /// Atomically claims the flag. On conflict the current run is left untouched.
    pub fn try_acquire(&self) -> Result<RunGuard, BusyConflict> {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *phase != RunPhase::Idle {
            return Err(BusyConflict { phase: *phase });
        }
        *phase = RunPhase::Claiming;
        Ok(RunGuard {
            state: self.clone(),
        })
    }

    fn set(&self, next: RunPhase) {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        let from = *phase;
        debug!(%from, to = %next, "run phase");
        *phase = next;
    }
}

/// Proof of holding the busy flag. Dropping it returns the flag to `Idle`,
/// whether the run finished, returned an error or panicked.
#[must_use = "the run is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct RunGuard {
    state: BusyState,
}

impl RunGuard {
    pub fn advance(&self, phase: RunPhase) {
        self.state.set(phase);
    }

    pub fn phase(&self) -> RunPhase {
        self.state.phase()
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.state.set(RunPhase::Releasing);
        self.state.set(RunPhase::Idle);
    }
}
