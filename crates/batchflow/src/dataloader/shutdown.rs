//! Shared shutdown signal for one pipeline instance.
//!
//! The token only ever moves forward:
//! `Running -> ShuttingDown -> Terminated`. Every thread that belongs to a
//! pipeline (thread workers, the pin stage, the orchestrator) holds a clone
//! and checks it between blocking waits.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const RUNNING: u8 = 0;
const SHUTTING_DOWN: u8 = 1;
const TERMINATED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Running,
    ShuttingDown,
    Terminated,
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    state: Arc<AtomicU8>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PipelineState {
        match self.state.load(Ordering::Acquire) {
            RUNNING => PipelineState::Running,
            SHUTTING_DOWN => PipelineState::ShuttingDown,
            _ => PipelineState::Terminated,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    /// Moves `Running -> ShuttingDown`. Returns `true` only for the caller
    /// that made the transition, so teardown runs once.
    pub fn begin_shutdown(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, SHUTTING_DOWN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn mark_terminated(&self) {
        self.state.fetch_max(TERMINATED, Ordering::AcqRel);
    }
}
