//! Worker management for parallel data loading.
//!
//! This module provides the abstractions for multi-worker data loading:
//! - `fetch`: Fetchers that turn one request into one batch
//! - `routine`: The worker loop shared by every backend
//! - `codec`: Length-prefixed frames for the process backend
//! - `process`: Forked worker processes (unix)
//! - `thread`: Worker threads
//! - `pool`: Owns a set of workers and their shutdown
//!
//! Workers speak one protocol regardless of backend: they receive
//! [`WorkerTask`]s and answer each `Fetch`/`Next` with exactly one
//! [`ResultEnvelope`] carrying the task's sequence number.

pub(crate) mod codec;
pub(crate) mod fetch;
pub(crate) mod pool;
#[cfg(unix)]
pub(crate) mod process;
pub(crate) mod routine;
pub(crate) mod thread;

use crate::error::WorkerFailure;
use serde::{Deserialize, Serialize};

/// Orchestrator -> worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum WorkerTask {
    /// Fetch and collate the samples at `indices`.
    Fetch { seq: u64, indices: Vec<usize> },
    /// Produce the next batch of this worker's stream.
    Next { seq: u64 },
    /// Stop after the current task.
    Shutdown,
}

/// Worker -> orchestrator, one per dispatched task.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ResultEnvelope<B> {
    pub(crate) seq: u64,
    pub(crate) worker_id: usize,
    pub(crate) payload: Payload<B>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum Payload<B> {
    Batch(B),
    /// The worker's stream has no more batches.
    Exhausted,
    Failed(WorkerFailure),
}

/// What the orchestrator reads off the shared result channel.
#[derive(Debug)]
pub(crate) enum WorkerEvent<B> {
    Envelope(ResultEnvelope<B>),
    /// A worker's connection closed before it was told to stop.
    Disconnected { worker_id: usize },
}

/// Granularity of the wait loops used while polling for shutdown and exits
/// during teardown (milliseconds)
pub(crate) const TEARDOWN_POLL_MS: u64 = 10;
