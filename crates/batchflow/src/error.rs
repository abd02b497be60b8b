use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Errors raised by the loading pipeline itself.
///
/// User errors (a failing `Dataset::get`, a collate closure returning `Err`)
/// travel as `anyhow::Error`. In synchronous mode they reach the caller
/// untouched; from a worker they arrive wrapped in [`LoaderError::WorkerFetch`]
/// because the original error value cannot cross a process boundary.
///
/// Callers recover the variant with `err.downcast_ref::<LoaderError>()`.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("invalid DataLoader configuration: {0}")]
    Configuration(String),

    #[error("{0}")]
    WorkerFetch(WorkerFailure),

    #[error(
        "DataLoader worker {worker_id}{} exited unexpectedly: {reason}",
        describe_pid(.pid)
    )]
    WorkerCrashed {
        worker_id: usize,
        pid: Option<u32>,
        reason: String,
    },

    #[error("DataLoader timed out after {after:?} waiting for a batch from its workers")]
    Timeout { after: Duration },

    #[error("DataLoader result channel closed with {outstanding} batch(es) still outstanding")]
    ResultChannelClosed { outstanding: usize },
}

impl LoaderError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

fn describe_pid(pid: &Option<u32>) -> String {
    pid.map(|pid| format!(" (pid {pid})")).unwrap_or_default()
}

/// Stage of the pipeline a [`WorkerFailure`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// `Dataset::get` or the stream iterator returned an error.
    Fetch,
    /// The collator rejected the fetched samples.
    Collate,
    /// User code panicked inside the worker.
    Panic,
    /// The pin stage rejected a batch.
    Pin,
    /// A process worker could not serialize its batch for the consumer.
    Encode,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Fetch => "fetch",
            Self::Collate => "collate",
            Self::Panic => "panic",
            Self::Pin => "pin",
            Self::Encode => "encode",
        };
        f.write_str(name)
    }
}

/// A user-code failure captured inside a worker, flattened to text so it can
/// be framed back to the consumer process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub kind: FailureKind,
    pub message: String,
    pub worker_id: Option<usize>,
}

impl WorkerFailure {
    /// Captures `error` with its full context chain.
    pub fn new(kind: FailureKind, error: &anyhow::Error, worker_id: Option<usize>) -> Self {
        Self {
            kind,
            message: format!("{error:#}"),
            worker_id,
        }
    }

    pub fn panic(message: impl Into<String>, worker_id: Option<usize>) -> Self {
        Self {
            kind: FailureKind::Panic,
            message: message.into(),
            worker_id,
        }
    }

    pub fn encode(message: impl Into<String>, worker_id: Option<usize>) -> Self {
        Self {
            kind: FailureKind::Encode,
            message: message.into(),
            worker_id,
        }
    }
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.worker_id {
            Some(id) => write!(
                f,
                "Caught {} error in DataLoader worker {}: {}",
                self.kind, id, self.message
            ),
            None => write!(f, "Caught {} error in DataLoader: {}", self.kind, self.message),
        }
    }
}

/// Structural mismatches found by the default collation rules.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollateError {
    #[error("cannot collate an empty list of samples")]
    Empty,

    #[error("sample {position} is a {found}, but the batch started with a {expected}")]
    TypeMismatch {
        position: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error("tensor {position} has shape {found:?} ({found_dtype}), expected {expected:?} ({expected_dtype})")]
    TensorMismatch {
        position: usize,
        expected: Vec<usize>,
        found: Vec<usize>,
        expected_dtype: &'static str,
        found_dtype: &'static str,
    },

    #[error("sequence {position} has {found} elements, expected {expected}")]
    LengthMismatch {
        position: usize,
        expected: usize,
        found: usize,
    },

    #[error("mapping {position} has keys {found:?}, expected {expected:?}")]
    KeyMismatch {
        position: usize,
        expected: Vec<String>,
        found: Vec<String>,
    },
}
