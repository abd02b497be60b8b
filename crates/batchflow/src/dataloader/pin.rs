//! src/dataloader/pin.rs
//!
//! The pin stage: an in-process thread that applies a [`PinMemory`]
//! transform to every batch before the consumer sees it.
//!
//! ```text
//!  worker results ──> [dataloader-pin] ──pin(batch)──> reorder buffer ──> consumer
//! ```
//!
//! Envelopes keep their sequence numbers, so batches pinned out of order are
//! still delivered in sampling order. With `num_workers = 0` the transform is
//! applied inline instead and no thread is started.

use crate::dataloader::shutdown::ShutdownToken;
use crate::dataloader::workers::routine::panic_message;
use crate::dataloader::workers::{Payload, WorkerEvent, TEARDOWN_POLL_MS};
use crate::error::{FailureKind, WorkerFailure};
use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// A transform that moves a batch into memory suited to the batch's consumer
/// (page-locked host memory in front of an accelerator, for instance).
///
/// Runs in the consumer process, so it may touch process-local resources.
pub trait PinMemory<B>: Send + Sync {
    fn pin(&self, batch: B) -> Result<B>;
}

/// Leaves batches untouched. Used when `pin_memory` is enabled without a
/// transform.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPin;

impl<B> PinMemory<B> for NoopPin {
    fn pin(&self, batch: B) -> Result<B> {
        Ok(batch)
    }
}

impl<B, F> PinMemory<B> for F
where
    F: Fn(B) -> Result<B> + Send + Sync,
{
    fn pin(&self, batch: B) -> Result<B> {
        self(batch)
    }
}

pub(crate) struct PinStage {
    handle: Option<thread::JoinHandle<()>>,
}

impl PinStage {
    pub(crate) fn spawn<B: Send + 'static>(
        pinner: Arc<dyn PinMemory<B>>,
        input: Receiver<WorkerEvent<B>>,
        capacity: usize,
        token: ShutdownToken,
        poll: Duration,
    ) -> Result<(Self, Receiver<WorkerEvent<B>>)> {
        let (output_tx, output_rx) = bounded(capacity);
        let handle = thread::Builder::new()
            .name("dataloader-pin".to_owned())
            .spawn(move || pin_loop(pinner.as_ref(), &input, &output_tx, &token, poll))
            .context("Failed to spawn pin memory thread")?;
        Ok((
            Self {
                handle: Some(handle),
            },
            output_rx,
        ))
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Waits up to `grace` for the thread to observe shutdown, then joins it.
    ///
    /// Threads cannot be killed. A thread still stuck inside the user's
    /// transform after `grace` is detached: the pass is torn down, but that
    /// thread lives on until the transform returns, then exits without
    /// delivering anything.
    pub(crate) fn join(&mut self, grace: Duration) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let deadline = Instant::now() + grace;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(TEARDOWN_POLL_MS));
        }
        if handle.is_finished() {
            if handle.join().is_err() {
                tracing::debug!("pin memory thread had panicked");
            }
        } else {
            tracing::warn!("pin memory thread did not stop within the grace period, detaching it");
        }
    }
}

fn pin_loop<B>(
    pinner: &dyn PinMemory<B>,
    input: &Receiver<WorkerEvent<B>>,
    output: &Sender<WorkerEvent<B>>,
    token: &ShutdownToken,
    poll: Duration,
) {
    while token.is_running() {
        let event = match input.recv_timeout(poll) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };

        let event = match event {
            WorkerEvent::Envelope(mut envelope) => {
                if let Payload::Batch(batch) = envelope.payload {
                    envelope.payload = pin_payload(pinner, batch, envelope.worker_id);
                }
                WorkerEvent::Envelope(envelope)
            }
            disconnected => disconnected,
        };

        if !forward(output, event, token, poll) {
            return;
        }
    }
}

fn pin_payload<B>(pinner: &dyn PinMemory<B>, batch: B, worker_id: usize) -> Payload<B> {
    match panic::catch_unwind(AssertUnwindSafe(|| pinner.pin(batch))) {
        Ok(Ok(pinned)) => Payload::Batch(pinned),
        Ok(Err(e)) => Payload::Failed(WorkerFailure {
            kind: FailureKind::Pin,
            message: format!("{e:#}"),
            worker_id: Some(worker_id),
        }),
        Err(panic) => Payload::Failed(WorkerFailure {
            kind: FailureKind::Pin,
            message: panic_message(panic.as_ref()),
            worker_id: Some(worker_id),
        }),
    }
}

/// Sends without blocking past a shutdown.
fn forward<B>(
    output: &Sender<WorkerEvent<B>>,
    mut event: WorkerEvent<B>,
    token: &ShutdownToken,
    poll: Duration,
) -> bool {
    loop {
        if !token.is_running() {
            return false;
        }
        match output.send_timeout(event, poll) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(returned)) => event = returned,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}
