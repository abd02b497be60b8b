//! Thread backend: each worker is a named thread fed through its own bounded
//! channel.
//!
//! Idle workers wake every `poll` interval to check the shutdown token, so a
//! worker blocked on a full result channel or an empty inbox still notices
//! teardown.

use crate::dataloader::shutdown::ShutdownToken;
use crate::dataloader::workers::pool::WorkerRuntime;
use crate::dataloader::workers::routine::{run_worker, WorkerContext, WorkerPort};
use crate::dataloader::workers::{ResultEnvelope, WorkerEvent, WorkerTask};
use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::thread;
use std::time::Duration;

struct ThreadPort<B> {
    inbox: Receiver<WorkerTask>,
    events: Sender<WorkerEvent<B>>,
    token: ShutdownToken,
    poll: Duration,
}

impl<B> WorkerPort<B> for ThreadPort<B> {
    fn recv(&mut self) -> Option<WorkerTask> {
        loop {
            if !self.token.is_running() {
                return None;
            }
            match self.inbox.recv_timeout(self.poll) {
                Ok(task) => return Some(task),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn send(&mut self, envelope: ResultEnvelope<B>) -> bool {
        let mut event = WorkerEvent::Envelope(envelope);
        loop {
            if !self.token.is_running() {
                return false;
            }
            match self.events.send_timeout(event, self.poll) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(returned)) => event = returned,
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}

pub(crate) struct ThreadWorker {
    id: usize,
    inbox: Option<Sender<WorkerTask>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ThreadWorker {
    pub(crate) fn spawn<B: Send + 'static>(
        ctx: WorkerContext<B>,
        events: Sender<WorkerEvent<B>>,
        token: ShutdownToken,
        inbox_capacity: usize,
        poll: Duration,
    ) -> Result<Self> {
        let id = ctx.info.id;
        let (task_tx, task_rx) = bounded(inbox_capacity);

        let handle = thread::Builder::new()
            .name(format!("dataloader-worker-{id}"))
            .spawn(move || {
                let mut port = ThreadPort {
                    inbox: task_rx,
                    events,
                    token,
                    poll,
                };
                run_worker(&ctx, &mut port);
            })
            .with_context(|| format!("Failed to spawn worker thread {id}"))?;

        Ok(Self {
            id,
            inbox: Some(task_tx),
            handle: Some(handle),
        })
    }
}

impl WorkerRuntime for ThreadWorker {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn send(&mut self, task: WorkerTask) -> Result<()> {
        let inbox = self
            .inbox
            .as_ref()
            .ok_or_else(|| anyhow!("worker {} is already stopping", self.id))?;
        inbox
            .send(task)
            .map_err(|_| anyhow!("worker {} is no longer accepting tasks", self.id))
    }

    fn exit_status(&mut self) -> Option<String> {
        match &self.handle {
            Some(handle) if handle.is_finished() => Some("worker thread terminated".to_owned()),
            Some(_) => None,
            None => Some("worker thread joined".to_owned()),
        }
    }

    fn request_stop(&mut self) {
        if let Some(inbox) = self.inbox.take() {
            let _ = inbox.try_send(WorkerTask::Shutdown);
        }
    }

    fn force_stop(&mut self) {
        // Threads cannot be killed. A thread stuck in user code is detached and
        // keeps running until that code returns; it then sees the token and exits.
        if let Some(handle) = self.handle.take() {
            tracing::warn!(
                worker_id = self.id,
                thread = ?handle.thread().name(),
                "worker thread did not stop within the grace period, detaching it"
            );
        }
    }

    fn reap(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::debug!(worker_id = self.id, "worker thread had panicked");
            }
        }
    }
}
