//! src/dataloader/iterator/multi.rs
//!
//! Parallel iteration (`num_workers > 0`): dispatches tasks to a worker pool
//! and hands batches back in sampling order.
//!
//! # Dispatch
//! The i-th task goes to worker `i % num_workers`, skipping workers whose
//! stream is exhausted. `prefetch_factor * num_workers` tasks are sent up
//! front; afterwards one new task is sent for every batch delivered, so the
//! number of undelivered tasks never exceeds that bound.
//!
//! # Collection
//! Results are parked in a [`PendingBuffer`] until every earlier sequence
//! number has been delivered. While waiting, the consumer wakes every
//! `status_check_interval` to look for dead workers and to enforce the
//! configured timeout.
//!
//! The timeout bounds the wait for each result, not for each pull: every
//! out-of-order arrival restarts it. A single `next()` can therefore block for
//! up to roughly `num_workers * prefetch_factor * timeout` when results keep
//! trickling in ahead of the one being waited for.
//!
//! # Termination
//! Exhaustion, `close()`, drop, a worker failure, a dead worker and a timeout
//! all end in [`MultiProcessIter::shutdown`], which runs at most once.

use super::reorder::PendingBuffer;
use super::{IndexPlan, IteratorConfig};
use crate::dataloader::config::DataLoaderConfig;
use crate::dataloader::pin::PinStage;
use crate::dataloader::shutdown::{PipelineState, ShutdownToken};
use crate::dataloader::workers::pool::{PoolOptions, WorkerPool};
use crate::dataloader::workers::routine::WorkerInitFn;
use crate::dataloader::workers::{
    Payload, ResultEnvelope, WorkerEvent, WorkerTask, TEARDOWN_POLL_MS,
};
use crate::error::LoaderError;
use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub(crate) struct MultiProcessIter<B> {
    pool: WorkerPool<B>,
    pin: Option<PinStage>,
    /// Pool results, or the pin stage's output when pinning.
    results: Receiver<WorkerEvent<B>>,
    plan: IndexPlan,
    buffer: PendingBuffer<ResultEnvelope<B>>,
    /// Dispatched tasks whose result has not arrived: seq -> worker_id
    outstanding: HashMap<u64, usize>,
    /// Workers that may still produce batches
    active: Vec<bool>,
    send_seq: u64,
    next_worker: usize,
    timeout: Option<Duration>,
    poll: Duration,
    grace: Duration,
    token: ShutdownToken,
}

impl<B> MultiProcessIter<B>
where
    B: Serialize + DeserializeOwned + Send + 'static,
{
    pub(crate) fn new(
        config: IteratorConfig<B>,
        loader_config: &DataLoaderConfig,
        init_fn: Option<WorkerInitFn>,
    ) -> Result<Self> {
        let token = ShutdownToken::new();
        let poll = loader_config.status_check_interval;
        let options = PoolOptions {
            num_workers: loader_config.num_workers,
            mode: loader_config.worker_mode,
            prefetch_factor: loader_config.prefetch_factor,
            poll,
            grace: loader_config.shutdown_grace,
            epoch: config.epoch,
            base_seed: config.runtime_seed,
            batching: config.batching,
            init_fn,
        };
        let pool = WorkerPool::spawn(Arc::clone(&config.factory), options, token.clone())
            .context("Failed to start DataLoader workers")?;

        let num_workers = pool.num_workers();
        let capacity = num_workers * (loader_config.prefetch_factor + 1);
        let (pin, results) = match config.pinner {
            Some(pinner) => {
                let (stage, output) =
                    PinStage::spawn(pinner, pool.events().clone(), capacity, token.clone(), poll)?;
                (Some(stage), output)
            }
            None => (None, pool.events().clone()),
        };

        let mut iter = Self {
            pool,
            pin,
            results,
            plan: config.plan,
            buffer: PendingBuffer::new(),
            outstanding: HashMap::new(),
            active: vec![true; num_workers],
            send_seq: 0,
            next_worker: 0,
            timeout: loader_config.timeout(),
            poll,
            grace: loader_config.shutdown_grace,
            token,
        };

        // Prime the pipeline
        for _ in 0..num_workers * loader_config.prefetch_factor {
            if !iter.try_dispatch()? {
                break;
            }
        }
        tracing::debug!(
            num_workers,
            epoch = config.epoch,
            in_flight = iter.outstanding.len(),
            "DataLoader workers primed"
        );
        Ok(iter)
    }

    /// Sends the next task to the next active worker. `Ok(false)` once there
    /// is nothing left to send.
    fn try_dispatch(&mut self) -> Result<bool> {
        let num_workers = self.active.len();
        let Some(worker_id) = (0..num_workers)
            .map(|offset| (self.next_worker + offset) % num_workers)
            .find(|&worker_id| self.active[worker_id])
        else {
            self.plan = IndexPlan::Done;
            return Ok(false);
        };

        let seq = self.send_seq;
        let task = match &mut self.plan {
            IndexPlan::Indexed(batches) => match batches.next() {
                Some(indices) => WorkerTask::Fetch { seq, indices },
                None => {
                    self.plan = IndexPlan::Done;
                    return Ok(false);
                }
            },
            IndexPlan::Stream => WorkerTask::Next { seq },
            IndexPlan::Done => return Ok(false),
        };

        // A send only fails once the worker's end of the connection is gone.
        if let Err(e) = self.pool.dispatch(worker_id, task) {
            tracing::debug!(worker_id, seq, error = %format!("{e:#}"), "failed to send task to worker");
            return Err(self.disconnected(worker_id));
        }
        self.outstanding.insert(seq, worker_id);
        self.send_seq += 1;
        self.next_worker = (worker_id + 1) % num_workers;
        Ok(true)
    }

    /// Blocks for the next worker event, waking every poll interval to check
    /// worker liveness and the timeout.
    fn wait_for_event(&mut self) -> Result<WorkerEvent<B>> {
        let deadline = self.timeout.map(|after| Instant::now() + after);
        loop {
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        let after = self.timeout.unwrap_or_default();
                        tracing::warn!(
                            ?after,
                            outstanding = self.outstanding.len(),
                            "timed out waiting for a batch from DataLoader workers"
                        );
                        return Err(LoaderError::Timeout { after }.into());
                    }
                    (deadline - now).min(self.poll)
                }
                None => self.poll,
            };

            match self.results.recv_timeout(wait) {
                Ok(event) => return Ok(event),
                Err(RecvTimeoutError::Timeout) => {
                    if let Some((worker_id, reason)) = self.pool.first_exited() {
                        return Err(self.crashed(worker_id, reason));
                    }
                    if self.pin.as_ref().is_some_and(|pin| !pin.is_alive()) {
                        return Err(LoaderError::ResultChannelClosed {
                            outstanding: self.outstanding.len(),
                        })
                        .context("pin memory thread exited unexpectedly");
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    if let Some((worker_id, reason)) = self.pool.first_exited() {
                        return Err(self.crashed(worker_id, reason));
                    }
                    return Err(LoaderError::ResultChannelClosed {
                        outstanding: self.outstanding.len(),
                    }
                    .into());
                }
            }
        }
    }

    /// A worker's connection closed. Gives the OS one poll interval to
    /// report why.
    fn disconnected(&mut self, worker_id: usize) -> anyhow::Error {
        let deadline = Instant::now() + self.poll;
        let reason = loop {
            if let Some(reason) = self.pool.exit_status(worker_id) {
                break reason;
            }
            if Instant::now() >= deadline {
                break "connection to worker closed".to_owned();
            }
            thread::sleep(Duration::from_millis(TEARDOWN_POLL_MS));
        };
        self.crashed(worker_id, reason)
    }

    fn crashed(&self, worker_id: usize, reason: String) -> anyhow::Error {
        let pid = self.pool.pid(worker_id);
        tracing::warn!(worker_id, ?pid, %reason, "DataLoader worker exited unexpectedly");
        LoaderError::WorkerCrashed {
            worker_id,
            pid,
            reason,
        }
        .into()
    }
}

impl<B> MultiProcessIter<B> {
    pub(crate) fn token(&self) -> &ShutdownToken {
        &self.token
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.pool.num_workers()
    }

    pub(crate) fn worker_pids(&self) -> Vec<u32> {
        self.pool.pids()
    }

    pub(crate) fn has_pin_thread(&self) -> bool {
        self.pin.as_ref().is_some_and(PinStage::is_alive)
    }

    /// Stops workers and the pin stage. Idempotent.
    pub(crate) fn shutdown(&mut self) {
        if self.token.state() == PipelineState::Terminated {
            return;
        }
        self.token.begin_shutdown();
        tracing::debug!(
            next_seq = self.buffer.next_seq(),
            outstanding = self.outstanding.len(),
            buffered = self.buffer.len(),
            "shutting down DataLoader pipeline"
        );

        self.pool.shutdown();
        if let Some(pin) = self.pin.as_mut() {
            pin.join(self.grace);
        }
        self.plan = IndexPlan::Done;
        self.buffer.clear();
        self.outstanding.clear();
        self.token.mark_terminated();
    }

    fn fail(&mut self, error: anyhow::Error) -> Option<Result<B>> {
        self.shutdown();
        Some(Err(error))
    }
}

impl<B> Iterator for MultiProcessIter<B>
where
    B: Serialize + DeserializeOwned + Send + 'static,
{
    type Item = Result<B>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.token.is_running() {
            return None;
        }

        loop {
            if let Some((_, envelope)) = self.buffer.pop_ready() {
                match envelope.payload {
                    Payload::Batch(batch) => {
                        if let Err(e) = self.try_dispatch() {
                            return self.fail(e);
                        }
                        return Some(Ok(batch));
                    }
                    Payload::Exhausted => {
                        if let Some(active) = self.active.get_mut(envelope.worker_id) {
                            *active = false;
                        }
                        if let Err(e) = self.try_dispatch() {
                            return self.fail(e);
                        }
                        continue;
                    }
                    Payload::Failed(failure) => {
                        return self.fail(LoaderError::WorkerFetch(failure).into());
                    }
                }
            }

            if self.outstanding.is_empty() && self.buffer.is_empty() {
                self.shutdown();
                return None;
            }

            match self.wait_for_event() {
                Ok(WorkerEvent::Envelope(envelope)) => {
                    self.outstanding.remove(&envelope.seq);
                    self.buffer.insert(envelope.seq, envelope);
                }
                Ok(WorkerEvent::Disconnected { worker_id }) => {
                    let error = self.disconnected(worker_id);
                    return self.fail(error);
                }
                Err(e) => return self.fail(e),
            }
        }
    }
}

impl<B> Drop for MultiProcessIter<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
