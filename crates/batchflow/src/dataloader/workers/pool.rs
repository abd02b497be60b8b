//! The set of workers serving one pass.
//!
//! A pool spawns `num_workers` workers on the configured backend, routes each
//! task to the worker the orchestrator picked, and merges their results into
//! one bounded channel. Dropping the pool stops every worker: a stop request
//! first, then a kill for anything still alive after the grace period.

use crate::dataloader::common::thread::{worker_seed, WorkerInfo};
use crate::dataloader::config::WorkerMode;
use crate::dataloader::shutdown::ShutdownToken;
use crate::dataloader::workers::fetch::{Batching, FetcherFactory};
use crate::dataloader::workers::routine::{WorkerContext, WorkerInitFn};
use crate::dataloader::workers::thread::ThreadWorker;
use crate::dataloader::workers::{WorkerEvent, WorkerTask, TEARDOWN_POLL_MS};
use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use crate::dataloader::workers::process::ProcessWorker;

/// Control surface of a single worker, as seen from the consumer.
pub(crate) trait WorkerRuntime: Send {
    fn pid(&self) -> Option<u32>;

    fn send(&mut self, task: WorkerTask) -> Result<()>;

    /// `Some(reason)` once the worker has exited.
    fn exit_status(&mut self) -> Option<String>;

    /// Asks the worker to finish. Never blocks.
    fn request_stop(&mut self);

    /// Ends a worker that ignored `request_stop`.
    fn force_stop(&mut self);

    /// Releases OS resources after the worker has stopped.
    fn reap(&mut self);
}

/// Per-pass settings for spawning a pool.
#[derive(Clone)]
pub(crate) struct PoolOptions {
    pub(crate) num_workers: usize,
    pub(crate) mode: WorkerMode,
    pub(crate) prefetch_factor: usize,
    pub(crate) poll: Duration,
    pub(crate) grace: Duration,
    pub(crate) epoch: usize,
    pub(crate) base_seed: u64,
    pub(crate) batching: Batching,
    pub(crate) init_fn: Option<WorkerInitFn>,
}

pub(crate) struct WorkerPool<B> {
    workers: Vec<Box<dyn WorkerRuntime>>,
    events: Receiver<WorkerEvent<B>>,
    token: ShutdownToken,
    grace: Duration,
    stopped: bool,
}

impl<B> WorkerPool<B>
where
    B: Serialize + DeserializeOwned + Send + 'static,
{
    pub(crate) fn spawn(
        factory: Arc<dyn FetcherFactory<B>>,
        options: PoolOptions,
        token: ShutdownToken,
    ) -> Result<Self> {
        // Validation
        if options.num_workers == 0 {
            return Err(anyhow!(
                "a worker pool needs at least one worker; \
                num_workers = 0 loads on the calling thread instead"
            ));
        }
        if options.prefetch_factor == 0 {
            return Err(anyhow!(
                "Cannot create WorkerPool with prefetch_factor 0. \
                Each worker needs at least one task in flight."
            ));
        }

        // Room for every in-flight result plus one disconnect notice per worker,
        // so a worker never blocks on this channel while the consumer is reading.
        let capacity = options.num_workers * (options.prefetch_factor + 1);
        let (events_tx, events_rx) = bounded(capacity);

        let mut pool = Self {
            workers: Vec::with_capacity(options.num_workers),
            events: events_rx,
            token,
            grace: options.grace,
            stopped: false,
        };

        #[cfg(unix)]
        let mut inherited_fds = Vec::new();

        for worker_id in 0..options.num_workers {
            let info = WorkerInfo {
                id: worker_id,
                num_workers: options.num_workers,
                seed: worker_seed(worker_id, options.epoch, options.base_seed),
            };
            let ctx = WorkerContext {
                info,
                batching: options.batching,
                factory: Arc::clone(&factory),
                init_fn: options.init_fn.clone(),
            };

            let runtime: Box<dyn WorkerRuntime> = match options.mode {
                #[cfg(unix)]
                WorkerMode::Process => {
                    let worker = ProcessWorker::spawn(ctx, events_tx.clone(), &inherited_fds)?;
                    inherited_fds.extend(worker.parent_fds());
                    Box::new(worker)
                }
                #[cfg(not(unix))]
                WorkerMode::Process => {
                    return Err(anyhow!("process workers are only supported on unix"));
                }
                WorkerMode::Thread => Box::new(ThreadWorker::spawn(
                    ctx,
                    events_tx.clone(),
                    pool.token.clone(),
                    // streaming passes may route several workers' share to one
                    options.num_workers * options.prefetch_factor,
                    options.poll,
                )?),
            };

            tracing::debug!(
                worker_id,
                pid = runtime.pid(),
                seed = info.seed,
                mode = ?options.mode,
                "spawned DataLoader worker"
            );
            pool.workers.push(runtime);
        }

        Ok(pool)
    }
}

impl<B> WorkerPool<B> {
    pub(crate) fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// The shared result channel.
    pub(crate) fn events(&self) -> &Receiver<WorkerEvent<B>> {
        &self.events
    }

    pub(crate) fn dispatch(&mut self, worker_id: usize, task: WorkerTask) -> Result<()> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| anyhow!("no worker with id {worker_id}"))?;
        worker.send(task)
    }

    pub(crate) fn pid(&self, worker_id: usize) -> Option<u32> {
        self.workers.get(worker_id).and_then(|worker| worker.pid())
    }

    pub(crate) fn pids(&self) -> Vec<u32> {
        self.workers.iter().filter_map(|worker| worker.pid()).collect()
    }

    pub(crate) fn exit_status(&mut self, worker_id: usize) -> Option<String> {
        self.workers.get_mut(worker_id)?.exit_status()
    }

    /// The first worker found to have exited, as `(worker_id, reason)`.
    pub(crate) fn first_exited(&mut self) -> Option<(usize, String)> {
        self.workers
            .iter_mut()
            .enumerate()
            .find_map(|(worker_id, worker)| worker.exit_status().map(|reason| (worker_id, reason)))
    }

    /// Stops every worker. Idempotent.
    ///
    /// Workers get `grace` to exit on their own; the rest are force-stopped.
    /// Results still arriving meanwhile are discarded so no worker stays
    /// blocked on a full channel.
    pub(crate) fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.token.begin_shutdown();

        for worker in &mut self.workers {
            worker.request_stop();
        }

        let deadline = Instant::now() + self.grace;
        loop {
            self.drain_events();
            let mut running = 0;
            for worker in &mut self.workers {
                if worker.exit_status().is_none() {
                    running += 1;
                }
            }
            if running == 0 || Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(TEARDOWN_POLL_MS));
        }

        for worker in &mut self.workers {
            if worker.exit_status().is_none() {
                worker.force_stop();
            }
        }

        let events = &self.events;
        for worker in &mut self.workers {
            while events.try_recv().is_ok() {}
            worker.reap();
        }
        tracing::debug!(num_workers = self.workers.len(), "DataLoader workers shut down");
    }

    fn drain_events(&self) {
        while self.events.try_recv().is_ok() {}
    }
}

impl<B> Drop for WorkerPool<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
