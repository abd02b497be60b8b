//! The worker loop shared by the process and thread backends.
//!
//! ```text
//! Starting ──(worker info set, init hook run)──> Ready
//! Ready ──(task)──> Processing ──(envelope sent)──> Ready
//! Ready | Processing ──(Shutdown, closed inbox, failed send)──> Draining ──> Stopped
//! ```
//!
//! Nothing here logs: in the process backend this runs in a forked child.

use crate::dataloader::common::thread::{enter_worker, leave_worker, WorkerInfo};
use crate::dataloader::workers::fetch::{Batching, FetchRequest, Fetcher, FetcherFactory};
use crate::dataloader::workers::{Payload, ResultEnvelope, WorkerTask};
use crate::error::{FailureKind, WorkerFailure};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

pub(crate) type WorkerInitFn = Arc<dyn Fn(usize) + Send + Sync>;

/// A worker's two channel ends, as seen from inside the worker.
pub(crate) trait WorkerPort<B> {
    /// Blocks for the next task. `None` once the inbox is closed or the
    /// pipeline is shutting down.
    fn recv(&mut self) -> Option<WorkerTask>;

    /// Returns `false` when the consumer is gone or shutting down.
    fn send(&mut self, envelope: ResultEnvelope<B>) -> bool;
}

/// Everything a worker needs to start, shared by value with each backend.
pub(crate) struct WorkerContext<B> {
    pub(crate) info: WorkerInfo,
    pub(crate) batching: Batching,
    pub(crate) factory: Arc<dyn FetcherFactory<B>>,
    pub(crate) init_fn: Option<WorkerInitFn>,
}

/// Runs one worker until it is told to stop. A panic in the init hook is not
/// caught here; the backend reports the worker as crashed.
pub(crate) fn run_worker<B, P: WorkerPort<B>>(ctx: &WorkerContext<B>, port: &mut P) {
    let worker_id = ctx.info.id;
    enter_worker(ctx.info);
    if let Some(init_fn) = &ctx.init_fn {
        init_fn(worker_id);
    }

    let mut fetcher = ctx
        .factory
        .create(ctx.batching)
        .map_err(|e| WorkerFailure::new(FailureKind::Fetch, &e, Some(worker_id)));

    while let Some(task) = port.recv() {
        let (seq, request) = match task {
            WorkerTask::Fetch { seq, indices } => (seq, FetchRequest::Indices(indices)),
            WorkerTask::Next { seq } => (seq, FetchRequest::Next),
            WorkerTask::Shutdown => break,
        };

        let payload = match fetcher.as_mut() {
            Ok(fetcher) => fetch_payload(fetcher.as_mut(), request, worker_id),
            Err(failure) => Payload::Failed(failure.clone()),
        };

        if !port.send(ResultEnvelope {
            seq,
            worker_id,
            payload,
        }) {
            break;
        }
    }
    leave_worker();
}

fn fetch_payload<B>(
    fetcher: &mut dyn Fetcher<B>,
    request: FetchRequest,
    worker_id: usize,
) -> Payload<B> {
    match panic::catch_unwind(AssertUnwindSafe(|| fetcher.fetch(request))) {
        Ok(Ok(Some(batch))) => Payload::Batch(batch),
        Ok(Ok(None)) => Payload::Exhausted,
        Ok(Err(e)) => Payload::Failed(WorkerFailure::new(e.kind, &e.error, Some(worker_id))),
        Err(panic) => Payload::Failed(WorkerFailure::panic(
            panic_message(panic.as_ref()),
            Some(worker_id),
        )),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked with a non-string payload".to_owned()
    }
}

#[cfg(test)]
mod worker_routine_tests {
    use super::*;
    use crate::collator::StackCollator;
    use crate::dataloader::common::thread::worker_info;
    use crate::dataloader::workers::fetch::MapFetcherFactory;
    use crate::dataset::Dataset;
    use crate::sample::Sample;
    use anyhow::{bail, Result};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records which worker served each index; index 3 fails, index 4 panics.
    struct ProbeDataset;

    impl Dataset for ProbeDataset {
        type Item = Sample;

        fn len(&self) -> usize {
            8
        }

        fn get(&self, index: usize) -> Result<Sample> {
            match index {
                3 => bail!("sample 3 is corrupt"),
                4 => panic!("sample 4 exploded"),
                _ => Ok(Sample::Int(worker_info().map_or(-1, |info| info.id as i64))),
            }
        }
    }

    struct ScriptedPort {
        tasks: VecDeque<WorkerTask>,
        sent: Vec<ResultEnvelope<Sample>>,
        accept: usize,
    }

    impl ScriptedPort {
        fn new(tasks: Vec<WorkerTask>) -> Self {
            Self {
                tasks: tasks.into(),
                sent: Vec::new(),
                accept: usize::MAX,
            }
        }
    }

    impl WorkerPort<Sample> for ScriptedPort {
        fn recv(&mut self) -> Option<WorkerTask> {
            self.tasks.pop_front()
        }

        fn send(&mut self, envelope: ResultEnvelope<Sample>) -> bool {
            self.sent.push(envelope);
            self.sent.len() < self.accept
        }
    }

    fn context(init_fn: Option<WorkerInitFn>) -> WorkerContext<Sample> {
        WorkerContext {
            info: WorkerInfo {
                id: 5,
                num_workers: 6,
                seed: 99,
            },
            batching: Batching {
                auto_collation: true,
                batch_size: Some(1),
                drop_last: false,
            },
            factory: Arc::new(MapFetcherFactory::new(
                Arc::new(ProbeDataset),
                Arc::new(StackCollator),
            )),
            init_fn,
        }
    }

    fn fetch(seq: u64, index: usize) -> WorkerTask {
        WorkerTask::Fetch {
            seq,
            indices: vec![index],
        }
    }

    #[test]
    fn answers_every_task_in_order() {
        std::thread::spawn(|| {
            let mut port = ScriptedPort::new(vec![fetch(0, 0), fetch(1, 3), fetch(2, 4), fetch(3, 1)]);
            run_worker(&context(None), &mut port);

            let seqs: Vec<_> = port.sent.iter().map(|e| e.seq).collect();
            assert_eq!(seqs, vec![0, 1, 2, 3]);
            assert!(port.sent.iter().all(|e| e.worker_id == 5));

            match &port.sent[0].payload {
                Payload::Batch(batch) => {
                    assert_eq!(batch.as_tensor().unwrap().to_vec::<i64>().unwrap(), vec![5])
                }
                other => panic!("expected a batch, got {other:?}"),
            }
            match &port.sent[1].payload {
                Payload::Failed(failure) => {
                    assert_eq!(failure.kind, FailureKind::Fetch);
                    assert!(failure.message.contains("sample 3 is corrupt"));
                }
                other => panic!("expected a failure, got {other:?}"),
            }
            match &port.sent[2].payload {
                Payload::Failed(failure) => {
                    assert_eq!(failure.kind, FailureKind::Panic);
                    assert!(failure.message.contains("sample 4 exploded"));
                }
                other => panic!("expected a panic failure, got {other:?}"),
            }
            assert!(matches!(port.sent[3].payload, Payload::Batch(_)));

            // worker state does not outlive the loop
            assert_eq!(worker_info(), None);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn stops_on_shutdown_and_on_rejected_send() {
        let mut port = ScriptedPort::new(vec![fetch(0, 0), WorkerTask::Shutdown, fetch(1, 1)]);
        run_worker(&context(None), &mut port);
        assert_eq!(port.sent.len(), 1);

        let mut port = ScriptedPort::new(vec![fetch(0, 0), fetch(1, 1), fetch(2, 2)]);
        port.accept = 1;
        run_worker(&context(None), &mut port);
        assert_eq!(port.sent.len(), 1);
    }

    #[test]
    fn init_hook_runs_once_with_worker_id() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let init: WorkerInitFn = Arc::new(move |worker_id| {
            assert_eq!(worker_id, 5);
            assert_eq!(worker_info().map(|info| info.seed), Some(99));
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let mut port = ScriptedPort::new(vec![fetch(0, 0), fetch(1, 1)]);
        run_worker(&context(Some(init)), &mut port);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(port.sent.len(), 2);
    }
}
