#![allow(dead_code)]

use batchflow::dataloader::{initial_seed, worker_info};
use batchflow::dataset::{Dataset, IterableDataset};
use batchflow::sample::Sample;

use anyhow::{bail, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Routes `RUST_LOG` output into the test harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn int_samples(n: i64) -> Vec<Sample> {
    (0..n).map(Sample::Int).collect()
}

/// Values of a batch produced from `Sample::Int`s (a 1-D i64 tensor), or of
/// a single unbatched `Sample::Int`.
pub fn batch_values(batch: &Sample) -> Result<Vec<i64>> {
    match batch {
        Sample::Int(v) => Ok(vec![*v]),
        Sample::Tensor(tensor) => tensor.to_vec::<i64>(),
        other => bail!("unexpected batch kind {}", other.kind_name()),
    }
}

/// Returns its index, sleeping `delay` first.
pub struct SlowDataset {
    pub len: usize,
    pub delay: Duration,
}

impl Dataset for SlowDataset {
    type Item = Sample;

    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize) -> Result<Sample> {
        thread::sleep(self.delay);
        Ok(Sample::Int(index as i64))
    }
}

/// Fails for a single index.
pub struct FailingDataset {
    pub len: usize,
    pub fail_at: usize,
}

impl Dataset for FailingDataset {
    type Item = Sample;

    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize) -> Result<Sample> {
        if index == self.fail_at {
            bail!("corrupt record at index {index}");
        }
        Ok(Sample::Int(index as i64))
    }
}

/// Every sample is the id of the worker that loaded it (-1 in the consumer).
pub struct WorkerIdDataset {
    pub len: usize,
}

impl Dataset for WorkerIdDataset {
    type Item = Sample;

    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, _index: usize) -> Result<Sample> {
        Ok(Sample::Int(worker_info().map_or(-1, |info| info.id as i64)))
    }
}

/// Every sample is the seed of the loading thread's RNG.
pub struct SeedDataset {
    pub len: usize,
}

impl Dataset for SeedDataset {
    type Item = Sample;

    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, _index: usize) -> Result<Sample> {
        Ok(Sample::Int(initial_seed().map_or(-1, |seed| seed as i64)))
    }
}

/// A dataset whose length can change between passes.
#[derive(Clone, Default)]
pub struct GrowingDataset {
    pub len: Arc<AtomicUsize>,
}

impl GrowingDataset {
    pub fn grow(&self, by: usize) {
        self.len.fetch_add(by, Ordering::SeqCst);
    }
}

impl Dataset for GrowingDataset {
    type Item = Sample;

    fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    fn get(&self, index: usize) -> Result<Sample> {
        Ok(Sample::Int(index as i64))
    }
}

/// Yields `0..len`. With `shard` set, every worker yields only the values
/// congruent to its id.
pub struct RangeStream {
    pub len: i64,
    pub shard: bool,
}

impl IterableDataset for RangeStream {
    type Item = Sample;

    fn iter(&self) -> Result<Box<dyn Iterator<Item = Result<Sample>> + Send>> {
        let (start, step) = match worker_info() {
            Some(info) if self.shard => (info.id, info.num_workers),
            _ => (0, 1),
        };
        Ok(Box::new(
            (0..self.len)
                .skip(start)
                .step_by(step)
                .map(|v| Ok(Sample::Int(v))),
        ))
    }
}

/// Whether `pid` names a running (non-zombie) process.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    // A zombie still accepts signal 0.
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => !cfg!(target_os = "linux"),
    }
}

/// Polls until none of `pids` is alive. Returns `false` on timeout.
#[cfg(unix)]
pub fn wait_until_gone(pids: &[u32], within: Duration) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if pids.iter().all(|&pid| !process_alive(pid)) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(20));
    }
}
