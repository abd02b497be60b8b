//! Thread-local storage for worker identification.
//!
//! Every worker (process or thread) records its [`WorkerInfo`] and a
//! deterministically seeded RNG here before touching user code, so datasets
//! and init hooks can ask "which worker am I?" and draw reproducible
//! randomness. The consumer thread in synchronous mode has no worker info.

use rand::rngs::StdRng;
use rand::Rng as _;
use rand::SeedableRng;
use std::cell::{Cell, RefCell};
use std::ops::Range;

/// Identity of the worker the current code runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerInfo {
    /// 0 to num_workers-1
    pub id: usize,
    pub num_workers: usize,
    /// The seed this worker's RNG was initialised with for the current pass.
    pub seed: u64,
}

struct SeededRng {
    seed: u64,
    rng: StdRng,
}

thread_local! {
    static WORKER_INFO: Cell<Option<WorkerInfo>> = const { Cell::new(None) };

    /// Thread-local RNG for deterministic randomness in workers
    static WORKER_RNG: RefCell<Option<SeededRng>> = const { RefCell::new(None) };
}

/// Seed formula: base_seed + (epoch << 32) + worker_id
/// This ensures each worker has unique but deterministic randomness.
pub fn worker_seed(worker_id: usize, epoch: usize, base_seed: u64) -> u64 {
    base_seed
        .wrapping_add((epoch as u64) << 32)
        .wrapping_add(worker_id as u64)
}

/// Initialize the current thread's RNG based on worker_id, epoch, and base seed.
pub fn init_worker_rng(worker_id: usize, epoch: usize, base_seed: u64) {
    manual_seed(worker_seed(worker_id, epoch, base_seed));
}

/// Re-seeds the current thread's RNG.
pub fn manual_seed(seed: u64) {
    WORKER_RNG.with(|rng| {
        *rng.borrow_mut() = Some(SeededRng {
            seed,
            rng: StdRng::seed_from_u64(seed),
        });
    })
}

/// The seed of the current thread's RNG, if one was initialised.
pub fn initial_seed() -> Option<u64> {
    WORKER_RNG.with(|rng| rng.borrow().as_ref().map(|seeded| seeded.seed))
}

/// `Some` inside a worker, `None` in the consumer.
pub fn worker_info() -> Option<WorkerInfo> {
    WORKER_INFO.with(Cell::get)
}

/// Marks the current thread as worker `info.id` and seeds its RNG.
pub(crate) fn enter_worker(info: WorkerInfo) {
    WORKER_INFO.with(|cell| cell.set(Some(info)));
    manual_seed(info.seed);
}

/// Clears worker state so a reused thread does not leak it.
pub(crate) fn leave_worker() {
    WORKER_INFO.with(|cell| cell.set(None));
    WORKER_RNG.with(|rng| rng.borrow_mut().take());
}

/// Get a random bool from worker RNG, or the thread rng if not in worker context.
pub fn worker_gen_bool(p: f64) -> bool {
    WORKER_RNG.with(|rng| match rng.borrow_mut().as_mut() {
        Some(seeded) => seeded.rng.random_bool(p),
        None => rand::rng().random_bool(p),
    })
}

/// Get a random value in `range` from worker RNG, or the thread rng if not in worker context.
pub fn worker_gen_range(range: Range<usize>) -> usize {
    WORKER_RNG.with(|rng| match rng.borrow_mut().as_mut() {
        Some(seeded) => seeded.rng.random_range(range),
        None => rand::rng().random_range(range),
    })
}
