//! Batch loading on top of [`Dataset`](crate::dataset::Dataset),
//! [`Sampler`](crate::sampler::Sampler) and [`Collator`](crate::collator::Collator).
//!
//! A pass over a [`DataLoader`] walks the sampler's index groups, fetches the
//! samples for each group, collates them into one batch and yields the batches
//! in sampling order. With `num_workers > 0` the fetching and collation move to
//! worker processes (or threads) and run ahead of the consumer.
//!
//! ```text
//!   sampler ── index groups ──▶ dispatcher ── (seq, indices) ──▶ worker 0..N
//!                                   ▲                               │
//!                                   │ one refill                    │ Dataset::get
//!                                   │ per delivered batch           │ + Collator
//!                                   │                               ▼
//!   consumer ◀── batch ── reorder buffer ◀── pin stage (opt.) ◀── (seq, batch)
//! ```
//!
//! Tasks are tagged with a sequence number and handed out round robin. Workers
//! finish out of order; the reorder buffer holds early results until every
//! earlier sequence number has been delivered. At most
//! `num_workers * prefetch_factor` tasks are in flight.
//!
//! Layout:
//!
//! ```text
//! config.rs        DataLoaderConfig and its builder
//! loader.rs        DataLoader, constructors, setters that lock after the first pass
//! pin.rs           PinMemory hook and the thread that applies it
//! shutdown.rs      state shared by everything running on behalf of one pass
//! iterator/        DataLoaderIter: inline path, worker path, reorder buffer
//! workers/         task types, the worker loop, process and thread backends
//! common/thread.rs per-worker info and RNG, stored thread-locally
//! ```
//!
//! ```ignore
//! let config = DataLoaderConfig::builder()
//!     .batch_size(64)
//!     .shuffle(true)
//!     .seed(3)
//!     .num_workers(4)
//!     .timeout(Duration::from_secs(30))
//!     .build();
//!
//! let dataloader = DataLoader::new(InMemoryDataset::new(samples), config)?
//!     .with_worker_init_fn(|worker_id| manual_seed(1000 + worker_id as u64));
//!
//! for epoch in 0..10 {
//!     for batch in dataloader.iter()? {
//!         train_step(batch?)?;
//!     }
//! }
//! ```
//!
//! Any error ends the pass and stops its workers. Errors raised by the pipeline
//! itself (timeouts, crashed workers, failures inside a worker) carry a
//! [`LoaderError`](crate::error::LoaderError) and can be recovered with
//! `err.downcast_ref::<LoaderError>()`.
//!
//! Buffered memory grows with `num_workers * prefetch_factor * batch_size`.
//! Raise `prefetch_factor` when the consumer waits on workers; lower it (or the
//! worker count) when memory is tight.

mod common;
mod config;
mod iterator;
mod loader;
mod pin;
mod shutdown;
mod workers;

pub use config::{DataLoaderConfig, DataLoaderConfigBuilder, WorkerMode};
pub use iterator::DataLoaderIter;
pub use loader::DataLoader;
pub use pin::{NoopPin, PinMemory};
pub use shutdown::PipelineState;

pub use common::thread::{
    init_worker_rng, initial_seed, manual_seed, worker_gen_bool, worker_gen_range, worker_info,
    worker_seed, WorkerInfo,
};
