//! Parallel batch loading.
//!
//! A [`DataLoader`] turns a [`Dataset`](dataset::Dataset) (random access) or
//! an [`IterableDataset`](dataset::IterableDataset) (stream) into an ordered
//! sequence of batches. Indices come from a [`Sampler`](sampler::Sampler),
//! samples are merged by a [`Collator`](collator::Collator), and with
//! `num_workers > 0` the loading happens in worker processes whose results are
//! handed back in sampling order.

pub mod collator;
pub mod dataloader;
pub mod dataset;
pub mod error;
pub mod sample;
pub mod sampler;

pub use collator::{CollateFn, Collator, StackCollator};
pub use dataloader::{DataLoader, DataLoaderConfig, DataLoaderIter};
pub use error::LoaderError;
pub use sample::{Sample, Tensor};
