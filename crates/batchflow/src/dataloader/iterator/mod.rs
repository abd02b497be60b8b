//! src/dataloader/iterator/mod.rs
//!
//! Iterator implementations for DataLoader.
//!
//! - `DataLoaderIter`: The public iterator type returned by `DataLoader::iter()`
//! - `IteratorImpl`: Internal enum selecting the execution strategy
//! - `IteratorConfig`: Everything one pass needs, built by the loader
//!
//! # Iterator Variants
//! - `Single`: `num_workers = 0`, everything runs in the calling thread
//! - `Multi`: a worker pool per pass, with an optional pin stage
//!
//! Random-access and streaming datasets share both variants; they differ
//! only in the [`IndexPlan`] that drives dispatch.

use crate::dataloader::config::DataLoaderConfig;
use crate::dataloader::pin::PinMemory;
use crate::dataloader::shutdown::PipelineState;
use crate::dataloader::workers::fetch::{Batching, FetcherFactory};
use crate::dataloader::workers::routine::WorkerInitFn;
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

mod multi;
mod reorder;
mod single;

use multi::MultiProcessIter;
use single::SingleProcessIter;

/// What drives one pass.
pub(crate) enum IndexPlan {
    /// Index groups from the (batch) sampler, one task each.
    Indexed(Box<dyn Iterator<Item = Vec<usize>> + Send>),
    /// Keep asking the stream for its next batch until it is exhausted.
    Stream,
    Done,
}

/// Shared configuration for both iterator implementations.
pub(crate) struct IteratorConfig<B> {
    pub(crate) factory: Arc<dyn FetcherFactory<B>>,
    pub(crate) plan: IndexPlan,
    pub(crate) batching: Batching,
    pub(crate) epoch: usize,
    pub(crate) runtime_seed: u64,
    pub(crate) pinner: Option<Arc<dyn PinMemory<B>>>,
}

/// Iterator over batches of data.
///
/// Created by calling `dataloader.iter()`. Every item is a batch or the
/// error that ended the pass; after an error the iterator yields `None`.
/// Dropping the iterator stops its workers.
pub struct DataLoaderIter<B> {
    inner: IteratorImpl<B>,
}

enum IteratorImpl<B> {
    Single(SingleProcessIter<B>),
    Multi(MultiProcessIter<B>),
}

impl<B> DataLoaderIter<B>
where
    B: Serialize + DeserializeOwned + Send + 'static,
{
    pub(crate) fn new(
        config: IteratorConfig<B>,
        loader_config: &DataLoaderConfig,
        init_fn: Option<WorkerInitFn>,
    ) -> Result<Self> {
        let inner = if loader_config.num_workers == 0 {
            IteratorImpl::Single(SingleProcessIter::new(config)?)
        } else {
            IteratorImpl::Multi(MultiProcessIter::new(config, loader_config, init_fn)?)
        };
        Ok(Self { inner })
    }
}

impl<B> DataLoaderIter<B> {
    /// Stops workers and the pin thread now. Safe to call more than once;
    /// dropping the iterator does the same.
    pub fn close(&mut self) {
        match &mut self.inner {
            IteratorImpl::Single(iter) => iter.close(),
            IteratorImpl::Multi(iter) => iter.shutdown(),
        }
    }

    pub fn state(&self) -> PipelineState {
        match &self.inner {
            IteratorImpl::Single(iter) => iter.token().state(),
            IteratorImpl::Multi(iter) => iter.token().state(),
        }
    }

    pub fn num_workers(&self) -> usize {
        match &self.inner {
            IteratorImpl::Single(_) => 0,
            IteratorImpl::Multi(iter) => iter.num_workers(),
        }
    }

    /// Process ids of this pass's workers. Empty for thread workers and in
    /// synchronous mode.
    pub fn worker_pids(&self) -> Vec<u32> {
        match &self.inner {
            IteratorImpl::Single(_) => Vec::new(),
            IteratorImpl::Multi(iter) => iter.worker_pids(),
        }
    }

    /// Whether a pin thread is currently running for this pass.
    pub fn has_pin_thread(&self) -> bool {
        match &self.inner {
            IteratorImpl::Single(_) => false,
            IteratorImpl::Multi(iter) => iter.has_pin_thread(),
        }
    }
}

impl<B> fmt::Debug for DataLoaderIter<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataLoaderIter")
            .field("num_workers", &self.num_workers())
            .field("state", &self.state())
            .finish()
    }
}

impl<B> Iterator for DataLoaderIter<B>
where
    B: Serialize + DeserializeOwned + Send + 'static,
{
    type Item = Result<B>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            IteratorImpl::Single(iter) => iter.next(),
            IteratorImpl::Multi(iter) => iter.next(),
        }
    }
}
