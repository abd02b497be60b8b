//! The [`DataLoader`] and its constructors.
//!
//! Random-access datasets get their order from one of three places:
//!
//! | constructor                          | order                                        |
//! |--------------------------------------|----------------------------------------------|
//! | `new`, `new_with_collator`           | sequential, or shuffled with the loader seed |
//! | `new_with_sampler[_and_collator]`    | an index sampler, grouped by `batch_size`    |
//! | `new_with_batch_sampler[_and_collator]` | ready-made index groups                   |
//!
//! The automatic order is rebuilt at the start of every pass, so a dataset
//! that grew between epochs is seen in full. Streaming datasets use
//! `new_iterable[_with_collator]` and are batched inside each worker.
//!
//! A randomized sampler reports its base seed. When the config also names a
//! seed the two must agree, otherwise construction fails:
//!
//! ```ignore
//! let sampler = WeightedRandomSampler::new(weights, true, Some(10_000), 9)?;
//! let config = DataLoaderConfig::builder().batch_size(32).seed(9).build();
//! let dataloader = DataLoader::new_with_sampler(dataset, sampler, config)?;
//! ```

use crate::collator::{Collator, StackCollator};
use crate::dataset::{Dataset, IterableDataset};
use crate::error::LoaderError;
use crate::sample::Sample;
use crate::sampler::{BatchSampler, RandomSampler, Sampler, SequentialSampler};
use anyhow::{Context, Result};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::config::DataLoaderConfig;
use super::iterator::{DataLoaderIter, IndexPlan, IteratorConfig};
use super::pin::{NoopPin, PinMemory};
use super::workers::fetch::{Batching, FetcherFactory, MapFetcherFactory, StreamFetcherFactory};
use super::workers::routine::WorkerInitFn;

/// Turns a dataset into an iterable of batches of type `B`.
///
/// Each call to [`iter`](Self::iter) is one epoch: it gets its own workers and
/// its own shutdown, so passes of one loader (or of several loaders) may run
/// side by side. The loader is `Send + Sync` and can be shared by reference.
pub struct DataLoader<B = Sample> {
    source: Source<B>,
    config: DataLoaderConfig,
    epoch: AtomicUsize,
    runtime_seed: u64,
    /// Set by the first `iter()`; locks batch_size, drop_last and the sampler.
    started: AtomicBool,
    init_fn: Option<WorkerInitFn>,
    pinner: Option<Arc<dyn PinMemory<B>>>,
}

enum Source<B> {
    Indexed {
        factory: Arc<dyn FetcherFactory<B>>,
        dataset_len: Arc<dyn Fn() -> usize + Send + Sync>,
        sampling: Sampling,
    },
    Stream {
        factory: Arc<dyn FetcherFactory<B>>,
    },
}

enum Sampling {
    /// Sequential or random, rebuilt every pass from the dataset's length.
    Auto,
    Sampler(Arc<dyn Sampler<Item = usize>>),
    BatchSampler(Arc<dyn Sampler<Item = Vec<usize>>>),
}

// ================================================================================================
// Sample batches through StackCollator
// ================================================================================================
impl DataLoader<Sample> {
    /// Sequential, or shuffled when `config.shuffle` is set.
    pub fn new<D>(dataset: D, config: DataLoaderConfig) -> Result<Self>
    where
        D: Dataset<Item = Sample> + 'static,
    {
        Self::new_with_collator(dataset, config, StackCollator)
    }

    /// Fails when `config.shuffle` is set or the seeds disagree.
    pub fn new_with_sampler<D, S>(dataset: D, sampler: S, config: DataLoaderConfig) -> Result<Self>
    where
        D: Dataset<Item = Sample> + 'static,
        S: Sampler<Item = usize> + 'static,
    {
        Self::new_with_sampler_and_collator(dataset, sampler, config, StackCollator)
    }

    /// For groups a `BatchSampler` cannot produce, e.g. of varying size:
    /// ```ignore
    /// let groups = FixedBatchSampler::new(vec![vec![0, 1], vec![2, 3, 4]]);
    /// let loader = DataLoader::new_with_batch_sampler(dataset, groups, config)?;
    /// ```
    pub fn new_with_batch_sampler<D, S>(
        dataset: D,
        batch_sampler: S,
        config: DataLoaderConfig,
    ) -> Result<Self>
    where
        D: Dataset<Item = Sample> + 'static,
        S: Sampler<Item = Vec<usize>> + 'static,
    {
        Self::new_with_batch_sampler_and_collator(dataset, batch_sampler, config, StackCollator)
    }

    pub fn new_iterable<D>(dataset: D, config: DataLoaderConfig) -> Result<Self>
    where
        D: IterableDataset<Item = Sample> + 'static,
    {
        Self::new_iterable_with_collator(dataset, config, StackCollator)
    }
}

// ================================================================================================
// Any batch type through a caller's Collator
// ================================================================================================
impl<B> DataLoader<B>
where
    B: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new_with_collator<D, C>(dataset: D, config: DataLoaderConfig, collator: C) -> Result<Self>
    where
        D: Dataset + 'static,
        C: Collator<D::Item, Batch = B> + 'static,
    {
        Self::indexed(dataset, collator, Sampling::Auto, config, None)
    }

    pub fn new_with_sampler_and_collator<D, S, C>(
        dataset: D,
        sampler: S,
        config: DataLoaderConfig,
        collator: C,
    ) -> Result<Self>
    where
        D: Dataset + 'static,
        S: Sampler<Item = usize> + 'static,
        C: Collator<D::Item, Batch = B> + 'static,
    {
        if config.shuffle {
            return Err(LoaderError::config(
                "Cannot specify shuffle = true when providing a custom sampler. Either \
                use DataLoader::new() with shuffle = true to let DataLoader manage sampling, \
                or shuffle inside your own sampler",
            )
            .into());
        }
        let sampler_seed = sampler.seed();
        Self::indexed(
            dataset,
            collator,
            Sampling::Sampler(Arc::new(sampler)),
            config,
            sampler_seed,
        )
    }

    /// The groups decide batch size and tail handling, so `batch_size` must stay
    /// at its default of 1 and `shuffle`/`drop_last` must stay off.
    pub fn new_with_batch_sampler_and_collator<D, S, C>(
        dataset: D,
        batch_sampler: S,
        config: DataLoaderConfig,
        collator: C,
    ) -> Result<Self>
    where
        D: Dataset + 'static,
        S: Sampler<Item = Vec<usize>> + 'static,
        C: Collator<D::Item, Batch = B> + 'static,
    {
        if config.batch_size != Some(1) || config.shuffle || config.drop_last {
            return Err(LoaderError::config(
                "batch_sampler option is mutually exclusive with batch_size, shuffle and drop_last. \
                The batch sampler controls batch size and whether to drop the last batch",
            )
            .into());
        }
        let sampler_seed = batch_sampler.seed();
        Self::indexed(
            dataset,
            collator,
            Sampling::BatchSampler(Arc::new(batch_sampler)),
            config,
            sampler_seed,
        )
    }

    /// Each worker opens its own `dataset.iter()` per pass. Unless the stream
    /// splits itself by [`worker_info`](crate::dataloader::worker_info) (say,
    /// worker `k` of `n` reading files `k, k + n, ...`), every worker yields
    /// the full stream and the data arrives `num_workers` times.
    pub fn new_iterable_with_collator<D, C>(
        dataset: D,
        config: DataLoaderConfig,
        collator: C,
    ) -> Result<Self>
    where
        D: IterableDataset + 'static,
        D::Item: 'static,
        C: Collator<D::Item, Batch = B> + 'static,
    {
        if config.shuffle {
            return Err(LoaderError::config(
                "DataLoader with a streaming dataset expected shuffle = false. \
                Consider shuffling inside the stream instead",
            )
            .into());
        }
        let factory: Arc<dyn FetcherFactory<B>> =
            Arc::new(StreamFetcherFactory::new(Arc::new(dataset), Arc::new(collator)));
        Self::from_source(Source::Stream { factory }, config, None)
    }

    fn indexed<D, C>(
        dataset: D,
        collator: C,
        sampling: Sampling,
        config: DataLoaderConfig,
        sampler_seed: Option<u64>,
    ) -> Result<Self>
    where
        D: Dataset + 'static,
        C: Collator<D::Item, Batch = B> + 'static,
    {
        let dataset = Arc::new(dataset);
        let sized = Arc::clone(&dataset);
        let factory: Arc<dyn FetcherFactory<B>> =
            Arc::new(MapFetcherFactory::new(dataset, Arc::new(collator)));
        let source = Source::Indexed {
            factory,
            dataset_len: Arc::new(move || sized.len()),
            sampling,
        };
        Self::from_source(source, config, sampler_seed)
    }

    fn from_source(
        source: Source<B>,
        config: DataLoaderConfig,
        sampler_seed: Option<u64>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime_seed = coordinate_seeds(sampler_seed, config.seed)?;

        Ok(Self {
            source,
            config,
            epoch: AtomicUsize::new(0),
            runtime_seed,
            started: AtomicBool::new(false),
            init_fn: None,
            pinner: None,
        })
    }

    /// Creates an iterator over batches for the next epoch.
    ///
    /// Every call is one pass: the epoch counter advances, the auto random
    /// sampler reshuffles and workers are reseeded.
    pub fn iter(&self) -> Result<DataLoaderIter<B>> {
        self.started.store(true, Ordering::SeqCst);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst);

        let (factory, plan) = match &self.source {
            Source::Indexed {
                factory,
                dataset_len,
                sampling,
            } => (
                Arc::clone(factory),
                IndexPlan::Indexed(self.index_groups(dataset_len(), sampling, epoch)?),
            ),
            Source::Stream { factory } => (Arc::clone(factory), IndexPlan::Stream),
        };

        let pinner = match (&self.pinner, self.config.pin_memory) {
            (_, false) => None,
            (Some(pinner), true) => Some(Arc::clone(pinner)),
            (None, true) => {
                let noop: Arc<dyn PinMemory<B>> = Arc::new(NoopPin);
                Some(noop)
            }
        };

        tracing::debug!(
            epoch,
            num_workers = self.config.num_workers,
            seed = self.runtime_seed,
            "starting DataLoader pass"
        );
        let config = IteratorConfig {
            factory,
            plan,
            batching: self.batching(),
            epoch,
            runtime_seed: self.runtime_seed,
            pinner,
        };
        DataLoaderIter::new(config, &self.config, self.init_fn.clone())
    }
}

// ================================================================================================
// Hooks and accessors
// ================================================================================================
impl<B> DataLoader<B> {
    /// Runs `init_fn(worker_id)` once in every worker, after the worker's
    /// RNG is seeded and before it loads anything.
    pub fn with_worker_init_fn<F>(mut self, init_fn: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.init_fn = Some(Arc::new(init_fn));
        self
    }

    /// Passes every batch through `pinner` before delivery. Enables
    /// `pin_memory`.
    pub fn with_pin_memory<P>(mut self, pinner: P) -> Self
    where
        P: PinMemory<B> + 'static,
    {
        self.pinner = Some(Arc::new(pinner));
        self.config.pin_memory = true;
        self
    }

    pub fn config(&self) -> &DataLoaderConfig {
        &self.config
    }

    /// The run-level seed behind shuffling and worker RNGs.
    pub fn seed(&self) -> u64 {
        self.runtime_seed
    }

    /// Number of passes started so far.
    pub fn epoch(&self) -> usize {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Number of batches the next pass yields, computed from the dataset's
    /// current length. `None` for streaming datasets.
    pub fn len(&self) -> Option<usize> {
        match &self.source {
            Source::Stream { .. } => None,
            Source::Indexed {
                dataset_len,
                sampling,
                ..
            } => Some(match sampling {
                Sampling::Auto => self.batches_for(dataset_len()),
                Sampling::Sampler(sampler) => self.batches_for(sampler.len()),
                Sampling::BatchSampler(batch_sampler) => batch_sampler.len(),
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    pub fn set_batch_size(&mut self, batch_size: Option<usize>) -> Result<()> {
        self.ensure_unlocked("batch_size")?;
        if batch_size == Some(0) {
            return Err(LoaderError::config(
                "batch_size should be a positive integer value, but got batch_size=0",
            )
            .into());
        }
        if self.uses_batch_sampler() && batch_size != Some(1) {
            return Err(LoaderError::config(
                "batch_size cannot be changed when a batch sampler is in use",
            )
            .into());
        }
        self.config.batch_size = batch_size;
        Ok(())
    }

    pub fn set_drop_last(&mut self, drop_last: bool) -> Result<()> {
        self.ensure_unlocked("drop_last")?;
        if self.uses_batch_sampler() && drop_last {
            return Err(LoaderError::config(
                "drop_last cannot be set when a batch sampler is in use",
            )
            .into());
        }
        self.config.drop_last = drop_last;
        Ok(())
    }

    /// Replaces the index sampler.
    pub fn set_sampler<S>(&mut self, sampler: S) -> Result<()>
    where
        S: Sampler<Item = usize> + 'static,
    {
        self.ensure_unlocked("sampler")?;
        if self.config.shuffle {
            return Err(LoaderError::config(
                "Cannot set a custom sampler on a DataLoader created with shuffle = true",
            )
            .into());
        }
        match &mut self.source {
            Source::Indexed { sampling, .. } => {
                *sampling = Sampling::Sampler(Arc::new(sampler));
                Ok(())
            }
            Source::Stream { .. } => Err(LoaderError::config(
                "a streaming dataset cannot be used with a sampler",
            )
            .into()),
        }
    }

    fn ensure_unlocked(&self, attribute: &str) -> Result<(), LoaderError> {
        if self.started.load(Ordering::SeqCst) {
            return Err(LoaderError::config(format!(
                "{attribute} attribute should not be set after DataLoader has started iterating"
            )));
        }
        Ok(())
    }

    fn uses_batch_sampler(&self) -> bool {
        matches!(
            self.source,
            Source::Indexed {
                sampling: Sampling::BatchSampler(_),
                ..
            }
        )
    }

    fn batches_for(&self, num_samples: usize) -> usize {
        match self.config.batch_size {
            None => num_samples,
            Some(batch_size) if self.config.drop_last => num_samples / batch_size,
            Some(batch_size) => num_samples.div_ceil(batch_size),
        }
    }

    fn batching(&self) -> Batching {
        if self.uses_batch_sampler() {
            return Batching {
                auto_collation: true,
                batch_size: None,
                drop_last: false,
            };
        }
        Batching {
            auto_collation: self.config.batch_size.is_some(),
            batch_size: self.config.batch_size,
            drop_last: self.config.drop_last,
        }
    }

    /// The index groups of one pass, one group per task.
    fn index_groups(
        &self,
        dataset_len: usize,
        sampling: &Sampling,
        epoch: usize,
    ) -> Result<Box<dyn Iterator<Item = Vec<usize>> + Send>> {
        let sampler: Arc<dyn Sampler<Item = usize>> = match sampling {
            Sampling::BatchSampler(batch_sampler) => return Ok(batch_sampler.iter(epoch)),
            Sampling::Sampler(sampler) => Arc::clone(sampler),
            Sampling::Auto if self.config.shuffle => Arc::new(
                RandomSampler::new(dataset_len, false, None, self.runtime_seed)
                    .context("Failed to create the shuffling sampler")?,
            ),
            Sampling::Auto => Arc::new(SequentialSampler::new(dataset_len)),
        };

        match self.config.batch_size {
            Some(batch_size) => Ok(BatchSampler::new(sampler, batch_size, self.config.drop_last)
                .context("Failed to wrap sampler with BatchSampler")?
                .iter(epoch)),
            None => Ok(Box::new(sampler.iter(epoch).map(|index| vec![index]))),
        }
    }
}

impl<B> fmt::Debug for DataLoader<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataLoader")
            .field("config", &self.config)
            .field("epoch", &self.epoch())
            .field("seed", &self.runtime_seed)
            .field("streaming", &matches!(self.source, Source::Stream { .. }))
            .finish_non_exhaustive()
    }
}

/// Picks the run-level seed: the sampler's and the config's must agree when
/// both are set, and a random one is drawn when neither is.
fn coordinate_seeds(sampler_seed: Option<u64>, config_seed: Option<u64>) -> Result<u64> {
    match (sampler_seed, config_seed) {
        (Some(sampler_seed), Some(config_seed)) if sampler_seed != config_seed => {
            Err(LoaderError::config(format!(
                "Seed mismatch: sampler uses seed {sampler_seed} but dataloader's config.seed is \
                {config_seed}. For proper coordination, use the same seed value"
            ))
            .into())
        }
        (Some(seed), _) | (None, Some(seed)) => Ok(seed),
        (None, None) => Ok(rand::rng().random()),
    }
}
