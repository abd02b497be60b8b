use crate::error::LoaderError;
use std::time::Duration;

/// Where the workers of a pass run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// Forked children connected by a socket pair. Unix only. A child killed
    /// by a signal surfaces as `LoaderError::WorkerCrashed`.
    Process,
    /// Threads of the consumer process. A panicking worker is reported, an
    /// aborting one is not survivable. Threads cannot be killed either: one
    /// still stuck in user code after `shutdown_grace` is detached and
    /// outlives the pass until that code returns.
    Thread,
}

impl Default for WorkerMode {
    fn default() -> Self {
        if cfg!(unix) {
            Self::Process
        } else {
            Self::Thread
        }
    }
}

/// Settings of a [`DataLoader`](super::DataLoader). Build one with
/// [`DataLoaderConfig::builder`] or start from `Default` and assign fields.
#[derive(Debug, Clone)]
pub struct DataLoaderConfig {
    /// Samples per batch. `None` yields every sample alone, passed through
    /// `Collator::convert`.
    pub batch_size: Option<usize>,
    /// Fresh random order every epoch. Cannot be combined with a custom
    /// sampler or batch sampler.
    pub shuffle: bool,
    /// Discard a final batch shorter than `batch_size`.
    pub drop_last: bool,
    /// `0` loads inline on the consumer's thread.
    pub num_workers: usize,
    pub worker_mode: WorkerMode,
    /// Tasks in flight per worker.
    pub prefetch_factor: usize,
    /// Longest wait for the next batch. Zero means no limit.
    pub timeout: Duration,
    /// Wake-up period for liveness and shutdown checks while blocked.
    pub status_check_interval: Duration,
    /// Time a stopping worker gets before it is killed.
    pub shutdown_grace: Duration,
    /// Base seed for the default shuffle and for worker RNGs. When unset the
    /// loader draws one at construction.
    pub seed: Option<u64>,
    /// Route delivered batches through the loader's `PinMemory` hook.
    pub pin_memory: bool,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: Some(1),
            shuffle: false,
            drop_last: false,
            num_workers: 0,
            worker_mode: WorkerMode::default(),
            prefetch_factor: 2,
            timeout: Duration::ZERO,
            status_check_interval: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(5),
            seed: None,
            pin_memory: false,
        }
    }
}

impl DataLoaderConfig {
    pub fn builder() -> DataLoaderConfigBuilder {
        DataLoaderConfigBuilder::default()
    }

    /// `None` when waiting is unbounded.
    pub fn timeout(&self) -> Option<Duration> {
        (!self.timeout.is_zero()).then_some(self.timeout)
    }

    /// Rejects settings that are wrong on their own, before any dataset or
    /// sampler is looked at.
    pub fn validate(&self) -> Result<(), LoaderError> {
        let parallel = self.num_workers > 0;
        let violations = [
            (
                self.batch_size == Some(0),
                "batch_size should be a positive integer value, but got batch_size=0",
            ),
            (
                parallel && self.prefetch_factor == 0,
                "prefetch_factor must be at least 1 when num_workers > 0",
            ),
            (
                parallel && self.status_check_interval.is_zero(),
                "status_check_interval must be non-zero when num_workers > 0",
            ),
            (
                parallel && self.worker_mode == WorkerMode::Process && !cfg!(unix),
                "process workers are only supported on unix; use WorkerMode::Thread",
            ),
        ];

        match violations.iter().find(|(violated, _)| *violated) {
            Some((_, message)) => Err(LoaderError::config(*message)),
            None => Ok(()),
        }
    }
}

/// Chainable construction of a [`DataLoaderConfig`].
///
/// ```ignore
/// let config = DataLoaderConfig::builder()
///     .batch_size(16)
///     .num_workers(2)
///     .worker_mode(WorkerMode::Thread)
///     .timeout(Duration::from_secs(10))
///     .build();
/// ```
#[derive(Default)]
pub struct DataLoaderConfigBuilder {
    config: DataLoaderConfig,
}

impl DataLoaderConfigBuilder {
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = Some(size);
        self
    }

    /// Yield samples individually instead of batches.
    pub fn unbatched(mut self) -> Self {
        self.config.batch_size = None;
        self
    }

    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.config.shuffle = shuffle;
        self
    }

    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.config.drop_last = drop_last;
        self
    }

    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.config.num_workers = num_workers;
        self
    }

    pub fn worker_mode(mut self, mode: WorkerMode) -> Self {
        self.config.worker_mode = mode;
        self
    }

    pub fn prefetch_factor(mut self, factor: usize) -> Self {
        self.config.prefetch_factor = factor;
        self
    }

    /// A slow but healthy worker trips a short timeout; a long one delays
    /// noticing a stuck worker.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn status_check_interval(mut self, interval: Duration) -> Self {
        self.config.status_check_interval = interval;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    /// Fixes the default shuffle order and every worker seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    pub fn pin_memory(mut self, pin_memory: bool) -> Self {
        self.config.pin_memory = pin_memory;
        self
    }

    pub fn build(self) -> DataLoaderConfig {
        self.config
    }
}
