//! Visiting orders over a dataset.
//!
//! Index samplers (`Item = usize`) decide which sample comes next; group
//! samplers (`Item = Vec<usize>`) decide which samples travel together in one
//! batch. Every randomized sampler derives its RNG from `base_seed + epoch`,
//! so a pass is reproducible and consecutive passes differ.

use crate::error::LoaderError;
use anyhow::{ensure, Result};
use rand::distr::{weighted::WeightedIndex, Distribution};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::Arc;

/// A source of indices (or index groups) for one pass over a dataset.
///
/// `iter(epoch)` must be restartable: calling it again, for the same or another
/// epoch, starts a fresh sequence. The returned iterator owns what it needs, so
/// the loader can hold it while the sampler is shared.
///
/// `seed()` reports the base seed of randomized samplers. The loader compares
/// it with its own configured seed and refuses to run when they disagree.
pub trait Sampler: Send + Sync {
    type Item: Send + Sync + 'static;

    fn iter(&self, epoch: usize) -> Box<dyn Iterator<Item = Self::Item> + Send>;

    /// Number of items one pass yields.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn seed(&self) -> Option<u64> {
        None
    }
}

impl<S: Sampler + ?Sized> Sampler for Arc<S> {
    type Item = S::Item;

    fn iter(&self, epoch: usize) -> Box<dyn Iterator<Item = Self::Item> + Send> {
        (**self).iter(epoch)
    }

    fn len(&self) -> usize {
        (**self).len()
    }

    fn seed(&self) -> Option<u64> {
        (**self).seed()
    }
}

impl<S: Sampler + ?Sized> Sampler for Box<S> {
    type Item = S::Item;

    fn iter(&self, epoch: usize) -> Box<dyn Iterator<Item = Self::Item> + Send> {
        (**self).iter(epoch)
    }

    fn len(&self) -> usize {
        (**self).len()
    }

    fn seed(&self) -> Option<u64> {
        (**self).seed()
    }
}

fn epoch_rng(base_seed: u64, epoch: usize) -> StdRng {
    StdRng::seed_from_u64(base_seed.wrapping_add(epoch as u64))
}

fn shuffled_range(len: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(rng);
    order
}

// ================================================================================================
// Index samplers
// ================================================================================================

/// `0, 1, ..., len - 1`, the same every epoch.
#[derive(Debug, Clone)]
pub struct SequentialSampler {
    len: usize,
}

impl SequentialSampler {
    pub fn new(dataset_size: usize) -> Self {
        Self { len: dataset_size }
    }
}

impl Sampler for SequentialSampler {
    type Item = usize;

    fn iter(&self, _epoch: usize) -> Box<dyn Iterator<Item = usize> + Send> {
        Box::new(0..self.len)
    }

    fn len(&self) -> usize {
        self.len
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Draws {
    /// Every index exactly once, in a fresh order each epoch.
    Permutation,
    /// This many independent uniform picks.
    WithReplacement(usize),
}

/// Uniform random order over `0..dataset_size`.
///
/// Without replacement a pass is one permutation of the dataset and
/// `num_samples` must be left as `None`. With replacement a pass is
/// `num_samples` independent picks (default: `dataset_size`), so indices may
/// repeat.
///
/// ```ignore
/// let shuffled = RandomSampler::new(1000, false, None, 42)?;
/// let oversampled = RandomSampler::new(1000, true, Some(5000), 42)?;
/// ```
#[derive(Debug, Clone)]
pub struct RandomSampler {
    dataset_size: usize,
    draws: Draws,
    base_seed: u64,
}

impl RandomSampler {
    pub fn new(
        dataset_size: usize,
        replacement: bool,
        num_samples: Option<usize>,
        base_seed: u64,
    ) -> Result<Self> {
        let draws = match (replacement, num_samples) {
            (false, None) => Draws::Permutation,
            (false, Some(_)) => {
                return Err(LoaderError::config(
                    "With replacement=false, num_samples should not be specified, \
                    since a random permutation will be performed",
                )
                .into())
            }
            (true, requested) => {
                let count = requested.unwrap_or(dataset_size);
                ensure!(
                    requested != Some(0),
                    LoaderError::config(
                        "num_samples should be a positive integer value, but got num_samples=0"
                    )
                );
                ensure!(
                    dataset_size > 0 || count == 0,
                    LoaderError::config(format!(
                        "cannot draw {count} samples with replacement from an empty dataset"
                    ))
                );
                Draws::WithReplacement(count)
            }
        };

        Ok(Self {
            dataset_size,
            draws,
            base_seed,
        })
    }
}

impl Sampler for RandomSampler {
    type Item = usize;

    fn iter(&self, epoch: usize) -> Box<dyn Iterator<Item = usize> + Send> {
        let mut rng = epoch_rng(self.base_seed, epoch);
        match self.draws {
            Draws::Permutation => Box::new(shuffled_range(self.dataset_size, &mut rng).into_iter()),
            Draws::WithReplacement(count) => {
                let upper = self.dataset_size;
                Box::new((0..count).map(move |_| rng.random_range(0..upper)))
            }
        }
    }

    fn len(&self) -> usize {
        match self.draws {
            Draws::Permutation => self.dataset_size,
            Draws::WithReplacement(count) => count,
        }
    }

    fn seed(&self) -> Option<u64> {
        Some(self.base_seed)
    }
}

/// A fresh permutation of a fixed set of indices every epoch.
///
/// Useful for holding out part of a dataset without copying it:
/// ```ignore
/// let validation = SubsetRandomSampler::new(1000, (900..1000).collect(), 42)?;
/// ```
#[derive(Debug, Clone)]
pub struct SubsetRandomSampler {
    indices: Arc<[usize]>,
    base_seed: u64,
}

impl SubsetRandomSampler {
    pub fn new(dataset_size: usize, indices: Vec<usize>, base_seed: u64) -> Result<Self> {
        ensure!(
            !indices.is_empty(),
            LoaderError::config("SubsetRandomSampler needs at least one index")
        );

        let mut distinct = HashSet::with_capacity(indices.len());
        if let Some(bad) = indices
            .iter()
            .find(|&&index| index >= dataset_size || !distinct.insert(index))
        {
            let message = if *bad >= dataset_size {
                format!("index {bad} is out of range for a dataset of size {dataset_size}")
            } else {
                format!("index {bad} appears more than once in SubsetRandomSampler")
            };
            return Err(LoaderError::config(message).into());
        }

        Ok(Self {
            indices: indices.into(),
            base_seed,
        })
    }
}

impl Sampler for SubsetRandomSampler {
    type Item = usize;

    fn iter(&self, epoch: usize) -> Box<dyn Iterator<Item = usize> + Send> {
        let mut rng = epoch_rng(self.base_seed, epoch);
        let subset = Arc::clone(&self.indices);
        Box::new(
            shuffled_range(subset.len(), &mut rng)
                .into_iter()
                .map(move |position| subset[position]),
        )
    }

    fn len(&self) -> usize {
        self.indices.len()
    }

    fn seed(&self) -> Option<u64> {
        Some(self.base_seed)
    }
}

#[derive(Debug, Clone)]
enum WeightedDraw {
    WithReplacement(WeightedIndex<f64>),
    /// Weighted reservoir sampling over the positive-weight indices.
    WithoutReplacement,
}

/// Picks index `i` with probability proportional to `weights[i]`.
///
/// With replacement every pick is independent. Without replacement an index is
/// picked at most once, so `num_samples` cannot exceed the number of positive
/// weights. `num_samples` defaults to `weights.len()`.
///
/// ```ignore
/// // Oversample the rare class
/// let sampler = WeightedRandomSampler::new(vec![1.0, 1.0, 8.0], true, Some(300), 42)?;
/// ```
#[derive(Debug, Clone)]
pub struct WeightedRandomSampler {
    weights: Arc<[f64]>,
    draw: WeightedDraw,
    num_samples: usize,
    base_seed: u64,
}

impl WeightedRandomSampler {
    pub fn new(
        weights: Vec<f64>,
        replacement: bool,
        num_samples: Option<usize>,
        base_seed: u64,
    ) -> Result<Self> {
        ensure!(
            !weights.is_empty(),
            LoaderError::config("WeightedRandomSampler needs at least one weight")
        );
        ensure!(
            weights.iter().all(|w| w.is_finite() && *w >= 0.0),
            LoaderError::config("weights must be finite and non-negative")
        );
        let positive = weights.iter().filter(|&&w| w > 0.0).count();
        ensure!(
            positive > 0,
            LoaderError::config("at least one weight must be positive")
        );

        let num_samples = num_samples.unwrap_or(weights.len());
        ensure!(
            num_samples > 0,
            LoaderError::config(
                "num_samples should be a positive integer value, but got num_samples=0"
            )
        );

        let draw = if replacement {
            WeightedDraw::WithReplacement(WeightedIndex::new(weights.iter().copied()).map_err(
                |e| LoaderError::config(format!("invalid sampling weights: {e}")),
            )?)
        } else {
            ensure!(
                num_samples <= positive,
                LoaderError::config(format!(
                    "cannot draw {num_samples} samples without replacement from \
                    {positive} positive weights"
                ))
            );
            WeightedDraw::WithoutReplacement
        };

        Ok(Self {
            weights: weights.into(),
            draw,
            num_samples,
            base_seed,
        })
    }
}

impl Sampler for WeightedRandomSampler {
    type Item = usize;

    fn iter(&self, epoch: usize) -> Box<dyn Iterator<Item = usize> + Send> {
        let mut rng = epoch_rng(self.base_seed, epoch);

        match &self.draw {
            WeightedDraw::WithReplacement(distribution) => {
                let distribution = distribution.clone();
                Box::new((0..self.num_samples).map(move |_| distribution.sample(&mut rng)))
            }
            WeightedDraw::WithoutReplacement => {
                // Key ln(u) / w per index and keep the largest keys
                // (Efraimidis-Spirakis). Zero weights never compete.
                let mut keyed: Vec<(f64, usize)> = self
                    .weights
                    .iter()
                    .enumerate()
                    .filter(|(_, weight)| **weight > 0.0)
                    .map(|(index, &weight)| (rng.random::<f64>().ln() / weight, index))
                    .collect();
                keyed.sort_by(|a, b| b.0.total_cmp(&a.0));
                keyed.truncate(self.num_samples);
                Box::new(keyed.into_iter().map(|(_, index)| index))
            }
        }
    }

    fn len(&self) -> usize {
        self.num_samples
    }

    fn seed(&self) -> Option<u64> {
        Some(self.base_seed)
    }
}

/// One replica's share of a dataset in data-parallel training.
///
/// All replicas see the same (optionally shuffled) order and rank `r` keeps
/// positions `r, r + W, r + 2W, ...`. Nothing is padded or duplicated: with
/// `drop_last` the order is first cut to a multiple of `W` so every rank gets
/// the same count; without it the first `len % W` ranks get one extra index.
///
/// ```text
/// 10 samples, 3 replicas      drop_last=false     drop_last=true
///   rank 0                    [0, 3, 6, 9]        [0, 3, 6]
///   rank 1                    [1, 4, 7]           [1, 4, 7]
///   rank 2                    [2, 5, 8]           [2, 5, 8]
/// ```
///
/// Replicas must share `base_seed` for their shuffles to agree.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    dataset_size: usize,
    num_replicas: usize,
    rank: usize,
    shuffle: bool,
    drop_last: bool,
    base_seed: u64,
}

impl DistributedSampler {
    pub fn new(
        dataset_size: usize,
        num_replicas: usize,
        rank: usize,
        shuffle: bool,
        drop_last: bool,
        base_seed: u64,
    ) -> Result<Self> {
        ensure!(
            num_replicas > 0,
            LoaderError::config("num_replicas must be at least 1")
        );
        ensure!(
            rank < num_replicas,
            LoaderError::config(format!(
                "rank {rank} is out of range for {num_replicas} replicas"
            ))
        );
        Ok(Self {
            dataset_size,
            num_replicas,
            rank,
            shuffle,
            drop_last,
            base_seed,
        })
    }

    /// How many positions of the shared order are handed out.
    fn shared_len(&self) -> usize {
        if self.drop_last {
            self.dataset_size - self.dataset_size % self.num_replicas
        } else {
            self.dataset_size
        }
    }
}

impl Sampler for DistributedSampler {
    type Item = usize;

    fn iter(&self, epoch: usize) -> Box<dyn Iterator<Item = usize> + Send> {
        let mut order = if self.shuffle {
            shuffled_range(self.dataset_size, &mut epoch_rng(self.base_seed, epoch))
        } else {
            (0..self.dataset_size).collect()
        };
        order.truncate(self.shared_len());

        Box::new(order.into_iter().skip(self.rank).step_by(self.num_replicas))
    }

    fn len(&self) -> usize {
        let shared = self.shared_len();
        shared / self.num_replicas + usize::from(self.rank < shared % self.num_replicas)
    }

    fn seed(&self) -> Option<u64> {
        self.shuffle.then_some(self.base_seed)
    }
}

// ================================================================================================
// Group samplers
// ================================================================================================

/// Cuts an index sampler's stream into runs of `batch_size`.
///
/// The final run may be shorter; with `drop_last` it is discarded instead.
///
/// ```ignore
/// let batches = BatchSampler::new(SequentialSampler::new(10), 4, false)?;
/// // [0, 1, 2, 3], [4, 5, 6, 7], [8, 9]
/// ```
#[derive(Debug, Clone)]
pub struct BatchSampler<S> {
    sampler: S,
    batch_size: usize,
    drop_last: bool,
}

impl<S: Sampler> BatchSampler<S> {
    pub fn new(sampler: S, batch_size: usize, drop_last: bool) -> Result<Self> {
        ensure!(
            batch_size > 0,
            LoaderError::config(
                "batch_size should be a positive integer value, but got batch_size=0"
            )
        );
        Ok(Self {
            sampler,
            batch_size,
            drop_last,
        })
    }
}

struct Runs<T> {
    source: Box<dyn Iterator<Item = T> + Send>,
    size: usize,
    drop_last: bool,
}

impl<T> Iterator for Runs<T> {
    type Item = Vec<T>;

    fn next(&mut self) -> Option<Vec<T>> {
        let run: Vec<T> = self.source.by_ref().take(self.size).collect();
        let complete = run.len() == self.size;
        (complete || (!self.drop_last && !run.is_empty())).then_some(run)
    }
}

impl<S: Sampler> Sampler for BatchSampler<S> {
    type Item = Vec<S::Item>;

    fn iter(&self, epoch: usize) -> Box<dyn Iterator<Item = Self::Item> + Send> {
        Box::new(Runs {
            source: self.sampler.iter(epoch),
            size: self.batch_size,
            drop_last: self.drop_last,
        })
    }

    fn len(&self) -> usize {
        let indices = self.sampler.len();
        if self.drop_last {
            indices / self.batch_size
        } else {
            indices.div_ceil(self.batch_size)
        }
    }

    fn seed(&self) -> Option<u64> {
        self.sampler.seed()
    }
}

/// Replays caller-chosen index groups, unchanged, every epoch.
///
/// Groups need not be contiguous or of equal size, e.g.
/// `[[0, 1], [2, 3, 4], [5, 6], [7, 8, 9]]`.
#[derive(Debug, Clone)]
pub struct FixedBatchSampler {
    groups: Arc<[Vec<usize>]>,
}

impl FixedBatchSampler {
    pub fn new(groups: Vec<Vec<usize>>) -> Self {
        Self {
            groups: groups.into(),
        }
    }
}

impl Sampler for FixedBatchSampler {
    type Item = Vec<usize>;

    fn iter(&self, _epoch: usize) -> Box<dyn Iterator<Item = Vec<usize>> + Send> {
        let groups = Arc::clone(&self.groups);
        Box::new((0..groups.len()).map(move |i| groups[i].clone()))
    }

    fn len(&self) -> usize {
        self.groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: u64 = 7;

    fn drain<S: Sampler>(sampler: &S, epoch: usize) -> Vec<S::Item> {
        sampler.iter(epoch).collect()
    }

    fn is_configuration_error<T>(result: Result<T>) -> bool {
        result.is_err_and(|e| {
            matches!(
                e.downcast_ref::<LoaderError>(),
                Some(LoaderError::Configuration(_))
            )
        })
    }

    #[test]
    fn invalid_arguments_are_configuration_errors() {
        assert!(is_configuration_error(RandomSampler::new(0, true, Some(2), SEED)));
        assert!(is_configuration_error(SubsetRandomSampler::new(5, vec![0, 5], SEED)));
        assert!(is_configuration_error(WeightedRandomSampler::new(vec![0.0], true, None, SEED)));
        assert!(is_configuration_error(WeightedRandomSampler::new(vec![1.0], false, Some(2), SEED)));
        assert!(is_configuration_error(DistributedSampler::new(8, 4, 4, false, false, SEED)));
        assert!(is_configuration_error(BatchSampler::new(SequentialSampler::new(3), 0, false)));
    }

    mod index_sampler_tests {
        use super::*;

        #[test]
        fn sequential_counts_up() {
            let sampler = SequentialSampler::new(5);
            assert_eq!(drain(&sampler, 3), vec![0, 1, 2, 3, 4]);
            assert!(SequentialSampler::new(0).is_empty());
        }

        #[test]
        fn permutation_covers_every_index_once() -> Result<()> {
            let sampler = RandomSampler::new(50, false, None, SEED)?;
            let mut order = drain(&sampler, 0);
            assert_eq!(order.len(), sampler.len());
            order.sort_unstable();
            assert_eq!(order, (0..50).collect::<Vec<_>>());
            assert_eq!(RandomSampler::new(0, false, None, SEED)?.iter(0).count(), 0);
            Ok(())
        }

        #[test]
        fn num_samples_requires_replacement() {
            let err = RandomSampler::new(10, false, Some(5), SEED).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<LoaderError>(),
                Some(LoaderError::Configuration(message)) if message.contains("num_samples")
            ));
            assert!(RandomSampler::new(10, true, Some(0), SEED).is_err());
            assert!(RandomSampler::new(0, true, Some(2), SEED).is_err());
            assert!(RandomSampler::new(10, true, Some(25), SEED).is_ok());
        }

        #[test]
        fn replacement_draws_the_requested_count() -> Result<()> {
            let sampler = RandomSampler::new(4, true, Some(40), SEED)?;
            let draws = drain(&sampler, 0);
            assert_eq!(draws.len(), 40);
            assert_eq!(sampler.len(), 40);
            assert!(draws.iter().all(|&i| i < 4));
            // 40 picks out of 4 values must repeat
            assert!(draws.iter().collect::<HashSet<_>>().len() < draws.len());
            Ok(())
        }

        #[test]
        fn order_depends_only_on_seed_and_epoch() -> Result<()> {
            let a = RandomSampler::new(64, false, None, SEED)?;
            let b = RandomSampler::new(64, false, None, SEED)?;
            assert_eq!(drain(&a, 2), drain(&b, 2));
            assert_ne!(drain(&a, 2), drain(&a, 3));
            Ok(())
        }

        #[test]
        fn subset_permutes_only_its_indices() -> Result<()> {
            let sampler = SubsetRandomSampler::new(100, vec![5, 50, 95, 17], SEED)?;
            let seen: HashSet<usize> = drain(&sampler, 0).into_iter().collect();
            assert_eq!(seen, HashSet::from([5, 17, 50, 95]));

            let wide = SubsetRandomSampler::new(100, (0..30).collect(), SEED)?;
            assert_ne!(drain(&wide, 0), drain(&wide, 1));
            Ok(())
        }

        #[test]
        fn subset_rejects_bad_indices() {
            assert!(SubsetRandomSampler::new(5, vec![], SEED).is_err());
            assert!(SubsetRandomSampler::new(5, vec![0, 5], SEED).is_err());
            assert!(SubsetRandomSampler::new(5, vec![2, 2], SEED).is_err());
        }
    }

    mod weighted_sampler_tests {
        use super::*;

        #[test]
        fn rejects_unusable_weights() {
            assert!(WeightedRandomSampler::new(vec![], true, None, SEED).is_err());
            assert!(WeightedRandomSampler::new(vec![1.0, -1.0], true, None, SEED).is_err());
            assert!(WeightedRandomSampler::new(vec![0.0, 0.0], true, None, SEED).is_err());
            assert!(WeightedRandomSampler::new(vec![1.0, f64::NAN], true, None, SEED).is_err());
            // Only two indices can be drawn without replacement
            assert!(WeightedRandomSampler::new(vec![1.0, 0.0, 1.0], false, Some(3), SEED).is_err());
        }

        #[test]
        fn zero_weight_is_never_drawn() -> Result<()> {
            let sampler = WeightedRandomSampler::new(vec![2.0, 0.0, 1.0], true, Some(200), SEED)?;
            assert!(drain(&sampler, 0).iter().all(|&i| i != 1));
            Ok(())
        }

        #[test]
        fn heavy_weight_dominates() -> Result<()> {
            let sampler = WeightedRandomSampler::new(vec![1.0, 19.0], true, Some(2000), SEED)?;
            let heavy = drain(&sampler, 0).iter().filter(|&&i| i == 1).count();
            assert!(heavy > 1700, "heavy index drawn {heavy} times");
            Ok(())
        }

        #[test]
        fn without_replacement_draws_distinct_indices() -> Result<()> {
            let sampler = WeightedRandomSampler::new(vec![3.0, 1.0, 0.5, 2.0, 0.0], false, Some(4), SEED)?;
            let picks = drain(&sampler, 0);
            let distinct: HashSet<usize> = picks.iter().copied().collect();
            assert_eq!(picks.len(), 4);
            assert_eq!(distinct, HashSet::from([0, 1, 2, 3]));
            Ok(())
        }
    }

    mod distributed_sampler_tests {
        use super::*;

        #[test]
        fn validates_rank() {
            assert!(DistributedSampler::new(8, 0, 0, false, false, SEED).is_err());
            assert!(DistributedSampler::new(8, 4, 4, false, false, SEED).is_err());
        }

        #[test]
        fn strided_shares_without_padding() -> Result<()> {
            let shares = (0..3)
                .map(|rank| {
                    let sampler = DistributedSampler::new(10, 3, rank, false, false, SEED)?;
                    let share = drain(&sampler, 0);
                    assert_eq!(share.len(), sampler.len());
                    Ok(share)
                })
                .collect::<Result<Vec<_>>>()?;
            assert_eq!(shares, vec![vec![0, 3, 6, 9], vec![1, 4, 7], vec![2, 5, 8]]);
            Ok(())
        }

        #[test]
        fn drop_last_equalizes_shares() -> Result<()> {
            let last = DistributedSampler::new(10, 3, 0, false, true, SEED)?;
            assert_eq!(drain(&last, 0), vec![0, 3, 6]);

            let mut assigned = HashSet::new();
            for rank in 0..4 {
                let sampler = DistributedSampler::new(9, 4, rank, true, true, SEED)?;
                assert_eq!(sampler.len(), 2);
                for index in sampler.iter(5) {
                    assert!(assigned.insert(index), "index {index} handed to two ranks");
                }
            }
            assert_eq!(assigned.len(), 8);
            Ok(())
        }

        #[test]
        fn shuffle_follows_the_epoch() -> Result<()> {
            let sampler = DistributedSampler::new(80, 2, 1, true, false, SEED)?;
            assert_eq!(drain(&sampler, 4), drain(&sampler, 4));
            assert_ne!(drain(&sampler, 4), drain(&sampler, 5));
            assert_eq!(sampler.seed(), Some(SEED));
            assert_eq!(DistributedSampler::new(80, 2, 1, false, false, SEED)?.seed(), None);
            Ok(())
        }
    }

    mod group_sampler_tests {
        use super::*;

        #[test]
        fn keeps_short_tail_by_default() -> Result<()> {
            let sampler = BatchSampler::new(SequentialSampler::new(7), 3, false)?;
            assert_eq!(drain(&sampler, 0), vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
            assert_eq!(sampler.len(), 3);
            Ok(())
        }

        #[test]
        fn drop_last_discards_short_tail() -> Result<()> {
            let sampler = BatchSampler::new(SequentialSampler::new(7), 3, true)?;
            assert_eq!(drain(&sampler, 0), vec![vec![0, 1, 2], vec![3, 4, 5]]);
            assert_eq!(sampler.len(), 2);

            let exact = BatchSampler::new(SequentialSampler::new(6), 3, true)?;
            assert_eq!(exact.iter(0).count(), 2);
            Ok(())
        }

        #[test]
        fn batch_size_must_be_positive() {
            assert!(BatchSampler::new(SequentialSampler::new(3), 0, false).is_err());
        }

        #[test]
        fn inherits_the_inner_seed() -> Result<()> {
            let inner = RandomSampler::new(12, false, None, SEED)?;
            let sampler = BatchSampler::new(inner, 5, false)?;
            assert_eq!(sampler.seed(), Some(SEED));

            let mut flat: Vec<usize> = sampler.iter(1).flatten().collect();
            flat.sort_unstable();
            assert_eq!(flat, (0..12).collect::<Vec<_>>());
            Ok(())
        }

        #[test]
        fn fixed_groups_replay_unchanged() {
            let groups = vec![vec![0, 1], vec![2, 3, 4], vec![5, 6], vec![7, 8, 9]];
            let sampler = FixedBatchSampler::new(groups.clone());
            assert_eq!(sampler.len(), 4);
            assert_eq!(drain(&sampler, 0), groups);
            assert_eq!(drain(&sampler, 9), groups);
        }
    }
}
