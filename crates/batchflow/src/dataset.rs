use crate::sample::{Sample, Tensor};
use anyhow::{anyhow, ensure, Context, Result};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, SeedableRng};
use std::sync::Arc;

/// Samples addressable by position.
///
/// The loader asks for `len()` again at the start of every pass, so the size
/// may change between epochs. Implementations are shared with worker threads
/// and must be `Send + Sync`.
pub trait Dataset: Send + Sync {
    type Item;

    fn len(&self) -> usize;

    fn get(&self, index: usize) -> Result<Self::Item>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A dataset that can only be consumed as a stream.
///
/// `iter()` is called once per worker per pass. Inside a worker,
/// [`worker_info`](crate::dataloader::worker_info) is already set, so an
/// implementation can shard itself to avoid every worker replaying the full
/// stream.
pub trait IterableDataset: Send + Sync {
    type Item;

    fn iter(&self) -> Result<Box<dyn Iterator<Item = Result<Self::Item>> + Send>>;
}

impl<D: Dataset + ?Sized> Dataset for Arc<D> {
    type Item = D::Item;

    fn len(&self) -> usize {
        (**self).len()
    }

    fn get(&self, index: usize) -> Result<Self::Item> {
        (**self).get(index)
    }
}

impl<D: IterableDataset + ?Sized> IterableDataset for Arc<D> {
    type Item = D::Item;

    fn iter(&self) -> Result<Box<dyn Iterator<Item = Result<Self::Item>> + Send>> {
        (**self).iter()
    }
}

impl<T: Clone + Send + Sync> Dataset for Vec<T> {
    type Item = T;

    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn get(&self, index: usize) -> Result<T> {
        self.as_slice()
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow!("index {index} is out of range for a dataset of {} samples", self.len()))
    }
}

/// Owned samples behind an `Arc<[T]>`.
///
/// Clones share the same storage, which is what workers get when the loader
/// runs on threads.
#[derive(Debug, Clone)]
pub struct InMemoryDataset<T = Sample> {
    samples: Arc<[T]>,
}

impl<T> InMemoryDataset<T> {
    pub fn new(samples: Vec<T>) -> Self {
        Self {
            samples: samples.into(),
        }
    }

    pub fn as_slice(&self) -> &[T] {
        &self.samples
    }
}

impl<T> From<Vec<T>> for InMemoryDataset<T> {
    fn from(samples: Vec<T>) -> Self {
        Self::new(samples)
    }
}

impl<T: Clone + Send + Sync> Dataset for InMemoryDataset<T> {
    type Item = T;

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<T> {
        self.samples.get(index).cloned().ok_or_else(|| {
            anyhow!(
                "index {index} is out of range for a dataset of {} samples",
                self.samples.len()
            )
        })
    }
}

/// Row-aligned tensors indexed together along their first dimension.
///
/// `get(i)` returns a `Sample::List` holding row `i` of every tensor,
/// so `(features, labels)` pairs collate into `(stacked_features, stacked_labels)`.
#[derive(Debug, Clone)]
pub struct TensorDataset {
    tensors: Vec<Tensor>,
    rows: usize,
}

impl TensorDataset {
    pub fn new(tensors: Vec<Tensor>) -> Result<Self> {
        ensure!(!tensors.is_empty(), "TensorDataset needs at least one tensor");
        let rows = *tensors[0]
            .shape()
            .first()
            .ok_or_else(|| anyhow!("TensorDataset tensors must have at least one dimension"))?;
        for (i, tensor) in tensors.iter().enumerate() {
            ensure!(
                tensor.shape().first() == Some(&rows),
                "Size mismatch between tensors: tensor {} has shape {:?}, expected {} rows",
                i,
                tensor.shape(),
                rows
            );
        }
        Ok(Self { tensors, rows })
    }
}

impl Dataset for TensorDataset {
    type Item = Sample;

    fn len(&self) -> usize {
        self.rows
    }

    fn get(&self, index: usize) -> Result<Sample> {
        self.tensors
            .iter()
            .map(|tensor| tensor.select(index).map(Sample::Tensor))
            .collect::<Result<Vec<_>>>()
            .map(Sample::List)
    }
}

/// The concatenation of several datasets, indexed end to end.
#[derive(Debug, Clone)]
pub struct ConcatDataset<D> {
    datasets: Vec<D>,
    cumulative_sizes: Vec<usize>,
}

impl<D: Dataset> ConcatDataset<D> {
    pub fn new(datasets: Vec<D>) -> Result<Self> {
        ensure!(!datasets.is_empty(), "ConcatDataset needs at least one dataset");
        let cumulative_sizes = datasets
            .iter()
            .scan(0usize, |total, dataset| {
                *total += dataset.len();
                Some(*total)
            })
            .collect();
        Ok(Self {
            datasets,
            cumulative_sizes,
        })
    }

    pub fn cumulative_sizes(&self) -> &[usize] {
        &self.cumulative_sizes
    }
}

impl<D: Dataset> Dataset for ConcatDataset<D> {
    type Item = D::Item;

    fn len(&self) -> usize {
        self.cumulative_sizes.last().copied().unwrap_or(0)
    }

    fn get(&self, index: usize) -> Result<D::Item> {
        ensure!(
            index < self.len(),
            "Index {} out of range for dataset of size {}",
            index,
            self.len()
        );
        let which = self.cumulative_sizes.partition_point(|&end| end <= index);
        let offset = if which == 0 {
            0
        } else {
            self.cumulative_sizes[which - 1]
        };
        self.datasets[which].get(index - offset)
    }
}

/// A view of `dataset` restricted to `indices`.
#[derive(Debug, Clone)]
pub struct Subset<D> {
    dataset: D,
    indices: Vec<usize>,
}

impl<D: Dataset> Subset<D> {
    pub fn new(dataset: D, indices: Vec<usize>) -> Self {
        Self { dataset, indices }
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }
}

impl<D: Dataset> Dataset for Subset<D> {
    type Item = D::Item;

    fn len(&self) -> usize {
        self.indices.len()
    }

    fn get(&self, index: usize) -> Result<D::Item> {
        let &inner = self.indices.as_slice().get(index).ok_or_else(|| {
            anyhow!(
                "Index {} out of range for subset of size {}",
                index,
                self.indices.len()
            )
        })?;
        self.dataset
            .get(inner)
            .with_context(|| format!("Failed to fetch subset index {index} (dataset index {inner})"))
    }
}

/// Randomly splits `dataset` into non-overlapping subsets of the given lengths.
///
/// The permutation is drawn from `StdRng::seed_from_u64(seed)`, so the same
/// seed always yields the same split.
pub fn random_split<D: Dataset>(
    dataset: Arc<D>,
    lengths: &[usize],
    seed: u64,
) -> Result<Vec<Subset<Arc<D>>>> {
    let total: usize = lengths.iter().sum();
    ensure!(
        total == dataset.len(),
        "Sum of input lengths ({}) does not equal the length of the input dataset ({})",
        total,
        dataset.len()
    );

    let mut permutation: Vec<usize> = (0..total).collect();
    permutation.shuffle(&mut StdRng::seed_from_u64(seed));

    let mut start = 0;
    Ok(lengths
        .iter()
        .map(|&length| {
            let indices = permutation[start..start + length].to_vec();
            start += length;
            Subset::new(Arc::clone(&dataset), indices)
        })
        .collect())
}
