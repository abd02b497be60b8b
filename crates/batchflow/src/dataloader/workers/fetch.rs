//! Fetchers: the piece of a worker that turns one request into one batch.
//!
//! A [`FetcherFactory`] is shared with every worker and builds a fresh
//! [`Fetcher`] inside it, after the worker's identity is set. Streaming
//! datasets rely on that ordering to shard themselves when the stream opens.

use crate::collator::Collator;
use crate::dataset::{Dataset, IterableDataset};
use crate::error::FailureKind;
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;

/// One unit of work for a fetcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FetchRequest {
    Indices(Vec<usize>),
    Next,
}

/// How fetched samples are grouped for one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Batching {
    /// `false` delivers each sample through `Collator::convert`
    pub(crate) auto_collation: bool,
    /// Stream batching only; random-access batches come pre-grouped.
    pub(crate) batch_size: Option<usize>,
    pub(crate) drop_last: bool,
}

/// A failure inside a fetcher, tagged with the stage that produced it.
#[derive(Debug)]
pub(crate) struct FetchError {
    pub(crate) kind: FailureKind,
    pub(crate) error: anyhow::Error,
}

impl FetchError {
    fn fetch(error: anyhow::Error) -> Self {
        Self {
            kind: FailureKind::Fetch,
            error,
        }
    }

    fn collate(error: anyhow::Error) -> Self {
        Self {
            kind: FailureKind::Collate,
            error,
        }
    }
}

pub(crate) trait Fetcher<B>: Send {
    /// `Ok(None)` means the source is exhausted.
    fn fetch(&mut self, request: FetchRequest) -> Result<Option<B>, FetchError>;
}

pub(crate) trait FetcherFactory<B>: Send + Sync {
    fn create(&self, batching: Batching) -> Result<Box<dyn Fetcher<B>>>;
}

/// ============================================================================
/// Random-access fetching: `get` every index, then collate.
pub(crate) struct MapFetcherFactory<D, C> {
    dataset: Arc<D>,
    collator: Arc<C>,
}

impl<D, C> MapFetcherFactory<D, C> {
    pub(crate) fn new(dataset: Arc<D>, collator: Arc<C>) -> Self {
        Self { dataset, collator }
    }
}

impl<D, C> FetcherFactory<C::Batch> for MapFetcherFactory<D, C>
where
    D: Dataset + 'static,
    C: Collator<D::Item> + 'static,
{
    fn create(&self, batching: Batching) -> Result<Box<dyn Fetcher<C::Batch>>> {
        Ok(Box::new(MapFetcher {
            dataset: Arc::clone(&self.dataset),
            collator: Arc::clone(&self.collator),
            auto_collation: batching.auto_collation,
        }))
    }
}

struct MapFetcher<D, C> {
    dataset: Arc<D>,
    collator: Arc<C>,
    auto_collation: bool,
}

impl<D, C> Fetcher<C::Batch> for MapFetcher<D, C>
where
    D: Dataset,
    C: Collator<D::Item>,
{
    fn fetch(&mut self, request: FetchRequest) -> Result<Option<C::Batch>, FetchError> {
        let indices = match request {
            FetchRequest::Indices(indices) => indices,
            FetchRequest::Next => {
                return Err(FetchError::fetch(anyhow!(
                    "a random-access dataset cannot serve stream requests"
                )))
            }
        };

        let mut samples = indices
            .iter()
            .map(|&index| {
                self.dataset
                    .get(index)
                    .with_context(|| format!("Failed to fetch sample at index {index}"))
            })
            .collect::<Result<Vec<_>>>()
            .map_err(FetchError::fetch)?;

        let batch = if self.auto_collation {
            self.collator.collate(samples)
        } else {
            let sample = samples
                .pop()
                .ok_or_else(|| FetchError::fetch(anyhow!("received an empty index group")))?;
            self.collator.convert(sample)
        };
        batch.map(Some).map_err(FetchError::collate)
    }
}

/// ============================================================================
/// Streaming: each worker opens its own stream and batches it locally.
pub(crate) struct StreamFetcherFactory<D, C> {
    dataset: Arc<D>,
    collator: Arc<C>,
}

impl<D, C> StreamFetcherFactory<D, C> {
    pub(crate) fn new(dataset: Arc<D>, collator: Arc<C>) -> Self {
        Self { dataset, collator }
    }
}

impl<D, C> FetcherFactory<C::Batch> for StreamFetcherFactory<D, C>
where
    D: IterableDataset + 'static,
    D::Item: 'static,
    C: Collator<D::Item> + 'static,
{
    fn create(&self, batching: Batching) -> Result<Box<dyn Fetcher<C::Batch>>> {
        let stream = self
            .dataset
            .iter()
            .context("Failed to open the dataset stream")?;
        Ok(Box::new(StreamFetcher {
            stream: Some(stream),
            collator: Arc::clone(&self.collator),
            batching,
        }))
    }
}

struct StreamFetcher<T, C> {
    stream: Option<Box<dyn Iterator<Item = Result<T>> + Send>>,
    collator: Arc<C>,
    batching: Batching,
}

impl<T, C> Fetcher<C::Batch> for StreamFetcher<T, C>
where
    C: Collator<T>,
{
    fn fetch(&mut self, request: FetchRequest) -> Result<Option<C::Batch>, FetchError> {
        if let FetchRequest::Indices(_) = request {
            return Err(FetchError::fetch(anyhow!(
                "a streaming dataset cannot be indexed"
            )));
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };

        let batch_size = match self.batching.batch_size {
            Some(batch_size) if self.batching.auto_collation => batch_size,
            _ => {
                return match stream.next() {
                    Some(Ok(sample)) => self
                        .collator
                        .convert(sample)
                        .map(Some)
                        .map_err(FetchError::collate),
                    Some(Err(e)) => Err(FetchError::fetch(e)),
                    None => {
                        self.stream = None;
                        Ok(None)
                    }
                };
            }
        };

        let mut samples = Vec::with_capacity(batch_size);
        let mut exhausted = false;
        while samples.len() < batch_size {
            match stream.next() {
                Some(Ok(sample)) => samples.push(sample),
                Some(Err(e)) => return Err(FetchError::fetch(e)),
                None => {
                    exhausted = true;
                    break;
                }
            }
        }
        if exhausted {
            self.stream = None;
        }

        if samples.is_empty() || (self.batching.drop_last && samples.len() < batch_size) {
            return Ok(None);
        }
        self.collator
            .collate(samples)
            .map(Some)
            .map_err(FetchError::collate)
    }
}

#[cfg(test)]
mod fetcher_tests {
    use super::*;
    use crate::collator::{CollateFn, StackCollator};
    use crate::sample::Sample;

    struct CountingStream(usize);

    impl IterableDataset for CountingStream {
        type Item = Sample;

        fn iter(&self) -> Result<Box<dyn Iterator<Item = Result<Sample>> + Send>> {
            Ok(Box::new((0..self.0 as i64).map(|i| Ok(Sample::Int(i)))))
        }
    }

    fn batching(batch_size: Option<usize>, drop_last: bool) -> Batching {
        Batching {
            auto_collation: batch_size.is_some(),
            batch_size,
            drop_last,
        }
    }

    #[test]
    fn map_fetcher_collates_requested_indices() -> Result<()> {
        let dataset: Arc<Vec<Sample>> = Arc::new((0..10).map(Sample::Int).collect());
        let factory = MapFetcherFactory::new(dataset, Arc::new(StackCollator));
        let mut fetcher = factory.create(batching(Some(3), false))?;

        let batch = fetcher
            .fetch(FetchRequest::Indices(vec![7, 2, 5]))
            .map_err(|e| e.error)?
            .unwrap();
        assert_eq!(batch.as_tensor()?.to_vec::<i64>()?, vec![7, 2, 5]);
        Ok(())
    }

    #[test]
    fn map_fetcher_tags_failing_stage() -> Result<()> {
        let dataset = Arc::new(vec![1i64, 2, 3]);
        let collator = CollateFn::new(|samples: Vec<i64>| -> Result<i64> {
            anyhow::ensure!(samples.len() < 3, "too many samples");
            Ok(samples.iter().sum())
        });
        let mut fetcher =
            MapFetcherFactory::new(dataset, Arc::new(collator)).create(batching(Some(3), false))?;

        let err = fetcher.fetch(FetchRequest::Indices(vec![0, 9])).unwrap_err();
        assert_eq!(err.kind, FailureKind::Fetch);
        assert!(format!("{:#}", err.error).contains("index 9"));

        let err = fetcher.fetch(FetchRequest::Indices(vec![0, 1, 2])).unwrap_err();
        assert_eq!(err.kind, FailureKind::Collate);

        assert!(fetcher.fetch(FetchRequest::Next).is_err());
        Ok(())
    }

    #[test]
    fn stream_fetcher_batches_and_keeps_tail() -> Result<()> {
        let factory = StreamFetcherFactory::new(Arc::new(CountingStream(5)), Arc::new(StackCollator));
        let mut fetcher = factory.create(batching(Some(2), false))?;

        let mut sizes = Vec::new();
        while let Some(batch) = fetcher.fetch(FetchRequest::Next).map_err(|e| e.error)? {
            sizes.push(batch.as_tensor()?.shape()[0]);
        }
        assert_eq!(sizes, vec![2, 2, 1]);
        // stays exhausted
        assert!(fetcher.fetch(FetchRequest::Next).map_err(|e| e.error)?.is_none());
        Ok(())
    }

    #[test]
    fn stream_fetcher_drop_last_and_unbatched() -> Result<()> {
        let factory = StreamFetcherFactory::new(Arc::new(CountingStream(5)), Arc::new(StackCollator));

        let mut dropping = factory.create(batching(Some(2), true))?;
        let mut count = 0;
        while dropping.fetch(FetchRequest::Next).map_err(|e| e.error)?.is_some() {
            count += 1;
        }
        assert_eq!(count, 2);

        let mut unbatched = factory.create(batching(None, false))?;
        let mut values = Vec::new();
        while let Some(sample) = unbatched.fetch(FetchRequest::Next).map_err(|e| e.error)? {
            values.push(sample.as_int()?);
        }
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
        Ok(())
    }
}
