use crate::error::CollateError;
use crate::sample::{Sample, Tensor};
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::marker::PhantomData;

/// A `Collator` defines how fetched samples are combined into a batch.
///
/// `collate` is used when the loader groups indices into batches;
/// `convert` is used in unbatched mode (`batch_size = None`), where every
/// sample is delivered on its own.
///
/// The batch type must be serializable because process workers frame it
/// back to the consumer.
pub trait Collator<T>: Send + Sync {
    type Batch: Serialize + DeserializeOwned + Send + 'static;

    fn collate(&self, samples: Vec<T>) -> Result<Self::Batch>;

    fn convert(&self, sample: T) -> Result<Self::Batch>;
}

/// The default collation rules for [`Sample`]s.
///
/// Leaves of the same kind are batched (numbers into a 1-D tensor, tensors
/// stacked along dim 0, strings into a list) while lists and maps keep their
/// structure and are collated position-wise and key-wise. Any structural
/// mismatch is reported as a [`CollateError`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StackCollator;

impl Collator<Sample> for StackCollator {
    type Batch = Sample;

    fn collate(&self, samples: Vec<Sample>) -> Result<Sample> {
        collate_samples(samples)
    }

    /// Unbatched samples pass through untouched.
    fn convert(&self, sample: Sample) -> Result<Sample> {
        Ok(sample)
    }
}

/// Recursively collates a list of structurally identical samples.
pub fn collate_samples(samples: Vec<Sample>) -> Result<Sample> {
    let expected = samples.first().ok_or(CollateError::Empty)?.kind_name();

    let mismatch = |position: usize, found: &Sample| CollateError::TypeMismatch {
        position,
        expected,
        found: found.kind_name(),
    };

    let batch = match &samples[0] {
        Sample::Int(_) => {
            let values = samples
                .iter()
                .enumerate()
                .map(|(i, s)| match s {
                    Sample::Int(v) => Ok(*v),
                    other => Err(mismatch(i, other)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Sample::Tensor(Tensor::from_vec(values))
        }
        Sample::Float(_) => {
            let values = samples
                .iter()
                .enumerate()
                .map(|(i, s)| match s {
                    Sample::Float(v) => Ok(*v),
                    other => Err(mismatch(i, other)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Sample::Tensor(Tensor::from_vec(values))
        }
        Sample::Bool(_) => {
            let values = samples
                .iter()
                .enumerate()
                .map(|(i, s)| match s {
                    Sample::Bool(v) => Ok(*v),
                    other => Err(mismatch(i, other)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Sample::Tensor(Tensor::from_vec(values))
        }
        Sample::Str(_) => {
            for (i, s) in samples.iter().enumerate() {
                if !matches!(s, Sample::Str(_)) {
                    return Err(mismatch(i, s).into());
                }
            }
            Sample::List(samples)
        }
        Sample::Tensor(first) => {
            let tensors = samples
                .iter()
                .enumerate()
                .map(|(i, s)| match s {
                    Sample::Tensor(t) if t.shape() == first.shape() && t.dtype() == first.dtype() => {
                        Ok(t)
                    }
                    Sample::Tensor(t) => Err(CollateError::TensorMismatch {
                        position: i,
                        expected: first.shape().to_vec(),
                        found: t.shape().to_vec(),
                        expected_dtype: first.dtype(),
                        found_dtype: t.dtype(),
                    }),
                    other => Err(mismatch(i, other)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Sample::Tensor(Tensor::stack(&tensors)?)
        }
        Sample::List(first) => {
            let width = first.len();
            let mut columns: Vec<Vec<Sample>> =
                (0..width).map(|_| Vec::with_capacity(samples.len())).collect();
            for (i, s) in samples.into_iter().enumerate() {
                match s {
                    Sample::List(items) if items.len() == width => {
                        for (column, item) in columns.iter_mut().zip(items) {
                            column.push(item);
                        }
                    }
                    Sample::List(items) => {
                        return Err(CollateError::LengthMismatch {
                            position: i,
                            expected: width,
                            found: items.len(),
                        }
                        .into())
                    }
                    other => return Err(mismatch(i, &other).into()),
                }
            }
            Sample::List(
                columns
                    .into_iter()
                    .map(collate_samples)
                    .collect::<Result<Vec<_>>>()?,
            )
        }
        Sample::Map(first) => {
            let keys: Vec<String> = first.keys().cloned().collect();
            let mut columns: BTreeMap<String, Vec<Sample>> = keys
                .iter()
                .map(|k| (k.clone(), Vec::with_capacity(samples.len())))
                .collect();
            for (i, s) in samples.into_iter().enumerate() {
                match s {
                    Sample::Map(features) if features.keys().eq(keys.iter()) => {
                        for (key, value) in features {
                            if let Some(column) = columns.get_mut(&key) {
                                column.push(value);
                            }
                        }
                    }
                    Sample::Map(features) => {
                        return Err(CollateError::KeyMismatch {
                            position: i,
                            expected: keys,
                            found: features.into_keys().collect(),
                        }
                        .into())
                    }
                    other => return Err(mismatch(i, &other).into()),
                }
            }
            Sample::Map(
                columns
                    .into_iter()
                    .map(|(key, column)| Ok((key, collate_samples(column)?)))
                    .collect::<Result<BTreeMap<_, _>>>()?,
            )
        }
    };
    Ok(batch)
}

/// Adapts a closure into a [`Collator`].
///
/// The same closure serves unbatched mode by receiving a one-element vector.
///
/// ```ignore
/// let sum = CollateFn::new(|samples: Vec<i64>| Ok::<_, anyhow::Error>(samples.iter().sum::<i64>()));
/// ```
pub struct CollateFn<F, B> {
    f: F,
    _batch: PhantomData<fn() -> B>,
}

impl<F, B> CollateFn<F, B> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _batch: PhantomData,
        }
    }
}

impl<T, B, F> Collator<T> for CollateFn<F, B>
where
    F: Fn(Vec<T>) -> Result<B> + Send + Sync,
    B: Serialize + DeserializeOwned + Send + 'static,
{
    type Batch = B;

    fn collate(&self, samples: Vec<T>) -> Result<B> {
        (self.f)(samples)
    }

    fn convert(&self, sample: T) -> Result<B> {
        (self.f)(vec![sample])
    }
}

#[cfg(test)]
mod stack_collator_tests {
    use super::*;

    fn row(i: i64) -> Sample {
        Sample::from_single("x", Tensor::from_vec(vec![i as f32, i as f32 * 10.0]))
            .with_feature("y", i)
            .with_feature("name", format!("s{i}"))
    }

    #[test]
    fn collates_maps_key_wise() -> Result<()> {
        let batch = StackCollator.collate((0..3).map(row).collect())?;

        let x = batch.get("x")?.as_tensor()?;
        assert_eq!(x.shape(), &[3, 2]);
        assert_eq!(x.to_vec::<f32>()?, vec![0.0, 0.0, 1.0, 10.0, 2.0, 20.0]);
        assert_eq!(batch.get("y")?.as_tensor()?.to_vec::<i64>()?, vec![0, 1, 2]);
        assert_eq!(
            batch.get("name")?,
            &Sample::List(vec!["s0".into(), "s1".into(), "s2".into()])
        );
        Ok(())
    }

    #[test]
    fn collates_nested_lists_position_wise() -> Result<()> {
        let samples = vec![
            Sample::List(vec![Sample::Int(1), Sample::List(vec![Sample::Float(0.5)])]),
            Sample::List(vec![Sample::Int(2), Sample::List(vec![Sample::Float(1.5)])]),
        ];
        let batch = StackCollator.collate(samples)?;

        assert_eq!(batch.at(0)?.as_tensor()?.to_vec::<i64>()?, vec![1, 2]);
        assert_eq!(
            batch.at(1)?.at(0)?.as_tensor()?.to_vec::<f64>()?,
            vec![0.5, 1.5]
        );
        Ok(())
    }

    #[test]
    fn reports_structural_mismatches() {
        let err = collate_samples(vec![Sample::Int(1), Sample::Str("a".into())]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CollateError>(),
            Some(CollateError::TypeMismatch { position: 1, .. })
        ));

        let err = collate_samples(vec![row(0), Sample::from_single("x", 1i64)]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CollateError>(),
            Some(CollateError::KeyMismatch { position: 1, .. })
        ));

        let err = collate_samples(vec![
            Sample::Tensor(Tensor::from_vec(vec![1i64])),
            Sample::Tensor(Tensor::from_vec(vec![1i64, 2])),
        ])
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CollateError>(),
            Some(CollateError::TensorMismatch { position: 1, .. })
        ));

        assert!(collate_samples(vec![]).is_err());
    }

    #[test]
    fn convert_passes_sample_through() -> Result<()> {
        assert_eq!(StackCollator.convert(row(4))?, row(4));
        Ok(())
    }

    #[test]
    fn closure_collator_handles_both_modes() -> Result<()> {
        let collator =
            CollateFn::new(|samples: Vec<i64>| Ok::<_, anyhow::Error>(samples.iter().sum::<i64>()));
        assert_eq!(collator.collate(vec![1, 2, 3])?, 6);
        assert_eq!(collator.convert(5)?, 5);
        Ok(())
    }
}
