use anyhow::{anyhow, bail, Result};
use ndarray::{ArrayD, Axis, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A dense n-dimensional array with one of a fixed set of element types.
///
/// Backed by `ndarray::ArrayD` so it serializes with serde and can be framed
/// between worker processes without any native runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Tensor {
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
    U8(ArrayD<u8>),
    Bool(ArrayD<bool>),
}

/// Element types a [`Tensor`] can hold.
pub trait Element: Clone + Send + Sync + 'static {
    const DTYPE: &'static str;

    fn wrap(array: ArrayD<Self>) -> Tensor;

    fn unwrap_ref(tensor: &Tensor) -> Option<&ArrayD<Self>>;
}

macro_rules! impl_element {
    ($ty:ty, $variant:ident, $name:literal) => {
        impl Element for $ty {
            const DTYPE: &'static str = $name;

            fn wrap(array: ArrayD<Self>) -> Tensor {
                Tensor::$variant(array)
            }

            fn unwrap_ref(tensor: &Tensor) -> Option<&ArrayD<Self>> {
                match tensor {
                    Tensor::$variant(array) => Some(array),
                    _ => None,
                }
            }
        }
    };
}

impl_element!(f32, F32, "f32");
impl_element!(f64, F64, "f64");
impl_element!(i32, I32, "i32");
impl_element!(i64, I64, "i64");
impl_element!(u8, U8, "u8");
impl_element!(bool, Bool, "bool");

/// Applies the same expression to whichever array a tensor holds.
macro_rules! with_array {
    ($tensor:expr, $array:ident => $body:expr) => {
        match $tensor {
            Tensor::F32($array) => $body,
            Tensor::F64($array) => $body,
            Tensor::I32($array) => $body,
            Tensor::I64($array) => $body,
            Tensor::U8($array) => $body,
            Tensor::Bool($array) => $body,
        }
    };
}

/// Stacks the arrays of one variant along a new leading axis.
macro_rules! stack_variant {
    ($variant:ident, $tensors:expr) => {{
        let views = $tensors
            .iter()
            .map(|tensor| match tensor {
                Tensor::$variant(array) => Ok(array.view()),
                other => Err(anyhow!(
                    "cannot stack a {} tensor into a {} batch",
                    other.dtype(),
                    stringify!($variant)
                )),
            })
            .collect::<Result<Vec<_>>>()?;
        Tensor::$variant(ndarray::stack(Axis(0), &views)?)
    }};
}

impl Tensor {
    /// A 1-D tensor from a vector.
    pub fn from_vec<T: Element>(values: Vec<T>) -> Self {
        T::wrap(ndarray::Array1::from_vec(values).into_dyn())
    }

    /// A tensor of arbitrary shape from row-major data.
    pub fn from_shape_vec<T: Element>(shape: &[usize], values: Vec<T>) -> Result<Self> {
        Ok(T::wrap(ArrayD::from_shape_vec(IxDyn(shape), values)?))
    }

    /// A 0-dimensional tensor holding one value.
    pub fn scalar<T: Element>(value: T) -> Self {
        T::wrap(ArrayD::from_elem(IxDyn(&[]), value))
    }

    pub fn from_array<T: Element>(array: ArrayD<T>) -> Self {
        T::wrap(array)
    }

    pub fn dtype(&self) -> &'static str {
        match self {
            Self::F32(_) => f32::DTYPE,
            Self::F64(_) => f64::DTYPE,
            Self::I32(_) => i32::DTYPE,
            Self::I64(_) => i64::DTYPE,
            Self::U8(_) => u8::DTYPE,
            Self::Bool(_) => bool::DTYPE,
        }
    }

    pub fn shape(&self) -> &[usize] {
        with_array!(self, array => array.shape())
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Borrows the underlying array when the element type matches.
    pub fn as_array<T: Element>(&self) -> Result<&ArrayD<T>> {
        T::unwrap_ref(self)
            .ok_or_else(|| anyhow!("expected a {} tensor, found {}", T::DTYPE, self.dtype()))
    }

    /// Copies the elements out in logical (row-major) order.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        Ok(self.as_array::<T>()?.iter().cloned().collect())
    }

    /// The sub-tensor at `index` along the leading axis.
    pub fn select(&self, index: usize) -> Result<Self> {
        let rows = self.shape().first().copied().ok_or_else(|| {
            anyhow!("cannot index into a 0-dimensional tensor")
        })?;
        if index >= rows {
            bail!("index {index} out of range for tensor with {rows} rows");
        }
        Ok(with_array!(self, array => Element::wrap(array.index_axis(Axis(0), index).to_owned())))
    }

    /// Stacks equally-shaped tensors of one dtype along a new leading axis.
    pub fn stack(tensors: &[&Tensor]) -> Result<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| anyhow!("cannot stack an empty list of tensors"))?;
        Ok(match first {
            Self::F32(_) => stack_variant!(F32, tensors),
            Self::F64(_) => stack_variant!(F64, tensors),
            Self::I32(_) => stack_variant!(I32, tensors),
            Self::I64(_) => stack_variant!(I64, tensors),
            Self::U8(_) => stack_variant!(U8, tensors),
            Self::Bool(_) => stack_variant!(Bool, tensors),
        })
    }
}

/// A single example, or a collated batch of examples.
///
/// Datasets yield `Sample`s and the default collator folds a `Vec<Sample>`
/// back into one `Sample` of the same structure, with leaves batched:
/// - `Int` / `Float` / `Bool` leaves become a 1-D `Tensor`
/// - `Tensor` leaves are stacked along a new leading axis
/// - `Str` leaves become a `List` of strings
/// - `List` and `Map` are collated element-wise / key-wise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Sample {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Tensor(Tensor),
    List(Vec<Sample>),
    Map(BTreeMap<String, Sample>),
}

impl Sample {
    /// Creates a `Map` sample from a single `(feature_name, value)` pair.
    ///
    /// Chain with [`with_feature`](Self::with_feature) to add more features.
    pub fn from_single(name: impl Into<String>, value: impl Into<Sample>) -> Self {
        Self::Map(BTreeMap::from([(name.into(), value.into())]))
    }

    /// Adds or overwrites a feature. Non-map samples are left unchanged.
    pub fn with_feature(mut self, name: impl Into<String>, value: impl Into<Sample>) -> Self {
        if let Self::Map(features) = &mut self {
            features.insert(name.into(), value.into());
        }
        self
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Str(_) => "string",
            Self::Tensor(_) => "tensor",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    /// Looks up a feature of a `Map` sample.
    pub fn get(&self, feature: &str) -> Result<&Sample> {
        match self {
            Self::Map(features) => features
                .get(feature)
                .ok_or_else(|| anyhow!("Feature {} not found", feature)),
            other => bail!("cannot look up '{}' in a {} sample", feature, other.kind_name()),
        }
    }

    /// Element `index` of a `List` sample.
    pub fn at(&self, index: usize) -> Result<&Sample> {
        match self {
            Self::List(items) => items.get(index).ok_or_else(|| {
                anyhow!("index {} out of range for list of {}", index, items.len())
            }),
            other => bail!("cannot index into a {} sample", other.kind_name()),
        }
    }

    pub fn as_tensor(&self) -> Result<&Tensor> {
        match self {
            Self::Tensor(tensor) => Ok(tensor),
            other => bail!("expected a tensor, found {}", other.kind_name()),
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        match self {
            Self::Int(value) => Ok(*value),
            other => bail!("expected an int, found {}", other.kind_name()),
        }
    }

    pub fn as_float(&self) -> Result<f64> {
        match self {
            Self::Float(value) => Ok(*value),
            other => bail!("expected a float, found {}", other.kind_name()),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Self::Str(value) => Ok(value),
            other => bail!("expected a string, found {}", other.kind_name()),
        }
    }

    pub fn as_list(&self) -> Result<&[Sample]> {
        match self {
            Self::List(items) => Ok(items),
            other => bail!("expected a list, found {}", other.kind_name()),
        }
    }

    /// Returns an iterator over feature names of a `Map` sample.
    pub fn features(&self) -> impl Iterator<Item = &str> {
        let keys = match self {
            Self::Map(features) => Some(features.keys().map(String::as_str)),
            _ => None,
        };
        keys.into_iter().flatten()
    }
}

impl From<i64> for Sample {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Sample {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for Sample {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<String> for Sample {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&str> for Sample {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<Tensor> for Sample {
    fn from(value: Tensor) -> Self {
        Self::Tensor(value)
    }
}

impl From<Vec<Sample>> for Sample {
    fn from(value: Vec<Sample>) -> Self {
        Self::List(value)
    }
}

impl From<BTreeMap<String, Sample>> for Sample {
    fn from(value: BTreeMap<String, Sample>) -> Self {
        Self::Map(value)
    }
}
