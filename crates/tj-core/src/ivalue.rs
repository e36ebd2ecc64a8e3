//! Runtime values moved through the interpreter stack.

use crate::types::{DType, Device, TensorType, Type, contiguous_strides};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
    Undefined,
    ElementCount { sizes: Vec<usize>, actual: usize },
    DimOutOfRange { dim: usize, rank: usize },
    NotAScalar { numel: usize },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("operation on an undefined tensor"),
            Self::ElementCount { sizes, actual } => {
                write!(f, "sizes {sizes:?} do not match {actual} elements")
            }
            Self::DimOutOfRange { dim, rank } => {
                write!(f, "dimension {dim} out of range for rank {rank}")
            }
            Self::NotAScalar { numel } => {
                write!(f, "expected a one-element tensor, got {numel} elements")
            }
        }
    }
}

impl std::error::Error for TensorError {}

#[derive(Debug, Clone)]
struct TensorRepr {
    storage: Arc<[f64]>,
    offset: usize,
    sizes: Vec<usize>,
    strides: Vec<usize>,
    dtype: DType,
    device: Device,
    requires_grad: bool,
}

/// A strided view over shared `f64` storage, or the undefined tensor.
///
/// Element values are always held as `f64`; `dtype` and `device` are
/// metadata consulted by specialization, not by the storage layout.
#[derive(Debug, Clone, Default)]
pub struct Tensor {
    repr: Option<TensorRepr>,
}

impl Tensor {
    #[must_use]
    pub fn undefined() -> Self {
        Self { repr: None }
    }

    pub fn from_vec(data: Vec<f64>, sizes: &[usize]) -> Result<Self, TensorError> {
        let numel: usize = sizes.iter().product();
        if numel != data.len() {
            return Err(TensorError::ElementCount {
                sizes: sizes.to_vec(),
                actual: data.len(),
            });
        }
        Ok(Self {
            repr: Some(TensorRepr {
                storage: data.into(),
                offset: 0,
                sizes: sizes.to_vec(),
                strides: contiguous_strides(sizes),
                dtype: DType::F32,
                device: Device::Cpu,
                requires_grad: false,
            }),
        })
    }

    #[must_use]
    pub fn scalar(value: f64) -> Self {
        Self {
            repr: Some(TensorRepr {
                storage: vec![value].into(),
                offset: 0,
                sizes: Vec::new(),
                strides: Vec::new(),
                dtype: DType::F32,
                device: Device::Cpu,
                requires_grad: false,
            }),
        }
    }

    #[must_use]
    pub fn full(sizes: &[usize], value: f64) -> Self {
        let numel = sizes.iter().product();
        Self {
            repr: Some(TensorRepr {
                storage: vec![value; numel].into(),
                offset: 0,
                sizes: sizes.to_vec(),
                strides: contiguous_strides(sizes),
                dtype: DType::F32,
                device: Device::Cpu,
                requires_grad: false,
            }),
        }
    }

    #[must_use]
    pub fn zeros(sizes: &[usize]) -> Self {
        Self::full(sizes, 0.0)
    }

    /// A tensor with the same metadata as `self` holding new contiguous data.
    pub fn with_data(&self, data: Vec<f64>, sizes: &[usize]) -> Result<Self, TensorError> {
        let repr = self.repr()?;
        let mut out = Self::from_vec(data, sizes)?;
        if let Some(out_repr) = out.repr.as_mut() {
            out_repr.dtype = repr.dtype;
            out_repr.device = repr.device;
        }
        Ok(out)
    }

    #[must_use]
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        if let Some(repr) = self.repr.as_mut() {
            repr.dtype = dtype;
        }
        self
    }

    #[must_use]
    pub fn to_device(mut self, device: Device) -> Self {
        if let Some(repr) = self.repr.as_mut() {
            repr.device = device;
        }
        self
    }

    #[must_use]
    pub fn with_requires_grad(mut self, requires_grad: bool) -> Self {
        if let Some(repr) = self.repr.as_mut() {
            repr.requires_grad = requires_grad;
        }
        self
    }

    #[must_use]
    pub fn is_defined(&self) -> bool {
        self.repr.is_some()
    }

    #[must_use]
    pub fn sizes(&self) -> &[usize] {
        self.repr.as_ref().map_or(&[], |repr| repr.sizes.as_slice())
    }

    #[must_use]
    pub fn strides(&self) -> &[usize] {
        self.repr.as_ref().map_or(&[], |repr| repr.strides.as_slice())
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.sizes().len()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        if self.is_defined() {
            self.sizes().iter().product()
        } else {
            0
        }
    }

    #[must_use]
    pub fn dtype(&self) -> Option<DType> {
        self.repr.as_ref().map(|repr| repr.dtype)
    }

    #[must_use]
    pub fn device(&self) -> Option<Device> {
        self.repr.as_ref().map(|repr| repr.device)
    }

    #[must_use]
    pub fn requires_grad(&self) -> bool {
        self.repr.as_ref().is_some_and(|repr| repr.requires_grad)
    }

    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        self.strides() == contiguous_strides(self.sizes()).as_slice()
    }

    /// Complete static type of this tensor, used when specializing a graph.
    pub fn tensor_type(&self) -> Result<TensorType, TensorError> {
        let repr = self.repr()?;
        Ok(TensorType::new(repr.dtype, repr.device)
            .with_sizes_and_strides(repr.sizes.clone(), repr.strides.clone())
            .with_requires_grad(repr.requires_grad))
    }

    /// Elements in logical row-major order, following strides.
    pub fn to_vec(&self) -> Result<Vec<f64>, TensorError> {
        let repr = self.repr()?;
        let numel: usize = repr.sizes.iter().product();
        let mut out = Vec::with_capacity(numel);
        let mut index = vec![0_usize; repr.sizes.len()];
        for _ in 0..numel {
            let linear = repr.offset
                + index
                    .iter()
                    .zip(&repr.strides)
                    .map(|(i, s)| i * s)
                    .sum::<usize>();
            out.push(repr.storage[linear]);
            for axis in (0..index.len()).rev() {
                index[axis] += 1;
                if index[axis] < repr.sizes[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
        Ok(out)
    }

    pub fn item(&self) -> Result<f64, TensorError> {
        let data = self.to_vec()?;
        match data.as_slice() {
            [value] => Ok(*value),
            _ => Err(TensorError::NotAScalar { numel: data.len() }),
        }
    }

    /// Swaps two dimensions without copying; the result is generally not contiguous.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self, TensorError> {
        let mut repr = self.repr()?.clone();
        let rank = repr.sizes.len();
        for dim in [dim0, dim1] {
            if dim >= rank {
                return Err(TensorError::DimOutOfRange { dim, rank });
            }
        }
        repr.sizes.swap(dim0, dim1);
        repr.strides.swap(dim0, dim1);
        Ok(Self { repr: Some(repr) })
    }

    /// Matrix transpose; tensors of rank below two are returned as-is.
    pub fn t(&self) -> Result<Self, TensorError> {
        if self.dim() < 2 {
            self.repr()?;
            return Ok(self.clone());
        }
        self.transpose(0, 1)
    }

    pub fn contiguous(&self) -> Result<Self, TensorError> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        let data = self.to_vec()?;
        self.with_data(data, self.sizes())
    }

    #[must_use]
    pub fn allclose(&self, other: &Self, rtol: f64, atol: f64) -> bool {
        if self.sizes() != other.sizes() {
            return false;
        }
        match (self.to_vec(), other.to_vec()) {
            (Ok(lhs), Ok(rhs)) => lhs
                .iter()
                .zip(&rhs)
                .all(|(a, b)| (a - b).abs() <= atol + rtol * b.abs()),
            (Err(_), Err(_)) => true,
            _ => false,
        }
    }

    fn repr(&self) -> Result<&TensorRepr, TensorError> {
        self.repr.as_ref().ok_or(TensorError::Undefined)
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.dtype() == other.dtype()
            && self.device() == other.device()
            && self.sizes() == other.sizes()
            && self.to_vec().ok() == other.to_vec().ok()
    }
}

/// Discriminates `IValue` variants; non-tensor arguments are keyed by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IValueKind {
    None,
    Int,
    Double,
    Bool,
    Tensor,
    IntList,
    DoubleList,
    TensorList,
    Tuple,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum IValue {
    #[default]
    None,
    Int(i64),
    Double(f64),
    Bool(bool),
    Tensor(Tensor),
    IntList(Vec<i64>),
    DoubleList(Vec<f64>),
    TensorList(Vec<Tensor>),
    Tuple(Vec<IValue>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IValueError {
    pub expected: IValueKind,
    pub actual: IValueKind,
}

impl fmt::Display for IValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected {:?}, got {:?}", self.expected, self.actual)
    }
}

impl std::error::Error for IValueError {}

impl IValue {
    #[must_use]
    pub fn kind(&self) -> IValueKind {
        match self {
            Self::None => IValueKind::None,
            Self::Int(_) => IValueKind::Int,
            Self::Double(_) => IValueKind::Double,
            Self::Bool(_) => IValueKind::Bool,
            Self::Tensor(_) => IValueKind::Tensor,
            Self::IntList(_) => IValueKind::IntList,
            Self::DoubleList(_) => IValueKind::DoubleList,
            Self::TensorList(_) => IValueKind::TensorList,
            Self::Tuple(_) => IValueKind::Tuple,
        }
    }

    #[must_use]
    pub fn is_tensor(&self) -> bool {
        matches!(self, Self::Tensor(_))
    }

    fn mismatch(&self, expected: IValueKind) -> IValueError {
        IValueError {
            expected,
            actual: self.kind(),
        }
    }

    pub fn to_tensor(&self) -> Result<&Tensor, IValueError> {
        match self {
            Self::Tensor(tensor) => Ok(tensor),
            other => Err(other.mismatch(IValueKind::Tensor)),
        }
    }

    pub fn into_tensor(self) -> Result<Tensor, IValueError> {
        match self {
            Self::Tensor(tensor) => Ok(tensor),
            other => Err(other.mismatch(IValueKind::Tensor)),
        }
    }

    pub fn to_int(&self) -> Result<i64, IValueError> {
        match self {
            Self::Int(value) => Ok(*value),
            Self::Bool(value) => Ok(i64::from(*value)),
            other => Err(other.mismatch(IValueKind::Int)),
        }
    }

    pub fn to_double(&self) -> Result<f64, IValueError> {
        match self {
            Self::Double(value) => Ok(*value),
            Self::Int(value) => Ok(*value as f64),
            other => Err(other.mismatch(IValueKind::Double)),
        }
    }

    /// Truthiness for branch conditions: bools, ints, and one-element tensors.
    pub fn to_bool(&self) -> Result<bool, IValueError> {
        match self {
            Self::Bool(value) => Ok(*value),
            Self::Int(value) => Ok(*value != 0),
            Self::Tensor(tensor) => tensor
                .item()
                .map(|value| value != 0.0)
                .map_err(|_| self.mismatch(IValueKind::Bool)),
            other => Err(other.mismatch(IValueKind::Bool)),
        }
    }

    /// Static type for this value as seen by graph specialization.
    #[must_use]
    pub fn static_type(&self) -> Type {
        match self {
            Self::None => Type::NoneType,
            Self::Int(_) => Type::Int,
            Self::Double(_) => Type::Float,
            Self::Bool(_) => Type::Bool,
            Self::Tensor(tensor) => tensor.tensor_type().map_or(Type::Dynamic, Type::Tensor),
            Self::IntList(_) => Type::List(Box::new(Type::Int)),
            Self::DoubleList(_) => Type::List(Box::new(Type::Float)),
            Self::TensorList(_) => Type::List(Box::new(Type::Dynamic)),
            Self::Tuple(elems) => Type::Tuple(elems.iter().map(Self::static_type).collect()),
        }
    }
}

impl From<Tensor> for IValue {
    fn from(value: Tensor) -> Self {
        Self::Tensor(value)
    }
}

impl From<f64> for IValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<i64> for IValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for IValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl fmt::Display for IValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Double(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Tensor(tensor) if !tensor.is_defined() => f.write_str("<undefined>"),
            Self::Tensor(tensor) => write!(f, "Tensor{:?}", tensor.sizes()),
            Self::IntList(values) => write!(f, "{values:?}"),
            Self::DoubleList(values) => write!(f, "{values:?}"),
            Self::TensorList(values) => write!(f, "[{} tensors]", values.len()),
            Self::Tuple(values) => write!(f, "({} values)", values.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{IValue, IValueKind, Tensor, TensorError};
    use crate::types::{DType, Device};

    #[test]
    fn transpose_is_a_strided_view() {
        let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).expect("tensor");
        let at = a.t().expect("transpose");
        assert_eq!(at.sizes(), &[3, 2]);
        assert_eq!(at.strides(), &[1, 3]);
        assert!(!at.is_contiguous());
        assert_eq!(at.to_vec().expect("data"), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        let packed = at.contiguous().expect("contiguous");
        assert!(packed.is_contiguous());
        assert_eq!(packed, at);
    }

    #[test]
    fn undefined_tensors_report_no_metadata() {
        let undef = Tensor::undefined();
        assert!(!undef.is_defined());
        assert_eq!(undef.numel(), 0);
        assert_eq!(undef.dtype(), None);
        assert_eq!(undef.to_vec(), Err(TensorError::Undefined));
    }

    #[test]
    fn element_count_is_checked() {
        assert!(matches!(
            Tensor::from_vec(vec![1.0, 2.0], &[3]),
            Err(TensorError::ElementCount { .. })
        ));
    }

    #[test]
    fn metadata_builders_keep_data() {
        let t = Tensor::full(&[2], 1.5)
            .with_dtype(DType::F64)
            .to_device(Device::Cuda(1))
            .with_requires_grad(true);
        assert_eq!(t.dtype(), Some(DType::F64));
        assert_eq!(t.device(), Some(Device::Cuda(1)));
        assert!(t.requires_grad());
        assert_eq!(t.to_vec().expect("data"), vec![1.5, 1.5]);
    }

    #[test]
    fn truthiness_follows_value_kind() {
        assert_eq!(IValue::Bool(true).to_bool(), Ok(true));
        assert_eq!(IValue::Int(0).to_bool(), Ok(false));
        assert_eq!(IValue::Tensor(Tensor::scalar(2.0)).to_bool(), Ok(true));
        let err = IValue::DoubleList(vec![1.0]).to_bool().expect_err("not a bool");
        assert_eq!(err.actual, IValueKind::DoubleList);
    }
}
