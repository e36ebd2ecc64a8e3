//! Static type annotations carried by IR values.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompatibilityMode {
    Strict,
    Hardened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
    Bool,
}

impl DType {
    #[must_use]
    pub fn is_floating_point(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    /// Scalar-type name used when printing tensor types.
    #[must_use]
    pub fn scalar_name(self) -> &'static str {
        match self {
            Self::F32 => "Float",
            Self::F64 => "Double",
            Self::I32 => "Int",
            Self::I64 => "Long",
            Self::Bool => "Bool",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    Cuda(u16),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda(index) => write!(f, "cuda:{index}"),
        }
    }
}

/// Partially known tensor metadata. `sizes`/`strides` are only present once a
/// graph has been specialized to concrete inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorType {
    pub dtype: DType,
    pub device: Device,
    pub requires_grad: bool,
    pub rank: Option<usize>,
    pub sizes: Option<Vec<usize>>,
    pub strides: Option<Vec<usize>>,
}

impl TensorType {
    #[must_use]
    pub fn new(dtype: DType, device: Device) -> Self {
        Self {
            dtype,
            device,
            requires_grad: false,
            rank: None,
            sizes: None,
            strides: None,
        }
    }

    #[must_use]
    pub fn with_rank(mut self, rank: usize) -> Self {
        self.rank = Some(rank);
        self.sizes = None;
        self.strides = None;
        self
    }

    #[must_use]
    pub fn with_sizes(mut self, sizes: Vec<usize>) -> Self {
        self.strides = Some(contiguous_strides(&sizes));
        self.rank = Some(sizes.len());
        self.sizes = Some(sizes);
        self
    }

    #[must_use]
    pub fn with_sizes_and_strides(mut self, sizes: Vec<usize>, strides: Vec<usize>) -> Self {
        self.rank = Some(sizes.len());
        self.sizes = Some(sizes);
        self.strides = Some(strides);
        self
    }

    #[must_use]
    pub fn with_requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }

    #[must_use]
    pub fn dim(&self) -> Option<usize> {
        self.rank
            .or_else(|| self.sizes.as_ref().map(Vec::len))
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.sizes.is_some() && self.strides.is_some()
    }
}

#[must_use]
pub fn contiguous_strides(sizes: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; sizes.len()];
    for idx in (0..sizes.len().saturating_sub(1)).rev() {
        strides[idx] = strides[idx + 1] * sizes[idx + 1].max(1);
    }
    strides
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Type {
    /// Nothing known yet; conservatively treated as a tensor that may require grad.
    #[default]
    Dynamic,
    Tensor(TensorType),
    Int,
    Float,
    Bool,
    NoneType,
    List(Box<Type>),
    Tuple(Vec<Type>),
}

impl Type {
    #[must_use]
    pub fn requires_grad(&self) -> bool {
        match self {
            Self::Dynamic => true,
            Self::Tensor(tensor) => tensor.requires_grad,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_tensor_like(&self) -> bool {
        matches!(self, Self::Dynamic | Self::Tensor(_))
    }

    #[must_use]
    pub fn as_tensor(&self) -> Option<&TensorType> {
        match self {
            Self::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    /// Returns a copy with `requires_grad` set. Non-tensor types are unchanged.
    #[must_use]
    pub fn with_requires_grad(&self, requires_grad: bool) -> Self {
        match self {
            Self::Tensor(tensor) => Self::Tensor(tensor.clone().with_requires_grad(requires_grad)),
            other => other.clone(),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dynamic => f.write_str("Dynamic"),
            Self::Tensor(tensor) => {
                f.write_str(tensor.dtype.scalar_name())?;
                match (&tensor.sizes, tensor.rank) {
                    (Some(sizes), _) => {
                        let dims = sizes
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(", ");
                        write!(f, "({dims})")
                    }
                    (None, Some(rank)) => {
                        let dims = vec!["*"; rank].join(", ");
                        write!(f, "({dims})")
                    }
                    (None, None) => f.write_str("(...)"),
                }
            }
            Self::Int => f.write_str("int"),
            Self::Float => f.write_str("float"),
            Self::Bool => f.write_str("bool"),
            Self::NoneType => f.write_str("None"),
            Self::List(elem) => write!(f, "{elem}[]"),
            Self::Tuple(elems) => {
                let parts = elems
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "({parts})")
            }
        }
    }
}
