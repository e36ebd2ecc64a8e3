#![forbid(unsafe_code)]

//! Core IR for tensorjit: interned symbols, static types, runtime values,
//! and the block-structured dataflow [`Graph`].

pub mod attributes;
pub mod graph;
pub mod ivalue;
pub mod lint;
mod printing;
pub mod symbol;
pub mod symbolic;
pub mod types;

pub use attributes::{AttributeError, AttributeKind, AttributeValue, Attributes};
pub use graph::{BlockId, Graph, IrError, Node, NodeId, Use, Value, ValueId};
pub use ivalue::{IValue, IValueError, IValueKind, Tensor, TensorError};
pub use lint::LintError;
pub use symbol::{Symbol, SymbolError, aten, attr, namespaces, prim};
pub use symbolic::SymbolicVariable;
pub use types::{CompatibilityMode, DType, Device, TensorType, Type, contiguous_strides};
