#![forbid(unsafe_code)]

//! Operator schemas, the operator registry, and the reference CPU kernels
//! the interpreter dispatches to.

mod arithmetic;
mod builtins;
mod comparison;
pub mod registry;
pub mod schema;
mod tensor_ops;

use std::fmt;
use std::sync::Arc;
use tj_core::{IValue, IValueKind, Symbol, TensorError};

pub use builtins::register_builtin_operators;
pub use registry::{
    IntoOperation, NodeLowering, NodeLoweringContext, OpReturn, OpValue, Operator,
    OperatorRegistry, create_operator,
};
pub use schema::{Argument, FunctionSchema, SchemaParseError, SchemaType};

/// Interpreter operand stack.
pub type Stack = Vec<IValue>;

/// A resolved operator: pops its inputs from the end of the stack and pushes
/// its outputs.
pub type Operation = Arc<dyn Fn(&mut Stack) -> Result<(), OpError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum OpError {
    StackUnderflow {
        op: Symbol,
        needed: usize,
        available: usize,
    },
    ArgumentType {
        op: Symbol,
        index: usize,
        expected: SchemaType,
        actual: IValueKind,
    },
    ShapeMismatch {
        op: Symbol,
        left: Vec<usize>,
        right: Vec<usize>,
    },
    Tensor {
        op: Symbol,
        source: TensorError,
    },
    NoOperator {
        kind: Symbol,
    },
    NoMatchingOverload {
        kind: Symbol,
        detail: String,
    },
    Lowering {
        kind: Symbol,
        detail: String,
    },
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackUnderflow {
                op,
                needed,
                available,
            } => write!(
                f,
                "{op} needs {needed} stack operands but only {available} are available"
            ),
            Self::ArgumentType {
                op,
                index,
                expected,
                actual,
            } => write!(f, "{op} argument #{index}: expected {expected}, got {actual:?}"),
            Self::ShapeMismatch { op, left, right } => {
                write!(f, "shape mismatch for {op}: left={left:?} right={right:?}")
            }
            Self::Tensor { op, source } => write!(f, "{op}: {source}"),
            Self::NoOperator { kind } => write!(f, "no operator registered for {kind}"),
            Self::NoMatchingOverload { kind, detail } => {
                write!(f, "no overload of {kind} matches: {detail}")
            }
            Self::Lowering { kind, detail } => write!(f, "lowering {kind} failed: {detail}"),
        }
    }
}

impl std::error::Error for OpError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    Schema(SchemaParseError),
    ArgumentCount {
        name: Symbol,
        inferred: usize,
        declared: usize,
    },
    ArgumentType {
        name: Symbol,
        index: usize,
        inferred: SchemaType,
        declared: SchemaType,
    },
    ReturnCount {
        name: Symbol,
        inferred: usize,
        declared: usize,
    },
    ReturnType {
        name: Symbol,
        index: usize,
        inferred: SchemaType,
        declared: SchemaType,
    },
    DuplicateOverload {
        schema: String,
    },
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Schema(err) => write!(f, "{err}"),
            Self::ArgumentCount {
                name,
                inferred,
                declared,
            } => write!(
                f,
                "{name}: inferred {inferred} argument(s) for operator implementation, \
                 but the provided schema specified {declared} argument(s)"
            ),
            Self::ArgumentType {
                name,
                index,
                inferred,
                declared,
            } => write!(
                f,
                "{name}: inferred type for argument #{index} was {inferred}, \
                 but the provided schema specified type {declared} \
                 for the argument in that position"
            ),
            Self::ReturnCount {
                name,
                inferred,
                declared,
            } => write!(
                f,
                "{name}: inferred {inferred} return value(s) for operator implementation, \
                 but the provided schema specified {declared} return value(s)"
            ),
            Self::ReturnType {
                name,
                index,
                inferred,
                declared,
            } => write!(
                f,
                "{name}: inferred type for return value #{index} was {inferred}, \
                 but the provided schema specified type {declared} \
                 for the return value in that position"
            ),
            Self::DuplicateOverload { schema } => {
                write!(f, "an operator with schema {schema} is already registered")
            }
        }
    }
}

impl std::error::Error for RegistrationError {}

impl From<SchemaParseError> for RegistrationError {
    fn from(err: SchemaParseError) -> Self {
        Self::Schema(err)
    }
}

/// Splits the last `count` operands off `stack`, in push order.
pub fn pop_operands(stack: &mut Stack, op: Symbol, count: usize) -> Result<Stack, OpError> {
    if stack.len() < count {
        return Err(OpError::StackUnderflow {
            op,
            needed: count,
            available: stack.len(),
        });
    }
    Ok(stack.split_off(stack.len() - count))
}
