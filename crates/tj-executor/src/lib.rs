#![forbid(unsafe_code)]

//! Specializing, caching graph executor.
//!
//! [`GraphExecutor`] fingerprints each call's inputs into a
//! [`tj_cache::CompleteArgumentSpec`], compiles one [`ExecutionPlan`] per
//! distinct spec and interprets it. Plans for inputs that require grad carry
//! the backward half produced by `tj_autodiff`.

mod executor;
mod options;
mod plan;

pub use executor::{GradientOutputs, GraphExecutor, PipelineCounters, PipelineStats};
pub use options::ExecutorOptions;
pub use plan::{ExecutionPlan, GradientPlan};

use std::sync::Arc;
use tj_autodiff::{AutodiffError, BackwardRegistry};
use tj_core::{AttributeValue, CompatibilityMode, Device, IrError, attr, prim};
use tj_interpreters::InterpreterError;
use tj_ops::{
    NodeLoweringContext, OpError, Operation, OperatorRegistry, RegistrationError, Stack,
    pop_operands,
};
use tj_passes::{ShapeError, SubgraphError};

/// Rejections raised while specializing, before anything is cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecializationError {
    InputCount {
        expected: usize,
        actual: usize,
    },
    RankMismatch {
        input: usize,
        declared: usize,
        actual: usize,
    },
    DeviceMismatch {
        input: usize,
        declared: Device,
        actual: Device,
    },
    Shape(ShapeError),
}

impl std::fmt::Display for SpecializationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InputCount { expected, actual } => {
                write!(f, "expected {expected} input(s), got {actual}")
            }
            Self::RankMismatch {
                input,
                declared,
                actual,
            } => write!(
                f,
                "input #{input} declared with rank {declared} but received rank {actual}"
            ),
            Self::DeviceMismatch {
                input,
                declared,
                actual,
            } => write!(
                f,
                "input #{input} declared on {declared} but received a tensor on {actual}"
            ),
            Self::Shape(err) => write!(f, "shape propagation failed: {err}"),
        }
    }
}

impl std::error::Error for SpecializationError {}

#[derive(Debug)]
pub enum ExecutorError {
    Specialization(SpecializationError),
    Autodiff(AutodiffError),
    Subgraph(SubgraphError),
    Ir(IrError),
    Interpreter(InterpreterError),
    Registration(RegistrationError),
    GradientsDisabled,
    GradOutputArity { expected: usize, actual: usize },
}

impl std::fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Specialization(err) => write!(f, "specialization error: {err}"),
            Self::Autodiff(err) => write!(f, "differentiation error: {err}"),
            Self::Subgraph(err) => write!(f, "subgraph creation error: {err}"),
            Self::Ir(err) => write!(f, "graph error: {err}"),
            Self::Interpreter(err) => write!(f, "interpreter error: {err}"),
            Self::Registration(err) => write!(f, "operator registration error: {err}"),
            Self::GradientsDisabled => write!(f, "gradients are disabled for this executor"),
            Self::GradOutputArity { expected, actual } => write!(
                f,
                "expected {expected} output gradient(s), got {actual}"
            ),
        }
    }
}

impl std::error::Error for ExecutorError {}

impl From<SpecializationError> for ExecutorError {
    fn from(value: SpecializationError) -> Self {
        Self::Specialization(value)
    }
}

impl From<AutodiffError> for ExecutorError {
    fn from(value: AutodiffError) -> Self {
        Self::Autodiff(value)
    }
}

impl From<SubgraphError> for ExecutorError {
    fn from(value: SubgraphError) -> Self {
        Self::Subgraph(value)
    }
}

impl From<IrError> for ExecutorError {
    fn from(value: IrError) -> Self {
        Self::Ir(value)
    }
}

impl From<InterpreterError> for ExecutorError {
    fn from(value: InterpreterError) -> Self {
        Self::Interpreter(value)
    }
}

impl From<RegistrationError> for ExecutorError {
    fn from(value: RegistrationError) -> Self {
        Self::Registration(value)
    }
}

/// Makes `prim::DifferentiableGraph` nodes executable: each node runs its
/// `Subgraph` attribute through a nested inference executor sharing
/// `registry`.
pub fn install_differentiable_graph_lowering(registry: &OperatorRegistry) {
    registry.register_lowering(prim::DIFFERENTIABLE_GRAPH, Arc::new(lower_differentiable_graph));
}

fn lower_differentiable_graph(ctx: &NodeLoweringContext<'_>) -> Result<Operation, OpError> {
    let kind = prim::DIFFERENTIABLE_GRAPH;
    let Some(AttributeValue::G(subgraph)) = ctx.graph.attributes(ctx.node).get(attr::SUBGRAPH)
    else {
        return Err(OpError::Lowering {
            kind,
            detail: "node has no Subgraph attribute".to_owned(),
        });
    };
    let arity = ctx.graph.node(ctx.node).inputs().len();
    let options = ExecutorOptions {
        grad_enabled: false,
        autodiff_subgraph_threshold: None,
        mode: CompatibilityMode::Hardened,
        ..ExecutorOptions::default()
    };
    let executor = GraphExecutor::with_registry(
        subgraph.as_ref().clone(),
        options,
        Arc::clone(ctx.registry),
        BackwardRegistry::with_builtins(),
    );
    Ok(Arc::new(move |stack: &mut Stack| {
        let inputs = pop_operands(stack, kind, arity)?;
        let outputs = executor.run(&inputs).map_err(|err| OpError::Lowering {
            kind,
            detail: err.to_string(),
        })?;
        stack.extend(outputs);
        Ok(())
    }))
}
