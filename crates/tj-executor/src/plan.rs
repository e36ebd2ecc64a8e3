//! Specialization pipeline and the plans it produces.

use crate::{ExecutorError, ExecutorOptions, PipelineCounters, SpecializationError};
use std::sync::Arc;
use tj_autodiff::{BackwardRegistry, Gradient, differentiate};
use tj_cache::CompleteArgumentSpec;
use tj_core::{CompatibilityMode, Graph, IValue, Tensor};
use tj_interpreters::{Code, InterpreterError, InterpreterState};
use tj_ops::OperatorRegistry;
use tj_passes::{
    constant_pooling, create_autodiff_subgraphs, eliminate_dead_code, lower_grad_of,
    propagate_input_shapes, propagate_requires_grad,
};

/// A graph specialized to one [`CompleteArgumentSpec`], ready to run.
#[derive(Debug)]
pub struct ExecutionPlan {
    graph: Graph,
    code: Arc<Code>,
    real_outputs: usize,
    gradient: Option<GradientPlan>,
}

impl ExecutionPlan {
    /// The specialized forward graph. With a gradient plan it returns
    /// captured values after the real outputs.
    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    #[must_use]
    pub fn code(&self) -> &Arc<Code> {
        &self.code
    }

    #[must_use]
    pub fn real_outputs(&self) -> usize {
        self.real_outputs
    }

    #[must_use]
    pub fn gradient(&self) -> Option<&GradientPlan> {
        self.gradient.as_ref()
    }

    /// Runs the forward code and returns every output, captures included.
    pub fn run_forward(&self, inputs: Vec<IValue>) -> Result<Vec<IValue>, InterpreterError> {
        let mut state = InterpreterState::new(Arc::clone(&self.code));
        let mut stack = inputs;
        state.run(&mut stack)?;
        Ok(stack)
    }
}

/// The backward half of a differentiated plan.
#[derive(Debug)]
pub struct GradientPlan {
    df: Graph,
    backward: Arc<Code>,
    df_input_vjps: Vec<usize>,
    df_input_captured_inputs: Vec<usize>,
    df_input_captured_outputs: Vec<usize>,
    df_output_vjps: Vec<usize>,
}

impl GradientPlan {
    fn new(gradient: Gradient, backward: Arc<Code>) -> (Graph, usize, Self) {
        let Gradient {
            f,
            df,
            f_real_outputs,
            df_input_vjps,
            df_input_captured_inputs,
            df_input_captured_outputs,
            df_output_vjps,
        } = gradient;
        let plan = Self {
            df,
            backward,
            df_input_vjps,
            df_input_captured_inputs,
            df_input_captured_outputs,
            df_output_vjps,
        };
        (f, f_real_outputs, plan)
    }

    #[must_use]
    pub fn df(&self) -> &Graph {
        &self.df
    }

    #[must_use]
    pub fn df_input_vjps(&self) -> &[usize] {
        &self.df_input_vjps
    }

    #[must_use]
    pub fn df_input_captured_inputs(&self) -> &[usize] {
        &self.df_input_captured_inputs
    }

    #[must_use]
    pub fn df_input_captured_outputs(&self) -> &[usize] {
        &self.df_input_captured_outputs
    }

    /// Forward input index differentiated by each backward output.
    #[must_use]
    pub fn df_output_vjps(&self) -> &[usize] {
        &self.df_output_vjps
    }

    /// Assembles the backward stack: vjps, captured inputs, captured
    /// outputs. Captured temporaries get an undefined vjp.
    #[must_use]
    pub fn backward_inputs(
        &self,
        inputs: &[IValue],
        forward_outputs: &[IValue],
        grad_outputs: &[IValue],
    ) -> Vec<IValue> {
        let undefined = || IValue::Tensor(Tensor::undefined());
        let vjps = self
            .df_input_vjps
            .iter()
            .map(|&i| grad_outputs.get(i).cloned().unwrap_or_else(undefined));
        let captured_inputs = self
            .df_input_captured_inputs
            .iter()
            .map(|&i| inputs.get(i).cloned().unwrap_or_else(undefined));
        let captured_outputs = self
            .df_input_captured_outputs
            .iter()
            .map(|&i| forward_outputs.get(i).cloned().unwrap_or_else(undefined));
        vjps.chain(captured_inputs).chain(captured_outputs).collect()
    }

    pub fn run_backward(&self, stack: Vec<IValue>) -> Result<Vec<IValue>, InterpreterError> {
        let mut state = InterpreterState::new(Arc::clone(&self.backward));
        let mut stack = stack;
        state.run(&mut stack)?;
        Ok(stack)
    }
}

pub(crate) struct Pipeline<'a> {
    pub graph: &'a Graph,
    pub options: &'a ExecutorOptions,
    pub registry: &'a Arc<OperatorRegistry>,
    pub rules: &'a BackwardRegistry,
    pub counters: &'a PipelineCounters,
}

impl Pipeline<'_> {
    pub fn compile(&self, spec: &CompleteArgumentSpec) -> Result<ExecutionPlan, ExecutorError> {
        self.counters.record_compilation();
        let expected = self.graph.inputs().len();
        if spec.len() != expected {
            return Err(SpecializationError::InputCount {
                expected,
                actual: spec.len(),
            }
            .into());
        }
        let mut graph = self.graph.copy()?;
        specialize_inputs(&mut graph, spec, self.options.mode)?;
        self.counters.record_shape_inference();
        propagate_input_shapes(&mut graph).map_err(SpecializationError::Shape)?;
        propagate_requires_grad(&mut graph);
        if self.options.optimize {
            let pooled = constant_pooling(&mut graph)?;
            let removed = eliminate_dead_code(&mut graph)?;
            self.counters.record_dead_code();
            log::trace!(
                "specialization pooled {pooled} constant(s), removed {removed} dead node(s)"
            );
        }

        let real_outputs = graph.outputs().len();
        if spec.any_requires_grad() {
            self.counters.record_differentiation();
            let mut gradient = differentiate(&graph, self.rules)?;
            lower_grad_of(&mut gradient.df)?;
            if self.options.optimize {
                eliminate_dead_code(&mut gradient.df)?;
            }
            let forward = Arc::new(Code::new(&gradient.f, self.registry)?);
            let backward = Arc::new(Code::new(&gradient.df, self.registry)?);
            let (f, real_outputs, gradient) = GradientPlan::new(gradient, backward);
            log::debug!(
                "compiled differentiable plan for spec {:#x}",
                spec.hash_code()
            );
            return Ok(ExecutionPlan {
                graph: f,
                code: forward,
                real_outputs,
                gradient: Some(gradient),
            });
        }

        if self.options.optimize
            && let Some(threshold) = self.options.autodiff_subgraph_threshold
        {
            let rules = self.rules;
            create_autodiff_subgraphs(&mut graph, threshold, |kind| rules.has_rule(kind))?;
        }
        let code = Arc::new(Code::new(&graph, self.registry)?);
        log::debug!("compiled inference plan for spec {:#x}", spec.hash_code());
        Ok(ExecutionPlan {
            graph,
            code,
            real_outputs,
            gradient: None,
        })
    }
}

/// Replaces input types with the spec's. Inputs without a declared tensor
/// type accept any device; strict mode holds declared ones to their device.
fn specialize_inputs(
    graph: &mut Graph,
    spec: &CompleteArgumentSpec,
    mode: CompatibilityMode,
) -> Result<(), SpecializationError> {
    let inputs = graph.inputs().to_vec();
    for (index, (input, ty)) in inputs.into_iter().zip(spec.input_types()).enumerate() {
        if let (Some(declared), Some(actual)) = (graph.ty(input).as_tensor(), ty.as_tensor()) {
            if mode == CompatibilityMode::Strict && declared.device != actual.device {
                return Err(SpecializationError::DeviceMismatch {
                    input: index,
                    declared: declared.device,
                    actual: actual.device,
                });
            }
            if let (Some(declared), Some(actual)) = (declared.dim(), actual.dim())
                && declared != actual
            {
                return Err(SpecializationError::RankMismatch {
                    input: index,
                    declared,
                    actual,
                });
            }
        }
        graph.set_type(input, ty);
    }
    Ok(())
}
