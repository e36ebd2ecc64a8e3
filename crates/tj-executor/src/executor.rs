use crate::plan::{ExecutionPlan, Pipeline};
use crate::{ExecutorError, ExecutorOptions, install_differentiable_graph_lowering};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tj_autodiff::BackwardRegistry;
use tj_cache::{CacheStats, CompleteArgumentSpec, ExecutorCache};
use tj_core::{Graph, IValue, Tensor};
use tj_ops::OperatorRegistry;

/// How often each specialization stage has run. The cache hit path touches
/// none of them.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    compilations: AtomicU64,
    shape_inference: AtomicU64,
    differentiation: AtomicU64,
    dead_code: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub compilations: u64,
    pub shape_inference: u64,
    pub differentiation: u64,
    pub dead_code: u64,
}

impl PipelineCounters {
    pub(crate) fn record_compilation(&self) {
        self.compilations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_shape_inference(&self) {
        self.shape_inference.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_differentiation(&self) {
        self.differentiation.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dead_code(&self) {
        self.dead_code.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            compilations: self.compilations.load(Ordering::Relaxed),
            shape_inference: self.shape_inference.load(Ordering::Relaxed),
            differentiation: self.differentiation.load(Ordering::Relaxed),
            dead_code: self.dead_code.load(Ordering::Relaxed),
        }
    }
}

/// Outputs of a gradient run. `input_grads[i]` is `None` when input `i`
/// received no defined gradient.
#[derive(Debug, Clone)]
pub struct GradientOutputs {
    pub outputs: Vec<IValue>,
    pub input_grads: Vec<Option<Tensor>>,
}

/// Runs one graph, specializing it per distinct [`CompleteArgumentSpec`]
/// of its inputs and caching the resulting plans.
#[derive(Debug)]
pub struct GraphExecutor {
    graph: Graph,
    options: ExecutorOptions,
    registry: Arc<OperatorRegistry>,
    rules: BackwardRegistry,
    cache: ExecutorCache<CompleteArgumentSpec, ExecutionPlan>,
    counters: PipelineCounters,
}

impl GraphExecutor {
    /// An executor over the builtin operators and backward rules.
    pub fn new(graph: Graph, options: ExecutorOptions) -> Result<Self, ExecutorError> {
        let registry = OperatorRegistry::with_builtins()?;
        install_differentiable_graph_lowering(&registry);
        Ok(Self::with_registry(
            graph,
            options,
            Arc::new(registry),
            BackwardRegistry::with_builtins(),
        ))
    }

    #[must_use]
    pub fn with_registry(
        graph: Graph,
        options: ExecutorOptions,
        registry: Arc<OperatorRegistry>,
        rules: BackwardRegistry,
    ) -> Self {
        let cache = ExecutorCache::new(options.cache_capacity);
        Self {
            graph,
            options,
            registry,
            rules,
            cache,
            counters: PipelineCounters::default(),
        }
    }

    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    #[must_use]
    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<OperatorRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    #[must_use]
    pub fn pipeline_stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    /// The plan `inputs` dispatch to, compiling it on first sight.
    pub fn plan_for(&self, inputs: &[IValue]) -> Result<Arc<ExecutionPlan>, ExecutorError> {
        self.plan_with(inputs, self.options.grad_enabled)
    }

    fn plan_with(
        &self,
        inputs: &[IValue],
        with_grad: bool,
    ) -> Result<Arc<ExecutionPlan>, ExecutorError> {
        let spec = CompleteArgumentSpec::new(inputs, with_grad);
        let pipeline = Pipeline {
            graph: &self.graph,
            options: &self.options,
            registry: &self.registry,
            rules: &self.rules,
            counters: &self.counters,
        };
        let lookup = self.cache.get_or_compile(&spec, |spec| pipeline.compile(spec))?;
        Ok(lookup.into_value())
    }

    /// Runs the graph and returns its outputs.
    pub fn run(&self, inputs: &[IValue]) -> Result<Vec<IValue>, ExecutorError> {
        let plan = self.plan_for(inputs)?;
        let mut outputs = plan.run_forward(inputs.to_vec())?;
        outputs.truncate(plan.real_outputs());
        Ok(outputs)
    }

    /// Runs the graph forward and backward. `grad_outputs` seeds one
    /// gradient per graph output; undefined tensors stand for zero.
    pub fn run_with_grad(
        &self,
        inputs: &[IValue],
        grad_outputs: &[IValue],
    ) -> Result<GradientOutputs, ExecutorError> {
        if !self.options.grad_enabled {
            return Err(ExecutorError::GradientsDisabled);
        }
        let expected = self.graph.outputs().len();
        if grad_outputs.len() != expected {
            return Err(ExecutorError::GradOutputArity {
                expected,
                actual: grad_outputs.len(),
            });
        }
        let plan = self.plan_with(inputs, true)?;
        let forward = plan.run_forward(inputs.to_vec())?;
        let mut input_grads = vec![None; inputs.len()];
        if let Some(gradient) = plan.gradient() {
            let stack = gradient.backward_inputs(inputs, &forward, grad_outputs);
            let grads = gradient.run_backward(stack)?;
            for (&index, grad) in gradient.df_output_vjps().iter().zip(grads) {
                input_grads[index] = match grad {
                    IValue::Tensor(tensor) if tensor.is_defined() => Some(tensor),
                    _ => None,
                };
            }
        }
        let mut outputs = forward;
        outputs.truncate(plan.real_outputs());
        Ok(GradientOutputs {
            outputs,
            input_grads,
        })
    }
}
