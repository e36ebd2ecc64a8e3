#![forbid(unsafe_code)]

//! Symbolic differentiation of graphs.
//!
//! [`differentiate`] splits a graph into a forward graph `f` and a backward
//! graph `df`. The backward computation is first built as a `prim::Reverse`
//! block attached to `f`, where it can read any forward value; it is then
//! lifted into its own graph. Forward values it reads become extra inputs of
//! `df`, which `f` supplies either from its own inputs or as extra outputs.
//!
//! `df` takes, in order: the vjps listed by `df_input_vjps`, the forward
//! inputs listed by `df_input_captured_inputs`, and the forward outputs
//! listed by `df_input_captured_outputs`. Its outputs are the gradients of
//! the forward inputs listed by `df_output_vjps`.

mod rules;

pub use rules::{BackwardArgs, BackwardRegistry, BackwardRule};

use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;
use tj_core::{
    AttributeValue, BlockId, Graph, IrError, NodeId, Symbol, SymbolicVariable, ValueId, attr,
    prim,
};
use tj_passes::eliminate_dead_code_in_block;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutodiffError {
    /// A node on the path of a requested gradient has no backward rule.
    NoBackwardRule { kind: Symbol },
    /// A rule returned the wrong number of input gradients.
    RuleArity {
        kind: Symbol,
        expected: usize,
        actual: usize,
    },
    Ir(IrError),
}

impl fmt::Display for AutodiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoBackwardRule { kind } => {
                write!(f, "no backward rule registered for {kind}")
            }
            Self::RuleArity {
                kind,
                expected,
                actual,
            } => write!(
                f,
                "backward rule for {kind} returned {actual} gradient(s), expected {expected}"
            ),
            Self::Ir(err) => write!(f, "graph error during differentiation: {err}"),
        }
    }
}

impl std::error::Error for AutodiffError {}

impl From<IrError> for AutodiffError {
    fn from(err: IrError) -> Self {
        Self::Ir(err)
    }
}

/// A forward/backward graph pair and the wiring between them.
#[derive(Debug, Clone)]
pub struct Gradient {
    pub f: Graph,
    pub df: Graph,
    /// Outputs of `f` the caller asked for; the rest are captures for `df`.
    pub f_real_outputs: usize,
    /// For each leading vjp input of `df`, the index of the `f` output it
    /// is the gradient of.
    pub df_input_vjps: Vec<usize>,
    /// Indices of `f` inputs passed to `df` after the vjps.
    pub df_input_captured_inputs: Vec<usize>,
    /// Indices of `f` outputs passed to `df` after the captured inputs.
    pub df_input_captured_outputs: Vec<usize>,
    /// For each output of `df`, the index of the `f` input it differentiates.
    pub df_output_vjps: Vec<usize>,
}

/// Differentiates `graph` with respect to every input whose type requires
/// grad. Types should be propagated beforehand; `Dynamic` values are
/// treated as requiring grad.
pub fn differentiate(graph: &Graph, rules: &BackwardRegistry) -> Result<Gradient, AutodiffError> {
    let mut f = graph.copy()?;
    let reverse = build_reverse(&mut f, rules)?;
    let removed = eliminate_dead_code_in_block(&mut f, reverse.block)?;
    log::trace!("reverse block dead code elimination removed {removed} node(s)");
    let gradient = lambda_lift(f, reverse)?;
    log::debug!(
        "differentiated graph: {} real output(s), {} vjp(s), {} captured input(s), \
         {} captured output(s), {} input gradient(s)",
        gradient.f_real_outputs,
        gradient.df_input_vjps.len(),
        gradient.df_input_captured_inputs.len(),
        gradient.df_input_captured_outputs.len(),
        gradient.df_output_vjps.len(),
    );
    Ok(gradient)
}

struct Reverse {
    node: NodeId,
    block: BlockId,
    grads: FxHashMap<ValueId, ValueId>,
    input_vjps: Vec<usize>,
    output_vjps: Vec<usize>,
}

impl Reverse {
    /// Accumulated gradient of `value`, or a fresh undefined one.
    fn get_grad(&self, f: &mut Graph, value: ValueId) -> Result<ValueId, IrError> {
        if let Some(&grad) = self.grads.get(&value) {
            return Ok(grad);
        }
        let undefined = f.insert(prim::UNDEFINED, &[], 1)?;
        Ok(f.node(undefined).outputs()[0])
    }

    fn set_grad(&mut self, f: &mut Graph, value: ValueId, grad: ValueId) -> Result<(), IrError> {
        let accumulated = match self.grads.get(&value) {
            Some(&previous) => {
                let sum = f.insert(prim::AUTOGRAD_ADD, &[previous, grad], 1)?;
                let out = f.node(sum).outputs()[0];
                f.set_type(out, f.ty(grad).clone());
                out
            }
            None => grad,
        };
        self.grads.insert(value, accumulated);
        Ok(())
    }

    fn visit(
        &mut self,
        f: &mut Graph,
        node: NodeId,
        rules: &BackwardRegistry,
    ) -> Result<(), AutodiffError> {
        let inputs: Vec<ValueId> = f.node(node).inputs().to_vec();
        let outputs: Vec<ValueId> = f.node(node).outputs().to_vec();
        if !outputs.iter().any(|o| self.grads.contains_key(o))
            || !inputs.iter().any(|&v| f.ty(v).requires_grad())
        {
            return Ok(());
        }
        let kind = f.kind(node);
        let rule = rules
            .rule(kind)
            .ok_or(AutodiffError::NoBackwardRule { kind })?;

        let mut grads = Vec::with_capacity(outputs.len());
        for &output in &outputs {
            grads.push(self.get_grad(f, output)?);
        }
        let grad_of = f.insert(prim::GRAD_OF, &grads, inputs.len())?;
        f.set_attribute(
            grad_of,
            attr::NAME,
            AttributeValue::S(kind.to_qual_string().to_owned()),
        );
        let body = f.add_block(grad_of);
        let args = BackwardArgs {
            inputs: inputs.iter().copied().map(SymbolicVariable::from).collect(),
            outputs: outputs.iter().copied().map(SymbolicVariable::from).collect(),
            grads: grads.iter().copied().map(SymbolicVariable::from).collect(),
        };
        let body_end = f.block_return(body);
        let computed = f.with_insert_point(body_end, |f| rule(f, &args))?;
        if computed.len() != inputs.len() {
            return Err(AutodiffError::RuleArity {
                kind,
                expected: inputs.len(),
                actual: computed.len(),
            });
        }

        let grad_outputs: Vec<ValueId> = f.node(grad_of).outputs().to_vec();
        for ((&input, computed), &grad_output) in inputs.iter().zip(computed).zip(&grad_outputs) {
            let needed = f.ty(input).requires_grad();
            let produced = match computed {
                Some(grad) if needed => grad.value(),
                _ => {
                    let undefined = f.create(prim::UNDEFINED, &[], 1);
                    f.insert_before(undefined, body_end)?;
                    f.node(undefined).outputs()[0]
                }
            };
            f.register_block_output(body, produced)?;
            f.set_type(grad_output, f.ty(input).with_requires_grad(false));
            if needed {
                self.set_grad(f, input, grad_output)?;
            }
        }
        Ok(())
    }
}

fn build_reverse(f: &mut Graph, rules: &BackwardRegistry) -> Result<Reverse, AutodiffError> {
    let forward: Vec<NodeId> = f.block_nodes(f.block()).to_vec();
    let node = f.create(prim::REVERSE, &[], 0);
    f.append_node(node)?;
    let block = f.add_block(node);
    f.set_insert_point_to_end(block);

    let mut reverse = Reverse {
        node,
        block,
        grads: FxHashMap::default(),
        input_vjps: Vec::new(),
        output_vjps: Vec::new(),
    };

    let outputs: Vec<ValueId> = f.outputs().to_vec();
    for (index, &output) in outputs.iter().enumerate() {
        if !f.ty(output).requires_grad() {
            continue;
        }
        let vjp = f.add_block_input(block);
        f.set_type(vjp, f.ty(output).with_requires_grad(false));
        reverse.set_grad(f, output, vjp)?;
        reverse.input_vjps.push(index);
    }

    for &node in forward.iter().rev() {
        let kind = f.kind(node);
        if (kind == prim::IF || kind == prim::LOOP)
            && f.node(node).outputs().iter().any(|o| reverse.grads.contains_key(o))
            && f.node(node).outputs().iter().any(|&o| f.ty(o).requires_grad())
        {
            return Err(AutodiffError::NoBackwardRule { kind });
        }
        reverse.visit(f, node, rules)?;
    }

    let inputs: Vec<ValueId> = f.inputs().to_vec();
    for (index, &input) in inputs.iter().enumerate() {
        if !f.ty(input).requires_grad() {
            continue;
        }
        let grad = reverse.get_grad(f, input)?;
        f.register_block_output(block, grad)?;
        reverse.output_vjps.push(index);
    }
    f.set_insert_point_to_end(f.block());
    Ok(reverse)
}

/// Forward values read inside `block`, in first-use order.
fn collect_captures(
    f: &Graph,
    block: BlockId,
    within: BlockId,
    seen: &mut FxHashSet<ValueId>,
    out: &mut Vec<ValueId>,
) {
    for &node in f.block_nodes(block) {
        for &input in f.node(node).inputs() {
            capture(f, input, within, seen, out);
        }
        for &inner in f.node(node).blocks() {
            collect_captures(f, inner, within, seen, out);
        }
    }
    for &output in f.block_outputs(block) {
        capture(f, output, within, seen, out);
    }
}

fn capture(
    f: &Graph,
    value: ValueId,
    within: BlockId,
    seen: &mut FxHashSet<ValueId>,
    out: &mut Vec<ValueId>,
) {
    if !f.is_within(f.value(value).node(), within) && seen.insert(value) {
        out.push(value);
    }
}

fn lambda_lift(mut f: Graph, mut reverse: Reverse) -> Result<Gradient, IrError> {
    let block = reverse.block;
    let f_real_outputs = f.outputs().len();

    let mut captures = Vec::new();
    collect_captures(&f, block, block, &mut FxHashSet::default(), &mut captures);

    let param = f.param_node();
    let mut captured_inputs: Vec<ValueId> = Vec::new();
    let mut captured_outputs: Vec<ValueId> = Vec::new();
    let mut df_input_captured_inputs = Vec::new();
    let mut df_input_captured_outputs = Vec::new();
    for value in captures {
        if f.value(value).node() == param {
            df_input_captured_inputs.push(f.value(value).offset());
            captured_inputs.push(value);
            continue;
        }
        let index = match f.outputs().iter().position(|&o| o == value) {
            Some(index) => index,
            None => f.register_output(value)?,
        };
        df_input_captured_outputs.push(index);
        captured_outputs.push(value);
    }

    // Temporaries exposed as outputs may receive gradient from whoever
    // consumes them, so each gets a vjp that joins its accumulated gradient.
    let outputs: Vec<ValueId> = f.outputs().to_vec();
    for (index, &tmp) in outputs.iter().enumerate().skip(f_real_outputs) {
        if !f.ty(tmp).requires_grad() {
            continue;
        }
        let vjp = f.add_block_input(block);
        f.set_type(vjp, f.ty(tmp).with_requires_grad(false));
        reverse.input_vjps.push(index);
        let Some(&previous) = reverse.grads.get(&tmp) else {
            continue;
        };
        if f.value(previous).is_destroyed() {
            continue;
        }
        let sum = f.create(prim::AUTOGRAD_ADD, &[vjp, vjp], 1);
        f.insert_after(sum, f.value(previous).node())?;
        let joined = f.node(sum).outputs()[0];
        f.set_type(joined, f.ty(previous).clone());
        f.replace_all_uses_with(previous, joined);
        f.replace_input(sum, 1, previous)?;
        reverse.grads.insert(tmp, joined);
    }

    let mut df = Graph::new();
    let mut env: FxHashMap<ValueId, ValueId> = FxHashMap::default();
    let lifted_inputs: Vec<ValueId> = f
        .block_inputs(block)
        .iter()
        .chain(&captured_inputs)
        .chain(&captured_outputs)
        .copied()
        .collect();
    for value in lifted_inputs {
        let mapped = df.add_input();
        df.set_type(mapped, f.ty(value).clone());
        env.insert(value, mapped);
    }
    for &node in f.block_nodes(block) {
        let cloned = df.create_clone(&f, node, &mut env)?;
        df.append_node(cloned)?;
    }
    for &output in f.block_outputs(block) {
        let mapped = env
            .get(&output)
            .copied()
            .ok_or(IrError::UnmappedValue { value: output })?;
        df.register_output(mapped)?;
    }

    f.destroy_node(reverse.node)?;
    Ok(Gradient {
        f,
        df,
        f_real_outputs,
        df_input_vjps: reverse.input_vjps,
        df_input_captured_inputs,
        df_input_captured_outputs,
        df_output_vjps: reverse.output_vjps,
    })
}

#[cfg(test)]
mod tests {
    use super::{AutodiffError, BackwardRegistry, differentiate};
    use tj_core::{
        DType, Device, Graph, Symbol, SymbolicVariable, TensorType, Type, aten, attr, prim,
    };
    use tj_passes::{propagate_input_shapes, propagate_requires_grad};

    fn tensor(requires_grad: bool) -> Type {
        sized(&[2, 2], requires_grad)
    }

    fn sized(sizes: &[usize], requires_grad: bool) -> Type {
        Type::Tensor(
            TensorType::new(DType::F32, Device::Cpu)
                .with_sizes(sizes.to_vec())
                .with_requires_grad(requires_grad),
        )
    }

    fn specialize(g: &mut Graph) {
        propagate_input_shapes(g).expect("shapes");
        propagate_requires_grad(g);
    }

    /// `(kind, int[] constant operand)` for each gradient reduction in `df`.
    fn reductions(df: &Graph) -> Vec<Option<Vec<i64>>> {
        df.all_nodes(df.block())
            .into_iter()
            .filter(|&n| df.kind(n) == aten::GRAD_SUM_TO_SIZE)
            .map(|n| {
                let target = df.node(n).inputs()[1];
                let producer = df.value(target).node();
                (df.kind(producer) == prim::CONSTANT)
                    .then(|| df.attributes(producer).is(attr::VALUE).ok().cloned())
                    .flatten()
            })
            .collect()
    }

    #[test]
    fn product_graph_captures_inputs_and_a_temporary() {
        tj_test_utils::init_test_logging();
        let mut g = Graph::new();
        let a = SymbolicVariable::as_new_input(&mut g);
        let b = SymbolicVariable::as_new_input(&mut g);
        g.set_type(a.value(), tensor(true));
        g.set_type(b.value(), tensor(true));
        let c = a
            .mul(&mut g, b)
            .and_then(|ab| ab.mul(&mut g, a))
            .and_then(|aba| aba.add(&mut g, b))
            .expect("build");
        g.register_output(c.value()).expect("output");
        specialize(&mut g);

        let grad = differentiate(&g, &BackwardRegistry::with_builtins()).expect("differentiable");
        assert_eq!(grad.f_real_outputs, 1);
        assert_eq!(grad.df_input_captured_inputs, vec![0, 1]);
        assert_eq!(grad.df_input_captured_outputs, vec![1]);
        assert_eq!(grad.df_input_vjps, vec![0, 1]);
        assert_eq!(grad.df_output_vjps, vec![0, 1]);
        assert_eq!(grad.f.outputs().len(), 2);
        assert_eq!(grad.df.inputs().len(), 2 + 2 + 1);
        assert_eq!(grad.df.outputs().len(), 2);
        grad.f.lint().expect("forward well formed");
        grad.df.lint().expect("backward well formed");
        assert!(reductions(&grad.df).is_empty());
        assert!(
            grad.f
                .all_nodes(grad.f.block())
                .iter()
                .all(|&n| grad.f.kind(n) != prim::REVERSE)
        );
    }

    #[test]
    fn only_inputs_requiring_grad_are_differentiated() {
        tj_test_utils::init_test_logging();
        let mut g = Graph::new();
        let a = SymbolicVariable::as_new_input(&mut g);
        let b = SymbolicVariable::as_new_input(&mut g);
        g.set_type(a.value(), tensor(true));
        g.set_type(b.value(), tensor(false));
        let d = b
            .mul(&mut g, b)
            .and_then(|bb| bb.add(&mut g, b))
            .expect("d");
        let e = d
            .add(&mut g, a)
            .and_then(|da| da.mul(&mut g, a))
            .and_then(|daa| daa.add(&mut g, b))
            .expect("e");
        g.register_output(d.value()).expect("d out");
        g.register_output(e.value()).expect("e out");
        specialize(&mut g);

        let grad = differentiate(&g, &BackwardRegistry::with_builtins()).expect("differentiable");
        assert_eq!(grad.f_real_outputs, 2);
        assert_eq!(grad.df_input_captured_inputs, vec![0]);
        assert_eq!(grad.df_input_captured_outputs, vec![2]);
        assert_eq!(grad.df_input_vjps, vec![1, 2]);
        assert_eq!(grad.df_output_vjps, vec![0]);
        grad.df.lint().expect("backward well formed");
    }

    #[test]
    fn inference_only_graphs_differentiate_trivially() {
        let mut g = Graph::new();
        let a = SymbolicVariable::as_new_input(&mut g);
        g.set_type(a.value(), tensor(false));
        let opaque = SymbolicVariable::create(&mut g, Symbol::aten("opaque"), &[a], 1)
            .expect("opaque")[0];
        g.register_output(opaque.value()).expect("out");
        propagate_requires_grad(&mut g);

        let grad = differentiate(&g, &BackwardRegistry::with_builtins()).expect("trivial");
        assert!(grad.df_input_vjps.is_empty());
        assert!(grad.df_output_vjps.is_empty());
        assert_eq!(grad.df.node_count(), 0);
        assert_eq!(grad.f.node_count(), 1);
    }

    #[test]
    fn missing_rule_fails_only_when_load_bearing() {
        let opaque = Symbol::aten("opaque");
        let mut g = Graph::new();
        let a = SymbolicVariable::as_new_input(&mut g);
        g.set_type(a.value(), tensor(true));
        let _unused = SymbolicVariable::create(&mut g, opaque, &[a], 1).expect("opaque");
        let y = a.exp(&mut g).expect("exp");
        g.register_output(y.value()).expect("out");
        propagate_requires_grad(&mut g);
        differentiate(&g, &BackwardRegistry::with_builtins()).expect("opaque node is not needed");

        let blocked = SymbolicVariable::create(&mut g, opaque, &[y], 1).expect("opaque")[0];
        g.set_type(blocked.value(), tensor(true));
        g.erase_output(0).expect("erase");
        g.register_output(blocked.value()).expect("out");
        assert_eq!(
            differentiate(&g, &BackwardRegistry::with_builtins()).map(|_| ()),
            Err(AutodiffError::NoBackwardRule { kind: opaque })
        );
    }

    #[test]
    fn broadcast_operands_reduce_to_their_static_sizes() {
        tj_test_utils::init_test_logging();
        let mut g = Graph::new();
        let a = SymbolicVariable::as_new_input(&mut g);
        let b = SymbolicVariable::as_new_input(&mut g);
        g.set_type(a.value(), sized(&[], true));
        g.set_type(b.value(), sized(&[3], true));
        let y = a.mul(&mut g, b).expect("mul");
        g.register_output(y.value()).expect("out");
        specialize(&mut g);

        let grad = differentiate(&g, &BackwardRegistry::with_builtins()).expect("differentiable");
        assert_eq!(reductions(&grad.df), vec![Some(vec![])]);
        assert_eq!(grad.df_input_captured_inputs, vec![1, 0]);
        assert!(grad.df_input_captured_outputs.is_empty());
        grad.df.lint().expect("backward well formed");
    }

    #[test]
    fn unknown_sizes_reduce_against_the_input_at_run_time() {
        let mut g = Graph::new();
        let a = SymbolicVariable::as_new_input(&mut g);
        let b = SymbolicVariable::as_new_input(&mut g);
        let y = a.add(&mut g, b).expect("add");
        g.register_output(y.value()).expect("out");
        propagate_requires_grad(&mut g);

        let grad = differentiate(&g, &BackwardRegistry::with_builtins()).expect("differentiable");
        assert_eq!(reductions(&grad.df), vec![None, None]);
        assert_eq!(grad.df_input_captured_inputs, vec![0, 1]);
        assert_eq!(grad.df.inputs().len(), 1 + 2);
        grad.df.lint().expect("backward well formed");

        let mut same = Graph::new();
        let a = SymbolicVariable::as_new_input(&mut same);
        let b = SymbolicVariable::as_new_input(&mut same);
        same.set_type(a.value(), tensor(true));
        same.set_type(b.value(), tensor(true));
        let y = a.add(&mut same, b).expect("add");
        same.register_output(y.value()).expect("out");
        specialize(&mut same);
        let grad =
            differentiate(&same, &BackwardRegistry::with_builtins()).expect("differentiable");
        assert!(reductions(&grad.df).is_empty());
        assert!(grad.df_input_captured_inputs.is_empty());
    }
}
