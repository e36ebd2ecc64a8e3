#![forbid(unsafe_code)]

//! Shared scenario graphs and checks for the cross-crate conformance suites
//! under `tests/`.

use serde::{Deserialize, Serialize};
use tj_core::{Graph, IValue, IrError, SymbolicVariable, Tensor, Type, prim};
use tj_executor::{ExecutorError, GraphExecutor};

/// Serializable description of a scenario, digested into fixture ids for
/// structured test logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioFixture {
    pub scenario: String,
    pub inputs: Vec<Vec<f64>>,
    pub sizes: Vec<usize>,
}

impl ScenarioFixture {
    #[must_use]
    pub fn new(scenario: &str, inputs: &[&[f64]], sizes: &[usize]) -> Self {
        Self {
            scenario: scenario.to_owned(),
            inputs: inputs.iter().map(|x| x.to_vec()).collect(),
            sizes: sizes.to_vec(),
        }
    }

    /// One tensor per fixture input, shaped by `sizes`.
    pub fn tensors(&self, requires_grad: &[bool]) -> Result<Vec<IValue>, tj_core::TensorError> {
        self.inputs
            .iter()
            .enumerate()
            .map(|(i, data)| {
                let requires_grad = requires_grad.get(i).copied().unwrap_or(false);
                Tensor::from_vec(data.clone(), &self.sizes)
                    .map(|t| IValue::Tensor(t.with_requires_grad(requires_grad)))
            })
            .collect()
    }
}

fn typed_inputs(graph: &mut Graph, n: usize, ty: &Type) -> Vec<SymbolicVariable> {
    (0..n)
        .map(|_| SymbolicVariable::as_new_input(graph).set_type(graph, ty.clone()))
        .collect()
}

/// `if a < b { a + b } else { a - b }` over ints.
pub fn branch_graph() -> Result<Graph, IrError> {
    let mut g = Graph::new();
    let ab = typed_inputs(&mut g, 2, &Type::Int);
    let (a, b) = (ab[0], ab[1]);
    let cond = a.lt(&mut g, b)?.set_type(&mut g, Type::Bool);
    let node = g.insert(prim::IF, &[cond.value()], 1)?;
    let out = g.node(node).outputs()[0];
    g.set_type(out, Type::Int);
    let then_block = g.add_block(node);
    let sum = g.with_insert_point(g.block_return(then_block), |g| a.add(g, b))?;
    g.set_type(sum.value(), Type::Int);
    g.register_block_output(then_block, sum.value())?;
    let else_block = g.add_block(node);
    let diff = g.with_insert_point(g.block_return(else_block), |g| a.sub(g, b))?;
    g.set_type(diff.value(), Type::Int);
    g.register_block_output(else_block, diff.value())?;
    g.register_output(out)?;
    Ok(g)
}

/// `while i < 3 { a = a * a; i = i + 1 }` over ints, returning `a`.
pub fn loop_graph() -> Result<Graph, IrError> {
    let mut g = Graph::new();
    let ai = typed_inputs(&mut g, 2, &Type::Int);
    let (a, i) = (ai[0], ai[1]);
    let max_trips = g.insert_constant(&IValue::Int(i64::MAX))?;
    let three = SymbolicVariable::from(g.insert_constant(&IValue::Int(3))?);
    let one = SymbolicVariable::from(g.insert_constant(&IValue::Int(1))?);
    let enter = i.lt(&mut g, three)?.set_type(&mut g, Type::Bool);
    let node = g.insert(
        prim::LOOP,
        &[max_trips, enter.value(), a.value(), i.value()],
        2,
    )?;
    let outputs = g.node(node).outputs().to_vec();
    for &out in &outputs {
        g.set_type(out, Type::Int);
    }
    let body = g.add_block(node);
    let trip = g.add_block_input(body);
    g.set_type(trip, Type::Int);
    let a_in = SymbolicVariable::from(g.add_block_input(body)).set_type(&mut g, Type::Int);
    let i_in = SymbolicVariable::from(g.add_block_input(body)).set_type(&mut g, Type::Int);
    let (cond, a_next, i_next) = g.with_insert_point(g.block_return(body), |g| {
        let a_next = a_in.mul(g, a_in)?.set_type(g, Type::Int);
        let i_next = i_in.add(g, one)?.set_type(g, Type::Int);
        let cond = i_next.lt(g, three)?.set_type(g, Type::Bool);
        Ok::<_, IrError>((cond, a_next, i_next))
    })?;
    for v in [cond, a_next, i_next] {
        g.register_block_output(body, v.value())?;
    }
    g.register_output(outputs[0])?;
    Ok(g)
}

/// `c = a * b * a + b`
pub fn product_graph() -> Result<Graph, IrError> {
    let mut g = Graph::new();
    let a = SymbolicVariable::as_new_input(&mut g).named(&mut g, "a");
    let b = SymbolicVariable::as_new_input(&mut g).named(&mut g, "b");
    let c = a.mul(&mut g, b)?.mul(&mut g, a)?.add(&mut g, b)?;
    g.register_output(c.value())?;
    Ok(g)
}

/// `d = b * b + b; e = (d + a) * a + b`, returning `(d, e)`.
pub fn mixed_grad_graph() -> Result<Graph, IrError> {
    let mut g = Graph::new();
    let a = SymbolicVariable::as_new_input(&mut g).named(&mut g, "a");
    let b = SymbolicVariable::as_new_input(&mut g).named(&mut g, "b");
    let d = b.mul(&mut g, b)?.add(&mut g, b)?;
    let e = d.add(&mut g, a)?.mul(&mut g, a)?.add(&mut g, b)?;
    g.register_output(d.value())?;
    g.register_output(e.value())?;
    Ok(g)
}

/// One LSTM cell over `(input, hx, cx, w_ih, w_hh)`, returning `(hy, cy)`.
/// The gate pre-activations are split with a single four-way chunk.
pub fn lstm_cell_graph() -> Result<Graph, IrError> {
    let mut g = Graph::new();
    let mut input = |name: &str| SymbolicVariable::as_new_input(&mut g).named(&mut g, name);
    let x = input("input");
    let hx = input("hx");
    let cx = input("cx");
    let w_ih = input("w_ih");
    let w_hh = input("w_hh");
    let x_ih = x.mm(&mut g, w_ih)?;
    let h_hh = hx.mm(&mut g, w_hh)?;
    let gates = x_ih.add(&mut g, h_hh)?;
    let chunks = gates.chunk(&mut g, 4, 1)?;
    let [in_gate, forget_gate, cell_gate, out_gate] = chunks[..] else {
        return Err(IrError::IndexOutOfRange {
            what: "gate chunk",
            index: 3,
            len: chunks.len(),
        });
    };
    let in_gate = in_gate.sigmoid(&mut g)?;
    let forget_gate = forget_gate.sigmoid(&mut g)?;
    let cell_gate = cell_gate.tanh(&mut g)?;
    let out_gate = out_gate.sigmoid(&mut g)?;
    let forget_cx = forget_gate.mul(&mut g, cx)?;
    let in_cell = in_gate.mul(&mut g, cell_gate)?;
    let cy = forget_cx.add(&mut g, in_cell)?;
    let cy_tanh = cy.tanh(&mut g)?;
    let hy = out_gate.mul(&mut g, cy_tanh)?;
    g.register_output(hy.value())?;
    g.register_output(cy.value())?;
    Ok(g)
}

/// Runs `executor` and dots the first output's elements with `seed`.
pub fn seeded_objective(
    executor: &GraphExecutor,
    inputs: &[IValue],
    seed: &[f64],
) -> Result<f64, ExecutorError> {
    let outputs = executor.run(inputs)?;
    let values = outputs
        .first()
        .and_then(|v| v.to_tensor().ok())
        .and_then(|t| t.to_vec().ok())
        .unwrap_or_default();
    Ok(values.iter().zip(seed).map(|(v, s)| v * s).sum())
}

/// Central-difference gradient of [`seeded_objective`] with respect to the
/// tensor input `index`.
pub fn numeric_gradient(
    executor: &GraphExecutor,
    inputs: &[IValue],
    index: usize,
    seed: &[f64],
    eps: f64,
) -> Result<Vec<f64>, ExecutorError> {
    let base = inputs[index]
        .to_tensor()
        .ok()
        .and_then(|t| t.to_vec().ok().map(|data| (data, t.sizes().to_vec())))
        .unwrap_or_default();
    let (data, sizes) = base;
    let mut grad = Vec::with_capacity(data.len());
    for k in 0..data.len() {
        let shifted_objective = |delta: f64| {
            let mut shifted = data.clone();
            shifted[k] += delta;
            let mut args = inputs.to_vec();
            if let Ok(t) = Tensor::from_vec(shifted, &sizes) {
                args[index] = IValue::Tensor(t);
            }
            seeded_objective(executor, &args, seed)
        };
        let plus = shifted_objective(eps)?;
        let minus = shifted_objective(-eps)?;
        grad.push((plus - minus) / (2.0 * eps));
    }
    log::trace!("numeric gradient of input {index} over {} element(s)", grad.len());
    Ok(grad)
}
