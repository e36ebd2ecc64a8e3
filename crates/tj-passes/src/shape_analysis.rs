//! Best-effort static type propagation.
//!
//! Starting from the types already set on the graph inputs, every node's
//! outputs receive the most precise type the builtin operator set allows.
//! Kinds the pass does not know produce `Dynamic`. Control flow is handled
//! structurally: `prim::If` merges its two branches and `prim::Loop` iterates
//! its body until the carried types stop changing.

use std::fmt;
use tj_core::{
    BlockId, DType, Graph, NodeId, Symbol, TensorType, Type, ValueId, aten, attr,
    contiguous_strides, prim,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    RankMismatch {
        node: NodeId,
        kind: Symbol,
        expected: usize,
        actual: usize,
    },
    SizeMismatch {
        node: NodeId,
        kind: Symbol,
        left: Vec<usize>,
        right: Vec<usize>,
    },
    Arity {
        node: NodeId,
        kind: Symbol,
        expected: usize,
        actual: usize,
    },
}

impl fmt::Display for ShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RankMismatch {
                node,
                kind,
                expected,
                actual,
            } => write!(
                f,
                "{kind} at {node} expects rank-{expected} operands, got rank {actual}"
            ),
            Self::SizeMismatch {
                node,
                kind,
                left,
                right,
            } => write!(
                f,
                "{kind} at {node} has incompatible sizes {left:?} and {right:?}"
            ),
            Self::Arity {
                node,
                kind,
                expected,
                actual,
            } => write!(f, "{kind} at {node} expects {expected} input(s), got {actual}"),
        }
    }
}

impl std::error::Error for ShapeError {}

/// Upper bound on loop body re-analysis; each round can only make carried
/// types less precise, so this is reached only by pathological bodies.
const MAX_LOOP_ROUNDS: usize = 8;

pub fn propagate_input_shapes(graph: &mut Graph) -> Result<(), ShapeError> {
    let top = graph.block();
    propagate_block(graph, top)?;
    log::trace!("shape propagation finished over {} node(s)", graph.node_count());
    Ok(())
}

fn propagate_block(graph: &mut Graph, block: BlockId) -> Result<(), ShapeError> {
    let body: Vec<NodeId> = graph.block_nodes(block).to_vec();
    for node in body {
        propagate_node(graph, node)?;
    }
    Ok(())
}

fn propagate_node(graph: &mut Graph, node: NodeId) -> Result<(), ShapeError> {
    let kind = graph.kind(node);
    let inputs: Vec<Type> = graph
        .node(node)
        .inputs()
        .iter()
        .map(|&v| graph.ty(v).clone())
        .collect();

    let outputs: Vec<Type> = if kind == prim::IF {
        propagate_if(graph, node)?
    } else if kind == prim::LOOP {
        propagate_loop(graph, node)?
    } else if kind == prim::GRAD_OF {
        let block = graph.node(node).blocks()[0];
        propagate_block(graph, block)?;
        block_output_types(graph, block)
    } else if kind == aten::CHUNK {
        chunk_types(graph, node, &inputs)?
    } else if kind == prim::CONSTANT || kind == prim::DIFFERENTIABLE_GRAPH {
        // Typed at creation.
        return Ok(());
    } else {
        vec![infer_simple(node, kind, &inputs)?]
    };

    let values: Vec<ValueId> = graph.node(node).outputs().to_vec();
    for (value, ty) in values.into_iter().zip(outputs) {
        graph.set_type(value, ty);
    }
    Ok(())
}

fn block_output_types(graph: &Graph, block: BlockId) -> Vec<Type> {
    graph
        .block_outputs(block)
        .iter()
        .map(|&v| graph.ty(v).clone())
        .collect()
}

fn propagate_if(graph: &mut Graph, node: NodeId) -> Result<Vec<Type>, ShapeError> {
    let blocks = graph.node(node).blocks().to_vec();
    let [then_block, else_block] = blocks.as_slice() else {
        return Err(ShapeError::Arity {
            node,
            kind: prim::IF,
            expected: 2,
            actual: blocks.len(),
        });
    };
    propagate_block(graph, *then_block)?;
    propagate_block(graph, *else_block)?;
    Ok(block_output_types(graph, *then_block)
        .iter()
        .zip(block_output_types(graph, *else_block).iter())
        .map(|(a, b)| merge(a, b))
        .collect())
}

fn propagate_loop(graph: &mut Graph, node: NodeId) -> Result<Vec<Type>, ShapeError> {
    let inputs = graph.node(node).inputs().to_vec();
    if inputs.len() < 2 {
        return Err(ShapeError::Arity {
            node,
            kind: prim::LOOP,
            expected: 2,
            actual: inputs.len(),
        });
    }
    let body = graph.node(node).blocks()[0];
    let mut carried: Vec<Type> = inputs[2..].iter().map(|&v| graph.ty(v).clone()).collect();
    let block_inputs = graph.block_inputs(body).to_vec();
    for _ in 0..MAX_LOOP_ROUNDS {
        if let Some(&counter) = block_inputs.first() {
            graph.set_type(counter, Type::Int);
        }
        for (&value, ty) in block_inputs.iter().skip(1).zip(&carried) {
            graph.set_type(value, ty.clone());
        }
        propagate_block(graph, body)?;
        let produced = block_output_types(graph, body);
        let merged: Vec<Type> = carried
            .iter()
            .zip(produced.iter().skip(1))
            .map(|(a, b)| merge(a, b))
            .collect();
        if merged == carried {
            return Ok(carried);
        }
        carried = merged;
    }
    Ok(carried.iter().map(|_| Type::Dynamic).collect())
}

/// Least precise type covering both `a` and `b`.
fn merge(a: &Type, b: &Type) -> Type {
    if a == b {
        return a.clone();
    }
    match (a, b) {
        (Type::Tensor(x), Type::Tensor(y)) if x.dtype == y.dtype && x.device == y.device => {
            let mut out = TensorType::new(x.dtype, x.device)
                .with_requires_grad(x.requires_grad || y.requires_grad);
            match (x.dim(), y.dim()) {
                (Some(rx), Some(ry)) if rx == ry => out = out.with_rank(rx),
                _ => {}
            }
            Type::Tensor(out)
        }
        _ => Type::Dynamic,
    }
}

fn infer_simple(node: NodeId, kind: Symbol, inputs: &[Type]) -> Result<Type, ShapeError> {
    let ty = match (kind, inputs) {
        (k, [a, b])
            if k == aten::ADD || k == aten::SUB || k == aten::MUL || k == aten::DIV =>
        {
            match (a, b) {
                (Type::Int, Type::Int) if k != aten::DIV => Type::Int,
                (Type::Float | Type::Int, Type::Float | Type::Int) => Type::Float,
                _ => broadcast(node, kind, a, b, None)?,
            }
        }
        (k, [a, b]) if k == aten::LT || k == aten::GT || k == aten::EQ => match (a, b) {
            (Type::Int | Type::Float, Type::Int | Type::Float) => Type::Bool,
            _ => broadcast(node, kind, a, b, Some(DType::Bool))?,
        },
        (k, [a, b])
            if k == aten::SIGMOID_BACKWARD
                || k == aten::TANH_BACKWARD
                || k == aten::THRESHOLD_BACKWARD
                || k == prim::AUTOGRAD_ADD =>
        {
            broadcast(node, kind, a, b, None)?
        }
        (k, [a])
            if k == aten::NEG
                || k == aten::EXP
                || k == aten::SIGMOID
                || k == aten::TANH
                || k == aten::RELU =>
        {
            match a {
                Type::Tensor(t) => Type::Tensor(dense_like(t)),
                other => other.clone(),
            }
        }
        (k, [a]) if k == aten::T => match a {
            Type::Tensor(t) => transpose(node, t)?,
            _ => Type::Dynamic,
        },
        (k, [a, b]) if k == aten::MM => matmul(node, a, b)?,
        (k, [grad, reference]) if k == aten::GRAD_SUM_TO_SIZE => match (grad, reference) {
            (_, Type::Tensor(like)) => Type::Tensor(dense_like(like)),
            (Type::Tensor(g), _) => Type::Tensor(TensorType::new(g.dtype, g.device)),
            _ => Type::Dynamic,
        },
        (k, _) if k == prim::ANY_DEFINED => Type::Bool,
        (k, _) if k == prim::UNDEFINED => Type::Dynamic,
        (k, items) if k == prim::TUPLE_CONSTRUCT => Type::Tuple(items.to_vec()),
        _ => Type::Dynamic,
    };
    Ok(ty)
}

/// Same metadata as `t`, contiguous, not requiring grad.
fn dense_like(t: &TensorType) -> TensorType {
    let out = TensorType::new(t.dtype, t.device);
    match (&t.sizes, t.rank) {
        (Some(sizes), _) => out.with_sizes(sizes.clone()),
        (None, Some(rank)) => out.with_rank(rank),
        (None, None) => out,
    }
}

fn broadcast(
    node: NodeId,
    kind: Symbol,
    a: &Type,
    b: &Type,
    dtype: Option<DType>,
) -> Result<Type, ShapeError> {
    let (Type::Tensor(x), Type::Tensor(y)) = (a, b) else {
        return Ok(Type::Dynamic);
    };
    let pick = match (&x.sizes, &y.sizes) {
        (Some(sx), Some(sy)) => {
            let numel = |s: &[usize]| s.iter().product::<usize>();
            if sx == sy || numel(sy) == 1 {
                x
            } else if numel(sx) == 1 {
                y
            } else {
                return Err(ShapeError::SizeMismatch {
                    node,
                    kind,
                    left: sx.clone(),
                    right: sy.clone(),
                });
            }
        }
        _ => {
            let rank = match (x.dim(), y.dim()) {
                (Some(rx), Some(ry)) if rx == ry => Some(rx),
                _ => None,
            };
            let out = TensorType::new(dtype.unwrap_or(x.dtype), x.device);
            return Ok(Type::Tensor(match rank {
                Some(rank) => out.with_rank(rank),
                None => out,
            }));
        }
    };
    let mut out = dense_like(pick);
    if let Some(dtype) = dtype {
        out.dtype = dtype;
    }
    Ok(Type::Tensor(out))
}

fn transpose(node: NodeId, t: &TensorType) -> Result<Type, ShapeError> {
    match t.dim() {
        Some(rank) if rank > 2 => Err(ShapeError::RankMismatch {
            node,
            kind: aten::T,
            expected: 2,
            actual: rank,
        }),
        _ => {
            let out = TensorType::new(t.dtype, t.device);
            Ok(Type::Tensor(match (&t.sizes, &t.strides) {
                (Some(sizes), strides) if sizes.len() == 2 => {
                    let strides = strides
                        .clone()
                        .unwrap_or_else(|| contiguous_strides(sizes));
                    out.with_sizes_and_strides(
                        vec![sizes[1], sizes[0]],
                        vec![strides[1], strides[0]],
                    )
                }
                (Some(sizes), _) => out.with_sizes(sizes.clone()),
                (None, _) => match t.rank {
                    Some(rank) => out.with_rank(rank),
                    None => out,
                },
            }))
        }
    }
}

/// One type per `aten::chunk` output, sized from the `chunks`/`dim`
/// attributes when the input sizes are known.
fn chunk_types(graph: &Graph, node: NodeId, inputs: &[Type]) -> Result<Vec<Type>, ShapeError> {
    let outputs = graph.node(node).outputs().len();
    let [Type::Tensor(input)] = inputs else {
        return Ok(vec![Type::Dynamic; outputs]);
    };
    let attrs = graph.attributes(node);
    let sizes = match (&input.sizes, attrs.i(attr::CHUNKS), attrs.i(attr::DIM)) {
        (Some(sizes), Ok(&chunks), Ok(&dim)) => usize::try_from(chunks)
            .ok()
            .zip(usize::try_from(dim).ok())
            .filter(|&(chunks, dim)| chunks > 0 && dim < sizes.len())
            .map(|(chunks, dim)| (sizes, chunks, dim)),
        _ => None,
    };
    let Some((sizes, chunks, dim)) = sizes else {
        let out = TensorType::new(input.dtype, input.device);
        let out = match input.dim() {
            Some(rank) => out.with_rank(rank),
            None => out,
        };
        return Ok(vec![Type::Tensor(out); outputs]);
    };
    let extent = sizes[dim];
    let step = extent.div_ceil(chunks).max(1);
    let pieces = extent.div_ceil(step);
    if pieces != outputs {
        return Err(ShapeError::Arity {
            node,
            kind: aten::CHUNK,
            expected: outputs,
            actual: pieces,
        });
    }
    Ok((0..pieces)
        .map(|i| {
            let mut piece = sizes.clone();
            piece[dim] = step.min(extent - i * step);
            Type::Tensor(TensorType::new(input.dtype, input.device).with_sizes(piece))
        })
        .collect())
}

fn matmul(node: NodeId, a: &Type, b: &Type) -> Result<Type, ShapeError> {
    let (Type::Tensor(x), Type::Tensor(y)) = (a, b) else {
        return Ok(Type::Dynamic);
    };
    if let Some(rank) = [x, y].iter().filter_map(|t| t.dim()).find(|&rank| rank != 2) {
        return Err(ShapeError::RankMismatch {
            node,
            kind: aten::MM,
            expected: 2,
            actual: rank,
        });
    }
    let out = TensorType::new(x.dtype, x.device);
    match (&x.sizes, &y.sizes) {
        (Some(sx), Some(sy)) if sx[1] != sy[0] => Err(ShapeError::SizeMismatch {
            node,
            kind: aten::MM,
            left: sx.clone(),
            right: sy.clone(),
        }),
        (Some(sx), Some(sy)) => Ok(Type::Tensor(out.with_sizes(vec![sx[0], sy[1]]))),
        _ => Ok(Type::Tensor(out.with_rank(2))),
    }
}
