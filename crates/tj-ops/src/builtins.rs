use crate::arithmetic::{
    autograd_add, binary_elementwise, matmul, sigmoid, transpose, unary_elementwise,
};
use crate::comparison::compare;
use crate::registry::{NodeLoweringContext, OperatorRegistry, create_operator};
use crate::tensor_ops::{chunk, sizes_from_ints, sum_to_size};
use crate::{OpError, Operation, RegistrationError, Stack, pop_operands};
use std::sync::Arc;
use tj_core::{AttributeValue, IValue, Tensor, aten, attr, prim};

/// Registers the reference kernels for the builtin `aten` operators and the
/// lowerings for the `prim` nodes the interpreter treats as operators.
pub fn register_builtin_operators(registry: &OperatorRegistry) -> Result<(), RegistrationError> {
    register_arithmetic(registry)?;
    register_unary(registry)?;
    register_comparisons(registry)?;
    register_backward_kernels(registry)?;

    registry.register(create_operator("prim::Undefined() -> Tensor", Tensor::undefined)?)?;
    registry.register(create_operator(
        "prim::AutogradAdd(Tensor a, Tensor b) -> Tensor",
        |a: Tensor, b: Tensor| autograd_add(prim::AUTOGRAD_ADD, a, b),
    )?)?;

    registry.register_lowering(prim::CONSTANT, Arc::new(lower_constant));
    registry.register_lowering(prim::ANY_DEFINED, Arc::new(lower_any_defined));
    registry.register_lowering(prim::TUPLE_CONSTRUCT, Arc::new(lower_tuple_construct));
    registry.register_lowering(aten::CHUNK, Arc::new(lower_chunk));
    Ok(())
}

fn register_arithmetic(registry: &OperatorRegistry) -> Result<(), RegistrationError> {
    registry.register(create_operator(
        "aten::add(Tensor self, Tensor other) -> Tensor",
        |a: Tensor, b: Tensor| binary_elementwise(aten::ADD, &a, &b, |x, y| x + y),
    )?)?;
    registry.register(create_operator("aten::add(int a, int b) -> int", |a: i64, b: i64| {
        a.wrapping_add(b)
    })?)?;
    registry.register(create_operator(
        "aten::add(float a, float b) -> float",
        |a: f64, b: f64| a + b,
    )?)?;
    registry.register(create_operator(
        "aten::sub(Tensor self, Tensor other) -> Tensor",
        |a: Tensor, b: Tensor| binary_elementwise(aten::SUB, &a, &b, |x, y| x - y),
    )?)?;
    registry.register(create_operator("aten::sub(int a, int b) -> int", |a: i64, b: i64| {
        a.wrapping_sub(b)
    })?)?;
    registry.register(create_operator(
        "aten::mul(Tensor self, Tensor other) -> Tensor",
        |a: Tensor, b: Tensor| binary_elementwise(aten::MUL, &a, &b, |x, y| x * y),
    )?)?;
    registry.register(create_operator("aten::mul(int a, int b) -> int", |a: i64, b: i64| {
        a.wrapping_mul(b)
    })?)?;
    registry.register(create_operator(
        "aten::mul(float a, float b) -> float",
        |a: f64, b: f64| a * b,
    )?)?;
    registry.register(create_operator(
        "aten::div(Tensor self, Tensor other) -> Tensor",
        |a: Tensor, b: Tensor| binary_elementwise(aten::DIV, &a, &b, |x, y| x / y),
    )?)?;
    registry.register(create_operator(
        "aten::mm(Tensor self, Tensor mat2) -> Tensor",
        |a: Tensor, b: Tensor| matmul(aten::MM, &a, &b),
    )?)?;
    registry.register(create_operator("aten::t(Tensor self) -> Tensor", |a: Tensor| {
        transpose(aten::T, &a)
    })?)?;
    Ok(())
}

fn register_unary(registry: &OperatorRegistry) -> Result<(), RegistrationError> {
    registry.register(create_operator("aten::neg(Tensor self) -> Tensor", |a: Tensor| {
        unary_elementwise(aten::NEG, &a, |x| -x)
    })?)?;
    registry.register(create_operator("aten::exp(Tensor self) -> Tensor", |a: Tensor| {
        unary_elementwise(aten::EXP, &a, f64::exp)
    })?)?;
    registry.register(create_operator("aten::sigmoid(Tensor self) -> Tensor", |a: Tensor| {
        unary_elementwise(aten::SIGMOID, &a, sigmoid)
    })?)?;
    registry.register(create_operator("aten::tanh(Tensor self) -> Tensor", |a: Tensor| {
        unary_elementwise(aten::TANH, &a, f64::tanh)
    })?)?;
    registry.register(create_operator("aten::relu(Tensor self) -> Tensor", |a: Tensor| {
        unary_elementwise(aten::RELU, &a, |x| x.max(0.0))
    })?)?;
    Ok(())
}

fn register_comparisons(registry: &OperatorRegistry) -> Result<(), RegistrationError> {
    registry.register(create_operator(
        "aten::lt(Tensor self, Tensor other) -> Tensor",
        |a: Tensor, b: Tensor| compare(aten::LT, &a, &b, |x, y| x < y),
    )?)?;
    registry.register(create_operator("aten::lt(int a, int b) -> bool", |a: i64, b: i64| a < b)?)?;
    registry.register(create_operator(
        "aten::gt(Tensor self, Tensor other) -> Tensor",
        |a: Tensor, b: Tensor| compare(aten::GT, &a, &b, |x, y| x > y),
    )?)?;
    registry.register(create_operator("aten::gt(int a, int b) -> bool", |a: i64, b: i64| a > b)?)?;
    registry.register(create_operator(
        "aten::eq(Tensor self, Tensor other) -> Tensor",
        |a: Tensor, b: Tensor| compare(aten::EQ, &a, &b, |x, y| x == y),
    )?)?;
    registry.register(create_operator("aten::eq(int a, int b) -> bool", |a: i64, b: i64| a == b)?)?;
    Ok(())
}

fn register_backward_kernels(registry: &OperatorRegistry) -> Result<(), RegistrationError> {
    registry.register(create_operator(
        "aten::sigmoid_backward(Tensor grad_output, Tensor output) -> Tensor",
        |g: Tensor, y: Tensor| {
            binary_elementwise(aten::SIGMOID_BACKWARD, &g, &y, |g, y| g * y * (1.0 - y))
        },
    )?)?;
    registry.register(create_operator(
        "aten::tanh_backward(Tensor grad_output, Tensor output) -> Tensor",
        |g: Tensor, y: Tensor| {
            binary_elementwise(aten::TANH_BACKWARD, &g, &y, |g, y| g * (1.0 - y * y))
        },
    )?)?;
    registry.register(create_operator(
        "aten::threshold_backward(Tensor grad_output, Tensor self) -> Tensor",
        |g: Tensor, x: Tensor| {
            binary_elementwise(aten::THRESHOLD_BACKWARD, &g, &x, |g, x| {
                if x > 0.0 { g } else { 0.0 }
            })
        },
    )?)?;
    registry.register(create_operator(
        "aten::_grad_sum_to_size(Tensor self, int[] size) -> Tensor",
        |g: Tensor, size: Vec<i64>| {
            let sizes = sizes_from_ints(aten::GRAD_SUM_TO_SIZE, &size)?;
            sum_to_size(aten::GRAD_SUM_TO_SIZE, &g, &sizes)
        },
    )?)?;
    registry.register(create_operator(
        "aten::_grad_sum_to_size(Tensor self, Tensor like) -> Tensor",
        |g: Tensor, like: Tensor| sum_to_size(aten::GRAD_SUM_TO_SIZE, &g, like.sizes()),
    )?)?;
    Ok(())
}

/// `aten::chunk` has one output per piece, so its arity comes from the node.
fn lower_chunk(ctx: &NodeLoweringContext<'_>) -> Result<Operation, OpError> {
    let attrs = ctx.graph.attributes(ctx.node);
    let read = |name| {
        attrs
            .i(name)
            .ok()
            .and_then(|&v| usize::try_from(v).ok())
            .ok_or_else(|| OpError::Lowering {
                kind: aten::CHUNK,
                detail: format!("missing or negative {name} attribute"),
            })
    };
    let (chunks, dim) = (read(attr::CHUNKS)?, read(attr::DIM)?);
    let outputs = ctx.graph.node(ctx.node).outputs().len();
    Ok(Arc::new(move |stack: &mut Stack| {
        let operands = pop_operands(stack, aten::CHUNK, 1)?;
        let input = match operands.into_iter().next() {
            Some(IValue::Tensor(t)) => t,
            other => {
                return Err(OpError::ArgumentType {
                    op: aten::CHUNK,
                    index: 0,
                    expected: crate::SchemaType::Tensor,
                    actual: other.unwrap_or_default().kind(),
                });
            }
        };
        let pieces = chunk(aten::CHUNK, &input, chunks, dim)?;
        if pieces.len() != outputs {
            return Err(OpError::Lowering {
                kind: aten::CHUNK,
                detail: format!(
                    "{} piece(s) along dim {dim} of {:?}, node declares {outputs}",
                    pieces.len(),
                    input.sizes()
                ),
            });
        }
        stack.extend(pieces.into_iter().map(IValue::Tensor));
        Ok(())
    }))
}

fn lower_constant(ctx: &NodeLoweringContext<'_>) -> Result<Operation, OpError> {
    let is_bool = matches!(
        ctx.graph.ty(ctx.graph.node(ctx.node).outputs()[0]),
        tj_core::Type::Bool
    );
    let value = match ctx.graph.attributes(ctx.node).get(attr::VALUE) {
        None => IValue::None,
        Some(AttributeValue::I(v)) if is_bool => IValue::Bool(*v != 0),
        Some(AttributeValue::I(v)) => IValue::Int(*v),
        Some(AttributeValue::F(v)) => IValue::Double(*v),
        Some(AttributeValue::Is(v)) => IValue::IntList(v.clone()),
        Some(AttributeValue::Fs(v)) => IValue::DoubleList(v.clone()),
        Some(AttributeValue::T(t)) => IValue::Tensor(t.clone()),
        Some(AttributeValue::Ts(ts)) => IValue::TensorList(ts.clone()),
        Some(other) => {
            return Err(OpError::Lowering {
                kind: prim::CONSTANT,
                detail: format!("unsupported constant attribute kind {}", other.kind().as_str()),
            });
        }
    };
    Ok(Arc::new(move |stack: &mut Stack| {
        stack.push(value.clone());
        Ok(())
    }))
}

fn lower_any_defined(ctx: &NodeLoweringContext<'_>) -> Result<Operation, OpError> {
    let arity = ctx.graph.node(ctx.node).inputs().len();
    Ok(Arc::new(move |stack: &mut Stack| {
        let operands = pop_operands(stack, prim::ANY_DEFINED, arity)?;
        let any = operands
            .iter()
            .any(|v| matches!(v, IValue::Tensor(t) if t.is_defined()));
        stack.push(IValue::Bool(any));
        Ok(())
    }))
}

fn lower_tuple_construct(ctx: &NodeLoweringContext<'_>) -> Result<Operation, OpError> {
    let arity = ctx.graph.node(ctx.node).inputs().len();
    Ok(Arc::new(move |stack: &mut Stack| {
        let operands = pop_operands(stack, prim::TUPLE_CONSTRUCT, arity)?;
        stack.push(IValue::Tuple(operands));
        Ok(())
    }))
}

#[cfg(test)]
mod tests {
    use crate::registry::{NodeLoweringContext, OperatorRegistry};
    use crate::{OpError, Stack};
    use std::sync::Arc;
    use tj_core::{Graph, IValue, Tensor, Type, aten, attr, prim};

    #[test]
    fn every_builtin_kind_resolves() {
        let registry = OperatorRegistry::with_builtins().expect("builtins");
        for kind in [
            aten::ADD,
            aten::SUB,
            aten::MUL,
            aten::DIV,
            aten::NEG,
            aten::EXP,
            aten::SIGMOID,
            aten::TANH,
            aten::RELU,
            aten::MM,
            aten::T,
            aten::LT,
            aten::GT,
            aten::SIGMOID_BACKWARD,
            aten::TANH_BACKWARD,
            aten::THRESHOLD_BACKWARD,
            aten::GRAD_SUM_TO_SIZE,
            aten::CHUNK,
            prim::AUTOGRAD_ADD,
            prim::UNDEFINED,
            prim::CONSTANT,
            prim::ANY_DEFINED,
        ] {
            assert!(registry.has_operator(kind), "{kind} missing");
        }
    }

    #[test]
    fn tensor_overload_is_chosen_statically() {
        let registry = OperatorRegistry::with_builtins().expect("builtins");
        let tensor = Tensor::scalar(1.0).tensor_type().expect("type");
        let op = registry
            .resolve(aten::SUB, &[Type::Tensor(tensor.clone()), Type::Tensor(tensor)])
            .expect("tensor sub");
        let mut stack: Stack = vec![
            IValue::Tensor(Tensor::scalar(3.0)),
            IValue::Tensor(Tensor::scalar(2.0)),
        ];
        op(&mut stack).expect("runs");
        let out = stack[0].to_tensor().expect("tensor").item().expect("scalar");
        assert_eq!(out, 1.0);
    }

    #[test]
    fn constant_and_any_defined_lowerings() {
        let registry = Arc::new(OperatorRegistry::with_builtins().expect("builtins"));
        let mut g = Graph::new();
        let c = g.insert_constant(&IValue::Bool(true)).expect("constant");
        let node = g.value(c).node();
        let lowering = registry.lowering(prim::CONSTANT).expect("constant lowering");
        let op = lowering(&NodeLoweringContext {
            graph: &g,
            node,
            registry: &registry,
        })
        .expect("lowered");
        let mut stack: Stack = Vec::new();
        op(&mut stack).expect("push");
        assert_eq!(stack, vec![IValue::Bool(true)]);

        let a = g.add_input();
        let b = g.add_input();
        let any = g.insert(prim::ANY_DEFINED, &[a, b], 1).expect("any");
        let lowering = registry.lowering(prim::ANY_DEFINED).expect("lowering");
        let op = lowering(&NodeLoweringContext {
            graph: &g,
            node: any,
            registry: &registry,
        })
        .expect("lowered");
        let mut stack: Stack = vec![
            IValue::Tensor(Tensor::undefined()),
            IValue::Tensor(Tensor::undefined()),
        ];
        op(&mut stack).expect("runs");
        assert_eq!(stack, vec![IValue::Bool(false)]);
        let mut short: Stack = vec![IValue::Tensor(Tensor::undefined())];
        assert!(matches!(op(&mut short), Err(OpError::StackUnderflow { .. })));
    }

    #[test]
    fn chunk_lowering_reads_its_attributes() {
        let registry = Arc::new(OperatorRegistry::with_builtins().expect("builtins"));
        let mut g = Graph::new();
        let x = g.add_input();
        let node = g.insert(aten::CHUNK, &[x], 2).expect("chunk");
        g.attributes_mut(node).i_(attr::CHUNKS, 2).i_(attr::DIM, 1);
        let lowering = registry.lowering(aten::CHUNK).expect("chunk lowering");
        let op = lowering(&NodeLoweringContext {
            graph: &g,
            node,
            registry: &registry,
        })
        .expect("lowered");
        let input = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[1, 4]).expect("input");
        let mut stack: Stack = vec![IValue::Tensor(input)];
        op(&mut stack).expect("runs");
        let halves: Vec<Vec<f64>> = stack
            .iter()
            .map(|v| v.to_tensor().expect("tensor").to_vec().expect("data"))
            .collect();
        assert_eq!(halves, vec![vec![1.0, 2.0], vec![3.0, 4.0]]);

        let odd = Tensor::from_vec(vec![1.0, 2.0, 3.0], &[1, 3]).expect("odd");
        let mut stack: Stack = vec![IValue::Tensor(odd)];
        assert!(op(&mut stack).is_ok());
        let single = Tensor::from_vec(vec![1.0], &[1, 1]).expect("single");
        let mut stack: Stack = vec![IValue::Tensor(single)];
        assert!(matches!(op(&mut stack), Err(OpError::Lowering { .. })));

        g.attributes_mut(node).s_(attr::DIM, "one".to_owned());
        assert!(matches!(
            lowering(&NodeLoweringContext {
                graph: &g,
                node,
                registry: &registry,
            }),
            Err(OpError::Lowering { .. })
        ));
    }

    #[test]
    fn gradient_sum_overloads_take_sizes_or_a_reference() {
        let registry = OperatorRegistry::with_builtins().expect("builtins");
        let grad = || IValue::Tensor(Tensor::full(&[3], 2.0));
        let tensor = Type::Tensor(Tensor::scalar(0.0).tensor_type().expect("type"));
        let by_sizes = registry
            .resolve(
                aten::GRAD_SUM_TO_SIZE,
                &[tensor.clone(), Type::List(Box::new(Type::Int))],
            )
            .expect("int[] overload");
        let mut stack: Stack = vec![grad(), IValue::IntList(vec![1])];
        by_sizes(&mut stack).expect("runs");
        let out = stack[0].to_tensor().expect("tensor");
        assert_eq!((out.sizes(), out.item().expect("item")), (&[1_usize][..], 6.0));

        let dynamic = registry
            .resolve(aten::GRAD_SUM_TO_SIZE, &[Type::Dynamic, Type::Dynamic])
            .expect("runtime dispatch");
        let mut stack: Stack = vec![grad(), IValue::Tensor(Tensor::scalar(5.0))];
        dynamic(&mut stack).expect("runs");
        assert_eq!(stack[0].to_tensor().expect("tensor").sizes(), &[] as &[usize]);
    }
}
