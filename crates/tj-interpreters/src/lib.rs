#![forbid(unsafe_code)]

//! Flattening of graphs into register-machine [`Code`] and the
//! [`InterpreterState`] that runs it.

mod code;
mod state;

pub use code::{Code, Instruction, Register};
pub use state::InterpreterState;

use tj_core::{IValueError, Symbol};
use tj_ops::OpError;

#[derive(Debug, Clone, PartialEq)]
pub enum InterpreterError {
    InputArity {
        expected: usize,
        actual: usize,
    },
    /// A node with blocks other than `prim::If`/`prim::Loop`.
    UnsupportedBlockNode {
        kind: Symbol,
    },
    MalformedControlFlow {
        kind: Symbol,
        detail: String,
    },
    UnexpectedOutputArity {
        kind: Symbol,
        expected: usize,
        actual: usize,
    },
    StackUnderflow {
        needed: usize,
        available: usize,
    },
    Condition(IValueError),
    /// A previous run of this state failed.
    Poisoned,
    Operator(OpError),
}

impl std::fmt::Display for InterpreterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InputArity { expected, actual } => {
                write!(f, "input arity mismatch: expected {expected}, got {actual}")
            }
            Self::UnsupportedBlockNode { kind } => {
                write!(f, "cannot flatten blocks of {kind}; lower it first")
            }
            Self::MalformedControlFlow { kind, detail } => {
                write!(f, "malformed {kind}: {detail}")
            }
            Self::UnexpectedOutputArity {
                kind,
                expected,
                actual,
            } => write!(
                f,
                "{kind} produced {actual} output(s), expected {expected}"
            ),
            Self::StackUnderflow { needed, available } => write!(
                f,
                "stack underflow: needed {needed} value(s), {available} available"
            ),
            Self::Condition(err) => write!(f, "branch condition is not boolean: {err}"),
            Self::Poisoned => write!(f, "interpreter state poisoned by an earlier failure"),
            Self::Operator(err) => write!(f, "operator failed: {err}"),
        }
    }
}

impl std::error::Error for InterpreterError {}

impl From<OpError> for InterpreterError {
    fn from(value: OpError) -> Self {
        Self::Operator(value)
    }
}

impl From<IValueError> for InterpreterError {
    fn from(value: IValueError) -> Self {
        Self::Condition(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{Code, InterpreterError, InterpreterState};
    use std::sync::Arc;
    use tj_core::{Graph, IValue, Symbol, SymbolicVariable, Tensor, Type, prim};
    use tj_ops::{OpError, OperatorRegistry, Stack, create_operator};

    pub(crate) fn registry() -> Arc<OperatorRegistry> {
        Arc::new(OperatorRegistry::with_builtins().expect("builtins register"))
    }

    fn run(
        graph: &Graph,
        registry: &Arc<OperatorRegistry>,
        inputs: Vec<IValue>,
    ) -> Result<Stack, InterpreterError> {
        let code = Arc::new(Code::new(graph, registry)?);
        let mut state = InterpreterState::new(code);
        let mut stack = inputs;
        state.run(&mut stack)?;
        Ok(stack)
    }

    fn int_inputs(g: &mut Graph, n: usize) -> Vec<SymbolicVariable> {
        (0..n)
            .map(|_| {
                let v = SymbolicVariable::as_new_input(g);
                g.set_type(v.value(), Type::Int);
                v
            })
            .collect()
    }

    /// `if a < b { a + b } else { a - b }`
    pub(crate) fn branch_graph() -> Graph {
        let mut g = Graph::new();
        let ab = int_inputs(&mut g, 2);
        let (a, b) = (ab[0], ab[1]);
        let cond = a.lt(&mut g, b).expect("lt");
        g.set_type(cond.value(), Type::Bool);
        let node = g.insert(prim::IF, &[cond.value()], 1).expect("if");
        let out = g.node(node).outputs()[0];
        g.set_type(out, Type::Int);
        for build in [SymbolicVariable::add, SymbolicVariable::sub] {
            let block = g.add_block(node);
            let ret = g.block_return(block);
            let r = g
                .with_insert_point(ret, |g| build(a, g, b))
                .expect("branch");
            g.set_type(r.value(), Type::Int);
            g.register_block_output(block, r.value()).expect("block output");
        }
        g.register_output(out).expect("output");
        g.lint().expect("well formed");
        g
    }

    /// `while i < 3 { a = a * a; i = i + 1 }`, returns `a`.
    fn loop_graph() -> Graph {
        let mut g = Graph::new();
        let ai = int_inputs(&mut g, 2);
        let (a, i) = (ai[0], ai[1]);
        let max = g.insert_constant(&IValue::Int(i64::MAX)).expect("max");
        let three = g.insert_constant(&IValue::Int(3)).expect("three");
        let one = g.insert_constant(&IValue::Int(1)).expect("one");
        let start = i.lt(&mut g, three.into()).expect("lt");
        g.set_type(start.value(), Type::Bool);
        let node = g
            .insert(prim::LOOP, &[max, start.value(), a.value(), i.value()], 2)
            .expect("loop");
        for &out in g.node(node).outputs().to_vec().iter() {
            g.set_type(out, Type::Int);
        }
        let body = g.add_block(node);
        let params: Vec<_> = (0..3).map(|_| g.add_block_input(body)).collect();
        for &p in &params {
            g.set_type(p, Type::Int);
        }
        let (a_in, i_in) = (SymbolicVariable::from(params[1]), SymbolicVariable::from(params[2]));
        let ret = g.block_return(body);
        let (cond, a_next, i_next) = g
            .with_insert_point(ret, |g| {
                let a_next = a_in.mul(g, a_in)?;
                let i_next = i_in.add(g, one.into())?;
                let cond = i_next.lt(g, three.into())?;
                Ok::<_, tj_core::IrError>((cond, a_next, i_next))
            })
            .expect("body");
        g.set_type(cond.value(), Type::Bool);
        g.set_type(a_next.value(), Type::Int);
        g.set_type(i_next.value(), Type::Int);
        for v in [cond, a_next, i_next] {
            g.register_block_output(body, v.value()).expect("body output");
        }
        let result = g.node(node).outputs()[0];
        g.register_output(result).expect("output");
        g.lint().expect("well formed");
        g
    }

    #[test]
    fn branches_select_by_condition() {
        tj_test_utils::init_test_logging();
        let g = branch_graph();
        let registry = registry();
        assert_eq!(
            run(&g, &registry, vec![IValue::Int(1), IValue::Int(2)]),
            Ok(vec![IValue::Int(3)])
        );
        assert_eq!(
            run(&g, &registry, vec![IValue::Int(3), IValue::Int(2)]),
            Ok(vec![IValue::Int(1)])
        );
    }

    #[test]
    fn loop_repeats_until_condition_fails() {
        tj_test_utils::init_test_logging();
        let g = loop_graph();
        let registry = registry();
        assert_eq!(
            run(&g, &registry, vec![IValue::Int(2), IValue::Int(0)]),
            Ok(vec![IValue::Int(256)])
        );
        assert_eq!(
            run(&g, &registry, vec![IValue::Int(2), IValue::Int(5)]),
            Ok(vec![IValue::Int(2)])
        );
    }

    #[test]
    fn state_can_be_reused_for_successive_runs() {
        let g = loop_graph();
        let code = Arc::new(Code::new(&g, &registry()).expect("code"));
        let mut state = InterpreterState::new(code);
        for (a, expected) in [(2, 256), (3, 6561)] {
            let mut stack = vec![IValue::Int(a), IValue::Int(0)];
            state.run(&mut stack).expect("run");
            assert_eq!(stack, vec![IValue::Int(expected)]);
        }
    }

    #[test]
    fn tensor_arithmetic_matches_reference() {
        let mut g = Graph::new();
        let a = SymbolicVariable::as_new_input(&mut g);
        let b = SymbolicVariable::as_new_input(&mut g);
        let c = a
            .mul(&mut g, b)
            .and_then(|ab| ab.mul(&mut g, a))
            .and_then(|aba| aba.add(&mut g, b))
            .expect("build");
        g.register_output(c.value()).expect("output");
        let a_t = Tensor::from_vec(vec![1.0, 2.0, 3.0], &[3]).expect("a");
        let b_t = Tensor::from_vec(vec![0.5, -1.0, 2.0], &[3]).expect("b");
        let stack = run(&g, &registry(), vec![a_t.into(), b_t.into()]).expect("run");
        let out = stack[0].to_tensor().expect("tensor").to_vec().expect("data");
        tj_test_utils::assert_close(&out, &[1.0, -5.0, 20.0], 1e-12).expect("values");
    }

    #[test]
    fn wrong_input_count_is_reported() {
        let g = branch_graph();
        assert_eq!(
            run(&g, &registry(), vec![IValue::Int(1)]),
            Err(InterpreterError::InputArity {
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn unknown_operator_fails_at_code_build() {
        let mut g = Graph::new();
        let a = g.add_input();
        let node = g.insert(Symbol::aten("nonexistent"), &[a], 1).expect("insert");
        let out = g.node(node).outputs()[0];
        g.register_output(out).expect("output");
        let err = Code::new(&g, &registry()).expect_err("unresolvable");
        assert!(matches!(err, InterpreterError::Operator(OpError::NoOperator { .. })));
    }

    #[test]
    fn failing_operator_poisons_state() {
        let registry = registry();
        registry
            .register(
                create_operator("aten::fails(int x) -> int", |x: i64| -> Result<i64, OpError> {
                    if x < 0 {
                        Err(OpError::Lowering {
                            kind: Symbol::aten("fails"),
                            detail: "negative".to_owned(),
                        })
                    } else {
                        Ok(x)
                    }
                })
                .expect("operator"),
            )
            .expect("register");
        let mut g = Graph::new();
        let x = g.add_input();
        g.set_type(x, Type::Int);
        let node = g.insert(Symbol::aten("fails"), &[x], 1).expect("insert");
        let out = g.node(node).outputs()[0];
        g.register_output(out).expect("output");

        let code = Arc::new(Code::new(&g, &registry).expect("code"));
        let mut state = InterpreterState::new(code);
        let mut stack = vec![IValue::Int(-1)];
        assert!(matches!(
            state.run(&mut stack),
            Err(InterpreterError::Operator(OpError::Lowering { .. }))
        ));
        let mut stack = vec![IValue::Int(1)];
        assert_eq!(state.run(&mut stack), Err(InterpreterError::Poisoned));
    }
}

#[cfg(test)]
mod prop_tests {
    use super::tests::{branch_graph, registry};
    use super::{Code, InterpreterState};
    use proptest::prelude::*;
    use std::sync::Arc;
    use tj_core::IValue;

    proptest! {
        #[test]
        fn prop_branch_matches_native(a in -1000i64..1000, b in -1000i64..1000) {
            let code = Arc::new(Code::new(&branch_graph(), &registry()).expect("code"));
            let mut state = InterpreterState::new(code);
            let mut stack = vec![IValue::Int(a), IValue::Int(b)];
            state.run(&mut stack).expect("run");
            let expected = if a < b { a + b } else { a - b };
            prop_assert_eq!(stack, vec![IValue::Int(expected)]);
        }
    }
}
