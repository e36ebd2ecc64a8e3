#![forbid(unsafe_code)]

//! If/Loop scenarios run through both the bare interpreter and the executor.

use std::sync::Arc;
use tj_conformance::{branch_graph, loop_graph};
use tj_core::{Graph, IValue};
use tj_executor::{ExecutorOptions, GraphExecutor};
use tj_interpreters::{Code, InterpreterState};
use tj_ops::OperatorRegistry;
use tj_test_utils::{TestMode, run_logged_test, test_id};

fn interpret(graph: &Graph, inputs: &[i64]) -> Result<Vec<IValue>, String> {
    let registry = Arc::new(OperatorRegistry::with_builtins().map_err(|e| e.to_string())?);
    let code = Code::new(graph, &registry).map_err(|e| e.to_string())?;
    let mut state = InterpreterState::new(Arc::new(code));
    let mut stack: Vec<IValue> = inputs.iter().copied().map(IValue::Int).collect();
    state.run(&mut stack).map_err(|e| e.to_string())?;
    Ok(stack)
}

fn execute(executor: &GraphExecutor, inputs: &[i64]) -> Result<Vec<IValue>, String> {
    let inputs: Vec<IValue> = inputs.iter().copied().map(IValue::Int).collect();
    executor.run(&inputs).map_err(|e| e.to_string())
}

const BRANCH_CASES: [([i64; 2], i64); 3] = [([1, 2], 3), ([3, 2], 1), ([2, 2], 0)];

#[test]
fn branch_takes_sum_or_difference() {
    run_logged_test(
        "control_flow",
        &test_id(module_path!(), "branch_takes_sum_or_difference"),
        &("if", BRANCH_CASES),
        TestMode::Strict,
        || {
            let graph = branch_graph().map_err(|e| e.to_string())?;
            for (inputs, expected) in BRANCH_CASES {
                let out = interpret(&graph, &inputs)?;
                if out != vec![IValue::Int(expected)] {
                    return Err(format!("{inputs:?}: expected {expected}, got {out:?}"));
                }
            }
            Ok(vec![])
        },
    );
}

#[test]
fn branch_matches_between_interpreter_and_executor() {
    run_logged_test(
        "control_flow",
        &test_id(module_path!(), "branch_matches_between_interpreter_and_executor"),
        &("if-executor", BRANCH_CASES),
        TestMode::Strict,
        || {
            let graph = branch_graph().map_err(|e| e.to_string())?;
            let copy = graph.copy().map_err(|e| e.to_string())?;
            let executor =
                GraphExecutor::new(copy, ExecutorOptions::default()).map_err(|e| e.to_string())?;
            for (inputs, _) in BRANCH_CASES {
                let direct = interpret(&graph, &inputs)?;
                let planned = execute(&executor, &inputs)?;
                if direct != planned {
                    return Err(format!("{inputs:?}: {direct:?} != {planned:?}"));
                }
            }
            // Every int input pair shares one specialization.
            let compilations = executor.pipeline_stats().compilations;
            if compilations != 1 {
                return Err(format!("expected one compilation, saw {compilations}"));
            }
            Ok(vec![])
        },
    );
}

#[test]
fn loop_squares_until_the_counter_reaches_three() {
    let cases: [([i64; 2], i64); 3] = [([2, 0], 256), ([2, 5], 2), ([3, 1], 81)];
    run_logged_test(
        "control_flow",
        &test_id(module_path!(), "loop_squares_until_the_counter_reaches_three"),
        &("loop", cases),
        TestMode::Strict,
        || {
            let graph = loop_graph().map_err(|e| e.to_string())?;
            let copy = graph.copy().map_err(|e| e.to_string())?;
            let executor =
                GraphExecutor::new(copy, ExecutorOptions::default()).map_err(|e| e.to_string())?;
            for (inputs, expected) in cases {
                let direct = interpret(&graph, &inputs)?;
                let planned = execute(&executor, &inputs)?;
                if direct != vec![IValue::Int(expected)] || planned != direct {
                    return Err(format!(
                        "{inputs:?}: expected {expected}, \
                         interpreter {direct:?}, executor {planned:?}"
                    ));
                }
            }
            Ok(vec![])
        },
    );
}

#[test]
fn interpreter_state_is_reusable_across_runs() {
    run_logged_test(
        "control_flow",
        &test_id(module_path!(), "interpreter_state_is_reusable_across_runs"),
        &("loop-reuse", [2, 3]),
        TestMode::Hardened,
        || {
            let graph = loop_graph().map_err(|e| e.to_string())?;
            let registry = Arc::new(OperatorRegistry::with_builtins().map_err(|e| e.to_string())?);
            let code = Arc::new(Code::new(&graph, &registry).map_err(|e| e.to_string())?);
            let mut state = InterpreterState::new(Arc::clone(&code));
            for (a, expected) in [(2, 256), (3, 6561), (2, 256)] {
                let mut stack = vec![IValue::Int(a), IValue::Int(0)];
                state.run(&mut stack).map_err(|e| e.to_string())?;
                if stack != vec![IValue::Int(expected)] {
                    return Err(format!("a={a}: expected {expected}, got {stack:?}"));
                }
            }
            Ok(vec![code.to_string()])
        },
    );
}
