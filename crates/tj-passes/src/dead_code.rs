use tj_core::{BlockId, Graph, IrError, NodeId};

/// Removes every node whose outputs are unused, innermost blocks first.
/// Returns the number of nodes removed.
pub fn eliminate_dead_code(graph: &mut Graph) -> Result<usize, IrError> {
    let top = graph.block();
    let removed = eliminate_dead_code_in_block(graph, top)?;
    if removed > 0 {
        log::debug!("dead code elimination removed {removed} node(s)");
    }
    Ok(removed)
}

/// Dead code elimination restricted to `block` and the blocks nested in it.
/// Block outputs count as uses, so values returned by `block` survive.
pub fn eliminate_dead_code_in_block(graph: &mut Graph, block: BlockId) -> Result<usize, IrError> {
    let mut removed = 0;
    let body: Vec<NodeId> = graph.block_nodes(block).to_vec();
    for node in body.into_iter().rev() {
        if is_dead(graph, node) {
            graph.destroy_node(node)?;
            removed += 1;
            continue;
        }
        let nested: Vec<BlockId> = graph.node(node).blocks().to_vec();
        for inner in nested {
            removed += eliminate_dead_code_in_block(graph, inner)?;
        }
    }
    Ok(removed)
}

// Every kind we lower is pure, so a node without live outputs is dead. Nodes
// without outputs at all are kept: they exist only for their effect.
fn is_dead(graph: &Graph, node: NodeId) -> bool {
    let outputs = graph.node(node).outputs();
    !outputs.is_empty() && outputs.iter().all(|&v| !graph.has_uses(v))
}

#[cfg(test)]
mod tests {
    use super::eliminate_dead_code;
    use tj_core::{Graph, IValue, SymbolicVariable, aten, prim};

    #[test]
    fn unused_chains_are_removed() {
        let mut g = Graph::new();
        let a = SymbolicVariable::as_new_input(&mut g);
        let b = SymbolicVariable::as_new_input(&mut g);
        let live = a.mul(&mut g, b).expect("mul");
        let dead = a.exp(&mut g).expect("exp");
        dead.neg(&mut g).expect("neg");
        g.register_output(live.value()).expect("output");

        assert_eq!(eliminate_dead_code(&mut g), Ok(2));
        assert_eq!(g.node_count(), 1);
        g.lint().expect("well formed");
        assert_eq!(eliminate_dead_code(&mut g), Ok(0));
    }

    #[test]
    fn dead_values_inside_blocks_are_removed_but_block_outputs_kept() {
        let mut g = Graph::new();
        let a = g.add_input();
        let cond = g.insert_constant(&IValue::Bool(true)).expect("constant");
        let if_node = g.insert(prim::IF, &[cond], 1).expect("if");
        for _ in 0..2 {
            let block = g.add_block(if_node);
            let ret = g.block_return(block);
            let kept = g.create(aten::NEG, &[a], 1);
            g.insert_before(kept, ret).expect("kept");
            let unused = g.create(aten::EXP, &[a], 1);
            g.insert_before(unused, ret).expect("unused");
            let out = g.node(kept).outputs()[0];
            g.register_block_output(block, out).expect("block output");
        }
        let result = g.node(if_node).outputs()[0];
        g.register_output(result).expect("output");

        assert_eq!(eliminate_dead_code(&mut g), Ok(2));
        for &block in g.node(if_node).blocks() {
            assert_eq!(g.block_nodes(block).len(), 1);
        }
        g.lint().expect("well formed");
    }

    #[test]
    fn whole_control_flow_nodes_go_when_unused() {
        let mut g = Graph::new();
        let a = g.add_input();
        let cond = g.insert_constant(&IValue::Bool(true)).expect("constant");
        let if_node = g.insert(prim::IF, &[cond], 1).expect("if");
        for _ in 0..2 {
            let block = g.add_block(if_node);
            g.register_block_output(block, a).expect("block output");
        }
        g.register_output(a).expect("output");
        assert_eq!(eliminate_dead_code(&mut g), Ok(2));
        assert_eq!(g.node_count(), 0);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::eliminate_dead_code;
    use proptest::prelude::*;
    use proptest::test_runner::{Config as ProptestConfig, TestRunner};
    use tj_core::{Graph, SymbolicVariable};

    #[test]
    fn prop_dce_keeps_exactly_the_live_nodes() {
        tj_test_utils::init_test_logging();
        let mut runner = TestRunner::new(ProptestConfig::with_cases(
            tj_test_utils::property_test_case_count(),
        ));
        let strategy = (
            proptest::collection::vec((any::<usize>(), any::<usize>()), 1..24),
            proptest::collection::vec(any::<usize>(), 0..4),
        );
        runner
            .run(&strategy, |(ops, outputs)| {
                let mut g = Graph::new();
                let mut values = vec![
                    SymbolicVariable::as_new_input(&mut g),
                    SymbolicVariable::as_new_input(&mut g),
                ];
                for (lhs, rhs) in ops {
                    let a = values[lhs % values.len()];
                    let b = values[rhs % values.len()];
                    let next = a.mul(&mut g, b).map_err(|e| TestCaseError::fail(e.to_string()))?;
                    values.push(next);
                }
                for pick in outputs {
                    let v = values[pick % values.len()];
                    g.register_output(v.value())
                        .map_err(|e| TestCaseError::fail(e.to_string()))?;
                }
                eliminate_dead_code(&mut g).map_err(|e| TestCaseError::fail(e.to_string()))?;
                prop_assert!(g.lint().is_ok());
                for node in g.all_nodes(g.block()) {
                    let live = g.node(node).outputs().iter().all(|&v| g.has_uses(v));
                    prop_assert!(live, "node {node} survived without uses");
                }
                prop_assert_eq!(eliminate_dead_code(&mut g), Ok(0));
                Ok(())
            })
            .expect("dead code elimination should leave only live nodes");
    }
}
