use tj_core::{AttributeValue, Graph, IrError, NodeId, Type, ValueId, attr, prim};

/// Hoists every `prim::Constant` to the front of the top block and merges
/// constants with identical value and type. Returns the number of constants
/// removed by merging.
pub fn constant_pooling(graph: &mut Graph) -> Result<usize, IrError> {
    let top = graph.block();
    let constants: Vec<NodeId> = graph
        .all_nodes(top)
        .into_iter()
        .filter(|&n| graph.kind(n) == prim::CONSTANT)
        .collect();
    if constants.is_empty() {
        return Ok(0);
    }

    let mut pooled: Vec<NodeId> = Vec::new();
    let mut merged = 0;
    for node in constants {
        let value = graph.node(node).outputs()[0];
        if let Some(&existing) = pooled.iter().find(|&&p| same_constant(graph, p, node)) {
            let keep = graph.node(existing).outputs()[0];
            graph.replace_all_uses_with(value, keep);
            graph.destroy_node(node)?;
            merged += 1;
        } else {
            pooled.push(node);
        }
    }

    // Constants have no inputs, so any prefix position is valid for them.
    let first = graph.block_nodes(top)[0];
    for &node in &pooled {
        if graph.node(node).owning_block() != Some(top) && node != first {
            graph.move_before(node, first)?;
        }
    }
    let mut order: Vec<NodeId> = pooled.clone();
    order.extend(
        graph
            .block_nodes(top)
            .iter()
            .copied()
            .filter(|n| !pooled.contains(n)),
    );
    graph.reorder_block(top, order)?;

    if merged > 0 {
        log::debug!("constant pooling merged {merged} duplicate constant(s)");
    }
    Ok(merged)
}

fn output_type(graph: &Graph, node: NodeId) -> &Type {
    let value: ValueId = graph.node(node).outputs()[0];
    graph.ty(value)
}

fn same_constant(graph: &Graph, a: NodeId, b: NodeId) -> bool {
    if output_type(graph, a) != output_type(graph, b) {
        return false;
    }
    let attrs = (
        graph.attributes(a).get(attr::VALUE),
        graph.attributes(b).get(attr::VALUE),
    );
    match attrs {
        (None, None) => true,
        (Some(AttributeValue::I(x)), Some(AttributeValue::I(y))) => x == y,
        (Some(AttributeValue::F(x)), Some(AttributeValue::F(y))) => x.to_bits() == y.to_bits(),
        (Some(AttributeValue::Is(x)), Some(AttributeValue::Is(y))) => x == y,
        (Some(AttributeValue::Fs(x)), Some(AttributeValue::Fs(y))) => {
            x.len() == y.len() && x.iter().zip(y).all(|(p, q)| p.to_bits() == q.to_bits())
        }
        (Some(AttributeValue::T(x)), Some(AttributeValue::T(y))) => x == y,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::constant_pooling;
    use tj_core::{Graph, IValue, SymbolicVariable, prim};

    #[test]
    fn duplicates_merge_and_hoist_out_of_blocks() {
        let mut g = Graph::new();
        let x = SymbolicVariable::as_new_input(&mut g);
        let two = g.insert_constant(&IValue::Double(2.0)).expect("two");
        let y = x.mul(&mut g, two.into()).expect("mul");
        let cond = g.insert_constant(&IValue::Bool(true)).expect("cond");
        let if_node = g.insert(prim::IF, &[cond], 1).expect("if");
        for _ in 0..2 {
            let block = g.add_block(if_node);
            g.set_insert_point_to_end(block);
            let again = g.insert_constant(&IValue::Double(2.0)).expect("again");
            let z = y.mul(&mut g, again.into()).expect("mul");
            g.register_block_output(block, z.value()).expect("block out");
        }
        g.set_insert_point_to_end(g.block());
        g.register_output(g.node(if_node).outputs()[0]).expect("output");
        g.lint().expect("well formed before");

        assert_eq!(constant_pooling(&mut g), Ok(2));
        g.lint().expect("well formed after");
        let top: Vec<_> = g.block_nodes(g.block()).to_vec();
        assert_eq!(g.kind(top[0]), prim::CONSTANT);
        assert_eq!(g.kind(top[1]), prim::CONSTANT);
        let constants = g
            .all_nodes(g.block())
            .into_iter()
            .filter(|&n| g.kind(n) == prim::CONSTANT)
            .count();
        assert_eq!(constants, 2);
    }

    #[test]
    fn int_and_bool_with_same_payload_stay_apart() {
        let mut g = Graph::new();
        let one = g.insert_constant(&IValue::Int(1)).expect("int");
        let yes = g.insert_constant(&IValue::Bool(true)).expect("bool");
        g.register_output(one).expect("out");
        g.register_output(yes).expect("out");
        assert_eq!(constant_pooling(&mut g), Ok(0));
        assert_eq!(g.node_count(), 2);
    }
}
