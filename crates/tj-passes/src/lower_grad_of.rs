use tj_core::{Graph, IrError, NodeId, ValueId, prim};

/// Rewrites every `prim::GradOf` into
/// `prim::If(prim::AnyDefined(grads...))`: the original block becomes the
/// then-branch and a new else-branch yields `prim::Undefined` for each output.
/// Returns the number of nodes rewritten.
pub fn lower_grad_of(graph: &mut Graph) -> Result<usize, IrError> {
    let grad_ofs: Vec<NodeId> = graph
        .all_nodes(graph.block())
        .into_iter()
        .filter(|&n| graph.kind(n) == prim::GRAD_OF)
        .collect();
    for &node in &grad_ofs {
        lower_one(graph, node)?;
    }
    if !grad_ofs.is_empty() {
        log::debug!("lowered {} prim::GradOf node(s)", grad_ofs.len());
    }
    Ok(grad_ofs.len())
}

fn lower_one(graph: &mut Graph, node: NodeId) -> Result<(), IrError> {
    let grads: Vec<ValueId> = graph.node(node).inputs().to_vec();
    let any = graph.create(prim::ANY_DEFINED, &grads, 1);
    graph.insert_before(any, node)?;
    let cond = graph.node(any).outputs()[0];
    graph.set_type(cond, tj_core::Type::Bool);

    graph.remove_all_inputs(node);
    graph.add_node_input(node, cond)?;
    graph.set_kind(node, prim::IF)?;

    let else_block = graph.add_block(node);
    let outputs: Vec<ValueId> = graph.node(node).outputs().to_vec();
    for out in outputs {
        let undefined = graph.create(prim::UNDEFINED, &[], 1);
        let ret = graph.block_return(else_block);
        graph.insert_before(undefined, ret)?;
        let value = graph.node(undefined).outputs()[0];
        graph.set_type(value, graph.ty(out).clone());
        graph.register_block_output(else_block, value)?;
    }
    Ok(())
}
