use tj_core::{BlockId, Graph, NodeId, Symbol, ValueId, aten, prim};

/// Kinds whose outputs never carry gradient, whatever their inputs.
const NON_DIFFERENTIABLE: [Symbol; 6] = [
    aten::LT,
    aten::GT,
    aten::EQ,
    prim::ANY_DEFINED,
    prim::CONSTANT,
    prim::UNDEFINED,
];

/// Marks every tensor value that (transitively) depends on an input whose
/// type requires grad. Loop bodies are iterated until the carried flags are
/// stable.
pub fn propagate_requires_grad(graph: &mut Graph) {
    let top = graph.block();
    propagate_block(graph, top);
}

fn propagate_block(graph: &mut Graph, block: BlockId) {
    let body: Vec<NodeId> = graph.block_nodes(block).to_vec();
    for node in body {
        propagate_node(graph, node);
    }
}

fn any_input_requires_grad(graph: &Graph, node: NodeId) -> bool {
    graph
        .node(node)
        .inputs()
        .iter()
        .any(|&v| graph.ty(v).requires_grad())
}

fn set_flag(graph: &mut Graph, value: ValueId, requires_grad: bool) {
    let ty = graph.ty(value).with_requires_grad(requires_grad);
    graph.set_type(value, ty);
}

fn propagate_node(graph: &mut Graph, node: NodeId) {
    let kind = graph.kind(node);
    let outputs: Vec<ValueId> = graph.node(node).outputs().to_vec();
    if kind == prim::IF {
        let blocks = graph.node(node).blocks().to_vec();
        for &block in &blocks {
            propagate_block(graph, block);
        }
        for (i, &out) in outputs.iter().enumerate() {
            let flag = blocks.iter().any(|&b| {
                graph
                    .block_outputs(b)
                    .get(i)
                    .is_some_and(|&v| graph.ty(v).requires_grad())
            });
            set_flag(graph, out, flag);
        }
    } else if kind == prim::LOOP {
        propagate_loop(graph, node, &outputs);
    } else if kind == prim::GRAD_OF {
        let block = graph.node(node).blocks()[0];
        propagate_block(graph, block);
        let produced: Vec<ValueId> = graph.block_outputs(block).to_vec();
        for (&out, &inner) in outputs.iter().zip(&produced) {
            let flag = graph.ty(inner).requires_grad();
            set_flag(graph, out, flag);
        }
    } else {
        let flag = !NON_DIFFERENTIABLE.contains(&kind) && any_input_requires_grad(graph, node);
        for out in outputs {
            set_flag(graph, out, flag);
        }
    }
}

fn propagate_loop(graph: &mut Graph, node: NodeId, outputs: &[ValueId]) {
    let body = graph.node(node).blocks()[0];
    let carried_inputs: Vec<ValueId> = graph.node(node).inputs().iter().skip(2).copied().collect();
    let mut flags: Vec<bool> = carried_inputs
        .iter()
        .map(|&v| graph.ty(v).requires_grad())
        .collect();
    loop {
        let block_inputs: Vec<ValueId> = graph.block_inputs(body).iter().skip(1).copied().collect();
        for (&value, &flag) in block_inputs.iter().zip(&flags) {
            set_flag(graph, value, flag);
        }
        propagate_block(graph, body);
        let next: Vec<bool> = graph
            .block_outputs(body)
            .iter()
            .skip(1)
            .zip(&flags)
            .map(|(&v, &flag)| flag || graph.ty(v).requires_grad())
            .collect();
        if next == flags {
            break;
        }
        flags = next;
    }
    for (&out, &flag) in outputs.iter().zip(&flags) {
        set_flag(graph, out, flag);
    }
}
