//! Groups runs of differentiable nodes into `prim::DifferentiableGraph`
//! nodes.
//!
//! Each block is mirrored into a [`DynamicDag`] with one vertex per node and
//! an edge per data dependency. Edges between two differentiable vertices are
//! contracted greedily; the DAG refuses any contraction that would create a
//! cycle, so every surviving group can be executed as one unit. The block is
//! then reordered to the DAG's topological order, which makes each group
//! contiguous, and groups of at least `threshold` nodes are outlined into a
//! subgraph stored in the new node's `Subgraph` attribute.

use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;
use std::sync::Arc;
use tj_core::{AttributeValue, BlockId, Graph, IrError, NodeId, Symbol, ValueId, attr, prim};
use tj_dag::{DagError, DynamicDag, VertexId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubgraphError {
    Ir(IrError),
    Dag(DagError),
}

impl fmt::Display for SubgraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ir(err) => write!(f, "subgraph rewrite failed: {err}"),
            Self::Dag(err) => write!(f, "subgraph grouping failed: {err}"),
        }
    }
}

impl std::error::Error for SubgraphError {}

impl From<IrError> for SubgraphError {
    fn from(err: IrError) -> Self {
        Self::Ir(err)
    }
}

impl From<DagError> for SubgraphError {
    fn from(err: DagError) -> Self {
        Self::Dag(err)
    }
}

/// Outlines groups of at least `threshold` differentiable nodes. A node is a
/// candidate when `is_differentiable(kind)` holds, it owns no blocks and all
/// its outputs are tensors. Returns the created `prim::DifferentiableGraph`
/// nodes.
pub fn create_autodiff_subgraphs(
    graph: &mut Graph,
    threshold: usize,
    is_differentiable: impl Fn(Symbol) -> bool,
) -> Result<Vec<NodeId>, SubgraphError> {
    let mut created = Vec::new();
    let top = graph.block();
    process_block(graph, top, threshold.max(1), &is_differentiable, &mut created)?;
    if !created.is_empty() {
        log::debug!(
            "created {} differentiable subgraph(s) with threshold {threshold}",
            created.len()
        );
    }
    Ok(created)
}

fn is_candidate(graph: &Graph, node: NodeId, is_differentiable: &impl Fn(Symbol) -> bool) -> bool {
    let n = graph.node(node);
    is_differentiable(n.kind())
        && n.blocks().is_empty()
        && !n.outputs().is_empty()
        && n.outputs().iter().all(|&v| graph.ty(v).is_tensor_like())
}

fn process_block(
    graph: &mut Graph,
    block: BlockId,
    threshold: usize,
    is_differentiable: &impl Fn(Symbol) -> bool,
    created: &mut Vec<NodeId>,
) -> Result<(), SubgraphError> {
    let (dag, groupable) = build_dag(graph, block, is_differentiable)?;
    let dag = merge_groups(dag, &groupable)?;

    let order: Vec<NodeId> = dag
        .topological_order()
        .map(|v| dag.data(v).map(<[NodeId]>::to_vec))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .flatten()
        .collect();
    graph.reorder_block(block, order)?;

    for v in dag.topological_order() {
        let group = dag.data(v)?;
        if group.len() >= threshold && groupable.contains(&group[0]) {
            created.push(outline(graph, group)?);
        }
    }

    let remaining: Vec<NodeId> = graph.block_nodes(block).to_vec();
    for node in remaining {
        let nested: Vec<BlockId> = graph.node(node).blocks().to_vec();
        for inner in nested {
            process_block(graph, inner, threshold, is_differentiable, created)?;
        }
    }
    Ok(())
}

/// One vertex per body node, in block order, with an edge for every value a
/// node (or anything nested in it) reads from an earlier node of the block.
fn build_dag(
    graph: &Graph,
    block: BlockId,
    is_differentiable: &impl Fn(Symbol) -> bool,
) -> Result<(DynamicDag<NodeId>, FxHashSet<NodeId>), SubgraphError> {
    let mut dag = DynamicDag::new();
    let mut vertex_of: FxHashMap<NodeId, VertexId> = FxHashMap::default();
    let mut groupable = FxHashSet::default();
    for &node in graph.block_nodes(block) {
        vertex_of.insert(node, dag.new_vertex(node));
        if is_candidate(graph, node, is_differentiable) {
            groupable.insert(node);
        }
    }
    for &node in graph.block_nodes(block) {
        let consumer = vertex_of[&node];
        let mut readers = vec![node];
        for &inner in graph.node(node).blocks() {
            readers.extend(graph.all_nodes(inner));
            readers.push(graph.block_return(inner));
        }
        for reader in readers {
            for &input in graph.node(reader).inputs() {
                let producer = graph.value(input).node();
                if let Some(&from) = vertex_of.get(&producer)
                    && from != consumer
                {
                    dag.add_edge(from, consumer)?;
                }
            }
        }
    }
    Ok((dag, groupable))
}

fn merge_groups(
    mut dag: DynamicDag<NodeId>,
    groupable: &FxHashSet<NodeId>,
) -> Result<DynamicDag<NodeId>, SubgraphError> {
    let mergeable = |dag: &DynamicDag<NodeId>, v: VertexId| -> Result<bool, DagError> {
        Ok(dag.data(v)?.first().is_some_and(|n| groupable.contains(n)))
    };
    let mut contractions = 0usize;
    loop {
        let mut changed = false;
        'scan: for ord in 0..dag.max_ord() {
            let Some(v) = dag.at(ord) else { continue };
            if !mergeable(&dag, v)? {
                continue;
            }
            for w in dag.out_edges_by_ord(v)? {
                if mergeable(&dag, w)? && dag.contract_edge(v, w)? {
                    contractions += 1;
                    changed = true;
                    break 'scan;
                }
            }
        }
        if !changed {
            break;
        }
    }
    log::trace!("autodiff grouping performed {contractions} contraction(s)");
    Ok(dag)
}

/// Replaces the contiguous run `group` with one `prim::DifferentiableGraph`.
fn outline(graph: &mut Graph, group: &[NodeId]) -> Result<NodeId, IrError> {
    let members: FxHashSet<NodeId> = group.iter().copied().collect();
    let mut sub = Graph::new();
    let mut env: FxHashMap<ValueId, ValueId> = FxHashMap::default();

    let mut captured = Vec::new();
    for &node in group {
        for &input in graph.node(node).inputs() {
            if members.contains(&graph.value(input).node()) || env.contains_key(&input) {
                continue;
            }
            let mapped = sub.add_input();
            sub.set_type(mapped, graph.ty(input).clone());
            if let Some(name) = graph.value(input).debug_name() {
                sub.set_debug_name(mapped, name);
            }
            env.insert(input, mapped);
            captured.push(input);
        }
    }
    for &node in group {
        let cloned = sub.create_clone(graph, node, &mut env)?;
        sub.append_node(cloned)?;
    }

    let mut escaping = Vec::new();
    for &node in group {
        for &output in graph.node(node).outputs() {
            if graph.uses(output).iter().any(|u| !members.contains(&u.user)) {
                let mapped = env
                    .get(&output)
                    .copied()
                    .ok_or(IrError::UnmappedValue { value: output })?;
                sub.register_output(mapped)?;
                escaping.push(output);
            }
        }
    }

    let outlined = graph.create(prim::DIFFERENTIABLE_GRAPH, &captured, escaping.len());
    graph.set_attribute(outlined, attr::SUBGRAPH, AttributeValue::G(Arc::new(sub)));
    graph.insert_before(outlined, group[0])?;
    let replacements: Vec<ValueId> = graph.node(outlined).outputs().to_vec();
    for (&old, &new) in escaping.iter().zip(&replacements) {
        graph.set_type(new, graph.ty(old).clone());
        graph.replace_all_uses_with(old, new);
    }
    for &node in group.iter().rev() {
        graph.destroy_node(node)?;
    }
    Ok(outlined)
}
