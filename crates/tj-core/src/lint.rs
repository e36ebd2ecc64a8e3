//! Whole-graph structural validation.

use crate::graph::{BlockId, Graph, NodeId, Use, ValueId};
use crate::symbol::{Symbol, prim};
use rustc_hash::FxHashSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LintError {
    /// A use recorded on `value` that `user` does not actually read.
    DanglingUse { value: ValueId, user: Use },
    /// `user` reads `value` through slot `offset` but the use is not recorded.
    MissingUse { value: ValueId, user: NodeId, offset: usize },
    /// A read of a value that is not in scope yet; this is how cycles surface.
    UseBeforeDefinition { value: ValueId, user: NodeId },
    DestroyedReference { value: ValueId, user: NodeId },
    DuplicateDefinition { value: ValueId },
    DuplicateNode { node: NodeId },
    MisplacedNode { node: NodeId },
    BlockArity { node: NodeId, kind: Symbol, detail: String },
}

impl fmt::Display for LintError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DanglingUse { value, user } => write!(
                f,
                "{value} records a use by {} slot {} that does not exist",
                user.user, user.offset
            ),
            Self::MissingUse {
                value,
                user,
                offset,
            } => write!(f, "{user} reads {value} in slot {offset} without a recorded use"),
            Self::UseBeforeDefinition { value, user } => {
                write!(f, "{user} reads {value} before it is defined (or in a cycle)")
            }
            Self::DestroyedReference { value, user } => {
                write!(f, "{user} reads destroyed value {value}")
            }
            Self::DuplicateDefinition { value } => write!(f, "{value} is defined twice"),
            Self::DuplicateNode { node } => write!(f, "{node} appears in more than one place"),
            Self::MisplacedNode { node } => {
                write!(f, "{node} is listed in a block it does not belong to")
            }
            Self::BlockArity { node, kind, detail } => {
                write!(f, "{node} ({kind}) has malformed blocks: {detail}")
            }
        }
    }
}

impl std::error::Error for LintError {}

struct Linter<'g> {
    graph: &'g Graph,
    seen_nodes: FxHashSet<NodeId>,
    defined: FxHashSet<ValueId>,
    scopes: Vec<FxHashSet<ValueId>>,
}

impl Linter<'_> {
    fn in_scope(&self, value: ValueId) -> bool {
        self.scopes.iter().any(|scope| scope.contains(&value))
    }

    fn define(&mut self, node: NodeId) -> Result<(), LintError> {
        let graph = self.graph;
        for (offset, &value) in graph.node(node).outputs().iter().enumerate() {
            let data = graph.value(value);
            if data.node() != node || data.offset() != offset || !self.defined.insert(value) {
                return Err(LintError::DuplicateDefinition { value });
            }
            for u in data.uses() {
                let user = graph.node(u.user);
                if user.is_destroyed() || user.inputs().get(u.offset) != Some(&value) {
                    return Err(LintError::DanglingUse { value, user: *u });
                }
            }
            if let Some(scope) = self.scopes.last_mut() {
                scope.insert(value);
            }
        }
        Ok(())
    }

    fn check_inputs(&self, node: NodeId) -> Result<(), LintError> {
        for (offset, &value) in self.graph.node(node).inputs().iter().enumerate() {
            if self.graph.value(value).is_destroyed() {
                return Err(LintError::DestroyedReference { value, user: node });
            }
            if !self.in_scope(value) {
                return Err(LintError::UseBeforeDefinition { value, user: node });
            }
            let recorded = self
                .graph
                .uses(value)
                .iter()
                .any(|u| u.user == node && u.offset == offset);
            if !recorded {
                return Err(LintError::MissingUse {
                    value,
                    user: node,
                    offset,
                });
            }
        }
        Ok(())
    }

    fn check_placement(&mut self, node: NodeId, block: BlockId) -> Result<(), LintError> {
        if !self.seen_nodes.insert(node) {
            return Err(LintError::DuplicateNode { node });
        }
        let data = self.graph.node(node);
        if data.is_destroyed() || data.owning_block() != Some(block) {
            return Err(LintError::MisplacedNode { node });
        }
        Ok(())
    }

    fn check_block(&mut self, block: BlockId, owner: Option<NodeId>) -> Result<(), LintError> {
        let graph = self.graph;
        let param = graph.block_param(block);
        let ret = graph.block_return(block);
        if graph.block_owner(block) != owner {
            return Err(LintError::MisplacedNode { node: param });
        }
        self.scopes.push(FxHashSet::default());
        self.check_placement(param, block)?;
        self.define(param)?;
        for &node in graph.block_nodes(block) {
            self.check_placement(node, block)?;
            self.check_inputs(node)?;
            for &nested in graph.node(node).blocks() {
                self.check_block(nested, Some(node))?;
            }
            check_arity(graph, node)?;
            self.define(node)?;
        }
        self.check_placement(ret, block)?;
        self.check_inputs(ret)?;
        self.scopes.pop();
        Ok(())
    }
}

fn check_arity(graph: &Graph, node: NodeId) -> Result<(), LintError> {
    let data = graph.node(node);
    let kind = data.kind();
    let fail = |detail: String| Err(LintError::BlockArity { node, kind, detail });
    let blocks = data.blocks();
    if kind == prim::IF {
        if data.inputs().len() != 1 {
            return fail(format!("expected 1 condition input, got {}", data.inputs().len()));
        }
        if blocks.len() != 2 {
            return fail(format!("expected 2 blocks, got {}", blocks.len()));
        }
        for &block in blocks {
            if !graph.block_inputs(block).is_empty() {
                return fail("branch blocks take no inputs".to_owned());
            }
            if graph.block_outputs(block).len() != data.outputs().len() {
                return fail(format!(
                    "branch returns {} values for {} outputs",
                    graph.block_outputs(block).len(),
                    data.outputs().len()
                ));
            }
        }
    } else if kind == prim::LOOP {
        if data.inputs().len() < 2 {
            return fail("expected max trip count and initial condition".to_owned());
        }
        let carried = data.inputs().len() - 2;
        if blocks.len() != 1 {
            return fail(format!("expected 1 body block, got {}", blocks.len()));
        }
        let body = blocks[0];
        if graph.block_inputs(body).len() != carried + 1 {
            return fail(format!(
                "body takes {} inputs, expected {}",
                graph.block_inputs(body).len(),
                carried + 1
            ));
        }
        if graph.block_outputs(body).len() != carried + 1 {
            return fail(format!(
                "body returns {} values, expected {}",
                graph.block_outputs(body).len(),
                carried + 1
            ));
        }
        if data.outputs().len() != carried {
            return fail(format!(
                "loop has {} outputs for {carried} carried values",
                data.outputs().len()
            ));
        }
    } else if kind == prim::GRAD_OF {
        if blocks.len() != 1 {
            return fail(format!("expected 1 block, got {}", blocks.len()));
        }
        if graph.block_outputs(blocks[0]).len() != data.outputs().len() {
            return fail("block outputs do not match node outputs".to_owned());
        }
    }
    Ok(())
}

impl Graph {
    /// Checks def-use consistency, scoping, and control-flow block arity
    /// across the whole graph.
    pub fn lint(&self) -> Result<(), LintError> {
        let mut linter = Linter {
            graph: self,
            seen_nodes: FxHashSet::default(),
            defined: FxHashSet::default(),
            scopes: Vec::new(),
        };
        linter.check_block(self.block(), None)
    }
}
