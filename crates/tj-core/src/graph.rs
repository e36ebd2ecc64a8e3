//! Arena-backed dataflow graph with block-scoped control flow.
//!
//! Every block owns a `prim::Param` node whose outputs are the block
//! inputs and a `prim::Return` node whose inputs are the block outputs, so
//! def-use edges look the same whether a value crosses a block boundary or
//! not. Nodes, values and blocks are never freed from the arenas; destroyed
//! entries are only marked dead, which keeps handles stable.

use crate::attributes::{AttributeError, AttributeValue, Attributes};
use crate::ivalue::{IValue, IValueKind};
use crate::symbol::{Symbol, attr, prim};
use crate::types::Type;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;

macro_rules! arena_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            #[must_use]
            pub const fn index(self) -> usize {
                self.0 as usize
            }

            fn from_len(len: usize) -> Self {
                Self(u32::try_from(len).unwrap_or(u32::MAX))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

arena_id!(NodeId, "n");
arena_id!(ValueId, "%");
arena_id!(BlockId, "b");

/// One input slot of `user` that reads a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Use {
    pub user: NodeId,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrError {
    ValueStillUsed { value: ValueId, uses: usize },
    UseBeforeDefinition { value: ValueId, user: NodeId },
    AlreadyInserted { node: NodeId },
    NotInserted { node: NodeId },
    ProtectedNode { node: NodeId, kind: Symbol },
    IndexOutOfRange { what: &'static str, index: usize, len: usize },
    EscapingBlockValue { block: BlockId, value: ValueId, user: NodeId },
    UnmappedValue { value: ValueId },
    InvalidReorder { block: BlockId },
    UnsupportedConstant { kind: IValueKind },
    Attribute(AttributeError),
}

impl fmt::Display for IrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValueStillUsed { value, uses } => {
                write!(f, "value {value} still has {uses} use(s)")
            }
            Self::UseBeforeDefinition { value, user } => {
                write!(f, "node {user} uses {value} before its definition")
            }
            Self::AlreadyInserted { node } => write!(f, "node {node} is already in a block"),
            Self::NotInserted { node } => write!(f, "node {node} is not in a block"),
            Self::ProtectedNode { node, kind } => {
                write!(f, "node {node} ({kind}) is a block boundary and cannot be edited")
            }
            Self::IndexOutOfRange { what, index, len } => {
                write!(f, "{what} index {index} out of range (len {len})")
            }
            Self::EscapingBlockValue { block, value, user } => write!(
                f,
                "block {block} defines {value} which is still used by {user} outside it"
            ),
            Self::UnmappedValue { value } => write!(f, "no mapping for value {value}"),
            Self::InvalidReorder { block } => {
                write!(f, "proposed order for block {block} is not a valid permutation")
            }
            Self::UnsupportedConstant { kind } => {
                write!(f, "cannot embed a {kind:?} as a constant")
            }
            Self::Attribute(err) => write!(f, "attribute error: {err}"),
        }
    }
}

impl std::error::Error for IrError {}

impl From<AttributeError> for IrError {
    fn from(err: AttributeError) -> Self {
        Self::Attribute(err)
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    kind: Symbol,
    inputs: SmallVec<[ValueId; 4]>,
    outputs: SmallVec<[ValueId; 2]>,
    blocks: SmallVec<[BlockId; 2]>,
    attributes: Attributes,
    owning_block: Option<BlockId>,
    destroyed: bool,
}

impl Node {
    #[must_use]
    pub fn kind(&self) -> Symbol {
        self.kind
    }

    #[must_use]
    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    #[must_use]
    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    #[must_use]
    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    #[must_use]
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    #[must_use]
    pub fn owning_block(&self) -> Option<BlockId> {
        self.owning_block
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

#[derive(Debug, Clone)]
pub struct Value {
    node: NodeId,
    offset: usize,
    ty: Type,
    uses: Vec<Use>,
    debug_name: Option<String>,
    destroyed: bool,
}

impl Value {
    #[must_use]
    pub fn node(&self) -> NodeId {
        self.node
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn ty(&self) -> &Type {
        &self.ty
    }

    #[must_use]
    pub fn uses(&self) -> &[Use] {
        &self.uses
    }

    #[must_use]
    pub fn debug_name(&self) -> Option<&str> {
        self.debug_name.as_deref()
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Block {
    pub(crate) param: NodeId,
    pub(crate) ret: NodeId,
    pub(crate) nodes: Vec<NodeId>,
    pub(crate) owning_node: Option<NodeId>,
    pub(crate) destroyed: bool,
}

#[derive(Debug, Clone)]
pub struct Graph {
    pub(crate) nodes: Vec<Node>,
    pub(crate) values: Vec<Value>,
    pub(crate) blocks: Vec<Block>,
    top: BlockId,
    insert_point: NodeId,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    #[must_use]
    pub fn new() -> Self {
        let mut graph = Self {
            nodes: Vec::new(),
            values: Vec::new(),
            blocks: Vec::new(),
            top: BlockId(0),
            insert_point: NodeId(0),
        };
        graph.top = graph.new_block(None);
        graph.insert_point = graph.blocks[graph.top.index()].ret;
        graph
    }

    fn new_node(&mut self, kind: Symbol, owning_block: Option<BlockId>) -> NodeId {
        let id = NodeId::from_len(self.nodes.len());
        self.nodes.push(Node {
            kind,
            inputs: SmallVec::new(),
            outputs: SmallVec::new(),
            blocks: SmallVec::new(),
            attributes: Attributes::new(),
            owning_block,
            destroyed: false,
        });
        id
    }

    fn new_output(&mut self, node: NodeId) -> ValueId {
        let id = ValueId::from_len(self.values.len());
        let offset = self.nodes[node.index()].outputs.len();
        self.values.push(Value {
            node,
            offset,
            ty: Type::Dynamic,
            uses: Vec::new(),
            debug_name: None,
            destroyed: false,
        });
        self.nodes[node.index()].outputs.push(id);
        id
    }

    fn new_block(&mut self, owning_node: Option<NodeId>) -> BlockId {
        let id = BlockId::from_len(self.blocks.len());
        self.blocks.push(Block {
            param: NodeId(0),
            ret: NodeId(0),
            nodes: Vec::new(),
            owning_node,
            destroyed: false,
        });
        let param = self.new_node(prim::PARAM, Some(id));
        let ret = self.new_node(prim::RETURN, Some(id));
        let block = &mut self.blocks[id.index()];
        block.param = param;
        block.ret = ret;
        id
    }

    // ── Accessors ──────────────────────────────────────────────────────

    /// The top-level block.
    #[must_use]
    pub fn block(&self) -> BlockId {
        self.top
    }

    #[must_use]
    pub fn node(&self, node: NodeId) -> &Node {
        &self.nodes[node.index()]
    }

    #[must_use]
    pub fn value(&self, value: ValueId) -> &Value {
        &self.values[value.index()]
    }

    #[must_use]
    pub fn kind(&self, node: NodeId) -> Symbol {
        self.nodes[node.index()].kind
    }

    #[must_use]
    pub fn inputs(&self) -> &[ValueId] {
        self.block_inputs(self.top)
    }

    #[must_use]
    pub fn outputs(&self) -> &[ValueId] {
        self.block_outputs(self.top)
    }

    #[must_use]
    pub fn param_node(&self) -> NodeId {
        self.block_param(self.top)
    }

    #[must_use]
    pub fn return_node(&self) -> NodeId {
        self.block_return(self.top)
    }

    #[must_use]
    pub fn block_nodes(&self, block: BlockId) -> &[NodeId] {
        &self.blocks[block.index()].nodes
    }

    #[must_use]
    pub fn block_param(&self, block: BlockId) -> NodeId {
        self.blocks[block.index()].param
    }

    #[must_use]
    pub fn block_return(&self, block: BlockId) -> NodeId {
        self.blocks[block.index()].ret
    }

    #[must_use]
    pub fn block_owner(&self, block: BlockId) -> Option<NodeId> {
        self.blocks[block.index()].owning_node
    }

    #[must_use]
    pub fn block_inputs(&self, block: BlockId) -> &[ValueId] {
        &self.nodes[self.block_param(block).index()].outputs
    }

    #[must_use]
    pub fn block_outputs(&self, block: BlockId) -> &[ValueId] {
        &self.nodes[self.block_return(block).index()].inputs
    }

    #[must_use]
    pub fn ty(&self, value: ValueId) -> &Type {
        &self.values[value.index()].ty
    }

    pub fn set_type(&mut self, value: ValueId, ty: Type) {
        self.values[value.index()].ty = ty;
    }

    pub fn set_debug_name(&mut self, value: ValueId, name: impl Into<String>) {
        self.values[value.index()].debug_name = Some(name.into());
    }

    #[must_use]
    pub fn uses(&self, value: ValueId) -> &[Use] {
        &self.values[value.index()].uses
    }

    #[must_use]
    pub fn has_uses(&self, value: ValueId) -> bool {
        !self.values[value.index()].uses.is_empty()
    }

    #[must_use]
    pub fn attributes(&self, node: NodeId) -> &Attributes {
        &self.nodes[node.index()].attributes
    }

    pub fn attributes_mut(&mut self, node: NodeId) -> &mut Attributes {
        &mut self.nodes[node.index()].attributes
    }

    pub fn set_attribute(&mut self, node: NodeId, name: Symbol, value: AttributeValue) {
        self.nodes[node.index()].attributes.set(name, value);
    }

    #[must_use]
    pub fn has_attribute(&self, node: NodeId, name: Symbol) -> bool {
        self.nodes[node.index()].attributes.has(name)
    }

    /// Replaces the attributes of `to` with a copy of those on `from`.
    pub fn copy_attributes(&mut self, from: NodeId, to: NodeId) {
        self.nodes[to.index()].attributes = self.nodes[from.index()].attributes.clone();
    }

    /// Rewrites a node's kind in place; inputs, outputs and blocks are kept.
    pub fn set_kind(&mut self, node: NodeId, kind: Symbol) -> Result<(), IrError> {
        self.ensure_not_boundary(node)?;
        self.nodes[node.index()].kind = kind;
        Ok(())
    }

    /// All live nodes of `block` and its nested blocks, in pre-order.
    #[must_use]
    pub fn all_nodes(&self, block: BlockId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![block];
        while let Some(b) = stack.pop() {
            for &n in &self.blocks[b.index()].nodes {
                out.push(n);
                stack.extend(self.nodes[n.index()].blocks.iter().rev());
            }
        }
        out
    }

    /// Number of live non-boundary nodes reachable from the top block.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.all_nodes(self.top).len()
    }

    fn is_boundary(&self, node: NodeId) -> bool {
        let kind = self.nodes[node.index()].kind;
        (kind == prim::PARAM || kind == prim::RETURN)
            && self.nodes[node.index()].owning_block.is_some_and(|b| {
                let block = &self.blocks[b.index()];
                block.param == node || block.ret == node
            })
    }

    fn ensure_not_boundary(&self, node: NodeId) -> Result<(), IrError> {
        if self.is_boundary(node) {
            return Err(IrError::ProtectedNode {
                node,
                kind: self.nodes[node.index()].kind,
            });
        }
        Ok(())
    }

    // ── Ordering & scoping ─────────────────────────────────────────────

    /// Position of `node` inside its owning block: the param node is 0, the
    /// return node is one past the last body node.
    fn position(&self, node: NodeId) -> Option<usize> {
        let block = &self.blocks[self.nodes[node.index()].owning_block?.index()];
        if block.param == node {
            return Some(0);
        }
        if block.ret == node {
            return Some(block.nodes.len() + 1);
        }
        block.nodes.iter().position(|&n| n == node).map(|p| p + 1)
    }

    /// Whether `value` may be read by `user`: its definition precedes `user`
    /// (or an ancestor of `user`) in a block enclosing both.
    ///
    /// A chain that reaches a node not yet inserted into any block is
    /// accepted; it is checked again when that node is inserted.
    pub(crate) fn is_visible(&self, value: ValueId, user: NodeId) -> bool {
        let def = &self.values[value.index()];
        if def.destroyed {
            return false;
        }
        let Some(def_block) = self.nodes[def.node.index()].owning_block else {
            return false;
        };
        let mut cur = user;
        loop {
            let Some(cur_block) = self.nodes[cur.index()].owning_block else {
                return true;
            };
            if cur_block == def_block {
                return match (self.position(def.node), self.position(cur)) {
                    (Some(d), Some(u)) => d < u,
                    _ => false,
                };
            }
            match self.blocks[cur_block.index()].owning_node {
                Some(owner) => cur = owner,
                None => return false,
            }
        }
    }

    /// Whether `node` lives inside `block`, directly or through nesting.
    #[must_use]
    pub fn is_within(&self, node: NodeId, block: BlockId) -> bool {
        let mut cur = node;
        loop {
            let Some(b) = self.nodes[cur.index()].owning_block else {
                return false;
            };
            if b == block {
                return true;
            }
            match self.blocks[b.index()].owning_node {
                Some(owner) => cur = owner,
                None => return false,
            }
        }
    }

    /// True when `a` executes before `b`. Both must share a block at some
    /// nesting level; a node is not before anything it contains.
    #[must_use]
    pub fn is_before(&self, a: NodeId, b: NodeId) -> bool {
        let chain = |mut n: NodeId| {
            let mut out = Vec::new();
            while let Some(block) = self.nodes[n.index()].owning_block {
                out.push((block, n));
                match self.blocks[block.index()].owning_node {
                    Some(owner) => n = owner,
                    None => break,
                }
            }
            out
        };
        let chain_b = chain(b);
        for (block_a, anc_a) in chain(a) {
            if let Some(&(_, anc_b)) = chain_b.iter().find(|(block_b, _)| *block_b == block_a) {
                return match (self.position(anc_a), self.position(anc_b)) {
                    (Some(pa), Some(pb)) => pa < pb,
                    _ => false,
                };
            }
        }
        false
    }

    fn check_inputs_visible(&self, node: NodeId) -> Result<(), IrError> {
        for &input in &self.nodes[node.index()].inputs {
            if !self.is_visible(input, node) {
                return Err(IrError::UseBeforeDefinition { value: input, user: node });
            }
        }
        for &block in &self.nodes[node.index()].blocks {
            let b = &self.blocks[block.index()];
            for &inner in b.nodes.iter().chain(std::iter::once(&b.ret)) {
                self.check_inputs_visible(inner)?;
            }
        }
        Ok(())
    }

    // ── Construction ───────────────────────────────────────────────────

    /// Creates a detached node reading `inputs` with `num_outputs` fresh
    /// `Dynamic` outputs. Insert it with [`Graph::insert_node`] or friends.
    pub fn create(&mut self, kind: Symbol, inputs: &[ValueId], num_outputs: usize) -> NodeId {
        let node = self.new_node(kind, None);
        for &input in inputs {
            self.push_input(node, input);
        }
        for _ in 0..num_outputs {
            self.new_output(node);
        }
        node
    }

    fn push_input(&mut self, node: NodeId, value: ValueId) -> usize {
        let offset = self.nodes[node.index()].inputs.len();
        self.nodes[node.index()].inputs.push(value);
        self.values[value.index()].uses.push(Use { user: node, offset });
        offset
    }

    fn drop_use(&mut self, value: ValueId, node: NodeId, offset: usize) {
        let uses = &mut self.values[value.index()].uses;
        if let Some(pos) = uses
            .iter()
            .position(|u| u.user == node && u.offset == offset)
        {
            uses.remove(pos);
        }
    }

    pub fn insert_before(&mut self, node: NodeId, anchor: NodeId) -> Result<NodeId, IrError> {
        if self.nodes[node.index()].owning_block.is_some() {
            return Err(IrError::AlreadyInserted { node });
        }
        let Some(block) = self.nodes[anchor.index()].owning_block else {
            return Err(IrError::NotInserted { node: anchor });
        };
        let Some(pos) = self.position(anchor) else {
            return Err(IrError::NotInserted { node: anchor });
        };
        if pos == 0 {
            return Err(IrError::ProtectedNode {
                node: anchor,
                kind: prim::PARAM,
            });
        }
        self.place(node, block, pos - 1)
    }

    pub fn insert_after(&mut self, node: NodeId, anchor: NodeId) -> Result<NodeId, IrError> {
        if self.nodes[node.index()].owning_block.is_some() {
            return Err(IrError::AlreadyInserted { node });
        }
        let Some(block) = self.nodes[anchor.index()].owning_block else {
            return Err(IrError::NotInserted { node: anchor });
        };
        let Some(pos) = self.position(anchor) else {
            return Err(IrError::NotInserted { node: anchor });
        };
        if anchor == self.blocks[block.index()].ret {
            return Err(IrError::ProtectedNode {
                node: anchor,
                kind: prim::RETURN,
            });
        }
        self.place(node, block, pos)
    }

    fn place(&mut self, node: NodeId, block: BlockId, index: usize) -> Result<NodeId, IrError> {
        self.blocks[block.index()].nodes.insert(index, node);
        self.nodes[node.index()].owning_block = Some(block);
        if let Err(err) = self.check_inputs_visible(node) {
            self.blocks[block.index()].nodes.remove(index);
            self.nodes[node.index()].owning_block = None;
            return Err(err);
        }
        Ok(node)
    }

    /// Inserts at the current insert point (by default the end of the top block).
    pub fn insert_node(&mut self, node: NodeId) -> Result<NodeId, IrError> {
        self.insert_before(node, self.insert_point)
    }

    /// Inserts at the end of the top block regardless of the insert point.
    pub fn append_node(&mut self, node: NodeId) -> Result<NodeId, IrError> {
        self.insert_before(node, self.return_node())
    }

    pub fn insert(
        &mut self,
        kind: Symbol,
        inputs: &[ValueId],
        num_outputs: usize,
    ) -> Result<NodeId, IrError> {
        let node = self.create(kind, inputs, num_outputs);
        self.insert_node(node)
    }

    /// Moves an already inserted node in front of `anchor`.
    pub fn move_before(&mut self, node: NodeId, anchor: NodeId) -> Result<(), IrError> {
        self.ensure_not_boundary(node)?;
        let restore = self.detach(node)?;
        if let Err(err) = self.insert_before(node, anchor) {
            self.reattach(node, restore);
            return Err(err);
        }
        Ok(())
    }

    fn detach(&mut self, node: NodeId) -> Result<(BlockId, usize), IrError> {
        let Some(block) = self.nodes[node.index()].owning_block else {
            return Err(IrError::NotInserted { node });
        };
        let nodes = &mut self.blocks[block.index()].nodes;
        let Some(index) = nodes.iter().position(|&n| n == node) else {
            return Err(IrError::NotInserted { node });
        };
        nodes.remove(index);
        self.nodes[node.index()].owning_block = None;
        Ok((block, index))
    }

    fn reattach(&mut self, node: NodeId, (block, index): (BlockId, usize)) {
        self.blocks[block.index()].nodes.insert(index, node);
        self.nodes[node.index()].owning_block = Some(block);
    }

    #[must_use]
    pub fn insert_point(&self) -> NodeId {
        self.insert_point
    }

    /// New nodes will be inserted in front of `anchor`.
    pub fn set_insert_point(&mut self, anchor: NodeId) {
        self.insert_point = anchor;
    }

    /// New nodes will be appended to `block`.
    pub fn set_insert_point_to_end(&mut self, block: BlockId) {
        self.insert_point = self.blocks[block.index()].ret;
    }

    /// Runs `body` with the insert point temporarily moved to `anchor`.
    pub fn with_insert_point<R>(&mut self, anchor: NodeId, body: impl FnOnce(&mut Self) -> R) -> R {
        let saved = self.insert_point;
        self.insert_point = anchor;
        let out = body(self);
        self.insert_point = saved;
        out
    }

    pub fn add_input(&mut self) -> ValueId {
        let param = self.param_node();
        self.new_output(param)
    }

    pub fn add_named_input(&mut self, name: impl Into<String>) -> ValueId {
        let value = self.add_input();
        self.set_debug_name(value, name);
        value
    }

    pub fn erase_input(&mut self, index: usize) -> Result<(), IrError> {
        self.erase_block_input(self.top, index)
    }

    /// Appends `value` to the graph outputs and returns its index.
    pub fn register_output(&mut self, value: ValueId) -> Result<usize, IrError> {
        self.register_block_output(self.top, value)
    }

    pub fn erase_output(&mut self, index: usize) -> Result<(), IrError> {
        self.erase_block_output(self.top, index)
    }

    pub fn add_block(&mut self, node: NodeId) -> BlockId {
        let block = self.new_block(Some(node));
        self.nodes[node.index()].blocks.push(block);
        block
    }

    pub fn add_block_input(&mut self, block: BlockId) -> ValueId {
        let param = self.block_param(block);
        self.new_output(param)
    }

    pub fn erase_block_input(&mut self, block: BlockId, index: usize) -> Result<(), IrError> {
        let param = self.block_param(block);
        self.remove_output(param, index)
    }

    pub fn register_block_output(
        &mut self,
        block: BlockId,
        value: ValueId,
    ) -> Result<usize, IrError> {
        let ret = self.block_return(block);
        let offset = self.push_input(ret, value);
        if !self.is_visible(value, ret) {
            self.remove_input_unchecked(ret, offset);
            return Err(IrError::UseBeforeDefinition { value, user: ret });
        }
        Ok(offset)
    }

    pub fn erase_block_output(&mut self, block: BlockId, index: usize) -> Result<(), IrError> {
        let ret = self.block_return(block);
        let len = self.nodes[ret.index()].inputs.len();
        if index >= len {
            return Err(IrError::IndexOutOfRange {
                what: "block output",
                index,
                len,
            });
        }
        self.remove_input_unchecked(ret, index);
        Ok(())
    }

    // ── Editing ────────────────────────────────────────────────────────

    pub fn add_node_input(&mut self, node: NodeId, value: ValueId) -> Result<usize, IrError> {
        let offset = self.push_input(node, value);
        if self.nodes[node.index()].owning_block.is_some() && !self.is_visible(value, node) {
            self.remove_input_unchecked(node, offset);
            return Err(IrError::UseBeforeDefinition { value, user: node });
        }
        Ok(offset)
    }

    /// Points input `index` of `node` at `value`; returns the previous input.
    pub fn replace_input(
        &mut self,
        node: NodeId,
        index: usize,
        value: ValueId,
    ) -> Result<ValueId, IrError> {
        let len = self.nodes[node.index()].inputs.len();
        if index >= len {
            return Err(IrError::IndexOutOfRange {
                what: "node input",
                index,
                len,
            });
        }
        if self.nodes[node.index()].owning_block.is_some() && !self.is_visible(value, node) {
            return Err(IrError::UseBeforeDefinition { value, user: node });
        }
        let old = self.nodes[node.index()].inputs[index];
        self.drop_use(old, node, index);
        self.nodes[node.index()].inputs[index] = value;
        self.values[value.index()].uses.push(Use {
            user: node,
            offset: index,
        });
        Ok(old)
    }

    /// Replaces every occurrence of `old` among `node`'s inputs.
    pub fn replace_input_with(
        &mut self,
        node: NodeId,
        old: ValueId,
        new: ValueId,
    ) -> Result<(), IrError> {
        let slots: Vec<usize> = self.nodes[node.index()]
            .inputs
            .iter()
            .enumerate()
            .filter(|(_, v)| **v == old)
            .map(|(i, _)| i)
            .collect();
        for slot in slots {
            self.replace_input(node, slot, new)?;
        }
        Ok(())
    }

    /// Redirects every use of `old` to `new`. The caller is responsible for
    /// `new` being visible at each use; [`Graph::lint`] reports violations.
    pub fn replace_all_uses_with(&mut self, old: ValueId, new: ValueId) {
        if old == new {
            return;
        }
        let uses = std::mem::take(&mut self.values[old.index()].uses);
        for u in &uses {
            self.nodes[u.user.index()].inputs[u.offset] = new;
        }
        self.values[new.index()].uses.extend(uses);
    }

    pub fn remove_input(&mut self, node: NodeId, index: usize) -> Result<ValueId, IrError> {
        let len = self.nodes[node.index()].inputs.len();
        if index >= len {
            return Err(IrError::IndexOutOfRange {
                what: "node input",
                index,
                len,
            });
        }
        Ok(self.remove_input_unchecked(node, index))
    }

    fn remove_input_unchecked(&mut self, node: NodeId, index: usize) -> ValueId {
        let value = self.nodes[node.index()].inputs[index];
        self.drop_use(value, node, index);
        self.nodes[node.index()].inputs.remove(index);
        let shifted: Vec<(usize, ValueId)> = self.nodes[node.index()].inputs[index..]
            .iter()
            .enumerate()
            .map(|(i, v)| (index + i, *v))
            .collect();
        for (new_offset, v) in shifted {
            for u in &mut self.values[v.index()].uses {
                if u.user == node && u.offset == new_offset + 1 {
                    u.offset = new_offset;
                    break;
                }
            }
        }
        value
    }

    pub fn remove_all_inputs(&mut self, node: NodeId) {
        while !self.nodes[node.index()].inputs.is_empty() {
            let last = self.nodes[node.index()].inputs.len() - 1;
            self.remove_input_unchecked(node, last);
        }
    }

    pub fn add_node_output(&mut self, node: NodeId) -> ValueId {
        self.new_output(node)
    }

    /// Removes output `index` of `node`; refuses while the value has uses.
    pub fn erase_node_output(&mut self, node: NodeId, index: usize) -> Result<(), IrError> {
        self.ensure_not_boundary(node)?;
        self.remove_output(node, index)
    }

    fn remove_output(&mut self, node: NodeId, index: usize) -> Result<(), IrError> {
        let len = self.nodes[node.index()].outputs.len();
        if index >= len {
            return Err(IrError::IndexOutOfRange {
                what: "node output",
                index,
                len,
            });
        }
        let value = self.nodes[node.index()].outputs[index];
        let uses = self.values[value.index()].uses.len();
        if uses > 0 {
            return Err(IrError::ValueStillUsed { value, uses });
        }
        self.values[value.index()].destroyed = true;
        self.nodes[node.index()].outputs.remove(index);
        let rest: Vec<ValueId> = self.nodes[node.index()].outputs[index..].to_vec();
        for v in rest {
            self.values[v.index()].offset -= 1;
        }
        Ok(())
    }

    /// Removes `node` and its nested blocks. Refuses while any output has uses.
    pub fn destroy_node(&mut self, node: NodeId) -> Result<(), IrError> {
        self.ensure_not_boundary(node)?;
        if let Some(&value) = self.nodes[node.index()]
            .outputs
            .iter()
            .find(|v| !self.values[v.index()].uses.is_empty())
        {
            return Err(IrError::ValueStillUsed {
                value,
                uses: self.values[value.index()].uses.len(),
            });
        }
        self.force_destroy(node);
        Ok(())
    }

    fn force_destroy(&mut self, node: NodeId) {
        let blocks: Vec<BlockId> = self.nodes[node.index()].blocks.to_vec();
        for block in blocks.into_iter().rev() {
            self.destroy_block_contents(block);
        }
        self.nodes[node.index()].blocks.clear();
        self.remove_all_inputs(node);
        if let Some(block) = self.nodes[node.index()].owning_block {
            if self.insert_point == node {
                self.insert_point = self.blocks[block.index()].ret;
            }
            self.blocks[block.index()].nodes.retain(|&n| n != node);
        }
        let outputs: Vec<ValueId> = self.nodes[node.index()].outputs.to_vec();
        for v in outputs {
            self.values[v.index()].destroyed = true;
        }
        let n = &mut self.nodes[node.index()];
        n.owning_block = None;
        n.destroyed = true;
    }

    fn destroy_block_contents(&mut self, block: BlockId) {
        let ret = self.blocks[block.index()].ret;
        self.remove_all_inputs(ret);
        let body: Vec<NodeId> = self.blocks[block.index()].nodes.clone();
        for n in body.into_iter().rev() {
            self.force_destroy(n);
        }
        let param = self.blocks[block.index()].param;
        let params: Vec<ValueId> = self.nodes[param.index()].outputs.to_vec();
        for v in params {
            self.values[v.index()].destroyed = true;
        }
        if self.insert_point == ret {
            self.insert_point = self.blocks[self.top.index()].ret;
        }
        self.nodes[param.index()].destroyed = true;
        self.nodes[ret.index()].destroyed = true;
        self.blocks[block.index()].destroyed = true;
    }

    /// Removes block `index` of `node`. Refuses while a value defined inside
    /// the block is used outside of it.
    pub fn erase_block(&mut self, node: NodeId, index: usize) -> Result<(), IrError> {
        let len = self.nodes[node.index()].blocks.len();
        if index >= len {
            return Err(IrError::IndexOutOfRange {
                what: "block",
                index,
                len,
            });
        }
        let block = self.nodes[node.index()].blocks[index];
        let mut defining = self.all_nodes(block);
        defining.push(self.blocks[block.index()].param);
        for def in defining {
            for &value in &self.nodes[def.index()].outputs {
                if let Some(u) = self.values[value.index()]
                    .uses
                    .iter()
                    .find(|u| !self.is_within(u.user, block))
                {
                    return Err(IrError::EscapingBlockValue {
                        block,
                        value,
                        user: u.user,
                    });
                }
            }
        }
        self.destroy_block_contents(block);
        self.nodes[node.index()].blocks.remove(index);
        Ok(())
    }

    /// Replaces the body order of `block` with `order`, which must be a
    /// permutation of the current body that keeps every use after its def.
    pub fn reorder_block(&mut self, block: BlockId, order: Vec<NodeId>) -> Result<(), IrError> {
        let mut current = self.blocks[block.index()].nodes.clone();
        let mut proposed = order.clone();
        current.sort_unstable();
        proposed.sort_unstable();
        if current != proposed {
            return Err(IrError::InvalidReorder { block });
        }
        let previous = std::mem::replace(&mut self.blocks[block.index()].nodes, order);
        let body = self.blocks[block.index()].nodes.clone();
        let ret = self.blocks[block.index()].ret;
        for n in body.into_iter().chain(std::iter::once(ret)) {
            if let Err(err) = self.check_inputs_visible(n) {
                self.blocks[block.index()].nodes = previous;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Embeds `value` as a `prim::Constant` at the insert point.
    pub fn insert_constant(&mut self, value: &IValue) -> Result<ValueId, IrError> {
        let node = self.create(prim::CONSTANT, &[], 1);
        let attrs = &mut self.nodes[node.index()].attributes;
        let ty = match value {
            IValue::Int(v) => {
                attrs.i_(attr::VALUE, *v);
                Type::Int
            }
            IValue::Bool(v) => {
                attrs.i_(attr::VALUE, i64::from(*v));
                Type::Bool
            }
            IValue::Double(v) => {
                attrs.f_(attr::VALUE, *v);
                Type::Float
            }
            IValue::IntList(v) => {
                attrs.is_(attr::VALUE, v.clone());
                Type::List(Box::new(Type::Int))
            }
            IValue::DoubleList(v) => {
                attrs.fs_(attr::VALUE, v.clone());
                Type::List(Box::new(Type::Float))
            }
            IValue::Tensor(t) if t.is_defined() => {
                attrs.t_(attr::VALUE, t.clone());
                value.static_type()
            }
            IValue::None => Type::NoneType,
            other => {
                self.nodes[node.index()].destroyed = true;
                return Err(IrError::UnsupportedConstant { kind: other.kind() });
            }
        };
        let out = self.nodes[node.index()].outputs[0];
        self.values[out.index()].ty = ty;
        self.insert_node(node)?;
        Ok(out)
    }

    // ── Copying ────────────────────────────────────────────────────────

    /// Deep copy into a fresh, compact graph.
    pub fn copy(&self) -> Result<Graph, IrError> {
        let mut out = Graph::new();
        let mut env = FxHashMap::default();
        for &input in self.inputs() {
            let mapped = out.add_input();
            out.copy_metadata(self, input, mapped);
            env.insert(input, mapped);
        }
        let top = out.block();
        out.clone_block_body(self, self.block(), top, &mut env)?;
        Ok(out)
    }

    fn copy_metadata(&mut self, src: &Graph, from: ValueId, to: ValueId) {
        let value = &src.values[from.index()];
        self.values[to.index()].ty = value.ty.clone();
        self.values[to.index()].debug_name = value.debug_name.clone();
    }

    fn clone_block_body(
        &mut self,
        src: &Graph,
        src_block: BlockId,
        dst_block: BlockId,
        env: &mut FxHashMap<ValueId, ValueId>,
    ) -> Result<(), IrError> {
        for &n in src.block_nodes(src_block) {
            let cloned = self.create_clone(src, n, env)?;
            let ret = self.block_return(dst_block);
            self.insert_before(cloned, ret)?;
        }
        for &output in src.block_outputs(src_block) {
            let mapped = env
                .get(&output)
                .copied()
                .ok_or(IrError::UnmappedValue { value: output })?;
            self.register_block_output(dst_block, mapped)?;
        }
        Ok(())
    }

    /// Clones `node` of `src` (attributes and nested blocks included) into a
    /// detached node of `self`. Inputs are translated through `env`; the
    /// clone's outputs and block values are added to it.
    pub fn create_clone(
        &mut self,
        src: &Graph,
        node: NodeId,
        env: &mut FxHashMap<ValueId, ValueId>,
    ) -> Result<NodeId, IrError> {
        let original = &src.nodes[node.index()];
        let inputs = original
            .inputs
            .iter()
            .map(|v| env.get(v).copied().ok_or(IrError::UnmappedValue { value: *v }))
            .collect::<Result<SmallVec<[ValueId; 4]>, _>>()?;
        let cloned = self.create(original.kind, &inputs, original.outputs.len());
        self.nodes[cloned.index()].attributes = original.attributes.clone();
        for (i, &output) in original.outputs.iter().enumerate() {
            let mapped = self.nodes[cloned.index()].outputs[i];
            self.copy_metadata(src, output, mapped);
            env.insert(output, mapped);
        }
        for &block in &original.blocks {
            let new_block = self.add_block(cloned);
            for &input in src.block_inputs(block) {
                let mapped = self.add_block_input(new_block);
                self.copy_metadata(src, input, mapped);
                env.insert(input, mapped);
            }
            self.clone_block_body(src, block, new_block, env)?;
        }
        Ok(cloned)
    }
}

#[cfg(test)]
mod tests {
    use super::{Graph, IrError};
    use crate::ivalue::IValue;
    use crate::symbol::{aten, prim};
    use crate::types::Type;

    fn mul_add() -> Graph {
        let mut g = Graph::new();
        let a = g.add_input();
        let b = g.add_input();
        let mul = g.insert(aten::MUL, &[a, b], 1).expect("insert mul");
        let m = g.node(mul).outputs()[0];
        let add = g.insert(aten::ADD, &[m, a], 1).expect("insert add");
        let out = g.node(add).outputs()[0];
        g.register_output(out).expect("register");
        g
    }

    #[test]
    fn uses_track_input_slots() {
        let g = mul_add();
        let a = g.inputs()[0];
        assert_eq!(g.uses(a).len(), 2);
        let nodes = g.block_nodes(g.block()).to_vec();
        assert_eq!(g.uses(a)[0].user, nodes[0]);
        assert_eq!(g.uses(a)[1].offset, 1);
        g.lint().expect("well formed");
    }

    #[test]
    fn destroying_a_used_node_is_refused() {
        let mut g = mul_add();
        let first = g.block_nodes(g.block())[0];
        assert!(matches!(
            g.destroy_node(first),
            Err(IrError::ValueStillUsed { .. })
        ));
        g.lint().expect("unchanged graph stays well formed");
    }

    #[test]
    fn inserting_before_a_definition_is_refused() {
        let mut g = mul_add();
        let first = g.block_nodes(g.block())[0];
        let m = g.node(first).outputs()[0];
        let early = g.create(aten::NEG, &[m], 1);
        assert!(matches!(
            g.insert_before(early, first),
            Err(IrError::UseBeforeDefinition { .. })
        ));
        assert!(g.node(early).owning_block().is_none());
        g.insert_after(early, first).expect("after the def is fine");
        g.lint().expect("well formed");
    }

    #[test]
    fn replace_all_uses_then_destroy() {
        let mut g = mul_add();
        let nodes = g.block_nodes(g.block()).to_vec();
        let m = g.node(nodes[0]).outputs()[0];
        let a = g.inputs()[0];
        g.replace_all_uses_with(m, a);
        assert!(!g.has_uses(m));
        g.destroy_node(nodes[0]).expect("now unused");
        assert_eq!(g.node_count(), 1);
        g.lint().expect("well formed");
    }

    #[test]
    fn removing_an_input_renumbers_later_uses() {
        let mut g = mul_add();
        let add = g.block_nodes(g.block())[1];
        let a = g.inputs()[0];
        g.remove_input(add, 0).expect("in range");
        assert_eq!(g.node(add).inputs(), &[a]);
        assert!(g.uses(a).iter().any(|u| u.user == add && u.offset == 0));
        g.lint().expect("well formed");
    }

    #[test]
    fn blocks_see_outer_values_but_not_siblings() {
        let mut g = Graph::new();
        let a = g.add_input();
        let cond = g.add_input();
        let if_node = g.insert(prim::IF, &[cond], 1).expect("if");
        let then_block = g.add_block(if_node);
        let else_block = g.add_block(if_node);
        let inner = g.create(aten::NEG, &[a], 1);
        g.insert_before(inner, g.block_return(then_block))
            .expect("outer value visible");
        let inner_out = g.node(inner).outputs()[0];
        g.register_block_output(then_block, inner_out)
            .expect("then output");
        assert!(matches!(
            g.register_block_output(else_block, inner_out),
            Err(IrError::UseBeforeDefinition { .. })
        ));
        g.register_block_output(else_block, a).expect("else output");
        let out = g.node(if_node).outputs()[0];
        g.register_output(out).expect("graph output");
        g.lint().expect("well formed");
        assert!(g.is_before(g.param_node(), inner));
        assert!(!g.is_before(inner, if_node));
    }

    #[test]
    fn erase_block_refuses_escaping_values() {
        let mut g = Graph::new();
        let a = g.add_input();
        let b = g.add_input();
        let holder = g.insert(prim::GRAD_OF, &[], 0).expect("holder");
        let block = g.add_block(holder);
        let inner = g.create(aten::NEG, &[a], 1);
        g.insert_before(inner, g.block_return(block)).expect("inner");
        let leaked = g.node(inner).outputs()[0];
        let outside = g.insert(aten::EXP, &[b], 1).expect("outside");
        g.replace_all_uses_with(b, leaked);
        assert!(g.lint().is_err());
        assert!(matches!(
            g.erase_block(holder, 0),
            Err(IrError::EscapingBlockValue { .. })
        ));
        g.destroy_node(outside).expect("unused");
        g.erase_block(holder, 0).expect("no escaping uses left");
        assert!(g.node(holder).blocks().is_empty());
        assert!(!g.uses(a).iter().any(|u| u.user == inner));
    }

    #[test]
    fn copy_is_deep_and_compact() {
        let mut g = mul_add();
        let a = g.inputs()[0];
        g.set_type(a, Type::Float);
        g.set_debug_name(a, "a");
        let copied = g.copy().expect("copy");
        copied.lint().expect("copy is well formed");
        assert_eq!(copied.node_count(), g.node_count());
        assert_eq!(copied.ty(copied.inputs()[0]), &Type::Float);
        assert_eq!(copied.value(copied.inputs()[0]).debug_name(), Some("a"));
        assert_eq!(copied.to_string(), g.to_string());
    }

    #[test]
    fn constants_carry_their_type() {
        let mut g = Graph::new();
        let c = g.insert_constant(&IValue::Int(3)).expect("int constant");
        assert_eq!(g.ty(c), &Type::Int);
        assert!(matches!(
            g.insert_constant(&IValue::Tuple(Vec::new())),
            Err(IrError::UnsupportedConstant { .. })
        ));
        assert_eq!(g.node_count(), 1);

        let copy = g.create(prim::CONSTANT, &[], 1);
        assert!(!g.has_attribute(copy, crate::symbol::attr::VALUE));
        g.copy_attributes(g.value(c).node(), copy);
        assert_eq!(g.attributes(copy).i(crate::symbol::attr::VALUE), Ok(&3));
    }

    #[test]
    fn boundary_nodes_are_protected() {
        let mut g = mul_add();
        let ret = g.return_node();
        assert!(matches!(
            g.destroy_node(ret),
            Err(IrError::ProtectedNode { .. })
        ));
        let stray = g.create(aten::NEG, &[], 1);
        assert!(matches!(
            g.insert_after(stray, ret),
            Err(IrError::ProtectedNode { .. })
        ));
    }
}
