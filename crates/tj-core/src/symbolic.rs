//! Thin builder over [`Graph`] used by tracers, rule authors and tests.

use crate::graph::{Graph, IrError, ValueId};
use crate::symbol::{Symbol, aten, attr};
use crate::types::Type;

/// A graph value with operator-shaped constructors. Each constructor inserts
/// one node at the graph's current insert point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolicVariable(ValueId);

impl From<ValueId> for SymbolicVariable {
    fn from(value: ValueId) -> Self {
        Self(value)
    }
}

macro_rules! unary_ops {
    ($($name:ident => $kind:path),* $(,)?) => {
        $(
            pub fn $name(self, graph: &mut Graph) -> Result<Self, IrError> {
                Self::create_one(graph, $kind, &[self])
            }
        )*
    };
}

macro_rules! binary_ops {
    ($($name:ident => $kind:path),* $(,)?) => {
        $(
            pub fn $name(self, graph: &mut Graph, other: Self) -> Result<Self, IrError> {
                Self::create_one(graph, $kind, &[self, other])
            }
        )*
    };
}

impl SymbolicVariable {
    #[must_use]
    pub fn value(self) -> ValueId {
        self.0
    }

    pub fn as_new_input(graph: &mut Graph) -> Self {
        Self(graph.add_input())
    }

    pub fn create(
        graph: &mut Graph,
        kind: Symbol,
        inputs: &[Self],
        num_outputs: usize,
    ) -> Result<Vec<Self>, IrError> {
        let inputs: Vec<ValueId> = inputs.iter().map(|v| v.0).collect();
        let node = graph.insert(kind, &inputs, num_outputs)?;
        Ok(graph.node(node).outputs().iter().copied().map(Self).collect())
    }

    fn create_one(graph: &mut Graph, kind: Symbol, inputs: &[Self]) -> Result<Self, IrError> {
        let inputs: Vec<ValueId> = inputs.iter().map(|v| v.0).collect();
        let node = graph.insert(kind, &inputs, 1)?;
        Ok(Self(graph.node(node).outputs()[0]))
    }

    unary_ops! {
        neg => aten::NEG,
        exp => aten::EXP,
        sigmoid => aten::SIGMOID,
        tanh => aten::TANH,
        relu => aten::RELU,
        t => aten::T,
    }

    binary_ops! {
        add => aten::ADD,
        sub => aten::SUB,
        mul => aten::MUL,
        div => aten::DIV,
        mm => aten::MM,
        lt => aten::LT,
        gt => aten::GT,
        eq => aten::EQ,
        sigmoid_backward => aten::SIGMOID_BACKWARD,
        tanh_backward => aten::TANH_BACKWARD,
        threshold_backward => aten::THRESHOLD_BACKWARD,
        grad_sum_to_size => aten::GRAD_SUM_TO_SIZE,
    }

    /// Splits along `dim` into `chunks` pieces, one output per piece.
    pub fn chunk(self, graph: &mut Graph, chunks: usize, dim: usize) -> Result<Vec<Self>, IrError> {
        let node = graph.create(aten::CHUNK, &[self.0], chunks);
        let as_int = |v: usize| i64::try_from(v).unwrap_or(i64::MAX);
        graph
            .attributes_mut(node)
            .i_(attr::CHUNKS, as_int(chunks))
            .i_(attr::DIM, as_int(dim));
        graph.insert_node(node)?;
        Ok(graph.node(node).outputs().iter().copied().map(Self).collect())
    }

    #[must_use]
    pub fn set_type(self, graph: &mut Graph, ty: Type) -> Self {
        graph.set_type(self.0, ty);
        self
    }

    #[must_use]
    pub fn named(self, graph: &mut Graph, name: &str) -> Self {
        graph.set_debug_name(self.0, name);
        self
    }

    #[must_use]
    pub fn requires_grad(self, graph: &Graph) -> bool {
        graph.ty(self.0).requires_grad()
    }
}
