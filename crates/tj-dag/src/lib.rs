#![forbid(unsafe_code)]

//! Incrementally maintained topological order over a mutable DAG.
//!
//! Every vertex carries an `ord`; for every edge `u -> v` the invariant
//! `ord(u) < ord(v)` holds after each successful mutation. Insertion of a
//! back edge repairs the order by permuting only the ords of the vertices
//! that lie between the two endpoints (Pearce-Kelly). Ords are never
//! compacted, so removals leave gaps.

use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexId(u32);

impl VertexId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DagError {
    UnknownVertex(VertexId),
    CycleDetected { from: VertexId, to: VertexId },
    NoSuchEdge { from: VertexId, to: VertexId },
}

impl fmt::Display for DagError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownVertex(v) => write!(f, "vertex {v} does not exist"),
            Self::CycleDetected { from, to } => {
                write!(f, "edge {from} -> {to} would introduce a cycle")
            }
            Self::NoSuchEdge { from, to } => write!(f, "no edge {from} -> {to}"),
        }
    }
}

impl std::error::Error for DagError {}

type VertexSet = SmallVec<[VertexId; 4]>;

#[derive(Debug, Clone, PartialEq)]
struct Vertex<T> {
    ord: usize,
    data: Vec<T>,
    in_edges: VertexSet,
    out_edges: VertexSet,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DynamicDag<T> {
    vertices: Vec<Option<Vertex<T>>>,
    by_ord: Vec<Option<VertexId>>,
}

impl<T> Default for DynamicDag<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DynamicDag<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            vertices: Vec::new(),
            by_ord: Vec::new(),
        }
    }

    /// Adds an isolated vertex holding `data`; it gets the next free ord.
    pub fn new_vertex(&mut self, data: T) -> VertexId {
        let id = VertexId(u32::try_from(self.vertices.len()).unwrap_or(u32::MAX));
        let ord = self.by_ord.len();
        self.vertices.push(Some(Vertex {
            ord,
            data: vec![data],
            in_edges: VertexSet::new(),
            out_edges: VertexSet::new(),
        }));
        self.by_ord.push(Some(id));
        id
    }

    fn vertex(&self, v: VertexId) -> Result<&Vertex<T>, DagError> {
        self.vertices
            .get(v.index())
            .and_then(Option::as_ref)
            .ok_or(DagError::UnknownVertex(v))
    }

    fn vertex_mut(&mut self, v: VertexId) -> Result<&mut Vertex<T>, DagError> {
        self.vertices
            .get_mut(v.index())
            .and_then(Option::as_mut)
            .ok_or(DagError::UnknownVertex(v))
    }

    #[must_use]
    pub fn contains(&self, v: VertexId) -> bool {
        self.vertex(v).is_ok()
    }

    pub fn ord(&self, v: VertexId) -> Result<usize, DagError> {
        self.vertex(v).map(|vertex| vertex.ord)
    }

    pub fn data(&self, v: VertexId) -> Result<&[T], DagError> {
        self.vertex(v).map(|vertex| vertex.data.as_slice())
    }

    pub fn in_edges(&self, v: VertexId) -> Result<&[VertexId], DagError> {
        self.vertex(v).map(|vertex| vertex.in_edges.as_slice())
    }

    pub fn out_edges(&self, v: VertexId) -> Result<&[VertexId], DagError> {
        self.vertex(v).map(|vertex| vertex.out_edges.as_slice())
    }

    /// Neighbors sorted by their current ord.
    pub fn in_edges_by_ord(&self, v: VertexId) -> Result<Vec<VertexId>, DagError> {
        let mut edges = self.in_edges(v)?.to_vec();
        edges.sort_by_key(|&e| self.ord(e).unwrap_or(usize::MAX));
        Ok(edges)
    }

    pub fn out_edges_by_ord(&self, v: VertexId) -> Result<Vec<VertexId>, DagError> {
        let mut edges = self.out_edges(v)?.to_vec();
        edges.sort_by_key(|&e| self.ord(e).unwrap_or(usize::MAX));
        Ok(edges)
    }

    /// The vertex currently holding `ord`, if any.
    #[must_use]
    pub fn at(&self, ord: usize) -> Option<VertexId> {
        self.by_ord.get(ord).copied().flatten()
    }

    /// One past the largest ord ever handed out; iterate `0..max_ord()` with
    /// [`DynamicDag::at`] to visit vertices in topological order.
    #[must_use]
    pub fn max_ord(&self) -> usize {
        self.by_ord.len()
    }

    #[must_use]
    pub fn num_vertices(&self) -> usize {
        self.vertices.iter().filter(|v| v.is_some()).count()
    }

    pub fn topological_order(&self) -> impl Iterator<Item = VertexId> + '_ {
        self.by_ord.iter().filter_map(|v| *v)
    }

    pub fn has_edge(&self, from: VertexId, to: VertexId) -> Result<bool, DagError> {
        Ok(self.vertex(from)?.out_edges.contains(&to))
    }

    fn link(&mut self, from: VertexId, to: VertexId) -> Result<(), DagError> {
        self.vertex_mut(from)?.out_edges.push(to);
        self.vertex_mut(to)?.in_edges.push(from);
        Ok(())
    }

    /// Inserts `from -> to`, repairing the order if needed. Fails without
    /// mutating anything when the edge would close a cycle. Inserting an
    /// existing edge is a no-op.
    pub fn add_edge(&mut self, from: VertexId, to: VertexId) -> Result<(), DagError> {
        let lower = self.ord(to)?;
        let upper = self.ord(from)?;
        if from == to {
            return Err(DagError::CycleDetected { from, to });
        }
        if self.has_edge(from, to)? {
            return Ok(());
        }
        if upper < lower {
            return self.link(from, to);
        }

        let delta_f = self.visit_forward(to, upper, from)?;
        let delta_b = self.visit_backward(from, lower)?;
        self.reorder(delta_b, delta_f)?;
        self.link(from, to)
    }

    /// Vertices reachable from `start` whose ord is below `upper`. Reaching
    /// `target` means the proposed edge closes a cycle.
    fn visit_forward(
        &self,
        start: VertexId,
        upper: usize,
        target: VertexId,
    ) -> Result<Vec<VertexId>, DagError> {
        let mut visited = FxHashSet::default();
        let mut stack = vec![start];
        let mut out = Vec::new();
        visited.insert(start);
        while let Some(v) = stack.pop() {
            out.push(v);
            for &child in &self.vertex(v)?.out_edges {
                if child == target {
                    return Err(DagError::CycleDetected {
                        from: target,
                        to: start,
                    });
                }
                if self.ord(child)? < upper && visited.insert(child) {
                    stack.push(child);
                }
            }
        }
        Ok(out)
    }

    /// Vertices that reach `start` whose ord is above `lower`.
    fn visit_backward(&self, start: VertexId, lower: usize) -> Result<Vec<VertexId>, DagError> {
        let mut visited = FxHashSet::default();
        let mut stack = vec![start];
        let mut out = Vec::new();
        visited.insert(start);
        while let Some(v) = stack.pop() {
            out.push(v);
            for &parent in &self.vertex(v)?.in_edges {
                if self.ord(parent)? > lower && visited.insert(parent) {
                    stack.push(parent);
                }
            }
        }
        Ok(out)
    }

    /// Pools the ords of both regions and hands them back backward region
    /// first, each region keeping its relative order.
    fn reorder(
        &mut self,
        mut delta_b: Vec<VertexId>,
        mut delta_f: Vec<VertexId>,
    ) -> Result<(), DagError> {
        delta_b.sort_by_key(|&v| self.ord(v).unwrap_or(usize::MAX));
        delta_f.sort_by_key(|&v| self.ord(v).unwrap_or(usize::MAX));
        let mut pool = delta_b
            .iter()
            .chain(&delta_f)
            .map(|&v| self.ord(v))
            .collect::<Result<Vec<_>, _>>()?;
        pool.sort_unstable();
        log::trace!(
            "dag reorder: {} backward, {} forward vertices over ords {:?}",
            delta_b.len(),
            delta_f.len(),
            pool
        );
        for (v, ord) in delta_b.into_iter().chain(delta_f).zip(pool) {
            self.vertex_mut(v)?.ord = ord;
            self.by_ord[ord] = Some(v);
        }
        Ok(())
    }

    /// Removes `from -> to`; returns whether the edge existed.
    pub fn remove_edge(&mut self, from: VertexId, to: VertexId) -> Result<bool, DagError> {
        let existed = {
            let out = &mut self.vertex_mut(from)?.out_edges;
            let before = out.len();
            out.retain(|v| *v != to);
            before != out.len()
        };
        self.vertex_mut(to)?.in_edges.retain(|v| *v != from);
        Ok(existed)
    }

    /// Removes `v` and all incident edges, returning its payload.
    pub fn remove_vertex(&mut self, v: VertexId) -> Result<Vec<T>, DagError> {
        let (ord, parents, children) = {
            let vertex = self.vertex(v)?;
            (vertex.ord, vertex.in_edges.clone(), vertex.out_edges.clone())
        };
        for parent in parents {
            self.remove_edge(parent, v)?;
        }
        for child in children {
            self.remove_edge(v, child)?;
        }
        self.by_ord[ord] = None;
        let vertex = self.vertices[v.index()]
            .take()
            .ok_or(DagError::UnknownVertex(v))?;
        Ok(vertex.data)
    }

    /// Whether `to` is reachable from `from` through a path of length two or
    /// more, i.e. without using the direct edge.
    fn has_alternate_path(&self, from: VertexId, to: VertexId) -> Result<bool, DagError> {
        let upper = self.ord(to)?;
        let mut visited = FxHashSet::default();
        let mut stack: Vec<VertexId> = self
            .vertex(from)?
            .out_edges
            .iter()
            .copied()
            .filter(|&c| c != to)
            .collect();
        while let Some(v) = stack.pop() {
            if v == to {
                return Ok(true);
            }
            if !visited.insert(v) {
                continue;
            }
            for &child in &self.vertex(v)?.out_edges {
                if self.ord(child)? <= upper {
                    stack.push(child);
                }
            }
        }
        Ok(false)
    }

    /// Merges `from` into `to` along the edge `from -> to`. The surviving
    /// vertex is `to`, holding `from`'s payload followed by its own, and
    /// inheriting all of `from`'s other edges.
    ///
    /// Returns `Ok(false)` without mutating when another path `from ~> to`
    /// exists, since merging would then create a cycle.
    pub fn contract_edge(&mut self, from: VertexId, to: VertexId) -> Result<bool, DagError> {
        if !self.has_edge(from, to)? {
            return Err(DagError::NoSuchEdge { from, to });
        }
        if self.has_alternate_path(from, to)? {
            return Ok(false);
        }
        self.remove_edge(from, to)?;
        let parents = self.vertex(from)?.in_edges.clone();
        let children = self.vertex(from)?.out_edges.clone();
        let mut payload = self.remove_vertex(from)?;
        let target = self.vertex_mut(to)?;
        payload.append(&mut target.data);
        target.data = payload;
        for parent in parents {
            self.add_edge(parent, to)?;
        }
        for child in children {
            self.add_edge(to, child)?;
        }
        Ok(true)
    }
}


#[cfg(test)]
mod prop_tests {
    use super::DynamicDag;
    use proptest::prelude::*;
    use proptest::test_runner::{Config as ProptestConfig, TestRunner};

    fn check_invariant(dag: &DynamicDag<usize>) -> Result<(), TestCaseError> {
        for v in dag.topological_order() {
            let ord = dag.ord(v).map_err(|e| TestCaseError::fail(e.to_string()))?;
            for &child in dag.out_edges(v).map_err(|e| TestCaseError::fail(e.to_string()))? {
                let child_ord = dag
                    .ord(child)
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                prop_assert!(ord < child_ord, "{} -> {} violates the order", v, child);
            }
        }
        Ok(())
    }

    #[test]
    fn prop_random_edges_keep_order_or_fail_cleanly() {
        let mut runner = TestRunner::new(ProptestConfig::with_cases(
            tj_test_utils::property_test_case_count(),
        ));
        let strategy = (
            2_usize..12,
            proptest::collection::vec((any::<usize>(), any::<usize>()), 0..40),
        );
        runner
            .run(&strategy, |(size, edges)| {
                let mut dag = DynamicDag::new();
                let vs: Vec<_> = (0..size).map(|i| dag.new_vertex(i)).collect();
                for (a, b) in edges {
                    let (from, to) = (vs[a % size], vs[b % size]);
                    let snapshot = dag.clone();
                    if dag.add_edge(from, to).is_err() {
                        prop_assert_eq!(&dag, &snapshot);
                    }
                    check_invariant(&dag)?;
                }
                Ok(())
            })
            .expect("order invariant holds");
    }

    #[test]
    fn prop_contraction_keeps_order() {
        let mut runner = TestRunner::new(ProptestConfig::with_cases(
            tj_test_utils::property_test_case_count(),
        ));
        let strategy = (
            proptest::collection::vec((0_usize..10, 0_usize..10), 0..30),
            proptest::collection::vec(any::<usize>(), 0..10),
        );
        runner
            .run(&strategy, |(edges, picks)| {
                let mut dag = DynamicDag::new();
                let vs: Vec<_> = (0..10).map(|i| dag.new_vertex(i)).collect();
                for (a, b) in edges {
                    let _ = dag.add_edge(vs[a], vs[b]);
                }
                let payload_before: usize = dag
                    .topological_order()
                    .map(|v| dag.data(v).map_or(0, <[usize]>::len))
                    .sum();
                for pick in picks {
                    let live: Vec<_> = dag.topological_order().collect();
                    let from = live[pick % live.len()];
                    let children = dag.out_edges(from).map(<[_]>::to_vec).unwrap_or_default();
                    if let Some(&to) = children.first() {
                        let _ = dag.contract_edge(from, to);
                    }
                    check_invariant(&dag)?;
                }
                let payload_after: usize = dag
                    .topological_order()
                    .map(|v| dag.data(v).map_or(0, <[usize]>::len))
                    .sum();
                prop_assert_eq!(payload_before, payload_after);
                Ok(())
            })
            .expect("contraction preserves order and payload");
    }
}
