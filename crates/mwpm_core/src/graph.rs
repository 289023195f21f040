//! Decoding graph representation.
//!
//! Vertices are detectors (possibly repeated over measurement rounds) plus
//! virtual vertices standing for the code boundary. Edges are possible error
//! locations with non-negative integer weights. The graph is built once per
//! decoding instance and is read-only afterwards, so it is shared between
//! worker threads behind an `Arc` without locking.

use crate::bit_utils::BitPack;
use crate::error::{MwpmError, Result};
use mwpm_common::{EdgeIndex, VertexIndex, VertexRange, Weight};

/// Undirected weighted edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Edge {
    /// First endpoint, as given to `add_edge`.
    pub u: VertexIndex,

    /// Second endpoint.
    pub v: VertexIndex,

    /// Weight in the graph's own units. Always non-negative.
    pub weight: Weight,
}

impl Edge {
    /// Returns the endpoint opposite to `vertex`.
    #[inline]
    pub fn other(&self, vertex: VertexIndex) -> VertexIndex {
        if self.u == vertex { self.v } else { self.u }
    }
}

/// Decoding graph with packed virtual flags and a compressed adjacency list.
///
/// Edges are appended with `add_edge` and the adjacency is materialized by
/// `build_adjacency`. Solvers refuse graphs whose adjacency is stale, so the
/// usual construction sequence is: `new`, `add_edge`/`set_virtual` as needed,
/// then `build_adjacency`.
#[derive(Clone, Debug)]
pub struct DecodingGraph {
    /// Flat edge list in insertion order. Edge indices point into this list.
    pub edges: Vec<Edge>,

    vertex_num: usize,

    /// One bit per vertex; set for virtual (boundary) vertices.
    virtual_flags: Vec<u64>,

    /// Vertices per measurement round, when the graph is laid out round-major.
    round_vertex_num: Option<usize>,

    /// CSR offsets into `adjacency`, `vertex_num + 1` entries once built.
    adjacency_offsets: Vec<usize>,

    /// `(neighbor, edge)` pairs grouped by vertex.
    adjacency: Vec<(VertexIndex, EdgeIndex)>,

    adjacency_ready: bool,
}

impl DecodingGraph {
    /// Creates a graph with `vertex_num` vertices and no edges.
    pub fn new(vertex_num: usize) -> Self {
        Self {
            edges: Vec::with_capacity(vertex_num * 2),
            vertex_num,
            virtual_flags: vec![0; BitPack::words_for(vertex_num)],
            round_vertex_num: None,
            adjacency_offsets: Vec::new(),
            adjacency: Vec::new(),
            adjacency_ready: false,
        }
    }

    #[inline]
    pub fn vertex_num(&self) -> usize {
        self.vertex_num
    }

    #[inline]
    pub fn edge_num(&self) -> usize {
        self.edges.len()
    }

    fn check_vertex(&self, vertex: VertexIndex) -> Result<()> {
        if vertex >= self.vertex_num {
            return Err(MwpmError::VertexOutOfBounds {
                vertex,
                vertex_num: self.vertex_num,
            });
        }
        Ok(())
    }

    /// Adds an undirected edge and returns its index.
    ///
    /// Self loops and negative weights are rejected. Parallel edges are
    /// allowed; the shorter one wins during path search.
    pub fn add_edge(&mut self, u: VertexIndex, v: VertexIndex, weight: Weight) -> Result<EdgeIndex> {
        self.check_vertex(u)?;
        self.check_vertex(v)?;
        if u == v {
            return Err(MwpmError::InvalidEdge {
                u,
                v,
                weight,
                reason: "self loop",
            });
        }
        if weight < 0 {
            return Err(MwpmError::InvalidEdge {
                u,
                v,
                weight,
                reason: "negative weight",
            });
        }
        self.edges.push(Edge { u, v, weight });
        self.adjacency_ready = false;
        Ok(self.edges.len() - 1)
    }

    /// Marks `vertex` as a virtual boundary vertex.
    pub fn set_virtual(&mut self, vertex: VertexIndex) -> Result<()> {
        self.check_vertex(vertex)?;
        BitPack::set(&mut self.virtual_flags, vertex, true);
        Ok(())
    }

    #[inline]
    pub fn is_virtual(&self, vertex: VertexIndex) -> bool {
        BitPack::get(&self.virtual_flags, vertex)
    }

    /// Virtual vertices in ascending order.
    pub fn virtual_vertices(&self) -> Vec<VertexIndex> {
        BitPack::iter_ones(&self.virtual_flags).collect()
    }

    pub fn virtual_num(&self) -> usize {
        BitPack::count_ones(&self.virtual_flags)
    }

    /// Declares the round-major layout: round `r` owns vertices
    /// `[r * n, (r + 1) * n)`.
    pub fn set_round_vertex_num(&mut self, round_vertex_num: usize) -> Result<()> {
        if round_vertex_num == 0 || self.vertex_num % round_vertex_num != 0 {
            return Err(MwpmError::Config(format!(
                "round size {} does not divide vertex count {}",
                round_vertex_num, self.vertex_num
            )));
        }
        self.round_vertex_num = Some(round_vertex_num);
        Ok(())
    }

    pub fn round_vertex_num(&self) -> Option<usize> {
        self.round_vertex_num
    }

    /// Number of measurement rounds, or `None` for a graph without rounds.
    pub fn round_num(&self) -> Option<usize> {
        self.round_vertex_num.map(|n| self.vertex_num / n)
    }

    /// Round that `vertex` belongs to.
    pub fn round_of(&self, vertex: VertexIndex) -> Option<usize> {
        self.round_vertex_num.map(|n| vertex / n)
    }

    /// Addressable segments along the partition axis.
    ///
    /// With a round layout each round is one segment; otherwise each vertex
    /// is a segment of its own.
    pub fn segments(&self) -> Vec<VertexRange> {
        match self.round_vertex_num {
            Some(n) => (0..self.vertex_num / n)
                .map(|r| VertexRange::new(r * n, (r + 1) * n))
                .collect(),
            None => (0..self.vertex_num)
                .map(|v| VertexRange::new(v, v + 1))
                .collect(),
        }
    }

    /// Builds the compressed adjacency list from the edge list.
    pub fn build_adjacency(&mut self) {
        let mut degree = vec![0usize; self.vertex_num + 1];
        for edge in &self.edges {
            degree[edge.u] += 1;
            degree[edge.v] += 1;
        }

        let mut offsets = Vec::with_capacity(self.vertex_num + 1);
        let mut total = 0;
        for d in degree.iter().take(self.vertex_num) {
            offsets.push(total);
            total += d;
        }
        offsets.push(total);

        let mut cursor = offsets.clone();
        let mut adjacency = vec![(0, 0); total];
        for (index, edge) in self.edges.iter().enumerate() {
            adjacency[cursor[edge.u]] = (edge.v, index);
            cursor[edge.u] += 1;
            adjacency[cursor[edge.v]] = (edge.u, index);
            cursor[edge.v] += 1;
        }

        self.adjacency_offsets = offsets;
        self.adjacency = adjacency;
        self.adjacency_ready = true;
    }

    /// True once `build_adjacency` has run after the last `add_edge`.
    pub fn is_ready(&self) -> bool {
        self.adjacency_ready
    }

    /// Neighbors of `vertex` as `(neighbor, edge)` pairs.
    #[inline]
    pub fn neighbors(&self, vertex: VertexIndex) -> &[(VertexIndex, EdgeIndex)] {
        if !self.adjacency_ready {
            return &[];
        }
        &self.adjacency[self.adjacency_offsets[vertex]..self.adjacency_offsets[vertex + 1]]
    }

    /// Checks a defect list against the graph and returns it sorted.
    ///
    /// Defects must be in range, unique and never virtual.
    pub fn validate_defects(&self, defects: &[VertexIndex]) -> Result<Vec<VertexIndex>> {
        let mut sorted = defects.to_vec();
        sorted.sort_unstable();
        for (i, &vertex) in sorted.iter().enumerate() {
            self.check_vertex(vertex)?;
            if self.is_virtual(vertex) {
                return Err(MwpmError::DefectOnVirtual { vertex });
            }
            if i > 0 && sorted[i - 1] == vertex {
                return Err(MwpmError::DuplicateDefect { vertex });
            }
        }
        Ok(sorted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> DecodingGraph {
        let mut g = DecodingGraph::new(4);
        g.add_edge(0, 1, 2).unwrap();
        g.add_edge(1, 2, 2).unwrap();
        g.add_edge(2, 3, 4).unwrap();
        g.set_virtual(3).unwrap();
        g.build_adjacency();
        g
    }

    #[test]
    fn adjacency_lists_both_directions() {
        let g = chain();
        assert_eq!(g.neighbors(1), &[(0, 0), (2, 1)]);
        assert_eq!(g.neighbors(3), &[(2, 2)]);
        assert_eq!(g.virtual_vertices(), vec![3]);
        assert_eq!(g.edges[2].other(3), 2);
    }

    #[test]
    fn rejects_bad_edges() {
        let mut g = DecodingGraph::new(3);
        assert!(matches!(g.add_edge(0, 0, 1), Err(MwpmError::InvalidEdge { .. })));
        assert!(matches!(g.add_edge(0, 1, -1), Err(MwpmError::InvalidEdge { .. })));
        assert!(matches!(g.add_edge(0, 5, 1), Err(MwpmError::VertexOutOfBounds { .. })));
    }

    #[test]
    fn adding_edges_invalidates_adjacency() {
        let mut g = chain();
        assert!(g.is_ready());
        g.add_edge(0, 2, 1).unwrap();
        assert!(!g.is_ready());
        assert!(g.neighbors(0).is_empty());
    }

    #[test]
    fn segments_follow_rounds() {
        let mut g = DecodingGraph::new(6);
        assert_eq!(g.segments().len(), 6);
        assert!(g.set_round_vertex_num(4).is_err());
        g.set_round_vertex_num(3).unwrap();
        assert_eq!(g.segments(), vec![VertexRange::new(0, 3), VertexRange::new(3, 6)]);
        assert_eq!(g.round_of(4), Some(1));
    }

    #[test]
    fn validates_defects() {
        let g = chain();
        assert_eq!(g.validate_defects(&[2, 0]).unwrap(), vec![0, 2]);
        assert_eq!(
            g.validate_defects(&[3]),
            Err(MwpmError::DefectOnVirtual { vertex: 3 })
        );
        assert_eq!(
            g.validate_defects(&[1, 1]),
            Err(MwpmError::DuplicateDefect { vertex: 1 })
        );
    }
}
