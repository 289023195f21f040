//! Common definitions shared across the partitioned matching decoder.
//!
//! This crate holds the index and weight types used by every other crate in
//! the workspace, the contiguous vertex range used to describe partitions, and
//! the `PerfectMatching` produced by a solve. It carries no algorithms so that
//! the I/O and host crates can depend on it without pulling in the solver.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a vertex in a decoding graph.
pub type VertexIndex = usize;

/// Index of an edge in a decoding graph, in insertion order.
pub type EdgeIndex = usize;

/// Integer edge weight. Weights are non-negative in any valid graph.
pub type Weight = i64;

/// Half-open range of vertex indices `[start, end)`.
///
/// Partitions own contiguous runs of vertices. Vertices are laid out
/// round-major for multi-round graphs, so a range of whole rounds is also a
/// contiguous vertex range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VertexRange {
    pub start: VertexIndex,
    pub end: VertexIndex,
}

impl VertexRange {
    pub const fn new(start: VertexIndex, end: VertexIndex) -> Self {
        Self { start, end }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    #[inline]
    pub fn contains(&self, vertex: VertexIndex) -> bool {
        vertex >= self.start && vertex < self.end
    }

    /// Returns true when the two ranges share at least one vertex.
    pub fn overlaps(&self, other: &VertexRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn iter(&self) -> std::ops::Range<VertexIndex> {
        self.start..self.end
    }
}

impl fmt::Display for VertexRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Final output of a solve.
///
/// Every defect vertex appears exactly once, either in a peer pair or as the
/// first element of a virtual matching. Peer pairs are stored with the
/// smaller vertex first and both lists are sorted, so two matchings with the
/// same pairs compare equal.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerfectMatching {
    /// Pairs of defect vertices matched to each other.
    pub peer_matchings: Vec<(VertexIndex, VertexIndex)>,

    /// `(defect, virtual)` pairs for defects matched to the boundary.
    pub virtual_matchings: Vec<(VertexIndex, VertexIndex)>,

    /// Total weight in the graph's own units.
    pub weight: Weight,
}

impl PerfectMatching {
    /// Creates an empty matching, the answer for an empty syndrome.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sorts both lists into their canonical order.
    pub fn normalize(&mut self) {
        for pair in self.peer_matchings.iter_mut() {
            if pair.0 > pair.1 {
                *pair = (pair.1, pair.0);
            }
        }
        self.peer_matchings.sort_unstable();
        self.virtual_matchings.sort_unstable();
    }

    /// Number of defect vertices covered by this matching.
    pub fn defect_num(&self) -> usize {
        self.peer_matchings.len() * 2 + self.virtual_matchings.len()
    }

    /// Returns the partner of `vertex`, if it is matched.
    ///
    /// The second element is true when the partner is a virtual vertex.
    pub fn partner_of(&self, vertex: VertexIndex) -> Option<(VertexIndex, bool)> {
        for &(a, b) in &self.peer_matchings {
            if a == vertex {
                return Some((b, false));
            }
            if b == vertex {
                return Some((a, false));
            }
        }
        self.virtual_matchings
            .iter()
            .find(|(d, _)| *d == vertex)
            .map(|&(_, v)| (v, true))
    }

    /// Clears both lists in place, keeping their allocations.
    pub fn clear(&mut self) {
        self.peer_matchings.clear();
        self.virtual_matchings.clear();
        self.weight = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_membership() {
        let r = VertexRange::new(3, 7);
        assert_eq!(r.len(), 4);
        assert!(r.contains(3));
        assert!(!r.contains(7));
        assert!(r.overlaps(&VertexRange::new(6, 9)));
        assert!(!r.overlaps(&VertexRange::new(7, 9)));
        assert!(VertexRange::new(5, 5).is_empty());
    }

    #[test]
    fn normalize_orders_pairs() {
        let mut m = PerfectMatching {
            peer_matchings: vec![(5, 2), (1, 0)],
            virtual_matchings: vec![(9, 10), (3, 10)],
            weight: 4,
        };
        m.normalize();
        assert_eq!(m.peer_matchings, vec![(0, 1), (2, 5)]);
        assert_eq!(m.virtual_matchings, vec![(3, 10), (9, 10)]);
        assert_eq!(m.defect_num(), 6);
        assert_eq!(m.partner_of(5), Some((2, false)));
        assert_eq!(m.partner_of(9), Some((10, true)));
        assert_eq!(m.partner_of(4), None);
    }
}
