//! Fusion engine: joins two solved sibling units across their shared boundary.
//!
//! The right child's arena is appended after the left child's with an index
//! bias, so no node is copied twice and no pointer needs fixing. Defects that
//! the children left matched to the midpoint of an edge now internal to the
//! fused unit are released, and the alternating-tree search restarts from
//! those defects only. Everything else keeps its matching and duals: both
//! stay valid for the larger region, so the work done by the children is not
//! repeated.

use crate::error::Result;
use crate::graph::DecodingGraph;
use crate::partition::OwnedRanges;
use crate::primal_dual::{Escape, Mate, Node, PrimalDualUnit};
use mwpm_common::EdgeIndex;
use tracing::debug;

/// Fuses two sibling units into `unit`, which owns `owned`.
///
/// `boundary_edges` must be sorted and list every edge joining the two
/// children.
pub fn fuse(
    graph: &DecodingGraph,
    left: PrimalDualUnit,
    right: PrimalDualUnit,
    unit: usize,
    owned: OwnedRanges,
    boundary_edges: &[EdgeIndex],
) -> Result<PrimalDualUnit> {
    let (left_id, right_id) = (left.unit(), right.unit());
    let mut merged = merge(left, right, unit, owned);
    let released = release_boundary(&mut merged, boundary_edges);
    debug!(
        unit,
        left = left_id,
        right = right_id,
        released = released.len(),
        defects = merged.defect_num(),
        "fusing"
    );
    merged.resolve(graph, released)?;
    Ok(merged)
}

/// Concatenates two arenas: left defects, right defects, left blossoms,
/// right blossoms.
fn merge(
    mut left: PrimalDualUnit,
    mut right: PrimalDualUnit,
    unit: usize,
    owned: OwnedRanges,
) -> PrimalDualUnit {
    let n1 = left.defects.len();
    let n2 = right.defects.len();
    let left_blossoms = left.nodes.split_off(n1);
    let right_blossoms = right.nodes.split_off(n2);
    let b1 = left_blossoms.len();

    let left_map = |i: usize| if i < n1 { i } else { n1 + n2 + (i - n1) };
    let right_map = |i: usize| if i < n2 { n1 + i } else { n1 + n2 + b1 + (i - n2) };

    let mut nodes = Vec::with_capacity(n1 + n2 + b1 + right_blossoms.len());
    nodes.extend(left.nodes.drain(..).map(|n| rebase(n, left_map, 0)));
    nodes.extend(right.nodes.drain(..).map(|n| rebase(n, right_map, n1)));
    nodes.extend(left_blossoms.into_iter().map(|n| rebase(n, left_map, 0)));
    nodes.extend(right_blossoms.into_iter().map(|n| rebase(n, right_map, n1)));

    let mut free_slots: Vec<usize> = left.free_slots.iter().map(|&i| left_map(i)).collect();
    free_slots.extend(right.free_slots.iter().map(|&i| right_map(i)));

    let mut mates = std::mem::take(&mut left.mates);
    mates.extend(right.mates.iter().map(|mate| match mate {
        Some(Mate::Peer(x)) => Some(Mate::Peer(x + n1)),
        other => *other,
    }));

    let mut defects = std::mem::take(&mut left.defects);
    defects.append(&mut right.defects);

    PrimalDualUnit::from_parts(
        unit,
        owned,
        defects,
        nodes,
        free_slots,
        mates,
        left.take_scratch(),
    )
}

fn rebase(mut node: Node, node_map: impl Fn(usize) -> usize, offset: usize) -> Node {
    node.parent = node.parent.map(&node_map);
    for child in node.children.iter_mut() {
        *child = node_map(*child);
    }
    for link in node.links.iter_mut() {
        *link = (link.0 + offset, link.1 + offset);
    }
    node.base += offset;
    node.tree_link = node.tree_link.map(|(a, b)| (a + offset, b + offset));
    node
}

/// Frees every defect matched to the midpoint of a boundary edge and returns
/// them as roots for the next search.
fn release_boundary(unit: &mut PrimalDualUnit, boundary_edges: &[EdgeIndex]) -> Vec<usize> {
    let mut released = Vec::new();
    for (v, mate) in unit.mates.iter_mut().enumerate() {
        if let Some(Mate::Escape(Escape::Midpoint(edge))) = *mate {
            if boundary_edges.binary_search(&edge).is_ok() {
                *mate = None;
                released.push(v);
            }
        }
    }
    released
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primal_dual::WEIGHT_SCALE;
    use mwpm_common::VertexRange;

    fn chain_with_boundary() -> DecodingGraph {
        let mut g = DecodingGraph::new(6);
        g.add_edge(4, 0, 1).unwrap();
        g.add_edge(0, 1, 1).unwrap();
        g.add_edge(1, 2, 1).unwrap();
        g.add_edge(2, 3, 1).unwrap();
        g.add_edge(3, 5, 1).unwrap();
        g.set_virtual(4).unwrap();
        g.set_virtual(5).unwrap();
        g.build_adjacency();
        g
    }

    fn owns(ranges: &[(usize, usize)]) -> OwnedRanges {
        ranges
            .iter()
            .map(|&(start, end)| OwnedRanges::single(VertexRange::new(start, end)))
            .reduce(|a, b| a.union(&b))
            .unwrap()
    }

    fn leaf(g: &DecodingGraph, id: usize, owned: OwnedRanges, defects: Vec<usize>) -> PrimalDualUnit {
        let mut unit = PrimalDualUnit::new(id, owned, defects);
        unit.solve(g).unwrap();
        unit
    }

    #[test]
    fn fusion_revises_pending_boundary() {
        let g = chain_with_boundary();
        let left = leaf(&g, 0, owns(&[(0, 1), (4, 5)]), vec![0]);
        let right = leaf(&g, 1, owns(&[(1, 4), (5, 6)]), vec![1, 2, 3]);
        assert_eq!(left.pending_boundary()[0].edge, 1);
        assert_eq!(right.pending_boundary()[0].vertex, 1);

        let owned = left.owned().union(right.owned());
        let mut fused = fuse(&g, left, right, 2, owned, &[1]).unwrap();
        assert!(fused.pending_boundary().is_empty());
        // only the released defect's tree needed distances
        assert_eq!(fused.cached_rows(), 1);
        let m = fused.perfect_matching(&g).unwrap();
        assert_eq!(m.peer_matchings, vec![(0, 1), (2, 3)]);
        assert_eq!(m.weight, 2);
        assert_eq!(fused.sum_dual_variables(), 2 * WEIGHT_SCALE);
    }

    #[test]
    fn chained_fusions_match_whole_graph() {
        let g = chain_with_boundary();
        let a = leaf(&g, 0, owns(&[(0, 1), (4, 5)]), vec![0]);
        let b = leaf(&g, 1, owns(&[(1, 2)]), vec![1]);
        let owned = a.owned().union(b.owned());
        // both single-vertex leaves escape through edge 1, so fusing frees them
        let fused = fuse(&g, a, b, 3, owned, &[1]).unwrap();
        assert!(fused.pending_boundary().is_empty());
        assert_eq!(fused.mates[0], Some(Mate::Peer(1)));

        let c = leaf(&g, 2, owns(&[(2, 4), (5, 6)]), vec![2, 3]);
        let owned = fused.owned().union(c.owned());
        let mut root = fuse(&g, fused, c, 4, owned, &[2]).unwrap();
        assert_eq!(root.extract_matching().unwrap().weight, 2);
        let m = root.perfect_matching(&g).unwrap();
        assert_eq!(m.peer_matchings, vec![(0, 1), (2, 3)]);
        assert_eq!(root.sum_dual_variables(), 2 * WEIGHT_SCALE);
    }
}
