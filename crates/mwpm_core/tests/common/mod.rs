//! Shared helpers for the integration tests: graph builders and a brute-force
//! reference matcher for small defect sets.

#![allow(dead_code)]

use mwpm_core::{DecodingGraph, PerfectMatching, VertexIndex, Weight};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

pub fn rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

/// Four detectors in a row, each end tied to its own virtual vertex, all
/// weights 1. Vertices 4 and 5 are virtual.
pub fn chain_graph() -> Arc<DecodingGraph> {
    let mut g = DecodingGraph::new(6);
    g.add_edge(4, 0, 1).unwrap();
    g.add_edge(0, 1, 1).unwrap();
    g.add_edge(1, 2, 1).unwrap();
    g.add_edge(2, 3, 1).unwrap();
    g.add_edge(3, 5, 1).unwrap();
    g.set_virtual(4).unwrap();
    g.set_virtual(5).unwrap();
    g.build_adjacency();
    Arc::new(g)
}

/// Connected random graph on `vertex_num` vertices.
///
/// Real vertices form a path in index order so every one of them can reach
/// every other; each virtual vertex hangs off one or two real vertices.
/// Weights are drawn from `1..=9`.
pub fn random_graph(rng: &mut ChaCha8Rng, vertex_num: usize, extra_edges: usize) -> DecodingGraph {
    let mut g = DecodingGraph::new(vertex_num);
    let mut real = Vec::new();
    let mut virtuals = Vec::new();
    for v in 0..vertex_num {
        // keep at least two real vertices
        if v >= 2 && rng.gen_bool(0.25) {
            virtuals.push(v);
        } else {
            real.push(v);
        }
    }
    if virtuals.is_empty() && real.len() > 2 {
        let v = real.remove(rng.gen_range(2..real.len()));
        virtuals.push(v);
    }
    for pair in real.windows(2) {
        g.add_edge(pair[0], pair[1], rng.gen_range(1..=9)).unwrap();
    }
    for &v in &virtuals {
        g.set_virtual(v).unwrap();
        let links = rng.gen_range(1..=2);
        for _ in 0..links {
            let r = real[rng.gen_range(0..real.len())];
            g.add_edge(v, r, rng.gen_range(1..=9)).unwrap();
        }
    }
    for _ in 0..extra_edges {
        let a = real[rng.gen_range(0..real.len())];
        let b = real[rng.gen_range(0..real.len())];
        if a != b {
            g.add_edge(a, b, rng.gen_range(1..=9)).unwrap();
        }
    }
    g.build_adjacency();
    g
}

/// Random subset of the real vertices, each picked with probability `p`.
pub fn random_defects(rng: &mut ChaCha8Rng, g: &DecodingGraph, p: f64, max: usize) -> Vec<VertexIndex> {
    let mut defects: Vec<VertexIndex> = (0..g.vertex_num())
        .filter(|&v| !g.is_virtual(v))
        .filter(|_| rng.gen_bool(p))
        .collect();
    defects.truncate(max);
    defects
}

/// Phenomenological repetition code of distance `d` over `rounds` rounds.
///
/// Each round holds `d - 1` detectors followed by two virtual vertices for
/// the left and right boundary. Space-like edges weigh `space`, time-like
/// edges between the same detector in consecutive rounds weigh `time`.
pub fn repetition_code(d: usize, rounds: usize, space: Weight, time: Weight) -> DecodingGraph {
    let per_round = d + 1;
    let mut g = DecodingGraph::new(per_round * rounds);
    for r in 0..rounds {
        let base = r * per_round;
        let left = base + d - 1;
        let right = base + d;
        g.set_virtual(left).unwrap();
        g.set_virtual(right).unwrap();
        g.add_edge(left, base, space).unwrap();
        for i in 0..d - 2 {
            g.add_edge(base + i, base + i + 1, space).unwrap();
        }
        g.add_edge(base + d - 2, right, space).unwrap();
        if r + 1 < rounds {
            for i in 0..d - 1 {
                g.add_edge(base + i, base + per_round + i, time).unwrap();
            }
        }
    }
    g.set_round_vertex_num(per_round).unwrap();
    g.build_adjacency();
    g
}

/// Shortest distances from `source`; virtual vertices end a path.
pub fn distances(g: &DecodingGraph, source: VertexIndex) -> Vec<Option<Weight>> {
    let mut dist: Vec<Option<Weight>> = vec![None; g.vertex_num()];
    let mut heap = BinaryHeap::new();
    dist[source] = Some(0);
    heap.push(Reverse((0, source)));
    while let Some(Reverse((d, a))) = heap.pop() {
        if dist[a].is_some_and(|best| d > best) {
            continue;
        }
        if a != source && g.is_virtual(a) {
            continue;
        }
        for &(b, e) in g.neighbors(a) {
            let next = d + g.edges[e].weight;
            if dist[b].is_none_or(|best| next < best) {
                dist[b] = Some(next);
                heap.push(Reverse((next, b)));
            }
        }
    }
    dist
}

/// Minimum perfect-matching weight by dynamic programming over subsets.
/// `None` when no perfect matching exists.
pub fn brute_force_weight(g: &DecodingGraph, defects: &[VertexIndex]) -> Option<Weight> {
    let n = defects.len();
    assert!(n <= 16, "brute force is exponential in the defect count");
    let rows: Vec<Vec<Option<Weight>>> = defects.iter().map(|&d| distances(g, d)).collect();
    let boundary: Vec<Option<Weight>> = rows
        .iter()
        .map(|row| {
            (0..g.vertex_num())
                .filter(|&v| g.is_virtual(v))
                .filter_map(|v| row[v])
                .min()
        })
        .collect();

    let full = (1usize << n) - 1;
    let mut best: Vec<Option<Weight>> = vec![None; full + 1];
    best[0] = Some(0);
    for mask in 1..=full {
        let i = mask.trailing_zeros() as usize;
        let rest = mask & !(1 << i);
        let mut candidate: Option<Weight> = None;
        let mut offer = |value: Option<Weight>| {
            if let Some(v) = value {
                if candidate.is_none_or(|c| v < c) {
                    candidate = Some(v);
                }
            }
        };
        offer(best[rest].zip(boundary[i]).map(|(a, b)| a + b));
        for j in (i + 1)..n {
            if rest & (1 << j) != 0 {
                let pair = rows[i][defects[j]];
                offer(best[rest & !(1 << j)].zip(pair).map(|(a, b)| a + b));
            }
        }
        best[mask] = candidate;
    }
    best[full]
}

/// Recomputes the weight of `matching` from scratch and checks that it covers
/// every defect exactly once.
pub fn check_matching(g: &DecodingGraph, defects: &[VertexIndex], matching: &PerfectMatching) -> Weight {
    let mut seen: Vec<VertexIndex> = matching
        .peer_matchings
        .iter()
        .flat_map(|&(a, b)| [a, b])
        .chain(matching.virtual_matchings.iter().map(|&(d, _)| d))
        .collect();
    seen.sort_unstable();
    let mut expected = defects.to_vec();
    expected.sort_unstable();
    assert_eq!(seen, expected, "every defect must be matched exactly once");

    let mut weight = 0;
    for &(a, b) in &matching.peer_matchings {
        weight += distances(g, a)[b].expect("peer pair must be connected");
    }
    for &(d, v) in &matching.virtual_matchings {
        assert!(g.is_virtual(v));
        weight += distances(g, d)[v].expect("virtual partner must be reachable");
    }
    weight
}
