//! Synthetic benchmark data: a repetition code under phenomenological noise.
//!
//! Every round holds `d - 1` detectors followed by a left and a right
//! boundary vertex, so the graph is round-major with `d + 1` vertices per
//! round. Data errors flip neighbouring detectors within a round;
//! measurement errors flip the same detector in two consecutive rounds.

use anyhow::{Context, Result, bail};
use mwpm_core::{DecodingGraph, VertexIndex};
use mwpm_io::{loader, parser, writer};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::path::Path;
use tracing::info;

#[derive(Clone, Copy, Debug)]
pub struct RepetitionCode {
    pub distance: usize,
    pub rounds: usize,
    /// Probability of each data and measurement error.
    pub p: f64,
}

impl RepetitionCode {
    pub fn round_vertex_num(&self) -> usize {
        self.distance + 1
    }

    fn check(&self) -> Result<()> {
        if self.distance < 2 {
            bail!("distance must be at least 2, got {}", self.distance);
        }
        if self.rounds == 0 {
            bail!("at least one round is needed");
        }
        if !(self.p > 0.0 && self.p < 0.5) {
            bail!("error rate {} outside (0, 0.5)", self.p);
        }
        Ok(())
    }

    /// Error mechanisms as `(u, v)` vertex pairs; edge `i` of the graph is
    /// mechanism `i`.
    fn mechanisms(&self) -> Vec<(VertexIndex, VertexIndex)> {
        let d = self.distance;
        let per_round = self.round_vertex_num();
        let mut pairs = Vec::new();
        for r in 0..self.rounds {
            let base = r * per_round;
            let (left, right) = (base + d - 1, base + d);
            pairs.push((left, base));
            for i in 0..d - 2 {
                pairs.push((base + i, base + i + 1));
            }
            pairs.push((base + d - 2, right));
            if r + 1 < self.rounds {
                for i in 0..d - 1 {
                    pairs.push((base + i, base + per_round + i));
                }
            }
        }
        pairs
    }

    pub fn build_graph(&self) -> Result<DecodingGraph> {
        self.check()?;
        let per_round = self.round_vertex_num();
        let weight = parser::probability_to_weight(self.p).unwrap_or(0);
        let mut graph = DecodingGraph::new(per_round * self.rounds);
        for r in 0..self.rounds {
            graph.set_virtual(r * per_round + self.distance - 1)?;
            graph.set_virtual(r * per_round + self.distance)?;
        }
        for (u, v) in self.mechanisms() {
            graph.add_edge(u, v, weight)?;
        }
        graph.set_round_vertex_num(per_round)?;
        graph.build_adjacency();
        Ok(graph)
    }

    /// Samples one shot and returns its defects in ascending order.
    pub fn sample(&self, graph: &DecodingGraph, rng: &mut ChaCha8Rng) -> Vec<VertexIndex> {
        let mut flipped = vec![false; graph.vertex_num()];
        for edge in &graph.edges {
            if rng.gen_bool(self.p) {
                flipped[edge.u] ^= true;
                flipped[edge.v] ^= true;
            }
        }
        flipped
            .iter()
            .enumerate()
            .filter(|&(v, &f)| f && !graph.is_virtual(v))
            .map(|(v, _)| v)
            .collect()
    }
}

/// Writes the code's graph in text format and `shot_num` sampled shots as .b8.
pub fn generate_repetition_data(
    code: &RepetitionCode,
    graph_path: &Path,
    b8_path: &Path,
    shot_num: usize,
    seed: u64,
) -> Result<()> {
    let graph = code.build_graph()?;
    info!(
        distance = code.distance,
        rounds = code.rounds,
        p = code.p,
        vertices = graph.vertex_num(),
        edges = graph.edge_num(),
        "generating repetition code"
    );
    writer::save_graph_file(graph_path, &graph)?;

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let shots: Vec<Vec<VertexIndex>> = (0..shot_num).map(|_| code.sample(&graph, &mut rng)).collect();
    let defect_total: usize = shots.iter().map(Vec::len).sum();
    loader::save_b8_file(b8_path, &shots, graph.vertex_num())
        .with_context(|| format!("failed to save shots to {}", b8_path.display()))?;
    info!(shots = shot_num, defects = defect_total, "shots written");
    Ok(())
}
