//! Benchmarks for partitioned decoding.
//!
//! ```bash
//! cargo bench -p mwpm_core --bench fusion
//! ```
//!
//! Results are saved to `target/criterion/` with HTML reports.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use mwpm_core::{DecodingGraph, FusionTree, PartitionSettings, ParallelSolver, SolverConfig, solve_sequential};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;

// ============================================================================
// HELPER FUNCTIONS - deterministic graphs and syndromes
// ============================================================================

/// Repetition code with `d - 1` detectors and two boundary vertices per round.
fn repetition_code(d: usize, rounds: usize) -> DecodingGraph {
    let per_round = d + 1;
    let mut g = DecodingGraph::new(per_round * rounds);
    for r in 0..rounds {
        let base = r * per_round;
        g.set_virtual(base + d - 1).unwrap();
        g.set_virtual(base + d).unwrap();
        g.add_edge(base + d - 1, base, 2).unwrap();
        for i in 0..d - 2 {
            g.add_edge(base + i, base + i + 1, 2).unwrap();
        }
        g.add_edge(base + d - 2, base + d, 2).unwrap();
        if r + 1 < rounds {
            for i in 0..d - 1 {
                g.add_edge(base + i, base + per_round + i, 3).unwrap();
            }
        }
    }
    g.set_round_vertex_num(per_round).unwrap();
    g.build_adjacency();
    g
}

fn syndromes(g: &DecodingGraph, count: usize, p: f64, seed: u64) -> Vec<Vec<usize>> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            (0..g.vertex_num())
                .filter(|&v| !g.is_virtual(v) && rng.gen_bool(p))
                .collect()
        })
        .collect()
}

// ============================================================================
// BENCHMARKS
// ============================================================================

fn bench_sequential_partitions(c: &mut Criterion) {
    let g = repetition_code(9, 80);
    let shots = syndromes(&g, 16, 0.03, 42);
    let mut group = c.benchmark_group("sequential_partitions");
    group.throughput(Throughput::Elements(shots.len() as u64));
    for parts in [1, 4, 16] {
        let tree = FusionTree::build(&g, &PartitionSettings::time_axis(parts)).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(parts), &tree, |b, tree| {
            b.iter(|| {
                for shot in &shots {
                    let mut root = solve_sequential(&g, tree, shot).unwrap();
                    black_box(root.perfect_matching(&g).unwrap());
                }
            })
        });
    }
    group.finish();
}

fn bench_parallel_threads(c: &mut Criterion) {
    let g = Arc::new(repetition_code(9, 160));
    let shots = syndromes(&g, 8, 0.03, 7);
    let mut group = c.benchmark_group("parallel_threads");
    group.throughput(Throughput::Elements(shots.len() as u64));
    for threads in [1, 2, 4] {
        let mut solver = ParallelSolver::new(
            Arc::clone(&g),
            &PartitionSettings::time_axis(16),
            SolverConfig::with_threads(threads),
        )
        .unwrap();
        group.bench_function(BenchmarkId::from_parameter(threads), |b| {
            b.iter(|| {
                for shot in &shots {
                    black_box(solver.solve(shot).unwrap());
                }
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_sequential_partitions, bench_parallel_threads);
criterion_main!(benches);
