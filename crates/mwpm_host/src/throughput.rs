use crate::LoadedGraph;
use crate::profiler::Profiler;
use crate::stats::LatencyStats;
use anyhow::Result;
use mwpm_core::{
    FusionTree, ParallelSolver, PartitionSettings, PerfectMatching, SolverConfig, VertexIndex,
    solve_sequential,
};
use mwpm_io::loader;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub struct RunOptions {
    pub partition: PartitionSettings,
    pub solver: SolverConfig,
    pub batch: bool,
    pub profile_output: Option<PathBuf>,
}

struct ShotOutcome {
    elapsed: Duration,
    result: mwpm_core::Result<PerfectMatching>,
}

pub fn run_benchmark(loaded: LoadedGraph, b8_path: &Path, options: &RunOptions) -> Result<()> {
    let LoadedGraph {
        graph,
        detector_num,
    } = loaded;
    info!(
        vertices = graph.vertex_num(),
        edges = graph.edge_num(),
        "graph loaded"
    );

    let raw_bits = loader::load_b8_file(b8_path)?;
    let shots = loader::slice_shots(&raw_bits, detector_num)?;
    info!(shots = shots.len(), path = %b8_path.display(), "shots loaded");

    let graph = Arc::new(graph);
    let start_bench = Instant::now();
    let outcomes = if options.batch {
        decode_batch(&graph, &shots, &options.partition)?
    } else {
        decode_pool(Arc::clone(&graph), &shots, options)?
    };
    let seconds = start_bench.elapsed().as_secs_f64();

    let mut stats = LatencyStats::new(Duration::from_micros(10));
    let mut profiler = match &options.profile_output {
        Some(path) => Some(Profiler::create(path)?),
        None => None,
    };
    let mut solved_count = 0usize;
    for (index, (shot, outcome)) in shots.iter().zip(&outcomes).enumerate() {
        stats.update(outcome.elapsed);
        let summary = match &outcome.result {
            Ok(matching) => {
                solved_count += 1;
                Ok(matching.weight)
            }
            Err(e) => {
                warn!(shot = index, error = %e, "shot failed");
                Err(e.to_string())
            }
        };
        if let Some(p) = profiler.as_mut() {
            p.record(index, shot.len(), outcome.elapsed, summary)?;
        }
    }

    println!("Results ({})", if options.batch { "rayon batch" } else { "worker pool" });
    println!("Time: {:.4} s", seconds);
    println!("Throughput: {:.2} shots/s", shots.len() as f64 / seconds);
    println!("Solved: {}/{}", solved_count, shots.len());
    stats.print_report("Latency Metrics (per shot)");

    if let Some(p) = profiler {
        let summary = p.finish()?;
        info!(
            max = summary.max_decoding_time,
            average = summary.average_decoding_time,
            "profile written"
        );
    }
    Ok(())
}

/// One fusion tree per shot on the calling rayon worker.
fn decode_batch(
    graph: &Arc<mwpm_core::DecodingGraph>,
    shots: &[Vec<VertexIndex>],
    partition: &PartitionSettings,
) -> Result<Vec<ShotOutcome>> {
    let tree = FusionTree::build(graph, partition)?;
    Ok(shots
        .par_iter()
        .map(|shot| {
            let start = Instant::now();
            let result = solve_sequential(graph, &tree, shot)
                .and_then(|mut root| root.perfect_matching(graph));
            ShotOutcome {
                elapsed: start.elapsed(),
                result,
            }
        })
        .collect())
}

/// Shots one after another, each spread over the solver's worker pool.
fn decode_pool(
    graph: Arc<mwpm_core::DecodingGraph>,
    shots: &[Vec<VertexIndex>],
    options: &RunOptions,
) -> Result<Vec<ShotOutcome>> {
    let mut solver = ParallelSolver::new(graph, &options.partition, options.solver.clone())?;
    let mut outcomes = Vec::with_capacity(shots.len());
    for shot in shots {
        let start = Instant::now();
        let result = solver.solve(shot);
        // same wall-clock span as the batch mode
        let elapsed = start.elapsed();
        outcomes.push(ShotOutcome { elapsed, result });
        solver.clear();
    }
    Ok(outcomes)
}
