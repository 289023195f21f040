use crate::LoadedGraph;
use crate::stats::LatencyStats;
use anyhow::{Result, anyhow};
use mwpm_core::{ParallelSolver, PartitionSettings, SolverConfig};
use mwpm_io::loader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Streams shot `shot` of `b8_path` (or an empty syndrome) through the
/// solver at the configured round cadence.
pub fn run_stream(
    loaded: LoadedGraph,
    b8_path: Option<&Path>,
    shot: usize,
    partition: &PartitionSettings,
    config: SolverConfig,
) -> Result<()> {
    let LoadedGraph {
        graph,
        detector_num,
    } = loaded;
    let defects = match b8_path {
        Some(path) => {
            let raw_bits = loader::load_b8_file(path)?;
            let mut shots = loader::slice_shots(&raw_bits, detector_num)?;
            let shot_num = shots.len();
            if shot >= shot_num {
                return Err(anyhow!("shot {} requested, file holds {}", shot, shot_num));
            }
            shots.swap_remove(shot)
        }
        None => Vec::new(),
    };

    let interval = config.stream.measure_interval();
    let mut solver = ParallelSolver::new(Arc::new(graph), partition, config)?;
    info!(
        shot,
        defects = defects.len(),
        leaves = solver.fusion_tree().leaf_num(),
        ?interval,
        "streaming"
    );
    let report = solver.solve_streaming(&defects)?;

    println!("Stream finished in {:?}", report.total);
    println!(
        "Matching: weight {}, {} peer pairs, {} boundary matches",
        report.matching.weight,
        report.matching.peer_matchings.len(),
        report.matching.virtual_matchings.len()
    );
    if report.violations.is_empty() {
        println!("No deadline violations.");
    } else {
        println!("Deadline violations: {}", report.violations.len());
        for v in &report.violations {
            println!(
                "  at {:?}: round {} (released at round {}) undecoded when round {} arrived (backlog {})",
                v.at, v.round, v.released_round, v.arrived_round, v.backlog
            );
        }
    }

    let mut stats = LatencyStats::new(interval.max(Duration::from_micros(10)));
    for latency in &report.round_latencies {
        stats.update(*latency);
    }
    stats.print_report("Round Latency (arrival to decoded)");
    Ok(())
}
