mod generator;
mod profiler;
mod stats;
mod stream;
mod throughput;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mwpm_core::{DecodingGraph, PartitionSettings, SolverConfig};
use mwpm_io::parser;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "mwpm", about = "Partitioned parallel MWPM decoder")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Graph and solver options shared by `run` and `stream`.
#[derive(Args)]
struct DecoderArgs {
    /// Text graph, or a Stim detector error model when the extension is `.dem`.
    #[arg(short, long)]
    graph: PathBuf,
    /// Overrides the round layout of the loaded graph.
    #[arg(long)]
    round_vertices: Option<usize>,
    /// Detectors per shot in the .b8 file. Defaults to the graph's detector count.
    #[arg(long)]
    detectors: Option<usize>,
    /// Partition settings as inline JSON or `@file.json`.
    #[arg(long)]
    partition_config: Option<String>,
    /// Solver settings as inline JSON or `@file.json`.
    #[arg(long)]
    solver_config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Writes a noisy repetition code graph and sampled syndrome shots.
    Gen {
        #[arg(long, default_value = "bench.graph")]
        graph: PathBuf,
        #[arg(long, default_value = "bench.b8")]
        b8: PathBuf,
        #[arg(short = 'd', long, default_value_t = 11)]
        distance: usize,
        #[arg(long, default_value_t = 100)]
        rounds: usize,
        #[arg(long, default_value_t = 10_000)]
        shots: usize,
        #[arg(long, default_value_t = 0.005)]
        p: f64,
        #[arg(long, default_value_t = 12345)]
        seed: u64,
    },
    /// Decodes every shot of a .b8 file and reports latency.
    Run {
        #[command(flatten)]
        decoder: DecoderArgs,
        #[arg(short, long)]
        b8: PathBuf,
        /// Decode shots in parallel with rayon, one sequential fusion tree per shot.
        #[arg(long)]
        batch: bool,
        /// Writes per-shot records and a summary as JSON lines.
        #[arg(long)]
        profile_output: Option<PathBuf>,
    },
    /// Replays one shot round by round at a fixed cadence.
    Stream {
        #[command(flatten)]
        decoder: DecoderArgs,
        #[arg(short, long)]
        b8: Option<PathBuf>,
        #[arg(long, default_value_t = 0)]
        shot: usize,
        /// Round rate in Hz; overrides the configured measure interval.
        #[arg(short, long)]
        freq: Option<u64>,
    },
}

/// Graph loaded for decoding plus the number of detector bits per shot.
pub struct LoadedGraph {
    pub graph: DecodingGraph,
    pub detector_num: usize,
}

impl DecoderArgs {
    fn load_graph(&self) -> Result<LoadedGraph> {
        let is_dem = self.graph.extension().is_some_and(|ext| ext == "dem");
        let mut graph = if is_dem {
            parser::load_dem_file(&self.graph)?
        } else {
            parser::load_graph_file(&self.graph)?
        };
        if let Some(n) = self.round_vertices {
            graph
                .set_round_vertex_num(n)
                .context("invalid --round-vertices")?;
        }
        // the appended boundary vertex of a .dem import carries no detector bit
        let default_detectors = if is_dem {
            graph.vertex_num() - 1
        } else {
            graph.vertex_num()
        };
        Ok(LoadedGraph {
            detector_num: self.detectors.unwrap_or(default_detectors),
            graph,
        })
    }

    fn partition_settings(&self) -> Result<PartitionSettings> {
        match &self.partition_config {
            Some(arg) => {
                let text = config_text(arg)?;
                PartitionSettings::from_json(&text).context("invalid --partition-config")
            }
            None => Ok(PartitionSettings::default()),
        }
    }

    fn solver_config(&self) -> Result<SolverConfig> {
        match &self.solver_config {
            Some(arg) => {
                let text = config_text(arg)?;
                SolverConfig::from_json(&text).context("invalid --solver-config")
            }
            None => Ok(SolverConfig::default()),
        }
    }
}

/// Inline JSON, or the contents of the file named after a leading `@`.
fn config_text(arg: &str) -> Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => fs::read_to_string(Path::new(path))
            .with_context(|| format!("failed to read config file {}", path)),
        None => Ok(arg.to_string()),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mwpm_host=info,mwpm_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Gen {
            graph,
            b8,
            distance,
            rounds,
            shots,
            p,
            seed,
        } => {
            let code = generator::RepetitionCode { distance, rounds, p };
            generator::generate_repetition_data(&code, &graph, &b8, shots, seed)?;
        }
        Commands::Run {
            decoder,
            b8,
            batch,
            profile_output,
        } => {
            let loaded = decoder.load_graph()?;
            let options = throughput::RunOptions {
                partition: decoder.partition_settings()?,
                solver: decoder.solver_config()?,
                batch,
                profile_output,
            };
            throughput::run_benchmark(loaded, &b8, &options)?;
        }
        Commands::Stream {
            decoder,
            b8,
            shot,
            freq,
        } => {
            let loaded = decoder.load_graph()?;
            let partition = decoder.partition_settings()?;
            let mut solver = decoder.solver_config()?;
            if let Some(hz) = freq {
                anyhow::ensure!(hz > 0, "--freq must be positive");
                solver.stream.measure_interval_ns = 1_000_000_000 / hz;
            }
            stream::run_stream(loaded, b8.as_deref(), shot, &partition, solver)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_text_reads_inline_and_files() {
        assert_eq!(config_text(r#"{"partition_num":2}"#).unwrap(), r#"{"partition_num":2}"#);

        let path = std::env::temp_dir().join(format!("mwpm_host_config_{}.json", std::process::id()));
        fs::write(&path, r#"{"thread_pool_size":2}"#).unwrap();
        let text = config_text(&format!("@{}", path.display())).unwrap();
        assert_eq!(SolverConfig::from_json(&text).unwrap().thread_pool_size, 2);
        let _ = fs::remove_file(&path);

        assert!(config_text("@/nonexistent/mwpm.json").is_err());
    }

    #[test]
    fn cli_parses_run_arguments() {
        let cli = Cli::try_parse_from([
            "mwpm",
            "run",
            "--graph",
            "g.dem",
            "--b8",
            "s.b8",
            "--batch",
            "--partition-config",
            r#"{"partition_num":4}"#,
        ])
        .unwrap();
        let Commands::Run { decoder, batch, .. } = cli.command else {
            panic!("expected run");
        };
        assert!(batch);
        assert_eq!(decoder.partition_settings().unwrap().partition_num, 4);
        assert_eq!(decoder.solver_config().unwrap(), SolverConfig::default());
    }
}
