//! Partitioned minimum-weight perfect matching for syndrome decoding.
//!
//! This crate splits a decoding graph into leaves along its round axis,
//! matches every leaf independently on a pool of worker threads, and fuses
//! sibling results up a binary tree until the root holds one globally
//! minimum-weight matching. A streaming front end replays syndromes at a
//! fixed round cadence and reports when decoding falls behind.

/// Packed bit flags over `u64` words.
///
/// Used for the per-vertex virtual flags of the decoding graph, where one
/// bit per vertex keeps the flag array small enough to stay in cache during
/// path searches.
pub mod bit_utils;

/// Serde-backed configuration for partitioning, the worker pool and the
/// streaming controller.
///
/// All structs reject unknown keys and fill missing ones with defaults.
/// Legacy key names from older benchmark scripts are folded into the
/// current fields by `SolverConfig::validate`.
pub mod config;

/// Error type and failure categories for the solver.
pub mod error;

/// Fusion of two solved sibling units.
///
/// Merges the children's node arenas by index offset, releases defects that
/// were waiting on an edge joining the two children, and restarts the
/// alternating-tree search from those defects only.
pub mod fusion;

/// Decoding graph: vertices, weighted edges and virtual boundary flags.
///
/// Built once per decoding instance and read-only afterwards. The
/// compressed adjacency list is shared by all worker threads without
/// locking.
pub mod graph;

/// Leaf layout and fusion tree construction.
///
/// Cuts the graph into contiguous vertex ranges along its segment axis,
/// arranges them in a balanced binary tree (or a chain), and records for
/// every fusion node the edges that join its two children.
pub mod partition;

/// Persistent worker pool with separate leaf and fusion queues.
///
/// Applies the interleaving rule between leaf and fusion jobs, supports
/// spin and blocking waits, and optionally pins each worker to a core.
pub mod pool;

/// Alternating-tree matching with blossom shrinking over one unit.
///
/// Defects may be matched to one another, to a virtual vertex, or to the
/// midpoint of an edge leaving the unit. Midpoint matches are the
/// boundary obligations a later fusion revisits.
pub mod primal_dual;

/// Spinlock and a cell type that switches between spin and blocking
/// locking at construction time.
pub mod smp;

/// Parallel solver driving the fusion tree on the worker pool.
///
/// Owns the graph, the tree and the pool. Handles join barriers between
/// children and parents, cancellation, worker failures and per-solve
/// timing.
pub mod solver;

/// Round-paced replay of a syndrome with deadline monitoring.
pub mod streaming;

pub use config::{
    PartitionConfig, PartitionSettings, PartitionStrategy, SolverConfig, StreamConfig, SyncStyle,
};
pub use error::{ErrorCategory, MwpmError, Result};
pub use graph::{DecodingGraph, Edge};
pub use partition::{FusionTree, FusionUnit, OwnedRanges, UnitKind};
pub use primal_dual::{Escape, PendingBoundary, PrimalDualUnit, WEIGHT_SCALE};
pub use solver::{CancelHandle, ParallelSolver, SolveProfile, solve_sequential};
pub use streaming::{DeadlineViolation, StreamMonitor, StreamReport};

pub use mwpm_common::{EdgeIndex, PerfectMatching, VertexIndex, VertexRange, Weight};
