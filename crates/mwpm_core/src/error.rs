//! Error types for the partitioned matching solver.

use mwpm_common::{VertexIndex, Weight};
use thiserror::Error;

/// Coarse classification of a failure, used by callers to decide whether a
/// retry, a fix to the input, or a restart is needed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rejected before any solving started.
    Configuration,
    /// The graph or syndrome cannot be matched as given.
    Structural,
    /// Worker or synchronization failure. The solver instance is unusable.
    Resource,
    /// The caller asked to stop.
    Cancelled,
}

/// Main error type for the solver crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MwpmError {
    /// Invalid partition, thread or streaming parameters.
    #[error("configuration error: {0}")]
    Config(String),

    /// A vertex id does not exist in the graph.
    #[error("vertex {vertex} out of bounds (graph has {vertex_num} vertices)")]
    VertexOutOfBounds {
        vertex: VertexIndex,
        vertex_num: usize,
    },

    /// Edge rejected while building the graph.
    #[error("invalid edge ({u}, {v}) with weight {weight}: {reason}")]
    InvalidEdge {
        u: VertexIndex,
        v: VertexIndex,
        weight: Weight,
        reason: &'static str,
    },

    /// Defects must be real detectors, never boundary vertices.
    #[error("defect vertex {vertex} is a virtual vertex")]
    DefectOnVirtual { vertex: VertexIndex },

    #[error("defect vertex {vertex} listed twice")]
    DuplicateDefect { vertex: VertexIndex },

    /// An alternating tree ran out of events: the defects reachable from
    /// `vertex` inside `unit` have odd count and no boundary to escape to.
    #[error("no perfect matching: unit {unit} cannot match vertex {vertex}")]
    NoPerfectMatching { unit: usize, vertex: VertexIndex },

    /// A unit finished without every defect matched.
    #[error("unit {unit} left vertex {vertex} unmatched")]
    Unresolved { unit: usize, vertex: VertexIndex },

    #[error("solve aborted")]
    Aborted,

    /// A worker panicked or a synchronization primitive failed.
    #[error("worker failure: {0}")]
    WorkerFailure(String),
}

impl MwpmError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            MwpmError::Config(_) => ErrorCategory::Configuration,
            MwpmError::VertexOutOfBounds { .. }
            | MwpmError::InvalidEdge { .. }
            | MwpmError::DefectOnVirtual { .. }
            | MwpmError::DuplicateDefect { .. }
            | MwpmError::NoPerfectMatching { .. }
            | MwpmError::Unresolved { .. } => ErrorCategory::Structural,
            MwpmError::WorkerFailure(_) => ErrorCategory::Resource,
            MwpmError::Aborted => ErrorCategory::Cancelled,
        }
    }

    /// True when the solver instance must be rebuilt after this error.
    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::Resource
    }
}

/// Convenience result alias for the solver crate.
pub type Result<T> = std::result::Result<T, MwpmError>;
