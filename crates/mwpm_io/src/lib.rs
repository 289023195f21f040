//! I/O utilities for decoding graphs and syndrome files.
//!
//! Reads and writes the plain-text graph format used by the `mwpm` tool,
//! imports Stim detector error models, and converts bit-packed syndrome
//! shots into defect lists for the solver.

/// Bit-packed syndrome shots (.b8 files).
///
/// Shots are stored back to back, each padded to a whole number of bytes,
/// bits in least-significant-first order. Loading yields one sorted defect
/// list per shot; saving performs the reverse packing.
pub mod loader;

/// Parsers for the text graph format and Stim .dem files.
///
/// Both parsers are line oriented and built from `nom` combinators. Errors
/// carry the offending line number.
pub mod parser;

/// Serializer for the text graph format.
pub mod writer;
