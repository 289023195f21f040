//! Serializer for the text graph format read by `parser::parse_graph`.

use anyhow::{Context, Result};
use mwpm_core::DecodingGraph;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

/// Renders `graph` in the text format. Virtual vertices are listed eight
/// per line.
pub fn write_graph(graph: &DecodingGraph) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "vertices {}", graph.vertex_num());
    if let Some(n) = graph.round_vertex_num() {
        let _ = writeln!(out, "round_vertices {}", n);
    }
    for chunk in graph.virtual_vertices().chunks(8) {
        let list: Vec<String> = chunk.iter().map(|v| v.to_string()).collect();
        let _ = writeln!(out, "virtual {}", list.join(" "));
    }
    for edge in &graph.edges {
        let _ = writeln!(out, "edge {} {} {}", edge.u, edge.v, edge.weight);
    }
    out
}

pub fn save_graph_file<P: AsRef<Path>>(path: P, graph: &DecodingGraph) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, write_graph(graph)).with_context(|| format!("failed to write {}", path.display()))
}
