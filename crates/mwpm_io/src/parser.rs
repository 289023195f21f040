//! Parsers for decoding graph descriptions.
//!
//! The text format is one directive per line, `#` starts a comment:
//!
//! ```text
//! vertices 12
//! round_vertices 6
//! virtual 4 5 10 11
//! edge 0 1 2
//! ```
//!
//! `vertices` must come first. `round_vertices` declares a round-major
//! layout and is optional. Weights are non-negative integers.
//!
//! Stim detector error models are imported by mapping each detector to a
//! vertex of the same index. Errors that flip a single detector become edges
//! to one virtual vertex appended after the last detector.

use anyhow::{Context, Result, anyhow, bail};
use mwpm_core::{DecodingGraph, VertexIndex, Weight};
use nom::IResult;
use nom::branch::alt;
use nom::bytes::complete::{is_not, tag};
use nom::character::complete::{char, digit1, space0, space1};
use nom::combinator::{map, map_res, opt, recognize, rest};
use nom::multi::{many0, separated_list1};
use nom::number::complete::double;
use nom::sequence::{delimited, pair, preceded, terminated, tuple};
use std::fs;
use std::path::Path;
use tracing::debug;

#[derive(Debug, PartialEq)]
enum Directive {
    Vertices(usize),
    RoundVertices(usize),
    Virtual(Vec<VertexIndex>),
    Edge(VertexIndex, VertexIndex, Weight),
}

fn decimal(input: &str) -> IResult<&str, usize> {
    map_res(digit1, str::parse)(input)
}

fn signed(input: &str) -> IResult<&str, Weight> {
    map_res(recognize(pair(opt(char('-')), digit1)), str::parse)(input)
}

fn keyword<'a>(name: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(tag(name), space1)
}

fn directive(input: &str) -> IResult<&str, Directive> {
    alt((
        map(preceded(keyword("vertices"), decimal), Directive::Vertices),
        map(preceded(keyword("round_vertices"), decimal), Directive::RoundVertices),
        map(
            preceded(keyword("virtual"), separated_list1(space1, decimal)),
            Directive::Virtual,
        ),
        map(
            tuple((
                preceded(keyword("edge"), decimal),
                preceded(space1, decimal),
                preceded(space1, signed),
            )),
            |(u, v, w)| Directive::Edge(u, v, w),
        ),
    ))(input)
}

/// Drops the comment and surrounding whitespace; `None` for blank lines.
fn content(line: &str) -> Option<&str> {
    let text = line.split('#').next().unwrap_or("").trim();
    (!text.is_empty()).then_some(text)
}

fn parse_line<'a, T>(
    number: usize,
    text: &'a str,
    parser: impl FnMut(&'a str) -> IResult<&'a str, T>,
) -> Result<T> {
    let (remaining, value) = delimited(space0, parser, space0)(text)
        .map_err(|e| anyhow!("line {}: cannot parse `{}`: {}", number, text, e))?;
    if !remaining.is_empty() {
        bail!("line {}: unexpected trailing input `{}`", number, remaining);
    }
    Ok(value)
}

fn apply(graph: &mut DecodingGraph, directive: Directive) -> mwpm_core::Result<()> {
    match directive {
        Directive::RoundVertices(n) => graph.set_round_vertex_num(n),
        Directive::Virtual(vertices) => vertices.into_iter().try_for_each(|v| graph.set_virtual(v)),
        Directive::Edge(u, v, w) => graph.add_edge(u, v, w).map(|_| ()),
        Directive::Vertices(_) => Ok(()),
    }
}

/// Parses a graph in the text format and builds its adjacency.
pub fn parse_graph(text: &str) -> Result<DecodingGraph> {
    let mut graph: Option<DecodingGraph> = None;
    for (index, line) in text.lines().enumerate() {
        let number = index + 1;
        let Some(body) = content(line) else {
            continue;
        };
        match parse_line(number, body, directive)? {
            Directive::Vertices(n) => {
                if graph.is_some() {
                    bail!("line {}: `vertices` given twice", number);
                }
                graph = Some(DecodingGraph::new(n));
            }
            other => {
                let g = graph
                    .as_mut()
                    .ok_or_else(|| anyhow!("line {}: `vertices` must come first", number))?;
                apply(g, other).with_context(|| format!("line {}", number))?;
            }
        }
    }
    let mut graph = graph.ok_or_else(|| anyhow!("graph has no `vertices` line"))?;
    graph.build_adjacency();
    Ok(graph)
}

/// Loads a graph from a text-format file.
pub fn load_graph_file<P: AsRef<Path>>(path: P) -> Result<DecodingGraph> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read graph file {}", path.display()))?;
    parse_graph(&text).with_context(|| format!("invalid graph file {}", path.display()))
}

// ----------------------------------------------------------------------------
// Stim detector error models
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq)]
enum Target {
    Detector(usize),
    Logical(usize),
    Separator,
}

#[derive(Debug, PartialEq)]
enum DemLine {
    Error(f64, Vec<Target>),
    Detector(usize),
    Other,
}

fn target(input: &str) -> IResult<&str, Target> {
    alt((
        map(preceded(char('D'), decimal), Target::Detector),
        map(preceded(char('L'), decimal), Target::Logical),
        map(char('^'), |_| Target::Separator),
    ))(input)
}

fn dem_line(input: &str) -> IResult<&str, DemLine> {
    alt((
        map(
            pair(
                delimited(tag("error("), double, char(')')),
                many0(preceded(space1, target)),
            ),
            |(p, targets)| DemLine::Error(p, targets),
        ),
        map(
            preceded(
                pair(tag("detector"), opt(delimited(char('('), is_not(")"), char(')')))),
                preceded(space1, preceded(char('D'), decimal)),
            ),
            DemLine::Detector,
        ),
        map(rest, |_| DemLine::Other),
    ))(input)
}

/// Converts an error probability to an integer edge weight.
///
/// `None` for a probability of zero, which never happens and so adds no edge.
pub fn probability_to_weight(p: f64) -> Option<Weight> {
    if p <= 0.0 {
        return None;
    }
    if p >= 0.5 {
        return Some(0);
    }
    Some((100.0 * ((1.0 - p) / p).ln()).round() as Weight)
}

/// Parses a Stim detector error model.
///
/// Decomposed errors (`^` separated) contribute one edge per component.
/// Components touching more than two detectors are chained pairwise.
pub fn parse_dem(text: &str) -> Result<DecodingGraph> {
    let mut detector_num = 0usize;
    let mut edges: Vec<(usize, Option<usize>, Weight)> = Vec::new();
    let mut skipped = 0usize;

    for (index, line) in text.lines().enumerate() {
        let number = index + 1;
        let Some(body) = content(line) else {
            continue;
        };
        match parse_line(number, body, dem_line)? {
            DemLine::Detector(d) => detector_num = detector_num.max(d + 1),
            DemLine::Other if body.starts_with("error") => {
                bail!("line {}: malformed error instruction `{}`", number, body);
            }
            DemLine::Other => skipped += 1,
            DemLine::Error(p, targets) => {
                if !(0.0..=1.0).contains(&p) {
                    bail!("line {}: probability {} out of range", number, p);
                }
                let Some(weight) = probability_to_weight(p) else {
                    continue;
                };
                for component in targets.split(|t| *t == Target::Separator) {
                    let detectors: Vec<usize> = component
                        .iter()
                        .filter_map(|t| match t {
                            Target::Detector(d) => Some(*d),
                            Target::Logical(_) | Target::Separator => None,
                        })
                        .collect();
                    for &d in &detectors {
                        detector_num = detector_num.max(d + 1);
                    }
                    match detectors.as_slice() {
                        [] => {}
                        [single] => edges.push((*single, None, weight)),
                        chain => {
                            for pair in chain.windows(2) {
                                edges.push((pair[0], Some(pair[1]), weight));
                            }
                        }
                    }
                }
            }
        }
    }

    let boundary = detector_num;
    let mut graph = DecodingGraph::new(detector_num + 1);
    graph.set_virtual(boundary)?;
    for (u, v, w) in edges {
        let v = v.unwrap_or(boundary);
        if u == v {
            continue;
        }
        graph.add_edge(u, v, w)?;
    }
    graph.build_adjacency();
    debug!(
        detectors = detector_num,
        edges = graph.edge_num(),
        skipped,
        "detector error model imported"
    );
    Ok(graph)
}

/// Loads a Stim .dem file.
pub fn load_dem_file<P: AsRef<Path>>(path: P) -> Result<DecodingGraph> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).context("Failed to open .dem file")?;
    parse_dem(&text).with_context(|| format!("invalid detector error model {}", path.display()))
}
