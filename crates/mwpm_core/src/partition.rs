//! Partitioner: cuts the graph into leaves and arranges them in a fusion tree.
//!
//! Leaves are contiguous vertex ranges along the segment axis (measurement
//! rounds when the graph has a round layout). Units are numbered leaves first,
//! then fusion nodes in post order, so every fusion node comes after both of
//! its children and the last unit is the root.

use crate::config::{PartitionConfig, PartitionSettings, PartitionStrategy};
use crate::error::{MwpmError, Result};
use crate::graph::DecodingGraph;
use mwpm_common::{EdgeIndex, VertexIndex, VertexRange};
use tracing::debug;

/// Sorted, merged list of vertex ranges owned by a unit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OwnedRanges(Vec<VertexRange>);

impl OwnedRanges {
    pub fn single(range: VertexRange) -> Self {
        Self(vec![range])
    }

    /// Union of two disjoint range sets, adjacent runs merged.
    pub fn union(&self, other: &OwnedRanges) -> Self {
        let mut all: Vec<VertexRange> = self.0.iter().chain(other.0.iter()).copied().collect();
        all.sort_unstable();
        let mut merged: Vec<VertexRange> = Vec::with_capacity(all.len());
        for range in all {
            match merged.last_mut() {
                Some(last) if last.end == range.start => last.end = range.end,
                _ => merged.push(range),
            }
        }
        Self(merged)
    }

    #[inline]
    pub fn contains(&self, vertex: VertexIndex) -> bool {
        self.0.iter().any(|r| r.contains(vertex))
    }

    pub fn ranges(&self) -> &[VertexRange] {
        &self.0
    }

    pub fn vertex_num(&self) -> usize {
        self.0.iter().map(|r| r.len()).sum()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitKind {
    Leaf(VertexRange),
    Fusion { left: usize, right: usize },
}

/// One node of the fusion tree.
#[derive(Clone, Debug)]
pub struct FusionUnit {
    pub kind: UnitKind,
    pub owned: OwnedRanges,
    pub parent: Option<usize>,

    /// Owned vertices with at least one edge leaving the unit.
    pub boundary_vertices: Vec<VertexIndex>,

    /// For fusion nodes: edges joining the two children. Empty for leaves.
    pub boundary_edges: Vec<EdgeIndex>,
}

impl FusionUnit {
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, UnitKind::Leaf(_))
    }
}

/// Leaves plus fusion nodes, built once per graph.
#[derive(Clone, Debug)]
pub struct FusionTree {
    units: Vec<FusionUnit>,
    leaf_num: usize,
    /// Leaf id of every vertex.
    owner: Vec<usize>,
}

impl FusionTree {
    /// Builds the tree for `graph` according to `settings`.
    pub fn build(graph: &DecodingGraph, settings: &PartitionSettings) -> Result<Self> {
        let (leaves, fusions) = match &settings.strategy {
            PartitionStrategy::Manual(config) => {
                validate_manual(graph, config)?;
                (config.partitions.clone(), config.fusions.clone())
            }
            PartitionStrategy::None => {
                let leaves = split_segments(graph, 1, settings.maximum_tree_leaf_size)?;
                let fusions = fusion_order(leaves.len(), settings.enable_tree_fusion);
                (leaves, fusions)
            }
            PartitionStrategy::TimeAxis => {
                let leaves = split_segments(
                    graph,
                    settings.partition_num,
                    settings.maximum_tree_leaf_size,
                )?;
                let fusions = fusion_order(leaves.len(), settings.enable_tree_fusion);
                (leaves, fusions)
            }
        };

        let tree = Self::assemble(graph, leaves, &fusions)?;
        debug!(
            leaves = tree.leaf_num,
            units = tree.units.len(),
            "fusion tree built"
        );
        Ok(tree)
    }

    fn assemble(
        graph: &DecodingGraph,
        leaves: Vec<VertexRange>,
        fusions: &[(usize, usize)],
    ) -> Result<Self> {
        let leaf_num = leaves.len();
        let mut units: Vec<FusionUnit> = leaves
            .iter()
            .map(|&range| FusionUnit {
                kind: UnitKind::Leaf(range),
                owned: OwnedRanges::single(range),
                parent: None,
                boundary_vertices: Vec::new(),
                boundary_edges: Vec::new(),
            })
            .collect();

        for &(left, right) in fusions {
            let id = units.len();
            let owned = units[left].owned.union(&units[right].owned);
            units[left].parent = Some(id);
            units[right].parent = Some(id);
            units.push(FusionUnit {
                kind: UnitKind::Fusion { left, right },
                owned,
                parent: None,
                boundary_vertices: Vec::new(),
                boundary_edges: Vec::new(),
            });
        }

        let mut owner = vec![0usize; graph.vertex_num()];
        for (leaf, range) in leaves.iter().enumerate() {
            for v in range.iter() {
                owner[v] = leaf;
            }
        }

        let mut tree = Self {
            units,
            leaf_num,
            owner,
        };
        tree.collect_boundaries(graph);
        Ok(tree)
    }

    /// Fills boundary vertex and edge lists by walking each crossing edge up
    /// to the fusion node that joins its two leaves.
    fn collect_boundaries(&mut self, graph: &DecodingGraph) {
        let depth = self.depths();
        for (index, edge) in graph.edges.iter().enumerate() {
            let mut a = self.owner[edge.u];
            let mut b = self.owner[edge.v];
            if a == b {
                continue;
            }
            while a != b {
                let (deeper, vertex) = if depth[a] >= depth[b] {
                    (&mut a, edge.u)
                } else {
                    (&mut b, edge.v)
                };
                self.units[*deeper].boundary_vertices.push(vertex);
                match self.units[*deeper].parent {
                    Some(parent) => *deeper = parent,
                    None => break,
                }
            }
            if a == b {
                self.units[a].boundary_edges.push(index);
            }
        }
        for unit in self.units.iter_mut() {
            unit.boundary_vertices.sort_unstable();
            unit.boundary_vertices.dedup();
        }
    }

    fn depths(&self) -> Vec<usize> {
        let mut depth = vec![0usize; self.units.len()];
        for id in (0..self.units.len()).rev() {
            if let Some(parent) = self.units[id].parent {
                depth[id] = depth[parent] + 1;
            }
        }
        depth
    }

    pub fn units(&self) -> &[FusionUnit] {
        &self.units
    }

    pub fn unit(&self, id: usize) -> &FusionUnit {
        &self.units[id]
    }

    pub fn unit_num(&self) -> usize {
        self.units.len()
    }

    pub fn leaf_num(&self) -> usize {
        self.leaf_num
    }

    /// The root unit, always the last one.
    pub fn root(&self) -> usize {
        self.units.len() - 1
    }

    pub fn leaf_of(&self, vertex: VertexIndex) -> usize {
        self.owner[vertex]
    }

    /// Distributes sorted defects to their leaves, keeping them sorted.
    pub fn split_defects(&self, defects: &[VertexIndex]) -> Vec<Vec<VertexIndex>> {
        let mut per_leaf = vec![Vec::new(); self.leaf_num];
        for &d in defects {
            per_leaf[self.owner[d]].push(d);
        }
        per_leaf
    }

    /// Last round covered by `leaf`; the leaf can start once it arrives.
    pub fn leaf_last_round(&self, graph: &DecodingGraph, leaf: usize) -> Option<usize> {
        match self.units[leaf].kind {
            UnitKind::Leaf(range) if !range.is_empty() => graph.round_of(range.end - 1),
            _ => None,
        }
    }
}

/// Cuts the segment axis into `partition_num` even groups, then halves any
/// group longer than `ceiling` segments.
fn split_segments(
    graph: &DecodingGraph,
    partition_num: usize,
    ceiling: Option<usize>,
) -> Result<Vec<VertexRange>> {
    let segments = graph.segments();
    if partition_num == 0 {
        return Err(MwpmError::Config("partition_num must be at least 1".into()));
    }
    if segments.is_empty() {
        return Err(MwpmError::Config("graph has no vertices to partition".into()));
    }
    if partition_num > segments.len() {
        return Err(MwpmError::Config(format!(
            "partition_num {} exceeds {} addressable segments",
            partition_num,
            segments.len()
        )));
    }
    if ceiling == Some(0) {
        return Err(MwpmError::Config("maximum_tree_leaf_size must be at least 1".into()));
    }

    let total = segments.len();
    let mut groups = Vec::with_capacity(partition_num);
    for i in 0..partition_num {
        groups.push((i * total / partition_num, (i + 1) * total / partition_num));
    }

    let mut leaves = Vec::new();
    for (lo, hi) in groups {
        halve_until(lo, hi, ceiling.unwrap_or(usize::MAX), &mut leaves);
    }

    Ok(leaves
        .into_iter()
        .map(|(lo, hi)| VertexRange::new(segments[lo].start, segments[hi - 1].end))
        .collect())
}

fn halve_until(lo: usize, hi: usize, ceiling: usize, out: &mut Vec<(usize, usize)>) {
    if hi - lo <= ceiling {
        out.push((lo, hi));
        return;
    }
    let mid = lo + (hi - lo) / 2;
    halve_until(lo, mid, ceiling, out);
    halve_until(mid, hi, ceiling, out);
}

/// Fusion list over `leaf_num` adjacent leaves, in post order.
fn fusion_order(leaf_num: usize, tree: bool) -> Vec<(usize, usize)> {
    let mut fusions = Vec::with_capacity(leaf_num.saturating_sub(1));
    if tree {
        fn balanced(lo: usize, hi: usize, leaf_num: usize, out: &mut Vec<(usize, usize)>) -> usize {
            if hi - lo == 1 {
                return lo;
            }
            let mid = lo + (hi - lo) / 2;
            let left = balanced(lo, mid, leaf_num, out);
            let right = balanced(mid, hi, leaf_num, out);
            out.push((left, right));
            leaf_num + out.len() - 1
        }
        if leaf_num > 0 {
            balanced(0, leaf_num, leaf_num, &mut fusions);
        }
    } else {
        let mut acc = 0;
        for leaf in 1..leaf_num {
            fusions.push((acc, leaf));
            acc = leaf_num + fusions.len() - 1;
        }
    }
    fusions
}

fn validate_manual(graph: &DecodingGraph, config: &PartitionConfig) -> Result<()> {
    let vertex_num = graph.vertex_num();
    if config.partitions.is_empty() {
        return Err(MwpmError::Config("manual layout has no partitions".into()));
    }
    let mut sorted = config.partitions.clone();
    sorted.sort_unstable();
    let mut cursor = 0;
    for range in &sorted {
        if range.is_empty() {
            return Err(MwpmError::Config(format!("partition {} has no vertices", range)));
        }
        if range.end > vertex_num {
            return Err(MwpmError::Config(format!(
                "partition {} exceeds vertex count {}",
                range, vertex_num
            )));
        }
        if range.start < cursor {
            return Err(MwpmError::Config(format!("partition {} overlaps another", range)));
        }
        if range.start > cursor {
            return Err(MwpmError::Config(format!(
                "vertices [{}, {}) belong to no partition",
                cursor, range.start
            )));
        }
        cursor = range.end;
    }
    if cursor != vertex_num {
        return Err(MwpmError::Config(format!(
            "vertices [{}, {}) belong to no partition",
            cursor, vertex_num
        )));
    }

    let leaf_num = config.partitions.len();
    let unit_num = leaf_num + config.fusions.len();
    let mut used = vec![false; unit_num];
    for (i, &(left, right)) in config.fusions.iter().enumerate() {
        let id = leaf_num + i;
        for child in [left, right] {
            if child >= id {
                return Err(MwpmError::Config(format!(
                    "fusion {} references unit {} that is not built yet",
                    id, child
                )));
            }
            if used[child] {
                return Err(MwpmError::Config(format!("unit {} is fused twice", child)));
            }
            used[child] = true;
        }
        if left == right {
            return Err(MwpmError::Config(format!("fusion {} joins unit {} with itself", id, left)));
        }
    }
    let roots = used.iter().filter(|u| !**u).count();
    if roots != 1 {
        return Err(MwpmError::Config(format!(
            "fusion list leaves {} unfused units, expected exactly one root",
            roots
        )));
    }
    Ok(())
}
