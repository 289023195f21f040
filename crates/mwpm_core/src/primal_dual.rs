//! Primal-dual unit: alternating-tree growth with blossom shrinking over the
//! defects owned by one unit of the fusion tree.
//!
//! The unit works on the defect graph of its owned vertices. The distance
//! between two defects is the shortest path that stays inside the unit and
//! does not pass through a virtual vertex. Besides other defects, a defect
//! may be matched to an *escape*: a virtual vertex inside the unit, or the
//! midpoint of an edge that leaves the unit. Midpoint escapes are the pending
//! boundary obligations that a later fusion revisits.
//!
//! All weights are multiplied by [`WEIGHT_SCALE`] internally. With the factor
//! of four every midpoint and every dual step stays integral, so duals are
//! plain integers and ties compare exactly.
//!
//! Nodes live in an index arena: defect `v` is node `v`, blossoms are
//! appended after the defects and recycled through a free list. Matching
//! state is kept per defect (`mates`); a node is matched through its base
//! defect.

use crate::error::{MwpmError, Result};
use crate::graph::DecodingGraph;
use crate::partition::OwnedRanges;
use mwpm_common::{EdgeIndex, PerfectMatching, VertexIndex, Weight};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tracing::trace;

/// Factor between user weights and internal dual units.
pub const WEIGHT_SCALE: Weight = 4;

const UNREACHABLE: Weight = Weight::MAX;

/// Cached distance rows above which the cache is dropped between stages.
const ROW_CACHE_LIMIT: usize = 1024;

/// A place a defect can be matched to other than another defect.
///
/// The derived order is the tie-break between equally distant escapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Escape {
    Virtual(VertexIndex),
    /// Midpoint of an edge crossing out of the unit.
    Midpoint(EdgeIndex),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Mate {
    Peer(usize),
    Escape(Escape),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Label {
    Plus,
    Minus,
}

/// Defect vertex or blossom.
#[derive(Clone, Debug)]
pub(crate) struct Node {
    /// Enclosing blossom, `None` for top-level nodes.
    pub(crate) parent: Option<usize>,
    /// Odd cycle of sub-nodes, base child first. Empty for a defect.
    pub(crate) children: Vec<usize>,
    /// `links[i]` joins a defect in `children[i]` to one in `children[i + 1]`
    /// (cyclically). Odd positions are matched.
    pub(crate) links: Vec<(usize, usize)>,
    pub(crate) base: usize,
    /// Vertex dual for a defect, blossom dual otherwise.
    pub(crate) dual: Weight,
    pub(crate) label: Option<Label>,
    /// Plus node: (its base, base of the minus parent).
    /// Minus node: (entry defect, plus defect it was reached from).
    pub(crate) tree_link: Option<(usize, usize)>,
    pub(crate) alive: bool,
}

impl Node {
    fn vertex(v: usize) -> Self {
        Self {
            parent: None,
            children: Vec::new(),
            links: Vec::new(),
            base: v,
            dual: 0,
            label: None,
            tree_link: None,
            alive: true,
        }
    }
}

/// Shortest paths from one defect, restricted to the unit.
#[derive(Clone, Debug)]
struct DistanceRow {
    /// Reachable defects as `(distance, defect)`, nearest first.
    to_defect: Vec<(Weight, usize)>,
    /// Cheapest escape.
    escape: Option<(Weight, Escape)>,
}

impl DistanceRow {
    fn distance_to(&self, x: usize) -> Option<Weight> {
        self.to_defect.iter().find(|&&(_, y)| y == x).map(|&(d, _)| d)
    }
}

#[derive(Clone, Copy, Debug)]
enum Event {
    /// Tight edge to an unlabeled node.
    Touch { from: usize, to: usize },
    /// Tight edge between two plus nodes of the tree.
    Cycle { from: usize, to: usize },
    Escape { from: usize, escape: Escape },
    /// Minus blossom whose dual reached zero.
    Expand { blossom: usize },
}

/// Dual step, scan position and event of the best candidate so far.
type Candidate = (Weight, (usize, usize), Event);

/// Keeps the smallest step; equal steps go to the earlier scan position.
fn offer(best: &mut Option<Candidate>, delta: Weight, key: (usize, usize), event: Event) {
    let better = match *best {
        Some((d, k, _)) => (delta, key) < (d, k),
        None => true,
    };
    if better {
        *best = Some((delta, key, event));
    }
}

/// A defect left matched to a crossing edge's midpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingBoundary {
    pub vertex: VertexIndex,
    pub edge: EdgeIndex,
    /// Sum of duals covering the defect, in internal units.
    pub dual: Weight,
}

/// Matching state for one unit of the fusion tree.
#[derive(Clone, Debug)]
pub struct PrimalDualUnit {
    pub(crate) unit: usize,
    pub(crate) owned: OwnedRanges,
    /// Global vertex of each local defect.
    pub(crate) defects: Vec<VertexIndex>,
    pub(crate) nodes: Vec<Node>,
    pub(crate) free_slots: Vec<usize>,
    pub(crate) mates: Vec<Option<Mate>>,
    rows: Vec<Option<DistanceRow>>,
    cached_rows: usize,
    /// Top-level node of each defect. Entries of the current tree are
    /// refreshed on every event, the rest when their top changes.
    top_of: Vec<usize>,
    /// Sum of the duals containing each defect, refreshed with `top_of`.
    cover: Vec<Weight>,
    /// Upper bound on every entry of `cover`.
    cover_bound: Weight,
    /// Defects inside labeled nodes of the current tree.
    tree: Vec<usize>,
    /// Labeled top-level nodes seen by the last event scan.
    tree_tops: Vec<usize>,
    /// Dijkstra labels by global vertex, reset after every run.
    scratch: Vec<Weight>,
}

impl PrimalDualUnit {
    /// Creates an unsolved unit. `defects` must lie inside `owned`.
    pub fn new(unit: usize, owned: OwnedRanges, defects: Vec<VertexIndex>) -> Self {
        let n = defects.len();
        Self {
            unit,
            owned,
            nodes: (0..n).map(Node::vertex).collect(),
            free_slots: Vec::new(),
            mates: vec![None; n],
            rows: vec![None; n],
            cached_rows: 0,
            top_of: (0..n).collect(),
            cover: vec![0; n],
            cover_bound: 0,
            tree: Vec::new(),
            tree_tops: Vec::new(),
            scratch: Vec::new(),
            defects,
        }
    }

    /// Assembles a unit from parts produced by a fusion. Distance rows start
    /// empty because the owned region changed.
    pub(crate) fn from_parts(
        unit: usize,
        owned: OwnedRanges,
        defects: Vec<VertexIndex>,
        nodes: Vec<Node>,
        free_slots: Vec<usize>,
        mates: Vec<Option<Mate>>,
        scratch: Vec<Weight>,
    ) -> Self {
        let n = defects.len();
        let mut fused = Self {
            unit,
            owned,
            defects,
            nodes,
            free_slots,
            mates,
            rows: vec![None; n],
            cached_rows: 0,
            top_of: vec![0; n],
            cover: vec![0; n],
            cover_bound: 0,
            tree: Vec::new(),
            tree_tops: Vec::new(),
            scratch,
        };
        for v in 0..n {
            fused.refresh(v);
        }
        fused
    }

    pub fn unit(&self) -> usize {
        self.unit
    }

    pub fn owned(&self) -> &OwnedRanges {
        &self.owned
    }

    pub fn defect_num(&self) -> usize {
        self.defects.len()
    }

    /// Distance rows currently cached.
    pub fn cached_rows(&self) -> usize {
        self.cached_rows
    }

    pub(crate) fn take_scratch(&mut self) -> Vec<Weight> {
        std::mem::take(&mut self.scratch)
    }

    /// Matches every defect of a freshly built leaf.
    pub fn solve(&mut self, graph: &DecodingGraph) -> Result<()> {
        let roots: Vec<usize> = (0..self.defects.len()).collect();
        self.resolve(graph, roots)
    }

    /// Runs one alternating-tree stage from each still-free root, in
    /// ascending global vertex order.
    pub(crate) fn resolve(&mut self, graph: &DecodingGraph, mut roots: Vec<usize>) -> Result<()> {
        roots.sort_by_key(|&v| self.defects[v]);
        for v in roots {
            let top = self.top(v);
            if self.mates[self.nodes[top].base].is_some() {
                continue;
            }
            self.grow_from(graph, top)?;
        }
        Ok(())
    }

    /// Sum of all dual variables, in internal units.
    ///
    /// Once every defect is matched this equals the matching weight times
    /// [`WEIGHT_SCALE`], which certifies optimality.
    pub fn sum_dual_variables(&self) -> Weight {
        self.nodes.iter().filter(|n| n.alive).map(|n| n.dual).sum()
    }

    /// Defects currently matched to a crossing edge's midpoint.
    pub fn pending_boundary(&self) -> Vec<PendingBoundary> {
        let mut pending = Vec::new();
        for (v, mate) in self.mates.iter().enumerate() {
            if let Some(Mate::Escape(Escape::Midpoint(edge))) = mate {
                pending.push(PendingBoundary {
                    vertex: self.defects[v],
                    edge: *edge,
                    dual: self.cover_dual(v),
                });
            }
        }
        pending.sort_by_key(|p| p.vertex);
        pending
    }

    /// Extracts the final matching. Fails if any defect is unmatched or still
    /// waiting on a crossing edge.
    pub fn perfect_matching(&mut self, graph: &DecodingGraph) -> Result<PerfectMatching> {
        let matching = self.extract_matching()?;
        if cfg!(debug_assertions) {
            self.check_tight_pairs(graph);
        }
        Ok(matching)
    }

    /// Reads the matching and its weight off the duals.
    ///
    /// Every matched pair is tight, so its cost is the sum of the duals of the
    /// nodes containing one end but not the other, and an escape costs the
    /// full cover of its defect. No shortest path is recomputed.
    pub fn extract_matching(&self) -> Result<PerfectMatching> {
        let mut matching = PerfectMatching::new();
        let mut internal: Weight = 0;
        for v in 0..self.defects.len() {
            match self.mates[v] {
                Some(Mate::Peer(x)) => {
                    if v < x {
                        internal += self.exclusive_cover(v, x) + self.exclusive_cover(x, v);
                        matching.peer_matchings.push((self.defects[v], self.defects[x]));
                    }
                }
                Some(Mate::Escape(Escape::Virtual(target))) => {
                    internal += self.cover_dual(v);
                    matching.virtual_matchings.push((self.defects[v], target));
                }
                Some(Mate::Escape(Escape::Midpoint(_))) | None => {
                    return Err(MwpmError::Unresolved {
                        unit: self.unit,
                        vertex: self.defects[v],
                    });
                }
            }
        }
        matching.weight = internal / WEIGHT_SCALE;
        matching.normalize();
        Ok(matching)
    }

    /// Compares every matched cost with a fresh shortest path.
    fn check_tight_pairs(&mut self, graph: &DecodingGraph) {
        for v in 0..self.defects.len() {
            match self.mates[v] {
                Some(Mate::Peer(x)) if v < x => {
                    let cost = self.exclusive_cover(v, x) + self.exclusive_cover(x, v);
                    let distance = self.row(graph, v).distance_to(x);
                    debug_assert_eq!(distance, Some(cost), "loose pair ({v}, {x})");
                }
                Some(Mate::Escape(Escape::Virtual(_))) => {
                    let cost = self.cover_dual(v);
                    let escape = self.row(graph, v).escape.map(|(d, _)| d);
                    debug_assert_eq!(escape, Some(cost), "loose escape of {v}");
                }
                _ => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Distances
    // ------------------------------------------------------------------

    fn row(&mut self, graph: &DecodingGraph, v: usize) -> &DistanceRow {
        let row = match self.rows[v].take() {
            Some(row) => row,
            None => {
                self.cached_rows += 1;
                self.shortest_paths(graph, v)
            }
        };
        self.rows[v].insert(row)
    }

    fn shortest_paths(&mut self, graph: &DecodingGraph, v: usize) -> DistanceRow {
        if self.scratch.len() != graph.vertex_num() {
            self.scratch = vec![UNREACHABLE; graph.vertex_num()];
        }
        let source = self.defects[v];
        let mut touched = vec![source];
        let mut heap = BinaryHeap::new();
        let mut escape: Option<(Weight, Escape)> = None;
        let mut offer_escape = |cost: Weight, candidate: Escape| {
            if escape.is_none_or(|best| (cost, candidate) < best) {
                escape = Some((cost, candidate));
            }
        };

        self.scratch[source] = 0;
        heap.push(Reverse((0, source)));
        while let Some(Reverse((dist, a))) = heap.pop() {
            if dist > self.scratch[a] {
                continue;
            }
            if a != source && graph.is_virtual(a) {
                offer_escape(dist, Escape::Virtual(a));
                continue;
            }
            for &(b, edge) in graph.neighbors(a) {
                let length = graph.edges[edge].weight * WEIGHT_SCALE;
                if !self.owned.contains(b) {
                    offer_escape(dist + length / 2, Escape::Midpoint(edge));
                    continue;
                }
                let next = dist + length;
                if next < self.scratch[b] {
                    if self.scratch[b] == UNREACHABLE {
                        touched.push(b);
                    }
                    self.scratch[b] = next;
                    heap.push(Reverse((next, b)));
                }
            }
        }

        let mut to_defect: Vec<(Weight, usize)> = self
            .defects
            .iter()
            .enumerate()
            .filter(|&(_, &x)| self.scratch[x] != UNREACHABLE)
            .map(|(i, &x)| (self.scratch[x], i))
            .collect();
        to_defect.sort_unstable();
        for t in touched {
            self.scratch[t] = UNREACHABLE;
        }
        DistanceRow { to_defect, escape }
    }

    // ------------------------------------------------------------------
    // Node helpers
    // ------------------------------------------------------------------

    #[inline]
    fn is_blossom(&self, node: usize) -> bool {
        node >= self.defects.len()
    }

    pub(crate) fn top(&self, v: usize) -> usize {
        let mut t = v;
        while let Some(p) = self.nodes[t].parent {
            t = p;
        }
        t
    }

    /// Sum of the duals of every node containing defect `v`.
    fn cover_dual(&self, v: usize) -> Weight {
        let mut t = v;
        let mut y = self.nodes[t].dual;
        while let Some(p) = self.nodes[t].parent {
            t = p;
            y += self.nodes[t].dual;
        }
        y
    }

    /// Duals of the nodes containing defect `v` but not defect `x`.
    fn exclusive_cover(&self, v: usize, x: usize) -> Weight {
        let mut shared = Vec::new();
        let mut t = x;
        while let Some(p) = self.nodes[t].parent {
            shared.push(p);
            t = p;
        }
        let mut y = self.nodes[v].dual;
        let mut t = v;
        while let Some(p) = self.nodes[t].parent {
            if shared.contains(&p) {
                break;
            }
            y += self.nodes[p].dual;
            t = p;
        }
        y
    }

    fn refresh(&mut self, v: usize) {
        let cover = self.cover_dual(v);
        self.top_of[v] = self.top(v);
        self.cover[v] = cover;
        self.cover_bound = self.cover_bound.max(cover);
    }

    /// Appends every defect inside `node`.
    fn node_defects(&self, node: usize, out: &mut Vec<usize>) {
        if !self.is_blossom(node) {
            out.push(node);
            return;
        }
        for &child in &self.nodes[node].children {
            self.node_defects(child, out);
        }
    }

    /// Immediate child of `blossom` that contains defect `v`.
    fn child_of(&self, blossom: usize, v: usize) -> usize {
        let mut t = v;
        while let Some(p) = self.nodes[t].parent {
            if p == blossom {
                break;
            }
            t = p;
        }
        t
    }

    fn alloc_node(&mut self, node: Node) -> usize {
        match self.free_slots.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn release_node(&mut self, blossom: usize) {
        let node = &mut self.nodes[blossom];
        node.alive = false;
        node.parent = None;
        node.children.clear();
        node.links.clear();
        node.label = None;
        node.tree_link = None;
        node.dual = 0;
        self.free_slots.push(blossom);
    }

    fn set_tree(&mut self, node: usize, label: Label, link: (usize, usize)) {
        self.nodes[node].label = Some(label);
        self.nodes[node].tree_link = Some(link);
    }

    // ------------------------------------------------------------------
    // Stage
    // ------------------------------------------------------------------

    fn grow_from(&mut self, graph: &DecodingGraph, root: usize) -> Result<()> {
        let root_vertex = self.defects[self.nodes[root].base];
        self.nodes[root].label = Some(Label::Plus);
        self.nodes[root].tree_link = None;
        let mut tree = std::mem::take(&mut self.tree);
        tree.clear();
        self.node_defects(root, &mut tree);
        self.tree = tree;
        trace!(unit = self.unit, root = root_vertex, "stage start");

        loop {
            let Some((delta, event)) = self.next_event(graph) else {
                self.end_stage();
                return Err(MwpmError::NoPerfectMatching {
                    unit: self.unit,
                    vertex: root_vertex,
                });
            };
            debug_assert!(delta >= 0, "negative dual step {delta}");
            self.apply_delta(delta);

            match event {
                Event::Touch { from, to } => {
                    let target = self.top(to);
                    let base = self.nodes[target].base;
                    if let Some(Mate::Peer(partner)) = self.mates[base] {
                        self.set_tree(target, Label::Minus, (to, from));
                        let next = self.top(partner);
                        self.set_tree(next, Label::Plus, (partner, base));
                        let mut tree = std::mem::take(&mut self.tree);
                        self.node_defects(target, &mut tree);
                        self.node_defects(next, &mut tree);
                        self.tree = tree;
                    } else {
                        // free node, or one matched to an escape it can give up
                        self.augment(from, Mate::Peer(to));
                        if self.is_blossom(target) {
                            self.augment_blossom(target, to);
                        }
                        self.mates[to] = Some(Mate::Peer(from));
                        break;
                    }
                }
                Event::Cycle { from, to } => self.form_blossom(from, to),
                Event::Escape { from, escape } => {
                    self.augment(from, Mate::Escape(escape));
                    break;
                }
                Event::Expand { blossom } => self.expand_minus(blossom),
            }
        }

        self.end_stage();
        Ok(())
    }

    /// Finds the smallest dual step over the plus defects and minus blossoms
    /// of the current tree.
    ///
    /// Only tree defects are refreshed and scanned; everything else keeps its
    /// duals during a stage. Rows are sorted by distance, so the scan of a
    /// row stops once no later entry can beat the best step found.
    fn next_event(&mut self, graph: &DecodingGraph) -> Option<(Weight, Event)> {
        let n = self.defects.len();
        let mut tree = std::mem::take(&mut self.tree);
        for &v in &tree {
            self.refresh(v);
        }
        tree.retain(|&v| self.nodes[self.top_of[v]].label.is_some());
        tree.sort_unstable();
        tree.dedup();

        let mut plus = Vec::new();
        let mut tops = std::mem::take(&mut self.tree_tops);
        tops.clear();
        for &v in &tree {
            let top = self.top_of[v];
            tops.push(top);
            if self.nodes[top].label == Some(Label::Plus) {
                plus.push(v);
            }
        }
        tops.sort_unstable();
        tops.dedup();
        self.tree = tree;
        for &u in &plus {
            self.row(graph, u);
        }

        let bound = self.cover_bound;
        let mut best: Option<Candidate> = None;
        for &u in &plus {
            let Some(row) = self.rows[u].as_ref() else {
                continue;
            };
            let cover_u = self.cover[u];
            for &(d, x) in &row.to_defect {
                if let Some((step, _, _)) = best {
                    if d - cover_u - bound > 2 * step {
                        break;
                    }
                }
                let top_x = self.top_of[x];
                if top_x == self.top_of[u] {
                    continue;
                }
                let slack = d - cover_u - self.cover[x];
                match self.nodes[top_x].label {
                    None => offer(&mut best, slack, (u, x), Event::Touch { from: u, to: x }),
                    Some(Label::Plus) if x > u => {
                        debug_assert!(slack % 2 == 0, "odd slack {slack} between plus nodes");
                        offer(&mut best, slack / 2, (u, x), Event::Cycle { from: u, to: x });
                    }
                    _ => {}
                }
            }
            if let Some((cost, escape)) = row.escape {
                offer(&mut best, cost - cover_u, (u, n), Event::Escape { from: u, escape });
            }
        }

        for &top in &tops {
            let node = &self.nodes[top];
            if self.is_blossom(top) && node.label == Some(Label::Minus) {
                offer(&mut best, node.dual, (usize::MAX, top), Event::Expand { blossom: top });
            }
        }
        self.tree_tops = tops;
        best.map(|(delta, _, event)| (delta, event))
    }

    fn apply_delta(&mut self, delta: Weight) {
        if delta == 0 {
            return;
        }
        for &top in &self.tree_tops {
            let node = &mut self.nodes[top];
            match node.label {
                Some(Label::Plus) => node.dual += delta,
                Some(Label::Minus) => node.dual -= delta,
                None => {}
            }
        }
    }

    /// Clears labels and dissolves top-level blossoms whose dual is zero.
    fn end_stage(&mut self) {
        let n = self.defects.len();
        let mut stale = std::mem::take(&mut self.tree);
        let mut dissolve = Vec::new();
        for index in 0..self.nodes.len() {
            let node = &mut self.nodes[index];
            if !node.alive || node.parent.is_some() {
                continue;
            }
            node.label = None;
            node.tree_link = None;
            if index >= n && node.dual == 0 {
                dissolve.push(index);
            }
        }
        for &blossom in &dissolve {
            self.node_defects(blossom, &mut stale);
        }
        while let Some(blossom) = dissolve.pop() {
            let children = std::mem::take(&mut self.nodes[blossom].children);
            for child in children {
                self.nodes[child].parent = None;
                if self.is_blossom(child) && self.nodes[child].dual == 0 {
                    dissolve.push(child);
                }
            }
            self.release_node(blossom);
        }
        for &v in &stale {
            self.refresh(v);
        }
        stale.clear();
        self.tree = stale;
        self.tree_tops.clear();

        if self.cached_rows > ROW_CACHE_LIMIT {
            trace!(unit = self.unit, rows = self.cached_rows, "dropping distance rows");
            self.rows.iter_mut().for_each(|row| *row = None);
            self.cached_rows = 0;
        }
    }

    // ------------------------------------------------------------------
    // Augmentation
    // ------------------------------------------------------------------

    /// Matches defect `v` to `target` and flips the tree path from `v`'s
    /// node up to the root.
    fn augment(&mut self, v: usize, target: Mate) {
        let mut node = self.top(v);
        let mut entry = v;
        let mut target = target;
        loop {
            let link = self.nodes[node].tree_link;
            if self.is_blossom(node) {
                self.augment_blossom(node, entry);
            }
            self.mates[entry] = Some(target);

            let Some((_, minus_base)) = link else {
                break;
            };
            let minus = self.top(minus_base);
            let Some((minus_entry, plus_vertex)) = self.nodes[minus].tree_link else {
                break;
            };
            if self.is_blossom(minus) {
                self.augment_blossom(minus, minus_entry);
            }
            self.mates[minus_entry] = Some(Mate::Peer(plus_vertex));

            node = self.top(plus_vertex);
            entry = plus_vertex;
            target = Mate::Peer(minus_entry);
        }
    }

    /// Makes defect `v` the base of `blossom`, rematching the cycle so that
    /// every other child stays matched inside the blossom.
    fn augment_blossom(&mut self, blossom: usize, v: usize) {
        let child = self.child_of(blossom, v);
        if self.is_blossom(child) {
            self.augment_blossom(child, v);
        }

        let k = self.nodes[blossom].children.len();
        let i = self.nodes[blossom]
            .children
            .iter()
            .position(|&c| c == child)
            .unwrap_or(0);
        let flips: Vec<usize> = if i % 2 == 1 {
            (i + 1..k).step_by(2).collect()
        } else {
            (0..i).step_by(2).collect()
        };

        for m in flips {
            let (a, b) = self.nodes[blossom].links[m];
            let ca = self.nodes[blossom].children[m];
            let cb = self.nodes[blossom].children[(m + 1) % k];
            if self.is_blossom(ca) {
                self.augment_blossom(ca, a);
            }
            if self.is_blossom(cb) {
                self.augment_blossom(cb, b);
            }
            self.mates[a] = Some(Mate::Peer(b));
            self.mates[b] = Some(Mate::Peer(a));
        }

        let node = &mut self.nodes[blossom];
        node.children.rotate_left(i);
        node.links.rotate_left(i);
        node.base = v;
    }

    // ------------------------------------------------------------------
    // Blossoms
    // ------------------------------------------------------------------

    /// Tree path from `node` to the root as `(node, link to parent)`.
    fn tree_path(&self, node: usize) -> Vec<(usize, Option<(usize, usize)>)> {
        let mut path = Vec::new();
        let mut current = node;
        loop {
            let link = self.nodes[current].tree_link;
            path.push((current, link));
            match link {
                Some((_, up)) => current = self.top(up),
                None => break,
            }
        }
        path
    }

    /// Shrinks the odd cycle closed by the tight edge `(u, x)` between two
    /// plus nodes.
    fn form_blossom(&mut self, u: usize, x: usize) {
        let path_a = self.tree_path(self.top(u));
        let path_b = self.tree_path(self.top(x));

        let mut meet = None;
        for (ib, (node, _)) in path_b.iter().enumerate() {
            if let Some(ia) = path_a.iter().position(|(n, _)| n == node) {
                meet = Some((ia, ib));
                break;
            }
        }
        let Some((ia, ib)) = meet else {
            return;
        };
        let lca = path_a[ia].0;

        let mut children = Vec::with_capacity(ia + ib + 1);
        let mut links = Vec::with_capacity(ia + ib + 1);
        children.push(lca);
        for k in (0..ia).rev() {
            let (node, link) = path_a[k];
            if let Some((inner, outer)) = link {
                links.push((outer, inner));
            }
            children.push(node);
        }
        links.push((u, x));
        for &(node, link) in path_b.iter().take(ib) {
            children.push(node);
            if let Some(link) = link {
                links.push(link);
            }
        }

        let blossom = self.alloc_node(Node {
            parent: None,
            children: children.clone(),
            links,
            base: self.nodes[lca].base,
            dual: 0,
            label: Some(Label::Plus),
            tree_link: self.nodes[lca].tree_link,
            alive: true,
        });
        for child in children {
            let node = &mut self.nodes[child];
            node.parent = Some(blossom);
            node.label = None;
            node.tree_link = None;
        }
        trace!(unit = self.unit, blossom, "blossom formed");
    }

    /// Replaces a zero-dual minus blossom by the even path from its entry
    /// child to its base child; the other children leave the tree.
    fn expand_minus(&mut self, blossom: usize) {
        let Some((entry, from)) = self.nodes[blossom].tree_link else {
            return;
        };
        let entry_child = self.child_of(blossom, entry);
        let children = self.nodes[blossom].children.clone();
        let links = self.nodes[blossom].links.clone();
        let k = children.len();
        let j = children.iter().position(|&c| c == entry_child).unwrap_or(0);

        for &child in &children {
            let node = &mut self.nodes[child];
            node.parent = None;
            node.label = None;
            node.tree_link = None;
        }
        self.release_node(blossom);

        self.set_tree(children[j], Label::Minus, (entry, from));
        if j % 2 == 0 {
            // backward through the matched link below j, down to the base
            for i in (0..j).rev() {
                let label = if (j - i) % 2 == 1 { Label::Plus } else { Label::Minus };
                self.set_tree(children[i], label, links[i]);
            }
        } else {
            // forward, wrapping to the base
            let mut step = 1;
            let mut i = (j + 1) % k;
            loop {
                let (a, b) = links[(i + k - 1) % k];
                let label = if step % 2 == 1 { Label::Plus } else { Label::Minus };
                self.set_tree(children[i], label, (b, a));
                if i == 0 {
                    break;
                }
                i = (i + 1) % k;
                step += 1;
            }
        }
        trace!(unit = self.unit, blossom, "blossom expanded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mwpm_common::VertexRange;

    fn whole(graph: &DecodingGraph) -> OwnedRanges {
        OwnedRanges::single(VertexRange::new(0, graph.vertex_num()))
    }

    /// Four defects in a row with a virtual vertex at each end.
    fn chain_with_boundary() -> DecodingGraph {
        let mut g = DecodingGraph::new(6);
        g.add_edge(4, 0, 1).unwrap();
        g.add_edge(0, 1, 1).unwrap();
        g.add_edge(1, 2, 1).unwrap();
        g.add_edge(2, 3, 1).unwrap();
        g.add_edge(3, 5, 1).unwrap();
        g.set_virtual(4).unwrap();
        g.set_virtual(5).unwrap();
        g.build_adjacency();
        g
    }

    #[test]
    fn chain_pairs_neighbours() {
        let g = chain_with_boundary();
        let mut unit = PrimalDualUnit::new(0, whole(&g), vec![0, 1, 2, 3]);
        unit.solve(&g).unwrap();
        let m = unit.perfect_matching(&g).unwrap();
        assert_eq!(m.peer_matchings, vec![(0, 1), (2, 3)]);
        assert!(m.virtual_matchings.is_empty());
        assert_eq!(m.weight, 2);
        assert_eq!(unit.sum_dual_variables(), 2 * WEIGHT_SCALE);
    }

    #[test]
    fn triangle_shrinks_and_escapes() {
        let mut g = DecodingGraph::new(4);
        g.add_edge(0, 1, 2).unwrap();
        g.add_edge(1, 2, 2).unwrap();
        g.add_edge(0, 2, 2).unwrap();
        g.add_edge(2, 3, 5).unwrap();
        g.set_virtual(3).unwrap();
        g.build_adjacency();

        let mut unit = PrimalDualUnit::new(0, whole(&g), vec![0, 1, 2]);
        unit.solve(&g).unwrap();
        let m = unit.perfect_matching(&g).unwrap();
        assert_eq!(m.peer_matchings, vec![(0, 1)]);
        assert_eq!(m.virtual_matchings, vec![(2, 3)]);
        assert_eq!(m.weight, 7);
        assert_eq!(unit.sum_dual_variables(), 7 * WEIGHT_SCALE);
    }

    #[test]
    fn odd_defects_without_boundary_fail() {
        let mut g = DecodingGraph::new(3);
        g.add_edge(0, 1, 1).unwrap();
        g.add_edge(1, 2, 1).unwrap();
        g.build_adjacency();
        let mut unit = PrimalDualUnit::new(7, whole(&g), vec![0, 1, 2]);
        let err = unit.solve(&g).unwrap_err();
        assert_eq!(err, MwpmError::NoPerfectMatching { unit: 7, vertex: 2 });
    }

    #[test]
    fn crossing_edges_leave_pending_midpoints() {
        let g = chain_with_boundary();
        // owns vertices 1 and 2 only; defect 1 sits next to two crossing edges
        let owned = OwnedRanges::single(VertexRange::new(1, 3));
        let mut unit = PrimalDualUnit::new(0, owned, vec![1]);
        unit.solve(&g).unwrap();
        let pending = unit.pending_boundary();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].vertex, 1);
        // edge 1 is (0, 1): half of weight 1, scaled
        assert_eq!(pending[0].edge, 1);
        assert_eq!(pending[0].dual, WEIGHT_SCALE / 2);
        assert!(unit.perfect_matching(&g).is_err());
    }

    #[test]
    fn matching_is_read_off_the_duals() {
        let g = chain_with_boundary();
        let mut unit = PrimalDualUnit::new(0, whole(&g), vec![0, 1, 2, 3]);
        unit.solve(&g).unwrap();
        unit.rows.iter_mut().for_each(|row| *row = None);
        unit.cached_rows = 0;

        let m = unit.extract_matching().unwrap();
        assert_eq!(m.peer_matchings, vec![(0, 1), (2, 3)]);
        assert_eq!(m.weight, 2);
        assert_eq!(unit.cached_rows, 0);
        assert!(unit.rows.iter().all(Option::is_none));
    }

    #[test]
    fn nested_blossom_pairs_cost_their_distance() {
        // two triangles joined by a bridge; all six defects
        let mut g = DecodingGraph::new(6);
        g.add_edge(0, 1, 2).unwrap();
        g.add_edge(1, 2, 2).unwrap();
        g.add_edge(0, 2, 2).unwrap();
        g.add_edge(2, 3, 3).unwrap();
        g.add_edge(3, 4, 2).unwrap();
        g.add_edge(4, 5, 2).unwrap();
        g.add_edge(3, 5, 2).unwrap();
        g.build_adjacency();

        let mut unit = PrimalDualUnit::new(0, whole(&g), (0..6).collect());
        unit.solve(&g).unwrap();
        let m = unit.extract_matching().unwrap();
        assert_eq!(m.weight, 7);
        assert_eq!(unit.sum_dual_variables(), 7 * WEIGHT_SCALE);
        assert_eq!(unit.perfect_matching(&g).unwrap(), m);
    }

    #[test]
    fn row_cache_is_dropped_between_stages_when_full() {
        let len = ROW_CACHE_LIMIT + 8;
        let mut g = DecodingGraph::new(len);
        for v in 0..len - 1 {
            g.add_edge(v, v + 1, 1).unwrap();
        }
        g.build_adjacency();

        let mut unit = PrimalDualUnit::new(0, whole(&g), (0..len).collect());
        for v in 0..=ROW_CACHE_LIMIT {
            unit.row(&g, v);
        }
        assert_eq!(unit.cached_rows, ROW_CACHE_LIMIT + 1);
        unit.end_stage();
        assert_eq!(unit.cached_rows, 0);
        assert!(unit.rows.iter().all(Option::is_none));

        unit.row(&g, 3);
        unit.end_stage();
        assert_eq!(unit.cached_rows, 1);
        assert_eq!(unit.rows[3].as_ref().unwrap().distance_to(5), Some(2 * WEIGHT_SCALE));
    }

    #[test]
    fn empty_unit_has_empty_matching() {
        let g = chain_with_boundary();
        let mut unit = PrimalDualUnit::new(0, whole(&g), vec![]);
        unit.solve(&g).unwrap();
        assert_eq!(unit.perfect_matching(&g).unwrap(), PerfectMatching::new());
        assert_eq!(unit.sum_dual_variables(), 0);
    }
}
