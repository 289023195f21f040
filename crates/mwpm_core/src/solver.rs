//! Parallel solver: runs the fusion tree on the worker pool.
//!
//! Every unit of the tree is one job. Leaf jobs are submitted up front (or as
//! their rounds arrive, in streaming mode); a fusion job is submitted by
//! whichever child finishes second, tracked with an atomic pending-children
//! counter per fusion node. Solved units wait in per-unit slots until their
//! parent takes them, so each unit is owned by exactly one job at a time and
//! no lock ever covers more than one slot.
//!
//! A solve ends when the count of outstanding jobs drops to zero. The
//! submitting thread holds one extra count while it is still dispatching, so
//! the count cannot reach zero early.

use crate::config::{PartitionSettings, SolverConfig};
use crate::error::{MwpmError, Result};
use crate::fusion::fuse;
use crate::graph::DecodingGraph;
use crate::partition::{FusionTree, UnitKind};
use crate::pool::{JobKind, Submitter, WorkerPool};
use crate::primal_dual::PrimalDualUnit;
use crate::smp::SyncCell;
use mwpm_common::{PerfectMatching, VertexIndex, Weight};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Shared flag that stops a running solve between units.
///
/// Units already running finish; units not yet started are skipped. The
/// flag stays set until [`ParallelSolver::clear`].
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Timing of the last solve.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SolveProfile {
    /// Wall time from dispatch until the matching was extracted.
    pub total: Duration,
    /// Run time of each unit, indexed by unit id. Zero for skipped units.
    pub unit_times: Vec<Duration>,
    pub defect_num: usize,
}

impl SolveProfile {
    pub fn time_per_defect(&self) -> Option<Duration> {
        (self.defect_num > 0).then(|| self.total / self.defect_num as u32)
    }
}

/// Message from a job to the thread driving the solve.
pub(crate) enum UnitEvent {
    Finished { unit: usize, elapsed: Duration },
    /// The last outstanding job is done.
    Idle,
}

/// Builds one unit: solves a leaf or fuses two finished children.
///
/// `take_child` hands over ownership of a finished child unit.
pub(crate) fn execute_unit(
    graph: &DecodingGraph,
    tree: &FusionTree,
    id: usize,
    defects: Vec<VertexIndex>,
    mut take_child: impl FnMut(usize) -> Option<PrimalDualUnit>,
) -> Result<PrimalDualUnit> {
    let unit = tree.unit(id);
    match unit.kind {
        UnitKind::Leaf(_) => {
            let mut solved = PrimalDualUnit::new(id, unit.owned.clone(), defects);
            solved.solve(graph)?;
            Ok(solved)
        }
        UnitKind::Fusion { left, right } => {
            let missing = |child| MwpmError::WorkerFailure(format!("unit {} missing child {}", id, child));
            let l = take_child(left).ok_or_else(|| missing(left))?;
            let r = take_child(right).ok_or_else(|| missing(right))?;
            fuse(graph, l, r, id, unit.owned.clone(), &unit.boundary_edges)
        }
    }
}

/// Runs the whole fusion tree on the calling thread, children before
/// parents, and returns the solved root unit.
pub fn solve_sequential(
    graph: &DecodingGraph,
    tree: &FusionTree,
    defects: &[VertexIndex],
) -> Result<PrimalDualUnit> {
    if !graph.is_ready() {
        return Err(MwpmError::Config(
            "graph adjacency is not built; call build_adjacency first".into(),
        ));
    }
    let defects = graph.validate_defects(defects)?;
    let mut per_leaf = tree.split_defects(&defects);
    let mut slots: Vec<Option<PrimalDualUnit>> = Vec::with_capacity(tree.unit_num());
    for id in 0..tree.unit_num() {
        let leaf_defects = per_leaf.get_mut(id).map(std::mem::take).unwrap_or_default();
        let solved = execute_unit(graph, tree, id, leaf_defects, |child| slots[child].take())?;
        slots.push(Some(solved));
    }
    slots
        .pop()
        .flatten()
        .ok_or_else(|| MwpmError::WorkerFailure("empty fusion tree".into()))
}

/// State of one solve, shared by its jobs.
pub(crate) struct SolveContext {
    graph: Arc<DecodingGraph>,
    tree: Arc<FusionTree>,
    slots: Vec<SyncCell<Option<PrimalDualUnit>>>,
    /// Children still running, per fusion node.
    pending: Vec<AtomicUsize>,
    outstanding: AtomicUsize,
    cancel: CancelHandle,
    failed: AtomicBool,
    failure: SyncCell<Option<MwpmError>>,
    submitter: Submitter,
    events: mpsc::Sender<UnitEvent>,
}

impl SolveContext {
    /// Starts with one outstanding count held by the dispatching thread.
    pub(crate) fn new(solver: &ParallelSolver) -> (Arc<Self>, mpsc::Receiver<UnitEvent>) {
        let style = solver.config.sync_style;
        let unit_num = solver.tree.unit_num();
        let (events, receiver) = mpsc::channel();
        let ctx = Self {
            graph: Arc::clone(&solver.graph),
            tree: Arc::clone(&solver.tree),
            slots: (0..unit_num).map(|_| SyncCell::new(style, None)).collect(),
            pending: (0..unit_num).map(|_| AtomicUsize::new(2)).collect(),
            outstanding: AtomicUsize::new(1),
            cancel: solver.cancel.clone(),
            failed: AtomicBool::new(false),
            failure: SyncCell::new(style, None),
            submitter: solver.pool.submitter(),
            events,
        };
        (Arc::new(ctx), receiver)
    }

    pub(crate) fn submit_leaf(self: &Arc<Self>, leaf: usize, defects: Vec<VertexIndex>) {
        self.submit(JobKind::Leaf, leaf, defects);
    }

    fn submit(self: &Arc<Self>, kind: JobKind, id: usize, defects: Vec<VertexIndex>) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        let ctx = Arc::clone(self);
        self.submitter.submit(kind, Box::new(move || ctx.run(id, defects)));
    }

    /// Drops the dispatcher's count. True if nothing is left running.
    pub(crate) fn release_dispatch(&self) -> bool {
        self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.failed.load(Ordering::Acquire)
    }

    fn run(self: &Arc<Self>, id: usize, defects: Vec<VertexIndex>) {
        if !self.is_stopped() {
            let start = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                execute_unit(&self.graph, &self.tree, id, defects, |child| {
                    self.slots[child].take()
                })
            }))
            .unwrap_or_else(|payload| Err(MwpmError::WorkerFailure(panic_message(payload))));

            match outcome {
                Ok(solved) => {
                    self.slots[id].with(|slot| *slot = Some(solved));
                    let elapsed = start.elapsed();
                    debug!(unit = id, ?elapsed, "unit finished");
                    let _ = self.events.send(UnitEvent::Finished { unit: id, elapsed });
                    if let Some(parent) = self.tree.unit(id).parent {
                        if self.pending[parent].fetch_sub(1, Ordering::AcqRel) == 1 {
                            self.submit(JobKind::Fusion, parent, Vec::new());
                        }
                    }
                }
                Err(e) => self.record_failure(id, e),
            }
        }
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _ = self.events.send(UnitEvent::Idle);
        }
    }

    fn record_failure(&self, id: usize, e: MwpmError) {
        error!(unit = id, error = %e, "unit failed");
        self.failed.store(true, Ordering::Release);
        self.failure.with(|slot| {
            if slot.is_none() {
                *slot = Some(e);
            }
        });
    }

    /// Collects the root, or the first error.
    pub(crate) fn finish(&self) -> Result<PrimalDualUnit> {
        if let Some(e) = self.failure.take() {
            return Err(e);
        }
        match self.slots[self.tree.root()].take() {
            Some(root) => Ok(root),
            None if self.cancel.is_cancelled() => Err(MwpmError::Aborted),
            None => Err(MwpmError::WorkerFailure("root unit was never produced".into())),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("worker panicked: {}", s)
    } else {
        "worker panicked".into()
    }
}

/// Blocks until `Idle`, passing every `Finished` event to `on_finished`.
pub(crate) fn wait_idle(
    receiver: &mpsc::Receiver<UnitEvent>,
    mut on_finished: impl FnMut(usize, Duration),
) -> Result<()> {
    loop {
        match receiver.recv() {
            Ok(UnitEvent::Finished { unit, elapsed }) => on_finished(unit, elapsed),
            Ok(UnitEvent::Idle) => return Ok(()),
            Err(_) => return Err(MwpmError::WorkerFailure("worker pool disconnected".into())),
        }
    }
}

/// Partitioned matching solver backed by a persistent worker pool.
///
/// The graph and fusion tree are fixed at construction. Each `solve` takes a
/// fresh defect list; the previous result is replaced.
pub struct ParallelSolver {
    pub(crate) graph: Arc<DecodingGraph>,
    pub(crate) tree: Arc<FusionTree>,
    pub(crate) config: SolverConfig,
    pub(crate) pool: WorkerPool,
    pub(crate) cancel: CancelHandle,
    pub(crate) root: Option<PrimalDualUnit>,
    pub(crate) profile: SolveProfile,
    poisoned: bool,
}

impl ParallelSolver {
    /// Builds the fusion tree and starts the worker threads.
    ///
    /// The graph's adjacency must be built.
    pub fn new(
        graph: Arc<DecodingGraph>,
        partition: &PartitionSettings,
        mut config: SolverConfig,
    ) -> Result<Self> {
        config.validate()?;
        if !graph.is_ready() {
            return Err(MwpmError::Config(
                "graph adjacency is not built; call build_adjacency first".into(),
            ));
        }
        let tree = Arc::new(FusionTree::build(&graph, partition)?);
        let pool = WorkerPool::new(&config)?;
        info!(
            vertices = graph.vertex_num(),
            edges = graph.edge_num(),
            leaves = tree.leaf_num(),
            threads = pool.thread_num(),
            "solver ready"
        );
        Ok(Self {
            graph,
            tree,
            config,
            pool,
            cancel: CancelHandle::default(),
            root: None,
            profile: SolveProfile::default(),
            poisoned: false,
        })
    }

    pub fn graph(&self) -> &DecodingGraph {
        &self.graph
    }

    pub fn fusion_tree(&self) -> &FusionTree {
        &self.tree
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub(crate) fn check_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(MwpmError::WorkerFailure(
                "solver disabled by an earlier worker failure".into(),
            ));
        }
        Ok(())
    }

    /// Extracts the matching of a finished solve and records its profile, or
    /// poisons the solver on a fatal error.
    pub(crate) fn complete(
        &mut self,
        outcome: Result<PrimalDualUnit>,
        start: Instant,
        unit_times: Vec<Duration>,
        defect_num: usize,
    ) -> Result<PerfectMatching> {
        let extracted = match outcome {
            Ok(mut root) => root.perfect_matching(&self.graph).map(|m| (root, m)),
            Err(e) => {
                if e.is_fatal() {
                    self.poisoned = true;
                }
                Err(e)
            }
        };
        self.profile = SolveProfile {
            total: start.elapsed(),
            unit_times,
            defect_num,
        };
        let (root, matching) = extracted?;
        self.root = Some(root);
        Ok(matching)
    }

    /// Decodes one syndrome and returns its minimum-weight perfect matching.
    pub fn solve(&mut self, defects: &[VertexIndex]) -> Result<PerfectMatching> {
        self.check_usable()?;
        self.root = None;
        let defects = self.graph.validate_defects(defects)?;
        let start = Instant::now();
        let (ctx, receiver) = SolveContext::new(self);
        for (leaf, leaf_defects) in self.tree.split_defects(&defects).into_iter().enumerate() {
            ctx.submit_leaf(leaf, leaf_defects);
        }

        let mut unit_times = vec![Duration::ZERO; self.tree.unit_num()];
        if !ctx.release_dispatch() {
            wait_idle(&receiver, |unit, elapsed| unit_times[unit] = elapsed)?;
        }
        // if the dispatcher released last, no Idle was sent and the
        // finished events are still queued
        while let Ok(UnitEvent::Finished { unit, elapsed }) = receiver.try_recv() {
            unit_times[unit] = elapsed;
        }

        let result = self.complete(ctx.finish(), start, unit_times, defects.len());
        debug!(defects = defects.len(), total = ?self.profile.total, "solve finished");
        result
    }

    /// Matching of the last successful solve.
    pub fn perfect_matching(&mut self) -> Result<PerfectMatching> {
        match self.root.as_mut() {
            Some(root) => root.perfect_matching(&self.graph),
            None => Err(MwpmError::Config("no successful solve to report".into())),
        }
    }

    /// Dual objective of the last solve, in internal units.
    pub fn sum_dual_variables(&self) -> Weight {
        self.root.as_ref().map_or(0, |root| root.sum_dual_variables())
    }

    pub fn profile(&self) -> &SolveProfile {
        &self.profile
    }

    /// Forgets the last result and resets cancellation.
    pub fn clear(&mut self) {
        self.root = None;
        self.profile = SolveProfile::default();
        self.cancel.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncStyle;
    use crate::primal_dual::WEIGHT_SCALE;

    fn chain() -> Arc<DecodingGraph> {
        let mut g = DecodingGraph::new(6);
        g.add_edge(4, 0, 1).unwrap();
        g.add_edge(0, 1, 1).unwrap();
        g.add_edge(1, 2, 1).unwrap();
        g.add_edge(2, 3, 1).unwrap();
        g.add_edge(3, 5, 1).unwrap();
        g.set_virtual(4).unwrap();
        g.set_virtual(5).unwrap();
        g.build_adjacency();
        Arc::new(g)
    }

    #[test]
    fn parallel_and_sequential_agree_on_chain() {
        let g = chain();
        for parts in [1, 2, 3] {
            let settings = PartitionSettings::time_axis(parts);
            let tree = FusionTree::build(&g, &settings).unwrap();
            let mut seq = solve_sequential(&g, &tree, &[0, 1, 2, 3]).unwrap();
            let mut solver = ParallelSolver::new(g.clone(), &settings, SolverConfig::with_threads(2)).unwrap();
            let m = solver.solve(&[3, 2, 1, 0]).unwrap();
            assert_eq!(m.weight, 2);
            assert_eq!(m, seq.perfect_matching(&g).unwrap());
            assert_eq!(solver.sum_dual_variables(), 2 * WEIGHT_SCALE);
            assert_eq!(solver.profile().defect_num, 4);
            assert_eq!(solver.profile().unit_times.len(), tree.unit_num());
        }
    }

    #[test]
    fn profile_covers_the_whole_solve() {
        let g = chain();
        let mut solver = ParallelSolver::new(g, &PartitionSettings::time_axis(2), SolverConfig::with_threads(2)).unwrap();
        let start = Instant::now();
        solver.solve(&[0, 1, 2, 3]).unwrap();
        let wall = start.elapsed();
        let profile = solver.profile();
        assert!(profile.total <= wall);
        assert!(profile.unit_times.iter().all(|&t| t <= profile.total));
    }

    #[test]
    fn sequential_solve_rejects_unbuilt_graph() {
        let built = chain();
        let tree = FusionTree::build(&built, &PartitionSettings::default()).unwrap();
        let mut raw = DecodingGraph::new(6);
        raw.add_edge(0, 1, 1).unwrap();
        raw.set_virtual(4).unwrap();
        let err = solve_sequential(&raw, &tree, &[0, 1]).err().unwrap();
        assert!(matches!(err, MwpmError::Config(_)));
        assert!(solve_sequential(&built, &tree, &[0, 1]).is_ok());
    }

    #[test]
    fn unbuilt_graph_is_rejected() {
        let g = Arc::new(DecodingGraph::new(3));
        let err = ParallelSolver::new(g, &PartitionSettings::default(), SolverConfig::with_threads(1))
            .err()
            .unwrap();
        assert!(matches!(err, MwpmError::Config(_)));
    }

    #[test]
    fn cancelled_solver_aborts_until_cleared() {
        let g = chain();
        let config = SolverConfig {
            sync_style: SyncStyle::Spin,
            ..SolverConfig::with_threads(1)
        };
        let mut solver = ParallelSolver::new(g, &PartitionSettings::time_axis(2), config).unwrap();
        solver.cancel_handle().cancel();
        assert_eq!(solver.solve(&[0, 1]), Err(MwpmError::Aborted));
        assert!(solver.perfect_matching().is_err());
        solver.clear();
        assert_eq!(solver.solve(&[0, 1]).unwrap().peer_matchings, vec![(0, 1)]);
    }

    #[test]
    fn clear_resets_result_and_profile() {
        let g = chain();
        let mut solver = ParallelSolver::new(g, &PartitionSettings::default(), SolverConfig::with_threads(1)).unwrap();
        solver.solve(&[1, 2]).unwrap();
        assert_eq!(solver.perfect_matching().unwrap().peer_matchings, vec![(1, 2)]);
        solver.clear();
        assert_eq!(solver.sum_dual_variables(), 0);
        assert_eq!(solver.profile(), &SolveProfile::default());
    }

    #[test]
    fn structural_errors_do_not_poison() {
        let mut g = DecodingGraph::new(3);
        g.add_edge(0, 1, 1).unwrap();
        g.add_edge(1, 2, 1).unwrap();
        g.build_adjacency();
        let mut solver =
            ParallelSolver::new(Arc::new(g), &PartitionSettings::default(), SolverConfig::with_threads(1)).unwrap();
        let err = solver.solve(&[0, 1, 2]).unwrap_err();
        assert!(matches!(err, MwpmError::NoPerfectMatching { unit: 0, .. }));
        assert_eq!(solver.solve(&[0, 2]).unwrap().weight, 2);
    }
}
