//! Streaming controller: replays a syndrome round by round at a fixed cadence.
//!
//! Round `r` arrives at `start + r * interval`. A leaf is released to the
//! worker pool once the last round it covers has arrived, and a round counts
//! as decoded once every leaf covering it has been solved. A round can only
//! be decoded after its leaf is released, so its backlog is counted from the
//! release round, not from its own arrival. On each arrival the
//! [`StreamMonitor`] compares the new round with the release round of the
//! oldest undecoded one; falling `backlog_limit` rounds behind opens a
//! degraded episode and produces exactly one [`DeadlineViolation`]. The
//! episode closes at the first arrival that finds the backlog below the limit
//! again. Violations never stop the stream; they are reported together with
//! the matching.

use crate::error::{MwpmError, Result};
use crate::partition::UnitKind;
use crate::solver::{ParallelSolver, SolveContext, UnitEvent, wait_idle};
use mwpm_common::{PerfectMatching, VertexIndex};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Decoding fell `backlog` rounds behind when `arrived_round` arrived.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeadlineViolation {
    /// Oldest round not yet decoded.
    pub round: usize,
    /// Round whose arrival made `round` decodable.
    pub released_round: usize,
    pub arrived_round: usize,
    /// `arrived_round - released_round`.
    pub backlog: usize,
    /// Time since the stream started.
    pub at: Duration,
}

/// Tracks decoded rounds and raises one violation per degraded episode.
#[derive(Clone, Debug)]
pub struct StreamMonitor {
    backlog_limit: usize,
    /// Per round, the round at whose arrival it can start decoding.
    release: Vec<usize>,
    decoded: Vec<bool>,
    oldest_undecoded: usize,
    degraded: bool,
    violations: Vec<DeadlineViolation>,
}

impl StreamMonitor {
    /// Monitor where every round is decodable as soon as it arrives.
    pub fn new(round_num: usize, backlog_limit: usize) -> Self {
        Self::with_release_rounds((0..round_num).collect(), backlog_limit)
    }

    /// Monitor where round `r` becomes decodable when `release[r]` arrives.
    /// Release rounds must not decrease.
    pub fn with_release_rounds(release: Vec<usize>, backlog_limit: usize) -> Self {
        let round_num = release.len();
        Self {
            backlog_limit: backlog_limit.max(1),
            release,
            decoded: vec![false; round_num],
            oldest_undecoded: 0,
            degraded: false,
            violations: Vec::new(),
        }
    }

    /// Checks the backlog when `round` arrives. Returns the violation if this
    /// arrival opened a degraded episode.
    pub fn on_arrival(&mut self, round: usize, at: Duration) -> Option<DeadlineViolation> {
        let Some(&released_round) = self.release.get(self.oldest_undecoded) else {
            self.degraded = false;
            return None;
        };
        let backlog = round.saturating_sub(released_round);
        if backlog < self.backlog_limit {
            if self.degraded {
                info!(round, "decoding caught up with the stream");
                self.degraded = false;
            }
            return None;
        }
        if self.degraded {
            return None;
        }
        self.degraded = true;
        let violation = DeadlineViolation {
            round: self.oldest_undecoded,
            released_round,
            arrived_round: round,
            backlog,
            at,
        };
        warn!(
            round = violation.round,
            arrived_round = round,
            backlog,
            "deadline violation, entering degraded mode"
        );
        self.violations.push(violation);
        Some(violation)
    }

    pub fn on_decoded(&mut self, round: usize) {
        if let Some(flag) = self.decoded.get_mut(round) {
            *flag = true;
        }
        while self.decoded.get(self.oldest_undecoded) == Some(&true) {
            self.oldest_undecoded += 1;
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn oldest_undecoded(&self) -> usize {
        self.oldest_undecoded
    }

    pub fn violations(&self) -> &[DeadlineViolation] {
        &self.violations
    }

    pub fn into_violations(self) -> Vec<DeadlineViolation> {
        self.violations
    }
}

/// Result of a streamed solve.
#[derive(Clone, Debug)]
pub struct StreamReport {
    pub matching: PerfectMatching,
    pub violations: Vec<DeadlineViolation>,
    /// Per round: time from arrival until the round was decoded.
    pub round_latencies: Vec<Duration>,
    pub total: Duration,
}

/// Round bookkeeping for one streamed solve.
struct RoundClock {
    start: Instant,
    leaf_rounds: Vec<(usize, usize)>,
    /// Leaves not yet solved, per round.
    remaining: Vec<usize>,
    arrived_at: Vec<Duration>,
    decoded_at: Vec<Duration>,
}

impl RoundClock {
    fn on_finished(&mut self, monitor: &mut StreamMonitor, unit: usize) {
        let Some(&(first, last)) = self.leaf_rounds.get(unit) else {
            return;
        };
        let now = self.start.elapsed();
        for round in first..=last {
            self.remaining[round] -= 1;
            if self.remaining[round] == 0 {
                self.decoded_at[round] = now;
                monitor.on_decoded(round);
            }
        }
    }
}

impl ParallelSolver {
    /// Decodes `defects` as if its rounds were measured live, one round per
    /// `stream.measure_interval`.
    ///
    /// The graph must have a round layout. Deadline violations are collected
    /// in the report; they do not fail the solve.
    pub fn solve_streaming(&mut self, defects: &[VertexIndex]) -> Result<StreamReport> {
        self.check_usable()?;
        self.root = None;
        let (round_vertex_num, round_num) = match (self.graph.round_vertex_num(), self.graph.round_num()) {
            (Some(n), Some(r)) => (n, r),
            _ => {
                return Err(MwpmError::Config(
                    "streaming needs a graph with a round layout".into(),
                ));
            }
        };
        let defects = self.graph.validate_defects(defects)?;
        let mut per_leaf = self.tree.split_defects(&defects);

        let leaf_num = self.tree.leaf_num();
        let mut ready_at_round: Vec<Vec<usize>> = vec![Vec::new(); round_num];
        let mut leaf_rounds = Vec::with_capacity(leaf_num);
        let mut remaining = vec![0usize; round_num];
        let mut release = vec![0usize; round_num];
        for leaf in 0..leaf_num {
            let last = self.tree.leaf_last_round(&self.graph, leaf);
            let (first, last) = match (self.tree.unit(leaf).kind, last) {
                (UnitKind::Leaf(range), Some(last)) => (range.start / round_vertex_num, last),
                _ => {
                    return Err(MwpmError::Config(format!("leaf {} owns no vertices", leaf)));
                }
            };
            ready_at_round[last].push(leaf);
            leaf_rounds.push((first, last));
            for round in first..=last {
                remaining[round] += 1;
                release[round] = release[round].max(last);
            }
        }

        let interval = self.config.stream.measure_interval();
        let mut monitor = StreamMonitor::with_release_rounds(release, self.config.stream.backlog_limit);
        let mut unit_times = vec![Duration::ZERO; self.tree.unit_num()];
        let (ctx, receiver) = SolveContext::new(self);
        let mut clock = RoundClock {
            start: Instant::now(),
            leaf_rounds,
            remaining,
            arrived_at: vec![Duration::ZERO; round_num],
            decoded_at: vec![Duration::ZERO; round_num],
        };
        info!(rounds = round_num, leaves = leaf_num, ?interval, "stream started");

        for round in 0..round_num {
            let arrival = clock.start + interval.saturating_mul(round as u32);
            loop {
                let now = Instant::now();
                if now >= arrival {
                    break;
                }
                match receiver.recv_timeout(arrival - now) {
                    Ok(UnitEvent::Finished { unit, elapsed }) => {
                        unit_times[unit] = elapsed;
                        clock.on_finished(&mut monitor, unit);
                    }
                    Ok(UnitEvent::Idle) | Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(MwpmError::WorkerFailure("worker pool disconnected".into()));
                    }
                }
            }
            drain_finished(&receiver, &mut unit_times, &mut clock, &mut monitor);
            if ctx.is_stopped() {
                debug!(round, "stream stopped early");
                break;
            }

            clock.arrived_at[round] = clock.start.elapsed();
            monitor.on_arrival(round, clock.arrived_at[round]);
            for &leaf in &ready_at_round[round] {
                ctx.submit_leaf(leaf, std::mem::take(&mut per_leaf[leaf]));
            }
        }

        if !ctx.release_dispatch() {
            wait_idle(&receiver, |unit, elapsed| {
                unit_times[unit] = elapsed;
                clock.on_finished(&mut monitor, unit);
            })?;
        }
        drain_finished(&receiver, &mut unit_times, &mut clock, &mut monitor);

        let matching = self.complete(ctx.finish(), clock.start, unit_times, defects.len())?;
        let total = self.profile.total;
        let round_latencies = clock
            .decoded_at
            .iter()
            .zip(&clock.arrived_at)
            .map(|(decoded, arrived)| decoded.saturating_sub(*arrived))
            .collect();
        let violations = monitor.into_violations();
        info!(
            rounds = round_num,
            violations = violations.len(),
            ?total,
            "stream finished"
        );
        Ok(StreamReport {
            matching,
            violations,
            round_latencies,
            total,
        })
    }
}

fn drain_finished(
    receiver: &mpsc::Receiver<UnitEvent>,
    unit_times: &mut [Duration],
    clock: &mut RoundClock,
    monitor: &mut StreamMonitor,
) {
    while let Ok(event) = receiver.try_recv() {
        if let UnitEvent::Finished { unit, elapsed } = event {
            unit_times[unit] = elapsed;
            clock.on_finished(monitor, unit);
        }
    }
}
