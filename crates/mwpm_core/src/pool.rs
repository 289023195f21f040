//! Persistent worker pool with separate leaf and fusion queues.
//!
//! Workers are plain OS threads created once per solver and reused across
//! solves. Jobs come in two kinds. Leaf jobs are independent and can run in
//! any order; fusion jobs are submitted only once both children are done.
//! Picking the next job follows an interleaving rule: a queued fusion job
//! runs as soon as `depth` leaf jobs have been taken since the last fusion,
//! or immediately when no leaf job is waiting. Both queues are drained
//! before a shutdown takes effect.

use crate::config::{SolverConfig, SyncStyle};
use crate::error::{MwpmError, Result};
use crate::smp::{SpinLock, relax};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

/// Unit of work executed by a pool thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Queue a job is submitted to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobKind {
    Leaf,
    Fusion,
}

#[derive(Default)]
struct QueueState {
    leaves: VecDeque<Job>,
    fusions: VecDeque<Job>,
    leaves_since_fusion: usize,
    shutdown: bool,
}

impl QueueState {
    fn push(&mut self, kind: JobKind, job: Job) {
        match kind {
            JobKind::Leaf => self.leaves.push_back(job),
            JobKind::Fusion => self.fusions.push_back(job),
        }
    }

    fn pop(&mut self, depth: usize) -> Option<Job> {
        if !self.fusions.is_empty() && (self.leaves.is_empty() || self.leaves_since_fusion >= depth) {
            self.leaves_since_fusion = 0;
            return self.fusions.pop_front();
        }
        let job = self.leaves.pop_front()?;
        self.leaves_since_fusion += 1;
        Some(job)
    }
}

enum Injector {
    Spin(SpinLock<QueueState>),
    Blocking {
        state: Mutex<QueueState>,
        ready: Condvar,
    },
}

struct Shared {
    injector: Injector,
    depth: usize,
}

impl Shared {
    fn submit(&self, kind: JobKind, job: Job) {
        match &self.injector {
            Injector::Spin(state) => state.lock().push(kind, job),
            Injector::Blocking { state, ready } => {
                state.lock().unwrap_or_else(|e| e.into_inner()).push(kind, job);
                ready.notify_one();
            }
        }
    }

    fn shutdown(&self) {
        match &self.injector {
            Injector::Spin(state) => state.lock().shutdown = true,
            Injector::Blocking { state, ready } => {
                state.lock().unwrap_or_else(|e| e.into_inner()).shutdown = true;
                ready.notify_all();
            }
        }
    }

    /// Blocks until a job is available; `None` once shut down and drained.
    fn next_job(&self) -> Option<Job> {
        match &self.injector {
            Injector::Spin(state) => {
                let mut spins = 0;
                loop {
                    {
                        let mut q = state.lock();
                        if let Some(job) = q.pop(self.depth) {
                            return Some(job);
                        }
                        if q.shutdown {
                            return None;
                        }
                    }
                    relax(&mut spins);
                }
            }
            Injector::Blocking { state, ready } => {
                let mut q = state.lock().unwrap_or_else(|e| e.into_inner());
                loop {
                    if let Some(job) = q.pop(self.depth) {
                        return Some(job);
                    }
                    if q.shutdown {
                        return None;
                    }
                    q = ready.wait(q).unwrap_or_else(|e| e.into_inner());
                }
            }
        }
    }
}

/// Cloneable handle for submitting jobs from inside other jobs.
#[derive(Clone)]
pub struct Submitter(Arc<Shared>);

impl Submitter {
    pub fn submit(&self, kind: JobKind, job: Job) {
        self.0.submit(kind, job);
    }
}

/// Fixed set of worker threads fed from the two job queues.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `config.resolved_threads()` workers.
    pub fn new(config: &SolverConfig) -> Result<Self> {
        let thread_num = config.resolved_threads();
        let injector = match config.sync_style {
            SyncStyle::Spin => Injector::Spin(SpinLock::new(QueueState::default())),
            SyncStyle::Blocking => Injector::Blocking {
                state: Mutex::new(QueueState::default()),
                ready: Condvar::new(),
            },
        };
        let shared = Arc::new(Shared {
            injector,
            depth: config.resolved_interleaving_depth(),
        });

        let core_num = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(thread_num),
        };
        for index in 0..thread_num {
            let shared = Arc::clone(&pool.shared);
            let pin = config.pin_threads_to_cores.then_some(index % core_num);
            let handle = std::thread::Builder::new()
                .name(format!("mwpm-worker-{}", index))
                .spawn(move || worker_loop(index, pin, shared))
                .map_err(|e| MwpmError::WorkerFailure(format!("spawn worker {}: {}", index, e)))?;
            pool.workers.push(handle);
        }
        debug!(
            threads = thread_num,
            depth = pool.shared.depth,
            style = ?config.sync_style,
            "worker pool started"
        );
        Ok(pool)
    }

    pub fn thread_num(&self) -> usize {
        self.workers.len()
    }

    pub fn interleaving_depth(&self) -> usize {
        self.shared.depth
    }

    pub fn submit(&self, kind: JobKind, job: Job) {
        self.shared.submit(kind, job);
    }

    pub fn submitter(&self) -> Submitter {
        Submitter(Arc::clone(&self.shared))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("worker thread exited with a panic");
            }
        }
    }
}

fn worker_loop(index: usize, pin: Option<usize>, shared: Arc<Shared>) {
    if let Some(core) = pin {
        if !pin_to_core(core) {
            warn!(worker = index, core, "could not pin worker thread");
        }
    }
    while let Some(job) = shared.next_job() {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(worker = index, "job panicked");
        }
    }
}

#[cfg(target_os = "linux")]
fn pin_to_core(core_id: usize) -> bool {
    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core_id, &mut cpuset);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpuset) == 0
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_core(_core_id: usize) -> bool {
    false
}
