//! Worker pool with phase barriers.
//!
//! The batch engine runs as `P` scoped threads that alternate private
//! computation with global synchronization. This module owns that shape:
//! spawn the workers, hand each its index, and let it park at
//! [`WorkerCtx::phase_boundary`] until every worker reaches the same
//! point. Only pre-partitioned, ownership-disjoint data may be mutated
//! between two boundaries.
//!
//! A panicking worker poisons the barrier on unwind: peers parked at (or
//! arriving at) a boundary panic out of the round instead of waiting for
//! a participant that will never come, and the scoped join propagates
//! the failure.

use std::ops::Range;

use parking_lot::{Condvar, Mutex};

/// Per-worker handle inside a pool run.
pub(crate) struct WorkerCtx<'a> {
    /// This worker's index in `0..threads`.
    pub index: usize,

    barrier: &'a PhaseBarrier,
}

impl WorkerCtx<'_> {
    /// Block until every worker has reached the same boundary.
    ///
    /// # Panics
    ///
    /// Panics when another worker panicked, aborting this worker's share
    /// of the round as well.
    pub(crate) fn phase_boundary(&self) {
        self.barrier.wait();
    }
}

/// Reusable generation-counting barrier that can be poisoned.
struct PhaseBarrier {
    threads: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

#[derive(Default)]
struct BarrierState {
    waiting: usize,
    generation: u64,
    poisoned: bool,
}

impl PhaseBarrier {
    fn new(threads: usize) -> Self {
        Self {
            threads,
            state: Mutex::new(BarrierState::default()),
            cvar: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut state = self.state.lock();
        assert!(!state.poisoned, "batch round aborted by a worker panic");
        state.waiting += 1;
        if state.waiting == self.threads {
            state.waiting = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return;
        }
        let generation = state.generation;
        while state.generation == generation && !state.poisoned {
            self.cvar.wait(&mut state);
        }
        assert!(!state.poisoned, "batch round aborted by a worker panic");
    }

    fn poison(&self) {
        self.state.lock().poisoned = true;
        self.cvar.notify_all();
    }
}

/// Poisons the barrier when its worker unwinds.
struct PoisonOnPanic<'a>(&'a PhaseBarrier);

impl Drop for PoisonOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.poison();
        }
    }
}

/// Fixed-size pool of workers marching through barrier-separated phases.
pub(crate) struct PhasedPool {
    threads: usize,
    barrier: PhaseBarrier,
}

impl PhasedPool {
    pub(crate) fn new(threads: usize) -> Self {
        Self {
            threads,
            barrier: PhaseBarrier::new(threads),
        }
    }

    /// Run `body` once per worker on scoped threads and join them all.
    ///
    /// A panic in any worker poisons the barrier, releases every parked
    /// peer, and propagates out of the scoped join; no partial completion
    /// is reported.
    pub(crate) fn run<F>(&self, body: F)
    where
        F: Fn(WorkerCtx<'_>) + Sync,
    {
        std::thread::scope(|scope| {
            for index in 0..self.threads {
                let body = &body;
                let barrier = &self.barrier;
                scope.spawn(move || {
                    let _poison = PoisonOnPanic(barrier);
                    body(WorkerCtx { index, barrier });
                });
            }
        });
    }
}

/// Slice of a `len`-item batch assigned to worker `index` out of
/// `threads`, remainder items going to the earlier workers.
pub(crate) fn chunk(len: usize, threads: usize, index: usize) -> Range<usize> {
    let base = len / threads;
    let extra = len % threads;
    let start = index * base + index.min(extra);
    let end = start + base + usize::from(index < extra);
    start..end
}
