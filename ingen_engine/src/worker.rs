//! The audio worker pool.
//!
//! Worker threads spin alongside the driver thread and steal children of
//! whichever parallel task is currently published. They never allocate,
//! never lock and never park while a cycle is active; between cycles they
//! yield to the scheduler.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::run_context::{RunContext, RunState};
use crate::task::ParallelTask;

/// State shared between the driver thread and the workers.
pub struct PoolShared {
    /// The parallel section currently accepting steals, or null.
    active: AtomicPtr<ParallelTask>,
    /// Engine shutdown.
    running: AtomicBool,
    /// A cycle is in flight; workers may dereference `active`.
    cycle_active: AtomicBool,
    /// Workers currently holding a pointer read from `active`. The driver
    /// waits for this to drain before ending the cycle, so no worker can
    /// touch a compiled graph that is about to be swapped out.
    stealers: AtomicUsize,
    // Cycle parameters for worker-side run contexts.
    cycle_start: AtomicU64,
    cycle_nframes: AtomicU32,
    sub_offset: AtomicU32,
    sub_end: AtomicU32,
}

impl PoolShared {
    fn new() -> Self {
        Self {
            active: AtomicPtr::new(core::ptr::null_mut()),
            running: AtomicBool::new(true),
            cycle_active: AtomicBool::new(false),
            stealers: AtomicUsize::new(0),
            cycle_start: AtomicU64::new(0),
            cycle_nframes: AtomicU32::new(0),
            sub_offset: AtomicU32::new(0),
            sub_end: AtomicU32::new(0),
        }
    }

    /// Offer a parallel section for stealing. Returns true if published
    /// (an inner section does not displace an already published outer one).
    pub(crate) fn publish(&self, task: &ParallelTask) -> bool {
        let ptr = task as *const ParallelTask as *mut ParallelTask;
        self.active
            .compare_exchange(
                core::ptr::null_mut(),
                ptr,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    pub(crate) fn unpublish(&self, task: &ParallelTask) {
        let ptr = task as *const ParallelTask as *mut ParallelTask;
        let _ = self
            .active
            .compare_exchange(ptr, core::ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed);
    }

    /// Steal one child from the published section, if any and if it is not
    /// `avoid` (the section the caller is already draining). Returns true
    /// if a child was run.
    pub(crate) fn help(&self, ctx: &RunContext, avoid: &ParallelTask) -> bool {
        if !self.cycle_active.load(Ordering::Acquire) {
            return false;
        }
        self.stealers.fetch_add(1, Ordering::AcqRel);
        let ptr = self.active.load(Ordering::Acquire);
        let stole = if ptr.is_null() || core::ptr::eq(ptr, avoid) {
            false
        } else {
            // Safety: `stealers` is nonzero, so the driver keeps the cycle
            // (and with it the compiled graph owning `ptr`) alive.
            unsafe { &*ptr }.steal(ctx)
        };
        self.stealers.fetch_sub(1, Ordering::AcqRel);
        stole
    }

    fn worker_loop(self: Arc<Self>, worker_id: usize, state: Arc<RunState>) {
        let mut idle_spins: u32 = 0;
        while self.running.load(Ordering::Acquire) {
            if !self.cycle_active.load(Ordering::Acquire) {
                std::thread::yield_now();
                continue;
            }
            self.stealers.fetch_add(1, Ordering::AcqRel);
            let ptr = self.active.load(Ordering::Acquire);
            if ptr.is_null() {
                self.stealers.fetch_sub(1, Ordering::AcqRel);
                core::hint::spin_loop();
                idle_spins += 1;
                if idle_spins > 10_000 {
                    std::thread::yield_now();
                    idle_spins = 0;
                }
                continue;
            }
            idle_spins = 0;
            let mut ctx = RunContext::new(state.clone(), 0);
            ctx.begin_cycle(
                self.cycle_start.load(Ordering::Acquire),
                self.cycle_nframes.load(Ordering::Acquire),
            );
            ctx.set_sub_range(
                self.sub_offset.load(Ordering::Acquire),
                self.sub_end.load(Ordering::Acquire),
            );
            ctx.worker_id = worker_id;
            ctx.pool = Some(self.clone());
            // Safety: as in `help`.
            while unsafe { &*ptr }.steal(&ctx) {}
            self.stealers.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Owns the worker threads. Created by the engine; the process side marks
/// cycles while driving the task tree.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `num_workers` helper threads (0 is fine: all tasks then run on
    /// the driver thread).
    pub fn new(num_workers: usize, state: Arc<RunState>) -> Self {
        let shared = Arc::new(PoolShared::new());
        let threads = (0..num_workers)
            .map(|i| {
                let shared = shared.clone();
                let state = state.clone();
                std::thread::Builder::new()
                    .name(format!("ingen-worker-{}", i + 1))
                    .spawn(move || shared.worker_loop(i + 1, state))
                    .expect("spawning a worker thread")
            })
            .collect();
        Self { shared, threads }
    }

    pub fn shared(&self) -> Arc<PoolShared> {
        self.shared.clone()
    }

    /// Mark the start of a cycle window and publish its parameters for
    /// worker-side run contexts.
    pub fn begin_cycle(&self, ctx: &RunContext) {
        self.shared.cycle_start.store(ctx.start, Ordering::Release);
        self.shared
            .cycle_nframes
            .store(ctx.nframes, Ordering::Release);
        self.shared.sub_offset.store(ctx.offset, Ordering::Release);
        self.shared.sub_end.store(ctx.sub_end, Ordering::Release);
        self.shared.cycle_active.store(true, Ordering::Release);
    }

    /// Mark the end of a cycle window and wait for stragglers to let go of
    /// the published section pointer.
    pub fn end_cycle(&self) {
        self.shared.cycle_active.store(false, Ordering::Release);
        while self.shared.stealers.load(Ordering::Acquire) > 0 {
            core::hint::spin_loop();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.cycle_active.store(false, Ordering::Release);
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}
