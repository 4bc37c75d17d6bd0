//! Units of audio-thread work.
//!
//! A compiled graph is a tree of tasks: run one block, run children in
//! order, or run children in any order with other workers stealing their
//! share. Claiming is an atomic fetch-and-increment over the child index;
//! completion is an atomic counter. The final drain busy-waits (the audio
//! thread never parks), helping other published sections while it spins.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::block::Block;
use crate::run_context::RunContext;

pub enum Task {
    /// Run one block.
    Single(*mut Block),
    /// Run children left to right on the current worker.
    Sequential(Vec<Task>),
    /// Run children in any order, possibly concurrently; completes only
    /// when every child is done.
    Parallel(ParallelTask),
}

// Safety: block pointers are kept alive by the compiled graph's block-map
// Arc, and each block occurs exactly once in the tree, so concurrent
// workers never run the same block.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    pub fn run(&self, ctx: &RunContext) {
        match self {
            Task::Single(block) => {
                // Safety: unique claim; see the Send impl above.
                unsafe { &mut **block }.process(ctx);
            }
            Task::Sequential(children) => {
                for child in children {
                    child.run(ctx);
                }
            }
            Task::Parallel(par) => par.run(ctx),
        }
    }

    /// All `Single` block pointers in this subtree, in execution order for
    /// sequential parts. Test and inspection helper.
    pub fn collect_blocks(&self, out: &mut Vec<*mut Block>) {
        match self {
            Task::Single(block) => out.push(*block),
            Task::Sequential(children) | Task::Parallel(ParallelTask { children, .. }) => {
                for child in children {
                    child.collect_blocks(out);
                }
            }
        }
    }
}

pub struct ParallelTask {
    pub(crate) children: Vec<Task>,
    /// Next unclaimed child.
    next: AtomicUsize,
    /// Number of completed children.
    done: AtomicUsize,
}

impl ParallelTask {
    pub fn new(children: Vec<Task>) -> Self {
        Self {
            children,
            next: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
        }
    }

    /// Claim one unclaimed child and run it. Returns false when no
    /// unclaimed children remain.
    pub(crate) fn steal(&self, ctx: &RunContext) -> bool {
        let i = self.next.fetch_add(1, Ordering::AcqRel);
        if i >= self.children.len() {
            return false;
        }
        self.children[i].run(ctx);
        self.done.fetch_add(1, Ordering::AcqRel);
        true
    }

    fn run(&self, ctx: &RunContext) {
        // Exactly one caller per cycle reaches this point for a given
        // parallel task (the tree runs each node once), so resetting the
        // counters before publishing is race free.
        self.next.store(0, Ordering::Relaxed);
        self.done.store(0, Ordering::Release);

        let published = match &ctx.pool {
            Some(pool) if self.children.len() > 1 => pool.publish(self),
            _ => false,
        };

        while self.steal(ctx) {}

        // Drain: all children claimed, but stolen ones may still be
        // running. Help elsewhere rather than just burning the core.
        let mut spins: u32 = 0;
        while self.done.load(Ordering::Acquire) < self.children.len() {
            if let Some(pool) = &ctx.pool {
                if pool.help(ctx, self) {
                    continue;
                }
            }
            core::hint::spin_loop();
            spins += 1;
            if spins > 10_000 {
                // Long drain; give the OS scheduler a hint but never park.
                std::thread::yield_now();
                spins = 0;
            }
        }

        if published {
            if let Some(pool) = &ctx.pool {
                pool.unpublish(self);
            }
        }
    }
}
