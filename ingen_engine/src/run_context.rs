//! Per-cycle execution state for the audio thread.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// State shared by every worker participating in one cycle.
///
/// The error flag is the only side channel the audio thread has for internal
/// invariant violations; the pre-process worker reads and clears it between
/// cycles and emits a client notification.
pub struct RunState {
    pub(crate) error_flag: AtomicBool,
}

impl RunState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            error_flag: AtomicBool::new(false),
        })
    }
    pub fn flag_error(&self) {
        self.error_flag.store(true, Ordering::Relaxed);
    }
    /// Read and clear. Pre-process thread only.
    pub fn take_error(&self) -> bool {
        self.error_flag.swap(false, Ordering::Relaxed)
    }
}

/// The sample range and identity a task runs with.
///
/// `offset..sub_end` narrows the active frames within the cycle so that
/// events landing mid-cycle split the cycle: blocks run once per sub-range.
#[derive(Clone)]
pub struct RunContext {
    /// Absolute frame time of the start of this cycle.
    pub start: u64,
    /// Absolute frame time of the end of this cycle (exclusive).
    pub end: u64,
    /// Number of frames in the cycle.
    pub nframes: u32,
    /// First active frame within the cycle.
    pub offset: u32,
    /// One past the last active frame within the cycle.
    pub sub_end: u32,
    /// Which worker is running: 0 is the driver thread.
    pub worker_id: usize,
    pub(crate) state: Arc<RunState>,
    /// Steal pool, when a worker pool is attached to the engine.
    pub(crate) pool: Option<Arc<crate::worker::PoolShared>>,
}

impl RunContext {
    pub fn new(state: Arc<RunState>, nframes: u32) -> Self {
        Self {
            start: 0,
            end: nframes as u64,
            nframes,
            offset: 0,
            sub_end: nframes,
            worker_id: 0,
            state,
            pool: None,
        }
    }

    pub(crate) fn with_pool(mut self, pool: Arc<crate::worker::PoolShared>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// A context for a worker thread joining the same cycle.
    pub fn for_worker(&self, worker_id: usize) -> Self {
        let mut ctx = self.clone();
        ctx.worker_id = worker_id;
        ctx
    }

    /// Advance the cycle window to `[start, start + nframes)` with a full
    /// sub-range.
    pub fn begin_cycle(&mut self, start: u64, nframes: u32) {
        self.start = start;
        self.end = start + nframes as u64;
        self.nframes = nframes;
        self.offset = 0;
        self.sub_end = nframes;
    }

    /// Narrow the active sample range. Used for event-driven cycle splits.
    pub fn set_sub_range(&mut self, offset: u32, sub_end: u32) {
        debug_assert!(offset <= sub_end && sub_end <= self.nframes);
        self.offset = offset;
        self.sub_end = sub_end;
    }

    /// Number of active frames in the current sub-range.
    pub fn sub_frames(&self) -> u32 {
        self.sub_end - self.offset
    }

    pub fn flag_error(&self) {
        self.state.flag_error();
    }
}
