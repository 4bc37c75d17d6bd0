//! Graphs: blocks whose body is another graph of blocks and arcs.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::HashMap;
use std::sync::Arc;

use ingen_core::Path;
use slotmap::{SlotMap, new_key_type};
use smallvec::SmallVec;

use crate::arc::ArcImpl;
use crate::block::{Block, Ports};
use crate::compiled_graph::CompiledGraph;
use crate::port::Port;
use crate::run_context::RunContext;

/// Unique id identifying a graph, minted from a process-wide counter.
pub type GraphId = u64;

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

new_key_type! {
    /// Block identifier within one graph's slot map.
    pub struct BlockKey;
}

/// The body of a graph block.
///
/// The slot map of child blocks is shared (via `Arc`) with every compiled
/// graph built from it, so dropping the editing side never invalidates task
/// pointers still owned by the audio thread. Blocks are boxed so their
/// addresses survive slot map growth.
pub struct GraphImpl {
    id: GraphId,
    path: Path,
    pub(crate) blocks: Arc<UnsafeCell<SlotMap<BlockKey, Box<Block>>>>,
    pub(crate) arcs: HashMap<(Path, Path), ArcImpl>,
    /// Polyphony as the pre-process side sees it.
    internal_poly: u32,
    /// Polyphony as the audio thread sees it; updated by the apply phase of
    /// a polyphony event.
    internal_poly_process: u32,
    enabled: bool,
    /// The task tree the audio thread runs. Swapped atomically (whole-cycle
    /// granularity) by events; pre-process only writes it through an event's
    /// execute phase or before the graph is audio-visible.
    pub(crate) compiled: Option<Box<CompiledGraph>>,
    /// Structure changed since the last compile.
    pub(crate) dirty: bool,
}

// Safety: see `blocks`; cross-thread access follows the event protocol.
unsafe impl Send for GraphImpl {}
unsafe impl Sync for GraphImpl {}

impl GraphImpl {
    pub fn new(path: Path, internal_poly: u32) -> Self {
        Self {
            id: NEXT_GRAPH_ID.fetch_add(1, Ordering::SeqCst),
            path,
            blocks: Arc::new(UnsafeCell::new(SlotMap::with_key())),
            arcs: HashMap::new(),
            internal_poly,
            internal_poly_process: internal_poly,
            enabled: true,
            compiled: None,
            dirty: true,
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }
    pub fn path(&self) -> &Path {
        &self.path
    }
    pub fn internal_poly(&self) -> u32 {
        self.internal_poly
    }
    pub fn internal_poly_process(&self) -> u32 {
        self.internal_poly_process
    }
    pub(crate) fn set_internal_poly(&mut self, poly: u32) {
        self.internal_poly = poly;
    }
    pub(crate) fn apply_internal_poly(&mut self, poly: u32) {
        self.internal_poly_process = poly;
    }
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Shared handle to the block storage, for compiled graphs to keep the
    /// allocation alive.
    pub(crate) fn blocks_arc(&self) -> Arc<UnsafeCell<SlotMap<BlockKey, Box<Block>>>> {
        self.blocks.clone()
    }

    pub(crate) fn blocks(&self) -> &SlotMap<BlockKey, Box<Block>> {
        // Safety: the audio thread never touches the slot map itself, only
        // raw block pointers inside tasks; map access is confined to the
        // pre-process side.
        unsafe { &*self.blocks.get() }
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) fn blocks_mut(&self) -> &mut SlotMap<BlockKey, Box<Block>> {
        // Safety: as `blocks`; the pre-process side is single threaded.
        unsafe { &mut *self.blocks.get() }
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks().len()
    }
    pub fn num_arcs(&self) -> usize {
        self.arcs.len()
    }

    /// Add a child block. Pre-process only. The block's parent pointer is
    /// set to this graph.
    pub fn add_block(&mut self, mut block: Box<Block>) -> BlockKey {
        block.parent = self;
        self.dirty = true;
        self.blocks_mut().insert(block)
    }

    /// Detach and return a child block. The caller is responsible for only
    /// doing this once no compiled graph references the block.
    pub fn remove_block(&mut self, key: BlockKey) -> Option<Box<Block>> {
        self.dirty = true;
        self.blocks_mut().remove(key)
    }

    pub fn block(&self, key: BlockKey) -> Option<&Block> {
        self.blocks().get(key).map(|b| &**b)
    }
    pub fn block_mut(&mut self, key: BlockKey) -> Option<&mut Block> {
        self.blocks_mut().get_mut(key).map(|b| &mut **b)
    }

    pub fn block_key_by_path(&self, path: &Path) -> Option<BlockKey> {
        self.blocks()
            .iter()
            .find(|(_, b)| b.path() == path)
            .map(|(k, _)| k)
    }

    pub fn has_arc(&self, tail: &Path, head: &Path) -> bool {
        self.arcs.contains_key(&(tail.clone(), head.clone()))
    }

    /// Record an arc. Pre-process only; the head port's audio-side source
    /// list is installed separately by the event's execute phase.
    pub fn add_arc(&mut self, arc: ArcImpl) {
        self.dirty = true;
        self.arcs
            .insert((arc.tail_path.clone(), arc.head_path.clone()), arc);
    }

    pub fn remove_arc(&mut self, tail: &Path, head: &Path) -> Option<ArcImpl> {
        self.dirty = true;
        self.arcs.remove(&(tail.clone(), head.clone()))
    }

    /// All arcs incident to a path (a port, or every port of a block).
    pub fn incident_arcs(&self, path: &Path) -> Vec<(Path, Path)> {
        self.arcs
            .keys()
            .filter(|(t, h)| {
                t == path || h == path || path.is_parent_of(t) || path.is_parent_of(h)
            })
            .cloned()
            .collect()
    }

    /// The tails currently feeding `head`, in insertion-independent but
    /// deterministic (path sorted) order. Used to prepare a head port's
    /// audio-side source list.
    pub fn sources_for(&self, head: *mut Port) -> SmallVec<[*const Port; 2]> {
        let mut arcs: Vec<&ArcImpl> = self.arcs.values().filter(|a| a.head == head).collect();
        arcs.sort_by(|a, b| a.tail_path.cmp(&b.tail_path));
        arcs.iter().map(|a| a.tail as *const Port).collect()
    }

    /// The number of arcs into `head`.
    pub fn num_arcs_into(&self, head: *mut Port) -> usize {
        self.arcs.values().filter(|a| a.head == head).count()
    }

    /// Rename this graph and every object below it. Pre-process thread,
    /// store mutex held by the caller (which also re-indexes the store).
    pub(crate) fn set_path(&mut self, path: Path) {
        let old = core::mem::replace(&mut self.path, path.clone());
        let keys: Vec<BlockKey> = self.blocks().keys().collect();
        for key in keys {
            let block = self.blocks_mut().get_mut(key).expect("key just listed");
            let symbol = block
                .path()
                .symbol()
                .expect("child blocks are below the root");
            block.set_path(path.child(&symbol));
        }
        let arcs = core::mem::take(&mut self.arcs);
        self.arcs = arcs
            .into_iter()
            .map(|((t, h), mut arc)| {
                let t = t.rebased(&old, &path).unwrap_or(t);
                let h = h.rebased(&old, &path).unwrap_or(h);
                arc.tail_path = t.clone();
                arc.head_path = h.clone();
                ((t, h), arc)
            })
            .collect();
    }

    /// Install a new compiled graph. Audio thread (event execute), or
    /// pre-process before the graph is first exposed. Returns the replaced
    /// tree for disposal off the audio thread.
    pub fn swap_compiled(&mut self, new: Option<Box<CompiledGraph>>) -> Option<Box<CompiledGraph>> {
        core::mem::replace(&mut self.compiled, new)
    }

    /// Run one cycle. Audio thread.
    ///
    /// `ports` is the owning block's port array: this graph's own boundary
    /// ports. Input mixing for them happened in the parent context; output
    /// collection happens here after the task tree has run.
    pub fn process(&mut self, ctx: &RunContext, ports: &mut Ports) {
        if !self.enabled {
            // The containing context hears silence.
            for port in ports.iter_mut() {
                if port.direction().is_output() {
                    for voice in port.voices().iter() {
                        // Safety: children are not running, so even joined
                        // buffers have no other writer this cycle.
                        unsafe { voice.buffer.get_mut() }.clear(ctx);
                    }
                }
            }
            return;
        }
        if let Some(compiled) = &self.compiled {
            compiled.run(ctx);
        }
        // Collect child outputs into this graph's own output ports.
        for port in ports.iter_mut() {
            if port.direction().is_output() {
                port.pre_run(ctx);
                port.monitor_cycle(ctx);
            }
        }
    }
}
