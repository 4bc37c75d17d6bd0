//! The structural-change pipeline.
//!
//! Every client mutation is an [`Event`] that travels
//! `pre_process -> execute -> post_process`:
//!
//! 1. `pre_process` runs on the pre-process worker with the store mutex
//!    held. It validates, allocates and builds every replacement structure
//!    the change needs (voice arrays, source lists, compiled graphs), and
//!    constructs the inverse event(s) for undo.
//! 2. `execute` runs on the audio thread at a cycle boundary. It is
//!    allocation-free: prepared structures are swapped into place and the
//!    replaced ones stay in the event.
//! 3. `post_process` runs back on the non-real-time side: client
//!    notifications go out, replaced structures are dropped, and the
//!    inverse lands on the undo or redo stack.
//!
//! No event reaches `execute` without a successful `pre_process`.

use std::sync::Mutex;

use ingen_core::{Atom, CoreUrids, Path, Properties, Status, Uri, UridMap};

use crate::block::Block;
use crate::broadcaster::{Broadcaster, ClientId};
use crate::buffer_factory::BufferFactory;
use crate::compiled_graph::CompiledGraph;
use crate::control_bindings::ControlBindings;
use crate::graph::GraphImpl;
use crate::host::PluginRegistry;
use crate::run_context::RunContext;
use crate::store::Store;
use crate::undo::UndoStack;

pub mod connect;
pub mod create;
pub mod delta;
pub mod get;
pub mod structure;

pub use connect::{Connect, Disconnect, DisconnectAll};
pub use create::Put;
pub use delta::{Delta, SetPortValue};
pub use get::Get;
pub use structure::{Copy, Delete, Move};

/// Bundle state threaded through pre-processing: while a bundle is open,
/// graph compilation is deferred and recorded here.
#[derive(Default)]
pub struct BundleState {
    pub open: bool,
    /// Graphs whose structure changed inside the open bundle.
    pub dirty: Vec<*mut GraphImpl>,
}

impl BundleState {
    pub fn mark_dirty(&mut self, graph: *mut GraphImpl) {
        if !self.dirty.iter().any(|&g| core::ptr::eq(g, graph)) {
            self.dirty.push(graph);
        }
    }
}

/// Everything `pre_process` may touch. Borrowed from the engine for the
/// duration of one event batch.
pub struct PreProcessContext<'a> {
    pub store: &'a Mutex<Store>,
    pub factory: &'a mut BufferFactory,
    pub urids: &'a CoreUrids,
    pub urid_map: &'a UridMap,
    pub registry: &'a mut PluginRegistry,
    pub bindings: &'a ControlBindings,
    /// The root graph block (`/`).
    pub root: *mut Block,
    pub sample_rate: u32,
    pub poly_limit: u32,
    pub bundle: &'a mut BundleState,
}

impl PreProcessContext<'_> {
    /// Compile `graph` now, or defer to bundle end. `Ok(None)` means the
    /// compile was deferred.
    pub fn compile_or_defer(
        &mut self,
        graph: &mut GraphImpl,
    ) -> Result<Option<Box<CompiledGraph>>, Status> {
        if self.bundle.open {
            self.bundle.mark_dirty(graph);
            return Ok(None);
        }
        match crate::compiled_graph::compile(graph) {
            Ok(compiled) => {
                graph.dirty = false;
                Ok(Some(compiled))
            }
            Err(e) => {
                log::warn!("graph `{}` failed to compile: {}", graph.path(), e);
                Err(Status::CompilationFailed)
            }
        }
    }
}

/// Everything `post_process` may touch.
pub struct PostProcessContext<'a> {
    pub broadcaster: &'a Broadcaster,
    pub undo_stack: &'a mut UndoStack,
    pub redo_stack: &'a mut UndoStack,
}

/// Whether an event is a fresh client request or a replay from one of the
/// history stacks; decides which stack its inverse lands on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventMode {
    Normal,
    Undo,
    Redo,
}

/// Bundle delimiters.
pub struct Mark {
    pub begin: bool,
    /// Compiled graphs prepared at bundle end, installed in execute.
    pub(crate) prepared: Vec<(*mut GraphImpl, Option<Box<CompiledGraph>>)>,
}

impl Mark {
    pub fn begin() -> Self {
        Self {
            begin: true,
            prepared: Vec::new(),
        }
    }
    pub fn end() -> Self {
        Self {
            begin: false,
            prepared: Vec::new(),
        }
    }

    fn pre_process(&mut self, ctx: &mut PreProcessContext) -> Status {
        if self.begin {
            ctx.bundle.open = true;
            return Status::Success;
        }
        ctx.bundle.open = false;
        let dirty = core::mem::take(&mut ctx.bundle.dirty);
        for graph in dirty {
            // Safety: graphs outlive the bundle; pre-process side access.
            let graph_ref = unsafe { &mut *graph };
            match crate::compiled_graph::compile(graph_ref) {
                Ok(compiled) => {
                    graph_ref.dirty = false;
                    self.prepared.push((graph, Some(compiled)));
                }
                Err(e) => {
                    log::warn!("graph `{}` failed to compile: {}", graph_ref.path(), e);
                    return Status::CompilationFailed;
                }
            }
        }
        Status::Success
    }

    fn execute(&mut self, _ctx: &RunContext) {
        for (graph, compiled) in self.prepared.iter_mut() {
            // Safety: audio-thread swap per the event protocol.
            let old = unsafe { &mut **graph }.swap_compiled(compiled.take());
            *compiled = old;
        }
    }
}

/// The kind-specific payload of an event.
pub enum EventKind {
    Put(Put),
    Delta(Delta),
    Connect(Connect),
    Disconnect(Disconnect),
    DisconnectAll(DisconnectAll),
    Delete(Delete),
    Move(Move),
    Copy(Copy),
    Get(Get),
    Mark(Mark),
    SetPortValue(SetPortValue),
    /// Replay the newest undo entry. Expanded by the engine, never
    /// pre-processed itself.
    Undo,
    /// Replay the newest redo entry.
    Redo,
}

pub struct Event {
    pub client: ClientId,
    pub seq: i32,
    /// Frame time the request was stamped with; executed in the first
    /// cycle whose end passes it.
    pub time: u64,
    pub mode: EventMode,
    pub kind: EventKind,
    pub(crate) status: Option<Status>,
    /// Inverse events, ordered so that replaying them *reversed* undoes
    /// this event.
    pub(crate) undo_events: Vec<Event>,
}

// Safety: prepared state inside event kinds holds raw pointers to blocks,
// ports and graphs. All of them are kept alive until the event is fully
// post-processed: objects are only disposed of by the event that removed
// them, after its own execute ran.
unsafe impl Send for Event {}

impl Event {
    pub fn new(client: ClientId, seq: i32, kind: EventKind) -> Self {
        Self {
            client,
            seq,
            time: 0,
            mode: EventMode::Normal,
            kind,
            status: None,
            undo_events: Vec::new(),
        }
    }

    pub fn with_mode(mut self, mode: EventMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn status(&self) -> Option<Status> {
        self.status
    }

    /// True for events whose execute must happen alone at a cycle boundary
    /// (polyphony application). Known after pre-processing.
    pub fn is_atomic(&self) -> bool {
        match &self.kind {
            EventKind::Delta(e) => e.is_atomic(),
            EventKind::Put(e) => e.is_atomic(),
            _ => false,
        }
    }

    /// Phase 1. Pre-process thread. Returns the status reported to the
    /// client.
    pub fn pre_process(&mut self, ctx: &mut PreProcessContext) -> Status {
        let status = match &mut self.kind {
            EventKind::Put(e) => e.pre_process(ctx, &mut self.undo_events),
            EventKind::Delta(e) => e.pre_process(ctx, &mut self.undo_events),
            EventKind::Connect(e) => e.pre_process(ctx, &mut self.undo_events),
            EventKind::Disconnect(e) => e.pre_process(ctx, &mut self.undo_events),
            EventKind::DisconnectAll(e) => e.pre_process(ctx, &mut self.undo_events),
            EventKind::Delete(e) => e.pre_process(ctx, &mut self.undo_events),
            EventKind::Move(e) => e.pre_process(ctx, &mut self.undo_events),
            EventKind::Copy(e) => e.pre_process(ctx, &mut self.undo_events),
            EventKind::Get(e) => e.pre_process(ctx),
            EventKind::Mark(e) => e.pre_process(ctx),
            EventKind::SetPortValue(e) => e.pre_process(ctx, &mut self.undo_events),
            EventKind::Undo | EventKind::Redo => Status::BadRequest,
        };
        self.status = Some(status);
        status
    }

    /// Phase 2. Audio thread, cycle boundary. Never runs for failed
    /// events; allocation-free.
    pub fn execute(&mut self, ctx: &RunContext) {
        if self.status != Some(Status::Success) {
            return;
        }
        match &mut self.kind {
            EventKind::Put(e) => e.execute(ctx),
            EventKind::Delta(e) => e.execute(ctx),
            EventKind::Connect(e) => e.execute(ctx),
            EventKind::Disconnect(e) => e.execute(ctx),
            EventKind::DisconnectAll(e) => e.execute(ctx),
            EventKind::Delete(e) => e.execute(ctx),
            EventKind::Move(_) => {}
            EventKind::Copy(e) => e.execute(ctx),
            EventKind::Get(_) => {}
            EventKind::Mark(e) => e.execute(ctx),
            EventKind::SetPortValue(e) => e.execute(ctx),
            EventKind::Undo | EventKind::Redo => {}
        }
    }

    /// Phase 3. Non-real-time side: notify, dispose, record history.
    /// Consumes the event; replaced structures drop here.
    pub fn post_process(mut self, ctx: &mut PostProcessContext) {
        let status = self.status.unwrap_or(Status::InternalError);
        if self.client != 0 {
            ctx.broadcaster.send_to(self.client, |c| {
                c.response(self.seq, status, None);
            });
        }
        if status == Status::Success {
            match &mut self.kind {
                EventKind::Put(e) => e.post_process(ctx),
                EventKind::Delta(e) => e.post_process(ctx),
                EventKind::Connect(e) => e.post_process(ctx),
                EventKind::Disconnect(e) => e.post_process(ctx),
                EventKind::DisconnectAll(e) => e.post_process(ctx),
                EventKind::Delete(e) => e.post_process(ctx),
                EventKind::Move(e) => e.post_process(ctx),
                EventKind::Copy(e) => e.post_process(ctx),
                EventKind::Get(e) => e.post_process(ctx, self.client),
                EventKind::Mark(e) => {
                    // History bundling happens on whichever stack this
                    // event's inverses would land on.
                    let stack = match self.mode {
                        EventMode::Normal | EventMode::Redo => &mut *ctx.undo_stack,
                        EventMode::Undo => &mut *ctx.redo_stack,
                    };
                    if e.begin {
                        stack.begin_bundle();
                        ctx.broadcaster.bundle_begin();
                    } else {
                        stack.end_bundle();
                        ctx.broadcaster.bundle_end();
                    }
                }
                EventKind::SetPortValue(e) => e.post_process(ctx),
                EventKind::Undo | EventKind::Redo => {}
            }
            let inverses = core::mem::take(&mut self.undo_events);
            match self.mode {
                EventMode::Normal => {
                    for inverse in inverses {
                        ctx.undo_stack.push(inverse);
                    }
                }
                EventMode::Undo => {
                    for inverse in inverses {
                        ctx.redo_stack.push(inverse);
                    }
                }
                // Redoing pushes a fresh undo entry via the events the redo
                // replayed; nothing extra to record.
                EventMode::Redo => {
                    for inverse in inverses {
                        ctx.undo_stack.push(inverse);
                    }
                }
            }
        }
    }
}

/// Well-known property keys and type URIs of the client protocol.
pub mod keys {
    use ingen_core::Uri;

    pub const PROTOTYPE: &str = "ingen:#prototype";
    pub const TYPE: &str = "rdf:type";
    pub const TYPE_GRAPH: &str = "ingen:#Graph";
    pub const TYPE_INPUT_PORT: &str = "ingen:#InputPort";
    pub const TYPE_OUTPUT_PORT: &str = "ingen:#OutputPort";
    pub const PORT_TYPE: &str = "ingen:#portType";
    pub const PORT_TYPE_AUDIO: &str = "http://lv2plug.in/ns/lv2core#AudioPort";
    pub const PORT_TYPE_CONTROL: &str = "http://lv2plug.in/ns/lv2core#ControlPort";
    pub const PORT_TYPE_CV: &str = "http://lv2plug.in/ns/lv2core#CVPort";
    pub const PORT_TYPE_ATOM: &str = "http://lv2plug.in/ns/ext/atom#AtomPort";
    pub const POLYPHONY: &str = "ingen:#polyphony";
    pub const POLYPHONIC: &str = "ingen:#polyphonic";
    pub const ENABLED: &str = "ingen:#enabled";
    pub const VALUE: &str = "ingen:#value";
    pub const MINIMUM: &str = "ingen:#minimum";
    pub const MAXIMUM: &str = "ingen:#maximum";
    pub const MONITORED: &str = "ingen:#monitored";
    pub const BINDING: &str = "ingen:#binding";

    pub fn uri(s: &str) -> Uri {
        Uri::parse(s).expect("well-known key URIs are valid")
    }
}

/// Shared resolution helpers for event kinds.
pub(crate) mod resolve {
    use super::*;

    /// The parent graph of the object at `path`: the graph block that owns
    /// it plus its graph body.
    ///
    /// Safety contract: returned pointers are live for the duration of
    /// pre-processing (store mutex held).
    pub fn parent_graph(store: &Store, path: &Path) -> Result<*mut Block, Status> {
        let parent = path.parent().ok_or(Status::NotDeletable)?;
        let block = store.block(&parent).map_err(|e| match e {
            Status::NotFound => Status::ParentNotFound,
            other => other,
        })?;
        // Safety: live per the store invariant.
        if unsafe { &*block }.graph().is_none() {
            return Err(Status::BadObjectType);
        }
        Ok(block)
    }

    /// Object properties snapshot used by Get and inverse construction.
    pub fn describe(block: &Block) -> (Uri, Properties) {
        let mut props = block.properties.clone();
        props.put(
            &Uri::parse("ingen:#prototype").expect("valid"),
            ingen_core::Property::new(Atom::Uri(block.plugin_uri().clone())),
        );
        (Uri::from_path(block.path()), props)
    }
}
