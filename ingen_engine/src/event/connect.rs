//! Connect, Disconnect and DisconnectAll.

use ingen_core::{Path, Status};
use smallvec::SmallVec;

use crate::arc::{ArcImpl, can_connect};
use crate::buffer_factory::BufferFactory;
use crate::compiled_graph::CompiledGraph;
use crate::event::{Event, EventKind, PostProcessContext, PreProcessContext};
use crate::graph::{BlockKey, GraphImpl};
use crate::port::{Port, Voices};
use crate::run_context::RunContext;
use crate::store::Store;

/// Resolved endpoints of an arc and the graph that owns it.
pub(crate) struct ArcEndpoints {
    pub graph: *mut GraphImpl,
    pub tail: *mut Port,
    pub head: *mut Port,
    pub tail_block: Option<BlockKey>,
    pub head_block: Option<BlockKey>,
}

/// Work out which graph an arc between these paths belongs to: both
/// endpoints children of the same graph, or one endpoint a port of the
/// graph itself (duplex connection through the graph boundary).
pub(crate) fn resolve_endpoints(
    store: &Store,
    tail_path: &Path,
    head_path: &Path,
) -> Result<ArcEndpoints, Status> {
    let tail = store.port(tail_path)?;
    let head = store.port(head_path)?;
    let tail_block_path = tail_path.parent().ok_or(Status::BadUri)?;
    let head_block_path = head_path.parent().ok_or(Status::BadUri)?;
    let tb = store.block(&tail_block_path)?;
    let hb = store.block(&head_block_path)?;
    let tail_dir = unsafe { &*tail }.direction();
    let head_dir = unsafe { &*head }.direction();

    // Safety: live objects, store mutex held by the caller. The borrows are
    // scoped separately because tail and head may share a block.
    let (tb_parent, tb_graph) = {
        let tb_ref = unsafe { &mut *tb };
        (tb_ref.parent, tb_ref.graph_mut().map(|g| g as *mut GraphImpl))
    };
    let (hb_parent, hb_graph) = {
        let hb_ref = unsafe { &mut *hb };
        (hb_ref.parent, hb_ref.graph_mut().map(|g| g as *mut GraphImpl))
    };

    if !tb_parent.is_null() && core::ptr::eq(tb_parent, hb_parent) {
        // Two children of the same graph.
        if !tail_dir.is_output() || !head_dir.is_input() {
            return Err(Status::BadRequest);
        }
        // Safety: parent graphs outlive their children.
        let graph = unsafe { &mut *tb_parent };
        Ok(ArcEndpoints {
            graph: tb_parent,
            tail,
            head,
            tail_block: graph.block_key_by_path(&tail_block_path),
            head_block: graph.block_key_by_path(&head_block_path),
        })
    } else if tb_graph.is_some_and(|g| core::ptr::eq(g, hb_parent)) {
        // From the graph's own input port down to a child.
        if !tail_dir.is_input() || !head_dir.is_input() {
            return Err(Status::BadRequest);
        }
        let graph = tb_graph.expect("checked above");
        let head_block = unsafe { &*graph }.block_key_by_path(&head_block_path);
        Ok(ArcEndpoints {
            graph,
            tail,
            head,
            tail_block: None,
            head_block,
        })
    } else if hb_graph.is_some_and(|g| core::ptr::eq(g, tb_parent)) {
        // From a child up to the graph's own output port.
        if !tail_dir.is_output() || !head_dir.is_output() {
            return Err(Status::BadRequest);
        }
        let graph = hb_graph.expect("checked above");
        let tail_block = unsafe { &*graph }.block_key_by_path(&tail_block_path);
        Ok(ArcEndpoints {
            graph,
            tail,
            head,
            tail_block,
            head_block: None,
        })
    } else {
        Err(Status::ParentDiffers)
    }
}

/// A prepared rewiring of one head port: the voice array and source list
/// to install, and (after execute) the replaced voices awaiting disposal.
pub(crate) struct HeadRewire {
    pub head: *mut Port,
    pub voices: Option<Voices>,
    pub sources: SmallVec<[*const Port; 2]>,
}

impl HeadRewire {
    /// Build the rewire for `head` from the graph's current arc set.
    pub fn prepare(
        graph: &GraphImpl,
        head: *mut Port,
        factory: &mut BufferFactory,
    ) -> Result<Self, Status> {
        let sources = graph.sources_for(head);
        // Safety: live port, pre-process side.
        let head_ref = unsafe { &*head };
        let mut voices = head_ref.prepare_voices(factory, head_ref.poly(), &sources)?;
        head_ref.fill_prepared(&mut voices);
        Ok(Self {
            head,
            voices: Some(voices),
            sources,
        })
    }

    /// Audio thread: swap in, keep the replaced array for disposal.
    pub fn install(&mut self) {
        if let Some(voices) = self.voices.take() {
            // Safety: audio-thread swap at a cycle boundary. Taking the
            // source list avoids cloning (and thus allocating) here.
            let sources = core::mem::take(&mut self.sources);
            let old = unsafe { &mut *self.head }.connect_buffers(voices, sources);
            self.voices = Some(old);
        }
    }
}

pub struct Connect {
    pub tail: Path,
    pub head: Path,
    prepared: Option<ConnectPrepared>,
}

struct ConnectPrepared {
    graph: *mut GraphImpl,
    rewire: HeadRewire,
    compiled: Option<Box<CompiledGraph>>,
}

impl Connect {
    pub fn new(tail: Path, head: Path) -> Self {
        Self {
            tail,
            head,
            prepared: None,
        }
    }

    pub(crate) fn pre_process(
        &mut self,
        ctx: &mut PreProcessContext,
        undo: &mut Vec<Event>,
    ) -> Status {
        let store = ctx.store.lock().expect("store lock");
        let endpoints = match resolve_endpoints(&store, &self.tail, &self.head) {
            Ok(e) => e,
            Err(status) => return status,
        };
        // Safety: the graph outlives pre-processing; store mutex held.
        let graph = unsafe { &mut *endpoints.graph };
        if graph.has_arc(&self.tail, &self.head) {
            return Status::Exists;
        }
        {
            // Safety: live ports.
            let (tail_ref, head_ref) =
                unsafe { (&*endpoints.tail, &*endpoints.head) };
            if let Err(status) = can_connect(tail_ref, head_ref) {
                return status;
            }
        }
        graph.add_arc(ArcImpl::new(
            endpoints.tail,
            endpoints.head,
            endpoints.tail_block,
            endpoints.head_block,
        ));
        let rewire = match HeadRewire::prepare(graph, endpoints.head, ctx.factory) {
            Ok(r) => r,
            Err(status) => {
                graph.remove_arc(&self.tail, &self.head);
                return status;
            }
        };
        let compiled = match ctx.compile_or_defer(graph) {
            Ok(c) => c,
            Err(status) => {
                // The arc must not survive a failed compile.
                graph.remove_arc(&self.tail, &self.head);
                return status;
            }
        };
        self.prepared = Some(ConnectPrepared {
            graph: endpoints.graph,
            rewire,
            compiled,
        });
        undo.push(Event::new(
            0,
            0,
            EventKind::Disconnect(Disconnect::new(self.tail.clone(), self.head.clone())),
        ));
        Status::Success
    }

    pub(crate) fn execute(&mut self, _ctx: &RunContext) {
        if let Some(prepared) = &mut self.prepared {
            prepared.rewire.install();
            if prepared.compiled.is_some() {
                // Safety: audio-thread swap.
                let old = unsafe { &mut *prepared.graph }.swap_compiled(prepared.compiled.take());
                prepared.compiled = old;
            }
        }
    }

    pub(crate) fn post_process(&mut self, ctx: &mut PostProcessContext) {
        ctx.broadcaster.send_all(|c| c.connected(&self.tail, &self.head));
        // Replaced voices and compiled graph drop with the event.
    }
}

pub struct Disconnect {
    pub tail: Path,
    pub head: Path,
    prepared: Option<ConnectPrepared>,
}

impl Disconnect {
    pub fn new(tail: Path, head: Path) -> Self {
        Self {
            tail,
            head,
            prepared: None,
        }
    }

    pub(crate) fn pre_process(
        &mut self,
        ctx: &mut PreProcessContext,
        undo: &mut Vec<Event>,
    ) -> Status {
        let store = ctx.store.lock().expect("store lock");
        let endpoints = match resolve_endpoints(&store, &self.tail, &self.head) {
            Ok(e) => e,
            Err(status) => return status,
        };
        // Safety: see Connect.
        let graph = unsafe { &mut *endpoints.graph };
        if graph.remove_arc(&self.tail, &self.head).is_none() {
            return Status::NotFound;
        }
        let rewire = match HeadRewire::prepare(graph, endpoints.head, ctx.factory) {
            Ok(r) => r,
            Err(status) => return status,
        };
        let compiled = match ctx.compile_or_defer(graph) {
            Ok(c) => c,
            Err(status) => return status,
        };
        self.prepared = Some(ConnectPrepared {
            graph: endpoints.graph,
            rewire,
            compiled,
        });
        undo.push(Event::new(
            0,
            0,
            EventKind::Connect(Connect::new(self.tail.clone(), self.head.clone())),
        ));
        Status::Success
    }

    pub(crate) fn execute(&mut self, _ctx: &RunContext) {
        if let Some(prepared) = &mut self.prepared {
            prepared.rewire.install();
            if prepared.compiled.is_some() {
                // Safety: audio-thread swap.
                let old = unsafe { &mut *prepared.graph }.swap_compiled(prepared.compiled.take());
                prepared.compiled = old;
            }
        }
    }

    pub(crate) fn post_process(&mut self, ctx: &mut PostProcessContext) {
        ctx.broadcaster
            .send_all(|c| c.disconnected(&self.tail, &self.head));
    }
}

pub struct DisconnectAll {
    pub path: Path,
    prepared: Option<DisconnectAllPrepared>,
    removed: Vec<(Path, Path)>,
}

struct DisconnectAllPrepared {
    graphs: Vec<(*mut GraphImpl, Option<Box<CompiledGraph>>)>,
    rewires: Vec<HeadRewire>,
}

impl DisconnectAll {
    pub fn new(path: Path) -> Self {
        Self {
            path,
            prepared: None,
            removed: Vec::new(),
        }
    }

    pub(crate) fn pre_process(
        &mut self,
        ctx: &mut PreProcessContext,
        undo: &mut Vec<Event>,
    ) -> Status {
        let store = ctx.store.lock().expect("store lock");
        let object = match store.get(&self.path) {
            Ok(o) => o,
            Err(status) => return status,
        };
        // The parent graph always carries incident arcs; a graph object
        // additionally has inner arcs to its own boundary ports.
        let mut graphs: Vec<*mut GraphImpl> = Vec::new();
        match object {
            crate::store::ObjectRef::Block(b) => {
                // Safety: live, store mutex held.
                let block = unsafe { &mut *b };
                if !block.parent.is_null() {
                    graphs.push(block.parent);
                }
                if let Some(g) = block.graph_mut() {
                    graphs.push(g);
                }
            }
            crate::store::ObjectRef::Port(p) => {
                let Some(parent) = self.path.parent() else {
                    return Status::BadUri;
                };
                let Ok(owner) = store.block(&parent) else {
                    return Status::ParentNotFound;
                };
                let owner = unsafe { &mut *owner };
                if !owner.parent.is_null() {
                    graphs.push(owner.parent);
                }
                if let Some(g) = owner.graph_mut() {
                    // Graph boundary port: inner arcs too.
                    graphs.push(g);
                }
                let _ = p;
            }
        }
        let mut prepared = DisconnectAllPrepared {
            graphs: Vec::new(),
            rewires: Vec::new(),
        };
        for graph_ptr in graphs {
            // Safety: graphs outlive pre-processing.
            let graph = unsafe { &mut *graph_ptr };
            let incident = graph.incident_arcs(&self.path);
            if incident.is_empty() {
                continue;
            }
            let mut heads: Vec<*mut Port> = Vec::new();
            for (tail, head) in incident {
                if let Some(arc) = graph.remove_arc(&tail, &head) {
                    if !heads.iter().any(|&h| core::ptr::eq(h, arc.head)) {
                        heads.push(arc.head);
                    }
                    self.removed.push((tail, head));
                }
            }
            for head in heads {
                match HeadRewire::prepare(graph, head, ctx.factory) {
                    Ok(r) => prepared.rewires.push(r),
                    Err(status) => return status,
                }
            }
            let compiled = match ctx.compile_or_defer(graph) {
                Ok(c) => c,
                Err(status) => return status,
            };
            prepared.graphs.push((graph_ptr, compiled));
        }
        for (tail, head) in &self.removed {
            undo.push(Event::new(
                0,
                0,
                EventKind::Connect(Connect::new(tail.clone(), head.clone())),
            ));
        }
        self.prepared = Some(prepared);
        Status::Success
    }

    pub(crate) fn execute(&mut self, _ctx: &RunContext) {
        if let Some(prepared) = &mut self.prepared {
            for rewire in prepared.rewires.iter_mut() {
                rewire.install();
            }
            for (graph, compiled) in prepared.graphs.iter_mut() {
                if compiled.is_some() {
                    // Safety: audio-thread swap.
                    let old = unsafe { &mut **graph }.swap_compiled(compiled.take());
                    *compiled = old;
                }
            }
        }
    }

    pub(crate) fn post_process(&mut self, ctx: &mut PostProcessContext) {
        for (tail, head) in &self.removed {
            ctx.broadcaster.send_all(|c| c.disconnected(tail, head));
        }
    }
}
