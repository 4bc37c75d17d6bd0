//! Delete, Move and Copy.

use ingen_core::{Atom, Path, PortType, Properties, Property, Status, Uri};

use crate::block::{Block, Ports};
use crate::compiled_graph::CompiledGraph;
use crate::event::connect::{Connect, HeadRewire};
use crate::event::create::Put;
use crate::event::keys;
use crate::event::{resolve, Event, EventKind, PostProcessContext, PreProcessContext};
use crate::graph::GraphImpl;
use crate::port::Port;
use crate::run_context::RunContext;
use crate::store::ObjectRef;

/// Properties that re-put a port identically.
pub(crate) fn describe_port(port: &Port) -> Properties {
    let mut props = port.properties.clone();
    let type_uri = match port.direction() {
        ingen_core::Direction::Input => keys::TYPE_INPUT_PORT,
        ingen_core::Direction::Output => keys::TYPE_OUTPUT_PORT,
    };
    props.put(&keys::uri(keys::TYPE), Property::new(Atom::Uri(keys::uri(type_uri))));
    let port_type = match port.port_type() {
        PortType::Audio => keys::PORT_TYPE_AUDIO,
        PortType::Control => keys::PORT_TYPE_CONTROL,
        PortType::Cv => keys::PORT_TYPE_CV,
        PortType::Atom => keys::PORT_TYPE_ATOM,
    };
    props.put(
        &keys::uri(keys::PORT_TYPE),
        Property::new(Atom::Uri(keys::uri(port_type))),
    );
    props.put(&keys::uri(keys::VALUE), Property::new(port.value.clone()));
    props
}

/// Build the events that recreate `block` (and, for graphs, everything
/// inside it): puts in creation order, then connects.
fn describe_subtree(block: &Block, puts: &mut Vec<Event>, connects: &mut Vec<Event>) {
    if let Some(graph) = block.graph() {
        let mut props = block.properties.clone();
        props.put(
            &keys::uri(keys::TYPE),
            Property::new(Atom::Uri(keys::uri(keys::TYPE_GRAPH))),
        );
        props.put(
            &keys::uri(keys::POLYPHONY),
            Property::new(Atom::Int(graph.internal_poly() as i32)),
        );
        puts.push(Event::new(
            0,
            0,
            EventKind::Put(Put::new(Uri::from_path(block.path()), props)),
        ));
        for port in block.ports.iter() {
            puts.push(Event::new(
                0,
                0,
                EventKind::Put(Put::new(Uri::from_path(port.path()), describe_port(port))),
            ));
        }
        for (_, child) in graph.blocks().iter() {
            describe_subtree(child, puts, connects);
        }
        for (tail, head) in graph.arcs.keys() {
            connects.push(Event::new(
                0,
                0,
                EventKind::Connect(Connect::new(tail.clone(), head.clone())),
            ));
        }
    } else {
        let (uri, props) = resolve::describe(block);
        puts.push(Event::new(0, 0, EventKind::Put(Put::new(uri, props))));
    }
}

pub struct Delete {
    pub uri: Uri,
    prepared: Option<DeletePrepared>,
    deleted_path: Option<Path>,
}

enum DeletePrepared {
    Block {
        graph: *mut GraphImpl,
        rewires: Vec<HeadRewire>,
        compiled: Option<Box<CompiledGraph>>,
        /// Detached from the slot map in pre-process; the old compiled
        /// graph keeps it reachable until execute swaps, and the box is
        /// dropped in post-process.
        block: Option<Box<Block>>,
    },
    Port {
        owner: *mut Block,
        new_ports: Option<Ports>,
        removed: *mut Port,
        rewires: Vec<HeadRewire>,
        graphs: Vec<(*mut GraphImpl, Option<Box<CompiledGraph>>)>,
    },
}

impl Delete {
    pub fn new(uri: Uri) -> Self {
        Self {
            uri,
            prepared: None,
            deleted_path: None,
        }
    }

    pub(crate) fn pre_process(
        &mut self,
        ctx: &mut PreProcessContext,
        undo: &mut Vec<Event>,
    ) -> Status {
        let Some(path) = self.uri.to_path() else {
            return Status::BadUri;
        };
        if path.is_root() {
            return Status::NotDeletable;
        }
        let mut store = ctx.store.lock().expect("store lock");
        let object = match store.get(&path) {
            Ok(o) => o,
            Err(status) => return status,
        };
        self.deleted_path = Some(path.clone());

        match object {
            ObjectRef::Block(block_ptr) => {
                // Safety: live block, store mutex held.
                let block = unsafe { &mut *block_ptr };
                if block.parent.is_null() {
                    return Status::NotDeletable;
                }
                let graph_ptr = block.parent;
                // Safety: parent graphs outlive children.
                let graph = unsafe { &mut *graph_ptr };

                // Inverse: re-put, then re-connect; the list is replayed
                // reversed.
                let mut puts = Vec::new();
                let mut connects = Vec::new();
                describe_subtree(block, &mut puts, &mut connects);
                for (tail, head) in graph.incident_arcs(&path) {
                    connects.push(Event::new(
                        0,
                        0,
                        EventKind::Connect(Connect::new(tail, head)),
                    ));
                }
                puts.reverse();
                undo.extend(connects);
                undo.extend(puts);

                // Drop incident arcs and rewire surviving heads.
                let mut rewires = Vec::new();
                let mut heads: Vec<*mut Port> = Vec::new();
                for (tail, head) in graph.incident_arcs(&path) {
                    let under_deleted = path.is_parent_of(&head) || head == path;
                    if let Some(arc) = graph.remove_arc(&tail, &head) {
                        if !under_deleted && !heads.iter().any(|&h| core::ptr::eq(h, arc.head)) {
                            heads.push(arc.head);
                        }
                    }
                }
                for head in heads {
                    match HeadRewire::prepare(graph, head, ctx.factory) {
                        Ok(r) => rewires.push(r),
                        Err(status) => return status,
                    }
                }

                store.remove_subtree(&path);
                drop(store);

                let key = graph
                    .block_key_by_path(&path)
                    .expect("block is in its parent graph");
                let boxed = graph.remove_block(key).expect("key just resolved");
                let compiled = match ctx.compile_or_defer(graph) {
                    Ok(c) => c,
                    Err(status) => return status,
                };
                self.prepared = Some(DeletePrepared::Block {
                    graph: graph_ptr,
                    rewires,
                    compiled,
                    block: Some(boxed),
                });
                Status::Success
            }
            ObjectRef::Port(port_ptr) => {
                let parent_path = path.parent().ok_or(Status::BadUri);
                let parent_path = match parent_path {
                    Ok(p) => p,
                    Err(status) => return status,
                };
                let owner_ptr = match store.block(&parent_path) {
                    Ok(b) => b,
                    Err(status) => return status,
                };
                // Safety: live block, store mutex held.
                let owner = unsafe { &mut *owner_ptr };
                if owner.graph().is_none() {
                    // Only graph boundary ports are individually deletable.
                    return Status::NotDeletable;
                }

                let port = unsafe { &*port_ptr };
                let mut puts = vec![Event::new(
                    0,
                    0,
                    EventKind::Put(Put::new(
                        Uri::from_path(port.path()),
                        describe_port(port),
                    )),
                )];
                let mut connects = Vec::new();

                // Arcs both outside (owner's parent graph) and inside.
                let mut graph_ptrs: Vec<*mut GraphImpl> = Vec::new();
                if !owner.parent.is_null() {
                    graph_ptrs.push(owner.parent);
                }
                if let Some(g) = owner.graph_mut() {
                    graph_ptrs.push(g);
                }
                let mut rewires = Vec::new();
                let mut graphs = Vec::new();
                for graph_ptr in graph_ptrs {
                    // Safety: live graphs.
                    let graph = unsafe { &mut *graph_ptr };
                    let incident = graph.incident_arcs(&path);
                    if incident.is_empty() {
                        continue;
                    }
                    let mut heads: Vec<*mut Port> = Vec::new();
                    for (tail, head) in incident {
                        if let Some(arc) = graph.remove_arc(&tail, &head) {
                            connects.push(Event::new(
                                0,
                                0,
                                EventKind::Connect(Connect::new(tail, head)),
                            ));
                            if !core::ptr::eq(arc.head, port_ptr)
                                && !heads.iter().any(|&h| core::ptr::eq(h, arc.head))
                            {
                                heads.push(arc.head);
                            }
                        }
                    }
                    for head in heads {
                        match HeadRewire::prepare(graph, head, ctx.factory) {
                            Ok(r) => rewires.push(r),
                            Err(status) => return status,
                        }
                    }
                    let compiled = match ctx.compile_or_defer(graph) {
                        Ok(c) => c,
                        Err(status) => return status,
                    };
                    graphs.push((graph_ptr, compiled));
                }
                puts.reverse();
                undo.extend(connects);
                undo.extend(puts);

                let new_ports = Ports::from_raw(
                    (0..owner.ports.len())
                        .map(|i| owner.ports.raw(i))
                        .filter(|&p| !core::ptr::eq(p, port_ptr))
                        .collect(),
                );
                store.remove(&path);
                self.prepared = Some(DeletePrepared::Port {
                    owner: owner_ptr,
                    new_ports: Some(new_ports),
                    removed: port_ptr,
                    rewires,
                    graphs,
                });
                Status::Success
            }
        }
    }

    pub(crate) fn execute(&mut self, _ctx: &RunContext) {
        match &mut self.prepared {
            Some(DeletePrepared::Block {
                graph,
                rewires,
                compiled,
                ..
            }) => {
                for rewire in rewires.iter_mut() {
                    rewire.install();
                }
                if compiled.is_some() {
                    // Safety: audio-thread swap.
                    let old = unsafe { &mut **graph }.swap_compiled(compiled.take());
                    *compiled = old;
                }
            }
            Some(DeletePrepared::Port {
                owner,
                new_ports,
                rewires,
                graphs,
                ..
            }) => {
                for rewire in rewires.iter_mut() {
                    rewire.install();
                }
                for (graph, compiled) in graphs.iter_mut() {
                    if compiled.is_some() {
                        let old = unsafe { &mut **graph }.swap_compiled(compiled.take());
                        *compiled = old;
                    }
                }
                if let Some(ports) = new_ports.take() {
                    let old = core::mem::replace(&mut unsafe { &mut **owner }.ports, ports);
                    *new_ports = Some(old);
                }
            }
            None => {}
        }
    }

    pub(crate) fn post_process(&mut self, ctx: &mut PostProcessContext) {
        match &mut self.prepared {
            Some(DeletePrepared::Block { block, .. }) => {
                if let Some(mut boxed) = block.take() {
                    boxed.deactivate();
                    drop(boxed);
                }
            }
            Some(DeletePrepared::Port {
                new_ports, removed, ..
            }) => {
                // The replaced array drops as a plain pointer list.
                drop(new_ports.take());
                // Safety: the removed port is out of the live array and out
                // of every arc; this is its final owner.
                drop(unsafe { Box::from_raw(*removed) });
            }
            None => {}
        }
        let uri = self.uri.clone();
        ctx.broadcaster.send_all(|c| c.deleted(&uri));
    }
}

pub struct Move {
    pub old_path: Path,
    pub new_path: Path,
}

impl Move {
    pub fn new(old_path: Path, new_path: Path) -> Self {
        Self { old_path, new_path }
    }

    pub(crate) fn pre_process(
        &mut self,
        ctx: &mut PreProcessContext,
        undo: &mut Vec<Event>,
    ) -> Status {
        if self.old_path.parent() != self.new_path.parent() {
            return Status::ParentDiffers;
        }
        let mut store = ctx.store.lock().expect("store lock");
        if store.contains(&self.new_path) {
            return Status::Exists;
        }
        let block_ptr = match store.block(&self.old_path) {
            Ok(b) => b,
            Err(status) => return status,
        };
        // Safety: live block, store mutex held.
        let block = unsafe { &mut *block_ptr };
        if block.parent.is_null() {
            return Status::NotDeletable;
        }

        block.set_path(self.new_path.clone());

        // Re-index the whole subtree and rewrite incident arc paths.
        let removed = store.remove_subtree(&self.old_path);
        for (old, object) in removed {
            let new = old
                .rebased(&self.old_path, &self.new_path)
                .expect("subtree entries are below the old path");
            let _ = store.insert(new, object);
        }
        // Safety: parent graphs outlive children.
        let graph = unsafe { &mut *block.parent };
        let incident = graph.incident_arcs(&self.old_path);
        for (tail, head) in incident {
            if let Some(mut arc) = graph.remove_arc(&tail, &head) {
                let tail = tail
                    .rebased(&self.old_path, &self.new_path)
                    .unwrap_or(tail);
                let head = head
                    .rebased(&self.old_path, &self.new_path)
                    .unwrap_or(head);
                arc.tail_path = tail;
                arc.head_path = head;
                graph.add_arc(arc);
            }
        }
        // Renaming does not change topology; the compiled tree holds block
        // pointers, not paths.
        graph.dirty = false;

        undo.push(Event::new(
            0,
            0,
            EventKind::Move(Move::new(self.new_path.clone(), self.old_path.clone())),
        ));
        Status::Success
    }

    pub(crate) fn post_process(&mut self, ctx: &mut PostProcessContext) {
        ctx.broadcaster
            .send_all(|c| c.moved(&self.old_path, &self.new_path));
    }
}

pub struct Copy {
    pub old_uri: Uri,
    pub new_uri: Uri,
    inner: Option<Put>,
}

impl Copy {
    pub fn new(old_uri: Uri, new_uri: Uri) -> Self {
        Self {
            old_uri,
            new_uri,
            inner: None,
        }
    }

    pub(crate) fn pre_process(
        &mut self,
        ctx: &mut PreProcessContext,
        undo: &mut Vec<Event>,
    ) -> Status {
        let Some(old_path) = self.old_uri.to_path() else {
            return Status::BadUri;
        };
        if self.new_uri.to_path().is_none() {
            return Status::BadUri;
        }
        let properties = {
            let store = ctx.store.lock().expect("store lock");
            let block_ptr = match store.block(&old_path) {
                Ok(b) => b,
                Err(Status::NotFound) => return Status::PrototypeNotFound,
                Err(status) => return status,
            };
            // Safety: live block, store mutex held.
            let block = unsafe { &*block_ptr };
            if block.graph().is_some() {
                // Graph copies go through serialization, not the engine.
                return Status::BadObjectType;
            }
            resolve::describe(block).1
        };
        let mut put = Put::new(self.new_uri.clone(), properties);
        let status = put.pre_process(ctx, undo);
        if status == Status::Success {
            self.inner = Some(put);
        }
        status
    }

    pub(crate) fn execute(&mut self, ctx: &RunContext) {
        if let Some(put) = &mut self.inner {
            put.execute(ctx);
        }
    }

    pub(crate) fn post_process(&mut self, ctx: &mut PostProcessContext) {
        if let Some(put) = &mut self.inner {
            put.post_process(ctx);
        }
    }
}
