//! Put: idempotent property replacement, creating objects as needed.
//!
//! A put to an existing path is a per-key property replacement (see
//! [`Delta`]). A put to a free path creates a block, graph or port
//! according to the request's type and prototype properties.

use ingen_core::{Atom, Direction, Path, PortType, Properties, Status, Uri};
use smallvec::SmallVec;

use crate::block::{Block, BlockKind, Ports};
use crate::compiled_graph::CompiledGraph;
use crate::event::keys;
use crate::event::{resolve, Event, EventKind, PostProcessContext, PreProcessContext};
use crate::event::delta::Delta;
use crate::event::structure::Delete;
use crate::graph::GraphImpl;
use crate::internals::InternalKind;
use crate::port::Port;
use crate::run_context::RunContext;

pub struct Put {
    pub uri: Uri,
    pub properties: Properties,
    prepared: Option<PutPrepared>,
}

enum PutPrepared {
    /// Existing object: property delta with put semantics.
    Updated(Box<Delta>),
    CreatedBlock {
        graph: *mut GraphImpl,
        compiled: Option<Box<CompiledGraph>>,
    },
    CreatedPort {
        block: *mut Block,
        new_ports: Option<Ports>,
    },
}

impl Put {
    pub fn new(uri: Uri, properties: Properties) -> Self {
        Self {
            uri,
            properties,
            prepared: None,
        }
    }

    fn type_uris(&self) -> Vec<&Uri> {
        self.properties
            .iter()
            .filter(|(k, _)| k.as_str() == keys::TYPE)
            .filter_map(|(_, p)| p.value.uri())
            .collect()
    }

    pub(crate) fn pre_process(
        &mut self,
        ctx: &mut PreProcessContext,
        undo: &mut Vec<Event>,
    ) -> Status {
        let Some(path) = self.uri.to_path() else {
            return Status::BadUri;
        };
        let exists = {
            let store = ctx.store.lock().expect("store lock");
            store.contains(&path)
        };
        if exists {
            let mut delta = Box::new(Delta::new_put(self.uri.clone(), self.properties.clone()));
            let status = delta.pre_process(ctx, undo);
            if status == Status::Success {
                self.prepared = Some(PutPrepared::Updated(delta));
            }
            return status;
        }

        let types = self.type_uris();
        let is_graph = types.iter().any(|t| t.as_str() == keys::TYPE_GRAPH);
        let is_input = types.iter().any(|t| t.as_str() == keys::TYPE_INPUT_PORT);
        let is_output = types.iter().any(|t| t.as_str() == keys::TYPE_OUTPUT_PORT);

        let status = if is_graph {
            self.create_graph(ctx, &path)
        } else if is_input || is_output {
            self.create_port(
                ctx,
                &path,
                if is_input {
                    Direction::Input
                } else {
                    Direction::Output
                },
            )
        } else if self
            .properties
            .get_first(&keys::uri(keys::PROTOTYPE))
            .is_some()
        {
            self.create_block(ctx, &path)
        } else {
            Status::BadObjectType
        };
        if status == Status::Success {
            undo.push(Event::new(
                0,
                0,
                EventKind::Delete(Delete::new(self.uri.clone())),
            ));
        }
        status
    }

    fn create_block(&mut self, ctx: &mut PreProcessContext, path: &Path) -> Status {
        let prototype = match self
            .properties
            .get_first(&keys::uri(keys::PROTOTYPE))
            .and_then(|a| a.uri().cloned())
        {
            Some(u) => u,
            None => return Status::BadRequest,
        };
        let store = ctx.store.lock().expect("store lock");
        let parent_block = match resolve::parent_graph(&store, path) {
            Ok(b) => b,
            Err(status) => return status,
        };
        // Safety: live, store mutex held.
        let graph: *mut GraphImpl = unsafe { &mut *parent_block }
            .graph_mut()
            .expect("parent_graph checked the kind") as *mut GraphImpl;
        let graph_ref = unsafe { &mut *graph };

        let polyphonic = self
            .properties
            .get_first(&keys::uri(keys::POLYPHONIC))
            .and_then(|a| a.bool())
            .unwrap_or(false);
        let block_poly = if polyphonic {
            graph_ref.internal_poly()
        } else {
            1
        };

        let mut block = if let Some(kind) = InternalKind::from_uri(&prototype) {
            match Block::new_internal(path.clone(), kind, block_poly, ctx.factory, ctx.urids) {
                Ok(b) => b,
                Err(status) => return status,
            }
        } else {
            let Some(descriptor) = ctx.registry.load(&prototype) else {
                return Status::PrototypeNotFound;
            };
            match Block::new_plugin(path.clone(), descriptor, ctx.factory) {
                Ok(b) => b,
                Err(status) => return status,
            }
        };

        block.properties = self.properties.clone();
        // Internals that cannot be polyphonic were already forced mono by
        // their constructor; follow the block's own count from here.
        if !matches!(block.kind, crate::block::BlockKind::Internal(_)) {
            block.set_poly(block_poly);
        }
        let block_poly = block.poly();
        if let Some(enabled) = self
            .properties
            .get_first(&keys::uri(keys::ENABLED))
            .and_then(|a| a.bool())
        {
            block.set_enabled(enabled);
        }
        // Bring the (not yet audio-visible) port voices up to the block's
        // voice count. ATOM ports stay monophonic.
        if block_poly > 1 {
            for i in 0..block.ports.len() {
                if block.ports.at(i).port_type() == PortType::Atom {
                    continue;
                }
                let voices = match block
                    .ports
                    .at(i)
                    .prepare_voices_owned(ctx.factory, block_poly)
                {
                    Ok(v) => v,
                    Err(status) => return status,
                };
                block.ports.at_mut(i).connect_buffers(voices, SmallVec::new());
            }
        }
        if let Err(status) = block.activate(ctx.registry, ctx.sample_rate) {
            return status;
        }

        let key = graph_ref.add_block(Box::new(block));
        let block_ptr: *mut Block = graph_ref
            .block_mut(key)
            .expect("block just added") as *mut Block;
        {
            // Index the block and its ports. The path was checked free, and
            // port paths live under it.
            let mut store = store;
            let block_ref = unsafe { &*block_ptr };
            if store
                .insert(path.clone(), crate::store::ObjectRef::Block(block_ptr))
                .is_err()
            {
                graph_ref.remove_block(key);
                return Status::Exists;
            }
            for i in 0..block_ref.ports.len() {
                let port_path = block_ref.ports.at(i).path().clone();
                let _ = store.insert(port_path, crate::store::ObjectRef::Port(block_ref.ports.raw(i)));
            }
        }

        match ctx.compile_or_defer(graph_ref) {
            Ok(compiled) => {
                self.prepared = Some(PutPrepared::CreatedBlock { graph, compiled });
                Status::Success
            }
            Err(status) => {
                let mut store = ctx.store.lock().expect("store lock");
                store.remove_subtree(path);
                graph_ref.remove_block(key);
                status
            }
        }
    }

    fn create_graph(&mut self, ctx: &mut PreProcessContext, path: &Path) -> Status {
        let poly = self
            .properties
            .get_first(&keys::uri(keys::POLYPHONY))
            .and_then(|a| a.to_float())
            .unwrap_or(1.0) as i64;
        if poly < 1 || poly > ctx.poly_limit as i64 {
            return Status::InvalidPoly;
        }
        let store = ctx.store.lock().expect("store lock");
        let parent_block = match resolve::parent_graph(&store, path) {
            Ok(b) => b,
            Err(status) => return status,
        };
        let graph: *mut GraphImpl = unsafe { &mut *parent_block }
            .graph_mut()
            .expect("parent_graph checked the kind") as *mut GraphImpl;
        let graph_ref = unsafe { &mut *graph };

        let mut body = GraphImpl::new(path.clone(), poly as u32);
        // An empty graph compiles trivially; install before exposure.
        match crate::compiled_graph::compile(&body) {
            Ok(compiled) => {
                body.dirty = false;
                body.compiled = Some(compiled);
            }
            Err(_) => return Status::CompilationFailed,
        }
        let mut block = Block::new(
            path.clone(),
            keys::uri(keys::TYPE_GRAPH),
            Ports::from_vec(Vec::new()),
            BlockKind::SubGraph(Box::new(body)),
        );
        block.properties = self.properties.clone();
        if let Some(enabled) = self
            .properties
            .get_first(&keys::uri(keys::ENABLED))
            .and_then(|a| a.bool())
        {
            block.set_enabled(enabled);
            if let Some(g) = block.graph_mut() {
                g.set_enabled(enabled);
            }
        }

        let key = graph_ref.add_block(Box::new(block));
        let block_ptr: *mut Block = graph_ref
            .block_mut(key)
            .expect("block just added") as *mut Block;
        {
            let mut store = store;
            if store
                .insert(path.clone(), crate::store::ObjectRef::Block(block_ptr))
                .is_err()
            {
                graph_ref.remove_block(key);
                return Status::Exists;
            }
        }

        match ctx.compile_or_defer(graph_ref) {
            Ok(compiled) => {
                self.prepared = Some(PutPrepared::CreatedBlock { graph, compiled });
                Status::Success
            }
            Err(status) => {
                let mut store = ctx.store.lock().expect("store lock");
                store.remove_subtree(path);
                graph_ref.remove_block(key);
                status
            }
        }
    }

    fn create_port(
        &mut self,
        ctx: &mut PreProcessContext,
        path: &Path,
        direction: Direction,
    ) -> Status {
        let ty = match self
            .properties
            .get_first(&keys::uri(keys::PORT_TYPE))
            .and_then(|a| a.uri())
            .map(|u| u.as_str())
        {
            Some(keys::PORT_TYPE_AUDIO) => PortType::Audio,
            Some(keys::PORT_TYPE_CONTROL) => PortType::Control,
            Some(keys::PORT_TYPE_CV) => PortType::Cv,
            Some(keys::PORT_TYPE_ATOM) => PortType::Atom,
            _ => return Status::BadValueType,
        };
        let mut store = ctx.store.lock().expect("store lock");
        let owner = match resolve::parent_graph(&store, path) {
            Ok(b) => b,
            Err(status) => return status,
        };
        // Safety: live graph block, store mutex held.
        let block = unsafe { &mut *owner };

        let value = self
            .properties
            .get_first(&keys::uri(keys::VALUE))
            .cloned()
            .unwrap_or(Atom::Float(0.0));
        let index = block.ports.len() as u32;
        let mut port = match Port::new(
            path.clone(),
            index,
            ty,
            direction,
            None,
            value,
            ctx.factory,
        ) {
            Ok(p) => p,
            Err(status) => return status,
        };
        if let Some(min) = self.properties.get_first(&keys::uri(keys::MINIMUM)) {
            port.min = min.clone();
        }
        if let Some(max) = self.properties.get_first(&keys::uri(keys::MAXIMUM)) {
            port.max = max.clone();
        }
        port.properties = self.properties.clone();

        // The replacement array shares the surviving port pointers with the
        // live one; only one of the two arrays is ever dropped.
        let mut raws: Vec<*mut Port> = (0..block.ports.len()).map(|i| block.ports.raw(i)).collect();
        let new_port = Box::into_raw(Box::new(port));
        raws.push(new_port);
        let new_ports = Ports::from_raw(raws);
        let _ = store.insert(path.clone(), crate::store::ObjectRef::Port(new_port));

        self.prepared = Some(PutPrepared::CreatedPort {
            block: owner,
            new_ports: Some(new_ports),
        });
        Status::Success
    }

    pub(crate) fn execute(&mut self, ctx: &RunContext) {
        match &mut self.prepared {
            Some(PutPrepared::Updated(delta)) => delta.execute(ctx),
            Some(PutPrepared::CreatedBlock { graph, compiled }) => {
                if compiled.is_some() {
                    // Safety: audio-thread swap.
                    let old = unsafe { &mut **graph }.swap_compiled(compiled.take());
                    *compiled = old;
                }
            }
            Some(PutPrepared::CreatedPort { block, new_ports }) => {
                if let Some(ports) = new_ports.take() {
                    // Safety: audio-thread swap of the port array.
                    let old = core::mem::replace(&mut unsafe { &mut **block }.ports, ports);
                    *new_ports = Some(old);
                }
            }
            None => {}
        }
    }

    pub(crate) fn post_process(&mut self, ctx: &mut PostProcessContext) {
        match &mut self.prepared {
            Some(PutPrepared::Updated(delta)) => {
                delta.post_process(ctx);
                return;
            }
            Some(PutPrepared::CreatedPort { new_ports, .. }) => {
                // The replaced array drops as a plain pointer list; the
                // surviving ports are owned by the installed one.
                drop(new_ports.take());
            }
            _ => {}
        }
        let uri = self.uri.clone();
        let properties = self.properties.clone();
        ctx.broadcaster.send_all(|c| c.put(&uri, &properties));
    }

    pub(crate) fn is_atomic(&self) -> bool {
        match &self.prepared {
            Some(PutPrepared::Updated(delta)) => delta.is_atomic(),
            _ => false,
        }
    }
}
