//! Processing blocks: plugin instances, internals and sub-graphs.

use ingen_core::{Atom, CoreUrids, Direction, Path, PortType, Properties, Status, Uri};
use smallvec::SmallVec;
use std::sync::Arc;

use crate::buffer_factory::BufferFactory;
use crate::graph::GraphImpl;
use crate::host::{PluginDescriptor, PluginInstance, PluginRegistry};
use crate::internals::{InternalKind, InternalState};
use crate::port::Port;
use crate::run_context::RunContext;

/// A block's port array.
///
/// Each port is a separate heap allocation addressed through a raw pointer,
/// so port addresses survive replacement of the array itself (graph port
/// add/remove swaps the array; surviving ports keep their identity for
/// arcs, the store and the audio thread). The array does not own the ports:
/// the containing [`Block`] frees whatever its current array holds when it
/// is dropped, replaced arrays drop as plain pointer lists, and removal
/// events free removed ports explicitly.
pub struct Ports {
    ports: Box<[*mut Port]>,
}

// Safety: the pointed-to ports are owned by the block whose current array
// this is; disposal is deferred until the audio thread can no longer reach
// them.
unsafe impl Send for Ports {}
unsafe impl Sync for Ports {}

impl Ports {
    pub fn from_vec(ports: Vec<Port>) -> Self {
        Self {
            ports: ports
                .into_iter()
                .map(|p| Box::into_raw(Box::new(p)))
                .collect(),
        }
    }

    /// Build from raw pointers, taking ownership. Used when replacing an
    /// array while keeping surviving ports.
    pub fn from_raw(ports: Vec<*mut Port>) -> Self {
        Self {
            ports: ports.into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn at(&self, index: usize) -> &Port {
        // Safety: the pointer is owned by this array and live.
        unsafe { &*self.ports[index] }
    }

    pub fn at_mut(&mut self, index: usize) -> &mut Port {
        // Safety: as `at`, and `&mut self` guarantees uniqueness.
        unsafe { &mut *self.ports[index] }
    }

    pub fn raw(&self, index: usize) -> *mut Port {
        self.ports[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Port> {
        // Safety: as `at`.
        self.ports.iter().map(|p| unsafe { &**p })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Port> {
        // Safety: as `at_mut`; all pointers are distinct allocations.
        self.ports.iter().map(|p| unsafe { &mut **p })
    }

    pub fn find(&self, symbol: &str) -> Option<&Port> {
        self.iter().find(|p| p.symbol().as_str() == symbol)
    }

    pub fn find_raw(&self, symbol: &str) -> Option<*mut Port> {
        self.ports
            .iter()
            .copied()
            .find(|&p| unsafe { &*p }.symbol().as_str() == symbol)
    }
}


/// A hosted plugin block: one instance per voice.
pub struct PluginBlock {
    pub descriptor: Arc<PluginDescriptor>,
    pub instances: SmallVec<[Box<dyn PluginInstance>; 1]>,
}

impl PluginBlock {
    /// Connect every plugin port of instance `voice` to the block's voice
    /// buffers and run it. Audio thread.
    fn run(&mut self, ports: &mut Ports, ctx: &RunContext) {
        for (voice, instance) in self.instances.iter_mut().enumerate() {
            for i in 0..ports.len() {
                let port = ports.at(i);
                let v = voice.min(port.poly() as usize - 1);
                let buffer = &port.voices()[v].buffer;
                // Safety: pointer handed to the instance for this run call
                // only; the buffer outlives the call.
                let ptr = unsafe { buffer.get_mut() }.float_ptr();
                instance.connect_port(i as u32, ptr);
            }
            instance.run(ctx.sub_frames());
        }
    }
}

/// Subtype-specific part of a block.
pub enum BlockKind {
    Internal(InternalState),
    Plugin(PluginBlock),
    SubGraph(Box<GraphImpl>),
}

pub struct Block {
    path: Path,
    plugin_uri: Uri,
    pub properties: Properties,
    pub ports: Ports,
    pub kind: BlockKind,
    poly: u32,
    /// Bypass flag, read on the audio thread.
    enabled: bool,
    activated: bool,
    /// The graph that owns this block; null for the root graph block.
    pub(crate) parent: *mut GraphImpl,
}

// Safety: parent pointers target graphs that outlive their children; blocks
// move between threads only through the event pipeline.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Drop for Block {
    fn drop(&mut self) {
        for i in 0..self.ports.len() {
            // Safety: the block owns whatever its current array holds; every
            // pointer came from `Box::into_raw` and removed ports were taken
            // out of the array by the event that removed them.
            drop(unsafe { Box::from_raw(self.ports.raw(i)) });
        }
    }
}

impl Block {
    pub fn new(path: Path, plugin_uri: Uri, ports: Ports, kind: BlockKind) -> Self {
        Self {
            path,
            plugin_uri,
            properties: Properties::new(),
            ports,
            kind,
            poly: 1,
            enabled: true,
            activated: false,
            parent: core::ptr::null_mut(),
        }
    }

    /// Create an internal block with its canonical ports.
    pub fn new_internal(
        path: Path,
        kind: InternalKind,
        poly: u32,
        factory: &mut BufferFactory,
        urids: &CoreUrids,
    ) -> Result<Self, Status> {
        let descriptors = kind.port_descriptors(urids);
        let poly = if kind.polyphonic() { poly.max(1) } else { 1 };
        let mut ports = Vec::with_capacity(descriptors.len());
        for (i, d) in descriptors.iter().enumerate() {
            let buffer_type = match d.default {
                Atom::Urid(u) if d.ty == PortType::Atom => Some(u),
                _ => None,
            };
            let value = if d.ty == PortType::Atom {
                Atom::Int(0)
            } else {
                d.default.clone()
            };
            let mut port = Port::new(
                path.child(&d.symbol),
                i as u32,
                d.ty,
                d.direction,
                buffer_type,
                value,
                factory,
            )?;
            port.min = d.min.clone();
            port.max = d.max.clone();
            ports.push(port);
        }
        let state = InternalState::new(kind, poly, factory.nframes(), *urids);
        let mut block = Self::new(path, kind.uri(), Ports::from_vec(ports), BlockKind::Internal(state));
        block.poly = poly;
        Ok(block)
    }

    /// Create a hosted plugin block from its descriptor.
    pub fn new_plugin(
        path: Path,
        descriptor: Arc<PluginDescriptor>,
        factory: &mut BufferFactory,
    ) -> Result<Self, Status> {
        let mut ports = Vec::with_capacity(descriptor.ports.len());
        for (i, d) in descriptor.ports.iter().enumerate() {
            let mut port = Port::new(
                path.child(&d.symbol),
                i as u32,
                d.ty,
                d.direction,
                None,
                d.default.clone(),
                factory,
            )?;
            port.min = d.min.clone();
            port.max = d.max.clone();
            ports.push(port);
        }
        let uri = descriptor.uri.clone();
        Ok(Self::new(
            path,
            uri,
            Ports::from_vec(ports),
            BlockKind::Plugin(PluginBlock {
                descriptor,
                instances: SmallVec::new(),
            }),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
    pub fn plugin_uri(&self) -> &Uri {
        &self.plugin_uri
    }
    pub fn poly(&self) -> u32 {
        self.poly
    }
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
    pub fn is_activated(&self) -> bool {
        self.activated
    }

    pub fn graph(&self) -> Option<&GraphImpl> {
        match &self.kind {
            BlockKind::SubGraph(g) => Some(g),
            _ => None,
        }
    }
    pub fn graph_mut(&mut self) -> Option<&mut GraphImpl> {
        match &mut self.kind {
            BlockKind::SubGraph(g) => Some(g),
            _ => None,
        }
    }

    /// Rename this block and all its ports. Pre-process thread, while the
    /// store mutex is held.
    pub(crate) fn set_path(&mut self, path: Path) {
        for port in self.ports.iter_mut() {
            let symbol = port.symbol().clone();
            port.set_path(path.child(&symbol));
        }
        if let BlockKind::SubGraph(g) = &mut self.kind {
            g.set_path(path.clone());
        }
        self.path = path;
    }

    /// Allocate per-instance state. Must be called before the block enters
    /// any compiled graph. Pre-process thread.
    pub fn activate(
        &mut self,
        registry: &mut PluginRegistry,
        sample_rate: u32,
    ) -> Result<(), Status> {
        if self.activated {
            return Ok(());
        }
        if let BlockKind::Plugin(p) = &mut self.kind {
            let voices = self.poly.max(1);
            for _ in 0..voices {
                let mut instance = registry.instantiate(&p.descriptor, sample_rate)?;
                instance.activate();
                p.instances.push(instance);
            }
        }
        self.activated = true;
        Ok(())
    }

    /// Release per-instance state. Only called after the block is out of
    /// every compiled graph.
    pub fn deactivate(&mut self) {
        if !self.activated {
            return;
        }
        if let BlockKind::Plugin(p) = &mut self.kind {
            for instance in p.instances.iter_mut() {
                instance.deactivate();
            }
            p.instances.clear();
        }
        self.activated = false;
    }

    /// Pre-process-side half of a polyphony change: allocate the plugin
    /// instances the new voice count needs. Returns the prepared instances
    /// for the event to install.
    pub fn prepare_poly(
        &mut self,
        registry: &mut PluginRegistry,
        sample_rate: u32,
        poly: u32,
    ) -> Result<SmallVec<[Box<dyn PluginInstance>; 1]>, Status> {
        let mut prepared = SmallVec::new();
        if let BlockKind::Plugin(p) = &mut self.kind {
            for _ in 0..poly {
                let mut instance = registry.instantiate(&p.descriptor, sample_rate)?;
                if self.activated {
                    instance.activate();
                }
                prepared.push(instance);
            }
        }
        Ok(prepared)
    }

    /// Audio-thread half of a polyphony change: swap in prepared state.
    /// Returns the replaced instances for disposal.
    pub fn apply_poly(
        &mut self,
        poly: u32,
        instances: SmallVec<[Box<dyn PluginInstance>; 1]>,
    ) -> SmallVec<[Box<dyn PluginInstance>; 1]> {
        self.poly = poly;
        match &mut self.kind {
            BlockKind::Plugin(p) if !instances.is_empty() => {
                core::mem::replace(&mut p.instances, instances)
            }
            _ => instances,
        }
    }

    pub(crate) fn set_poly(&mut self, poly: u32) {
        self.poly = poly;
    }

    /// Run one cycle (or sub-range) of this block. Audio thread.
    pub fn process(&mut self, ctx: &RunContext) {
        // Mix or pass through inputs, then clear outputs for `run`.
        for port in self.ports.iter_mut() {
            if port.direction().is_input() {
                port.pre_run(ctx);
            }
        }
        for port in self.ports.iter_mut() {
            if port.direction().is_output() {
                port.prepare_buffers(ctx);
            }
        }
        if !self.enabled {
            self.bypass(ctx);
            return;
        }
        match &mut self.kind {
            BlockKind::Internal(state) => state.run(&mut self.ports, ctx),
            BlockKind::Plugin(p) => p.run(&mut self.ports, ctx),
            BlockKind::SubGraph(g) => g.process(ctx, &mut self.ports),
        }
        for port in self.ports.iter() {
            if port.direction().is_output() {
                port.monitor_cycle(ctx);
            }
        }
    }

    /// Bypass: copy the k-th input of each type to the k-th same-typed
    /// output; outputs with no counterpart stay cleared.
    fn bypass(&mut self, ctx: &RunContext) {
        for ty in [
            PortType::Audio,
            PortType::Control,
            PortType::Cv,
            PortType::Atom,
        ] {
            let inputs: SmallVec<[usize; 4]> = (0..self.ports.len())
                .filter(|&i| {
                    let p = self.ports.at(i);
                    p.port_type() == ty && p.direction() == Direction::Input
                })
                .collect();
            let outputs: SmallVec<[usize; 4]> = (0..self.ports.len())
                .filter(|&i| {
                    let p = self.ports.at(i);
                    p.port_type() == ty && p.direction() == Direction::Output
                })
                .collect();
            for (&inp, &out) in inputs.iter().zip(outputs.iter()) {
                let in_port = self.ports.at(inp);
                let out_port = self.ports.at(out);
                for v in 0..out_port.poly() as usize {
                    let src_voice = v.min(in_port.poly() as usize - 1);
                    let src = &in_port.voices()[src_voice].buffer;
                    let dst = &out_port.voices()[v].buffer;
                    if dst.ptr_eq(src) {
                        continue;
                    }
                    // Safety: unique writer of the output voice; the input
                    // was finalized by pre_run above.
                    unsafe { dst.get_mut() }.copy(ctx, unsafe { src.get() });
                }
            }
        }
    }
}
