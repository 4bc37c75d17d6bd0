//! Property changes: Delta, Put-on-existing and SetPortValue.
//!
//! Most properties are plain multimap edits, but a handful reach into the
//! audio thread and are staged as prepared operations installed by the
//! execute phase: enabling/bypassing, control values, and the two-phase
//! polyphony change.

use ingen_core::{Atom, Path, Properties, Property, Status, Uri};
use smallvec::SmallVec;

use crate::block::Block;
use crate::compiled_graph::CompiledGraph;
use crate::event::connect::HeadRewire;
use crate::event::keys;
use crate::event::{Event, EventKind, PostProcessContext, PreProcessContext};
use crate::graph::GraphImpl;
use crate::host::PluginInstance;
use crate::port::Port;
use crate::run_context::RunContext;
use crate::store::ObjectRef;

/// One audio-thread operation staged by a property change.
pub(crate) enum AudioOp {
    SetBlockEnabled {
        block: *mut Block,
        enabled: bool,
    },
    SetGraphEnabled {
        graph: *mut GraphImpl,
        enabled: bool,
        /// A re-enable of a dirty graph carries a fresh compile.
        compiled: Option<Box<CompiledGraph>>,
    },
    SetControlValue {
        port: *mut Port,
        value: f32,
    },
    /// Phase two of a polyphony change: swap every prepared voice array and
    /// plugin instance set, then flip the audio-side poly count.
    ApplyGraphPoly {
        graph: *mut GraphImpl,
        poly: u32,
        rewires: Vec<HeadRewire>,
        instances: Vec<(*mut Block, u32, SmallVec<[Box<dyn PluginInstance>; 1]>)>,
    },
    /// Install a replacement control-binding list.
    SwapBindings {
        bindings: *const crate::control_bindings::ControlBindings,
        new: Option<Vec<crate::control_bindings::Binding>>,
    },
}

impl AudioOp {
    fn execute(&mut self, ctx: &RunContext) {
        match self {
            AudioOp::SetBlockEnabled { block, enabled } => {
                // Safety: audio-thread swap per the event protocol.
                unsafe { &mut **block }.set_enabled(*enabled);
            }
            AudioOp::SetGraphEnabled {
                graph,
                enabled,
                compiled,
            } => {
                let graph = unsafe { &mut **graph };
                if compiled.is_some() {
                    let old = graph.swap_compiled(compiled.take());
                    *compiled = old;
                }
                graph.set_enabled(*enabled);
            }
            AudioOp::SetControlValue { port, value } => {
                unsafe { &mut **port }.set_control_value(ctx, ctx.offset, *value);
            }
            AudioOp::ApplyGraphPoly {
                graph,
                poly,
                rewires,
                instances,
            } => {
                for rewire in rewires.iter_mut() {
                    rewire.install();
                }
                for (block, block_poly, prepared) in instances.iter_mut() {
                    let old = unsafe { &mut **block }
                        .apply_poly(*block_poly, core::mem::take(prepared));
                    *prepared = old;
                }
                unsafe { &mut **graph }.apply_internal_poly(*poly);
            }
            AudioOp::SwapBindings { bindings, new } => {
                if let Some(list) = new.take() {
                    // Safety: the bindings object is owned by the engine and
                    // outlives every event.
                    let old = unsafe { &**bindings }.swap(list);
                    *new = Some(old);
                }
            }
        }
    }

    fn is_atomic(&self) -> bool {
        matches!(self, AudioOp::ApplyGraphPoly { .. })
    }
}

pub struct Delta {
    pub uri: Uri,
    pub remove: Properties,
    pub add: Properties,
    /// Put semantics: each added key replaces all existing values.
    pub put_mode: bool,
    ops: Vec<AudioOp>,
    /// Notifications emitted from post-process.
    note_removed: Properties,
    note_added: Properties,
}

impl Delta {
    pub fn new(uri: Uri, remove: Properties, add: Properties) -> Self {
        Self {
            uri,
            remove,
            add,
            put_mode: false,
            ops: Vec::new(),
            note_removed: Properties::new(),
            note_added: Properties::new(),
        }
    }

    pub fn new_put(uri: Uri, add: Properties) -> Self {
        let mut delta = Self::new(uri, Properties::new(), add);
        delta.put_mode = true;
        delta
    }

    /// One-key replace, the `set_property` interface call.
    pub fn new_set(uri: Uri, key: Uri, value: Atom) -> Self {
        let mut remove = Properties::new();
        remove.insert(key.clone(), Property::new(Atom::Wildcard));
        let mut add = Properties::new();
        add.insert(key, Property::new(value));
        Self::new(uri, remove, add)
    }

    pub(crate) fn is_atomic(&self) -> bool {
        self.ops.iter().any(|op| op.is_atomic())
    }

    pub(crate) fn pre_process(
        &mut self,
        ctx: &mut PreProcessContext,
        undo: &mut Vec<Event>,
    ) -> Status {
        let Some(path) = self.uri.to_path() else {
            return Status::BadUri;
        };
        let store = ctx.store.lock().expect("store lock");
        let target = match store.get(&path) {
            Ok(t) => t,
            Err(status) => return status,
        };

        // Capture prior state of touched keys for the inverse before
        // applying anything.
        let mut inverse_add = Properties::new();
        let mut inverse_remove = Properties::new();

        let remove = core::mem::take(&mut self.remove);
        let add = core::mem::take(&mut self.add);

        for (key, pattern) in remove.iter() {
            let removed = match target {
                // Safety: live objects, store mutex held.
                ObjectRef::Block(b) => unsafe { &mut *b }
                    .properties
                    .remove(key, &pattern.value),
                ObjectRef::Port(p) => unsafe { &mut *p }
                    .properties
                    .remove(key, &pattern.value),
            };
            for prop in removed {
                inverse_add.insert(key.clone(), prop.clone());
                self.note_removed.insert(key.clone(), prop);
            }
            // Wildcard binding removal also clears control bindings.
            if key.as_str() == keys::BINDING && pattern.value.is_wildcard() {
                if let ObjectRef::Port(p) = target {
                    if let Some(new) = ctx.bindings.prepare_removal(p) {
                        self.ops.push(AudioOp::SwapBindings {
                            bindings: ctx.bindings,
                            new: Some(new),
                        });
                    }
                }
            }
        }

        for (key, prop) in add.iter() {
            let status = self.apply_one(ctx, target, &path, key, prop, &mut inverse_add, &mut inverse_remove);
            if status != Status::Success {
                return status;
            }
            self.note_added.insert(key.clone(), prop.clone());
        }

        let mut inverse = Delta::new(self.uri.clone(), inverse_remove, inverse_add);
        inverse.put_mode = false;
        undo.push(Event::new(0, 0, EventKind::Delta(inverse)));
        Status::Success
    }

    /// Route one added property: special keys stage audio operations,
    /// everything else is a multimap edit.
    #[allow(clippy::too_many_arguments)]
    fn apply_one(
        &mut self,
        ctx: &mut PreProcessContext,
        target: ObjectRef,
        _path: &Path,
        key: &Uri,
        prop: &Property,
        inverse_add: &mut Properties,
        inverse_remove: &mut Properties,
    ) -> Status {
        let record_replace =
            |props: &mut Properties, inverse_add: &mut Properties, inverse_remove: &mut Properties| {
                for prev in props.remove(key, &Atom::Wildcard) {
                    inverse_add.insert(key.clone(), prev);
                }
                inverse_remove.insert(key.clone(), Property::new(prop.value.clone()));
                props.insert(key.clone(), prop.clone());
            };

        match (key.as_str(), target) {
            (keys::ENABLED, ObjectRef::Block(block)) => {
                let Some(enabled) = prop.value.bool() else {
                    return Status::BadValueType;
                };
                // Safety: live block, store mutex held.
                let block_ref = unsafe { &mut *block };
                record_replace(&mut block_ref.properties, inverse_add, inverse_remove);
                if let Some(graph) = block_ref.graph_mut() {
                    // Re-enabling a dirty graph needs a valid compiled tree.
                    let compiled = if enabled && graph.dirty {
                        match ctx.compile_or_defer(graph) {
                            Ok(c) => c,
                            Err(status) => return status,
                        }
                    } else {
                        None
                    };
                    self.ops.push(AudioOp::SetGraphEnabled {
                        graph,
                        enabled,
                        compiled,
                    });
                } else {
                    self.ops.push(AudioOp::SetBlockEnabled {
                        block,
                        enabled,
                    });
                }
                Status::Success
            }
            (keys::POLYPHONY, ObjectRef::Block(block)) => {
                let Some(poly) = prop.value.to_float() else {
                    return Status::BadValueType;
                };
                let poly = poly as i64;
                if poly < 1 || poly > ctx.poly_limit as i64 {
                    return Status::InvalidPoly;
                }
                let block_ref = unsafe { &mut *block };
                let Some(graph) = block_ref.graph_mut() else {
                    return Status::BadObjectType;
                };
                let op = match prepare_graph_poly(ctx, graph, poly as u32) {
                    Ok(op) => op,
                    Err(status) => return status,
                };
                record_replace(&mut block_ref.properties, inverse_add, inverse_remove);
                self.ops.push(op);
                Status::Success
            }
            (keys::POLYPHONIC, ObjectRef::Block(block)) => {
                let Some(polyphonic) = prop.value.bool() else {
                    return Status::BadValueType;
                };
                let block_ref = unsafe { &mut *block };
                if block_ref.parent.is_null() {
                    return Status::BadRequest;
                }
                record_replace(&mut block_ref.properties, inverse_add, inverse_remove);
                // Safety: parent graphs outlive children.
                let parent = unsafe { &mut *block_ref.parent };
                let graph_poly = parent.internal_poly();
                let op = match prepare_block_poly(
                    ctx,
                    parent,
                    block,
                    if polyphonic { graph_poly } else { 1 },
                ) {
                    Ok(op) => op,
                    Err(status) => return status,
                };
                self.ops.push(op);
                Status::Success
            }
            (keys::VALUE, ObjectRef::Port(port)) => {
                let port_ref = unsafe { &mut *port };
                if !port_ref.port_type().is_control() {
                    return Status::BadObjectType;
                }
                let Some(value) = prop.value.to_float() else {
                    return Status::BadValueType;
                };
                inverse_remove.insert(key.clone(), Property::new(prop.value.clone()));
                inverse_add.insert(key.clone(), Property::new(port_ref.value.clone()));
                port_ref.value = prop.value.clone();
                self.ops.push(AudioOp::SetControlValue { port, value });
                Status::Success
            }
            (keys::MONITORED, ObjectRef::Port(port)) => {
                let Some(monitored) = prop.value.bool() else {
                    return Status::BadValueType;
                };
                let port_ref = unsafe { &mut *port };
                record_replace(&mut port_ref.properties, inverse_add, inverse_remove);
                port_ref.set_monitored(monitored);
                Status::Success
            }
            (keys::MINIMUM, ObjectRef::Port(port)) => {
                let port_ref = unsafe { &mut *port };
                inverse_remove.insert(key.clone(), Property::new(prop.value.clone()));
                inverse_add.insert(key.clone(), Property::new(port_ref.min.clone()));
                port_ref.min = prop.value.clone();
                Status::Success
            }
            (keys::MAXIMUM, ObjectRef::Port(port)) => {
                let port_ref = unsafe { &mut *port };
                inverse_remove.insert(key.clone(), Property::new(prop.value.clone()));
                inverse_add.insert(key.clone(), Property::new(port_ref.max.clone()));
                port_ref.max = prop.value.clone();
                Status::Success
            }
            (keys::BINDING, ObjectRef::Port(port)) => {
                let port_ref = unsafe { &mut *port };
                record_replace(&mut port_ref.properties, inverse_add, inverse_remove);
                if let Some(new) = ctx.bindings.prepare_binding(port, &prop.value) {
                    self.ops.push(AudioOp::SwapBindings {
                        bindings: ctx.bindings,
                        new: Some(new),
                    });
                }
                Status::Success
            }
            (_, ObjectRef::Block(block)) => {
                let block_ref = unsafe { &mut *block };
                if self.put_mode {
                    record_replace(&mut block_ref.properties, inverse_add, inverse_remove);
                } else {
                    inverse_remove.insert(key.clone(), Property::new(prop.value.clone()));
                    block_ref.properties.insert(key.clone(), prop.clone());
                }
                Status::Success
            }
            (_, ObjectRef::Port(port)) => {
                let port_ref = unsafe { &mut *port };
                if self.put_mode {
                    record_replace(&mut port_ref.properties, inverse_add, inverse_remove);
                } else {
                    inverse_remove.insert(key.clone(), Property::new(prop.value.clone()));
                    port_ref.properties.insert(key.clone(), prop.clone());
                }
                Status::Success
            }
        }
    }

    pub(crate) fn execute(&mut self, ctx: &RunContext) {
        for op in self.ops.iter_mut() {
            op.execute(ctx);
        }
    }

    pub(crate) fn post_process(&mut self, ctx: &mut PostProcessContext) {
        ctx.broadcaster
            .send_all(|c| c.delta(&self.uri, &self.note_removed, &self.note_added));
    }
}

/// Phase one of a graph polyphony change: allocate every voice array and
/// plugin instance set the new count needs. Conservative about joins; see
/// [`Port::prepare_voices_owned`].
fn prepare_graph_poly(
    ctx: &mut PreProcessContext,
    graph: &mut GraphImpl,
    poly: u32,
) -> Result<AudioOp, Status> {
    let mut rewires = Vec::new();
    let mut instances = Vec::new();
    let keys_list: Vec<crate::graph::BlockKey> = graph.blocks().keys().collect();
    for key in keys_list {
        let block_ptr: *mut Block = graph
            .blocks_mut()
            .get_mut(key)
            .map(|b| &mut **b as *mut Block)
            .expect("key just listed");
        // Safety: live block of this graph.
        let block = unsafe { &mut *block_ptr };
        let polyphonic = block
            .properties
            .get_first(&keys::uri(keys::POLYPHONIC))
            .and_then(|a| a.bool())
            .unwrap_or(false);
        let block_poly = if polyphonic { poly } else { 1 };
        if block_poly != block.poly() {
            let prepared = block.prepare_poly(ctx.registry, ctx.sample_rate, block_poly)?;
            instances.push((block_ptr, block_poly, prepared));
            block.set_poly(block_poly);
        }
        for i in 0..block.ports.len() {
            let port = block.ports.at(i);
            let port_poly = if polyphonic { block_poly } else { 1 };
            if port.poly() != port_poly {
                let voices = port.prepare_voices_owned(ctx.factory, port_poly)?;
                rewires.push(HeadRewire {
                    head: block.ports.raw(i),
                    voices: Some(voices),
                    sources: graph.sources_for(block.ports.raw(i)),
                });
            }
        }
    }
    graph.set_internal_poly(poly);
    Ok(AudioOp::ApplyGraphPoly {
        graph,
        poly,
        rewires,
        instances,
    })
}

/// Polyphony change for a single block following (or leaving) its parent
/// graph's voice count.
fn prepare_block_poly(
    ctx: &mut PreProcessContext,
    graph: &mut GraphImpl,
    block_ptr: *mut Block,
    block_poly: u32,
) -> Result<AudioOp, Status> {
    // Safety: live block owned by `graph`.
    let block = unsafe { &mut *block_ptr };
    let mut rewires = Vec::new();
    let mut instances = Vec::new();
    if block_poly != block.poly() {
        let prepared = block.prepare_poly(ctx.registry, ctx.sample_rate, block_poly)?;
        instances.push((block_ptr, block_poly, prepared));
        block.set_poly(block_poly);
    }
    for i in 0..block.ports.len() {
        let port = block.ports.at(i);
        if port.poly() != block_poly {
            let voices = port.prepare_voices_owned(ctx.factory, block_poly)?;
            rewires.push(HeadRewire {
                head: block.ports.raw(i),
                voices: Some(voices),
                sources: graph.sources_for(block.ports.raw(i)),
            });
        }
    }
    let poly = graph.internal_poly();
    Ok(AudioOp::ApplyGraphPoly {
        graph,
        poly,
        rewires,
        instances,
    })
}

pub struct SetPortValue {
    pub port_path: Path,
    pub value: Atom,
    prepared: Option<(*mut Port, f32)>,
}

impl SetPortValue {
    pub fn new(port_path: Path, value: Atom) -> Self {
        Self {
            port_path,
            value,
            prepared: None,
        }
    }

    pub(crate) fn pre_process(
        &mut self,
        ctx: &mut PreProcessContext,
        undo: &mut Vec<Event>,
    ) -> Status {
        let store = ctx.store.lock().expect("store lock");
        let port = match store.port(&self.port_path) {
            Ok(p) => p,
            Err(status) => return status,
        };
        // Safety: live port, store mutex held.
        let port_ref = unsafe { &mut *port };
        if !port_ref.port_type().is_control() {
            return Status::BadObjectType;
        }
        let Some(value) = self.value.to_float() else {
            return Status::BadValueType;
        };
        undo.push(Event::new(
            0,
            0,
            EventKind::SetPortValue(SetPortValue::new(
                self.port_path.clone(),
                port_ref.value.clone(),
            )),
        ));
        port_ref.value = self.value.clone();
        self.prepared = Some((port, value));
        Status::Success
    }

    pub(crate) fn execute(&mut self, ctx: &RunContext) {
        if let Some((port, value)) = self.prepared {
            // Safety: audio-thread write per the event protocol.
            unsafe { &mut *port }.set_control_value(ctx, ctx.offset, value);
        }
    }

    pub(crate) fn post_process(&mut self, ctx: &mut PostProcessContext) {
        if let Some((_, value)) = self.prepared {
            ctx.broadcaster
                .send_all(|c| c.port_value(&self.port_path, value));
        }
    }
}
