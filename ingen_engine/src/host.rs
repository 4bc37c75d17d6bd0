//! Plugin host contract.
//!
//! The engine treats hosted plugins as black boxes: a host library provides
//! descriptors and instances; the engine only connects port storage and
//! calls `run` within the real-time rules. Instance lifecycle calls happen
//! on the pre-process thread; `run` on the audio thread.

use ingen_core::{Atom, Direction, PortType, Status, Symbol, Uri};
use std::collections::HashMap;
use std::sync::Arc;

/// Static description of one plugin port.
#[derive(Clone, Debug)]
pub struct PortDescriptor {
    pub symbol: Symbol,
    pub ty: PortType,
    pub direction: Direction,
    pub default: Atom,
    pub min: Atom,
    pub max: Atom,
}

/// Static description of a loadable plugin.
#[derive(Clone, Debug)]
pub struct PluginDescriptor {
    pub uri: Uri,
    pub name: String,
    pub ports: Vec<PortDescriptor>,
}

/// A live plugin instance. The engine owns one per voice of a hosted block.
pub trait PluginInstance: Send {
    /// Point plugin port `index` at `buffer`. The pointer stays valid until
    /// the next `connect_port` for that index or the instance is dropped.
    fn connect_port(&mut self, index: u32, buffer: *mut f32);
    fn activate(&mut self) {}
    fn deactivate(&mut self) {}
    /// Process `nframes` frames. Audio thread; must not allocate or block.
    fn run(&mut self, nframes: u32);
}

/// A plugin hosting library (LV2 or otherwise).
pub trait PluginHost: Send {
    fn load_plugin(&mut self, uri: &Uri) -> Option<Arc<PluginDescriptor>>;
    fn instantiate(
        &mut self,
        descriptor: &PluginDescriptor,
        sample_rate: u32,
    ) -> Result<Box<dyn PluginInstance>, Status>;
}

/// Registry of hosts, queried in registration order. Pre-process only.
pub struct PluginRegistry {
    hosts: Vec<Box<dyn PluginHost>>,
    cache: HashMap<Uri, Arc<PluginDescriptor>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            hosts: Vec::new(),
            cache: HashMap::new(),
        }
    }

    pub fn register(&mut self, host: Box<dyn PluginHost>) {
        self.hosts.push(host);
    }

    pub fn load(&mut self, uri: &Uri) -> Option<Arc<PluginDescriptor>> {
        if let Some(desc) = self.cache.get(uri) {
            return Some(desc.clone());
        }
        for host in &mut self.hosts {
            if let Some(desc) = host.load_plugin(uri) {
                self.cache.insert(uri.clone(), desc.clone());
                return Some(desc);
            }
        }
        None
    }

    pub fn instantiate(
        &mut self,
        descriptor: &PluginDescriptor,
        sample_rate: u32,
    ) -> Result<Box<dyn PluginInstance>, Status> {
        for host in &mut self.hosts {
            if host.load_plugin(&descriptor.uri).is_some() {
                return host.instantiate(descriptor, sample_rate);
            }
        }
        Err(Status::PrototypeNotFound)
    }
}
