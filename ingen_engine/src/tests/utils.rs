//! Shared scaffolding for engine tests: an offline driver loop, a recording
//! client and a tiny plugin host.

use std::sync::{Arc, Mutex};

use ingen_core::{Atom, Direction, Path, PortType, Properties, Property, Status, Symbol, Uri};

use crate::broadcaster::ClientInterface;
use crate::engine::{Engine, EngineHandle, EngineOptions, EngineProcess};
use crate::event::keys;
use crate::host::{PluginDescriptor, PluginHost, PluginInstance, PortDescriptor};

pub const BLOCK_SIZE: u32 = 16;

pub const GAIN_URI: &str = "urn:test:gain";
pub const CONST_URI: &str = "urn:test:const";

/// `out = in * gain`.
struct GainInstance {
    ports: [*mut f32; 3],
}
// Safety: the pointers target engine-owned buffers valid across run calls.
unsafe impl Send for GainInstance {}

impl PluginInstance for GainInstance {
    fn connect_port(&mut self, index: u32, buffer: *mut f32) {
        if (index as usize) < self.ports.len() {
            self.ports[index as usize] = buffer;
        }
    }
    fn run(&mut self, nframes: u32) {
        let [input, gain, output] = self.ports;
        if input.is_null() || gain.is_null() || output.is_null() {
            return;
        }
        // Safety: connected by the engine per the host contract.
        unsafe {
            let g = *gain;
            for i in 0..nframes as usize {
                *output.add(i) = *input.add(i) * g;
            }
        }
    }
}

/// `out[i] = value` for every frame.
struct ConstInstance {
    ports: [*mut f32; 2],
}
unsafe impl Send for ConstInstance {}

impl PluginInstance for ConstInstance {
    fn connect_port(&mut self, index: u32, buffer: *mut f32) {
        if (index as usize) < self.ports.len() {
            self.ports[index as usize] = buffer;
        }
    }
    fn run(&mut self, nframes: u32) {
        let [value, output] = self.ports;
        if value.is_null() || output.is_null() {
            return;
        }
        // Safety: as GainInstance.
        unsafe {
            let v = *value;
            for i in 0..nframes as usize {
                *output.add(i) = v;
            }
        }
    }
}

pub struct TestHost;

impl PluginHost for TestHost {
    fn load_plugin(&mut self, uri: &Uri) -> Option<Arc<PluginDescriptor>> {
        let audio = |symbol: &str, direction| PortDescriptor {
            symbol: Symbol::parse(symbol).unwrap(),
            ty: PortType::Audio,
            direction,
            default: Atom::Float(0.0),
            min: Atom::Float(-1.0),
            max: Atom::Float(1.0),
        };
        let control = |symbol: &str, default: f32| PortDescriptor {
            symbol: Symbol::parse(symbol).unwrap(),
            ty: PortType::Control,
            direction: Direction::Input,
            default: Atom::Float(default),
            min: Atom::Float(0.0),
            max: Atom::Float(10.0),
        };
        match uri.as_str() {
            GAIN_URI => Some(Arc::new(PluginDescriptor {
                uri: uri.clone(),
                name: "Test Gain".into(),
                ports: vec![
                    audio("in", Direction::Input),
                    control("gain", 1.0),
                    audio("out", Direction::Output),
                ],
            })),
            CONST_URI => Some(Arc::new(PluginDescriptor {
                uri: uri.clone(),
                name: "Test Const".into(),
                ports: vec![control("value", 0.0), audio("out", Direction::Output)],
            })),
            _ => None,
        }
    }

    fn instantiate(
        &mut self,
        descriptor: &PluginDescriptor,
        _sample_rate: u32,
    ) -> Result<Box<dyn PluginInstance>, Status> {
        match descriptor.uri.as_str() {
            GAIN_URI => Ok(Box::new(GainInstance {
                ports: [core::ptr::null_mut(); 3],
            })),
            CONST_URI => Ok(Box::new(ConstInstance {
                ports: [core::ptr::null_mut(); 2],
            })),
            _ => Err(Status::PrototypeNotFound),
        }
    }
}

/// What a recording client heard, in order.
#[derive(Clone, Debug, PartialEq)]
pub enum Note {
    Response(i32, Status),
    Put(String),
    Deleted(String),
    Moved(String, String),
    Connected(String, String),
    Disconnected(String, String),
    PortValue(String, f32),
    BundleBegin,
    BundleEnd,
    Error(String),
}

pub struct RecordingClient {
    pub notes: Arc<Mutex<Vec<Note>>>,
}

impl ClientInterface for RecordingClient {
    fn response(&mut self, seq: i32, status: Status, _subject: Option<&str>) {
        self.notes.lock().unwrap().push(Note::Response(seq, status));
    }
    fn put(&mut self, uri: &Uri, _properties: &Properties) {
        self.notes.lock().unwrap().push(Note::Put(uri.to_string()));
    }
    fn deleted(&mut self, uri: &Uri) {
        self.notes.lock().unwrap().push(Note::Deleted(uri.to_string()));
    }
    fn moved(&mut self, old_path: &Path, new_path: &Path) {
        self.notes
            .lock()
            .unwrap()
            .push(Note::Moved(old_path.to_string(), new_path.to_string()));
    }
    fn connected(&mut self, tail: &Path, head: &Path) {
        self.notes
            .lock()
            .unwrap()
            .push(Note::Connected(tail.to_string(), head.to_string()));
    }
    fn disconnected(&mut self, tail: &Path, head: &Path) {
        self.notes
            .lock()
            .unwrap()
            .push(Note::Disconnected(tail.to_string(), head.to_string()));
    }
    fn port_value(&mut self, path: &Path, value: f32) {
        self.notes
            .lock()
            .unwrap()
            .push(Note::PortValue(path.to_string(), value));
    }
    fn error(&mut self, message: &str) {
        self.notes.lock().unwrap().push(Note::Error(message.into()));
    }
    fn bundle_begin(&mut self) {
        self.notes.lock().unwrap().push(Note::BundleBegin);
    }
    fn bundle_end(&mut self) {
        self.notes.lock().unwrap().push(Note::BundleEnd);
    }
}

/// An engine plus its offline driver side, stepped manually.
pub struct TestEngine {
    pub engine: Engine,
    pub process: EngineProcess,
    pub handle: EngineHandle,
    pub notes: Arc<Mutex<Vec<Note>>>,
    pub client: u32,
    next_seq: i32,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_workers(0)
    }

    pub fn with_workers(num_workers: usize) -> Self {
        let (mut engine, process) = Engine::new(EngineOptions {
            block_size: BLOCK_SIZE,
            sample_rate: 48000,
            num_workers,
            ..Default::default()
        });
        engine.register_host(Box::new(TestHost));
        let notes = Arc::new(Mutex::new(Vec::new()));
        let client = engine.broadcaster().register(Box::new(RecordingClient {
            notes: notes.clone(),
        }));
        let handle = engine.handle();
        Self {
            engine,
            process,
            handle,
            notes,
            client,
            next_seq: 0,
        }
    }

    pub fn seq(&mut self) -> i32 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Push pending work through the whole pipeline: pre-process, one audio
    /// cycle, post-process.
    pub fn sync(&mut self) {
        self.engine.maintain();
        self.process.run_cycle(BLOCK_SIZE);
        self.engine.maintain();
    }

    pub fn run_cycles(&mut self, n: usize) {
        for _ in 0..n {
            self.sync();
        }
    }

    /// Submit a put creating a plugin block.
    pub fn create_block(&mut self, path: &str, prototype: &str) -> i32 {
        let seq = self.seq();
        let mut props = Properties::new();
        props.insert(
            keys::uri(keys::PROTOTYPE),
            Property::new(Atom::Uri(Uri::parse(prototype).unwrap())),
        );
        self.handle.put(
            self.client,
            seq,
            Uri::parse(&format!("ingen:{path}")).unwrap(),
            props,
        );
        seq
    }

    pub fn create_polyphonic_block(&mut self, path: &str, prototype: &str) -> i32 {
        let seq = self.seq();
        let mut props = Properties::new();
        props.insert(
            keys::uri(keys::PROTOTYPE),
            Property::new(Atom::Uri(Uri::parse(prototype).unwrap())),
        );
        props.insert(keys::uri(keys::POLYPHONIC), Property::new(Atom::Bool(true)));
        self.handle.put(
            self.client,
            seq,
            Uri::parse(&format!("ingen:{path}")).unwrap(),
            props,
        );
        seq
    }

    /// Submit a put creating a sub-graph.
    pub fn create_graph(&mut self, path: &str, poly: i32) -> i32 {
        let seq = self.seq();
        let mut props = Properties::new();
        props.insert(
            keys::uri(keys::TYPE),
            Property::new(Atom::Uri(keys::uri(keys::TYPE_GRAPH))),
        );
        props.insert(keys::uri(keys::POLYPHONY), Property::new(Atom::Int(poly)));
        self.handle.put(
            self.client,
            seq,
            Uri::parse(&format!("ingen:{path}")).unwrap(),
            props,
        );
        seq
    }

    pub fn connect(&mut self, tail: &str, head: &str) -> i32 {
        let seq = self.seq();
        self.handle.connect(
            self.client,
            seq,
            Path::parse(tail).unwrap(),
            Path::parse(head).unwrap(),
        );
        seq
    }

    pub fn disconnect(&mut self, tail: &str, head: &str) -> i32 {
        let seq = self.seq();
        self.handle.disconnect(
            self.client,
            seq,
            Path::parse(tail).unwrap(),
            Path::parse(head).unwrap(),
        );
        seq
    }

    pub fn delete(&mut self, path: &str) -> i32 {
        let seq = self.seq();
        self.handle
            .del(self.client, seq, Uri::parse(&format!("ingen:{path}")).unwrap());
        seq
    }

    pub fn set_port_value(&mut self, path: &str, value: f32) -> i32 {
        let seq = self.seq();
        self.handle.set_port_value(
            self.client,
            seq,
            Path::parse(path).unwrap(),
            Atom::Float(value),
        );
        seq
    }

    pub fn status_of(&self, seq: i32) -> Option<Status> {
        self.notes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|n| match n {
                Note::Response(s, status) if *s == seq => Some(*status),
                _ => None,
            })
    }

    pub fn store_contains(&self, path: &str) -> bool {
        self.engine
            .store()
            .lock()
            .unwrap()
            .contains(&Path::parse(path).unwrap())
    }

    /// Current value of a port's voice-0 buffer at the end of the cycle.
    pub fn port_value(&self, path: &str) -> f32 {
        let store = self.engine.store();
        let store = store.lock().unwrap();
        let port = store.port(&Path::parse(path).unwrap()).expect("port exists");
        // Safety: test runs the audio side synchronously; nothing is
        // processing while we peek.
        let port = unsafe { &*port };
        let buf = &port.voices()[0].buffer;
        unsafe { buf.get() }.value_at(BLOCK_SIZE - 1)
    }

    /// The port's voice buffers, for identity checks.
    pub fn port_buffers(&self, path: &str) -> Vec<crate::buffer::BufferRef> {
        let store = self.engine.store();
        let store = store.lock().unwrap();
        let port = store.port(&Path::parse(path).unwrap()).expect("port exists");
        let port = unsafe { &*port };
        port.voices().iter().map(|v| v.buffer.clone()).collect()
    }
}
