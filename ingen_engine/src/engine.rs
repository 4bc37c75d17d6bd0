//! The engine: event queues, thread roles and the cycle entry point.
//!
//! [`Engine`] is the non-real-time half (pre- and post-processing, store,
//! allocation, history); [`EngineProcess`] is the half a
//! [`Driver`](crate::driver::Driver) drives from its audio callback. They
//! communicate exclusively through lock-free rings of prepared events.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use ingen_core::{Atom, CoreUrids, Path, Properties, Status, Uri, UridMap};

use crate::block::{Block, BlockKind, Ports};
use crate::broadcaster::{Broadcaster, ClientId};
use crate::buffer::BufferRef;
use crate::buffer_factory::{BufferFactory, DEFAULT_SEQ_CAPACITY};
use crate::control_bindings::ControlBindings;
use crate::event::{
    keys, BundleState, Delta, Event, EventKind, EventMode, Mark, PostProcessContext,
    PreProcessContext,
};
use crate::graph::GraphImpl;
use crate::host::{PluginHost, PluginRegistry};
use crate::rt_log::{RtLogReceiver, RtLogSender};
use crate::run_context::{RunContext, RunState};
use crate::store::{ObjectRef, Store};
use crate::worker::WorkerPool;

pub struct EngineOptions {
    /// Frames per cycle the buffers are sized for.
    pub block_size: u32,
    pub sample_rate: u32,
    /// Capacity of the client submission queue.
    pub event_queue_size: usize,
    /// Capacity of the prepared/executed event rings.
    pub ring_size: usize,
    /// Audio helper threads stealing parallel work. 0 runs everything on
    /// the driver thread.
    pub num_workers: usize,
    /// Upper bound for graph polyphony.
    pub poly_limit: u32,
    /// Byte capacity of ATOM sequence buffers.
    pub seq_capacity: usize,
    /// Fragment capacity of the audio-thread log ring.
    pub rt_log_capacity: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            block_size: 512,
            sample_rate: 48000,
            event_queue_size: 1024,
            ring_size: 1024,
            num_workers: std::thread::available_parallelism()
                .map(|n| n.get().saturating_sub(1))
                .unwrap_or(0),
            poly_limit: 128,
            seq_capacity: DEFAULT_SEQ_CAPACITY,
            rt_log_capacity: 1024,
        }
    }
}

/// Keeps the root block allocation alive for both engine halves.
struct RootCell(UnsafeCell<Block>);

// Safety: access follows the same discipline as every block: structure
// mutation on the pre-process side, processing on the audio side, prepared
// swaps in between.
unsafe impl Send for RootCell {}
unsafe impl Sync for RootCell {}

/// Cloneable client-side handle: stamps and submits events.
#[derive(Clone)]
pub struct EngineHandle {
    tx: Arc<Mutex<rtrb::Producer<Event>>>,
    frame: Arc<AtomicU64>,
}

impl EngineHandle {
    pub fn submit(&self, mut event: Event) -> Result<(), Status> {
        event.time = self.frame.load(Ordering::Relaxed);
        self.tx
            .lock()
            .expect("client queue lock")
            .push(event)
            .map_err(|_| Status::Failure)
    }

    pub fn put(&self, client: ClientId, seq: i32, uri: Uri, properties: Properties) {
        let _ = self.submit(Event::new(
            client,
            seq,
            EventKind::Put(crate::event::Put::new(uri, properties)),
        ));
    }

    pub fn delta(
        &self,
        client: ClientId,
        seq: i32,
        uri: Uri,
        remove: Properties,
        add: Properties,
    ) {
        let _ = self.submit(Event::new(
            client,
            seq,
            EventKind::Delta(Delta::new(uri, remove, add)),
        ));
    }

    pub fn set_property(&self, client: ClientId, seq: i32, uri: Uri, key: Uri, value: Atom) {
        let _ = self.submit(Event::new(
            client,
            seq,
            EventKind::Delta(Delta::new_set(uri, key, value)),
        ));
    }

    pub fn connect(&self, client: ClientId, seq: i32, tail: Path, head: Path) {
        let _ = self.submit(Event::new(
            client,
            seq,
            EventKind::Connect(crate::event::Connect::new(tail, head)),
        ));
    }

    pub fn disconnect(&self, client: ClientId, seq: i32, tail: Path, head: Path) {
        let _ = self.submit(Event::new(
            client,
            seq,
            EventKind::Disconnect(crate::event::Disconnect::new(tail, head)),
        ));
    }

    pub fn disconnect_all(&self, client: ClientId, seq: i32, path: Path) {
        let _ = self.submit(Event::new(
            client,
            seq,
            EventKind::DisconnectAll(crate::event::DisconnectAll::new(path)),
        ));
    }

    pub fn mv(&self, client: ClientId, seq: i32, old_path: Path, new_path: Path) {
        let _ = self.submit(Event::new(
            client,
            seq,
            EventKind::Move(crate::event::Move::new(old_path, new_path)),
        ));
    }

    pub fn copy(&self, client: ClientId, seq: i32, old_uri: Uri, new_uri: Uri) {
        let _ = self.submit(Event::new(
            client,
            seq,
            EventKind::Copy(crate::event::Copy::new(old_uri, new_uri)),
        ));
    }

    pub fn del(&self, client: ClientId, seq: i32, uri: Uri) {
        let _ = self.submit(Event::new(
            client,
            seq,
            EventKind::Delete(crate::event::Delete::new(uri)),
        ));
    }

    pub fn get(&self, client: ClientId, seq: i32, uri: Uri) {
        let _ = self.submit(Event::new(client, seq, EventKind::Get(crate::event::Get::new(uri))));
    }

    pub fn set_port_value(&self, client: ClientId, seq: i32, path: Path, value: Atom) {
        let _ = self.submit(Event::new(
            client,
            seq,
            EventKind::SetPortValue(crate::event::SetPortValue::new(path, value)),
        ));
    }

    pub fn bundle_begin(&self, client: ClientId, seq: i32) {
        let _ = self.submit(Event::new(client, seq, EventKind::Mark(Mark::begin())));
    }

    pub fn bundle_end(&self, client: ClientId, seq: i32) {
        let _ = self.submit(Event::new(client, seq, EventKind::Mark(Mark::end())));
    }

    pub fn undo(&self, client: ClientId, seq: i32) {
        let _ = self.submit(Event::new(client, seq, EventKind::Undo));
    }

    pub fn redo(&self, client: ClientId, seq: i32) {
        let _ = self.submit(Event::new(client, seq, EventKind::Redo));
    }
}

/// The non-real-time half of the engine.
pub struct Engine {
    sample_rate: u32,
    poly_limit: u32,
    ring_capacity: usize,

    store: Arc<Mutex<Store>>,
    factory: BufferFactory,
    urid_map: Arc<UridMap>,
    urids: CoreUrids,
    registry: PluginRegistry,
    bindings: Arc<ControlBindings>,
    broadcaster: Arc<Broadcaster>,
    undo_stack: crate::undo::UndoStack,
    redo_stack: crate::undo::UndoStack,
    bundle: BundleState,
    /// Events held back while a bundle is open, flushed as one batch at
    /// bundle end so the audio thread sees the whole bundle in one cycle.
    bundle_buffer: Vec<Event>,

    root: Arc<RootCell>,

    client_rx: rtrb::Consumer<Event>,
    client_tx: Arc<Mutex<rtrb::Producer<Event>>>,
    prepared_tx: rtrb::Producer<Event>,
    executed_rx: rtrb::Consumer<Event>,
    rt_log_rx: RtLogReceiver,
    run_state: Arc<RunState>,
    frame: Arc<AtomicU64>,
}

// Safety: the root pointer and event contents follow the event protocol;
// the engine value itself is only used from one non-real-time thread at a
// time.
unsafe impl Send for Engine {}

impl Engine {
    pub fn new(options: EngineOptions) -> (Engine, EngineProcess) {
        let urid_map = Arc::new(UridMap::new());
        let urids = CoreUrids::new(&urid_map);
        let factory = BufferFactory::new(options.block_size as usize, options.seq_capacity);

        let mut root_graph = GraphImpl::new(Path::root(), 1);
        root_graph.compiled = Some(
            crate::compiled_graph::compile(&root_graph).expect("an empty graph always compiles"),
        );
        root_graph.dirty = false;
        let root_block = Block::new(
            Path::root(),
            keys::uri(keys::TYPE_GRAPH),
            Ports::from_vec(Vec::new()),
            BlockKind::SubGraph(Box::new(root_graph)),
        );
        let root = Arc::new(RootCell(UnsafeCell::new(root_block)));
        let root_ptr = root.0.get();

        let store = Arc::new(Mutex::new(Store::new()));
        store
            .lock()
            .expect("store lock")
            .insert(Path::root(), ObjectRef::Block(root_ptr))
            .expect("the store is empty at startup");

        let (client_tx, client_rx) = rtrb::RingBuffer::new(options.event_queue_size);
        let (prepared_tx, prepared_rx) = rtrb::RingBuffer::new(options.ring_size);
        let (executed_tx, executed_rx) = rtrb::RingBuffer::new(options.ring_size);
        let (rt_log_tx, rt_log_rx) = crate::rt_log::channel(options.rt_log_capacity);

        let run_state = RunState::new();
        let bindings = Arc::new(ControlBindings::new());
        let frame = Arc::new(AtomicU64::new(0));

        let pool = WorkerPool::new(options.num_workers, run_state.clone());
        let mut ctx = RunContext::new(run_state.clone(), options.block_size)
            .with_pool(pool.shared());

        let process = EngineProcess {
            root: root.clone(),
            prepared_rx,
            executed_tx,
            bindings: bindings.clone(),
            urids,
            rt_log: rt_log_tx,
            pool,
            frame: 0,
            shared_frame: frame.clone(),
            ctx: {
                ctx.begin_cycle(0, options.block_size);
                ctx
            },
        };

        let engine = Engine {
            sample_rate: options.sample_rate,
            poly_limit: options.poly_limit,
            ring_capacity: options.ring_size,
            store,
            factory,
            urid_map,
            urids,
            registry: PluginRegistry::new(),
            bindings,
            broadcaster: Arc::new(Broadcaster::new()),
            undo_stack: crate::undo::UndoStack::new(),
            redo_stack: crate::undo::UndoStack::new(),
            bundle: BundleState::default(),
            bundle_buffer: Vec::new(),
            root,
            client_rx,
            client_tx: Arc::new(Mutex::new(client_tx)),
            prepared_tx,
            executed_rx,
            rt_log_rx,
            run_state,
            frame,
        };
        (engine, process)
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            tx: self.client_tx.clone(),
            frame: self.frame.clone(),
        }
    }

    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        self.broadcaster.clone()
    }

    pub fn register_host(&mut self, host: Box<dyn PluginHost>) {
        self.registry.register(host);
    }

    pub fn store(&self) -> Arc<Mutex<Store>> {
        self.store.clone()
    }

    pub fn urid_map(&self) -> Arc<UridMap> {
        self.urid_map.clone()
    }

    pub fn urids(&self) -> &CoreUrids {
        &self.urids
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }
    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    fn root_ptr(&self) -> *mut Block {
        self.root.0.get()
    }

    /// Drain the client queue: pre-process each event and hand successful
    /// ones to the audio thread (or the bundle buffer).
    pub fn pre_process_events(&mut self) {
        while let Ok(event) = self.client_rx.pop() {
            match event.kind {
                EventKind::Undo => {
                    let entry = self.undo_stack.pop();
                    self.replay(entry, EventMode::Undo, event.client, event.seq);
                }
                EventKind::Redo => {
                    let entry = self.redo_stack.pop();
                    self.replay(entry, EventMode::Redo, event.client, event.seq);
                }
                _ => self.process_one(event),
            }
        }
    }

    /// Replay a history entry in reverse submission order.
    fn replay(&mut self, entry: Option<Vec<Event>>, mode: EventMode, client: ClientId, seq: i32) {
        let Some(events) = entry else {
            self.broadcaster
                .send_to(client, |c| c.response(seq, Status::NotFound, None));
            return;
        };
        // A multi-event entry replays as one atomic, single-undo bundle.
        let bundled = events.len() > 1;
        if bundled {
            self.process_one(Event::new(0, 0, EventKind::Mark(Mark::begin())).with_mode(mode));
        }
        for mut event in events.into_iter().rev() {
            event.mode = mode;
            event.time = self.frame.load(Ordering::Relaxed);
            self.process_one(event);
        }
        if bundled {
            self.process_one(Event::new(0, 0, EventKind::Mark(Mark::end())).with_mode(mode));
        }
        self.broadcaster
            .send_to(client, |c| c.response(seq, Status::Success, None));
    }

    fn process_one(&mut self, mut event: Event) {
        let status = {
            let root = self.root_ptr();
            let mut ctx = PreProcessContext {
                store: &self.store,
                factory: &mut self.factory,
                urids: &self.urids,
                urid_map: &self.urid_map,
                registry: &mut self.registry,
                bindings: &self.bindings,
                root,
                sample_rate: self.sample_rate,
                poly_limit: self.poly_limit,
                bundle: &mut self.bundle,
            };
            event.pre_process(&mut ctx)
        };
        let flush = matches!(&event.kind, EventKind::Mark(m) if !m.begin);
        if status != Status::Success {
            self.finish(event);
            if flush {
                // A failed bundle end still releases the held events; their
                // pre-side changes already happened and the audio thread
                // keeps running the previous compiled graphs.
                for buffered in core::mem::take(&mut self.bundle_buffer) {
                    self.send_prepared(buffered);
                }
            }
            return;
        }
        let atomic = event.is_atomic();
        if self.bundle.open || flush {
            self.bundle_buffer.push(event);
        } else {
            self.send_prepared(event);
        }
        if flush {
            for buffered in core::mem::take(&mut self.bundle_buffer) {
                self.send_prepared(buffered);
            }
        }
        if atomic && !self.bundle.open {
            self.wait_for_execution();
        }
    }

    fn send_prepared(&mut self, event: Event) {
        if let Err(rtrb::PushError::Full(event)) = self.prepared_tx.push(event) {
            log::error!("prepared event ring is full; failing the event");
            let mut failed = event;
            failed.status = Some(Status::InternalError);
            self.finish(failed);
        }
    }

    /// Bounded wait until the audio thread has drained the prepared ring,
    /// used after atomic events so their installation completes before
    /// pre-processing continues. Best effort: if no audio thread is
    /// advancing the frame clock, give up quickly.
    fn wait_for_execution(&mut self) {
        let mut last_frame = self.frame.load(Ordering::Relaxed);
        let mut stalled = 0;
        while self.prepared_tx.slots() < self.ring_capacity {
            std::thread::sleep(core::time::Duration::from_micros(200));
            let now = self.frame.load(Ordering::Relaxed);
            if now == last_frame {
                stalled += 1;
                if stalled > 8 {
                    return;
                }
            } else {
                stalled = 0;
                last_frame = now;
            }
        }
    }

    /// Post-process an event that never reached the audio thread.
    fn finish(&mut self, event: Event) {
        let mut ctx = PostProcessContext {
            broadcaster: &self.broadcaster,
            undo_stack: &mut self.undo_stack,
            redo_stack: &mut self.redo_stack,
        };
        event.post_process(&mut ctx);
    }

    /// Drain executed events, forward audio-thread logs, emit monitoring
    /// and learned-binding notifications.
    pub fn post_process_events(&mut self) {
        while let Ok(event) = self.executed_rx.pop() {
            let mut ctx = PostProcessContext {
                broadcaster: &self.broadcaster,
                undo_stack: &mut self.undo_stack,
                redo_stack: &mut self.redo_stack,
            };
            event.post_process(&mut ctx);
        }
        self.rt_log_rx.forward_to_log();
        if self.run_state.take_error() {
            log::error!("audio thread flagged an internal error");
            self.broadcaster
                .send_all(|c| c.error("internal error on the audio thread"));
        }
        if let Some((channel, controller, port)) = self.bindings.take_learned() {
            let path = {
                let _store = self.store.lock().expect("store lock");
                // Safety: the armed port is live; bindings for deleted
                // ports are removed before disposal.
                unsafe { &*port }.path().clone()
            };
            self.handle().set_property(
                0,
                0,
                Uri::from_path(&path),
                keys::uri(keys::BINDING),
                Atom::Int(((channel as i32) << 8) | controller as i32),
            );
        }
        self.emit_monitors();
        self.factory.reap();
    }

    /// Send port-value notifications for monitored ports that changed.
    fn emit_monitors(&mut self) {
        let mut changes: Vec<(Path, f32)> = Vec::new();
        {
            let store = self.store.lock().expect("store lock");
            for (path, object) in store.iter() {
                if let ObjectRef::Port(port) = object {
                    // Safety: live port; the monitor cell is lock free.
                    let port = unsafe { &**port };
                    if let Some(value) = port.monitor.take_change() {
                        changes.push((path.clone(), value));
                    }
                }
            }
        }
        for (path, value) in changes {
            self.broadcaster.send_all(|c| c.port_value(&path, value));
        }
    }

    /// One round of non-real-time work: both queue directions.
    pub fn maintain(&mut self) {
        self.pre_process_events();
        self.post_process_events();
    }

    /// Reallocate all buffers for a new cycle length. The driver guarantees
    /// no `process` callback overlaps this call.
    pub fn resize_buffers(&mut self, block_size: u32) {
        self.factory.resize_all(block_size as usize);
    }
}

/// Runs an engine's non-real-time work on its own thread until dropped.
pub struct EngineThreads {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<Engine>>,
}

impl EngineThreads {
    pub fn spawn(mut engine: Engine) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();
        let thread = std::thread::Builder::new()
            .name("ingen-worker".into())
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    engine.maintain();
                    std::thread::sleep(core::time::Duration::from_micros(500));
                }
                engine.maintain();
                engine
            })
            .expect("spawning the engine worker thread");
        Self {
            shutdown,
            thread: Some(thread),
        }
    }

    /// Stop the worker and get the engine back.
    pub fn join(mut self) -> Engine {
        self.shutdown.store(true, Ordering::Release);
        self.thread
            .take()
            .expect("join consumes the only handle")
            .join()
            .expect("the engine worker thread exits cleanly")
    }
}

impl Drop for EngineThreads {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The real-time half: owned by the driver, called once per cycle.
pub struct EngineProcess {
    root: Arc<RootCell>,
    prepared_rx: rtrb::Consumer<Event>,
    executed_tx: rtrb::Producer<Event>,
    bindings: Arc<ControlBindings>,
    urids: CoreUrids,
    rt_log: RtLogSender,
    pool: WorkerPool,
    frame: u64,
    shared_frame: Arc<AtomicU64>,
    ctx: RunContext,
}

// Safety: see RootCell and the event protocol.
unsafe impl Send for EngineProcess {}

impl EngineProcess {
    fn root_block(&self) -> *mut Block {
        self.root.0.get()
    }

    pub fn current_frame(&self) -> u64 {
        self.frame
    }

    /// The buffer handle for a voice of one of the root graph's ports.
    /// Drivers fetch these each cycle (they change when events install
    /// replacements) to connect system I/O.
    pub fn root_port_buffer(&self, symbol: &str, voice: usize) -> Option<BufferRef> {
        // Safety: port array reads on the audio thread between swaps.
        let root = unsafe { &*self.root_block() };
        let port = root.ports.find(symbol)?;
        port.voices().get(voice).map(|v| v.buffer.clone())
    }

    /// The root port the control bindings read MIDI from: the first ATOM
    /// input port, if any.
    fn root_midi_buffer(&self) -> Option<BufferRef> {
        // Safety: as `root_port_buffer`.
        let root = unsafe { &*self.root_block() };
        root.ports
            .iter()
            .find(|p| {
                p.direction().is_input() && p.port_type() == ingen_core::PortType::Atom
            })
            .map(|p| p.voices()[0].buffer.clone())
    }

    /// Run one audio cycle: execute due events, map control bindings, run
    /// the root graph's task tree. Called by the driver; never allocates,
    /// never blocks.
    pub fn run_cycle(&mut self, nframes: u32) {
        let frame = self.frame;
        let cycle_end = frame + nframes as u64;
        self.ctx.begin_cycle(frame, nframes);

        // Every event stamped before this cycle's end executes now, at its
        // frame offset, before any DSP.
        loop {
            let due = matches!(self.prepared_rx.peek(), Ok(ev) if ev.time < cycle_end);
            if !due {
                break;
            }
            let mut event = self.prepared_rx.pop().expect("peek said there is one");
            let offset =
                (event.time.saturating_sub(frame)).min(nframes.saturating_sub(1) as u64) as u32;
            self.ctx.set_sub_range(offset, nframes);
            event.execute(&self.ctx);
            if let Err(rtrb::PushError::Full(event)) = self.executed_tx.push(event) {
                // Disposal on the audio thread is the lesser evil here;
                // tell the other side the ring needs to grow.
                crate::rt_log!(self.rt_log; "executed event ring full, disposing on audio thread");
                drop(event);
            }
        }
        self.ctx.set_sub_range(0, nframes);

        if let Some(midi) = self.root_midi_buffer() {
            // Safety: read-only; the driver wrote this buffer before the
            // cycle.
            self.bindings
                .process(&self.ctx, unsafe { midi.get() }, self.urids.midi_event);
        }

        self.pool.begin_cycle(&self.ctx);
        // Safety: the audio thread is the unique processor of the root.
        unsafe { &mut *self.root_block() }.process(&self.ctx);
        self.pool.end_cycle();

        self.frame = cycle_end;
        self.shared_frame.store(cycle_end, Ordering::Release);
    }
}
