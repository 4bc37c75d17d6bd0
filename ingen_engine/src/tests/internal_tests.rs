//! Direct tests of the internal blocks, fed hand-built MIDI sequences.

use ingen_core::{CoreUrids, Path, Urid, UridMap};

use crate::block::Block;
use crate::buffer_factory::{BufferFactory, DEFAULT_SEQ_CAPACITY};
use crate::internals::midi::note_to_freq;
use crate::internals::InternalKind;
use crate::run_context::{RunContext, RunState};

const NFRAMES: u32 = 16;

struct Fixture {
    factory: BufferFactory,
    urids: CoreUrids,
    ctx: RunContext,
}

impl Fixture {
    fn new() -> Self {
        let map = UridMap::new();
        Self {
            factory: BufferFactory::new(NFRAMES as usize, DEFAULT_SEQ_CAPACITY),
            urids: CoreUrids::new(&map),
            ctx: RunContext::new(RunState::new(), NFRAMES),
        }
    }

    fn block(&mut self, kind: InternalKind, poly: u32) -> Block {
        Block::new_internal(
            Path::parse("/b").unwrap(),
            kind,
            poly,
            &mut self.factory,
            &self.urids,
        )
        .unwrap()
    }

    fn midi_type(&self) -> Urid {
        self.urids.midi_event
    }

    /// Append a raw MIDI message to the block's ATOM input (port 0).
    fn feed_midi(&self, block: &mut Block, frame: u32, message: [u8; 3]) {
        let midi_type = self.midi_type();
        let voice = &block.ports.at(0).voices()[0];
        // Safety: offline test, unique access.
        let buf = unsafe { voice.buffer.get_mut() };
        assert!(buf
            .sequence_data_mut()
            .expect("input is a sequence port")
            .append(frame, midi_type, &message));
    }

    fn out_value(&self, block: &Block, port: usize, voice: usize) -> f32 {
        let voice = &block.ports.at(port).voices()[voice];
        // Safety: offline test, unique access.
        unsafe { voice.buffer.get() }.value_at(NFRAMES - 1)
    }

    fn clear_input(&self, block: &mut Block) {
        let voice = &block.ports.at(0).voices()[0];
        let buf = unsafe { voice.buffer.get_mut() };
        if let Some(seq) = buf.sequence_data_mut() {
            seq.clear();
        }
    }
}

#[test]
fn controller_scales_linearly() {
    let mut f = Fixture::new();
    let mut block = f.block(InternalKind::Controller, 1);
    // controller = 7, range stays [0, 1]
    block.ports.at_mut(1).set_control_value(&f.ctx, 0, 7.0);
    f.feed_midi(&mut block, 2, [0xB0, 7, 127]);
    block.process(&f.ctx);
    assert!((f.out_value(&block, 5, 0) - 1.0).abs() < 1e-6);

    f.clear_input(&mut block);
    f.feed_midi(&mut block, 0, [0xB0, 7, 0]);
    block.process(&f.ctx);
    assert_eq!(f.out_value(&block, 5, 0), 0.0);
}

#[test]
fn controller_ignores_other_controllers() {
    let mut f = Fixture::new();
    let mut block = f.block(InternalKind::Controller, 1);
    block.ports.at_mut(1).set_control_value(&f.ctx, 0, 7.0);
    f.feed_midi(&mut block, 0, [0xB0, 8, 127]);
    block.process(&f.ctx);
    assert_eq!(f.out_value(&block, 5, 0), 0.0);
}

#[test]
fn note_drives_gate_frequency_and_velocity() {
    let mut f = Fixture::new();
    let mut block = f.block(InternalKind::Note, 1);
    f.feed_midi(&mut block, 1, [0x90, 60, 127]);
    block.process(&f.ctx);
    // frequency=1, velocity=2, gate=3, trigger=4
    assert!((f.out_value(&block, 1, 0) - note_to_freq(60)).abs() < 1e-3);
    assert!((f.out_value(&block, 2, 0) - 1.0).abs() < 1e-6);
    assert_eq!(f.out_value(&block, 3, 0), 1.0);
    // The trigger pulse has fallen back by the end of the cycle.
    assert_eq!(f.out_value(&block, 4, 0), 0.0);

    f.clear_input(&mut block);
    f.feed_midi(&mut block, 0, [0x80, 60, 0]);
    block.process(&f.ctx);
    assert_eq!(f.out_value(&block, 3, 0), 0.0);
}

#[test]
fn note_allocates_polyphonic_voices() {
    let mut f = Fixture::new();
    let mut block = f.block(InternalKind::Note, 2);
    // Voice ports follow block polyphony.
    for port in [1, 2, 3, 4] {
        let voices = block.ports.at(port).prepare_voices_owned(&mut f.factory, 2).unwrap();
        block
            .ports
            .at_mut(port)
            .connect_buffers(voices, smallvec::SmallVec::new());
    }
    f.feed_midi(&mut block, 0, [0x90, 60, 100]);
    f.feed_midi(&mut block, 1, [0x90, 64, 100]);
    block.process(&f.ctx);
    assert_eq!(f.out_value(&block, 3, 0), 1.0);
    assert_eq!(f.out_value(&block, 3, 1), 1.0);
    assert!((f.out_value(&block, 1, 0) - note_to_freq(60)).abs() < 1e-3);
    assert!((f.out_value(&block, 1, 1) - note_to_freq(64)).abs() < 1e-3);

    // A third note steals the oldest voice.
    f.clear_input(&mut block);
    f.feed_midi(&mut block, 0, [0x90, 67, 100]);
    block.process(&f.ctx);
    assert!((f.out_value(&block, 1, 0) - note_to_freq(67)).abs() < 1e-3);
    assert!((f.out_value(&block, 1, 1) - note_to_freq(64)).abs() < 1e-3);
}

#[test]
fn trigger_matches_its_note_only() {
    let mut f = Fixture::new();
    let mut block = f.block(InternalKind::Trigger, 1);
    // note port defaults to 60; gate=2, trigger=3, velocity=4
    f.feed_midi(&mut block, 0, [0x90, 61, 100]);
    block.process(&f.ctx);
    assert_eq!(f.out_value(&block, 2, 0), 0.0);

    f.clear_input(&mut block);
    f.feed_midi(&mut block, 0, [0x90, 60, 127]);
    block.process(&f.ctx);
    assert_eq!(f.out_value(&block, 2, 0), 1.0);
    assert!((f.out_value(&block, 4, 0) - 1.0).abs() < 1e-6);

    f.clear_input(&mut block);
    f.feed_midi(&mut block, 3, [0x80, 60, 0]);
    block.process(&f.ctx);
    assert_eq!(f.out_value(&block, 2, 0), 0.0);
}

#[test]
fn time_emits_one_position_event_per_cycle() {
    let mut f = Fixture::new();
    let mut block = f.block(InternalKind::Time, 1);
    block.process(&f.ctx);
    let voice = &block.ports.at(0).voices()[0];
    let buf = unsafe { voice.buffer.get() };
    let seq = buf.sequence_data().unwrap();
    assert_eq!(seq.events().len(), 1);
    let (frame, speed) =
        crate::internals::time::decode_position(seq.body(&seq.events()[0])).unwrap();
    assert_eq!(frame, 0);
    assert_eq!(speed, 1.0);
}
