//! Blocks implemented inside the engine.
//!
//! Internals cover the glue DSP the engine provides itself: note and
//! controller converters, a trigger gate, a transport-time emitter and the
//! one-cycle delay that breaks feedback loops. Everything heavier is a
//! hosted plugin.

use ingen_core::{Atom, CoreUrids, Direction, PortType, Symbol, Uri};

use crate::host::PortDescriptor;
use crate::run_context::RunContext;

mod block_delay;
mod controller;
mod note;
pub mod time;
mod trigger;

pub use block_delay::BlockDelayState;
pub use controller::ControllerState;
pub use note::NoteState;
pub use time::TimeState;
pub use trigger::TriggerState;

pub const CONTROLLER_URI: &str = "ingen:/internals/Controller";
pub const NOTE_URI: &str = "ingen:/internals/Note";
pub const TRIGGER_URI: &str = "ingen:/internals/Trigger";
pub const TIME_URI: &str = "ingen:/internals/Time";
pub const BLOCK_DELAY_URI: &str = "ingen:/internals/BlockDelay";

/// The built-in block types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InternalKind {
    Controller,
    Note,
    Trigger,
    Time,
    BlockDelay,
}

impl InternalKind {
    pub fn from_uri(uri: &Uri) -> Option<Self> {
        match uri.as_str() {
            CONTROLLER_URI => Some(Self::Controller),
            NOTE_URI => Some(Self::Note),
            TRIGGER_URI => Some(Self::Trigger),
            TIME_URI => Some(Self::Time),
            BLOCK_DELAY_URI => Some(Self::BlockDelay),
            _ => None,
        }
    }

    pub fn uri(self) -> Uri {
        let s = match self {
            Self::Controller => CONTROLLER_URI,
            Self::Note => NOTE_URI,
            Self::Trigger => TRIGGER_URI,
            Self::Time => TIME_URI,
            Self::BlockDelay => BLOCK_DELAY_URI,
        };
        Uri::parse(s).expect("internal URIs are valid")
    }

    /// Canonical block symbol used when the client gives no name.
    pub fn symbol(self) -> Symbol {
        let s = match self {
            Self::Controller => "control",
            Self::Note => "notes",
            Self::Trigger => "trigger",
            Self::Time => "time",
            Self::BlockDelay => "delay",
        };
        Symbol::parse(s).expect("internal symbols are valid")
    }

    /// True if outgoing arcs of this block carry the previous cycle's value
    /// and therefore impose no execution-order dependency.
    pub fn breaks_feedback(self) -> bool {
        self == Self::BlockDelay
    }

    /// Whether the block can follow its parent graph's polyphony.
    pub fn polyphonic(self) -> bool {
        self == Self::Note
    }

    pub fn port_descriptors(self, urids: &CoreUrids) -> Vec<PortDescriptor> {
        fn pd(
            symbol: &str,
            ty: PortType,
            direction: Direction,
            default: f32,
            min: f32,
            max: f32,
        ) -> PortDescriptor {
            PortDescriptor {
                symbol: Symbol::parse(symbol).expect("internal port symbols are valid"),
                ty,
                direction,
                default: Atom::Float(default),
                min: Atom::Float(min),
                max: Atom::Float(max),
            }
        }
        let midi_in = PortDescriptor {
            symbol: Symbol::parse("input").expect("valid"),
            ty: PortType::Atom,
            direction: Direction::Input,
            default: Atom::Urid(urids.midi_event),
            min: Atom::Float(0.0),
            max: Atom::Float(0.0),
        };
        match self {
            Self::Controller => vec![
                midi_in,
                pd("controller", PortType::Control, Direction::Input, 0.0, 0.0, 127.0),
                pd("logarithmic", PortType::Control, Direction::Input, 0.0, 0.0, 1.0),
                pd("minimum", PortType::Control, Direction::Input, 0.0, 0.0, 65535.0),
                pd("maximum", PortType::Control, Direction::Input, 1.0, 0.0, 65535.0),
                pd("output", PortType::Control, Direction::Output, 0.0, 0.0, 1.0),
            ],
            Self::Note => vec![
                midi_in,
                pd("frequency", PortType::Cv, Direction::Output, 440.0, 16.0, 25088.0),
                pd("velocity", PortType::Cv, Direction::Output, 0.0, 0.0, 1.0),
                pd("gate", PortType::Cv, Direction::Output, 0.0, 0.0, 1.0),
                pd("trigger", PortType::Cv, Direction::Output, 0.0, 0.0, 1.0),
            ],
            Self::Trigger => vec![
                midi_in,
                pd("note", PortType::Control, Direction::Input, 60.0, 0.0, 127.0),
                pd("gate", PortType::Cv, Direction::Output, 0.0, 0.0, 1.0),
                pd("trigger", PortType::Cv, Direction::Output, 0.0, 0.0, 1.0),
                pd("velocity", PortType::Cv, Direction::Output, 0.0, 0.0, 1.0),
            ],
            Self::Time => vec![PortDescriptor {
                symbol: Symbol::parse("notify").expect("valid"),
                ty: PortType::Atom,
                direction: Direction::Output,
                default: Atom::Urid(urids.time_position),
                min: Atom::Float(0.0),
                max: Atom::Float(0.0),
            }],
            Self::BlockDelay => vec![
                pd("input", PortType::Audio, Direction::Input, 0.0, -1.0, 1.0),
                pd("output", PortType::Audio, Direction::Output, 0.0, -1.0, 1.0),
            ],
        }
    }
}

/// Per-instance state of an internal block.
pub enum InternalState {
    Controller(ControllerState),
    Note(NoteState),
    Trigger(TriggerState),
    Time(TimeState),
    BlockDelay(BlockDelayState),
}

impl InternalState {
    pub fn new(kind: InternalKind, poly: u32, nframes: usize, urids: CoreUrids) -> Self {
        match kind {
            InternalKind::Controller => Self::Controller(ControllerState::new(urids)),
            InternalKind::Note => Self::Note(NoteState::new(poly, urids)),
            InternalKind::Trigger => Self::Trigger(TriggerState::new(urids)),
            InternalKind::Time => Self::Time(TimeState::new(urids)),
            InternalKind::BlockDelay => Self::BlockDelay(BlockDelayState::new(poly, nframes)),
        }
    }

    pub fn kind(&self) -> InternalKind {
        match self {
            Self::Controller(_) => InternalKind::Controller,
            Self::Note(_) => InternalKind::Note,
            Self::Trigger(_) => InternalKind::Trigger,
            Self::Time(_) => InternalKind::Time,
            Self::BlockDelay(_) => InternalKind::BlockDelay,
        }
    }

    pub fn run(&mut self, ports: &mut crate::block::Ports, ctx: &RunContext) {
        match self {
            Self::Controller(s) => s.run(ports, ctx),
            Self::Note(s) => s.run(ports, ctx),
            Self::Trigger(s) => s.run(ports, ctx),
            Self::Time(s) => s.run(ports, ctx),
            Self::BlockDelay(s) => s.run(ports, ctx),
        }
    }
}

/// MIDI helpers shared by the note-driven internals.
pub(crate) mod midi {
    pub const NOTE_OFF: u8 = 0x80;
    pub const NOTE_ON: u8 = 0x90;
    pub const CONTROL: u8 = 0xB0;
    pub const CTL_ALL_NOTES_OFF: u8 = 123;

    pub fn status(msg: &[u8]) -> Option<u8> {
        msg.first().map(|b| b & 0xF0)
    }

    pub fn note_to_freq(note: u8) -> f32 {
        440.0 * ((note as f32 - 69.0) / 12.0).exp2()
    }
}
