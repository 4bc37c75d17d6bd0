//! Single-note gate/trigger, e.g. for percussion patches.

use ingen_core::CoreUrids;

use crate::block::Ports;
use crate::internals::midi;
use crate::run_context::RunContext;

const INPUT: usize = 0;
const NOTE: usize = 1;
const GATE: usize = 2;
const TRIGGER: usize = 3;
const VELOCITY: usize = 4;

pub struct TriggerState {
    urids: CoreUrids,
    learning: bool,
    gate: f32,
    vel: f32,
}

impl TriggerState {
    pub fn new(urids: CoreUrids) -> Self {
        Self {
            urids,
            learning: false,
            gate: 0.0,
            vel: 0.0,
        }
    }

    pub fn set_learning(&mut self, learning: bool) {
        self.learning = learning;
    }

    pub fn run(&mut self, ports: &mut Ports, ctx: &RunContext) {
        // Outputs were cleared at cycle start; restore held state.
        ports.at_mut(GATE).set_voice_value(0, ctx.offset, self.gate);
        ports
            .at_mut(VELOCITY)
            .set_voice_value(0, ctx.offset, self.vel);

        let midi_buf = ports.at(INPUT).voices()[0].buffer.clone();
        // Safety: writers of the input buffer ran before this task.
        let Some(seq) = unsafe { midi_buf.get() }.sequence_data() else {
            return;
        };
        let events: smallvec::SmallVec<[(u32, [u8; 3]); 16]> = seq
            .iter()
            .filter(|(ev, body)| {
                ev.frame >= ctx.offset
                    && ev.frame < ctx.sub_end
                    && ev.type_urid == self.urids.midi_event
                    && body.len() >= 3
            })
            .map(|(ev, body)| (ev.frame, [body[0], body[1], body[2]]))
            .collect();
        for (frame, body) in events {
            match midi::status(&body) {
                Some(midi::NOTE_ON) if body[2] > 0 => self.note_on(ports, ctx, body[1], body[2], frame),
                Some(midi::NOTE_ON) | Some(midi::NOTE_OFF) => {
                    self.note_off(ports, ctx, body[1], frame)
                }
                Some(midi::CONTROL) if body[1] == midi::CTL_ALL_NOTES_OFF => {
                    self.gate = 0.0;
                    ports.at_mut(GATE).set_voice_value(0, frame, 0.0);
                }
                _ => {}
            }
        }
    }

    fn note_on(&mut self, ports: &mut Ports, ctx: &RunContext, note: u8, velocity: u8, frame: u32) {
        if self.learning {
            ports
                .at_mut(NOTE)
                .set_control_value(ctx, frame, note as f32);
            self.learning = false;
        }
        if (note as f32 - ports.at(NOTE).current_value(ctx)).abs() > 0.5 {
            return;
        }
        self.gate = 1.0;
        self.vel = velocity as f32 / 127.0;
        let offset = frame.min(ctx.nframes.saturating_sub(2));
        ports.at_mut(GATE).set_voice_value(0, offset, 1.0);
        ports.at_mut(VELOCITY).set_voice_value(0, offset, self.vel);
        ports.at_mut(TRIGGER).set_voice_value(0, offset, 1.0);
        ports.at_mut(TRIGGER).set_voice_value(0, offset + 1, 0.0);
    }

    fn note_off(&mut self, ports: &mut Ports, ctx: &RunContext, note: u8, frame: u32) {
        if (note as f32 - ports.at(NOTE).current_value(ctx)).abs() <= 0.5 {
            self.gate = 0.0;
            ports.at_mut(GATE).set_voice_value(0, frame, 0.0);
        }
    }
}
