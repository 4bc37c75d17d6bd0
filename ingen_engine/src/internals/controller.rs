//! MIDI controller to control value converter.

use ingen_core::CoreUrids;

use crate::block::Ports;
use crate::internals::midi;
use crate::run_context::RunContext;

const INPUT: usize = 0;
const CONTROLLER: usize = 1;
const LOGARITHMIC: usize = 2;
const MINIMUM: usize = 3;
const MAXIMUM: usize = 4;
const OUTPUT: usize = 5;

pub struct ControllerState {
    urids: CoreUrids,
    /// When set, the next controller seen becomes the bound controller
    /// number and learning stops.
    learning: bool,
}

impl ControllerState {
    pub fn new(urids: CoreUrids) -> Self {
        Self {
            urids,
            learning: false,
        }
    }

    pub fn set_learning(&mut self, learning: bool) {
        self.learning = learning;
    }

    pub fn run(&mut self, ports: &mut Ports, ctx: &RunContext) {
        let midi = ports.at(INPUT).voices()[0].buffer.clone();
        // Safety: the MIDI input buffer is only written by this block's
        // upstream port mixing, which completed before this task ran.
        let Some(seq) = unsafe { midi.get() }.sequence_data() else {
            return;
        };
        for (ev, body) in seq.iter() {
            if ev.frame < ctx.offset || ev.frame >= ctx.sub_end {
                continue;
            }
            if ev.type_urid != self.urids.midi_event || body.len() < 3 {
                continue;
            }
            if midi::status(body) == Some(midi::CONTROL) {
                self.control(ports, ctx, body[1], body[2], ev.frame);
            }
        }
    }

    fn control(&mut self, ports: &mut Ports, ctx: &RunContext, num: u8, value: u8, offset: u32) {
        if self.learning {
            ports
                .at_mut(CONTROLLER)
                .set_control_value(ctx, offset, num as f32);
            self.learning = false;
        }
        if (num as f32 - ports.at(CONTROLLER).current_value(ctx)).abs() > 0.5 {
            return;
        }
        let nval = value as f32 / 127.0;
        let min = ports.at(MINIMUM).current_value(ctx);
        let max = ports.at(MAXIMUM).current_value(ctx);
        let scaled = if ports.at(LOGARITHMIC).current_value(ctx) > 0.0 {
            // Offset negative ranges into the positive domain before taking
            // logarithms, then shift back.
            let log_offset = if min < 0.0 { min.abs() } else { 0.0 };
            let lmin = (min + 1.0 + log_offset).ln();
            let lmax = (max + 1.0 + log_offset).ln();
            (nval * (lmax - lmin) + lmin).exp() - 1.0 - log_offset
        } else {
            nval * (max - min) + min
        };
        ports.at_mut(OUTPUT).set_control_value(ctx, offset, scaled);
    }
}
