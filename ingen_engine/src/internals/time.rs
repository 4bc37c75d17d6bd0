//! Transport time emitter.
//!
//! Publishes one position event per cycle on an atom sequence output so
//! plugins and clients can follow the engine's frame clock.

use ingen_core::CoreUrids;

use crate::block::Ports;
use crate::run_context::RunContext;

const NOTIFY: usize = 0;

/// Wire layout of a position event body: frame time then speed.
pub const POSITION_BODY_SIZE: usize = 12;

pub fn encode_position(frame: u64, speed: f32) -> [u8; POSITION_BODY_SIZE] {
    let mut body = [0u8; POSITION_BODY_SIZE];
    body[..8].copy_from_slice(&frame.to_le_bytes());
    body[8..].copy_from_slice(&speed.to_le_bytes());
    body
}

pub fn decode_position(body: &[u8]) -> Option<(u64, f32)> {
    if body.len() < POSITION_BODY_SIZE {
        return None;
    }
    let frame = u64::from_le_bytes(body[..8].try_into().ok()?);
    let speed = f32::from_le_bytes(body[8..12].try_into().ok()?);
    Some((frame, speed))
}

pub struct TimeState {
    urids: CoreUrids,
    speed: f32,
}

impl TimeState {
    pub fn new(urids: CoreUrids) -> Self {
        Self { urids, speed: 1.0 }
    }

    pub fn run(&mut self, ports: &mut Ports, ctx: &RunContext) {
        // Emit at most one position event per cycle, at the first sub-range.
        if ctx.offset != 0 {
            return;
        }
        let port = ports.at_mut(NOTIFY);
        for voice in port.voices().iter() {
            // Safety: this block is the unique writer of its output voices.
            let buf = unsafe { voice.buffer.get_mut() };
            if let Some(seq) = buf.sequence_data_mut() {
                seq.append(
                    0,
                    self.urids.time_position,
                    &encode_position(ctx.start, self.speed),
                );
            }
        }
    }
}
