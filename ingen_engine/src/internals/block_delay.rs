//! One-cycle delay.
//!
//! The delay's outgoing arcs are ignored for execution ordering, so its
//! consumers run earlier in the cycle than the delay itself and read the
//! output buffer as it was left by the previous cycle's copy. The run is
//! just input to output; the ordering is what makes it a delay.

use crate::block::Ports;
use crate::run_context::RunContext;

const INPUT: usize = 0;
const OUTPUT: usize = 1;

pub struct BlockDelayState;

impl BlockDelayState {
    pub fn new(_poly: u32, _nframes: usize) -> Self {
        Self
    }

    pub fn run(&mut self, ports: &mut Ports, ctx: &RunContext) {
        let range = ctx.offset as usize..ctx.sub_end as usize;
        let voices = ports.at(OUTPUT).poly().min(ports.at(INPUT).poly()) as usize;
        for v in 0..voices {
            let out_ref = ports.at(OUTPUT).voices()[v].buffer.clone();
            let in_ref = &ports.at(INPUT).voices()[v].buffer;
            // Safety: unique writer of the output voice; the input voice's
            // writer ran earlier this cycle (input arcs are real
            // dependencies, only output arcs are ordering-exempt).
            let out = unsafe { out_ref.get_mut() };
            let inp = unsafe { in_ref.get() };
            if let (Some(out), Some(inp)) = (out.samples_mut(), inp.samples()) {
                out[range.clone()].copy_from_slice(&inp[range.clone()]);
            }
        }
    }
}
