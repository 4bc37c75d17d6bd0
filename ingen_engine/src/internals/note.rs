//! Polyphonic MIDI note tracking.
//!
//! Allocates incoming notes to voices (free first, then steal the oldest)
//! and drives per-voice frequency, velocity, gate and trigger outputs.

use ingen_core::CoreUrids;

use crate::block::Ports;
use crate::internals::midi;
use crate::run_context::RunContext;

const INPUT: usize = 0;
const FREQUENCY: usize = 1;
const VELOCITY: usize = 2;
const GATE: usize = 3;
const TRIGGER: usize = 4;

const SUSTAIN_CC: u8 = 64;

#[derive(Clone, Copy, Debug, PartialEq)]
enum VoiceState {
    Free,
    Active { note: u8 },
    /// Note released while sustain is held.
    Holding { note: u8 },
}

#[derive(Clone, Copy)]
struct NoteVoice {
    state: VoiceState,
    /// Allocation time for oldest-voice stealing.
    time: u64,
    freq: f32,
    vel: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum KeyState {
    Off,
    /// Held and owning a voice.
    OnAssigned { voice: usize },
    /// Held, but its voice was stolen.
    OnUnassigned,
}

pub struct NoteState {
    urids: CoreUrids,
    voices: Vec<NoteVoice>,
    keys: [KeyState; 128],
    sustain: bool,
}

impl NoteState {
    pub fn new(poly: u32, urids: CoreUrids) -> Self {
        Self {
            urids,
            voices: vec![
                NoteVoice {
                    state: VoiceState::Free,
                    time: 0,
                    freq: 0.0,
                    vel: 0.0,
                };
                poly.max(1) as usize
            ],
            keys: [KeyState::Off; 128],
            sustain: false,
        }
    }

    pub fn run(&mut self, ports: &mut Ports, ctx: &RunContext) {
        // The outputs were cleared at cycle start; rewrite held voice state
        // before applying this cycle's events.
        let num_out_voices = ports.at(GATE).poly() as usize;
        for v in 0..self.voices.len().min(num_out_voices) {
            let voice = self.voices[v];
            let gate = match voice.state {
                VoiceState::Free => 0.0,
                VoiceState::Active { .. } | VoiceState::Holding { .. } => 1.0,
            };
            ports
                .at_mut(FREQUENCY)
                .set_voice_value(v, ctx.offset, voice.freq);
            ports
                .at_mut(VELOCITY)
                .set_voice_value(v, ctx.offset, voice.vel);
            ports.at_mut(GATE).set_voice_value(v, ctx.offset, gate);
        }

        let midi = ports.at(INPUT).voices()[0].buffer.clone();
        // Safety: the input buffer's writers ran before this task.
        let Some(seq) = unsafe { midi.get() }.sequence_data() else {
            return;
        };
        // The events are iterated from a cloned handle, so `ports` can be
        // written while walking them.
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
                Some(midi::NOTE_ON) if body[2] > 0 => {
                    self.note_on(ports, ctx, body[1], body[2], frame);
                }
                Some(midi::NOTE_ON) | Some(midi::NOTE_OFF) => {
                    self.note_off(ports, ctx, body[1], frame);
                }
                Some(midi::CONTROL) => match body[1] {
                    midi::CTL_ALL_NOTES_OFF => self.all_notes_off(ports, ctx, frame),
                    SUSTAIN_CC => {
                        if body[2] > 63 {
                            self.sustain = true;
                        } else {
                            self.sustain_off(ports, ctx, frame);
                        }
                    }
                    _ => {}
                },
                _ => {}
            }
        }
    }

    fn note_on(&mut self, ports: &mut Ports, ctx: &RunContext, note: u8, velocity: u8, frame: u32) {
        let time = ctx.start + frame as u64;
        let num_voices = self.voices.len();
        // Free voice first, oldest otherwise.
        let voice_num = (0..num_voices)
            .find(|&i| self.voices[i].state == VoiceState::Free)
            .unwrap_or_else(|| {
                (0..num_voices)
                    .min_by_key(|&i| self.voices[i].time)
                    .expect("poly is at least 1")
            });

        // A stolen voice leaves its key held but unassigned.
        if let VoiceState::Active { note: old } | VoiceState::Holding { note: old } =
            self.voices[voice_num].state
        {
            if self.keys[old as usize] == (KeyState::OnAssigned { voice: voice_num }) {
                self.keys[old as usize] = KeyState::OnUnassigned;
            }
        }

        self.keys[note as usize] = KeyState::OnAssigned { voice: voice_num };
        self.voices[voice_num] = NoteVoice {
            state: VoiceState::Active { note },
            time,
            freq: midi::note_to_freq(note),
            vel: velocity as f32 / 127.0,
        };

        // Keep one frame of room so the trigger pulse can fall back to zero
        // within this cycle.
        let offset = frame.min(ctx.nframes.saturating_sub(2));
        let voice = self.voices[voice_num];
        if voice_num < ports.at(GATE).poly() as usize {
            ports
                .at_mut(FREQUENCY)
                .set_voice_value(voice_num, offset, voice.freq);
            ports
                .at_mut(VELOCITY)
                .set_voice_value(voice_num, offset, voice.vel);
            ports.at_mut(GATE).set_voice_value(voice_num, offset, 1.0);
            ports.at_mut(TRIGGER).set_voice_value(voice_num, offset, 1.0);
            ports
                .at_mut(TRIGGER)
                .set_voice_value(voice_num, offset + 1, 0.0);
        }
    }

    fn note_off(&mut self, ports: &mut Ports, ctx: &RunContext, note: u8, frame: u32) {
        if let KeyState::OnAssigned { voice } = self.keys[note as usize] {
            if self.sustain {
                self.voices[voice].state = VoiceState::Holding { note };
            } else {
                self.free_voice(ports, ctx, voice, frame);
            }
        }
        self.keys[note as usize] = KeyState::Off;
    }

    fn free_voice(&mut self, ports: &mut Ports, ctx: &RunContext, voice: usize, frame: u32) {
        // Reassign the voice to a still-held key that lost its own, so
        // releasing a stolen chord re-sounds it.
        let reassign = self
            .keys
            .iter()
            .position(|k| *k == KeyState::OnUnassigned);
        if let Some(key) = reassign {
            self.keys[key] = KeyState::OnAssigned { voice };
            let time = ctx.start + frame as u64;
            self.voices[voice] = NoteVoice {
                state: VoiceState::Active { note: key as u8 },
                time,
                freq: midi::note_to_freq(key as u8),
                vel: self.voices[voice].vel,
            };
            if voice < ports.at(GATE).poly() as usize {
                ports
                    .at_mut(FREQUENCY)
                    .set_voice_value(voice, frame, self.voices[voice].freq);
            }
        } else {
            self.voices[voice].state = VoiceState::Free;
            if voice < ports.at(GATE).poly() as usize {
                ports.at_mut(GATE).set_voice_value(voice, frame, 0.0);
            }
        }
    }

    fn sustain_off(&mut self, ports: &mut Ports, ctx: &RunContext, frame: u32) {
        self.sustain = false;
        for voice in 0..self.voices.len() {
            if matches!(self.voices[voice].state, VoiceState::Holding { .. }) {
                self.free_voice(ports, ctx, voice, frame);
            }
        }
    }

    fn all_notes_off(&mut self, ports: &mut Ports, ctx: &RunContext, frame: u32) {
        self.sustain = false;
        for voice in 0..self.voices.len() {
            if self.voices[voice].state != VoiceState::Free {
                self.voices[voice].state = VoiceState::Free;
                if voice < ports.at(GATE).poly() as usize {
                    ports.at_mut(GATE).set_voice_value(voice, frame, 0.0);
                }
            }
        }
        self.keys = [KeyState::Off; 128];
    }
}
