//! Ports: the input and output boundaries of blocks.
//!
//! A port owns one buffer handle per voice. Each handle either points to an
//! exclusively owned buffer or joins another port's buffer (zero-copy
//! pass-through). Which of the two a voice gets is decided on the
//! pre-process thread by [`Port::prepare_voices`]; the audio thread installs
//! the prepared array at a cycle boundary and mixes multi-source inputs in
//! [`Port::pre_run`].

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use ingen_core::{Atom, Direction, Path, PortType, Properties, Status, Symbol, Urid};
use smallvec::SmallVec;

use crate::buffer::BufferRef;
use crate::buffer_factory::BufferFactory;
use crate::run_context::RunContext;

/// Where a voice's buffer comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoiceSource {
    /// The buffer belongs to this port and is written by it.
    Owned,
    /// The buffer is another port's; this voice only reads it.
    Joined,
}

/// One voice slot: a buffer handle and how it was obtained.
pub struct Voice {
    pub buffer: BufferRef,
    pub source: VoiceSource,
}

/// A port's voice array, indexed `[0, polyphony)`.
pub type Voices = Box<[Voice]>;

/// Lock-free mailbox for control-value monitoring.
///
/// The audio thread stores the latest value and raises `changed`; the
/// post-process worker drains it at a bounded rate.
#[derive(Debug, Default)]
pub struct PortMonitor {
    bits: AtomicU32,
    changed: AtomicBool,
}

impl PortMonitor {
    /// Audio thread: record `value` if it differs from the last recorded one.
    pub fn record(&self, value: f32) {
        let bits = value.to_bits();
        if self.bits.swap(bits, Ordering::Relaxed) != bits {
            self.changed.store(true, Ordering::Release);
        }
    }

    /// Non-real-time: the changed value, if any, clearing the flag.
    pub fn take_change(&self) -> Option<f32> {
        if self.changed.swap(false, Ordering::Acquire) {
            Some(f32::from_bits(self.bits.load(Ordering::Relaxed)))
        } else {
            None
        }
    }
}

pub struct Port {
    path: Path,
    symbol: Symbol,
    index: u32,
    ty: PortType,
    direction: Direction,
    /// Body type for ATOM sequence events this port understands.
    buffer_type: Option<Urid>,
    pub properties: Properties,
    /// Client-visible current value (pre-process view).
    pub value: Atom,
    pub min: Atom,
    pub max: Atom,
    poly: u32,
    voices: Voices,
    /// Tails feeding this port, installed together with `voices`.
    ///
    /// Audio-thread read path for mixing. The pointed-to ports stay alive
    /// because blocks are only disposed after the compiled graph that
    /// referenced them is gone, and arcs are removed before endpoints.
    sources: SmallVec<[*const Port; 2]>,
    monitored: bool,
    pub monitor: PortMonitor,
}

// Safety: the raw source pointers are owned by blocks kept alive for as long
// as any compiled graph or arc refers to them; see `sources`.
unsafe impl Send for Port {}
unsafe impl Sync for Port {}

impl Port {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        path: Path,
        index: u32,
        ty: PortType,
        direction: Direction,
        buffer_type: Option<Urid>,
        value: Atom,
        factory: &mut BufferFactory,
    ) -> Result<Self, Status> {
        let symbol = path.symbol().ok_or(Status::BadUri)?;
        let mut port = Self {
            path,
            symbol,
            index,
            ty,
            direction,
            buffer_type,
            properties: Properties::new(),
            value,
            min: Atom::Float(0.0),
            max: Atom::Float(1.0),
            poly: 1,
            voices: Box::new([]),
            sources: SmallVec::new(),
            monitored: false,
            monitor: PortMonitor::default(),
        };
        let voices = port.prepare_voices(factory, 1, &[])?;
        port.voices = voices;
        port.apply_default_value();
        Ok(port)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }
    pub fn index(&self) -> u32 {
        self.index
    }
    pub fn port_type(&self) -> PortType {
        self.ty
    }
    pub fn direction(&self) -> Direction {
        self.direction
    }
    pub fn buffer_type(&self) -> Option<Urid> {
        self.buffer_type
    }
    pub fn poly(&self) -> u32 {
        self.poly
    }
    pub fn voices(&self) -> &Voices {
        &self.voices
    }
    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }
    pub fn is_monitored(&self) -> bool {
        self.monitored
    }
    pub fn set_monitored(&mut self, monitored: bool) {
        self.monitored = monitored;
    }

    /// Set by the containing block when moved or renamed.
    pub(crate) fn set_path(&mut self, path: Path) {
        if let Some(symbol) = path.symbol() {
            self.symbol = symbol;
        }
        self.path = path;
    }

    /// Toggled ports snap to 0/1 (property derived).
    pub fn is_toggled(&self) -> bool {
        matches!(self.value, Atom::Bool(_))
    }

    /// Write the port's default value into its owned voices. Pre-process
    /// thread, before the port is audio-visible.
    fn apply_default_value(&mut self) {
        if let Some(v) = self.value.to_float() {
            for voice in self.voices.iter() {
                if voice.source == VoiceSource::Owned {
                    // Safety: the port is not yet (or no longer) reachable
                    // from the audio thread when defaults are applied.
                    unsafe { voice.buffer.get_mut() }.set_value(0, v);
                }
            }
        }
    }

    /// Write this port's current value into the owned voices of a prepared
    /// array. Pre-process thread; the array is not yet audio-visible.
    pub fn fill_prepared(&self, voices: &mut Voices) {
        if let Some(v) = self.value.to_float() {
            for voice in voices.iter() {
                if voice.source == VoiceSource::Owned {
                    // Safety: prepared voices have no other accessor yet.
                    unsafe { voice.buffer.get_mut() }.set_value(0, v);
                }
            }
        }
    }

    /// Build a replacement voice array on the pre-process thread.
    ///
    /// `sources` are the tails of all incoming arcs (empty for output
    /// ports). The zero-copy rule: a single source with matching polyphony
    /// is joined voice-for-voice; a single mono source fans out by joining
    /// every voice to its one buffer; anything else gets owned buffers that
    /// [`Port::pre_run`] mixes into.
    pub fn prepare_voices(
        &self,
        factory: &mut BufferFactory,
        poly: u32,
        sources: &[*const Port],
    ) -> Result<Voices, Status> {
        let mut voices = Vec::with_capacity(poly as usize);
        let join_plan: Option<JoinPlan> = if self.direction.is_output() {
            None
        } else if sources.is_empty() {
            // Unconnected audio inputs read the shared silent buffer;
            // control-ish types own their storage so values can be set.
            if self.ty == PortType::Audio {
                Some(JoinPlan::Silent)
            } else {
                None
            }
        } else if sources.len() == 1 {
            // Safety: sources are live ports owned by blocks in the same
            // graph, accessed under the pre-process structure lock.
            let tail = unsafe { &**sources.first().expect("len checked") };
            if tail.poly == poly {
                Some(JoinPlan::VoiceForVoice)
            } else if tail.poly == 1 {
                Some(JoinPlan::FanOut)
            } else {
                None
            }
        } else {
            None
        };

        for i in 0..poly {
            let voice = match join_plan {
                Some(JoinPlan::Silent) => Voice {
                    buffer: factory.silent_buffer(),
                    source: VoiceSource::Joined,
                },
                Some(JoinPlan::VoiceForVoice) => {
                    let tail = unsafe { &**sources.first().expect("len checked") };
                    Voice {
                        buffer: tail.voices[i as usize].buffer.clone(),
                        source: VoiceSource::Joined,
                    }
                }
                Some(JoinPlan::FanOut) => {
                    let tail = unsafe { &**sources.first().expect("len checked") };
                    Voice {
                        buffer: tail.voices[0].buffer.clone(),
                        source: VoiceSource::Joined,
                    }
                }
                None => Voice {
                    buffer: factory.get(self.ty, self.buffer_type)?,
                    source: VoiceSource::Owned,
                },
            };
            voices.push(voice);
        }
        Ok(voices.into_boxed_slice())
    }

    /// Build a replacement voice array of owned buffers only, with no join
    /// analysis. Used by polyphony changes, where every port of the graph is
    /// replaced at once and join targets are in flux; zero-copy joins
    /// re-form on the next rewire of each head.
    pub fn prepare_voices_owned(
        &self,
        factory: &mut BufferFactory,
        poly: u32,
    ) -> Result<Voices, Status> {
        let mut voices = Vec::with_capacity(poly as usize);
        for _ in 0..poly {
            voices.push(Voice {
                buffer: factory.get(self.ty, self.buffer_type)?,
                source: VoiceSource::Owned,
            });
        }
        let mut voices = voices.into_boxed_slice();
        self.fill_prepared(&mut voices);
        Ok(voices)
    }

    /// Install a prepared voice array and source list. Audio thread, cycle
    /// boundary. Returns the replaced voices for post-process disposal.
    pub fn connect_buffers(
        &mut self,
        voices: Voices,
        sources: SmallVec<[*const Port; 2]>,
    ) -> Voices {
        self.poly = voices.len() as u32;
        self.sources = sources;
        core::mem::replace(&mut self.voices, voices)
    }

    /// Start-of-cycle preparation: output ports clear their owned voices so
    /// `run` accumulates into clean storage. Joined voices are left alone.
    pub fn prepare_buffers(&mut self, ctx: &RunContext) {
        if self.direction.is_input() {
            return;
        }
        for voice in self.voices.iter() {
            if voice.source != VoiceSource::Owned {
                continue;
            }
            // Safety: this port is the unique writer of its owned voices.
            let buf = unsafe { voice.buffer.get_mut() };
            match self.ty {
                // Control outputs hold their value across cycles.
                PortType::Control => {}
                _ => buf.clear(ctx),
            }
        }
    }

    /// Mix incoming arcs into owned voices. Input-direction ports (and graph
    /// output ports collecting from inside) with joined voices skip this.
    pub fn pre_run(&mut self, ctx: &RunContext) {
        if self.sources.is_empty() {
            return;
        }
        if self
            .voices
            .first()
            .is_none_or(|v| v.source == VoiceSource::Joined)
        {
            return;
        }
        let poly = self.poly;
        for (i, voice) in self.voices.iter().enumerate() {
            // Safety: owned voice, unique writer.
            let dst = unsafe { voice.buffer.get_mut() };
            dst.clear(ctx);
            for &source in &self.sources {
                // Safety: see `sources` field invariant.
                let tail = unsafe { &*source };
                let tail_poly = tail.poly as usize;
                if tail_poly == poly as usize {
                    let src = unsafe { tail.voices[i].buffer.get() };
                    match self.ty {
                        PortType::Atom => Self::merge_sequence(dst, src),
                        _ => dst.accumulate(ctx, src, 1.0),
                    }
                } else if tail_poly == 1 {
                    let src = unsafe { tail.voices[0].buffer.get() };
                    match self.ty {
                        PortType::Atom => Self::merge_sequence(dst, src),
                        _ => dst.accumulate(ctx, src, 1.0),
                    }
                } else {
                    // poly -> mono fan-in: average the source voices.
                    let scale = 1.0 / tail_poly as f32;
                    for tail_voice in tail.voices.iter() {
                        let src = unsafe { tail_voice.buffer.get() };
                        dst.accumulate(ctx, src, scale);
                    }
                }
            }
        }
        if self.monitored && self.ty.is_control() {
            self.monitor.record(self.current_value(ctx));
        }
    }

    fn merge_sequence(dst: &mut crate::buffer::Buffer, src: &crate::buffer::Buffer) {
        let (Some(dst_seq), Some(src_seq)) = (dst.sequence_data_mut(), src.sequence_data())
        else {
            return;
        };
        for (ev, body) in src_seq.iter() {
            dst_seq.append(ev.frame, ev.type_urid, body);
        }
    }

    /// Write a control value into one voice at `offset`. Audio thread.
    pub fn set_voice_value(&mut self, voice: usize, offset: u32, value: f32) {
        if let Some(v) = self.voices.get(voice) {
            if v.source == VoiceSource::Owned {
                // Safety: owned voice, unique writer.
                unsafe { v.buffer.get_mut() }.set_value(offset, value);
            }
        }
        if self.monitored && voice == 0 {
            self.monitor.record(value);
        }
    }

    /// Write a control value into every voice at `offset`. Audio thread;
    /// CONTROL and CV ports only.
    pub fn set_control_value(&mut self, _ctx: &RunContext, offset: u32, value: f32) {
        for voice in self.voices.iter() {
            if voice.source == VoiceSource::Owned {
                // Safety: owned voice, unique writer.
                unsafe { voice.buffer.get_mut() }.set_value(offset, value);
            }
        }
        if self.monitored {
            self.monitor.record(value);
        }
    }

    /// The port's value at the end of the active range, voice 0.
    pub fn current_value(&self, ctx: &RunContext) -> f32 {
        let Some(voice) = self.voices.first() else {
            return 0.0;
        };
        // Safety: read-only access of a live buffer on the audio thread.
        let buf = unsafe { voice.buffer.get() };
        buf.value_at(ctx.sub_end.saturating_sub(1))
    }

    /// Record the current value for monitoring. Audio thread, end of cycle.
    pub fn monitor_cycle(&self, ctx: &RunContext) {
        if self.monitored {
            self.monitor.record(self.current_value(ctx));
        }
    }
}

#[derive(Clone, Copy)]
enum JoinPlan {
    Silent,
    VoiceForVoice,
    FanOut,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_factory::DEFAULT_SEQ_CAPACITY;
    use crate::run_context::RunState;

    fn factory() -> BufferFactory {
        BufferFactory::new(8, DEFAULT_SEQ_CAPACITY)
    }
    fn ctx() -> RunContext {
        RunContext::new(RunState::new(), 8)
    }
    fn port(
        f: &mut BufferFactory,
        path: &str,
        ty: PortType,
        dir: Direction,
    ) -> Port {
        Port::new(
            ingen_core::Path::parse(path).unwrap(),
            0,
            ty,
            dir,
            None,
            Atom::Float(0.0),
            f,
        )
        .unwrap()
    }

    #[test]
    fn single_source_joins_zero_copy() {
        let mut f = factory();
        let out = port(&mut f, "/a/out", PortType::Audio, Direction::Output);
        let mut inp = port(&mut f, "/b/in", PortType::Audio, Direction::Input);
        let sources: SmallVec<[*const Port; 2]> = smallvec::smallvec![&out as *const Port];
        let voices = inp.prepare_voices(&mut f, 1, &sources).unwrap();
        inp.connect_buffers(voices, sources);
        assert!(inp.voices()[0].buffer.ptr_eq(&out.voices()[0].buffer));
        assert_eq!(inp.voices()[0].source, VoiceSource::Joined);
    }

    #[test]
    fn two_sources_mix_into_owned() {
        let mut f = factory();
        let ctx = ctx();
        let mut a = port(&mut f, "/a/out", PortType::Audio, Direction::Output);
        let mut b = port(&mut f, "/b/out", PortType::Audio, Direction::Output);
        a.set_control_value(&ctx, 0, 0.25);
        b.set_control_value(&ctx, 0, 0.5);
        let mut inp = port(&mut f, "/c/in", PortType::Audio, Direction::Input);
        let sources: SmallVec<[*const Port; 2]> =
            smallvec::smallvec![&a as *const Port, &b as *const Port];
        let voices = inp.prepare_voices(&mut f, 1, &sources).unwrap();
        inp.connect_buffers(voices, sources);
        assert_eq!(inp.voices()[0].source, VoiceSource::Owned);
        inp.pre_run(&ctx);
        assert_eq!(inp.current_value(&ctx), 0.75);
    }

    #[test]
    fn poly_to_mono_averages() {
        let mut f = factory();
        let ctx = ctx();
        let mut out = port(&mut f, "/p/out", PortType::Audio, Direction::Output);
        let voices = out.prepare_voices(&mut f, 4, &[]).unwrap();
        out.connect_buffers(voices, SmallVec::new());
        out.set_control_value(&ctx, 0, 0.8);
        let mut inp = port(&mut f, "/m/in", PortType::Audio, Direction::Input);
        let sources: SmallVec<[*const Port; 2]> = smallvec::smallvec![&out as *const Port];
        let voices = inp.prepare_voices(&mut f, 1, &sources).unwrap();
        inp.connect_buffers(voices, sources);
        inp.pre_run(&ctx);
        let got = inp.current_value(&ctx);
        assert!((got - 0.8).abs() < 1e-6);
    }

    #[test]
    fn mono_to_poly_fans_out_by_join() {
        let mut f = factory();
        let out = port(&mut f, "/s/out", PortType::Audio, Direction::Output);
        let mut inp = port(&mut f, "/p/in", PortType::Audio, Direction::Input);
        let sources: SmallVec<[*const Port; 2]> = smallvec::smallvec![&out as *const Port];
        let voices = inp.prepare_voices(&mut f, 4, &sources).unwrap();
        inp.connect_buffers(voices, sources);
        for v in inp.voices().iter() {
            assert!(v.buffer.ptr_eq(&out.voices()[0].buffer));
        }
        // 1 factory registry + 1 owner voice + 4 joined voices
        assert_eq!(out.voices()[0].buffer.strong_count(), 6);
    }

    #[test]
    fn unconnected_audio_input_reads_silence() {
        let mut f = factory();
        let inp = port(&mut f, "/b/in", PortType::Audio, Direction::Input);
        assert!(inp.voices()[0].buffer.ptr_eq(&f.silent_buffer()));
    }

    #[test]
    fn monitor_reports_changes_once() {
        let mut f = factory();
        let ctx = ctx();
        let mut p = port(&mut f, "/b/gain", PortType::Control, Direction::Input);
        p.set_monitored(true);
        p.set_control_value(&ctx, 0, 0.4);
        assert_eq!(p.monitor.take_change(), Some(0.4));
        assert_eq!(p.monitor.take_change(), None);
        p.set_control_value(&ctx, 0, 0.4);
        assert_eq!(p.monitor.take_change(), None);
    }
}
