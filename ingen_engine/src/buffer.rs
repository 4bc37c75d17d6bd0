//! Typed storage attached to port voices.
//!
//! A [`Buffer`] is one cycle's worth of data: a float signal (AUDIO/CV), a
//! single held control value (CONTROL), or a sequence of timestamped atom
//! events (ATOM). Buffers are handed out by the
//! [`BufferFactory`](crate::buffer_factory::BufferFactory) as reference
//! counted [`BufferRef`] handles; cloning a handle is how one port voice
//! joins another's buffer without copying.

use core::cell::UnsafeCell;
use std::sync::Arc;

use ingen_core::{PortType, Urid};

use crate::run_context::RunContext;

/// One event in an ATOM sequence buffer: frame offset within the cycle, the
/// URID of the body type, and the body's extent in the byte arena.
#[derive(Clone, Copy, Debug)]
pub struct SeqEvent {
    pub frame: u32,
    pub type_urid: Urid,
    pub body_offset: u32,
    pub body_size: u32,
}

/// Packed sequence of timestamped events with a fixed-capacity byte arena.
///
/// Appending never reallocates; on overflow the event is dropped whole and
/// the `truncated` flag plus the dropped counter record it for post-process
/// notifications.
#[derive(Debug)]
pub struct SeqBuffer {
    events: Vec<SeqEvent>,
    bytes: Vec<u8>,
    capacity_bytes: usize,
    truncated: bool,
    dropped: u32,
}

impl SeqBuffer {
    pub fn with_capacity(capacity_bytes: usize) -> Self {
        Self {
            events: Vec::with_capacity((capacity_bytes / 16).max(8)),
            bytes: Vec::with_capacity(capacity_bytes),
            capacity_bytes,
            truncated: false,
            dropped: 0,
        }
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.bytes.clear();
        self.truncated = false;
        self.dropped = 0;
    }

    /// Append an event. Returns false (and records the drop) if the byte
    /// arena or the event table would overflow; nothing is partially written.
    pub fn append(&mut self, frame: u32, type_urid: Urid, body: &[u8]) -> bool {
        if self.bytes.len() + body.len() > self.capacity_bytes
            || self.events.len() == self.events.capacity()
        {
            self.truncated = true;
            self.dropped += 1;
            return false;
        }
        let body_offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(body);
        self.events.push(SeqEvent {
            frame,
            type_urid,
            body_offset,
            body_size: body.len() as u32,
        });
        true
    }

    pub fn events(&self) -> &[SeqEvent] {
        &self.events
    }

    pub fn body(&self, ev: &SeqEvent) -> &[u8] {
        &self.bytes[ev.body_offset as usize..(ev.body_offset + ev.body_size) as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SeqEvent, &[u8])> {
        self.events.iter().map(|e| (e, self.body(e)))
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    /// Copy another sequence's events into this one, truncating at capacity.
    fn copy_from(&mut self, src: &SeqBuffer) {
        self.clear();
        for (ev, body) in src.iter() {
            self.append(ev.frame, ev.type_urid, body);
        }
    }
}

/// The typed payload of a [`Buffer`].
#[derive(Debug)]
pub enum BufferData {
    /// One float per frame. Used by AUDIO and CV ports.
    Signal(Box<[f32]>),
    /// A single held value and the frame offset it was last set at, for
    /// control-rate linearization.
    Control { value: f32, last_set: u32 },
    /// Timestamped event sequence for ATOM ports.
    Sequence(SeqBuffer),
}

/// One typed storage region.
pub struct Buffer {
    ty: PortType,
    value_type: Option<Urid>,
    data: BufferData,
}

impl Buffer {
    pub fn signal(ty: PortType, nframes: usize) -> Self {
        debug_assert!(ty.is_signal());
        Self {
            ty,
            value_type: None,
            data: BufferData::Signal(vec![0.0; nframes].into_boxed_slice()),
        }
    }

    pub fn control(value: f32) -> Self {
        Self {
            ty: PortType::Control,
            value_type: None,
            data: BufferData::Control {
                value,
                last_set: 0,
            },
        }
    }

    pub fn sequence(capacity_bytes: usize, value_type: Option<Urid>) -> Self {
        Self {
            ty: PortType::Atom,
            value_type,
            data: BufferData::Sequence(SeqBuffer::with_capacity(capacity_bytes)),
        }
    }

    pub fn port_type(&self) -> PortType {
        self.ty
    }

    pub fn value_type(&self) -> Option<Urid> {
        self.value_type
    }

    pub fn samples(&self) -> Option<&[f32]> {
        match &self.data {
            BufferData::Signal(s) => Some(s),
            _ => None,
        }
    }

    pub fn samples_mut(&mut self) -> Option<&mut [f32]> {
        match &mut self.data {
            BufferData::Signal(s) => Some(s),
            _ => None,
        }
    }

    pub fn sequence_data(&self) -> Option<&SeqBuffer> {
        match &self.data {
            BufferData::Sequence(s) => Some(s),
            _ => None,
        }
    }

    pub fn sequence_data_mut(&mut self) -> Option<&mut SeqBuffer> {
        match &mut self.data {
            BufferData::Sequence(s) => Some(s),
            _ => None,
        }
    }

    /// The value at `offset`: the held value for CONTROL (offset ignored),
    /// `data[offset]` for signals.
    pub fn value_at(&self, offset: u32) -> f32 {
        match &self.data {
            BufferData::Signal(s) => s.get(offset as usize).copied().unwrap_or(0.0),
            BufferData::Control { value, .. } => *value,
            BufferData::Sequence(_) => 0.0,
        }
    }

    /// Fill with the type's zero value over the active range.
    pub fn clear(&mut self, ctx: &RunContext) {
        match &mut self.data {
            BufferData::Signal(s) => {
                let end = (ctx.sub_end as usize).min(s.len());
                for v in &mut s[ctx.offset as usize..end] {
                    *v = 0.0;
                }
            }
            BufferData::Control { value, last_set } => {
                *value = 0.0;
                *last_set = ctx.offset;
            }
            BufferData::Sequence(s) => s.clear(),
        }
    }

    /// Overwrite this buffer with `src` over the active range.
    ///
    /// Mismatched types broadcast or sample: CONTROL into a signal fills the
    /// range with the held value; a signal into CONTROL takes
    /// `data[sub_end - 1]`.
    pub fn copy(&mut self, ctx: &RunContext, src: &Buffer) {
        let range = ctx.offset as usize..ctx.sub_end as usize;
        match (&mut self.data, &src.data) {
            (BufferData::Signal(dst), BufferData::Signal(s)) => {
                let end = range.end.min(dst.len()).min(s.len());
                dst[range.start..end].copy_from_slice(&s[range.start..end]);
            }
            (BufferData::Signal(dst), BufferData::Control { value, .. }) => {
                let end = range.end.min(dst.len());
                for v in &mut dst[range.start..end] {
                    *v = *value;
                }
            }
            (BufferData::Control { value, last_set }, BufferData::Signal(s)) => {
                if ctx.sub_end > 0 {
                    *value = s[(ctx.sub_end as usize - 1).min(s.len() - 1)];
                    *last_set = ctx.offset;
                }
            }
            (
                BufferData::Control { value, last_set },
                BufferData::Control { value: sv, .. },
            ) => {
                *value = *sv;
                *last_set = ctx.offset;
            }
            (BufferData::Sequence(dst), BufferData::Sequence(s)) => {
                dst.copy_from(s);
            }
            _ => {
                // ATOM and float types never mix; arc type checks refuse it.
                ctx.flag_error();
            }
        }
    }

    /// Sum `src` into this buffer over the active range, with `scale` applied
    /// to the source contribution. Signals only.
    pub fn accumulate(&mut self, ctx: &RunContext, src: &Buffer, scale: f32) {
        let range = ctx.offset as usize..ctx.sub_end as usize;
        match (&mut self.data, &src.data) {
            (BufferData::Signal(dst), BufferData::Signal(s)) => {
                let end = range.end.min(dst.len()).min(s.len());
                for i in range.start..end {
                    dst[i] += s[i] * scale;
                }
            }
            (BufferData::Signal(dst), BufferData::Control { value, .. }) => {
                let end = range.end.min(dst.len());
                for v in &mut dst[range.start..end] {
                    *v += *value * scale;
                }
            }
            (BufferData::Control { value, .. }, src_data) => {
                let sv = match src_data {
                    BufferData::Control { value: sv, .. } => *sv,
                    BufferData::Signal(s) if ctx.sub_end > 0 => {
                        s[(ctx.sub_end as usize - 1).min(s.len() - 1)]
                    }
                    _ => 0.0,
                };
                *value += sv * scale;
            }
            _ => ctx.flag_error(),
        }
    }

    /// Multiply in place over the active range.
    pub fn scale(&mut self, ctx: &RunContext, factor: f32) {
        match &mut self.data {
            BufferData::Signal(s) => {
                let end = (ctx.sub_end as usize).min(s.len());
                for v in &mut s[ctx.offset as usize..end] {
                    *v *= factor;
                }
            }
            BufferData::Control { value, .. } => *value *= factor,
            BufferData::Sequence(_) => {}
        }
    }

    /// Write a control value at `offset`. CONTROL and CV only.
    pub fn set_value(&mut self, offset: u32, new_value: f32) {
        match &mut self.data {
            BufferData::Control { value, last_set } => {
                *value = new_value;
                *last_set = offset;
            }
            BufferData::Signal(s) => {
                let start = (offset as usize).min(s.len());
                for v in &mut s[start..] {
                    *v = new_value;
                }
            }
            BufferData::Sequence(_) => {}
        }
    }

    /// Raw float storage for plugin port connection: the sample array for
    /// signals, the held value for CONTROL, null for sequences.
    pub fn float_ptr(&mut self) -> *mut f32 {
        match &mut self.data {
            BufferData::Signal(s) => s.as_mut_ptr(),
            BufferData::Control { value, .. } => value as *mut f32,
            BufferData::Sequence(_) => core::ptr::null_mut(),
        }
    }

    /// Resize backing storage for a new cycle length. Pre-process thread
    /// only, during a driver buffer-size rendezvous.
    pub fn resize(&mut self, nframes: usize) {
        if let BufferData::Signal(s) = &mut self.data {
            if s.len() != nframes {
                self.data = BufferData::Signal(vec![0.0; nframes].into_boxed_slice());
            }
        }
    }
}

/// Shared interior cell for a buffer.
///
/// # Safety
///
/// The engine's thread discipline guarantees exclusive access at every
/// mutation site: the audio thread is the only writer of live buffer
/// contents, and within one cycle each buffer is written by exactly one task
/// (the compiled graph runs every block once, and joined voices never
/// write). The pre-process thread only touches buffers that are not yet, or
/// no longer, reachable from the live compiled graph.
struct BufferCell(UnsafeCell<Buffer>);

unsafe impl Send for BufferCell {}
unsafe impl Sync for BufferCell {}

/// Reference-counted handle to a [`Buffer`]. Clone to join.
#[derive(Clone)]
pub struct BufferRef(Arc<BufferCell>);

impl BufferRef {
    pub fn new(buffer: Buffer) -> Self {
        Self(Arc::new(BufferCell(UnsafeCell::new(buffer))))
    }

    /// True if both handles point at the same storage (joined voices).
    pub fn ptr_eq(&self, other: &BufferRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Number of live handles, counting the factory's registry entry.
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Borrow the buffer immutably.
    ///
    /// # Safety
    ///
    /// No `&mut Buffer` to the same storage may exist for the duration of
    /// the borrow. See [`BufferCell`] for the thread discipline that
    /// provides this.
    pub unsafe fn get(&self) -> &Buffer {
        unsafe { &*self.0.0.get() }
    }

    /// Borrow the buffer mutably.
    ///
    /// # Safety
    ///
    /// The caller must be the buffer's unique accessor for the duration of
    /// the borrow. See [`BufferCell`].
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut Buffer {
        unsafe { &mut *self.0.0.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_context::RunState;

    fn ctx(nframes: u32) -> RunContext {
        RunContext::new(RunState::new(), nframes)
    }

    #[test]
    fn control_to_audio_broadcast() {
        let ctx = ctx(8);
        let mut audio = Buffer::signal(PortType::Audio, 8);
        let control = Buffer::control(0.5);
        audio.copy(&ctx, &control);
        assert_eq!(audio.samples().unwrap(), &[0.5; 8]);
    }

    #[test]
    fn audio_to_control_samples_last_frame() {
        let ctx = ctx(4);
        let mut audio = Buffer::signal(PortType::Audio, 4);
        audio.samples_mut().unwrap().copy_from_slice(&[0.1, 0.2, 0.3, 0.4]);
        let mut control = Buffer::control(0.0);
        control.copy(&ctx, &audio);
        assert_eq!(control.value_at(0), 0.4);
    }

    #[test]
    fn accumulate_scales_source() {
        let ctx = ctx(4);
        let mut dst = Buffer::signal(PortType::Audio, 4);
        let mut src = Buffer::signal(PortType::Audio, 4);
        src.samples_mut().unwrap().fill(2.0);
        dst.accumulate(&ctx, &src, 0.25);
        dst.accumulate(&ctx, &src, 0.25);
        assert_eq!(dst.samples().unwrap(), &[1.0; 4]);
    }

    #[test]
    fn sub_range_clear_leaves_rest() {
        let mut ctx = ctx(8);
        let mut buf = Buffer::signal(PortType::Audio, 8);
        buf.samples_mut().unwrap().fill(1.0);
        ctx.set_sub_range(2, 5);
        buf.clear(&ctx);
        let s = buf.samples().unwrap();
        assert_eq!(&s[..2], &[1.0, 1.0]);
        assert_eq!(&s[2..5], &[0.0, 0.0, 0.0]);
        assert_eq!(&s[5..], &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn sequence_overflow_drops_whole_events() {
        let urid = Urid(core::num::NonZeroU32::new(7).unwrap());
        let mut seq = SeqBuffer::with_capacity(8);
        assert!(seq.append(0, urid, &[1, 2, 3, 4, 5, 6]));
        assert!(!seq.append(1, urid, &[1, 2, 3, 4]));
        assert!(seq.is_truncated());
        assert_eq!(seq.dropped(), 1);
        assert_eq!(seq.events().len(), 1);
        assert_eq!(seq.body(&seq.events()[0]), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn join_is_reference_equality() {
        let a = BufferRef::new(Buffer::control(1.0));
        let b = a.clone();
        let c = BufferRef::new(Buffer::control(1.0));
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert_eq!(a.strong_count(), 2);
    }
}
