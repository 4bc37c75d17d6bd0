//! MIDI controller to port-value bindings.
//!
//! Bindings map an incoming Control Change `(channel, controller)` to a
//! control port's value through a linear or logarithmic range. The audio
//! thread performs the mapping when MIDI arrives; the pre-process thread
//! never touches the live list directly. It builds a replacement `Vec` and
//! stages it in a property event, whose execute phase swaps it in at a
//! cycle boundary, and a learn request captures the next controller seen.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

use ingen_core::{Atom, Path};

use crate::buffer::Buffer;
use crate::internals::midi;
use crate::port::Port;
use crate::run_context::RunContext;

/// One installed binding.
#[derive(Clone)]
pub struct Binding {
    pub channel: u8,
    pub controller: u8,
    pub(crate) port: *mut Port,
    pub min: f32,
    pub max: f32,
    pub log: bool,
}

// Safety: bound ports are live for as long as the binding is installed;
// removing a port removes its bindings in the same event.
unsafe impl Send for Binding {}

impl Binding {
    fn value_for(&self, cc_value: u8) -> f32 {
        let nval = cc_value as f32 / 127.0;
        if self.log {
            let log_offset = if self.min < 0.0 { self.min.abs() } else { 0.0 };
            let lmin = (self.min + 1.0 + log_offset).ln();
            let lmax = (self.max + 1.0 + log_offset).ln();
            (nval * (lmax - lmin) + lmin).exp() - 1.0 - log_offset
        } else {
            nval * (self.max - self.min) + self.min
        }
    }
}

/// A controller captured by learn mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LearnedBinding {
    pub channel: u8,
    pub controller: u8,
    pub port_path: Path,
}

/// Shared audio/pre-process binding state.
pub struct ControlBindings {
    /// Live list, read by the audio thread. Replaced only through
    /// [`ControlBindings::swap`] at a cycle boundary.
    bindings: UnsafeCell<Vec<Binding>>,
    /// Learn target installed by pre-process, consumed by the audio thread.
    learn_port: AtomicPtr<Port>,
    /// Captured `(channel << 8) | controller`, the port it was armed for,
    /// and a flag.
    learned: AtomicU32,
    learned_port: AtomicPtr<Port>,
    has_learned: AtomicBool,
}

// Safety: see `bindings`; the swap protocol gives the cell a unique writer.
unsafe impl Send for ControlBindings {}
unsafe impl Sync for ControlBindings {}

impl ControlBindings {
    pub fn new() -> Self {
        Self {
            bindings: UnsafeCell::new(Vec::new()),
            learn_port: AtomicPtr::new(core::ptr::null_mut()),
            learned: AtomicU32::new(0),
            learned_port: AtomicPtr::new(core::ptr::null_mut()),
            has_learned: AtomicBool::new(false),
        }
    }

    /// Copy of the live list. Pre-process thread; the live list only
    /// changes at cycle boundaries, never while this runs.
    pub fn snapshot(&self) -> Vec<Binding> {
        // Safety: pre-process read; the audio thread does not mutate.
        unsafe { &*self.bindings.get() }.clone()
    }

    pub fn num_bindings(&self) -> usize {
        // Safety: as `snapshot`.
        unsafe { &*self.bindings.get() }.len()
    }

    /// Install a replacement list. Audio thread (event execute) only.
    /// Returns the old list for disposal on the post-process side.
    pub(crate) fn swap(&self, new: Vec<Binding>) -> Vec<Binding> {
        // Safety: single writer at a cycle boundary per the event protocol.
        core::mem::replace(unsafe { &mut *self.bindings.get() }, new)
    }

    /// Build the replacement list for a `ingen:#binding` property change.
    /// Pre-process thread.
    ///
    /// The property value is either an Int `(channel << 8) | controller`,
    /// or the String `"learn"` to arm learn mode (which installs nothing
    /// yet). Returns None when no list change is needed.
    pub fn prepare_binding(&self, port: *mut Port, value: &Atom) -> Option<Vec<Binding>> {
        match value {
            Atom::Int(packed) => {
                let channel = ((*packed >> 8) & 0x0F) as u8;
                let controller = (*packed & 0x7F) as u8;
                let mut new = self.snapshot();
                new.retain(|b| !core::ptr::eq(b.port, port));
                // Safety: live port, store mutex held by the caller.
                let port_ref = unsafe { &*port };
                new.push(Binding {
                    channel,
                    controller,
                    port,
                    min: port_ref.min.to_float().unwrap_or(0.0),
                    max: port_ref.max.to_float().unwrap_or(1.0),
                    log: port_ref
                        .properties
                        .get_first(&crate::event::keys::uri("ingen:#logarithmic"))
                        .and_then(|a| a.bool())
                        .unwrap_or(false),
                });
                Some(new)
            }
            Atom::String(s) if s == "learn" => {
                self.learn_port.store(port, Ordering::Release);
                None
            }
            _ => {
                log::warn!("ignoring binding property with unsupported value type");
                None
            }
        }
    }

    /// Replacement list with every binding for `port` removed, or None if
    /// there were none. Pre-process thread.
    pub fn prepare_removal(&self, port: *mut Port) -> Option<Vec<Binding>> {
        let current = self.snapshot();
        let new: Vec<Binding> = current
            .iter()
            .filter(|b| !core::ptr::eq(b.port, port))
            .cloned()
            .collect();
        if new.len() == current.len() {
            None
        } else {
            Some(new)
        }
    }

    /// Audio thread: map the cycle's incoming MIDI onto bound ports.
    pub fn process(&self, ctx: &RunContext, midi_buffer: &Buffer, midi_type: ingen_core::Urid) {
        let Some(seq) = midi_buffer.sequence_data() else {
            return;
        };
        // Safety: audio-thread read; replacement happens between cycles.
        let bindings = unsafe { &*self.bindings.get() };
        for (ev, body) in seq.iter() {
            if ev.type_urid != midi_type || body.len() < 3 {
                continue;
            }
            if midi::status(body) != Some(midi::CONTROL) {
                continue;
            }
            let channel = body[0] & 0x0F;
            let controller = body[1] & 0x7F;
            let value = body[2] & 0x7F;

            let learn_target = self.learn_port.load(Ordering::Acquire);
            if !learn_target.is_null() {
                self.learned.store(
                    ((channel as u32) << 8) | controller as u32,
                    Ordering::Relaxed,
                );
                self.learned_port.store(learn_target, Ordering::Relaxed);
                self.has_learned.store(true, Ordering::Release);
                self.learn_port
                    .store(core::ptr::null_mut(), Ordering::Release);
            }

            for binding in bindings {
                if binding.channel == channel && binding.controller == controller {
                    // Safety: bound ports are live while installed; the
                    // audio thread is the unique writer of port values.
                    let port = unsafe { &mut *binding.port };
                    port.set_control_value(ctx, ev.frame.max(ctx.offset), binding.value_for(value));
                }
            }
        }
    }

    /// Post-process worker: the captured learn result, if any. The caller
    /// turns it into a `ingen:#binding` property delta for the armed port.
    pub fn take_learned(&self) -> Option<(u8, u8, *mut Port)> {
        if self.has_learned.swap(false, Ordering::Acquire) {
            let packed = self.learned.load(Ordering::Relaxed);
            Some((
                ((packed >> 8) & 0x0F) as u8,
                (packed & 0x7F) as u8,
                self.learned_port.load(Ordering::Relaxed),
            ))
        } else {
            None
        }
    }
}
