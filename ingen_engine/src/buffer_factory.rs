//! Source of buffers, sized for the current cycle length.
//!
//! The factory keeps a registry of every buffer it has handed out. A
//! registry entry whose only remaining handle is the registry's own is dead
//! and will be recycled by the next `get` of a compatible type, so releasing
//! a buffer is simply dropping its handles. Everything here runs on the
//! pre-process thread; the audio thread only writes into storage that
//! already exists.

use ingen_core::{PortType, Status, Urid};

use crate::buffer::{Buffer, BufferRef};

/// Default byte capacity of ATOM sequence buffers.
pub const DEFAULT_SEQ_CAPACITY: usize = 4096;

pub struct BufferFactory {
    nframes: usize,
    seq_capacity: usize,
    /// All live signal buffers (AUDIO and CV share storage shape).
    signal: Vec<BufferRef>,
    control: Vec<BufferRef>,
    sequence: Vec<BufferRef>,
    /// Shared all-zero buffer that unconnected input voices join. Never
    /// recycled and never written.
    silent: BufferRef,
}

impl BufferFactory {
    pub fn new(nframes: usize, seq_capacity: usize) -> Self {
        Self {
            nframes,
            seq_capacity,
            signal: Vec::new(),
            control: Vec::new(),
            sequence: Vec::new(),
            silent: BufferRef::new(Buffer::signal(PortType::Audio, nframes)),
        }
    }

    pub fn nframes(&self) -> usize {
        self.nframes
    }

    pub fn seq_capacity(&self) -> usize {
        self.seq_capacity
    }

    /// The shared zero buffer. Input voices with no arcs join this; it is
    /// never handed out as an owned (writable) buffer.
    pub fn silent_buffer(&self) -> BufferRef {
        self.silent.clone()
    }

    /// Get a buffer of the given type, recycled from the registry if a dead
    /// entry exists, freshly allocated otherwise. The returned buffer is
    /// initialized: zeroed signal, zero control value, empty sequence.
    pub fn get(&mut self, ty: PortType, value_type: Option<Urid>) -> Result<BufferRef, Status> {
        let nframes = self.nframes;
        let seq_capacity = self.seq_capacity;
        let list = match ty {
            PortType::Audio | PortType::Cv => &mut self.signal,
            PortType::Control => &mut self.control,
            PortType::Atom => &mut self.sequence,
        };
        for entry in list.iter() {
            if entry.strong_count() == 1 {
                // Dead entry: ours is the only handle. Reset and reuse.
                // Safety: no other handle exists, so access is exclusive.
                let buf = unsafe { entry.get_mut() };
                match ty {
                    PortType::Audio | PortType::Cv => {
                        if let Some(s) = buf.samples_mut() {
                            s.fill(0.0);
                        }
                    }
                    PortType::Control => buf.set_value(0, 0.0),
                    PortType::Atom => {
                        if let Some(s) = buf.sequence_data_mut() {
                            s.clear();
                        }
                    }
                }
                return Ok(entry.clone());
            }
        }
        let buffer = match ty {
            PortType::Audio | PortType::Cv => Buffer::signal(ty, nframes),
            PortType::Control => Buffer::control(0.0),
            PortType::Atom => Buffer::sequence(seq_capacity, value_type),
        };
        let buf_ref = BufferRef::new(buffer);
        list.push(buf_ref.clone());
        Ok(buf_ref)
    }

    /// Drop dead registry entries, returning storage to the allocator. Called
    /// periodically from post-processing to bound registry growth.
    pub fn reap(&mut self) {
        self.signal.retain(|b| b.strong_count() > 1);
        self.control.retain(|b| b.strong_count() > 1);
        self.sequence.retain(|b| b.strong_count() > 1);
    }

    /// Reallocate every live buffer for a new cycle length.
    ///
    /// Only valid during a driver buffer-size change: the driver guarantees
    /// no `process` callback overlaps this call, so the factory may touch
    /// storage that is normally audio-thread-only.
    pub fn resize_all(&mut self, nframes: usize) {
        self.nframes = nframes;
        for entry in self.signal.iter().chain([&self.silent]) {
            // Safety: the audio thread is parked by the driver contract.
            unsafe { entry.get_mut() }.resize(nframes);
        }
    }

    /// Number of live (externally referenced) buffers. For tests.
    pub fn live_count(&self) -> usize {
        self.signal
            .iter()
            .chain(&self.control)
            .chain(&self.sequence)
            .filter(|b| b.strong_count() > 1)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycles_dead_buffers() {
        let mut factory = BufferFactory::new(64, DEFAULT_SEQ_CAPACITY);
        let a = factory.get(PortType::Audio, None).unwrap();
        // Safety: exclusive in this test.
        unsafe { a.get_mut() }.samples_mut().unwrap().fill(1.0);
        drop(a);
        let b = factory.get(PortType::Audio, None).unwrap();
        // Recycled storage comes back zeroed.
        assert_eq!(unsafe { b.get() }.samples().unwrap(), &[0.0; 64]);
        assert_eq!(factory.live_count(), 1);
    }

    #[test]
    fn distinct_while_alive() {
        let mut factory = BufferFactory::new(16, DEFAULT_SEQ_CAPACITY);
        let a = factory.get(PortType::Control, None).unwrap();
        let b = factory.get(PortType::Control, None).unwrap();
        assert!(!a.ptr_eq(&b));
        assert_eq!(factory.live_count(), 2);
    }

    #[test]
    fn silent_buffer_is_shared() {
        let factory = BufferFactory::new(16, DEFAULT_SEQ_CAPACITY);
        let a = factory.silent_buffer();
        let b = factory.silent_buffer();
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn resize_all_changes_capacity() {
        let mut factory = BufferFactory::new(16, DEFAULT_SEQ_CAPACITY);
        let a = factory.get(PortType::Audio, None).unwrap();
        factory.resize_all(32);
        assert_eq!(unsafe { a.get() }.samples().unwrap().len(), 32);
    }
}
