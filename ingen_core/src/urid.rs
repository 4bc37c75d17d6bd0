//! URI interning.
//!
//! A [`Urid`] is a small integer id for an interned URI, cheap to compare
//! and copy on the audio thread. Interning happens only on non-real-time
//! threads; the audio thread sees URIDs as opaque tags.

use crate::uri::Uri;
use core::num::NonZeroU32;
use std::collections::HashMap;
use std::sync::Mutex;

/// Interned URI id. Ids are never reused within one engine run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Urid(pub NonZeroU32);

impl Urid {
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

/// Bidirectional `Uri ↔ Urid` intern table.
///
/// Mapping is guarded by a mutex and must only be called from non-real-time
/// threads. Handing out `Urid` copies is free.
pub struct UridMap {
    inner: Mutex<UridMapInner>,
}

struct UridMapInner {
    to_id: HashMap<Uri, Urid>,
    to_uri: Vec<Uri>,
}

impl UridMap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(UridMapInner {
                to_id: HashMap::new(),
                to_uri: Vec::new(),
            }),
        }
    }

    /// Map a URI to its id, interning it on first sight.
    pub fn map(&self, uri: &Uri) -> Urid {
        let mut inner = self.inner.lock().expect("urid map lock");
        if let Some(id) = inner.to_id.get(uri) {
            return *id;
        }
        inner.to_uri.push(uri.clone());
        let id = Urid(
            NonZeroU32::new(inner.to_uri.len() as u32).expect("intern table length is nonzero"),
        );
        inner.to_id.insert(uri.clone(), id);
        id
    }

    /// Reverse lookup. Returns None for ids not minted by this map.
    pub fn unmap(&self, urid: Urid) -> Option<Uri> {
        let inner = self.inner.lock().expect("urid map lock");
        inner.to_uri.get(urid.get() as usize - 1).cloned()
    }
}

macro_rules! core_urids {
    ($($field:ident => $uri:expr),* $(,)?) => {
        /// Well-known URIDs, resolved once at engine startup.
        #[derive(Clone, Copy, Debug)]
        pub struct CoreUrids {
            $(pub $field: Urid,)*
        }
        impl CoreUrids {
            pub fn new(map: &UridMap) -> Self {
                Self {
                    $($field: map.map(&Uri::parse($uri).expect("core URI is valid")),)*
                }
            }
        }
    };
}

core_urids! {
    atom_int => "http://lv2plug.in/ns/ext/atom#Int",
    atom_float => "http://lv2plug.in/ns/ext/atom#Float",
    atom_bool => "http://lv2plug.in/ns/ext/atom#Bool",
    atom_string => "http://lv2plug.in/ns/ext/atom#String",
    atom_uri => "http://lv2plug.in/ns/ext/atom#URID",
    atom_sequence => "http://lv2plug.in/ns/ext/atom#Sequence",
    atom_sound => "http://lv2plug.in/ns/ext/atom#Sound",
    midi_event => "http://lv2plug.in/ns/ext/midi#MidiEvent",
    time_position => "http://lv2plug.in/ns/ext/time#Position",
    ingen_enabled => "ingen:#enabled",
    ingen_polyphony => "ingen:#polyphony",
    ingen_polyphonic => "ingen:#polyphonic",
    ingen_value => "ingen:#value",
    ingen_minimum => "ingen:#minimum",
    ingen_maximum => "ingen:#maximum",
    ingen_prototype => "ingen:#prototype",
    ingen_dropped_events => "ingen:#droppedEvents",
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_round_trip() {
        let map = UridMap::new();
        let a = Uri::parse("http://example.org/a").unwrap();
        let b = Uri::parse("http://example.org/b").unwrap();
        let ia = map.map(&a);
        let ib = map.map(&b);
        assert_ne!(ia, ib);
        assert_eq!(map.map(&a), ia);
        assert_eq!(map.unmap(ia), Some(a));
        assert_eq!(map.unmap(ib), Some(b));
    }

    #[test]
    fn core_urids_distinct() {
        let map = UridMap::new();
        let urids = CoreUrids::new(&map);
        assert_ne!(urids.atom_float, urids.atom_int);
        assert_ne!(urids.atom_sequence, urids.midi_event);
    }
}
