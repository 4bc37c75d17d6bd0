//! Directed connections between ports.
//!
//! An arc carries no buffer of its own: it is pre-process bookkeeping that
//! determines which tails a head port mixes or joins. The audio-thread view
//! of connectivity is the source list installed into each head port.

use ingen_core::{Path, Status};

use crate::graph::BlockKey;
use crate::port::Port;

/// A typed directed edge from an output port to an input port. Owned by the
/// graph both endpoints belong to.
///
/// The endpoint block keys drive compilation ordering; `None` means the
/// endpoint is one of the owning graph's own ports.
pub struct ArcImpl {
    pub tail_path: Path,
    pub head_path: Path,
    pub(crate) tail: *mut Port,
    pub(crate) head: *mut Port,
    pub(crate) tail_block: Option<BlockKey>,
    pub(crate) head_block: Option<BlockKey>,
}

// Safety: the raw pointers target ports owned by blocks of the same graph;
// the graph removes incident arcs before disposing of either endpoint.
unsafe impl Send for ArcImpl {}

impl ArcImpl {
    pub fn new(
        tail: *mut Port,
        head: *mut Port,
        tail_block: Option<BlockKey>,
        head_block: Option<BlockKey>,
    ) -> Self {
        // Safety: both ports are live, accessed on the pre-process thread.
        let (tail_path, head_path) =
            unsafe { ((*tail).path().clone(), (*head).path().clone()) };
        Self {
            tail_path,
            head_path,
            tail,
            head,
            tail_block,
            head_block,
        }
    }

    pub fn tail(&self) -> *mut Port {
        self.tail
    }
    pub fn head(&self) -> *mut Port {
        self.head
    }
}

/// Check arc type compatibility: same value category, and for ATOM ports a
/// head that understands the tail's event type.
pub fn can_connect(tail: &Port, head: &Port) -> Result<(), Status> {
    if !tail.port_type().can_connect(head.port_type()) {
        return Err(Status::TypeMismatch);
    }
    if tail.port_type() == ingen_core::PortType::Atom {
        match (tail.buffer_type(), head.buffer_type()) {
            // An untyped head accepts any sequence.
            (_, None) => {}
            (Some(t), Some(h)) if t == h => {}
            (None, Some(_)) => return Err(Status::TypeMismatch),
            (Some(_), Some(_)) => return Err(Status::TypeMismatch),
        }
    }
    Ok(())
}
