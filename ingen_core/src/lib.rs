//! # Ingen Core
//!
//! Value-level data model for the Ingen engine: hierarchical paths and URIs,
//! typed atoms, property multimaps, URID interning and the client-facing
//! status codes.
//!
//! This crate contains no threads and no audio buffers; everything here may
//! be freely created, cloned and dropped on non-real-time threads. The
//! engine crate builds its real-time structures on top of these types.
//!
//! # Codebase conventions
//!
//! - Strings that are cloned often (symbols, path text) use [`ecow::EcoString`]

pub mod atom;
pub mod path;
pub mod property;
pub mod status;
pub mod types;
pub mod uri;
pub mod urid;

pub use atom::Atom;
pub use path::{Path, PathError, Symbol};
pub use property::{Properties, Property, PropertyContext};
pub use status::Status;
pub use types::{Direction, PortType};
pub use uri::Uri;
pub use urid::{CoreUrids, Urid, UridMap};
