//! # Ingen Engine
//!
//! A modular audio processing server core. Clients build a directed graph of
//! processing blocks (plugin instances, built-in nodes and sub-graphs); a
//! real-time audio thread executes the graph every cycle while a pre-process
//! worker freely mutates structure and hands prepared changes over through
//! lock-free rings.
//!
//! The split mirrors the two faces of the engine:
//!
//! - [`Engine`] is the non-real-time side: it owns the [`store::Store`], the
//!   [`buffer_factory::BufferFactory`], the undo stacks and the event
//!   pipeline. All allocation happens here.
//! - [`EngineProcess`] is the real-time side, driven by a [`driver::Driver`]
//!   callback. It drains prepared events, runs the compiled task tree and
//!   never allocates, blocks or performs I/O.
//!
//! # Codebase conventions
//!
//! - Raw pointers crossing the thread boundary are always kept alive by an
//!   `Arc` travelling with them, and structures replaced on the audio thread
//!   are returned to the pre-process side for disposal.

pub mod arc;
pub mod block;
pub mod broadcaster;
pub mod buffer;
pub mod buffer_factory;
pub mod compiled_graph;
pub mod control_bindings;
pub mod driver;
pub mod engine;
pub mod event;
pub mod graph;
pub mod host;
pub mod internals;
pub mod port;
pub mod rt_log;
pub mod run_context;
pub mod store;
pub mod task;
#[cfg(test)]
mod tests;
pub mod undo;
pub mod worker;

pub use engine::{Engine, EngineHandle, EngineOptions, EngineProcess};
pub use ingen_core::*;
