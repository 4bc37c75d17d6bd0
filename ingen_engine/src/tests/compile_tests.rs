//! Task-tree construction tests against hand-built graphs.

use std::collections::HashMap;

use ingen_core::{CoreUrids, Path, UridMap};

use crate::arc::ArcImpl;
use crate::block::Block;
use crate::buffer_factory::{BufferFactory, DEFAULT_SEQ_CAPACITY};
use crate::compiled_graph::{compile, CompileError};
use crate::graph::{BlockKey, GraphImpl};
use crate::internals::InternalKind;
use crate::task::Task;
use crate::tests::utils::{TestHost, GAIN_URI};
use crate::host::PluginHost;

struct Fixture {
    graph: GraphImpl,
    factory: BufferFactory,
    urids: CoreUrids,
    keys: HashMap<&'static str, BlockKey>,
}

impl Fixture {
    fn new() -> Self {
        let map = UridMap::new();
        Self {
            graph: GraphImpl::new(Path::root(), 1),
            factory: BufferFactory::new(16, DEFAULT_SEQ_CAPACITY),
            urids: CoreUrids::new(&map),
            keys: HashMap::new(),
        }
    }

    fn add_gain(&mut self, name: &'static str) {
        let descriptor = TestHost
            .load_plugin(&ingen_core::Uri::parse(GAIN_URI).unwrap())
            .unwrap();
        let path = Path::parse(&format!("/{name}")).unwrap();
        let block = Block::new_plugin(path, descriptor, &mut self.factory).unwrap();
        let key = self.graph.add_block(Box::new(block));
        self.keys.insert(name, key);
    }

    fn add_delay(&mut self, name: &'static str) {
        let path = Path::parse(&format!("/{name}")).unwrap();
        let block =
            Block::new_internal(path, InternalKind::BlockDelay, 1, &mut self.factory, &self.urids)
                .unwrap();
        let key = self.graph.add_block(Box::new(block));
        self.keys.insert(name, key);
    }

    /// Connect the first output port of `tail` to the first input port of
    /// `head`.
    fn arc(&mut self, tail: &'static str, head: &'static str) {
        let tail_key = self.keys[tail];
        let head_key = self.keys[head];
        let tail_port = {
            let block = self.graph.block(tail_key).unwrap();
            (0..block.ports.len())
                .find(|&i| block.ports.at(i).direction().is_output())
                .map(|i| block.ports.raw(i))
                .expect("block has an output")
        };
        let head_port = {
            let block = self.graph.block(head_key).unwrap();
            (0..block.ports.len())
                .find(|&i| {
                    block.ports.at(i).direction().is_input()
                        && block.ports.at(i).port_type().is_signal()
                })
                .map(|i| block.ports.raw(i))
                .expect("block has a signal input")
        };
        self.graph.add_arc(ArcImpl::new(
            tail_port,
            head_port,
            Some(tail_key),
            Some(head_key),
        ));
    }

    fn block_ptr(&self, name: &str) -> *const Block {
        self.graph
            .block(self.keys[name])
            .map(|b| b as *const Block)
            .unwrap()
    }

    /// Execution positions of named blocks in the compiled tree.
    fn positions(&self, compiled: &crate::compiled_graph::CompiledGraph) -> HashMap<String, usize> {
        let blocks = compiled.blocks();
        self.keys
            .iter()
            .map(|(name, _)| {
                let ptr = self.block_ptr(name);
                let pos = blocks
                    .iter()
                    .position(|&b| core::ptr::eq(b, ptr))
                    .expect("every block appears in the tree");
                (name.to_string(), pos)
            })
            .collect()
    }
}

#[test]
fn every_block_appears_exactly_once() {
    let mut f = Fixture::new();
    for name in ["a", "b", "c", "d"] {
        f.add_gain(name);
    }
    f.arc("a", "b");
    f.arc("a", "c");
    f.arc("b", "d");
    f.arc("c", "d");
    let compiled = compile(&f.graph).unwrap();
    let blocks = compiled.blocks();
    assert_eq!(blocks.len(), 4);
    for name in ["a", "b", "c", "d"] {
        assert!(compiled.contains(f.block_ptr(name)));
    }
}

#[test]
fn chain_is_in_topological_order() {
    let mut f = Fixture::new();
    for name in ["a", "b", "c"] {
        f.add_gain(name);
    }
    f.arc("a", "b");
    f.arc("b", "c");
    let compiled = compile(&f.graph).unwrap();
    let pos = f.positions(&compiled);
    assert!(pos["a"] < pos["b"]);
    assert!(pos["b"] < pos["c"]);
}

#[test]
fn diamond_respects_dependencies() {
    let mut f = Fixture::new();
    for name in ["a", "b", "c", "d"] {
        f.add_gain(name);
    }
    f.arc("a", "b");
    f.arc("a", "c");
    f.arc("b", "d");
    f.arc("c", "d");
    let compiled = compile(&f.graph).unwrap();
    let pos = f.positions(&compiled);
    assert!(pos["a"] < pos["b"]);
    assert!(pos["a"] < pos["c"]);
    assert!(pos["b"] < pos["d"]);
    assert!(pos["c"] < pos["d"]);
}

#[test]
fn independent_blocks_parallelize() {
    let mut f = Fixture::new();
    f.add_gain("a");
    f.add_gain("b");
    let compiled = compile(&f.graph).unwrap();
    assert!(matches!(compiled.master(), Task::Parallel(_)));
}

#[test]
fn feedback_cycle_is_refused() {
    let mut f = Fixture::new();
    f.add_gain("x");
    f.add_gain("y");
    f.arc("x", "y");
    f.arc("y", "x");
    match compile(&f.graph) {
        Err(CompileError::FeedbackCycle { .. }) => {}
        other => panic!("expected a feedback cycle error, got {:?}", other.is_ok()),
    }
}

#[test]
fn delay_breaks_feedback() {
    let mut f = Fixture::new();
    f.add_gain("x");
    f.add_gain("y");
    f.add_delay("d");
    f.arc("x", "d");
    f.arc("d", "y");
    f.arc("y", "x");
    let compiled = compile(&f.graph).unwrap();
    assert_eq!(compiled.blocks().len(), 3);
    let pos = f.positions(&compiled);
    // The delay's consumers run before it; its own input is a real
    // dependency.
    assert!(pos["y"] < pos["x"]);
    assert!(pos["x"] < pos["d"]);
}

#[test]
fn empty_graph_compiles() {
    let f = Fixture::new();
    let compiled = compile(&f.graph).unwrap();
    assert!(compiled.blocks().is_empty());
}
