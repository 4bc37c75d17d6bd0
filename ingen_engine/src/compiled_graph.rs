//! Compilation of a graph's topology into a schedulable task tree.
//!
//! The tree is rebuilt on the pre-process thread whenever structure changes
//! and installed by an event's execute phase as an atomic swap; the audio
//! thread never sees a half-built tree, and a block is only disposed of
//! after it has disappeared from the live tree.

use core::cell::UnsafeCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ingen_core::Path;
use slotmap::SlotMap;

use crate::block::{Block, BlockKind};
use crate::graph::{BlockKey, GraphImpl};
use crate::internals::InternalState;
use crate::run_context::RunContext;
use crate::task::{ParallelTask, Task};

/// Errors from graph compilation.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("feedback cycle through arc `{tail}` -> `{head}`; insert a BlockDelay to break it")]
    FeedbackCycle { tail: Path, head: Path },
}

/// Immutable (per version) task tree for one graph.
///
/// Holds the graph's block-map `Arc` so task pointers stay valid even if
/// the editing side drops blocks while this tree is still live on the
/// audio thread.
pub struct CompiledGraph {
    master: Task,
    _blocks: Arc<UnsafeCell<SlotMap<BlockKey, Box<Block>>>>,
}

// Safety: the UnsafeCell is never dereferenced through this struct; it only
// pins the allocation. Task pointers are used per the Task safety contract.
unsafe impl Send for CompiledGraph {}
unsafe impl Sync for CompiledGraph {}

impl CompiledGraph {
    pub fn run(&self, ctx: &RunContext) {
        self.master.run(ctx);
    }

    /// Every block in the tree, one entry per `Single` occurrence.
    pub fn blocks(&self) -> Vec<*mut Block> {
        let mut out = Vec::new();
        self.master.collect_blocks(&mut out);
        out
    }

    pub fn contains(&self, block: *const Block) -> bool {
        self.blocks().iter().any(|&b| core::ptr::eq(b, block))
    }

    #[cfg(test)]
    pub(crate) fn master(&self) -> &Task {
        &self.master
    }
}

/// Intermediate pure tree, simplified before lowering to atomics-bearing
/// tasks.
enum Node {
    Single(BlockKey),
    Seq(Vec<Node>),
    Par(Vec<Node>),
}

fn simplify(node: Node) -> Node {
    match node {
        Node::Single(k) => Node::Single(k),
        Node::Seq(children) => {
            let mut out = Vec::with_capacity(children.len());
            for child in children {
                match simplify(child) {
                    // Nested sequentials merge.
                    Node::Seq(inner) => out.extend(inner),
                    other => out.push(other),
                }
            }
            if out.len() == 1 {
                out.pop().expect("length checked")
            } else {
                Node::Seq(out)
            }
        }
        Node::Par(children) => {
            let mut out = Vec::with_capacity(children.len());
            for child in children {
                match simplify(child) {
                    Node::Par(inner) => out.extend(inner),
                    other => out.push(other),
                }
            }
            if out.len() == 1 {
                out.pop().expect("length checked")
            } else {
                Node::Par(out)
            }
        }
    }
}

fn lower(node: Node, graph: &GraphImpl) -> Task {
    match node {
        Node::Single(key) => {
            let block: *mut Block = graph
                .blocks_mut()
                .get_mut(key)
                .map(|b| &mut **b as *mut Block)
                .expect("compiled keys are live");
            Task::Single(block)
        }
        Node::Seq(children) => {
            Task::Sequential(children.into_iter().map(|c| lower(c, graph)).collect())
        }
        Node::Par(children) => Task::Parallel(ParallelTask::new(
            children.into_iter().map(|c| lower(c, graph)).collect(),
        )),
    }
}

/// Block-level dependencies derived from the arc set, with arcs out of
/// BlockDelay blocks removed (they publish the previous cycle's value and
/// impose no ordering).
struct Deps {
    providers: HashMap<BlockKey, Vec<BlockKey>>,
    dependants: HashMap<BlockKey, Vec<BlockKey>>,
}

fn block_is_delay(graph: &GraphImpl, key: BlockKey) -> bool {
    graph.block(key).is_some_and(|b| {
        matches!(&b.kind, BlockKind::Internal(InternalState::BlockDelay(_)))
    })
}

fn build_deps(graph: &GraphImpl) -> Deps {
    let mut providers: HashMap<BlockKey, Vec<BlockKey>> = HashMap::new();
    let mut dependants: HashMap<BlockKey, Vec<BlockKey>> = HashMap::new();
    for key in graph.blocks().keys() {
        providers.entry(key).or_default();
        dependants.entry(key).or_default();
    }
    for arc in graph.arcs.values() {
        let (Some(tail), Some(head)) = (arc.tail_block, arc.head_block) else {
            continue;
        };
        if block_is_delay(graph, tail) {
            continue;
        }
        let p = providers.entry(head).or_default();
        if !p.contains(&tail) {
            p.push(tail);
        }
        let d = dependants.entry(tail).or_default();
        if !d.contains(&head) {
            d.push(head);
        }
    }
    Deps {
        providers,
        dependants,
    }
}

/// Tri-color depth-first search for cycles in the (delay-stripped)
/// dependency graph. Returns the offending arc endpoints if one is found.
fn find_cycle(graph: &GraphImpl, deps: &Deps) -> Option<(Path, Path)> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        Visiting,
        Visited,
    }
    fn visit(
        block: BlockKey,
        deps: &Deps,
        marks: &mut HashMap<BlockKey, Mark>,
    ) -> Option<(BlockKey, BlockKey)> {
        marks.insert(block, Mark::Visiting);
        for &provider in &deps.providers[&block] {
            match marks.get(&provider).copied().unwrap_or(Mark::Unvisited) {
                Mark::Visiting => return Some((provider, block)),
                Mark::Visited => {}
                Mark::Unvisited => {
                    if let Some(pair) = visit(provider, deps, marks) {
                        return Some(pair);
                    }
                }
            }
        }
        marks.insert(block, Mark::Visited);
        None
    }

    let mut marks: HashMap<BlockKey, Mark> = HashMap::new();
    for key in graph.blocks().keys() {
        if marks.get(&key).copied().unwrap_or(Mark::Unvisited) == Mark::Unvisited {
            if let Some((tail_block, head_block)) = visit(key, deps, &mut marks) {
                // Report the arc joining the offending pair.
                for arc in graph.arcs.values() {
                    if arc.tail_block == Some(tail_block) && arc.head_block == Some(head_block) {
                        return Some((arc.tail_path.clone(), arc.head_path.clone()));
                    }
                }
                let tail_path = graph
                    .block(tail_block)
                    .map(|b| b.path().clone())
                    .unwrap_or_else(Path::root);
                let head_path = graph
                    .block(head_block)
                    .map(|b| b.path().clone())
                    .unwrap_or_else(Path::root);
                return Some((tail_path, head_path));
            }
        }
    }
    None
}

/// How far a sequential chain starting at `block` may extend before the
/// phase must re-converge: short when a provider fans out to several
/// dependants, longer along single-consumer chains.
fn sequential_depth(
    block: BlockKey,
    deps: &Deps,
    memo: &mut HashMap<BlockKey, usize>,
) -> usize {
    if let Some(&d) = memo.get(&block) {
        return d;
    }
    let providers = &deps.providers[&block];
    let depth = if providers.is_empty() {
        1
    } else if providers.iter().any(|p| deps.dependants[p].len() >= 2) {
        2
    } else {
        2 + providers
            .iter()
            .map(|&p| sequential_depth(p, deps, memo))
            .min()
            .expect("providers is non-empty")
    };
    memo.insert(block, depth);
    depth
}

/// Compile `graph` into a task tree with maximum safe parallelism.
///
/// Phases are built sink-first: each phase takes the current working set,
/// grows a sequential chain from each member through single-dependant
/// providers up to the phase depth, and wraps the chains in a parallel
/// task. Earlier (provider-side) phases execute first.
pub fn compile(graph: &GraphImpl) -> Result<Box<CompiledGraph>, CompileError> {
    let deps = build_deps(graph);
    if let Some((tail, head)) = find_cycle(graph, &deps) {
        return Err(CompileError::FeedbackCycle { tail, head });
    }

    let mut visited: HashSet<BlockKey> = HashSet::new();
    // Sinks: no dependants (arcs to the graph's own output ports and arcs
    // out of delays do not count).
    let mut working: Vec<BlockKey> = graph
        .blocks()
        .keys()
        .filter(|k| deps.dependants[k].is_empty())
        .collect();
    let mut depth_memo: HashMap<BlockKey, usize> = HashMap::new();
    // Phases in sink-first order; reversed into the master sequential below.
    let mut phases: Vec<Node> = Vec::new();

    while !working.is_empty() {
        let phase_depth = working
            .iter()
            .map(|&b| sequential_depth(b, &deps, &mut depth_memo))
            .min()
            .expect("working set is non-empty");
        let mut chains: Vec<Node> = Vec::new();
        for &start in &working {
            if visited.contains(&start) {
                continue;
            }
            let mut chain: Vec<BlockKey> = vec![start];
            visited.insert(start);
            let mut cur = start;
            while chain.len() < phase_depth {
                // Walk into a provider only if this chain is its sole
                // consumer; shared providers wait for the next phase.
                let next = deps.providers[&cur].iter().copied().find(|p| {
                    !visited.contains(p)
                        && deps.dependants[p].len() == 1
                        && deps.dependants[p][0] == cur
                });
                let Some(next) = next else { break };
                chain.push(next);
                visited.insert(next);
                cur = next;
            }
            // Providers execute before their consumers within the chain.
            chain.reverse();
            chains.push(Node::Seq(chain.into_iter().map(Node::Single).collect()));
        }
        if !chains.is_empty() {
            phases.push(Node::Par(chains));
        }
        // Next phase: everything unvisited whose dependants have all been
        // scheduled.
        working = graph
            .blocks()
            .keys()
            .filter(|k| {
                !visited.contains(k)
                    && deps.dependants[k].iter().all(|d| visited.contains(d))
            })
            .collect();
    }

    debug_assert_eq!(visited.len(), graph.blocks().len());

    phases.reverse();
    let master = simplify(Node::Seq(phases));
    Ok(Box::new(CompiledGraph {
        master: lower(master, graph),
        _blocks: graph.blocks_arc(),
    }))
}
