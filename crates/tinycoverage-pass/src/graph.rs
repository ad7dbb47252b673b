// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Petgraph-backed view of a function's control flow, with dominator and
//! post-dominator queries.
//!
//! LLVM's own dominator analyses are not reachable through the C API, so
//! the selector rebuilds them here: one `simple_fast` run from the entry
//! for dominance, and one over the reversed graph from a virtual exit node
//! (fed by every block without successors) for post-dominance. Blocks that
//! cannot reach an exit never post-dominate anything, which is the
//! conservative answer for the selection predicate.

use std::collections::HashMap;

use inkwell::basic_block::BasicBlock;
use inkwell::values::FunctionValue;
use petgraph::Direction;
use petgraph::algo::dominators::{Dominators, simple_fast};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Reversed;

/// Successor blocks of `block`, one entry per outgoing edge.
///
/// Terminator operands that are basic blocks are exactly the branch
/// targets, for every terminator kind (`br`, `switch`, `invoke`, ...).
pub(crate) fn successors(block: BasicBlock<'_>) -> Vec<BasicBlock<'_>> {
    let Some(terminator) = block.get_terminator() else {
        return Vec::new();
    };
    (0..terminator.get_num_operands())
        .filter_map(|i| terminator.get_operand(i))
        .filter_map(|operand| operand.right())
        .collect()
}

pub(crate) struct FlowGraph<'ctx> {
    graph: DiGraph<Option<BasicBlock<'ctx>>, ()>,
    nodes: HashMap<BasicBlock<'ctx>, NodeIndex>,
    dom: Dominators<NodeIndex>,
    postdom: Dominators<NodeIndex>,
}

impl<'ctx> FlowGraph<'ctx> {
    /// Build the CFG of `function`. Returns `None` for declarations.
    pub(crate) fn new(function: FunctionValue<'ctx>) -> Option<Self> {
        let blocks = function.get_basic_blocks();
        let entry = *blocks.first()?;

        let mut graph = DiGraph::new();
        let mut nodes = HashMap::with_capacity(blocks.len());
        for block in &blocks {
            nodes.insert(*block, graph.add_node(Some(*block)));
        }

        // Virtual exit node, fed by every block without successors, so the
        // post-dominator run has a single root even for multi-exit
        // functions.
        let exit = graph.add_node(None);
        for block in &blocks {
            let node = nodes[block];
            let succs = successors(*block);
            if succs.is_empty() {
                graph.add_edge(node, exit, ());
            } else {
                for succ in succs {
                    graph.add_edge(node, nodes[&succ], ());
                }
            }
        }

        let dom = simple_fast(&graph, nodes[&entry]);
        let postdom = simple_fast(Reversed(&graph), exit);

        Some(Self {
            graph,
            nodes,
            dom,
            postdom,
        })
    }

    fn dominates_node(dom: &Dominators<NodeIndex>, a: NodeIndex, b: NodeIndex) -> bool {
        a == b
            || dom
                .strict_dominators(b)
                .is_some_and(|mut chain| chain.any(|d| d == a))
    }

    /// `a` dominates `b`: every path from the entry to `b` passes `a`.
    pub(crate) fn dominates(&self, a: BasicBlock<'ctx>, b: BasicBlock<'ctx>) -> bool {
        Self::dominates_node(&self.dom, self.nodes[&a], self.nodes[&b])
    }

    /// `a` post-dominates `b`: every path from `b` to an exit passes `a`.
    pub(crate) fn post_dominates(&self, a: BasicBlock<'ctx>, b: BasicBlock<'ctx>) -> bool {
        Self::dominates_node(&self.postdom, self.nodes[&a], self.nodes[&b])
    }

    /// Incoming edge count (a block reached twice from one `switch` counts
    /// twice, matching LLVM's predecessor iteration).
    pub(crate) fn incoming_edge_count(&self, block: BasicBlock<'ctx>) -> usize {
        self.graph
            .neighbors_directed(self.nodes[&block], Direction::Incoming)
            .count()
    }

    /// Block has at least one successor and dominates all of them.
    pub(crate) fn is_full_dominator(&self, block: BasicBlock<'ctx>) -> bool {
        let succs = successors(block);
        !succs.is_empty() && succs.into_iter().all(|succ| self.dominates(block, succ))
    }

    /// Block has at least one predecessor and post-dominates all of them.
    pub(crate) fn is_full_post_dominator(&self, block: BasicBlock<'ctx>) -> bool {
        let node = self.nodes[&block];
        let mut preds = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .peekable();
        if preds.peek().is_none() {
            return false;
        }
        preds.all(|pred| Self::dominates_node(&self.postdom, node, pred))
    }
}
