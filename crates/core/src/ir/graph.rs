//! Flow-graph view of a function, derived from block terminators.
//!
//! The graph is a read-only projection used for reachability and dominator
//! analysis; node `i` always corresponds to `BlockId(i)`.

use super::{BlockId, Function};
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};

/// How control reaches a successor block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeKind {
    /// Unconditional branch.
    Goto,
    /// Conditional branch, condition true.
    True,
    /// Conditional branch, condition false.
    False,
    /// One arm of a multi-way branch.
    Case,
    /// The default arm of a multi-way branch.
    Default,
}

/// Builds the control-flow graph of `func`.
pub fn flow_graph(func: &Function) -> DiGraph<BlockId, EdgeKind> {
    use super::Terminator;

    let mut g = DiGraph::new();
    let nodes: Vec<_> = func.block_ids().map(|b| g.add_node(b)).collect();

    for bb in func.block_ids() {
        let from = nodes[bb.0];
        match &func.block(bb).term {
            Terminator::Br { dest } => {
                g.add_edge(from, nodes[dest.0], EdgeKind::Goto);
            }
            Terminator::CondBr {
                then_dest,
                else_dest,
                ..
            } => {
                g.add_edge(from, nodes[then_dest.0], EdgeKind::True);
                g.add_edge(from, nodes[else_dest.0], EdgeKind::False);
            }
            Terminator::Switch {
                default, cases, ..
            } => {
                g.add_edge(from, nodes[default.0], EdgeKind::Default);
                for (_, dest) in cases {
                    g.add_edge(from, nodes[dest.0], EdgeKind::Case);
                }
            }
            Terminator::Ret { .. } | Terminator::Unreachable => {}
        }
    }
    g
}
