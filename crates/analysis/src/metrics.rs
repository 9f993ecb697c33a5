/// Module for computing analytical metrics over the program representation.
///
/// Implements a minimal set of metrics quantified by instruction volume,
/// control-flow complexity, and dominator overlap to assess transform potency
/// (analyst effort). The pass driver collects metrics before and after each
/// transform and uses [`compare`] to decide whether a snapshot is kept.
use petgraph::{
    algo::dominators::simple_fast,
    graph::{DiGraph, NodeIndex},
    visit::Reversed,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use vigil_core::ir::{EdgeKind, Function, Module, Terminator, flow_graph};
use vigil_utils::errors::MetricsError;

/// Analytical metrics for one module.
///
/// Counts cover defined functions only; declarations contribute nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    /// Number of functions with bodies.
    pub func_cnt: usize,
    /// Number of basic blocks across all defined functions.
    pub block_cnt: usize,
    /// Number of control-flow edges.
    pub edge_cnt: usize,
    /// Number of placed instructions.
    pub inst_cnt: usize,
    /// Fraction of blocks whose immediate dominator and post-dominator
    /// coincide, averaged over functions weighted by block count.
    pub dom_overlap: f64,
    /// Composite potency score (heuristic over blocks, edges, and overlap).
    pub potency: f64,
}

/// Collects metrics from a module.
///
/// # Errors
/// Fails when the module has no defined functions to measure.
pub fn collect_metrics(module: &Module) -> Result<Metrics, MetricsError> {
    let mut func_cnt = 0;
    let mut block_cnt = 0;
    let mut edge_cnt = 0;
    let mut inst_cnt = 0;
    let mut overlap_weighted = 0.0;

    for func in module.functions.iter().filter(|f| !f.is_declaration()) {
        func_cnt += 1;
        let blocks = func.blocks.len();
        if blocks == 0 {
            return Err(MetricsError::NoBlocks(func.name.clone()));
        }
        block_cnt += blocks;
        inst_cnt += func.blocks.iter().map(|b| b.insts.len()).sum::<usize>();

        let g = flow_graph(func);
        edge_cnt += g.edge_count();
        overlap_weighted += dom_overlap(func, &g) * blocks as f64;
    }

    if func_cnt == 0 {
        return Err(MetricsError::EmptyModule);
    }

    let dom_overlap = overlap_weighted / block_cnt as f64;
    let metrics = Metrics {
        func_cnt,
        block_cnt,
        edge_cnt,
        inst_cnt,
        dom_overlap,
        potency: score(dom_overlap, block_cnt, edge_cnt),
    };
    tracing::debug!(
        "collected metrics: {} blocks, {} edges, {} instructions, potency {:.2}",
        metrics.block_cnt,
        metrics.edge_cnt,
        metrics.inst_cnt,
        metrics.potency
    );
    Ok(metrics)
}

/// Fraction of a function's blocks whose immediate dominator equals their
/// immediate post-dominator. A higher overlap indicates a more linear flow
/// graph, which reduces obfuscation potency.
fn dom_overlap(func: &Function, g: &DiGraph<vigil_core::ir::BlockId, EdgeKind>) -> f64 {
    if g.node_count() <= 1 {
        return 1.0;
    }

    // Post-dominator analysis needs a single sink: add a virtual exit fed by
    // every returning or dead-end block.
    let mut augmented = g.clone();
    let exit = augmented.add_node(vigil_core::ir::BlockId(usize::MAX));
    for bb in func.block_ids() {
        if matches!(
            func.block(bb).term,
            Terminator::Ret { .. } | Terminator::Unreachable
        ) {
            augmented.add_edge(NodeIndex::new(bb.0), exit, EdgeKind::Goto);
        }
    }

    let doms = simple_fast(&augmented, NodeIndex::new(0));
    let mut dom_map = HashMap::new();
    for n in g.node_indices() {
        if let Some(idom) = doms.immediate_dominator(n) {
            dom_map.insert(n, idom);
        }
    }

    let post = simple_fast(Reversed(&augmented), exit);
    let mut pdom_map = HashMap::new();
    for n in g.node_indices() {
        if let Some(ipdom) = post.immediate_dominator(n) {
            pdom_map.insert(n, ipdom);
        }
    }

    if dom_map.is_empty() {
        return 1.0;
    }
    let common = dom_map
        .iter()
        .filter(|(n, d)| pdom_map.get(*n) == Some(*d))
        .count();
    common as f64 / dom_map.len() as f64
}

/// Composite potency score: control-flow complexity rewarded, overlap
/// penalized.
fn score(overlap: f64, blocks: usize, edges: usize) -> f64 {
    5.0 * (blocks.max(1) as f64).log2() + edges as f64 + 30.0 * (1.0 - overlap)
}

/// Compares two metric sets to evaluate a transform. Positive means the
/// transform increased complexity without excessive instruction growth.
pub fn compare(before: &Metrics, after: &Metrics) -> f64 {
    after.potency - before.potency - 0.05 * (after.inst_cnt as f64 - before.inst_cnt as f64)
}
