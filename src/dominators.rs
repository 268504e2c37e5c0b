//! Dominator analysis over a [`BlockGraph`].
//!
//! Computes, in order:
//!
//! 1. A depth-first spanning tree from the entry, labelling every edge tree/forward/back/cross
//!    by pre-order and completion numbers.
//! 2. Immediate dominators, using the iterative algorithm of
//!
//!    > Cooper K., Harvey T., Kennedy K. (2001) A Simple, Fast Dominance Algorithm.
//!
//!    over reverse post-order, until a fixed point. Blocks with no path from the entry are
//!    flagged dead.
//! 3. The dominator tree (children per block) and each block's depth in it.
//! 4. Dominance frontiers, via the "runner" walk from each predecessor of a join point.
//!
//! Back edges whose target dominates their source are additionally labelled as loop edges, and
//! the blocks of their natural loops are flagged, for consumers that need to know whether an
//! operation may execute repeatedly.
//!
//! Every step recomputes from scratch, so running the analysis twice gives identical results.

use crate::block::{BlockFlags, BlockGraph, BlockId, EdgeLabel};
use crate::log::*;

/// Outcome of [`calc_dominators`]
#[derive(Debug, Clone, Default)]
pub struct DominatorSummary {
    /// Blocks in reverse post-order from the entry
    pub rpo: Vec<BlockId>,
    /// Blocks with no path from the entry
    pub unreachable: Vec<BlockId>,
}

/// Run the full dominator analysis, storing results on the blocks of `graph`
pub fn calc_dominators(graph: &mut BlockGraph) -> DominatorSummary {
    reset(graph);
    let Some(entry) = graph.entry() else {
        let unreachable: Vec<BlockId> = graph.ids().collect();
        for &b in &unreachable {
            graph.get_mut(b).flags |= BlockFlags::DEAD;
        }
        return DominatorSummary {
            rpo: vec![],
            unreachable,
        };
    };

    let rpo = spanning_tree(graph, entry);
    let idom = immediate_dominators(graph, &rpo);
    build_tree(graph, &rpo, &idom);
    dominance_frontiers(graph, &rpo);
    label_loops(graph);

    let unreachable: Vec<BlockId> = graph
        .ids()
        .filter(|b| graph.get(*b).preorder.is_none())
        .collect();
    for &b in &unreachable {
        graph.get_mut(b).flags |= BlockFlags::DEAD;
    }
    if !unreachable.is_empty() {
        debug!("Unreachable blocks"; "blocks" => ?unreachable);
    }

    DominatorSummary { rpo, unreachable }
}

fn reset(graph: &mut BlockGraph) {
    for b in graph.ids().collect::<Vec<_>>() {
        let blk = graph.get_mut(b);
        blk.flags
            .remove(BlockFlags::DEAD | BlockFlags::LOOP_HEADER | BlockFlags::LOOP_BODY);
        blk.immed_dom = None;
        blk.dom_children.clear();
        blk.dom_depth = 0;
        blk.frontier.clear();
        blk.preorder = None;
        blk.postorder = None;
        for slot in 0..blk.out_edges.len() {
            let label = graph.get(b).out_edges[slot].label - EdgeLabel::CLASSIFICATION;
            graph.set_edge_label(b, slot, label);
        }
    }
}

/// Iterative depth-first search from `entry`, numbering blocks and classifying edges. Returns
/// the reachable blocks in reverse post-order.
fn spanning_tree(graph: &mut BlockGraph, entry: BlockId) -> Vec<BlockId> {
    let mut preorder = 0;
    let mut postorder_list: Vec<BlockId> = vec![];
    let mut stack: Vec<(BlockId, usize)> = vec![(entry, 0)];
    graph.get_mut(entry).preorder = Some(preorder);
    preorder += 1;

    while let Some(&mut (b, ref mut next)) = stack.last_mut() {
        if *next < graph.get(b).out_edges.len() {
            let slot = *next;
            *next += 1;
            let edge = graph.get(b).out_edges[slot];
            let target = graph.get(edge.point);
            let class = if target.preorder.is_none() {
                EdgeLabel::TREE
            } else if target.postorder.is_none() {
                // Still on the stack
                EdgeLabel::BACK
            } else if target.preorder > graph.get(b).preorder {
                EdgeLabel::FORWARD
            } else {
                EdgeLabel::CROSS
            };
            graph.set_edge_label(b, slot, edge.label | class);
            if class == EdgeLabel::TREE {
                graph.get_mut(edge.point).preorder = Some(preorder);
                preorder += 1;
                stack.push((edge.point, 0));
            }
        } else {
            graph.get_mut(b).postorder = Some(postorder_list.len());
            postorder_list.push(b);
            stack.pop();
        }
    }

    postorder_list.reverse();
    postorder_list
}

fn immediate_dominators(graph: &BlockGraph, rpo: &[BlockId]) -> Vec<Option<BlockId>> {
    let n = graph.len();
    let mut rpo_num: Vec<usize> = vec![usize::MAX; n];
    for (i, b) in rpo.iter().enumerate() {
        rpo_num[b.index()] = i;
    }
    let mut idom: Vec<Option<BlockId>> = vec![None; n];
    let entry = rpo[0];
    idom[entry.index()] = Some(entry);

    let intersect = |idom: &[Option<BlockId>], mut a: BlockId, mut b: BlockId| -> BlockId {
        while a != b {
            while rpo_num[a.index()] > rpo_num[b.index()] {
                a = idom[a.index()].expect("Processed block without idom");
            }
            while rpo_num[b.index()] > rpo_num[a.index()] {
                b = idom[b.index()].expect("Processed block without idom");
            }
        }
        a
    };

    let mut changed = true;
    let mut iterations = 0;
    while changed {
        changed = false;
        iterations += 1;
        for &b in &rpo[1..] {
            let mut new_idom: Option<BlockId> = None;
            for p in graph.get(b).predecessors() {
                if idom[p.index()].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => p,
                    Some(cur) => intersect(&idom, p, cur),
                });
            }
            if new_idom.is_some() && idom[b.index()] != new_idom {
                idom[b.index()] = new_idom;
                changed = true;
            }
        }
    }
    trace!("Immediate dominators converged"; "iterations" => iterations);

    idom
}

fn build_tree(graph: &mut BlockGraph, rpo: &[BlockId], idom: &[Option<BlockId>]) {
    for &b in &rpo[1..] {
        let d = idom[b.index()].expect("Reachable block without idom");
        let depth = graph.get(d).dom_depth + 1;
        let blk = graph.get_mut(b);
        blk.immed_dom = Some(d);
        blk.dom_depth = depth;
        graph.get_mut(d).dom_children.push(b);
    }
}

fn dominance_frontiers(graph: &mut BlockGraph, rpo: &[BlockId]) {
    for &b in rpo {
        let preds: Vec<BlockId> = graph
            .get(b)
            .predecessors()
            .filter(|p| graph.get(*p).preorder.is_some())
            .collect();
        if preds.len() < 2 {
            continue;
        }
        let stop = graph.get(b).immed_dom;
        for p in preds {
            let mut runner = Some(p);
            while let Some(r) = runner {
                if Some(r) == stop {
                    break;
                }
                let frontier = &mut graph.get_mut(r).frontier;
                if !frontier.contains(&b) {
                    frontier.push(b);
                }
                runner = graph.get(r).immed_dom;
            }
        }
    }
}

fn label_loops(graph: &mut BlockGraph) {
    let mut back_edges: Vec<(BlockId, usize, BlockId)> = vec![];
    for blk in graph.iter() {
        for (slot, e) in blk.out_edges.iter().enumerate() {
            if e.label.contains(EdgeLabel::BACK) {
                back_edges.push((blk.index, slot, e.point));
            }
        }
    }
    for (src, slot, header) in back_edges {
        if !graph.dominates(header, src) {
            // Irreducible: a retreating edge that is not a natural loop
            continue;
        }
        let label = graph.get(src).out_edges[slot].label | EdgeLabel::LOOP;
        graph.set_edge_label(src, slot, label);
        graph.get_mut(header).flags |= BlockFlags::LOOP_HEADER | BlockFlags::LOOP_BODY;

        let mut worklist = vec![src];
        while let Some(b) = worklist.pop() {
            let blk = graph.get_mut(b);
            if blk.flags.contains(BlockFlags::MARK) || b == header {
                continue;
            }
            blk.flags |= BlockFlags::MARK | BlockFlags::LOOP_BODY;
            worklist.extend(
                graph
                    .get(b)
                    .predecessors()
                    .filter(|p| graph.get(*p).preorder.is_some()),
            );
        }
        for b in graph.ids().collect::<Vec<_>>() {
            graph.get_mut(b).flags.remove(BlockFlags::MARK);
        }
    }
}
