//! SSA construction ("heritage").
//!
//! A variable is a storage location of an exact size. Each read of a variable is linked to the
//! unique write that reaches it, inserting merge ops where writes from different paths meet:
//!
//! 1. collect the variables that are read, and the blocks writing them,
//! 2. place merges on the iterated dominance frontier of the writing blocks,
//! 3. rename along the dominator tree, keeping a stack of the current write per variable,
//! 4. drop merges whose results never reach a real read.
//!
//! Reads that no write reaches become function inputs.

use crate::block::BlockId;
use crate::containers::DepthQueue;
use crate::funcdata::Function;
use crate::il::{Address, Opcode};
use crate::ir::{OpId, VarnodeId};
use crate::log::*;

use std::collections::{BTreeMap, BTreeSet};

type VarKey = (Address, u32);

/// Outcome of [`Function::heritage`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeritageSummary {
    /// Distinct variables renamed
    pub variables: usize,
    /// Merge ops kept
    pub merges: usize,
    /// Function inputs created for reads that no write reaches
    pub inputs: usize,
    /// Merge ops removed because nothing read them
    pub pruned: usize,
}

enum Visit {
    Enter(BlockId),
    Exit(BlockId),
}

impl Function {
    fn live_parent(&self, op: OpId) -> Option<BlockId> {
        self.store
            .op(op)
            .parent()
            .filter(|b| !self.graph.get(*b).is_dead())
    }

    fn heritage_key(&self, vn: VarnodeId) -> Option<VarKey> {
        let v = self.store.varnode(vn);
        if v.is_constant() || v.is_annotation() {
            None
        } else {
            Some((v.loc(), v.size()))
        }
    }

    /// Variables read somewhere in a reachable block, each with the blocks that write it
    fn collect_variables(&self) -> BTreeMap<VarKey, BTreeSet<BlockId>> {
        let mut vars: BTreeMap<VarKey, BTreeSet<BlockId>> = BTreeMap::new();
        for vn in self.store.loc_order() {
            let v = self.store.varnode(vn);
            if !v.is_free() || v.is_annotation() {
                continue;
            }
            if v.uses().iter().any(|&op| self.live_parent(op).is_some()) {
                vars.entry((v.loc(), v.size())).or_default();
            }
        }
        for vn in self.store.loc_order() {
            let Some(def) = self.store.varnode(vn).def() else {
                continue;
            };
            let (Some(key), Some(b)) = (self.heritage_key(vn), self.live_parent(def)) else {
                continue;
            };
            if let Some(blocks) = vars.get_mut(&key) {
                blocks.insert(b);
            }
        }
        vars
    }

    /// Place merges for one variable on the iterated dominance frontier of its writers
    fn place_merges(
        &mut self,
        key: VarKey,
        writers: &BTreeSet<BlockId>,
        queue: &mut DepthQueue,
    ) -> usize {
        let mut merged: BTreeSet<BlockId> = BTreeSet::new();
        let mut queued: BTreeSet<BlockId> = writers.clone();
        for &b in writers {
            queue.insert(b.index(), self.graph.get(b).dom_depth);
        }
        let mut placed = 0;
        while let Some(x) = queue.extract() {
            let frontier = self.graph.get(BlockId(x as u32)).frontier.clone();
            for f in frontier {
                if self.graph.get(f).is_dead() || !merged.insert(f) {
                    continue;
                }
                self.insert_merge(key, f);
                placed += 1;
                if queued.insert(f) {
                    queue.insert(f.index(), self.graph.get(f).dom_depth);
                }
            }
        }
        placed
    }

    fn insert_merge(&mut self, (loc, size): VarKey, b: BlockId) {
        let blk = self.graph.get(b);
        let addr = blk
            .start
            .or_else(|| blk.first_op().map(|op| self.store.op(op).addr()))
            .unwrap_or(self.addr);
        let num_in = blk.in_edges.len();
        let seq = self.store.new_seq(addr);
        let op = self.store.new_op(Opcode::MultiEqual, seq);
        for slot in 0..num_in {
            let placeholder = self.store.new_varnode(size, loc);
            self.store.set_input(op, placeholder, slot);
        }
        let out = self.store.new_varnode(size, loc);
        self.store.set_output(op, out);
        self.op_insert_begin(op, b);
    }

    /// Replace the free read `placeholder` in `slot` of `op` by the current write of its
    /// variable, creating a function input if none reaches this point
    fn rename_read(
        &mut self,
        op: OpId,
        slot: usize,
        placeholder: VarnodeId,
        stacks: &mut BTreeMap<VarKey, Vec<VarnodeId>>,
        inputs: &mut usize,
    ) {
        let Some(key) = self.heritage_key(placeholder) else {
            return;
        };
        let Some(stack) = stacks.get_mut(&key) else {
            return;
        };
        let current = match stack.last() {
            Some(&vn) => vn,
            None => {
                let vn = self.store.new_varnode(key.1, key.0);
                self.store.set_varnode_input(vn);
                // Stays at the bottom of the stack for the rest of the walk
                stack.push(vn);
                *inputs += 1;
                vn
            }
        };
        self.store.set_input(op, current, slot);
        if let Err(e) = self.store.delete_varnode(placeholder) {
            debug!("Placeholder survives renaming"; "err" => %e);
        }
    }

    fn rename(&mut self, entry: BlockId, vars: &BTreeSet<VarKey>) -> usize {
        let mut stacks: BTreeMap<VarKey, Vec<VarnodeId>> =
            vars.iter().map(|k| (*k, vec![])).collect();
        let mut pushed: BTreeMap<BlockId, Vec<VarKey>> = BTreeMap::new();
        let mut inputs = 0;
        let mut todo = vec![Visit::Enter(entry)];

        while let Some(visit) = todo.pop() {
            let b = match visit {
                Visit::Exit(b) => {
                    for key in pushed.remove(&b).unwrap_or_default() {
                        if let Some(stack) = stacks.get_mut(&key) {
                            stack.pop();
                        }
                    }
                    continue;
                }
                Visit::Enter(b) => b,
            };

            let mut defs = vec![];
            for op in self.graph.get(b).ops.clone() {
                if self.store.op(op).opcode() != Opcode::MultiEqual {
                    for (slot, vn) in self.store.op(op).inputs().to_vec().into_iter().enumerate() {
                        if self.store.varnode(vn).is_free() {
                            self.rename_read(op, slot, vn, &mut stacks, &mut inputs);
                        }
                    }
                }
                if let Some(out) = self.store.op(op).output() {
                    if let Some(key) = self.heritage_key(out) {
                        if let Some(stack) = stacks.get_mut(&key) {
                            stack.push(out);
                            defs.push(key);
                        }
                    }
                }
            }

            let out_edges = self.graph.get(b).out_edges.clone();
            for e in out_edges {
                let succ = self.graph.get(e.point);
                let merges: Vec<OpId> = succ
                    .ops
                    .iter()
                    .copied()
                    .take_while(|&op| self.store.op(op).opcode() == Opcode::MultiEqual)
                    .collect();
                for m in merges {
                    let Some(vn) = self.store.op(m).input(e.reverse_index) else {
                        continue;
                    };
                    if self.store.varnode(vn).is_free() {
                        self.rename_read(m, e.reverse_index, vn, &mut stacks, &mut inputs);
                    }
                }
            }

            pushed.insert(b, defs);
            todo.push(Visit::Exit(b));
            for &child in self.graph.get(b).dom_children.iter().rev() {
                todo.push(Visit::Enter(child));
            }
        }
        inputs
    }

    /// Remove merges whose result never reaches an op other than a merge. Merges that only feed
    /// each other (around nested loops) go too.
    fn prune_merges(&mut self) -> usize {
        let merges: BTreeSet<OpId> = self
            .live_blocks()
            .flat_map(|b| self.graph.get(b).ops.clone())
            .filter(|&op| self.store.op(op).opcode() == Opcode::MultiEqual)
            .collect();

        let mut live: BTreeSet<OpId> = BTreeSet::new();
        let mut todo: Vec<OpId> = merges
            .iter()
            .copied()
            .filter(|&m| {
                self.store.op(m).output().map_or(false, |out| {
                    self.store
                        .varnode(out)
                        .uses()
                        .iter()
                        .any(|&u| self.store.op(u).opcode() != Opcode::MultiEqual)
                })
            })
            .collect();
        while let Some(m) = todo.pop() {
            if !live.insert(m) {
                continue;
            }
            for &vn in self.store.op(m).inputs() {
                if let Some(def) = self.store.varnode(vn).def() {
                    if merges.contains(&def) && !live.contains(&def) {
                        todo.push(def);
                    }
                }
            }
        }

        let mut pruned = 0;
        for op in merges.difference(&live).copied().collect::<Vec<_>>() {
            self.op_destroy(op);
            pruned += 1;
        }
        pruned
    }

    /// Convert the reachable part of the function to SSA form. Requires dominators.
    pub fn heritage(&mut self) -> HeritageSummary {
        let Some(entry) = self.graph.entry() else {
            return HeritageSummary::default();
        };
        let vars = self.collect_variables();
        trace!("Heritage variables"; "function" => &self.name, "count" => vars.len());

        let maxdepth = self.graph.iter().map(|b| b.dom_depth).max().unwrap_or(0);
        let mut queue = DepthQueue::new();
        let mut placed = 0;
        for (key, writers) in &vars {
            queue.reset(maxdepth);
            placed += self.place_merges(*key, writers, &mut queue);
        }

        let keys: BTreeSet<VarKey> = vars.keys().copied().collect();
        let inputs = self.rename(entry, &keys);
        let pruned = self.prune_merges();

        let unused: Vec<VarnodeId> = self
            .store
            .loc_order()
            .filter(|&vn| {
                let v = self.store.varnode(vn);
                v.is_free() && v.uses().is_empty()
            })
            .collect();
        for vn in unused {
            if let Err(e) = self.store.delete_varnode(vn) {
                debug!("Could not delete unused varnode"; "err" => %e);
            }
        }

        let summary = HeritageSummary {
            variables: vars.len(),
            merges: placed - pruned,
            inputs,
            pruned,
        };
        debug!("Heritage done"; "function" => &self.name, "summary" => ?summary);
        summary
    }
}
