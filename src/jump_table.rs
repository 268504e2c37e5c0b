//! Recovery of the jump tables behind indirect branches.
//!
//! Recognised shape, after stripping copies and extensions:
//!
//! ```text
//! BRANCHIND (LOAD (INT_ADD base (INT_MULT idx scale)))
//! ```
//!
//! with `base` a constant (possibly loaded from a read-only literal pool) and `scale` given by a
//! multiplication or a left shift. The number of entries comes from a guard `CBRANCH` on `idx`
//! dominating the branch, whose other edge becomes the default, or otherwise from a mask
//! `INT_AND idx m` bounding the index to `m + 1` entries.

use crate::block::BlockId;
use crate::funcdata::{AnalysisContext, Function};
use crate::il::{Address, Opcode, SeqNum, SpaceId};
use crate::image::read_value;
use crate::ir::{OpId, VarnodeId};
use crate::log::*;

use thiserror::Error;

/// A recovered table of branch targets
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JumpTable {
    /// The indirect branch this table resolves
    pub op_seq: SeqNum,
    pub op_addr: Address,
    /// Targets, one per table entry, followed by the default target if there is one
    pub addresses: Vec<Address>,
    /// Position of the default target within `addresses`
    pub default_index: Option<usize>,
    /// Largest index admitted by the bound
    pub last_index: u64,
    /// Number of table entries
    pub size: usize,
    /// Address of entry 0
    pub table_addr: Address,
    /// Size of one entry, in bytes
    pub entry_size: u32,
}

/// Why an indirect branch could not be resolved
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecoveryFailure {
    #[error("{0:?} is not an indirect branch")]
    NotIndirect(OpId),
    #[error("branch destination is not loaded from memory")]
    NoTableLoad,
    #[error("table address is not base + index * scale")]
    UnrecognizedAddress,
    #[error("no guard or mask bounds the index")]
    Unbounded,
    #[error("table of {0} entries exceeds the limit")]
    TooLarge(u64),
    #[error("could not read entry at {0:?}")]
    Unreadable(Address),
    #[error("entry points to {0:?}, which is not code")]
    TargetNotCode(Address),
}

struct Bound {
    size: u64,
    default: Option<Address>,
}

/// Skip over copies and extensions defining `vn`
fn strip_extensions(func: &Function, mut vn: VarnodeId) -> VarnodeId {
    while let Some(def) = func.def_op(vn) {
        let op = func.store.op(def);
        match (op.opcode(), op.input(0)) {
            (Opcode::Copy | Opcode::IntZext | Opcode::IntSext, Some(inp)) => vn = inp,
            _ => break,
        }
    }
    vn
}

fn constant_of(func: &Function, vn: VarnodeId) -> Option<u64> {
    func.store.varnode(vn).value.as_constant()
}

/// The index varnode and every varnode it was copied or extended from
fn alias_chain(func: &Function, idx: VarnodeId) -> Vec<VarnodeId> {
    let mut chain = vec![idx];
    let mut vn = idx;
    while let Some(def) = func.def_op(vn) {
        let op = func.store.op(def);
        match (op.opcode(), op.input(0)) {
            (Opcode::Copy | Opcode::IntZext | Opcode::IntSext, Some(inp)) => {
                chain.push(inp);
                vn = inp;
            }
            _ => break,
        }
    }
    chain
}

/// Split `ptr` into `(base, index, scale)`
fn match_table_address(func: &Function, ptr: VarnodeId) -> Option<(u64, VarnodeId, u64)> {
    let add = func.store.op(func.def_op(ptr)?);
    if add.opcode() != Opcode::IntAdd {
        return None;
    }
    let (a, b) = (add.input(0)?, add.input(1)?);
    let (base, scaled) = match (constant_of(func, a), constant_of(func, b)) {
        (Some(c), None) => (c, b),
        (None, Some(c)) => (c, a),
        _ => return None,
    };
    let Some(def) = func.def_op(scaled) else {
        return Some((base, scaled, 1));
    };
    let op = func.store.op(def);
    let factor = op.input(1).and_then(|vn| constant_of(func, vn));
    match (op.opcode(), op.input(0), factor) {
        (Opcode::IntMult, Some(idx), Some(scale)) => Some((base, idx, scale)),
        (Opcode::IntLeft, Some(idx), Some(shift)) if shift < 64 => Some((base, idx, 1 << shift)),
        _ => Some((base, scaled, 1)),
    }
}

/// Bound the index from a conditional branch dominating `switch`
fn guard_bound(func: &Function, switch: BlockId, chain: &[VarnodeId]) -> Option<Bound> {
    let mut cur = switch;
    while let Some(dom) = func.graph.get(cur).immed_dom {
        cur = dom;
        let blk = func.graph.get(dom);
        let Some(last) = blk.last_op() else {
            continue;
        };
        let cbranch = func.store.op(last);
        if cbranch.opcode() != Opcode::Cbranch || blk.out_edges.len() != 2 {
            continue;
        }
        let Some(mut cond) = cbranch.input(1) else {
            continue;
        };
        let mut negated = false;
        while let Some(def) = func.def_op(cond) {
            let op = func.store.op(def);
            match (op.opcode(), op.input(0)) {
                (Opcode::BoolNegate, Some(inp)) => {
                    negated = !negated;
                    cond = inp;
                }
                _ => break,
            }
        }
        let Some(cmp) = func.def_op(cond).map(|op| func.store.op(op)) else {
            continue;
        };
        let inclusive = match cmp.opcode() {
            Opcode::IntLess => false,
            Opcode::IntLessEqual => true,
            _ => continue,
        };
        let (Some(l), Some(r)) = (cmp.input(0), cmp.input(1)) else {
            continue;
        };
        let index_on_left = if chain.contains(&l) {
            true
        } else if chain.contains(&r) {
            false
        } else {
            continue;
        };
        let Some(c) = constant_of(func, if index_on_left { r } else { l }) else {
            continue;
        };

        let leads_to_switch =
            |slot: usize| func.graph.dominates(blk.out_edges[slot].point, switch);
        // out[0] is the fallthrough (condition false), out[1] the taken edge
        let (switch_slot, other_slot) = match (leads_to_switch(0), leads_to_switch(1)) {
            (false, true) => (1, 0),
            (true, false) => (0, 1),
            _ => continue,
        };
        let holds = (switch_slot == 1) != negated;
        let size = match (index_on_left, inclusive, holds) {
            (true, false, true) => c,
            (true, true, true) => c.checked_add(1)?,
            (false, false, false) => c.checked_add(1)?,
            (false, true, false) => c,
            _ => continue,
        };
        let default = func.graph.get(blk.out_edges[other_slot].point).start;
        return Some(Bound { size, default });
    }
    None
}

/// Bound the index from a mask applied to it
fn mask_bound(func: &Function, chain: &[VarnodeId]) -> Option<Bound> {
    chain.iter().find_map(|&vn| {
        let op = func.store.op(func.def_op(vn)?);
        if op.opcode() != Opcode::IntAnd {
            return None;
        }
        let m = [op.input(0)?, op.input(1)?]
            .iter()
            .find_map(|&i| constant_of(func, i))?;
        Some(Bound {
            size: m.checked_add(1)?,
            default: None,
        })
    })
}

/// Recover the jump table behind the indirect branch `op` of `func`, which must be in SSA form
/// with constants propagated.
pub fn recover(
    func: &Function,
    op: OpId,
    ctx: &AnalysisContext,
) -> Result<JumpTable, RecoveryFailure> {
    let branch = func.store.op(op);
    if branch.opcode() != Opcode::BranchInd {
        return Err(RecoveryFailure::NotIndirect(op));
    }
    let switch = branch.parent().ok_or(RecoveryFailure::NotIndirect(op))?;
    let dest = branch.input(0).ok_or(RecoveryFailure::NoTableLoad)?;
    let load = func
        .def_op(strip_extensions(func, dest))
        .map(|l| func.store.op(l))
        .filter(|l| l.opcode() == Opcode::Load)
        .ok_or(RecoveryFailure::NoTableLoad)?;
    let entry_size = load
        .output()
        .map(|vn| func.store.varnode(vn).size())
        .filter(|&s| s > 0 && s <= 8)
        .ok_or(RecoveryFailure::NoTableLoad)?;
    let table_space = load
        .input(0)
        .and_then(|vn| func.store.varnode(vn).constant_value())
        .map_or(ctx.arch.code_space, |id| SpaceId(id as u8));
    let ptr = load.input(1).ok_or(RecoveryFailure::NoTableLoad)?;
    let (base, idx, scale) =
        match_table_address(func, ptr).ok_or(RecoveryFailure::UnrecognizedAddress)?;

    let chain = alias_chain(func, idx);
    let bound = guard_bound(func, switch, &chain)
        .or_else(|| mask_bound(func, &chain))
        .ok_or(RecoveryFailure::Unbounded)?;
    if bound.size == 0 || bound.size > ctx.limits.max_jump_table_size as u64 {
        return Err(RecoveryFailure::TooLarge(bound.size));
    }

    let table_addr = Address::new(table_space, base);
    let endian = ctx.arch.endian();
    let mut addresses = Vec::with_capacity(bound.size as usize + 1);
    for i in 0..bound.size {
        let entry = table_addr.add(i.wrapping_mul(scale));
        let value = read_value(ctx.image, entry, entry_size as usize, endian)
            .map_err(|_| RecoveryFailure::Unreadable(entry))?;
        let target = Address::new(ctx.arch.code_space, value);
        if !ctx.image.is_code(target) {
            return Err(RecoveryFailure::TargetNotCode(target));
        }
        addresses.push(target);
    }
    let default_index = bound.default.map(|d| {
        addresses.push(d);
        addresses.len() - 1
    });

    Ok(JumpTable {
        op_seq: branch.seq(),
        op_addr: branch.addr(),
        addresses,
        default_index,
        last_index: bound.size - 1,
        size: bound.size as usize,
        table_addr,
        entry_size,
    })
}

impl Function {
    /// Try to resolve every indirect branch found so far that has no table yet. The analysis
    /// needed to do so runs on a scratch copy of the function, so this one stays ready for more
    /// flow following. Returns the number of tables recovered; their targets are queued for flow
    /// following.
    pub fn recover_jump_tables(&mut self, ctx: &AnalysisContext) -> usize {
        let pending: Vec<OpId> = self
            .indirects
            .iter()
            .copied()
            .filter(|op| !self.unresolved.contains_key(op))
            .filter(|&op| {
                let seq = self.store.op(op).seq();
                !self.jump_tables.iter().any(|jt| jt.op_seq == seq)
            })
            .collect();
        if pending.is_empty() {
            return 0;
        }

        let mut scratch = self.clone();
        scratch.generate_blocks();
        scratch.compute_dominators();
        scratch.heritage();
        scratch.constant_propagation(ctx);

        let mut recovered = 0;
        for op in pending {
            match recover(&scratch, op, ctx) {
                Ok(jt) => {
                    info!(
                        "Recovered jump table";
                        "function" => &self.name,
                        "branch" => ?jt.op_addr,
                        "table" => ?jt.table_addr,
                        "entries" => jt.size,
                        OptionalKV(
                            "default",
                            jt.default_index.map(|i| format!("{:?}", jt.addresses[i]))
                        ),
                    );
                    for &a in &jt.addresses {
                        self.block_starts.insert(a);
                        if !self.visited.contains_key(&a) {
                            self.addrlist.push(a);
                        }
                    }
                    self.jump_tables.push(jt);
                    recovered += 1;
                }
                Err(e) => {
                    info!(
                        "Unresolved indirect branch";
                        "function" => &self.name,
                        "branch" => ?self.store.op(op).addr(),
                        "reason" => %e,
                    );
                    self.unresolved.insert(op, e);
                }
            }
        }
        recovered
    }
}
