//! Sparse constant propagation over the SSA graph.
//!
//! Every varnode carries a [`ValueType`]. Values start optimistic (`top`), are only ever lowered,
//! and changes are pushed along def-use edges until nothing moves. Stack-pointer derived values
//! are tracked as relative constants, which lets loads from stack slots written earlier in the
//! function be folded.

use crate::analysis_config::CONFIG;
use crate::block::BlockFlags;
use crate::funcdata::{AnalysisContext, FuncFlags, Function};
use crate::il::{calc_mask, Address, Opcode, SpaceId, SpaceKind};
use crate::image::read_value;
use crate::ir::{OpId, VarnodeId};
use crate::lattice::{evaluate, Evaluation, ValueType};
use crate::log::*;

use std::collections::{BTreeSet, VecDeque};

/// Outcome of [`propagate`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PropagationSummary {
    /// Operations evaluated, counting re-evaluations
    pub evaluations: usize,
    /// Written varnodes found to hold a constant
    pub constants: usize,
    /// Whether a relative constant was degraded inside a loop
    pub stack_unsafe: bool,
    /// Lowest offset from the entry stack pointer seen in any value
    pub stack_depth: i64,
}

fn initial_value(func: &Function, vn: VarnodeId, ctx: &AnalysisContext) -> ValueType {
    let v = func.store.varnode(vn);
    if let Some(c) = v.constant_value() {
        return ValueType::Constant(c & calc_mask(v.size()));
    }
    if !v.is_input() {
        return ValueType::Top;
    }
    let sp = &ctx.arch.sp;
    let is_register = ctx.arch.spaces.get(v.loc().space).kind == SpaceKind::Register;
    if v.loc() == sp.addr() && v.size() == sp.size
        || is_register && CONFIG.relative_bases_for_all_register_inputs
    {
        ValueType::RelConstant {
            base: v.loc(),
            offset: 0,
        }
    } else {
        ValueType::Bottom
    }
}

/// How a store through `ptr` relates to the stack slot `[offset, offset + size)`
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SlotAccess {
    /// The pointer is not known yet
    Pending,
    Disjoint,
    /// Writes exactly the slot
    Exact,
    /// May write some or all of the slot
    Clobbers,
}

fn slot_access(
    ptr: ValueType,
    sp: Address,
    offset: i64,
    size: u32,
    stored_size: u32,
) -> SlotAccess {
    match ptr {
        ValueType::Top => SlotAccess::Pending,
        ValueType::RelConstant { base, offset: o } if base == sp => {
            let overlaps = o < offset + i64::from(size) && offset < o + i64::from(stored_size);
            if !overlaps {
                SlotAccess::Disjoint
            } else if o == offset && stored_size == size {
                SlotAccess::Exact
            } else {
                SlotAccess::Clobbers
            }
        }
        // Another base may hold the entry stack pointer, and an absolute address may point into
        // the stack
        ValueType::RelConstant { .. } | ValueType::Constant(_) | ValueType::Bottom => {
            SlotAccess::Clobbers
        }
    }
}

struct Propagator<'a, 'b> {
    func: &'a mut Function,
    ctx: &'a AnalysisContext<'b>,
    queue: VecDeque<OpId>,
    queued: BTreeSet<OpId>,
    loads: Vec<OpId>,
    stores: Vec<OpId>,
    summary: PropagationSummary,
}

impl<'a, 'b> Propagator<'a, 'b> {
    fn value(&self, vn: VarnodeId) -> ValueType {
        self.func.store.varnode(vn).value
    }

    fn enqueue(&mut self, op: OpId) {
        if self.queued.insert(op) {
            self.queue.push_back(op);
        }
    }

    fn input_value(&self, op: OpId, slot: usize) -> ValueType {
        self.func
            .store
            .op(op)
            .input(slot)
            .map_or(ValueType::Bottom, |vn| self.value(vn))
    }

    fn sp_base(&self) -> Address {
        self.ctx.arch.sp.addr()
    }

    fn load_space(&self, op: OpId) -> SpaceId {
        self.func
            .store
            .op(op)
            .input(0)
            .and_then(|vn| self.func.store.varnode(vn).constant_value())
            .map_or(self.ctx.arch.code_space, |id| SpaceId(id as u8))
    }

    fn eval_load(&self, op: OpId, size: u32) -> ValueType {
        match self.input_value(op, 1) {
            ValueType::Top => ValueType::Top,
            ValueType::Constant(ptr) if CONFIG.fold_loads_from_readonly_image => {
                let space = self.load_space(op);
                let addr = Address::new(space, ptr);
                if !self.ctx.image.is_readonly(addr, size as usize) {
                    return ValueType::Bottom;
                }
                let endian = self.ctx.arch.spaces.get(space).endianness;
                match read_value(self.ctx.image, addr, size as usize, endian) {
                    Ok(v) => ValueType::Constant(v & calc_mask(size)),
                    Err(_) => ValueType::Bottom,
                }
            }
            ValueType::RelConstant { base, offset }
                if base == self.sp_base() && CONFIG.enable_stack_slot_simulation =>
            {
                self.eval_stack_load(op, offset, size)
            }
            _ => ValueType::Bottom,
        }
    }

    /// The value of the stack slot at `offset` read by `load`: the agreed value of the exact
    /// stores to that slot, provided each of them executes before the load on every path and no
    /// other store in the same space could write it
    fn eval_stack_load(&self, load: OpId, offset: i64, size: u32) -> ValueType {
        let sp = self.sp_base();
        let space = self.load_space(load);
        let mut result: Option<ValueType> = None;
        for &store in &self.stores {
            if self.load_space(store) != space {
                continue;
            }
            let stored_size = self
                .func
                .store
                .op(store)
                .input(2)
                .map_or(0, |vn| self.func.store.varnode(vn).size());
            let ptr = self.input_value(store, 1);
            match slot_access(ptr, sp, offset, size, stored_size) {
                SlotAccess::Pending => return ValueType::Top,
                SlotAccess::Disjoint => continue,
                SlotAccess::Clobbers => return ValueType::Bottom,
                SlotAccess::Exact => {
                    if !self.func.op_dominates(store, load) {
                        return ValueType::Bottom;
                    }
                    let v = self.input_value(store, 2);
                    result = Some(result.map_or(v, |r| r.meet(&v)));
                }
            }
        }
        result.unwrap_or(ValueType::Bottom)
    }

    fn eval(&self, op: OpId) -> Evaluation {
        let o = self.func.store.op(op);
        let Some(out) = o.output() else {
            return ValueType::Bottom.into();
        };
        let out_size = self.func.store.varnode(out).size();
        let Some(b) = o.parent() else {
            return ValueType::Bottom.into();
        };
        let blk = self.func.graph.get(b);
        if blk.flags.intersects(BlockFlags::DEAD | BlockFlags::BAD_DATA) {
            return ValueType::Bottom.into();
        }
        match o.opcode() {
            Opcode::MultiEqual => o
                .inputs()
                .iter()
                .fold(ValueType::Top, |acc, &vn| acc.meet(&self.value(vn)))
                .into(),
            Opcode::Load => self.eval_load(op, out_size).into(),
            Opcode::Call | Opcode::CallInd | Opcode::CallOther => ValueType::Bottom.into(),
            opcode => {
                let inputs: Vec<(ValueType, u32)> = o
                    .inputs()
                    .iter()
                    .map(|&vn| (self.value(vn), self.func.store.varnode(vn).size()))
                    .collect();
                let loop_risk = CONFIG.degrade_relative_constants_in_loops
                    && blk.flags.contains(BlockFlags::LOOP_BODY);
                evaluate(opcode, &inputs, out_size, loop_risk)
            }
        }
    }

    fn run(&mut self) {
        while let Some(op) = self.queue.pop_front() {
            self.queued.remove(&op);
            self.summary.evaluations += 1;
            let ev = self.eval(op);
            if ev.stack_unsafe {
                self.summary.stack_unsafe = true;
            }
            let Some(out) = self.func.store.op(op).output() else {
                continue;
            };
            let Some(new) = self.value(out).lowered_by(&ev.value) else {
                continue;
            };
            self.func.store.varnode_mut(out).value = new;
            for user in self.func.store.varnode(out).uses().to_vec() {
                match self.func.store.op(user).opcode() {
                    Opcode::Store => {
                        for load in self.loads.clone() {
                            self.enqueue(load);
                        }
                    }
                    _ if self.func.store.op(user).output().is_some() => self.enqueue(user),
                    _ => {}
                }
            }
        }
    }
}

/// Compute lattice values for every varnode of the reachable part of `func`. Requires SSA form.
pub fn propagate(func: &mut Function, ctx: &AnalysisContext) -> PropagationSummary {
    let all: Vec<VarnodeId> = func.store.loc_order().collect();
    for vn in all {
        let v = initial_value(func, vn, ctx);
        func.store.varnode_mut(vn).value = v;
    }

    let ops: Vec<OpId> = func
        .live_blocks()
        .flat_map(|b| func.graph.get(b).ops.clone())
        .collect();
    let mut p = Propagator {
        func: &mut *func,
        ctx,
        queue: VecDeque::new(),
        queued: BTreeSet::new(),
        loads: vec![],
        stores: vec![],
        summary: PropagationSummary::default(),
    };
    for &op in &ops {
        match p.func.store.op(op).opcode() {
            Opcode::Load => p.loads.push(op),
            Opcode::Store => p.stores.push(op),
            _ => {}
        }
        if p.func.store.op(op).output().is_some() {
            p.enqueue(op);
        }
    }
    p.run();

    let mut summary = p.summary;
    let sp = p.sp_base();
    for vn in func.store.loc_order() {
        let v = func.store.varnode(vn);
        match v.value {
            ValueType::Constant(_) if v.is_written() => summary.constants += 1,
            ValueType::RelConstant { base, offset } if base == sp => {
                summary.stack_depth = summary.stack_depth.min(offset)
            }
            _ => {}
        }
    }
    if summary.stack_unsafe {
        func.flags |= FuncFlags::STACK_UNSAFE;
    }
    func.stack_depth = summary.stack_depth;
    debug!("Constant propagation done"; "function" => &func.name, "summary" => ?summary);
    summary
}

impl Function {
    pub fn constant_propagation(&mut self, ctx: &AnalysisContext) -> PropagationSummary {
        propagate(self, ctx)
    }
}
