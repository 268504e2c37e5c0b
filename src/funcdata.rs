//! The unit of analysis: one function, owning its IR store and control-flow graph.
//!
//! The analysis of a function runs in stages, each implemented in its own module:
//!
//! 1. flow following and block generation ([`crate::flow`]), interleaved with jump-table
//!    recovery ([`crate::jump_table`]) until no new code is discovered,
//! 2. dominators ([`crate::dominators`]),
//! 3. SSA construction ([`crate::heritage`]),
//! 4. constant propagation ([`crate::constant_propagation`]).

use crate::analysis_config::CONFIG;
use crate::block::{BlockGraph, BlockId};
use crate::decoder::InstructionDecoder;
use crate::dominators::{calc_dominators, DominatorSummary};
use crate::il::{Address, Opcode, SeqNum, SpaceKind, Spaces, VarnodeData};
use crate::image::LoadImage;
use crate::ir::{IrStore, OpFlags, OpId, VarnodeId};
use crate::jump_table::{JumpTable, RecoveryFailure};
use crate::log::*;
use crate::session::{Architecture, FuncId, Limits};

use bitflags::bitflags;
use std::collections::{BTreeMap, BTreeSet};

bitflags! {
    /// Per-function state and non-fatal conditions found during analysis
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct FuncFlags: u32 {
        const OP_GENERATED = 0x0001;
        const BLOCKS_GENERATED = 0x0002;
        /// Some blocks have no path from the entry
        const BLOCKS_UNREACHABLE = 0x0004;
        const PROCESSING_STARTED = 0x0008;
        const PROCESSING_COMPLETE = 0x0010;
        /// Nothing could be decoded at the entry point
        const NO_CODE = 0x0020;
        const UNIMPLEMENTED_PRESENT = 0x0040;
        /// Flow reached an address that is not the start of an instruction, or not code
        const BADDATA_PRESENT = 0x0080;
        /// An indirect branch could not be resolved to a jump table
        const UNRESOLVED_INDIRECT = 0x0100;
        /// A stack-relative value was adjusted inside a loop
        const STACK_UNSAFE = 0x0200;
        /// A call site refers to a function still being analysed further up the call chain
        const RECURSION_GUARD = 0x0400;
        /// Flow following stopped at the instruction limit
        const INSTRUCTION_LIMIT = 0x0800;
    }
}

/// What flow following recorded about one decoded instruction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VisitStat {
    /// Sequence number of the first op of the instruction
    pub seq: SeqNum,
    /// Length in bytes
    pub size: usize,
}

/// Link state of a call site
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallStatus {
    /// Target known, callee not looked at yet
    Unlinked,
    /// Callee analysed
    Resolved(FuncId),
    /// Callee was still being analysed when this call was found; revisited once it completes
    InProgress(FuncId),
    /// Indirect call, or a target outside of code
    Unknown,
}

/// A call made by a function
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallSpec {
    pub op: OpId,
    pub target: Option<Address>,
    pub status: CallStatus,
}

/// Everything a function's analysis needs from its session
pub struct AnalysisContext<'a> {
    pub decoder: &'a dyn InstructionDecoder,
    pub image: &'a dyn LoadImage,
    pub arch: &'a Architecture,
    pub limits: &'a Limits,
}

#[derive(Clone)]
pub struct Function {
    pub name: String,
    pub addr: Address,
    /// Size from the symbol table, 0 if unknown
    pub size: u64,
    pub flags: FuncFlags,
    pub store: IrStore,
    pub graph: BlockGraph,
    /// Instructions decoded so far, by address
    pub visited: BTreeMap<Address, VisitStat>,
    pub call_specs: Vec<CallSpec>,
    pub jump_tables: Vec<JumpTable>,
    /// Indirect branches whose table could not be recovered, with the reason
    pub unresolved: BTreeMap<OpId, RecoveryFailure>,
    /// Addresses where flow ran into bad data
    pub bad_addrs: BTreeSet<Address>,
    /// Lowest stack-pointer offset observed by constant propagation
    pub stack_depth: i64,
    pub(crate) addrlist: Vec<Address>,
    /// Addresses whose first op must start a block
    pub(crate) block_starts: BTreeSet<Address>,
    /// Indirect branches found by flow following
    pub(crate) indirects: Vec<OpId>,
    pub(crate) inst_count: usize,
    pub(crate) inst_max: usize,
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("flags", &self.flags)
            .field("blocks", &self.graph.len())
            .field("ops", &self.store.num_ops())
            .finish()
    }
}

impl Function {
    pub fn new(name: impl Into<String>, addr: Address, spaces: &Spaces, inst_max: usize) -> Self {
        Self {
            name: name.into(),
            addr,
            size: 0,
            flags: FuncFlags::empty(),
            store: IrStore::new(spaces.constant(), spaces.first_of_kind(SpaceKind::Unique)),
            graph: BlockGraph::new(),
            visited: Default::default(),
            call_specs: vec![],
            jump_tables: vec![],
            unresolved: Default::default(),
            bad_addrs: Default::default(),
            stack_depth: 0,
            addrlist: vec![],
            block_starts: Default::default(),
            indirects: vec![],
            inst_count: 0,
            inst_max,
        }
    }

    /// Convenience: a new op at `addr` with the given output and inputs, not yet in any block
    pub fn new_op(
        &mut self,
        opcode: Opcode,
        addr: Address,
        output: Option<&VarnodeData>,
        inputs: &[VarnodeData],
    ) -> OpId {
        let seq = self.store.new_seq(addr);
        let op = self.store.new_op(opcode, seq);
        for (slot, vd) in inputs.iter().enumerate() {
            let vn = self.store.new_varnode_from(vd);
            self.store.set_input(op, vn, slot);
        }
        if let Some(out) = output {
            self.store.create_output(op, out);
        }
        op
    }

    /// A copy of `op` at the same address, reading the same varnodes and writing a fresh one.
    /// Like any new op it starts on the dead list, outside of any block.
    pub fn clone_op(&mut self, op: OpId) -> OpId {
        let (opcode, addr, inputs, output) = {
            let o = self.store.op(op);
            (o.opcode(), o.addr(), o.inputs().to_vec(), o.output())
        };
        let seq = self.store.new_seq(addr);
        let new = self.store.new_op(opcode, seq);
        for (slot, vn) in inputs.into_iter().enumerate() {
            let vn = match self.store.varnode(vn).constant_value() {
                Some(c) => self.store.new_constant(self.store.varnode(vn).size(), c),
                None => vn,
            };
            self.store.set_input(new, vn, slot);
        }
        if let Some(out) = output {
            let data = self.store.varnode(out).data();
            self.store.create_output(new, &data);
        }
        new
    }

    /// Number of leading merge ops of a block
    fn num_leading_merges(&self, b: BlockId) -> usize {
        self.graph
            .get(b)
            .ops
            .iter()
            .take_while(|&&op| self.store.op(op).opcode() == Opcode::MultiEqual)
            .count()
    }

    fn op_insert(&mut self, op: OpId, b: BlockId, pos: usize) {
        assert!(
            self.store.op(op).parent().is_none(),
            "Inserting {:?} into a block twice",
            op
        );
        self.store.set_parent(op, Some(b));
        self.store.mark_alive(op);
        let ops = &mut self.graph.get_mut(b).ops;
        if pos == 0 {
            if let Some(&first) = ops.first() {
                self.store.op_mut(first).flags.remove(OpFlags::START_BLOCK);
            }
            self.store.op_mut(op).flags |= OpFlags::START_BLOCK;
        }
        ops.insert(pos, op);
    }

    /// Insert `op` at the start of `b`, after any merge ops already there
    pub fn op_insert_begin(&mut self, op: OpId, b: BlockId) {
        let pos = self.num_leading_merges(b);
        self.op_insert(op, b, pos);
    }

    /// Insert `op` at the end of `b`, before the branch ending it (if any)
    pub fn op_insert_end(&mut self, op: OpId, b: BlockId) {
        let blk = self.graph.get(b);
        let mut pos = blk.ops.len();
        if let Some(&last) = blk.ops.last() {
            if self.store.op(last).opcode().is_branch() {
                pos -= 1;
            }
        }
        self.op_insert(op, b, pos);
    }

    /// Insert `op` immediately before `follow`
    pub fn op_insert_before(&mut self, op: OpId, follow: OpId) {
        let b = self
            .store
            .op(follow)
            .parent()
            .expect("Inserting before an op that is in no block");
        let pos = self.position_in_block(follow);
        self.op_insert(op, b, pos);
    }

    /// Insert `op` immediately after `prev`
    pub fn op_insert_after(&mut self, op: OpId, prev: OpId) {
        let b = self
            .store
            .op(prev)
            .parent()
            .expect("Inserting after an op that is in no block");
        let pos = self.position_in_block(prev) + 1;
        self.op_insert(op, b, pos);
    }

    /// Remove `op` from its block, moving it to the dead list
    pub fn op_uninsert(&mut self, op: OpId) {
        if let Some(b) = self.store.op(op).parent() {
            let pos = self.position_in_block(op);
            let ops = &mut self.graph.get_mut(b).ops;
            ops.remove(pos);
            if pos == 0 {
                if let Some(&first) = ops.first() {
                    self.store.op_mut(first).flags |= OpFlags::START_BLOCK;
                }
            }
            self.store.set_parent(op, None);
        }
        self.store.mark_dead(op);
    }

    /// Remove `op` from its block and destroy it
    pub fn op_destroy(&mut self, op: OpId) {
        self.op_uninsert(op);
        self.store.destroy_op(op);
    }

    /// Index of `op` within its block
    pub fn position_in_block(&self, op: OpId) -> usize {
        let b = self.store.op(op).parent().expect("Op is in no block");
        self.graph
            .get(b)
            .ops
            .iter()
            .position(|&o| o == op)
            .expect("Block op list out of sync with op parent")
    }

    /// Whether `a` executes before `b` on every path reaching `b`
    pub fn op_dominates(&self, a: OpId, b: OpId) -> bool {
        match (self.store.op(a).parent(), self.store.op(b).parent()) {
            (Some(pa), Some(pb)) if pa == pb => {
                self.position_in_block(a) < self.position_in_block(b)
            }
            (Some(pa), Some(pb)) => self.graph.dominates(pa, pb),
            _ => false,
        }
    }

    /// The op defining `vn`, if any
    pub fn def_op(&self, vn: VarnodeId) -> Option<OpId> {
        self.store.varnode(vn).def()
    }

    pub fn compute_dominators(&mut self) -> DominatorSummary {
        let summary = calc_dominators(&mut self.graph);
        if summary.unreachable.is_empty() {
            self.flags.remove(FuncFlags::BLOCKS_UNREACHABLE);
        } else {
            self.flags |= FuncFlags::BLOCKS_UNREACHABLE;
        }
        summary
    }

    /// Follow flow from the entry, recovering jump tables behind indirect branches and following
    /// the code they lead to, until no further code is found.
    pub fn discover_flow(&mut self, ctx: &AnalysisContext) {
        if self.visited.is_empty() && self.addrlist.is_empty() {
            self.addrlist.push(self.addr);
        }
        loop {
            self.follow_flow(ctx);
            if !CONFIG.enable_jump_table_recovery
                || self.flags.contains(FuncFlags::INSTRUCTION_LIMIT)
            {
                break;
            }
            if self.recover_jump_tables(ctx) == 0 {
                break;
            }
        }
    }

    /// Everything after flow discovery: blocks, dominators, SSA and constant propagation
    pub fn finish_analysis(&mut self, ctx: &AnalysisContext) {
        self.generate_blocks();
        self.compute_dominators();
        let h = self.heritage();
        let p = self.constant_propagation(ctx);
        debug!(
            "Function analysed";
            "function" => &self.name,
            "blocks" => self.graph.len(),
            "merges" => h.merges,
            "constants" => p.constants,
            "flags" => ?self.flags,
        );
        self.flags |= FuncFlags::PROCESSING_COMPLETE;
    }

    /// Blocks reachable from the entry, in block order
    pub fn live_blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.graph.ids().filter(|b| !self.graph.get(*b).is_dead())
    }

    /// Number of merge ops in reachable blocks
    pub fn num_merges(&self) -> usize {
        self.live_blocks()
            .map(|b| self.num_leading_merges(b))
            .sum()
    }
}
