//! The per-function IR store: owner of every [`Varnode`] and [`PcodeOp`] of a function.
//!
//! Varnodes and ops live in generation-checked arenas and refer to each other through
//! [`VarnodeId`]/[`OpId`] handles. The store keeps three views consistent with the arenas:
//!
//! - varnodes ordered location-then-definition (lookup by address, used by SSA construction),
//! - varnodes ordered definition-then-location,
//! - ops in program order (alive ops), plus a dead list and a list of destroyed ops.
//!
//! Every op is in exactly one of {alive, dead, destroyed}. All mutation of the def/use links
//! goes through the store, so that a varnode's `uses` always matches the input arrays of the ops
//! reading it.

use crate::arena::{Arena, Id};
use crate::block::BlockId;
use crate::error::IrError;
use crate::il::{Address, Opcode, SeqNum, SpaceId, VarnodeData};
use crate::lattice::ValueType;

use bitflags::bitflags;
use std::collections::BTreeMap;

pub type VarnodeId = Id<Varnode>;
pub type OpId = Id<PcodeOp>;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct VarnodeFlags: u32 {
        /// An input to the function: no defining op, value on entry
        const INPUT = 0x0001;
        /// Defined by an op
        const WRITTEN = 0x0002;
        /// Refers to a code address rather than holding a value (branch and call targets)
        const ANNOTATION = 0x0004;
        /// A temporary that only carries a value between two ops
        const IMPLIED = 0x0008;
        /// A program variable that should survive into the output
        const EXPLICIT = 0x0010;
        const READONLY = 0x0020;
        /// Scratch mark for passes; must be cleared by the pass that sets it
        const MARK = 0x0040;
        /// Lives in the constant space
        const CONSTANT = 0x0080;
    }
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct OpFlags: u32 {
        /// First op of a basic block
        const START_BLOCK = 0x0001;
        /// Ends a basic block
        const BRANCH = 0x0002;
        const CALL = 0x0004;
        const RETURNS = 0x0008;
        const NO_COLLAPSE = 0x0010;
        /// On the dead list rather than in program order
        const DEAD = 0x0020;
        /// Synthesized by a pass (merges, indirect effects)
        const MARKER = 0x0040;
        const BOOL_OUTPUT = 0x0080;
        /// First op of a machine instruction
        const START_MARK = 0x0100;
        const MARK = 0x0200;
        /// Control leaves the function
        const EXIT = 0x0400;
    }
}

/// A storage location at a point in the program
#[derive(Clone, Debug)]
pub struct Varnode {
    loc: Address,
    size: u32,
    pub flags: VarnodeFlags,
    def: Option<OpId>,
    uses: Vec<OpId>,
    /// Current lattice value, maintained by constant propagation
    pub value: ValueType,
    create_index: u32,
}

impl Varnode {
    pub fn loc(&self) -> Address {
        self.loc
    }
    pub fn size(&self) -> u32 {
        self.size
    }
    pub fn data(&self) -> VarnodeData {
        VarnodeData::new(self.loc.space, self.loc.offset, self.size)
    }
    /// The defining op. `None` for inputs, constants and not-yet-renamed reads.
    pub fn def(&self) -> Option<OpId> {
        self.def
    }
    /// Reading ops, one entry per input slot
    pub fn uses(&self) -> &[OpId] {
        &self.uses
    }
    pub fn create_index(&self) -> u32 {
        self.create_index
    }
    pub fn is_constant(&self) -> bool {
        self.flags.contains(VarnodeFlags::CONSTANT)
    }
    pub fn is_input(&self) -> bool {
        self.flags.contains(VarnodeFlags::INPUT)
    }
    pub fn is_written(&self) -> bool {
        self.flags.contains(VarnodeFlags::WRITTEN)
    }
    pub fn is_annotation(&self) -> bool {
        self.flags.contains(VarnodeFlags::ANNOTATION)
    }
    /// Neither an input, nor written, nor a constant
    pub fn is_free(&self) -> bool {
        !self
            .flags
            .intersects(VarnodeFlags::INPUT | VarnodeFlags::WRITTEN | VarnodeFlags::CONSTANT)
    }
    /// The constant held, if this lives in the constant space
    pub fn constant_value(&self) -> Option<u64> {
        self.is_constant().then(|| self.loc.offset)
    }
}

/// One primitive step of the IR
#[derive(Clone, Debug)]
pub struct PcodeOp {
    opcode: Opcode,
    seq: SeqNum,
    inputs: Vec<VarnodeId>,
    output: Option<VarnodeId>,
    parent: Option<BlockId>,
    pub flags: OpFlags,
}

impl PcodeOp {
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }
    pub fn seq(&self) -> SeqNum {
        self.seq
    }
    pub fn addr(&self) -> Address {
        self.seq.addr
    }
    pub fn inputs(&self) -> &[VarnodeId] {
        &self.inputs
    }
    pub fn input(&self, slot: usize) -> Option<VarnodeId> {
        self.inputs.get(slot).copied()
    }
    pub fn output(&self) -> Option<VarnodeId> {
        self.output
    }
    /// The basic block holding this op, once blocks are generated
    pub fn parent(&self) -> Option<BlockId> {
        self.parent
    }
    pub fn is_dead(&self) -> bool {
        self.flags.contains(OpFlags::DEAD)
    }
}

/// Diagnostic record of an op that no longer exists
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DestroyedOp {
    pub seq: SeqNum,
    pub opcode: Opcode,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
enum DefPos {
    Input,
    Written(SeqNum),
    Free,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
struct LocKey {
    loc: Address,
    size: u32,
    def: DefPos,
    create_index: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
struct DefKey {
    def: DefPos,
    loc: Address,
    size: u32,
    create_index: u32,
}

#[derive(Clone)]
pub struct IrStore {
    varnodes: Arena<Varnode>,
    ops: Arena<PcodeOp>,
    loc_tree: BTreeMap<LocKey, VarnodeId>,
    def_tree: BTreeMap<DefKey, VarnodeId>,
    optree: BTreeMap<SeqNum, OpId>,
    deadlist: BTreeMap<SeqNum, OpId>,
    destroyed: Vec<DestroyedOp>,
    create_index: u32,
    uniq: u32,
    const_space: SpaceId,
    unique_space: Option<SpaceId>,
    unique_offset: u64,
}

/// Offset at which temporaries allocated by passes (rather than decoders) start
const UNIQUE_BASE: u64 = 0x1000_0000;

impl IrStore {
    pub fn new(const_space: SpaceId, unique_space: Option<SpaceId>) -> Self {
        Self {
            varnodes: Arena::new(),
            ops: Arena::new(),
            loc_tree: Default::default(),
            def_tree: Default::default(),
            optree: Default::default(),
            deadlist: Default::default(),
            destroyed: vec![],
            create_index: 0,
            uniq: 0,
            const_space,
            unique_space,
            unique_offset: UNIQUE_BASE,
        }
    }

    pub fn const_space(&self) -> SpaceId {
        self.const_space
    }

    pub fn varnode(&self, vn: VarnodeId) -> &Varnode {
        &self.varnodes[vn]
    }

    pub fn try_varnode(&self, vn: VarnodeId) -> Option<&Varnode> {
        self.varnodes.get(vn)
    }

    /// Mutable access to a varnode. Only the value and flags are public; def/use links and
    /// location stay under the control of the store.
    pub fn varnode_mut(&mut self, vn: VarnodeId) -> &mut Varnode {
        &mut self.varnodes[vn]
    }

    pub fn op(&self, op: OpId) -> &PcodeOp {
        &self.ops[op]
    }

    pub fn try_op(&self, op: OpId) -> Option<&PcodeOp> {
        self.ops.get(op)
    }

    pub fn op_mut(&mut self, op: OpId) -> &mut PcodeOp {
        &mut self.ops[op]
    }

    pub fn num_varnodes(&self) -> usize {
        self.varnodes.len()
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    /// A fresh, unbound varnode
    pub fn new_varnode(&mut self, size: u32, loc: Address) -> VarnodeId {
        let flags = if loc.space == self.const_space {
            VarnodeFlags::CONSTANT
        } else {
            VarnodeFlags::empty()
        };
        let create_index = self.create_index;
        self.create_index += 1;
        let vn = self.varnodes.insert(Varnode {
            loc,
            size,
            flags,
            def: None,
            uses: vec![],
            value: ValueType::Top,
            create_index,
        });
        self.index(vn);
        vn
    }

    pub fn new_varnode_from(&mut self, data: &VarnodeData) -> VarnodeId {
        self.new_varnode(data.size, data.addr())
    }

    pub fn new_constant(&mut self, size: u32, value: u64) -> VarnodeId {
        self.new_varnode(size, Address::new(self.const_space, value))
    }

    /// A fresh temporary in the unique space
    pub fn new_unique(&mut self, size: u32) -> VarnodeId {
        let space = self
            .unique_space
            .expect("Architecture without a unique space cannot allocate temporaries");
        let loc = Address::new(space, self.unique_offset);
        self.unique_offset += (u64::from(size.max(1)) + 3) & !3;
        let vn = self.new_varnode(size, loc);
        self.varnodes[vn].flags |= VarnodeFlags::IMPLIED;
        vn
    }

    /// A sequence number at `addr` that no other op of this function has
    pub fn new_seq(&mut self, addr: Address) -> SeqNum {
        let uniq = self.uniq;
        self.uniq += 1;
        SeqNum { addr, uniq }
    }

    /// A fresh op with no inputs or output. It starts on the dead list.
    pub fn new_op(&mut self, opcode: Opcode, seq: SeqNum) -> OpId {
        let op = self.ops.insert(PcodeOp {
            opcode,
            seq,
            inputs: vec![],
            output: None,
            parent: None,
            flags: opcode_flags(opcode) | OpFlags::DEAD,
        });
        let prev = self.deadlist.insert(seq, op);
        assert!(prev.is_none(), "Duplicate sequence number {:?}", seq);
        op
    }

    pub fn set_opcode(&mut self, op: OpId, opcode: Opcode) {
        let o = &mut self.ops[op];
        let keep = o.flags
            & !(OpFlags::BRANCH
                | OpFlags::CALL
                | OpFlags::RETURNS
                | OpFlags::BOOL_OUTPUT
                | OpFlags::MARKER);
        o.opcode = opcode;
        o.flags = keep | opcode_flags(opcode);
    }

    /// Place `vn` into input `slot` of `op`, releasing whatever was there. `slot` may be one past
    /// the last input, growing the input array.
    pub fn set_input(&mut self, op: OpId, vn: VarnodeId, slot: usize) {
        let len = self.ops[op].inputs.len();
        assert!(slot <= len, "Input slot {} past end of {} inputs", slot, len);
        if slot == len {
            self.ops[op].inputs.push(vn);
        } else {
            let old = std::mem::replace(&mut self.ops[op].inputs[slot], vn);
            self.remove_use(old, op);
        }
        self.varnodes[vn].uses.push(op);
    }

    /// Insert `vn` at `slot`, shifting later inputs up
    pub fn insert_input(&mut self, op: OpId, vn: VarnodeId, slot: usize) {
        self.ops[op].inputs.insert(slot, vn);
        self.varnodes[vn].uses.push(op);
    }

    /// Remove input `slot`, shifting later inputs down, and return the released varnode
    pub fn remove_input(&mut self, op: OpId, slot: usize) -> VarnodeId {
        let old = self.ops[op].inputs.remove(slot);
        self.remove_use(old, op);
        old
    }

    fn remove_use(&mut self, vn: VarnodeId, op: OpId) {
        let uses = &mut self.varnodes[vn].uses;
        let pos = uses
            .iter()
            .position(|&u| u == op)
            .expect("Use list out of sync with op inputs");
        uses.remove(pos);
    }

    /// Make `vn` the output of `op`. Binding a varnode that already has a definition is a contract
    /// violation.
    pub fn set_output(&mut self, op: OpId, vn: VarnodeId) {
        {
            let v = &self.varnodes[vn];
            assert!(
                v.def.is_none() && !v.is_input() && !v.is_constant(),
                "Binding {:?} as output of {:?}, but it is already defined",
                vn,
                op
            );
        }
        if self.ops[op].output.is_some() {
            self.unset_output(op);
        }
        self.unindex(vn);
        let v = &mut self.varnodes[vn];
        v.def = Some(op);
        v.flags |= VarnodeFlags::WRITTEN;
        self.index(vn);
        self.ops[op].output = Some(vn);
    }

    /// Convenience: create a varnode at `data` and bind it as the output of `op`
    pub fn create_output(&mut self, op: OpId, data: &VarnodeData) -> VarnodeId {
        let vn = self.new_varnode_from(data);
        self.set_output(op, vn);
        vn
    }

    /// Release the output of `op`; the varnode becomes free
    pub fn unset_output(&mut self, op: OpId) -> Option<VarnodeId> {
        let vn = self.ops[op].output.take()?;
        self.unindex(vn);
        let v = &mut self.varnodes[vn];
        v.def = None;
        v.flags.remove(VarnodeFlags::WRITTEN);
        self.index(vn);
        Some(vn)
    }

    /// Turn a free varnode into a function input
    pub fn set_varnode_input(&mut self, vn: VarnodeId) {
        assert!(
            self.varnodes[vn].is_free(),
            "Only a free varnode can become an input"
        );
        self.unindex(vn);
        self.varnodes[vn].flags |= VarnodeFlags::INPUT;
        self.index(vn);
    }

    /// Delete a varnode. Rejected while it still has uses or a defining op.
    pub fn delete_varnode(&mut self, vn: VarnodeId) -> Result<(), IrError> {
        let v = self.varnodes.get(vn).ok_or(IrError::StaleVarnode(vn))?;
        if !v.uses.is_empty() {
            return Err(IrError::VarnodeHasUses(vn, v.uses.len()));
        }
        if v.def.is_some() {
            return Err(IrError::VarnodeIsWritten(vn));
        }
        self.unindex(vn);
        self.varnodes.remove(vn);
        Ok(())
    }

    /// Move `op` to the dead list
    pub fn mark_dead(&mut self, op: OpId) {
        let o = &mut self.ops[op];
        if o.flags.contains(OpFlags::DEAD) {
            return;
        }
        o.flags |= OpFlags::DEAD;
        let seq = o.seq;
        self.optree.remove(&seq);
        self.deadlist.insert(seq, op);
    }

    /// Move `op` from the dead list into program order
    pub fn mark_alive(&mut self, op: OpId) {
        let o = &mut self.ops[op];
        if !o.flags.contains(OpFlags::DEAD) {
            return;
        }
        o.flags.remove(OpFlags::DEAD);
        let seq = o.seq;
        self.deadlist.remove(&seq);
        self.optree.insert(seq, op);
    }

    pub(crate) fn set_parent(&mut self, op: OpId, parent: Option<BlockId>) {
        self.ops[op].parent = parent;
    }

    /// Destroy `op`: release its inputs, release (and delete, if unused) its output, and drop it
    /// from program order and the dead list. The op must already have been removed from its block.
    pub fn destroy_op(&mut self, op: OpId) {
        assert!(
            self.ops[op].parent.is_none(),
            "Destroying {:?} while it is still inside a block",
            op
        );
        while !self.ops[op].inputs.is_empty() {
            let last = self.ops[op].inputs.len() - 1;
            self.remove_input(op, last);
        }
        if let Some(out) = self.unset_output(op) {
            // Still-read outputs survive as free varnodes
            let _ = self.delete_varnode(out);
        }
        let o = self.ops.remove(op).expect("Destroying a stale op");
        self.optree.remove(&o.seq);
        self.deadlist.remove(&o.seq);
        self.destroyed.push(DestroyedOp {
            seq: o.seq,
            opcode: o.opcode,
        });
    }

    /// Alive ops, in program order
    pub fn alive_ops(&self) -> impl DoubleEndedIterator<Item = OpId> + '_ {
        self.optree.values().copied()
    }

    pub fn dead_ops(&self) -> impl Iterator<Item = OpId> + '_ {
        self.deadlist.values().copied()
    }

    pub fn destroyed_ops(&self) -> &[DestroyedOp] {
        &self.destroyed
    }

    /// First alive op emitted for the instruction at `addr`
    pub fn first_op_at(&self, addr: Address) -> Option<OpId> {
        self.optree
            .range(SeqNum { addr, uniq: 0 }..)
            .next()
            .filter(|(s, _)| s.addr == addr)
            .map(|(_, &op)| op)
    }

    /// Alive op following `op` in program order
    pub fn next_alive(&self, op: OpId) -> Option<OpId> {
        let seq = self.ops[op].seq;
        self.optree
            .range((std::ops::Bound::Excluded(seq), std::ops::Bound::Unbounded))
            .next()
            .map(|(_, &o)| o)
    }

    /// Alive op preceding `op` in program order
    pub fn prev_alive(&self, op: OpId) -> Option<OpId> {
        let seq = self.ops[op].seq;
        self.optree.range(..seq).next_back().map(|(_, &o)| o)
    }

    /// Every varnode with exactly this location and size, inputs first, then by defining op,
    /// then free varnodes
    pub fn varnodes_at(&self, loc: Address, size: u32) -> impl Iterator<Item = VarnodeId> + '_ {
        let lo = LocKey {
            loc,
            size,
            def: DefPos::Input,
            create_index: 0,
        };
        let hi = LocKey {
            loc,
            size,
            def: DefPos::Free,
            create_index: u32::MAX,
        };
        self.loc_tree.range(lo..=hi).map(|(_, &vn)| vn)
    }

    /// Varnodes with a location in `[begin, end)` of one space, in location order
    pub fn varnodes_in_range(
        &self,
        space: SpaceId,
        begin: u64,
        end: u64,
    ) -> impl Iterator<Item = VarnodeId> + '_ {
        let key = |offset| LocKey {
            loc: Address::new(space, offset),
            size: 0,
            def: DefPos::Input,
            create_index: 0,
        };
        self.loc_tree.range(key(begin)..key(end)).map(|(_, &vn)| vn)
    }

    /// All varnodes, location-then-definition
    pub fn loc_order(&self) -> impl Iterator<Item = VarnodeId> + '_ {
        self.loc_tree.values().copied()
    }

    /// All varnodes, definition-then-location
    pub fn def_order(&self) -> impl Iterator<Item = VarnodeId> + '_ {
        self.def_tree.values().copied()
    }

    fn def_pos(&self, v: &Varnode) -> DefPos {
        if v.is_input() {
            DefPos::Input
        } else if let Some(op) = v.def {
            DefPos::Written(self.ops[op].seq)
        } else {
            DefPos::Free
        }
    }

    fn keys(&self, vn: VarnodeId) -> (LocKey, DefKey) {
        let v = &self.varnodes[vn];
        let def = self.def_pos(v);
        (
            LocKey {
                loc: v.loc,
                size: v.size,
                def,
                create_index: v.create_index,
            },
            DefKey {
                def,
                loc: v.loc,
                size: v.size,
                create_index: v.create_index,
            },
        )
    }

    fn index(&mut self, vn: VarnodeId) {
        let (lk, dk) = self.keys(vn);
        self.loc_tree.insert(lk, vn);
        self.def_tree.insert(dk, vn);
    }

    fn unindex(&mut self, vn: VarnodeId) {
        let (lk, dk) = self.keys(vn);
        self.loc_tree.remove(&lk);
        self.def_tree.remove(&dk);
    }
}

fn opcode_flags(opcode: Opcode) -> OpFlags {
    let mut f = OpFlags::empty();
    if opcode.is_branch() {
        f |= OpFlags::BRANCH;
    }
    if opcode.is_call() {
        f |= OpFlags::CALL;
    }
    if opcode == Opcode::Return {
        f |= OpFlags::RETURNS | OpFlags::EXIT;
    }
    if opcode.is_bool_output() {
        f |= OpFlags::BOOL_OUTPUT;
    }
    if matches!(opcode, Opcode::MultiEqual | Opcode::Indirect) {
        f |= OpFlags::MARKER;
    }
    f
}
