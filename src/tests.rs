use crate::block::{BlockFlags, BlockId, EdgeLabel};
use crate::decoder::EmittedOp;
use crate::funcdata::{CallStatus, FuncFlags, Function};
use crate::il::{Address, AddressSpace, Endian, Opcode, SpaceId, SpaceKind, Spaces, VarnodeData};
use crate::image::{MemoryImage, RegionKind};
use crate::ir::OpId;
use crate::jump_table::RecoveryFailure;
use crate::lattice::ValueType;
use crate::listing_lifter::{lift_from, Listing, ListingDecoder};
use crate::session::{Architecture, FuncId, Limits, Session};

const RAM: SpaceId = SpaceId(0);
const REGISTER: SpaceId = SpaceId(1);
const UNIQUE: SpaceId = SpaceId(2);
const CONSTANT: SpaceId = SpaceId(3);

/// Register `r<n>`
pub fn r(n: u64) -> VarnodeData {
    VarnodeData::new(REGISTER, 4 * n, 4)
}
pub fn sp() -> VarnodeData {
    VarnodeData::new(REGISTER, 0x34, 4)
}
pub fn lr() -> VarnodeData {
    VarnodeData::new(REGISTER, 0x38, 4)
}
pub fn u(offset: u64, size: u32) -> VarnodeData {
    VarnodeData::new(UNIQUE, offset, size)
}
pub fn c(value: u64, size: u32) -> VarnodeData {
    VarnodeData::new(CONSTANT, value, size)
}
/// A code address, as the destination of a branch or call
pub fn at(offset: u64) -> VarnodeData {
    VarnodeData::new(RAM, offset, 4)
}
/// The space input of loads and stores into `ram`
pub fn ram_id() -> VarnodeData {
    c(RAM.0 as u64, 4)
}

/// Builds small programs for a toy 32-bit little-endian target with fixed 4-byte instructions.
///
/// Spaces: `ram` (code and data), `register` (`r<n>` at offset `4n`, `sp` at 0x34, `lr` at 0x38),
/// `unique`, and the constant space.
pub struct ProgramBuilder {
    arch: Architecture,
    image: MemoryImage,
    decoder: ListingDecoder,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        let space = |name: &str, kind| AddressSpace {
            name: name.to_owned(),
            kind,
            endianness: Endian::Little,
            addr_size: 4,
        };
        let spaces = Spaces::new(vec![
            space("ram", SpaceKind::Processor),
            space("register", SpaceKind::Register),
            space("unique", SpaceKind::Unique),
        ]);
        assert_eq!(spaces.by_name("ram"), Some(RAM));
        assert_eq!(spaces.by_name("register"), Some(REGISTER));
        assert_eq!(spaces.by_name("unique"), Some(UNIQUE));
        assert_eq!(spaces.constant(), CONSTANT);
        Self {
            arch: Architecture {
                spaces,
                code_space: RAM,
                sp: sp(),
                lr: Some(lr()),
            },
            image: MemoryImage::new(RAM),
            decoder: ListingDecoder::new(),
        }
    }

    pub fn code(&mut self, start: u64, len: usize) -> &mut Self {
        self.image.add_region(start, vec![0; len], RegionKind::Code);
        self
    }
    pub fn rodata(&mut self, start: u64, bytes: Vec<u8>) -> &mut Self {
        self.image.add_region(start, bytes, RegionKind::ReadOnly);
        self
    }
    pub fn symbol(&mut self, name: &str, start: u64, size: u64) -> &mut Self {
        self.image.add_symbol(name, start, size);
        self
    }
    /// A 4-byte instruction at `offset` made of `ops`
    pub fn ins(&mut self, offset: u64, ops: Vec<EmittedOp>) -> &mut Self {
        self.decoder
            .add_instruction(Address::new(RAM, offset), 4, ops);
        self
    }

    pub fn finish(&self) -> Listing {
        Listing {
            name: "test".into(),
            arch: self.arch.clone(),
            image: self.image.clone(),
            decoder: self.decoder.clone(),
        }
    }
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub fn op(opcode: Opcode, output: Option<VarnodeData>, inputs: &[VarnodeData]) -> EmittedOp {
    EmittedOp {
        opcode,
        output,
        inputs: inputs.to_vec(),
    }
}

/// Little-endian table of 32-bit entries
pub fn table(entries: &[u32]) -> Vec<u8> {
    entries.iter().flat_map(|e| e.to_le_bytes()).collect()
}

/// `A -> B -> C`, each block ending in an unconditional branch to the next
pub fn straight_line_program() -> Listing {
    use Opcode::*;
    let mut b = ProgramBuilder::new();
    let (r0, r1, r2) = (r(0), r(1), r(2));
    let (five, one) = (c(5, 4), c(1, 4));
    let (to_b, to_c, lr) = (at(0x1008), at(0x1010), lr());
    b.code(0x1000, 0x100)
        .symbol("main", 0x1000, 0x18)
        .ins(0x1000, vec![op(Copy, Some(r0), &[five])])
        .ins(0x1004, vec![op(Branch, None, &[to_b])])
        .ins(0x1008, vec![op(IntAdd, Some(r1), &[r0, one])])
        .ins(0x100c, vec![op(Branch, None, &[to_c])])
        .ins(0x1010, vec![op(IntAdd, Some(r2), &[r1, r0])])
        .ins(0x1014, vec![op(Return, None, &[lr])]);
    b.finish()
}

/// `A -> B, A -> C, B -> D, C -> D`, with `r1` written in `B` and `C` and read in `D`
pub fn diamond_program() -> Listing {
    use Opcode::*;
    let mut b = ProgramBuilder::new();
    let (r0, r1, r2, lr) = (r(0), r(1), r(2), lr());
    let cond = u(0x10, 1);
    b.code(0x1000, 0x100)
        .symbol("main", 0x1000, 0x18)
        .ins(
            0x1000,
            vec![
                op(IntEqual, Some(cond), &[r0, c(0, 4)]),
                op(Cbranch, None, &[at(0x100c), cond]),
            ],
        )
        .ins(0x1004, vec![op(Copy, Some(r1), &[c(1, 4)])])
        .ins(0x1008, vec![op(Branch, None, &[at(0x1010)])])
        .ins(0x100c, vec![op(Copy, Some(r1), &[c(2, 4)])])
        .ins(0x1010, vec![op(Copy, Some(r2), &[r1])])
        .ins(0x1014, vec![op(Return, None, &[lr])]);
    b.finish()
}

/// `switch (r0 & 3)` over a table of four case addresses at 0x2000
pub fn masked_switch_program() -> Listing {
    masked_switch_over(3, &[0x1010, 0x1018, 0x1020, 0x1028])
}

/// `switch (r0 & mask)` over `entries`, stored at 0x2000. Each distinct entry inside the code
/// region gets a case setting `r2` to 10, 11, ... in address order.
pub fn masked_switch_over(mask: u64, entries: &[u32]) -> Listing {
    use Opcode::*;
    let mut b = ProgramBuilder::new();
    let (r0, r1, r2, lr) = (r(0), r(1), r(2), lr());
    let (scaled, ptr, target) = (u(0x10, 4), u(0x14, 4), u(0x18, 4));
    b.code(0x1000, 0x100)
        .rodata(0x2000, table(entries))
        .symbol("main", 0x1000, 0x30)
        .ins(0x1000, vec![op(IntAnd, Some(r1), &[r0, c(mask, 4)])])
        .ins(
            0x1004,
            vec![
                op(IntMult, Some(scaled), &[r1, c(4, 4)]),
                op(IntAdd, Some(ptr), &[c(0x2000, 4), scaled]),
                op(Load, Some(target), &[ram_id(), ptr]),
                op(BranchInd, None, &[target]),
            ],
        );
    let mut cases: Vec<u64> = entries
        .iter()
        .map(|&e| u64::from(e))
        .filter(|e| (0x1010..0x1100).contains(e))
        .collect();
    cases.sort_unstable();
    cases.dedup();
    for (i, case) in cases.into_iter().enumerate() {
        b.ins(case, vec![op(Copy, Some(r2), &[c(10 + i as u64, 4)])])
            .ins(case + 4, vec![op(Return, None, &[lr])]);
    }
    b.finish()
}

/// `if (r0 < 3) switch (r0) { ... } else r2 = 0xff`, with the table at 0x2000
pub fn guarded_switch_program() -> Listing {
    use Opcode::*;
    let mut b = ProgramBuilder::new();
    let (r0, r2, lr) = (r(0), r(2), lr());
    let cond = u(0x20, 1);
    let (scaled, ptr, target) = (u(0x10, 4), u(0x14, 4), u(0x18, 4));
    b.code(0x1000, 0x100)
        .rodata(0x2000, table(&[0x1010, 0x1018, 0x1020]))
        .symbol("main", 0x1000, 0x30)
        .ins(
            0x1000,
            vec![
                op(IntLess, Some(cond), &[r0, c(3, 4)]),
                op(Cbranch, None, &[at(0x100c), cond]),
            ],
        )
        .ins(0x1004, vec![op(Copy, Some(r2), &[c(0xff, 4)])])
        .ins(0x1008, vec![op(Return, None, &[lr])])
        .ins(
            0x100c,
            vec![
                op(IntMult, Some(scaled), &[r0, c(4, 4)]),
                op(IntAdd, Some(ptr), &[c(0x2000, 4), scaled]),
                op(Load, Some(target), &[ram_id(), ptr]),
                op(BranchInd, None, &[target]),
            ],
        );
    for (i, case) in [0x1010, 0x1018, 0x1020].into_iter().enumerate() {
        b.ins(case, vec![op(Copy, Some(r2), &[c(i as u64, 4)])])
            .ins(case + 4, vec![op(Return, None, &[lr])]);
    }
    b.finish()
}

/// Stack pointer arithmetic, and a store to a stack slot read back later
pub fn stack_program() -> Listing {
    use Opcode::*;
    let mut b = ProgramBuilder::new();
    let (r1, r2, r3, r4, r5, r6) = (r(1), r(2), r(3), r(4), r(5), r(6));
    let (sp, lr) = (sp(), lr());
    b.code(0x1000, 0x100)
        .symbol("main", 0x1000, 0x20)
        .ins(0x1000, vec![op(IntAdd, Some(r1), &[sp, c(16, 4)])])
        .ins(0x1004, vec![op(IntAdd, Some(r2), &[r4, c(4, 4)])])
        .ins(0x1008, vec![op(IntSub, Some(r3), &[r1, r2])])
        .ins(0x100c, vec![op(IntSub, Some(r5), &[r1, sp])])
        .ins(0x1010, vec![op(IntSub, Some(sp), &[sp, c(8, 4)])])
        .ins(0x1014, vec![op(Store, None, &[ram_id(), sp, c(42, 4)])])
        .ins(0x1018, vec![op(Load, Some(r6), &[ram_id(), sp])])
        .ins(0x101c, vec![op(Return, None, &[lr])]);
    b.finish()
}

/// A counting loop that also pushes onto the stack on every iteration
pub fn loop_program() -> Listing {
    use Opcode::*;
    let mut b = ProgramBuilder::new();
    let (r0, sp, lr) = (r(0), sp(), lr());
    let cond = u(0x10, 1);
    b.code(0x1000, 0x100)
        .symbol("main", 0x1000, 0x14)
        .ins(0x1000, vec![op(Copy, Some(r0), &[c(0, 4)])])
        .ins(0x1004, vec![op(IntAdd, Some(r0), &[r0, c(1, 4)])])
        .ins(0x1008, vec![op(IntSub, Some(sp), &[sp, c(4, 4)])])
        .ins(
            0x100c,
            vec![
                op(IntLess, Some(cond), &[r0, c(10, 4)]),
                op(Cbranch, None, &[at(0x1004), cond]),
            ],
        )
        .ins(0x1010, vec![op(Return, None, &[lr])]);
    b.finish()
}

/// The function entry is also the head of a loop: `do { r2 = r1; r1 = 7; } while (r0 != 0)`
pub fn entry_self_loop_program() -> Listing {
    use Opcode::*;
    let mut b = ProgramBuilder::new();
    let (r0, r1, r2, lr) = (r(0), r(1), r(2), lr());
    let cond = u(0x10, 1);
    b.code(0x1000, 0x100)
        .symbol("main", 0x1000, 0x10)
        .ins(0x1000, vec![op(Copy, Some(r2), &[r1])])
        .ins(0x1004, vec![op(Copy, Some(r1), &[c(7, 4)])])
        .ins(
            0x1008,
            vec![
                op(IntNotEqual, Some(cond), &[r0, c(0, 4)]),
                op(Cbranch, None, &[at(0x1000), cond]),
            ],
        )
        .ins(0x100c, vec![op(Return, None, &[lr])]);
    b.finish()
}

/// `E -> B -> E`: the entry reads `r1`, and the block it loops through writes it
pub fn entry_loop_program() -> Listing {
    use Opcode::*;
    let mut b = ProgramBuilder::new();
    let (r0, r1, r2, lr) = (r(0), r(1), r(2), lr());
    let cond = u(0x10, 1);
    b.code(0x1000, 0x100)
        .symbol("main", 0x1000, 0x10)
        .ins(0x1000, vec![op(Copy, Some(r2), &[r1])])
        .ins(
            0x1004,
            vec![
                op(IntEqual, Some(cond), &[r0, c(0, 4)]),
                op(Cbranch, None, &[at(0x100c), cond]),
            ],
        )
        .ins(
            0x1008,
            vec![op(Copy, Some(r1), &[c(7, 4)]), op(Branch, None, &[at(0x1000)])],
        )
        .ins(0x100c, vec![op(Return, None, &[lr])]);
    b.finish()
}

/// Nested loops writing `r1` in the inner body; `r1` is only read before the loops
pub fn nested_loop_program() -> Listing {
    use Opcode::*;
    let mut b = ProgramBuilder::new();
    let (r0, r1, r2, r3, lr) = (r(0), r(1), r(2), r(3), lr());
    let (inner, outer) = (u(0x10, 1), u(0x11, 1));
    b.code(0x1000, 0x100)
        .symbol("main", 0x1000, 0x1c)
        .ins(0x1000, vec![op(Copy, Some(r2), &[r1])])
        .ins(0x1004, vec![op(Copy, Some(r3), &[r0])])
        .ins(
            0x1008,
            vec![
                op(IntEqual, Some(inner), &[r0, c(1, 4)]),
                op(Cbranch, None, &[at(0x1014), inner]),
            ],
        )
        .ins(0x100c, vec![op(Copy, Some(r1), &[c(7, 4)])])
        .ins(0x1010, vec![op(Branch, None, &[at(0x1008)])])
        .ins(
            0x1014,
            vec![
                op(IntEqual, Some(outer), &[r0, c(2, 4)]),
                op(Cbranch, None, &[at(0x1004), outer]),
            ],
        )
        .ins(0x1018, vec![op(Return, None, &[lr])]);
    b.finish()
}

/// A relative branch whose target lies before the start of its own instruction
pub fn relative_branch_out_of_instruction_program() -> Listing {
    use Opcode::*;
    let mut b = ProgramBuilder::new();
    let (r0, r1, lr) = (r(0), r(1), lr());
    let cond = u(0x10, 1);
    b.code(0x1000, 0x20)
        .symbol("main", 0x1000, 0xc)
        .ins(0x1000, vec![op(Copy, Some(r1), &[c(1, 4)])])
        .ins(
            0x1004,
            vec![
                op(IntNotEqual, Some(cond), &[r0, c(0, 4)]),
                // Two ops back: one before the instruction
                op(Cbranch, None, &[c(0xffff_fffe, 4), cond]),
            ],
        )
        .ins(0x1008, vec![op(Return, None, &[lr])]);
    b.finish()
}

/// Stores `42` to a stack slot, then `5` through an absolute address, then reads the slot
pub fn stack_store_through_absolute_program() -> Listing {
    use Opcode::*;
    let mut b = ProgramBuilder::new();
    let (r6, sp, lr) = (r(6), sp(), lr());
    b.code(0x1000, 0x100)
        .symbol("main", 0x1000, 0x14)
        .ins(0x1000, vec![op(IntSub, Some(sp), &[sp, c(8, 4)])])
        .ins(0x1004, vec![op(Store, None, &[ram_id(), sp, c(42, 4)])])
        .ins(0x1008, vec![op(Store, None, &[ram_id(), c(0x3000, 4), c(5, 4)])])
        .ins(0x100c, vec![op(Load, Some(r6), &[ram_id(), sp])])
        .ins(0x1010, vec![op(Return, None, &[lr])]);
    b.finish()
}

/// A conditional branch into the middle of an instruction, and a branch out of code
pub fn bad_data_program() -> Listing {
    use Opcode::*;
    let mut b = ProgramBuilder::new();
    let (r0, r1, lr) = (r(0), r(1), lr());
    let (c0, c1) = (u(0x10, 1), u(0x11, 1));
    b.code(0x1000, 0x20)
        .symbol("main", 0x1000, 0x10)
        .ins(
            0x1000,
            vec![
                op(IntEqual, Some(c0), &[r0, c(0, 4)]),
                op(Cbranch, None, &[at(0x1006), c0]),
            ],
        )
        .ins(
            0x1004,
            vec![
                op(IntEqual, Some(c1), &[r0, c(1, 4)]),
                op(Cbranch, None, &[at(0x5000), c1]),
            ],
        )
        .ins(0x1008, vec![op(Copy, Some(r1), &[c(1, 4)])])
        .ins(0x100c, vec![op(Return, None, &[lr])]);
    b.finish()
}

/// A conditional move expressed with a relative branch inside one instruction
pub fn relative_branch_program() -> Listing {
    use Opcode::*;
    let mut b = ProgramBuilder::new();
    let (r0, r1, r2, lr) = (r(0), r(1), r(2), lr());
    let skip = u(0x10, 1);
    b.code(0x1000, 0x20)
        .symbol("main", 0x1000, 0x8)
        .ins(
            0x1000,
            vec![
                op(IntNotEqual, Some(skip), &[r0, c(0, 4)]),
                op(Cbranch, None, &[c(2, 4), skip]),
                op(Copy, Some(r1), &[c(7, 4)]),
            ],
        )
        .ins(
            0x1004,
            vec![op(Copy, Some(r2), &[r1]), op(Return, None, &[lr])],
        );
    b.finish()
}

/// `main` and `f` call each other; `g` is reached only through a call from `f`
pub fn mutual_recursion_program() -> Listing {
    use Opcode::*;
    let mut b = ProgramBuilder::new();
    let lr = lr();
    b.code(0x1000, 0x100)
        .symbol("main", 0x1000, 0x8)
        .symbol("f", 0x1010, 0x10)
        .ins(0x1000, vec![op(Call, None, &[at(0x1010)])])
        .ins(0x1004, vec![op(Return, None, &[lr])])
        .ins(0x1010, vec![op(Call, None, &[at(0x1000)])])
        .ins(0x1014, vec![op(Call, None, &[at(0x1020)])])
        .ins(0x1018, vec![op(Return, None, &[lr])])
        .ins(0x1020, vec![op(Return, None, &[lr])]);
    b.finish()
}

pub fn analyzed(listing: Listing, name: &str) -> (Session, FuncId) {
    analyzed_with_limits(listing, name, Limits::default())
}

pub fn analyzed_with_limits(listing: Listing, name: &str, limits: Limits) -> (Session, FuncId) {
    let mut session = listing.into_session(limits);
    let id = session.find_func_by_name(name).unwrap();
    session.analyze(id);
    (session, id)
}

/// The block holding the first op of the instruction at `offset`
pub fn block_at(func: &Function, offset: u64) -> BlockId {
    let addr = Address::new(func.addr.space, offset);
    let op = func.store.first_op_at(addr).unwrap();
    func.store.op(op).parent().unwrap()
}

/// Output value of the first op at `offset` that has an output
pub fn value_at(func: &Function, offset: u64) -> ValueType {
    output_op_at(func, offset)
        .and_then(|op| func.store.op(op).output())
        .map(|vn| func.store.varnode(vn).value)
        .unwrap()
}

fn output_op_at(func: &Function, offset: u64) -> Option<OpId> {
    let addr = Address::new(func.addr.space, offset);
    func.store
        .alive_ops()
        .filter(|&op| func.store.op(op).addr() == addr)
        .find(|&op| func.store.op(op).output().is_some())
}

/// Every value read in a reachable block has one definition (or is an input or constant), and
/// that definition dominates the read
#[cfg(test)]
fn assert_ssa_form(func: &Function) {
    use std::collections::BTreeSet;
    let mut outputs = BTreeSet::new();
    for b in func.live_blocks() {
        let blk = func.graph.get(b);
        for &op in &blk.ops {
            let o = func.store.op(op);
            assert_eq!(o.parent(), Some(b));
            if let Some(out) = o.output() {
                assert!(outputs.insert(out), "{:?} written twice", out);
                assert_eq!(func.store.varnode(out).def(), Some(op));
            }
            for (slot, &vn) in o.inputs().iter().enumerate() {
                let v = func.store.varnode(vn);
                assert!(v.uses().contains(&op));
                if v.is_constant() || v.is_annotation() || v.is_input() {
                    continue;
                }
                if o.opcode() == Opcode::MultiEqual
                    && func.graph.get(blk.in_edges[slot].point).is_dead()
                {
                    // Left as a placeholder
                    continue;
                }
                let def = v
                    .def()
                    .unwrap_or_else(|| panic!("{:?} read by {:?} is not renamed", vn, o.seq()));
                if o.opcode() == Opcode::MultiEqual {
                    let pred = blk.in_edges[slot].point;
                    let def_block = func.store.op(def).parent().unwrap();
                    assert!(func.graph.dominates(def_block, pred));
                } else {
                    assert!(func.op_dominates(def, op), "{:?} does not dominate its use", def);
                }
            }
        }
    }
}

/// Edge consistency: every block without successors ends in a return, an unresolved indirect
/// branch or bad data; edge labels agree in both directions
#[cfg(test)]
fn assert_cfg_consistent(func: &Function) {
    for blk in func.graph.iter() {
        for (i, e) in blk.out_edges.iter().enumerate() {
            let back = func.graph.get(e.point).in_edges[e.reverse_index];
            assert_eq!(back.point, blk.index);
            assert_eq!(back.reverse_index, i);
            assert_eq!(back.label, e.label);
        }
        if blk.out_edges.is_empty() {
            let last = func.store.op(blk.last_op().unwrap()).opcode();
            assert!(
                last == Opcode::Return
                    || (last == Opcode::BranchInd
                        && blk.flags.contains(BlockFlags::UNREACHABLE_RISK))
                    || blk.flags.contains(BlockFlags::BAD_DATA),
                "{:?} has no successors but ends in {}",
                blk.index,
                last
            );
        }
    }
}

#[test]
fn straight_line_dominators_and_constants() {
    let (session, id) = analyzed(straight_line_program(), "main");
    let func = session.function(id).unwrap();
    assert_eq!(func.graph.len(), 3);
    let (a, b, c) = (block_at(func, 0x1000), block_at(func, 0x1008), block_at(func, 0x1010));
    assert_eq!(func.graph.entry(), Some(a));
    assert_eq!(func.graph.get(a).immed_dom, None);
    assert_eq!(func.graph.get(b).immed_dom, Some(a));
    assert_eq!(func.graph.get(c).immed_dom, Some(b));
    assert_eq!(func.graph.get(c).dom_depth, 2);
    assert_eq!(func.num_merges(), 0);
    assert!(func.graph.get(c).flags.contains(BlockFlags::RETURN));

    assert_eq!(value_at(func, 0x1008), ValueType::Constant(6));
    assert_eq!(value_at(func, 0x1010), ValueType::Constant(11));
    assert!(func.flags.contains(FuncFlags::PROCESSING_COMPLETE));
    assert!(!func.flags.contains(FuncFlags::BLOCKS_UNREACHABLE));
    assert_ssa_form(func);
    assert_cfg_consistent(func);
}

#[test]
fn diamond_places_one_merge() {
    let (session, id) = analyzed(diamond_program(), "main");
    let func = session.function(id).unwrap();
    let (a, bb, c, d) = (
        block_at(func, 0x1000),
        block_at(func, 0x1004),
        block_at(func, 0x100c),
        block_at(func, 0x1010),
    );
    // out[0] is the fallthrough, out[1] the taken branch
    let succs: Vec<BlockId> = func.graph.get(a).successors().collect();
    assert_eq!(succs, vec![bb, c]);
    assert_eq!(func.graph.get(d).immed_dom, Some(a));
    assert_eq!(func.graph.get(bb).frontier, vec![d]);
    assert_eq!(func.num_merges(), 1);

    let merge = func.graph.get(d).ops[0];
    let m = func.store.op(merge);
    assert_eq!(m.opcode(), Opcode::MultiEqual);
    assert_eq!(m.inputs().len(), 2);
    for (slot, &vn) in m.inputs().iter().enumerate() {
        let def = func.def_op(vn).unwrap();
        assert_eq!(
            func.store.op(def).parent(),
            Some(func.graph.get(d).in_edges[slot].point)
        );
    }
    let values: Vec<ValueType> = m
        .inputs()
        .iter()
        .map(|&vn| func.store.varnode(vn).value)
        .collect();
    let expected = if func.graph.get(d).in_edges[0].point == bb {
        vec![ValueType::Constant(1), ValueType::Constant(2)]
    } else {
        vec![ValueType::Constant(2), ValueType::Constant(1)]
    };
    assert_eq!(values, expected);
    assert_eq!(value_at(func, 0x1010), ValueType::Bottom);
    assert_ssa_form(func);
    assert_cfg_consistent(func);
}

#[test]
fn masked_switch_has_four_cases_and_no_default() {
    let (session, id) = analyzed(masked_switch_program(), "main");
    let func = session.function(id).unwrap();
    assert_eq!(func.jump_tables.len(), 1);
    let jt = &func.jump_tables[0];
    assert_eq!(jt.size, 4);
    assert_eq!(jt.default_index, None);
    assert_eq!(jt.last_index, 3);
    assert_eq!(jt.entry_size, 4);
    assert_eq!(jt.table_addr, Address::new(func.addr.space, 0x2000));

    let switch = block_at(func, 0x1000);
    let blk = func.graph.get(switch);
    assert_eq!(blk.jump_table, Some(0));
    assert_eq!(blk.out_edges.len(), 4);
    assert!(blk
        .out_edges
        .iter()
        .all(|e| !e.label.contains(EdgeLabel::SWITCH_DEFAULT)));
    for case in [0x1010, 0x1018, 0x1020, 0x1028] {
        let cb = block_at(func, case);
        assert!(func.graph.get(cb).flags.contains(BlockFlags::SWITCH_CASE));
        assert_eq!(func.graph.get(cb).immed_dom, Some(switch));
    }
    assert!(!func.flags.contains(FuncFlags::UNRESOLVED_INDIRECT));
    assert_eq!(value_at(func, 0x1018), ValueType::Constant(11));
    assert_ssa_form(func);
    assert_cfg_consistent(func);
}

#[test]
fn guarded_switch_gets_a_default() {
    let (session, id) = analyzed(guarded_switch_program(), "main");
    let func = session.function(id).unwrap();
    assert_eq!(func.jump_tables.len(), 1);
    let jt = &func.jump_tables[0];
    assert_eq!(jt.size, 3);
    assert_eq!(jt.default_index, Some(3));
    assert_eq!(jt.addresses[3], Address::new(func.addr.space, 0x1004));

    let switch = func.graph.get(block_at(func, 0x100c));
    assert_eq!(switch.out_edges.len(), 4);
    let defaults: Vec<_> = switch
        .out_edges
        .iter()
        .filter(|e| e.label.contains(EdgeLabel::SWITCH_DEFAULT))
        .map(|e| e.point)
        .collect();
    let fallback = block_at(func, 0x1004);
    assert_eq!(defaults, vec![fallback]);
    assert!(func
        .graph
        .get(fallback)
        .flags
        .contains(BlockFlags::SWITCH_DEFAULT));
    assert_eq!(func.graph.get(fallback).in_edges.len(), 2);
    assert_ssa_form(func);
    assert_cfg_consistent(func);
}

#[test]
fn unresolved_indirect_branch_is_flagged() {
    use Opcode::*;
    let mut b = ProgramBuilder::new();
    let r0 = r(0);
    b.code(0x1000, 0x10)
        .symbol("main", 0x1000, 4)
        .ins(0x1000, vec![op(BranchInd, None, &[r0])]);
    let (session, id) = analyzed(b.finish(), "main");
    let func = session.function(id).unwrap();
    assert!(func.flags.contains(FuncFlags::UNRESOLVED_INDIRECT));
    assert!(func.jump_tables.is_empty());
    let blk = func.graph.get(block_at(func, 0x1000));
    assert!(blk.flags.contains(BlockFlags::UNREACHABLE_RISK));
    assert!(blk.out_edges.is_empty());
    assert_cfg_consistent(func);
}

#[test]
fn stack_relative_values() {
    let (session, id) = analyzed(stack_program(), "main");
    let func = session.function(id).unwrap();
    let sp = session.arch.sp.addr();
    assert_eq!(
        value_at(func, 0x1000),
        ValueType::RelConstant {
            base: sp,
            offset: 16
        }
    );
    // r4 is not a relative base by default
    assert_eq!(value_at(func, 0x1004), ValueType::Bottom);
    assert_eq!(value_at(func, 0x1008), ValueType::Bottom);
    assert_eq!(value_at(func, 0x100c), ValueType::Constant(16));
    assert_eq!(
        value_at(func, 0x1010),
        ValueType::RelConstant {
            base: sp,
            offset: -8
        }
    );
    assert_eq!(value_at(func, 0x1018), ValueType::Constant(42));
    assert_eq!(func.stack_depth, -8);
    assert!(!func.flags.contains(FuncFlags::STACK_UNSAFE));
    assert_ssa_form(func);
}

#[test]
fn loop_values_only_move_down() {
    let (session, id) = analyzed(loop_program(), "main");
    let func = session.function(id).unwrap();
    let header = block_at(func, 0x1004);
    let hb = func.graph.get(header);
    assert!(hb.flags.contains(BlockFlags::LOOP_HEADER));
    assert!(hb
        .in_edges
        .iter()
        .any(|e| e.label.contains(EdgeLabel::LOOP)));
    // r0 and sp both merge at the loop header
    assert_eq!(func.num_merges(), 2);
    for b in func.live_blocks() {
        for &op in &func.graph.get(b).ops {
            if let Some(out) = func.store.op(op).output() {
                assert!(!func.store.varnode(out).value.is_top());
            }
        }
    }
    assert_eq!(value_at(func, 0x1004), ValueType::Bottom);
    assert!(func.flags.contains(FuncFlags::STACK_UNSAFE));
    assert_ssa_form(func);
    assert_cfg_consistent(func);
}

#[test]
fn bad_data_is_flagged_not_fatal() {
    let (session, id) = analyzed(bad_data_program(), "main");
    let func = session.function(id).unwrap();
    assert!(func.flags.contains(FuncFlags::BADDATA_PRESENT));
    assert!(func.flags.contains(FuncFlags::PROCESSING_COMPLETE));
    let space = func.addr.space;
    assert!(func.bad_addrs.contains(&Address::new(space, 0x1006)));
    assert!(func.bad_addrs.contains(&Address::new(space, 0x5000)));
    assert!(func
        .graph
        .get(block_at(func, 0x1000))
        .flags
        .contains(BlockFlags::BAD_DATA));
    assert!(func.visited.contains_key(&Address::new(space, 0x100c)));
    assert_cfg_consistent(func);
    assert_ssa_form(func);
}

#[test]
fn relative_branch_splits_instruction() {
    let (session, id) = analyzed(relative_branch_program(), "main");
    let func = session.function(id).unwrap();
    // [compare, cbranch] [copy] [return]
    assert_eq!(func.graph.len(), 3);
    let entry = func.graph.entry().unwrap();
    let succs: Vec<BlockId> = func.graph.get(entry).successors().collect();
    assert_eq!(succs.len(), 2);
    assert_eq!(succs[1], block_at(func, 0x1004));
    assert_eq!(func.num_merges(), 1);
    assert_ssa_form(func);
    assert_cfg_consistent(func);
}

#[test]
fn relative_branch_cannot_leave_its_instruction() {
    let (session, id) = analyzed(relative_branch_out_of_instruction_program(), "main");
    let func = session.function(id).unwrap();
    assert!(func.flags.contains(FuncFlags::BADDATA_PRESENT));
    assert!(func
        .bad_addrs
        .contains(&Address::new(func.addr.space, 0x1004)));
    // No block is split at 0x1000 for the stray target, and no edge leads back to it
    assert_eq!(func.graph.len(), 2);
    let a = block_at(func, 0x1000);
    assert_eq!(block_at(func, 0x1004), a);
    assert_eq!(func.graph.entry(), Some(a));
    assert!(func.graph.get(a).in_edges.is_empty());
    assert!(func.graph.get(a).flags.contains(BlockFlags::BAD_DATA));
    let succs: Vec<BlockId> = func.graph.get(a).successors().collect();
    assert_eq!(succs, vec![block_at(func, 0x1008)]);
    assert_cfg_consistent(func);
    assert_ssa_form(func);
}

/// The merge at the top of a loop whose header is the function entry: one input comes from the
/// caller, the other around the loop
fn assert_entry_merge(func: &Function, loop_writer: u64) {
    let head = block_at(func, 0x1000);
    let entry = func.graph.entry().unwrap();
    assert_ne!(entry, head);
    assert!(func.graph.get(entry).ops.is_empty());
    assert_eq!(func.graph.get(head).immed_dom, Some(entry));
    assert!(func.graph.get(head).flags.contains(BlockFlags::LOOP_HEADER));
    assert_eq!(func.num_merges(), 1);

    let merge = func.graph.get(head).ops[0];
    let m = func.store.op(merge);
    assert_eq!(m.opcode(), Opcode::MultiEqual);
    let in_edges = &func.graph.get(head).in_edges;
    assert_eq!(m.inputs().len(), in_edges.len());
    for (slot, &vn) in m.inputs().iter().enumerate() {
        if in_edges[slot].point == entry {
            assert!(func.store.varnode(vn).is_input());
        } else {
            let def = func.def_op(vn).unwrap();
            assert_eq!(func.store.op(def).parent(), Some(block_at(func, loop_writer)));
        }
    }

    // `r2 = r1` reads the merge, not the value on entry
    let copy = func.store.first_op_at(Address::new(func.addr.space, 0x1000)).unwrap();
    let read = func.store.op(copy).input(0).unwrap();
    assert_eq!(func.def_op(read), Some(merge));
    assert_ssa_form(func);
    assert_cfg_consistent(func);
}

#[test]
fn entry_self_loop_gets_a_merge() {
    let (session, id) = analyzed(entry_self_loop_program(), "main");
    let func = session.function(id).unwrap();
    // [] [copy, copy, compare, cbranch] [return]
    assert_eq!(func.graph.len(), 3);
    assert_entry_merge(func, 0x1000);
    assert_eq!(value_at(func, 0x1000), ValueType::Bottom);
}

#[test]
fn loop_back_to_entry_gets_a_merge() {
    let (session, id) = analyzed(entry_loop_program(), "main");
    let func = session.function(id).unwrap();
    // [] [copy, compare, cbranch] [copy, branch] [return]
    assert_eq!(func.graph.len(), 4);
    assert_entry_merge(func, 0x1008);
}

#[test]
fn merges_feeding_only_merges_are_pruned() {
    let (session, id) = analyzed(nested_loop_program(), "main");
    let func = session.function(id).unwrap();
    let (outer, inner) = (block_at(func, 0x1004), block_at(func, 0x1008));
    assert!(func.graph.get(outer).flags.contains(BlockFlags::LOOP_HEADER));
    assert!(func.graph.get(inner).flags.contains(BlockFlags::LOOP_HEADER));
    assert!(func.graph.get(inner).frontier.contains(&outer));
    // `r1` needs merges at both headers, but they only read each other
    assert_eq!(func.num_merges(), 0);
    assert!(func
        .store
        .alive_ops()
        .all(|op| func.store.op(op).opcode() != Opcode::MultiEqual));
    assert_ssa_form(func);
    assert_cfg_consistent(func);
}

#[test]
fn store_through_absolute_address_blocks_stack_fold() {
    let (session, id) = analyzed(stack_store_through_absolute_program(), "main");
    let func = session.function(id).unwrap();
    assert_eq!(
        value_at(func, 0x1000),
        ValueType::RelConstant {
            base: session.arch.sp.addr(),
            offset: -8
        }
    );
    assert_eq!(value_at(func, 0x100c), ValueType::Bottom);
    assert_ssa_form(func);
}

/// The single indirect branch of `func` is unresolved: no table, no out-edges, and the reason
fn unresolved_reason(func: &Function) -> RecoveryFailure {
    assert!(func.flags.contains(FuncFlags::UNRESOLVED_INDIRECT));
    assert!(func.jump_tables.is_empty());
    let switch = func.graph.get(block_at(func, 0x1004));
    assert!(switch.flags.contains(BlockFlags::UNREACHABLE_RISK));
    assert!(switch.out_edges.is_empty());
    assert_eq!(switch.jump_table, None);
    assert_cfg_consistent(func);
    assert_eq!(func.unresolved.len(), 1);
    func.unresolved.values().next().cloned().unwrap()
}

#[test]
fn table_entry_outside_code_is_rejected() {
    let (session, id) = analyzed(masked_switch_over(3, &[0x1010, 0x5000, 0x1020, 0x1028]), "main");
    let func = session.function(id).unwrap();
    assert_eq!(
        unresolved_reason(func),
        RecoveryFailure::TargetNotCode(Address::new(func.addr.space, 0x5000))
    );
    // Cases are never reached
    assert!(!func
        .visited
        .contains_key(&Address::new(func.addr.space, 0x1010)));
}

#[test]
fn oversized_table_is_rejected() {
    let (session, id) = analyzed(
        masked_switch_over(0xfff, &[0x1010, 0x1018, 0x1020, 0x1028]),
        "main",
    );
    let func = session.function(id).unwrap();
    assert_eq!(unresolved_reason(func), RecoveryFailure::TooLarge(0x1000));
}

#[test]
fn table_running_off_the_image_is_rejected() {
    // Eight entries admitted by the mask, four present
    let (session, id) = analyzed(masked_switch_over(7, &[0x1010, 0x1018, 0x1020, 0x1028]), "main");
    let func = session.function(id).unwrap();
    assert_eq!(
        unresolved_reason(func),
        RecoveryFailure::Unreadable(Address::new(func.addr.space, 0x2010))
    );
    let dump = format!("{:?}", func.debug_function(&session.arch.spaces));
    assert!(dump.contains("unresolved"));
}

#[test]
fn repeated_table_targets_share_an_edge() {
    let (session, id) = analyzed(masked_switch_over(3, &[0x1010, 0x1018, 0x1010, 0x1020]), "main");
    let func = session.function(id).unwrap();
    assert_eq!(func.jump_tables.len(), 1);
    assert_eq!(func.jump_tables[0].size, 4);
    assert!(func.unresolved.is_empty());
    let switch = func.graph.get(block_at(func, 0x1004));
    let succs: Vec<BlockId> = switch.successors().collect();
    assert_eq!(
        succs,
        vec![
            block_at(func, 0x1010),
            block_at(func, 0x1018),
            block_at(func, 0x1020)
        ]
    );
    assert_eq!(func.graph.get(block_at(func, 0x1010)).in_edges.len(), 1);
    assert!(!func.flags.contains(FuncFlags::UNRESOLVED_INDIRECT));
    assert_ssa_form(func);
    assert_cfg_consistent(func);
}

#[test]
fn instruction_limit_stops_flow() {
    let limits = Limits {
        max_instructions: 2,
        ..Limits::default()
    };
    let (session, id) = analyzed_with_limits(straight_line_program(), "main", limits);
    let func = session.function(id).unwrap();
    assert!(func.flags.contains(FuncFlags::INSTRUCTION_LIMIT));
    assert_eq!(func.visited.len(), 2);
    assert!(func.flags.contains(FuncFlags::PROCESSING_COMPLETE));
}

#[test]
fn recursion_is_guarded() {
    let mut session = mutual_recursion_program().into_session(Limits::default());
    assert_eq!(session.num_functions(), 2);
    session.analyze_all();
    assert_eq!(session.num_functions(), 3);

    let main = session.find_func_by_name("main").unwrap();
    let f = session.find_func_by_name("f").unwrap();
    let g = session
        .find_func(Address::new(session.arch.code_space, 0x1020))
        .unwrap();
    assert_eq!(session.name(g), "func_1020");

    let main_fn = session.function(main).unwrap();
    let f_fn = session.function(f).unwrap();
    assert_eq!(main_fn.call_specs[0].status, CallStatus::Resolved(f));
    // f saw main while main was still in progress; linked once main completed
    assert_eq!(f_fn.call_specs[0].status, CallStatus::Resolved(main));
    assert_eq!(f_fn.call_specs[1].status, CallStatus::Resolved(g));
    assert!(f_fn.flags.contains(FuncFlags::RECURSION_GUARD));
    assert!(!main_fn.flags.contains(FuncFlags::RECURSION_GUARD));
    for (_, func) in session.functions() {
        assert!(func.flags.contains(FuncFlags::PROCESSING_COMPLETE));
    }
}

#[test]
fn unknown_function_name() {
    let session = straight_line_program().into_session(Limits::default());
    assert!(session.find_func_by_name("nope").is_err());
}

#[test]
fn switch_listing_with_literal_pool() {
    let listing = lift_from(include_str!("../tests/switch.listing")).unwrap();
    let (session, id) = analyzed(listing, "dispatch");
    let func = session.function(id).unwrap();
    assert_eq!(func.jump_tables.len(), 1);
    let jt = &func.jump_tables[0];
    assert_eq!(jt.size, 4);
    assert_eq!(jt.default_index, Some(4));
    assert_eq!(func.graph.get(block_at(func, 0x8010)).out_edges.len(), 5);
    assert!(func.flags.contains(FuncFlags::UNIMPLEMENTED_PRESENT));
    assert_ssa_form(func);
    assert_cfg_consistent(func);

    let dump = format!("{:?}", func.debug_function(&session.arch.spaces));
    assert!(dump.contains("BRANCHIND"));
    assert!(dump.contains("table 0"));
    let dot = func.generate_dot(true);
    assert!(dot.contains("digraph CFG"));
    assert!(dot.contains("dashed"));
}

#[test]
fn calls_listing() {
    let listing = lift_from(include_str!("../tests/calls.listing")).unwrap();
    let mut session = listing.into_session(Limits::default());
    session.analyze_all();
    let fact = session.find_func_by_name("fact").unwrap();
    let fact_fn = session.function(fact).unwrap();
    assert_eq!(fact_fn.call_specs.len(), 1);
    assert_eq!(fact_fn.call_specs[0].status, CallStatus::Resolved(fact));
    assert!(fact_fn.flags.contains(FuncFlags::RECURSION_GUARD));
    assert_eq!(fact_fn.num_merges(), 1);
    assert_ssa_form(fact_fn);

    let main = session.find_func_by_name("main").unwrap();
    let main_fn = session.function(main).unwrap();
    assert_eq!(main_fn.call_specs[0].status, CallStatus::Resolved(fact));
    assert_eq!(main_fn.stack_depth, -16);
}
