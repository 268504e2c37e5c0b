//! The micro-operation language consumed by the analysis.
//!
//! Mirrors Ghidra's [P-Code](https://ghidra.re/courses/languages/html/pcoderef.html): every
//! machine instruction is emitted by a decoder as a short sequence of [`Opcode`]s over
//! [`VarnodeData`] locations in some [`AddressSpace`].

use crate::containers::unordered::UnorderedMap;

/// A micro-operation
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum Opcode {
    /// Copy a sequence of contiguous bytes from `input0` to `output`
    Copy,
    /// Load from the pointer `input1`, in the space identified by `input0`
    Load,
    /// Store `input2` into the pointer `input1`, in the space identified by `input0`
    Store,
    /// Unconditional branch to `input0`
    Branch,
    /// A conditional branch to `input0` taken iff `input1` is non-zero
    Cbranch,
    /// Branch to the address computed in `input0`
    BranchInd,
    /// Call the function at `input0`, with fallthrough
    Call,
    /// Call the function at the address computed in `input0`, with fallthrough
    CallInd,
    /// A user-defined (architecture specific) operation, opaque to the analysis
    CallOther,
    /// Return to the address computed in `input0`
    Return,
    /// `input0 == input1`
    IntEqual,
    /// `input0 != input1`
    IntNotEqual,
    /// Signed `input0 s< input1`
    IntSLess,
    /// Signed `input0 s<= input1`
    IntSLessEqual,
    /// Unsigned `input0 u< input1`
    IntLess,
    /// Unsigned `input0 u<= input1`
    IntLessEqual,
    /// Zero-extend `input0`
    IntZext,
    /// Sign-extend `input0`
    IntSext,
    /// Wrapping sum
    IntAdd,
    /// Wrapping difference
    IntSub,
    /// Unsigned carry of `input0 + input1`
    IntCarry,
    /// Signed carry of `input0 + input1`
    IntSCarry,
    /// Signed borrow of `input0 - input1`
    IntSBorrow,
    /// Two's complement negation
    Int2Comp,
    /// Bitwise NOT
    IntNegate,
    IntXor,
    IntAnd,
    IntOr,
    /// `input0 << input1`
    IntLeft,
    /// Logical `input0 u>> input1`
    IntRight,
    /// Arithmetic `input0 s>> input1`
    IntSRight,
    IntMult,
    IntDiv,
    IntSDiv,
    IntRem,
    IntSRem,
    BoolNegate,
    BoolXor,
    BoolAnd,
    BoolOr,
    /// Concatenate `input0` (most significant) and `input1`
    Piece,
    /// Truncate `input0 u>> (8 * input1)` to the size of the output
    Subpiece,
    Popcount,
    /// A merge (phi) of one input per incoming control-flow edge. Never emitted by a decoder.
    MultiEqual,
    /// Marks the output as possibly modified indirectly by the op at `input1`
    Indirect,
    /// Placeholder for an instruction whose semantics produced no operations
    Nop,
}

impl Opcode {
    /// Operations that end a basic block
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Opcode::Branch | Opcode::Cbranch | Opcode::BranchInd | Opcode::Return
        )
    }

    /// Operations after which control never reaches the next op in program order
    pub fn is_flow_break(self) -> bool {
        matches!(self, Opcode::Branch | Opcode::BranchInd | Opcode::Return)
    }

    pub fn is_call(self) -> bool {
        matches!(self, Opcode::Call | Opcode::CallInd | Opcode::CallOther)
    }

    /// Comparisons and boolean operators, whose output is 0 or 1
    pub fn is_bool_output(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            IntEqual
                | IntNotEqual
                | IntSLess
                | IntSLessEqual
                | IntLess
                | IntLessEqual
                | IntCarry
                | IntSCarry
                | IntSBorrow
                | BoolNegate
                | BoolXor
                | BoolAnd
                | BoolOr
        )
    }

    /// Ghidra-style name, used by listings and dumps
    pub fn name(self) -> &'static str {
        use Opcode::*;
        match self {
            Copy => "COPY",
            Load => "LOAD",
            Store => "STORE",
            Branch => "BRANCH",
            Cbranch => "CBRANCH",
            BranchInd => "BRANCHIND",
            Call => "CALL",
            CallInd => "CALLIND",
            CallOther => "CALLOTHER",
            Return => "RETURN",
            IntEqual => "INT_EQUAL",
            IntNotEqual => "INT_NOTEQUAL",
            IntSLess => "INT_SLESS",
            IntSLessEqual => "INT_SLESSEQUAL",
            IntLess => "INT_LESS",
            IntLessEqual => "INT_LESSEQUAL",
            IntZext => "INT_ZEXT",
            IntSext => "INT_SEXT",
            IntAdd => "INT_ADD",
            IntSub => "INT_SUB",
            IntCarry => "INT_CARRY",
            IntSCarry => "INT_SCARRY",
            IntSBorrow => "INT_SBORROW",
            Int2Comp => "INT_2COMP",
            IntNegate => "INT_NEGATE",
            IntXor => "INT_XOR",
            IntAnd => "INT_AND",
            IntOr => "INT_OR",
            IntLeft => "INT_LEFT",
            IntRight => "INT_RIGHT",
            IntSRight => "INT_SRIGHT",
            IntMult => "INT_MULT",
            IntDiv => "INT_DIV",
            IntSDiv => "INT_SDIV",
            IntRem => "INT_REM",
            IntSRem => "INT_SREM",
            BoolNegate => "BOOL_NEGATE",
            BoolXor => "BOOL_XOR",
            BoolAnd => "BOOL_AND",
            BoolOr => "BOOL_OR",
            Piece => "PIECE",
            Subpiece => "SUBPIECE",
            Popcount => "POPCOUNT",
            MultiEqual => "MULTIEQUAL",
            Indirect => "INDIRECT",
            Nop => "NOP",
        }
    }

    /// Inverse of [`Self::name`]
    pub fn from_name(name: &str) -> Option<Self> {
        use Opcode::*;
        const ALL: [Opcode; 46] = [
            Copy,
            Load,
            Store,
            Branch,
            Cbranch,
            BranchInd,
            Call,
            CallInd,
            CallOther,
            Return,
            IntEqual,
            IntNotEqual,
            IntSLess,
            IntSLessEqual,
            IntLess,
            IntLessEqual,
            IntZext,
            IntSext,
            IntAdd,
            IntSub,
            IntCarry,
            IntSCarry,
            IntSBorrow,
            Int2Comp,
            IntNegate,
            IntXor,
            IntAnd,
            IntOr,
            IntLeft,
            IntRight,
            IntSRight,
            IntMult,
            IntDiv,
            IntSDiv,
            IntRem,
            IntSRem,
            BoolNegate,
            BoolXor,
            BoolAnd,
            BoolOr,
            Piece,
            Subpiece,
            Popcount,
            MultiEqual,
            Indirect,
            Nop,
        ];
        ALL.iter().copied().find(|op| op.name() == name)
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Endianness
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Endian {
    Big,
    Little,
}

/// The role an address space plays. Only some kinds of spaces hold variables that take part in
/// SSA construction.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, PartialOrd, Ord)]
pub enum SpaceKind {
    /// Offsets are the constant values themselves
    Constant,
    /// Main memory, holding code and data
    Processor,
    /// Machine registers
    Register,
    /// Decoder temporaries, only live within one instruction
    Unique,
}

/// Index of an address space within [`Spaces`]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct SpaceId(pub u8);

/// Description of a specific address space.
#[derive(Debug, Clone)]
pub struct AddressSpace {
    /// A name for the address-space.
    pub name: String,
    pub kind: SpaceKind,
    /// Whether the address space is little- or big-endian.
    pub endianness: Endian,
    /// Size, in bytes, of a pointer into this space
    pub addr_size: usize,
}

impl AddressSpace {
    /// Whether values living in this space are renamed into SSA form
    pub fn is_heritaged(&self) -> bool {
        !matches!(self.kind, SpaceKind::Constant)
    }
}

/// The set of address spaces of an architecture
#[derive(Debug, Clone)]
pub struct Spaces {
    spaces: Vec<AddressSpace>,
    by_name: UnorderedMap<String, SpaceId>,
    constant: SpaceId,
}

impl Spaces {
    /// Build the set of spaces. A constant space is added if `spaces` does not already contain one.
    pub fn new(spaces: Vec<AddressSpace>) -> Self {
        let mut spaces = spaces;
        if !spaces.iter().any(|s| s.kind == SpaceKind::Constant) {
            let endianness = spaces.first().map(|s| s.endianness).unwrap_or(Endian::Little);
            spaces.push(AddressSpace {
                name: "const".into(),
                kind: SpaceKind::Constant,
                endianness,
                addr_size: 8,
            });
        }
        assert!(spaces.len() <= u8::MAX as usize, "Too many address spaces");
        let by_name: UnorderedMap<String, SpaceId> = spaces
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), SpaceId(i as u8)))
            .collect();
        let constant = spaces
            .iter()
            .position(|s| s.kind == SpaceKind::Constant)
            .map(|i| SpaceId(i as u8))
            .unwrap_or(SpaceId(0));
        Self {
            spaces,
            by_name,
            constant,
        }
    }

    pub fn get(&self, id: SpaceId) -> &AddressSpace {
        &self.spaces[id.0 as usize]
    }

    pub fn by_name(&self, name: &str) -> Option<SpaceId> {
        self.by_name.get(name).copied()
    }

    pub fn constant(&self) -> SpaceId {
        self.constant
    }

    /// The first space of the given kind
    pub fn first_of_kind(&self, kind: SpaceKind) -> Option<SpaceId> {
        self.spaces
            .iter()
            .position(|s| s.kind == kind)
            .map(|i| SpaceId(i as u8))
    }

    pub fn iter(&self) -> impl Iterator<Item = (SpaceId, &AddressSpace)> {
        self.spaces
            .iter()
            .enumerate()
            .map(|(i, s)| (SpaceId(i as u8), s))
    }
}

/// A location: a space together with an offset into it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub space: SpaceId,
    pub offset: u64,
}

impl Address {
    pub fn new(space: SpaceId, offset: u64) -> Self {
        Self { space, offset }
    }

    /// The address `delta` bytes further along in the same space
    pub fn add(self, delta: u64) -> Self {
        Self {
            space: self.space,
            offset: self.offset.wrapping_add(delta),
        }
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "as{}:{:#x}", self.space.0, self.offset)
    }
}

/// Position of an operation in program order: the address of the machine instruction it came
/// from, and a function-unique counter distinguishing the operations of that instruction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeqNum {
    pub addr: Address,
    pub uniq: u32,
}

impl std::fmt::Debug for SeqNum {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}.{}", self.addr, self.uniq)
    }
}

/// A raw `(space, offset, size)` triple, as emitted by a decoder.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarnodeData {
    pub space: SpaceId,
    pub offset: u64,
    pub size: u32,
}

impl VarnodeData {
    pub fn new(space: SpaceId, offset: u64, size: u32) -> Self {
        Self {
            space,
            offset,
            size,
        }
    }

    pub fn addr(&self) -> Address {
        Address::new(self.space, self.offset)
    }
}

impl std::fmt::Debug for VarnodeData {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "(as{}, {:#x}, {})", self.space.0, self.offset, self.size)
    }
}

/// Mask selecting the low `size` bytes of a value
pub fn calc_mask(size: u32) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}

/// Sign-extend the low `size` bytes of `v` to 64 bits
pub fn sign_extend(v: u64, size: u32) -> i64 {
    if size >= 8 || size == 0 {
        v as i64
    } else {
        let shift = 64 - size * 8;
        ((v << shift) as i64) >> shift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_and_sign_extension() {
        assert_eq!(calc_mask(1), 0xff);
        assert_eq!(calc_mask(4), 0xffff_ffff);
        assert_eq!(calc_mask(8), u64::MAX);
        assert_eq!(sign_extend(0xff, 1), -1);
        assert_eq!(sign_extend(0x7f, 1), 127);
        assert_eq!(sign_extend(0xffff_fff0, 4), -16);
    }

    #[test]
    fn opcode_names_are_invertible() {
        for name in ["COPY", "INT_ADD", "BRANCHIND", "MULTIEQUAL", "INT_SLESSEQUAL"] {
            assert_eq!(Opcode::from_name(name).unwrap().name(), name);
        }
        assert_eq!(Opcode::from_name("FLOAT_ADD"), None);
    }
}
