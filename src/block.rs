//! Basic blocks and the control-flow graph connecting them.

use crate::il::Address;
use crate::ir::OpId;

use bitflags::bitflags;

/// Index of a block within its [`BlockGraph`]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Debug for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "BB{}", self.0)
    }
}

bitflags! {
    /// Classification of an edge with respect to the depth-first spanning tree, plus tags
    /// describing the branch it came from.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct EdgeLabel: u32 {
        const TREE = 0x01;
        const FORWARD = 0x02;
        const CROSS = 0x04;
        const BACK = 0x08;
        /// A back edge whose target dominates its source
        const LOOP = 0x10;
        /// The fallback entry of a switch
        const SWITCH_DEFAULT = 0x20;
    }
}

impl EdgeLabel {
    /// Labels recomputed by each spanning tree pass
    pub const CLASSIFICATION: EdgeLabel = EdgeLabel::TREE
        .union(EdgeLabel::FORWARD)
        .union(EdgeLabel::CROSS)
        .union(EdgeLabel::BACK)
        .union(EdgeLabel::LOOP);
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct BlockFlags: u32 {
        const ENTRY_POINT = 0x0001;
        /// Unreachable from the entry; excluded from SSA and propagation
        const DEAD = 0x0002;
        /// Target of a switch case
        const SWITCH_CASE = 0x0004;
        /// Target of a switch default
        const SWITCH_DEFAULT = 0x0008;
        /// Scratch mark for passes; must be cleared by the pass that sets it
        const MARK = 0x0010;
        const RETURN = 0x0020;
        /// Ends in an indirect branch that could not be resolved; code may be missing past it
        const UNREACHABLE_RISK = 0x0040;
        /// Ends in a branch to an address that is not a valid instruction
        const BAD_DATA = 0x0080;
        /// Head of a natural loop
        const LOOP_HEADER = 0x0100;
        /// Inside the body of a natural loop
        const LOOP_BODY = 0x0200;
    }
}

/// One direction of a control-flow edge. `reverse_index` is the position of the matching edge in
/// the other block's opposite edge list.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlockEdge {
    pub point: BlockId,
    pub label: EdgeLabel,
    pub reverse_index: usize,
}

/// A maximal straight-line run of ops
#[derive(Clone, Debug)]
pub struct Block {
    pub index: BlockId,
    pub flags: BlockFlags,
    /// Ops in execution order
    pub ops: Vec<OpId>,
    pub in_edges: Vec<BlockEdge>,
    pub out_edges: Vec<BlockEdge>,
    pub immed_dom: Option<BlockId>,
    pub dom_children: Vec<BlockId>,
    /// Depth in the dominator tree; the entry is at depth 0
    pub dom_depth: usize,
    /// Dominance frontier
    pub frontier: Vec<BlockId>,
    /// Index into the function's jump tables, for a block ending in a resolved indirect branch
    pub jump_table: Option<usize>,
    /// Address of the first op
    pub start: Option<Address>,
    pub(crate) preorder: Option<usize>,
    pub(crate) postorder: Option<usize>,
}

impl Block {
    fn new(index: BlockId) -> Self {
        Self {
            index,
            flags: BlockFlags::empty(),
            ops: vec![],
            in_edges: vec![],
            out_edges: vec![],
            immed_dom: None,
            dom_children: vec![],
            dom_depth: 0,
            frontier: vec![],
            jump_table: None,
            start: None,
            preorder: None,
            postorder: None,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.flags.contains(BlockFlags::DEAD)
    }

    pub fn first_op(&self) -> Option<OpId> {
        self.ops.first().copied()
    }

    pub fn last_op(&self) -> Option<OpId> {
        self.ops.last().copied()
    }

    pub fn successors(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.out_edges.iter().map(|e| e.point)
    }

    pub fn predecessors(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.in_edges.iter().map(|e| e.point)
    }

    /// Position of the in-edge coming from `pred`
    pub fn in_slot(&self, pred: BlockId) -> Option<usize> {
        self.in_edges.iter().position(|e| e.point == pred)
    }
}

/// The control-flow graph of one function
#[derive(Clone, Debug, Default)]
pub struct BlockGraph {
    blocks: Vec<Block>,
    entry: Option<BlockId>,
}

impl BlockGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::new(id));
        id
    }

    /// Add an edge `from -> to`, as the next out-edge of `from` and the next in-edge of `to`
    pub fn add_edge(&mut self, from: BlockId, to: BlockId, label: EdgeLabel) {
        let out_pos = self.blocks[from.index()].out_edges.len();
        let in_pos = self.blocks[to.index()].in_edges.len();
        self.blocks[from.index()].out_edges.push(BlockEdge {
            point: to,
            label,
            reverse_index: in_pos,
        });
        self.blocks[to.index()].in_edges.push(BlockEdge {
            point: from,
            label,
            reverse_index: out_pos,
        });
    }

    /// Relabel the out-edge `slot` of `from`, keeping both directions in sync
    pub fn set_edge_label(&mut self, from: BlockId, slot: usize, label: EdgeLabel) {
        let e = self.blocks[from.index()].out_edges[slot];
        self.blocks[from.index()].out_edges[slot].label = label;
        self.blocks[e.point.index()].in_edges[e.reverse_index].label = label;
    }

    pub fn entry(&self) -> Option<BlockId> {
        self.entry
    }

    pub fn set_entry(&mut self, entry: BlockId) {
        if let Some(old) = self.entry {
            self.blocks[old.index()].flags.remove(BlockFlags::ENTRY_POINT);
        }
        self.blocks[entry.index()].flags |= BlockFlags::ENTRY_POINT;
        self.entry = Some(entry);
    }

    pub fn get(&self, b: BlockId) -> &Block {
        &self.blocks[b.index()]
    }

    pub fn get_mut(&mut self, b: BlockId) -> &mut Block {
        &mut self.blocks[b.index()]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.entry = None;
    }

    /// Does `a` dominate `b`? Both must have been processed by the dominator pass.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let target_depth = self.get(a).dom_depth;
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            let blk = self.get(cur);
            if blk.dom_depth <= target_depth {
                return false;
            }
            match blk.immed_dom {
                Some(d) => cur = d,
                None => return false,
            }
        }
    }
}
