//! Diagnostics: a textual dump of a function in SSA form, and a GraphViz rendering of its
//! control-flow graph with the dominator tree overlaid.

use crate::analysis_config::CONFIG;
use crate::block::{BlockFlags, BlockId, EdgeLabel};
use crate::funcdata::Function;
use crate::il::Spaces;
use crate::ir::{OpId, VarnodeId};

/// A [`Debug`](std::fmt::Debug) view of a function
pub struct DebugFunction<'a> {
    func: &'a Function,
    spaces: &'a Spaces,
}

impl Function {
    pub fn debug_function<'a>(&'a self, spaces: &'a Spaces) -> DebugFunction<'a> {
        DebugFunction { func: self, spaces }
    }
}

impl<'a> DebugFunction<'a> {
    fn varnode(&self, f: &mut std::fmt::Formatter, vn: VarnodeId) -> std::fmt::Result {
        let v = self.func.store.varnode(vn);
        if let Some(c) = v.constant_value() {
            return write!(f, "{:#x}:{}", c, v.size());
        }
        let space = &self.spaces.get(v.loc().space).name;
        write!(f, "{}[{:#x}]:{}{:?}", space, v.loc().offset, v.size(), vn)?;
        if v.is_input() {
            write!(f, "(in)")?;
        }
        Ok(())
    }

    fn op(&self, f: &mut std::fmt::Formatter, op: OpId) -> std::fmt::Result {
        let o = self.func.store.op(op);
        write!(f, "    {:?}\t", o.seq())?;
        if let Some(out) = o.output() {
            self.varnode(f, out)?;
            write!(f, " = ")?;
        }
        write!(f, "{}", o.opcode())?;
        for &i in o.inputs() {
            write!(f, " ")?;
            self.varnode(f, i)?;
        }
        if let Some(out) = o.output() {
            let value = self.func.store.varnode(out).value;
            if !value.is_top() {
                write!(f, "\t; {:?}", value)?;
            }
        }
        writeln!(f)
    }
}

impl<'a> std::fmt::Debug for DebugFunction<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let func = self.func;
        writeln!(f, "function {} @ {:?} {:?}", func.name, func.addr, func.flags)?;
        for blk in func.graph.iter() {
            let ids = |v: &mut dyn Iterator<Item = BlockId>| {
                v.map(|b| format!("{:?}", b)).collect::<Vec<_>>().join(", ")
            };
            writeln!(
                f,
                "  {:?} {:?} in: [{}] out: [{}] idom: {:?} depth: {}",
                blk.index,
                blk.flags,
                ids(&mut blk.predecessors()),
                ids(&mut blk.successors()),
                blk.immed_dom,
                blk.dom_depth,
            )?;
            for &op in &blk.ops {
                self.op(f, op)?;
            }
        }
        for (i, jt) in func.jump_tables.iter().enumerate() {
            writeln!(
                f,
                "  table {} at {:?} for branch {:?}: {:?} default {:?}",
                i, jt.table_addr, jt.op_addr, jt.addresses, jt.default_index
            )?;
        }
        for (&op, reason) in &func.unresolved {
            writeln!(f, "  unresolved {:?}: {}", func.store.op(op).seq(), reason)?;
        }
        for cs in &func.call_specs {
            writeln!(f, "  call {:?} -> {:?} {:?}", cs.op, cs.target, cs.status)?;
        }
        if CONFIG.debug_print_dead_ops {
            writeln!(f, "  dead:")?;
            for op in func.store.dead_ops() {
                self.op(f, op)?;
            }
            for d in func.store.destroyed_ops() {
                writeln!(f, "    {:?}\t{} (destroyed)", d.seq, d.opcode)?;
            }
        }
        Ok(())
    }
}

type Node = BlockId;
/// `(from, to, label, in dominator tree rather than control flow)`
type Edge = (BlockId, BlockId, EdgeLabel, bool);

struct Graph<'a> {
    func: &'a Function,
    show_dominators: bool,
}

impl<'a> dot::Labeller<'a, Node, Edge> for Graph<'a> {
    fn graph_id(&'a self) -> dot::Id<'a> {
        dot::Id::new("CFG").unwrap()
    }
    fn node_id(&'a self, n: &Node) -> dot::Id<'a> {
        dot::Id::new(format!("bb{}", n.0)).unwrap()
    }
    fn node_label<'b>(&'b self, n: &Node) -> dot::LabelText<'b> {
        let blk = self.func.graph.get(*n);
        let start = blk
            .start
            .map(|a| format!("{:#x}", a.offset))
            .unwrap_or_default();
        let ops: String = blk
            .ops
            .iter()
            .map(|&op| {
                let o = self.func.store.op(op);
                format!("{}\\l", o.opcode())
            })
            .collect();
        dot::LabelText::escaped(format!("{:?} {}\\l{}", n, start, ops))
    }
    fn node_shape(&'a self, n: &Node) -> Option<dot::LabelText<'a>> {
        let flags = self.func.graph.get(*n).flags;
        let shape = if flags.contains(BlockFlags::BAD_DATA) {
            "Msquare"
        } else if flags.contains(BlockFlags::UNREACHABLE_RISK) {
            "octagon"
        } else if flags.contains(BlockFlags::RETURN) {
            "house"
        } else if flags.intersects(BlockFlags::SWITCH_CASE | BlockFlags::SWITCH_DEFAULT) {
            "component"
        } else {
            "box"
        };
        Some(dot::LabelText::label(shape))
    }
    fn node_style(&'a self, n: &Node) -> dot::Style {
        let flags = self.func.graph.get(*n).flags;
        if flags.contains(BlockFlags::DEAD) {
            dot::Style::Dotted
        } else if flags.contains(BlockFlags::ENTRY_POINT) || flags.contains(BlockFlags::LOOP_HEADER)
        {
            dot::Style::Bold
        } else {
            dot::Style::None
        }
    }
    fn edge_label<'b>(&'b self, e: &Edge) -> dot::LabelText<'b> {
        let label = if e.3 {
            String::new()
        } else if e.2.contains(EdgeLabel::SWITCH_DEFAULT) {
            "default".to_owned()
        } else if e.2.contains(EdgeLabel::LOOP) {
            "loop".to_owned()
        } else {
            String::new()
        };
        dot::LabelText::label(label)
    }
    fn edge_style(&'a self, e: &Edge) -> dot::Style {
        if e.3 {
            dot::Style::Dashed
        } else {
            dot::Style::None
        }
    }
}

impl<'a> dot::GraphWalk<'a, Node, Edge> for Graph<'a> {
    fn nodes(&'a self) -> dot::Nodes<'a, Node> {
        self.func.graph.ids().collect::<Vec<_>>().into()
    }
    fn edges(&'a self) -> dot::Edges<'a, Edge> {
        let mut edges: Vec<Edge> = vec![];
        for blk in self.func.graph.iter() {
            for e in &blk.out_edges {
                edges.push((blk.index, e.point, e.label, false));
            }
            if self.show_dominators {
                for &c in &blk.dom_children {
                    edges.push((blk.index, c, EdgeLabel::empty(), true));
                }
            }
        }
        edges.into()
    }
    fn source(&self, e: &Edge) -> Node {
        e.0
    }
    fn target(&self, e: &Edge) -> Node {
        e.1
    }
}

impl Function {
    /// Write the control-flow graph in GraphViz format, with dominator-tree edges dashed if
    /// `show_dominators` is set
    pub fn write_dot<W: std::io::Write>(
        &self,
        w: &mut W,
        show_dominators: bool,
    ) -> std::io::Result<()> {
        let g = Graph {
            func: self,
            show_dominators,
        };
        dot::render(&g, w)
    }

    /// Generate a `.dot` file for the control-flow graph
    pub fn generate_dot(&self, show_dominators: bool) -> String {
        let mut s: Vec<u8> = vec![];
        self.write_dot(&mut s, show_dominators).unwrap();
        String::from_utf8(s).unwrap()
    }
}
