//! Control-flow construction: decoding reachable instructions into ops, then partitioning the
//! ops into basic blocks and wiring the edges between them.

use crate::analysis_config::CONFIG;
use crate::block::{BlockFlags, BlockId, EdgeLabel};
use crate::containers::InsertionOrderedSet;
use crate::decoder::{EmittedOp, OpCollector};
use crate::error::DecodeError;
use crate::funcdata::{AnalysisContext, CallSpec, CallStatus, FuncFlags, Function, VisitStat};
use crate::il::{sign_extend, Address, Opcode};
use crate::ir::{OpFlags, OpId, VarnodeFlags};
use crate::log::*;

impl Function {
    /// Decode every instruction reachable from the pending addresses, without crossing
    /// indirect branches.
    pub fn follow_flow(&mut self, ctx: &AnalysisContext) {
        while let Some(start) = self.addrlist.pop() {
            if !self.process_instructions_from(start, ctx) {
                self.addrlist.clear();
                break;
            }
        }
        if self.visited.is_empty() {
            self.flags |= FuncFlags::NO_CODE;
        }
        self.flags |= FuncFlags::OP_GENERATED;
    }

    fn mark_bad_data(&mut self, addr: Address, reason: &'static str) {
        warn!("Flow reached bad data"; "function" => &self.name, "addr" => ?addr, "reason" => reason);
        self.flags |= FuncFlags::BADDATA_PRESENT;
        self.bad_addrs.insert(addr);
    }

    /// Decode instructions starting at `start`, following fallthrough. Returns `false` if the
    /// instruction limit was hit.
    fn process_instructions_from(&mut self, start: Address, ctx: &AnalysisContext) -> bool {
        let mut cur = start;
        loop {
            if self.visited.contains_key(&cur) {
                self.block_starts.insert(cur);
                return true;
            }
            let overlaps_previous = self
                .visited
                .range(..cur)
                .next_back()
                .map_or(false, |(prev, stat)| {
                    prev.space == cur.space && prev.offset + stat.size as u64 > cur.offset
                });
            if overlaps_previous {
                self.mark_bad_data(cur, "inside another instruction");
                return true;
            }
            if !ctx.image.is_code(cur) {
                self.mark_bad_data(cur, "not code");
                return true;
            }
            if self.inst_count >= self.inst_max {
                warn!("Instruction limit reached"; "function" => &self.name, "limit" => self.inst_max);
                self.flags |= FuncFlags::INSTRUCTION_LIMIT;
                return false;
            }

            let mut collector = OpCollector::default();
            let size = match ctx.decoder.one_instruction(&mut collector, cur) {
                Ok(size) => size.max(1),
                Err(DecodeError::Unimplemented(_)) => {
                    info!("Unimplemented instruction"; "function" => &self.name, "addr" => ?cur);
                    self.flags |= FuncFlags::UNIMPLEMENTED_PRESENT;
                    return true;
                }
                Err(DecodeError::NoInstruction(_)) => {
                    self.mark_bad_data(cur, "undecodable");
                    return true;
                }
            };
            let overlaps_next = self
                .visited
                .range(cur..)
                .next()
                .map_or(false, |(next, _)| {
                    next.space == cur.space && next.offset < cur.offset + size as u64
                });
            if overlaps_next {
                self.mark_bad_data(cur, "overlaps a decoded instruction");
                return true;
            }
            self.inst_count += 1;

            let ops = self.instantiate(cur, collector.ops, ctx);
            self.visited.insert(
                cur,
                VisitStat {
                    seq: self.store.op(ops[0]).seq(),
                    size,
                },
            );
            if !self.examine_control_flow(cur, size, &ops) {
                return true;
            }
            cur = cur.add(size as u64);
        }
    }

    /// Turn the emitted micro-ops of one instruction into alive ops
    fn instantiate(
        &mut self,
        addr: Address,
        emitted: Vec<EmittedOp>,
        ctx: &AnalysisContext,
    ) -> Vec<OpId> {
        let emitted = if emitted.is_empty() {
            vec![EmittedOp {
                opcode: Opcode::Nop,
                output: None,
                inputs: vec![],
            }]
        } else {
            emitted
        };
        let code_space = ctx.arch.code_space;
        let mut ops = Vec::with_capacity(emitted.len());
        for e in emitted {
            let seq = self.store.new_seq(addr);
            let op = self.store.new_op(e.opcode, seq);
            self.store.mark_alive(op);
            for (slot, vd) in e.inputs.iter().enumerate() {
                let vn = self.store.new_varnode_from(vd);
                if slot == 0
                    && vd.space == code_space
                    && matches!(e.opcode, Opcode::Branch | Opcode::Cbranch | Opcode::Call)
                {
                    self.store.varnode_mut(vn).flags |= VarnodeFlags::ANNOTATION;
                }
                self.store.set_input(op, vn, slot);
            }
            if let Some(out) = &e.output {
                self.store.create_output(op, out);
            }
            ops.push(op);
        }
        self.store.op_mut(ops[0]).flags |= OpFlags::START_MARK;
        ops
    }

    /// Record the flow effects of one instruction. Returns whether it falls through to the next.
    fn examine_control_flow(&mut self, addr: Address, size: usize, ops: &[OpId]) -> bool {
        for (i, &op) in ops.iter().enumerate() {
            let opcode = self.store.op(op).opcode();
            match opcode {
                Opcode::Branch | Opcode::Cbranch => {
                    let Some(dest) = self.store.op(op).input(0) else {
                        continue;
                    };
                    let dest = self.store.varnode(dest);
                    if let Some(rel) = dest.constant_value() {
                        // Relative to this op, within the instruction
                        let target = i as i64 + sign_extend(rel, dest.size());
                        if target >= 0 && (target as usize) < ops.len() {
                            self.store.op_mut(ops[target as usize]).flags |= OpFlags::START_BLOCK;
                        } else if target as usize == ops.len() {
                            let next = addr.add(size as u64);
                            self.addrlist.push(next);
                            self.block_starts.insert(next);
                        } else {
                            self.mark_bad_data(addr, "relative branch leaves instruction");
                        }
                    } else {
                        let target = dest.loc();
                        self.addrlist.push(target);
                        self.block_starts.insert(target);
                    }
                }
                Opcode::BranchInd => {
                    trace!("Indirect branch"; "addr" => ?addr);
                    self.indirects.push(op);
                }
                Opcode::Call => {
                    let target = self
                        .store
                        .op(op)
                        .input(0)
                        .map(|vn| self.store.varnode(vn))
                        .filter(|v| v.is_annotation())
                        .map(|v| v.loc());
                    self.call_specs.push(CallSpec {
                        op,
                        target,
                        status: if target.is_some() {
                            CallStatus::Unlinked
                        } else {
                            CallStatus::Unknown
                        },
                    });
                }
                Opcode::CallInd => {
                    self.call_specs.push(CallSpec {
                        op,
                        target: None,
                        status: CallStatus::Unknown,
                    });
                }
                _ => {}
            }
        }
        let last = *ops.last().expect("Instruction without ops");
        !self.store.op(last).opcode().is_flow_break()
    }

    /// The op control reaches after `op` when it does not branch
    pub fn fallthrough_op(&self, op: OpId) -> Option<OpId> {
        let next = self.store.next_alive(op)?;
        let (a, n) = (self.store.op(op).addr(), self.store.op(next).addr());
        if a == n {
            return Some(next);
        }
        let stat = self.visited.get(&a)?;
        (a.space == n.space && a.offset + stat.size as u64 == n.offset).then(|| next)
    }

    /// The op a direct branch transfers control to
    pub fn branch_target_op(&self, op: OpId) -> Option<OpId> {
        let dest = self.store.varnode(self.store.op(op).input(0)?);
        match dest.constant_value() {
            Some(rel) => {
                // Relative targets stay inside the instruction, or land one past its end
                let rel = sign_extend(rel, dest.size());
                let addr = self.store.op(op).addr();
                let steps = rel.unsigned_abs();
                let mut cur = op;
                for step in 1..=steps {
                    let next = if rel > 0 {
                        self.store.next_alive(cur)
                    } else {
                        self.store.prev_alive(cur)
                    };
                    match next {
                        Some(n) if self.store.op(n).addr() == addr => cur = n,
                        _ if rel > 0 && step == steps => return self.fallthrough_op(cur),
                        _ => return None,
                    }
                }
                Some(cur)
            }
            None => self.store.first_op_at(dest.loc()),
        }
    }

    fn block_of(&self, op: Option<OpId>) -> Option<BlockId> {
        self.store.op(op?).parent()
    }

    /// Partition the alive ops into basic blocks and connect them
    pub fn generate_blocks(&mut self) {
        for op in self.store.alive_ops().collect::<Vec<_>>() {
            self.store.set_parent(op, None);
        }
        self.graph.clear();

        let ops: Vec<OpId> = self.store.alive_ops().collect();
        if ops.is_empty() {
            self.flags |= FuncFlags::BLOCKS_GENERATED;
            return;
        }

        // Decide which ops start blocks
        let mut starts: Vec<Address> = vec![self.addr];
        starts.extend(self.block_starts.iter().copied());
        starts.extend(
            self.jump_tables
                .iter()
                .flat_map(|jt| jt.addresses.iter().copied()),
        );
        for a in starts {
            if let Some(op) = self.store.first_op_at(a) {
                self.store.op_mut(op).flags |= OpFlags::START_BLOCK;
            }
        }
        for &op in &ops {
            if self.store.op(op).opcode().is_branch() {
                if let Some(next) = self.store.next_alive(op) {
                    self.store.op_mut(next).flags |= OpFlags::START_BLOCK;
                }
                if matches!(
                    self.store.op(op).opcode(),
                    Opcode::Branch | Opcode::Cbranch
                ) {
                    if let Some(t) = self.branch_target_op(op) {
                        self.store.op_mut(t).flags |= OpFlags::START_BLOCK;
                    }
                }
            }
        }

        // Partition
        let mut cur: Option<BlockId> = None;
        let mut prev: Option<OpId> = None;
        for &op in &ops {
            let starts_block = self.store.op(op).flags.contains(OpFlags::START_BLOCK)
                || prev.map_or(true, |p| self.fallthrough_op(p) != Some(op));
            let b = match cur {
                Some(b) if !starts_block => b,
                _ => {
                    let b = self.graph.add_block();
                    self.graph.get_mut(b).start = Some(self.store.op(op).addr());
                    self.store.op_mut(op).flags |= OpFlags::START_BLOCK;
                    if CONFIG.debug_print_block_boundaries {
                        debug!("Block start"; "block" => ?b, "addr" => ?self.store.op(op).addr());
                    }
                    b
                }
            };
            self.graph.get_mut(b).ops.push(op);
            self.store.set_parent(op, Some(b));
            cur = Some(b);
            prev = Some(op);
        }

        // Connect
        for b in self.graph.ids().collect::<Vec<_>>() {
            let last = self.graph.get(b).last_op().expect("Block without ops");
            let opcode = self.store.op(last).opcode();
            match opcode {
                Opcode::Branch => match self.block_of(self.branch_target_op(last)) {
                    Some(t) => self.graph.add_edge(b, t, EdgeLabel::empty()),
                    None => self.graph.get_mut(b).flags |= BlockFlags::BAD_DATA,
                },
                Opcode::Cbranch => {
                    let fall = self.block_of(self.fallthrough_op(last));
                    let taken = self.block_of(self.branch_target_op(last));
                    match (fall, taken) {
                        (Some(f), Some(t)) => {
                            self.graph.add_edge(b, f, EdgeLabel::empty());
                            self.graph.add_edge(b, t, EdgeLabel::empty());
                        }
                        (f, t) => {
                            self.graph.get_mut(b).flags |= BlockFlags::BAD_DATA;
                            for x in [f, t].into_iter().flatten() {
                                self.graph.add_edge(b, x, EdgeLabel::empty());
                            }
                        }
                    }
                }
                Opcode::BranchInd => self.connect_indirect(b, last),
                Opcode::Return => self.graph.get_mut(b).flags |= BlockFlags::RETURN,
                _ => match self.block_of(self.fallthrough_op(last)) {
                    Some(f) => self.graph.add_edge(b, f, EdgeLabel::empty()),
                    None => {
                        // Flow stopped at bad data, an unimplemented instruction or the limit
                        self.graph.get_mut(b).flags |= BlockFlags::BAD_DATA;
                    }
                },
            }
        }

        if let Some(entry) = self.block_of(self.store.first_op_at(self.addr)) {
            if self.graph.get(entry).in_edges.is_empty() {
                self.graph.set_entry(entry);
            } else {
                // Control also arrives from the caller, so the entry gets an empty block of its
                // own in front of it and stays a join point
                let pre = self.graph.add_block();
                self.graph.get_mut(pre).start = Some(self.addr);
                self.graph.add_edge(pre, entry, EdgeLabel::empty());
                self.graph.set_entry(pre);
                trace!("Entry block has predecessors"; "function" => &self.name, "entry" => ?pre);
            }
        }
        self.flags |= FuncFlags::BLOCKS_GENERATED;
        debug!("Generated blocks"; "function" => &self.name, "blocks" => self.graph.len());
    }

    fn connect_indirect(&mut self, b: BlockId, last: OpId) {
        let seq = self.store.op(last).seq();
        let Some(jt_idx) = self.jump_tables.iter().position(|jt| jt.op_seq == seq) else {
            self.graph.get_mut(b).flags |= BlockFlags::UNREACHABLE_RISK;
            self.flags |= FuncFlags::UNRESOLVED_INDIRECT;
            return;
        };
        let jt = &self.jump_tables[jt_idx];
        let mut targets: InsertionOrderedSet<Address> = InsertionOrderedSet::new();
        for &a in &jt.addresses[..jt.size] {
            targets.insert(a);
        }
        let default = jt.default_index.map(|i| targets.insert(jt.addresses[i]));

        for (i, a) in targets.into_vec().into_iter().enumerate() {
            let Some(t) = self.block_of(self.store.first_op_at(a)) else {
                self.graph.get_mut(b).flags |= BlockFlags::BAD_DATA;
                continue;
            };
            if default == Some(i) {
                self.graph.add_edge(b, t, EdgeLabel::SWITCH_DEFAULT);
                self.graph.get_mut(t).flags |= BlockFlags::SWITCH_DEFAULT;
            } else {
                self.graph.add_edge(b, t, EdgeLabel::empty());
                self.graph.get_mut(t).flags |= BlockFlags::SWITCH_CASE;
            }
        }
        self.graph.get_mut(b).jump_table = Some(jt_idx);
    }
}
