//! The analysis session: the target architecture, the image and decoder, per-session limits, and
//! every function known so far.
//!
//! Functions are analysed on demand. Analysing a function first discovers its code, then
//! analyses each function it calls before finishing its own analysis, so callees are complete by
//! the time their callers are. A call back into a function whose analysis is still under way
//! (recursion) is not followed; the call site is linked to the in-progress function and updated
//! once that function completes.

use crate::analysis_config::CONFIG;
use crate::decoder::InstructionDecoder;
use crate::error::SessionError;
use crate::funcdata::{AnalysisContext, CallStatus, FuncFlags, Function};
use crate::il::{Address, Endian, SpaceId, Spaces, VarnodeData};
use crate::image::LoadImage;
use crate::log::*;

use std::collections::BTreeMap;

/// What the analysis needs to know about the target processor
#[derive(Clone, Debug)]
pub struct Architecture {
    pub spaces: Spaces,
    /// The space holding instructions
    pub code_space: SpaceId,
    /// The stack pointer register
    pub sp: VarnodeData,
    /// The link register, on targets that have one
    pub lr: Option<VarnodeData>,
}

impl Architecture {
    /// Endianness of the code space, used for reading tables out of the image
    pub fn endian(&self) -> Endian {
        self.spaces.get(self.code_space).endianness
    }
}

/// Per-session thresholds
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Limits {
    /// Instructions decoded per function before flow following gives up
    pub max_instructions: usize,
    /// Symbols smaller than this are not treated as functions
    pub min_funcsymbol_size: u64,
    /// Largest value, in bytes, the analysis treats as a scalar
    pub max_basetype_size: u32,
    /// Jump tables with more entries are rejected
    pub max_jump_table_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_instructions: 1_000_000,
            min_funcsymbol_size: 1,
            max_basetype_size: 8,
            max_jump_table_size: 1024,
        }
    }
}

/// Index of a function within its [`Session`]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct FuncId(pub usize);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FuncStatus {
    Pending,
    Processing,
    Done,
}

struct FuncSlot {
    name: String,
    addr: Address,
    size: u64,
    status: FuncStatus,
    /// Absent while the function is being analysed
    func: Option<Box<Function>>,
    /// Call sites `(caller, index into its call specs)` to link once this function completes
    waiting: Vec<(FuncId, usize)>,
}

pub struct Session {
    pub arch: Architecture,
    pub limits: Limits,
    decoder: Box<dyn InstructionDecoder>,
    image: Box<dyn LoadImage>,
    funcs: Vec<FuncSlot>,
    by_addr: BTreeMap<Address, FuncId>,
    by_name: BTreeMap<String, FuncId>,
}

impl Session {
    pub fn new(
        arch: Architecture,
        decoder: Box<dyn InstructionDecoder>,
        image: Box<dyn LoadImage>,
        limits: Limits,
    ) -> Self {
        Self {
            arch,
            limits,
            decoder,
            image,
            funcs: vec![],
            by_addr: Default::default(),
            by_name: Default::default(),
        }
    }

    pub fn image(&self) -> &dyn LoadImage {
        &*self.image
    }

    fn context(&self) -> AnalysisContext<'_> {
        AnalysisContext {
            decoder: &*self.decoder,
            image: &*self.image,
            arch: &self.arch,
            limits: &self.limits,
        }
    }

    /// Register a function at `addr`, or return the one already there
    pub fn add_function(
        &mut self,
        name: impl Into<String>,
        addr: Address,
        size: u64,
    ) -> Result<FuncId, SessionError> {
        if let Some(&id) = self.by_addr.get(&addr) {
            return Ok(id);
        }
        if !self.image.is_code(addr) {
            return Err(SessionError::NotCode(addr));
        }
        let mut name = name.into();
        if self.by_name.contains_key(&name) {
            name = format!("{}_{:x}", name, addr.offset);
        }
        let id = FuncId(self.funcs.len());
        trace!("New function"; "name" => &name, "addr" => ?addr);
        self.funcs.push(FuncSlot {
            name: name.clone(),
            addr,
            size,
            status: FuncStatus::Pending,
            func: None,
            waiting: vec![],
        });
        self.by_addr.insert(addr, id);
        self.by_name.insert(name, id);
        Ok(id)
    }

    /// Register every code symbol of the image that is large enough to be a function. Returns the
    /// number of functions added.
    pub fn discover_functions_from_symbols(&mut self) -> usize {
        let before = self.funcs.len();
        for sym in self.image.symbols() {
            if sym.size < self.limits.min_funcsymbol_size {
                continue;
            }
            if let Err(e) = self.add_function(sym.name.clone(), sym.addr, sym.size) {
                debug!("Skipping symbol"; "name" => &sym.name, "reason" => %e);
            }
        }
        self.funcs.len() - before
    }

    pub fn find_func(&self, addr: Address) -> Option<FuncId> {
        self.by_addr.get(&addr).copied()
    }

    pub fn find_func_by_name(&self, name: &str) -> Result<FuncId, SessionError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| SessionError::UnknownName(name.to_owned()))
    }

    pub fn num_functions(&self) -> usize {
        self.funcs.len()
    }

    pub fn name(&self, id: FuncId) -> &str {
        &self.funcs[id.0].name
    }

    pub fn status(&self, id: FuncId) -> FuncStatus {
        self.funcs[id.0].status
    }

    /// The analysed function, once its analysis has completed
    pub fn function(&self, id: FuncId) -> Option<&Function> {
        self.funcs[id.0].func.as_deref()
    }

    /// Analysed functions, in registration order
    pub fn functions(&self) -> impl Iterator<Item = (FuncId, &Function)> {
        self.funcs
            .iter()
            .enumerate()
            .filter_map(|(i, s)| Some((FuncId(i), s.func.as_deref()?)))
    }

    /// Analyse the function `id`, and (if enabled) everything it calls
    pub fn analyze(&mut self, id: FuncId) {
        if self.funcs[id.0].status != FuncStatus::Pending {
            return;
        }
        self.funcs[id.0].status = FuncStatus::Processing;
        let slot = &self.funcs[id.0];
        let mut func = Box::new(Function::new(
            slot.name.clone(),
            slot.addr,
            &self.arch.spaces,
            self.limits.max_instructions,
        ));
        func.size = slot.size;
        func.flags |= FuncFlags::PROCESSING_STARTED;
        debug!("Analysing function"; "name" => &func.name, "addr" => ?func.addr);

        func.discover_flow(&self.context());
        if CONFIG.follow_calls {
            self.link_calls(id, &mut func);
        }
        func.finish_analysis(&self.context());

        let slot = &mut self.funcs[id.0];
        slot.func = Some(func);
        slot.status = FuncStatus::Done;
        for (caller, idx) in std::mem::take(&mut slot.waiting) {
            if let Some(spec) = self.funcs[caller.0]
                .func
                .as_mut()
                .and_then(|f| f.call_specs.get_mut(idx))
            {
                spec.status = CallStatus::Resolved(id);
            }
        }
    }

    fn link_calls(&mut self, id: FuncId, func: &mut Function) {
        for idx in 0..func.call_specs.len() {
            let Some(target) = func.call_specs[idx].target else {
                continue;
            };
            let callee = match self.find_func(target) {
                Some(c) => c,
                None => match self.add_function(format!("func_{:x}", target.offset), target, 0) {
                    Ok(c) => c,
                    Err(e) => {
                        info!("Call target is not a function"; "caller" => &func.name, "reason" => %e);
                        func.call_specs[idx].status = CallStatus::Unknown;
                        continue;
                    }
                },
            };
            self.analyze(callee);
            func.call_specs[idx].status = match self.funcs[callee.0].status {
                FuncStatus::Done => CallStatus::Resolved(callee),
                FuncStatus::Processing => {
                    info!(
                        "Recursive call";
                        "caller" => &func.name,
                        "callee" => &self.funcs[callee.0].name,
                    );
                    func.flags |= FuncFlags::RECURSION_GUARD;
                    self.funcs[callee.0].waiting.push((id, idx));
                    CallStatus::InProgress(callee)
                }
                FuncStatus::Pending => CallStatus::Unknown,
            };
        }
    }

    /// Analyse every registered function, including those discovered along the way
    pub fn analyze_all(&mut self) {
        let mut i = 0;
        while i < self.funcs.len() {
            self.analyze(FuncId(i));
            i += 1;
        }
    }
}
