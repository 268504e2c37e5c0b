//! The boundary with the instruction decoder: decoders report the micro-operations of one
//! machine instruction through [`PcodeEmit`].

use crate::error::DecodeError;
use crate::il::{Address, Opcode, VarnodeData};

/// Receiver of the micro-operations of one instruction, in execution order
pub trait PcodeEmit {
    fn dump(
        &mut self,
        addr: Address,
        opcode: Opcode,
        out: Option<&VarnodeData>,
        inputs: &[VarnodeData],
    );
}

/// A target-specific instruction decoder
pub trait InstructionDecoder {
    /// Decode the instruction at `addr`, reporting its micro-operations to `emit`. Returns the
    /// instruction length in bytes.
    fn one_instruction(&self, emit: &mut dyn PcodeEmit, addr: Address)
        -> Result<usize, DecodeError>;
}

/// One micro-operation as reported by a decoder
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmittedOp {
    pub opcode: Opcode,
    pub output: Option<VarnodeData>,
    pub inputs: Vec<VarnodeData>,
}

/// A [`PcodeEmit`] that simply records what it is given
#[derive(Default, Debug)]
pub struct OpCollector {
    pub ops: Vec<EmittedOp>,
}

impl PcodeEmit for OpCollector {
    fn dump(
        &mut self,
        _addr: Address,
        opcode: Opcode,
        out: Option<&VarnodeData>,
        inputs: &[VarnodeData],
    ) {
        self.ops.push(EmittedOp {
            opcode,
            output: out.copied(),
            inputs: inputs.to_vec(),
        });
    }
}
