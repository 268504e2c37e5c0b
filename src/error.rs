//! Errors for requests that can be rejected, and for malformed external input.
//!
//! Conditions discovered while analysing a function (bad data, unresolved indirect branches,
//! ...) are not errors; they are recorded as [`FuncFlags`](crate::funcdata::FuncFlags) on the
//! function instead.

use thiserror::Error;

use crate::il::Address;
use crate::ir::VarnodeId;

/// Rejected requests on the IR store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IrError {
    /// A varnode can only be deleted once nothing reads it
    #[error("varnode {0:?} still has {1} use(s)")]
    VarnodeHasUses(VarnodeId, usize),
    /// A varnode can only be deleted once its defining op has released it
    #[error("varnode {0:?} is still defined by an op")]
    VarnodeIsWritten(VarnodeId),
    #[error("stale varnode handle {0:?}")]
    StaleVarnode(VarnodeId),
}

/// Failures of an [`InstructionDecoder`](crate::decoder::InstructionDecoder)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Bytes at the address do not form an instruction
    #[error("no instruction at {0:?}")]
    NoInstruction(Address),
    /// The instruction is recognised, but its semantics are not modelled
    #[error("unimplemented instruction at {0:?}")]
    Unimplemented(Address),
}

/// Failures reading from a [`LoadImage`](crate::image::LoadImage)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("{size} byte(s) at {addr:?} are not backed by the image")]
    OutOfRange { addr: Address, size: usize },
}

/// A malformed listing file
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListingError {
    #[error("missing section `{0}`")]
    MissingSection(&'static str),
    #[error("line {line}: {message}")]
    Malformed { line: usize, message: String },
}

/// Rejected requests on a [`Session`](crate::session::Session)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("no function named `{0}`")]
    UnknownName(String),
    #[error("{0:?} is not in a code region of the image")]
    NotCode(Address),
}
