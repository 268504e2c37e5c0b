//! A lifter from textual micro-op listings.
//!
//! A listing describes a target, an image and the micro-operations of each instruction, and is
//! turned into everything a [`Session`] needs. Sections start with a header line and run until
//! the next header; blank lines and lines starting with `#` are ignored.
//!
//! ```text
//! ARCH
//! name toy
//! big_endian false
//! code_space ram
//! sp register:0x34:4
//! lr register:0x38:4
//!
//! ADDRESS_SPACES
//! ram processor 4
//! register register 4
//! unique unique 4
//!
//! IMAGE
//! code 0x1000 +0x100
//! rodata 0x2000 10100000 18100000
//!
//! SYMBOLS
//! 0x1000 0x20 main
//!
//! LISTING
//! 0x1000 4
//!   register:0x0:4 = INT_ADD register:0x0:4 const:0x1:4
//!   CBRANCH ram:0x1010:4 register:0x10:1
//! 0x1004 4 unimplemented
//! ```
//!
//! Image regions are `code`, `rodata` or `data`, followed by a start offset and either `+len`
//! (zero-filled) or hex bytes. Varnodes are written `space:offset:size`; the constant space is
//! always available as `const`.

use crate::decoder::{EmittedOp, InstructionDecoder, PcodeEmit};
use crate::error::{DecodeError, ListingError};
use crate::il::{Address, AddressSpace, Endian, Opcode, SpaceId, SpaceKind, Spaces, VarnodeData};
use crate::image::{MemoryImage, RegionKind};
use crate::log::*;
use crate::session::{Architecture, Limits, Session};

use std::collections::BTreeMap;

use itertools::Itertools;

/// The micro-operations of one listed instruction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListedInstruction {
    pub len: usize,
    pub ops: Vec<EmittedOp>,
    /// Decoding succeeds but the semantics are unknown
    pub unimplemented: bool,
}

/// A decoder that replays listed instructions
#[derive(Clone, Debug, Default)]
pub struct ListingDecoder {
    instructions: BTreeMap<Address, ListedInstruction>,
}

impl ListingDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_instruction(&mut self, addr: Address, len: usize, ops: Vec<EmittedOp>) {
        self.instructions.insert(
            addr,
            ListedInstruction {
                len,
                ops,
                unimplemented: false,
            },
        );
    }

    pub fn add_unimplemented(&mut self, addr: Address, len: usize) {
        self.instructions.insert(
            addr,
            ListedInstruction {
                len,
                ops: vec![],
                unimplemented: true,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

impl InstructionDecoder for ListingDecoder {
    fn one_instruction(
        &self,
        emit: &mut dyn PcodeEmit,
        addr: Address,
    ) -> Result<usize, DecodeError> {
        let ins = self
            .instructions
            .get(&addr)
            .ok_or(DecodeError::NoInstruction(addr))?;
        if ins.unimplemented {
            return Err(DecodeError::Unimplemented(addr));
        }
        for op in &ins.ops {
            emit.dump(addr, op.opcode, op.output.as_ref(), &op.inputs);
        }
        Ok(ins.len)
    }
}

/// Everything read from a listing
#[derive(Clone, Debug)]
pub struct Listing {
    pub name: String,
    pub arch: Architecture,
    pub image: MemoryImage,
    pub decoder: ListingDecoder,
}

impl Listing {
    /// A session over this listing, with every listed symbol registered as a function
    pub fn into_session(self, limits: Limits) -> Session {
        let mut session = Session::new(
            self.arch,
            Box::new(self.decoder),
            Box::new(self.image),
            limits,
        );
        let found = session.discover_functions_from_symbols();
        debug!("Registered functions from symbols"; "count" => found);
        session
    }
}

const SECTIONS: [&str; 5] = ["ARCH", "ADDRESS_SPACES", "IMAGE", "SYMBOLS", "LISTING"];

fn malformed(line: usize, message: impl Into<String>) -> ListingError {
    ListingError::Malformed {
        line,
        message: message.into(),
    }
}

fn parse_u64(line: usize, s: &str) -> Result<u64, ListingError> {
    let r = match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    r.map_err(|_| malformed(line, format!("expected a number, got `{}`", s)))
}

fn parse_varnode(line: usize, spaces: &Spaces, s: &str) -> Result<VarnodeData, ListingError> {
    let (space, offset, size) = s
        .split(':')
        .collect_tuple()
        .ok_or_else(|| malformed(line, format!("expected space:offset:size, got `{}`", s)))?;
    let space = spaces
        .by_name(space)
        .ok_or_else(|| malformed(line, format!("unknown address space `{}`", space)))?;
    let size = parse_u64(line, size)?;
    Ok(VarnodeData::new(space, parse_u64(line, offset)?, size as u32))
}

fn parse_op(line: usize, spaces: &Spaces, s: &str) -> Result<EmittedOp, ListingError> {
    let (output, rest) = match s.split_once('=') {
        Some((out, rest)) => (Some(parse_varnode(line, spaces, out.trim())?), rest),
        None => (None, s),
    };
    let mut words = rest.split_whitespace();
    let name = words
        .next()
        .ok_or_else(|| malformed(line, "missing opcode"))?;
    let opcode =
        Opcode::from_name(name).ok_or_else(|| malformed(line, format!("unknown opcode `{}`", name)))?;
    if matches!(opcode, Opcode::MultiEqual | Opcode::Indirect) {
        return Err(malformed(line, format!("{} cannot be listed", opcode)));
    }
    let inputs = words
        .map(|w| parse_varnode(line, spaces, w))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(EmittedOp {
        opcode,
        output,
        inputs,
    })
}

fn parse_bytes(line: usize, words: &[&str]) -> Result<Vec<u8>, ListingError> {
    let hex: String = words.iter().join("");
    if hex.len() % 2 != 0 {
        return Err(malformed(line, "odd number of hex digits"));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| malformed(line, format!("bad hex byte `{}`", &hex[i..i + 2])))
        })
        .collect()
}

/// Split into sections, keeping 1-based line numbers
fn sections(listing: &str) -> Result<BTreeMap<&'static str, Vec<(usize, &str)>>, ListingError> {
    let mut sections: BTreeMap<&'static str, Vec<(usize, &str)>> = BTreeMap::new();
    let mut current: Option<&'static str> = None;
    for (i, raw) in listing.lines().enumerate() {
        let line = i + 1;
        let trimmed = raw.trim_end();
        if trimmed.trim().is_empty() || trimmed.trim_start().starts_with('#') {
            continue;
        }
        if let Some(header) = SECTIONS.iter().find(|h| **h == trimmed).copied() {
            sections.entry(header).or_default();
            current = Some(header);
            continue;
        }
        let section = current.ok_or_else(|| malformed(line, "content before the first section"))?;
        sections.entry(section).or_default().push((line, trimmed));
    }
    Ok(sections)
}

/// Lift a listing into an architecture, image and decoder.
pub fn lift_from(listing: &str) -> Result<Listing, ListingError> {
    let sections = sections(listing)?;
    let section = |name: &'static str| {
        sections
            .get(name)
            .map(|v| v.as_slice())
            .ok_or(ListingError::MissingSection(name))
    };

    // Arch, first pass: only endianness is needed to build the spaces
    let mut props: BTreeMap<&str, (usize, &str)> = BTreeMap::new();
    for &(line, l) in section("ARCH")? {
        let (k, v) = l
            .trim()
            .split_once(' ')
            .ok_or_else(|| malformed(line, "expected `key value`"))?;
        props.insert(k, (line, v.trim()));
    }
    let prop = |k: &'static str| {
        props
            .get(k)
            .copied()
            .ok_or_else(|| malformed(0, format!("ARCH is missing `{}`", k)))
    };
    let endianness = match prop("big_endian")? {
        (_, "false") => Endian::Little,
        (_, "true") => Endian::Big,
        (line, v) => return Err(malformed(line, format!("expected true/false, got `{}`", v))),
    };
    let name = props.get("name").map_or("listing", |&(_, n)| n).to_owned();

    let mut spaces = vec![];
    for &(line, l) in section("ADDRESS_SPACES")? {
        let (name, kind, size) = l
            .split_whitespace()
            .collect_tuple()
            .ok_or_else(|| malformed(line, "expected `name kind pointer-size`"))?;
        let kind = match kind {
            "processor" => SpaceKind::Processor,
            "register" => SpaceKind::Register,
            "unique" => SpaceKind::Unique,
            "constant" => SpaceKind::Constant,
            k => return Err(malformed(line, format!("unknown space kind `{}`", k))),
        };
        spaces.push(AddressSpace {
            name: name.to_owned(),
            kind,
            endianness,
            addr_size: parse_u64(line, size)? as usize,
        });
    }
    let spaces = Spaces::new(spaces);

    let (line, code) = prop("code_space")?;
    let code_space = spaces
        .by_name(code)
        .ok_or_else(|| malformed(line, format!("unknown address space `{}`", code)))?;
    let (line, sp) = prop("sp")?;
    let sp = parse_varnode(line, &spaces, sp)?;
    let lr = match props.get("lr") {
        Some(&(line, lr)) => Some(parse_varnode(line, &spaces, lr)?),
        None => None,
    };

    let mut image = MemoryImage::new(code_space);
    for &(line, l) in sections.get("IMAGE").map_or(&[][..], |v| v.as_slice()) {
        let words: Vec<&str> = l.split_whitespace().collect();
        let [kind, start, contents @ ..] = words.as_slice() else {
            return Err(malformed(line, "expected `kind start contents`"));
        };
        let kind = match *kind {
            "code" => RegionKind::Code,
            "rodata" => RegionKind::ReadOnly,
            "data" => RegionKind::Data,
            k => return Err(malformed(line, format!("unknown region kind `{}`", k))),
        };
        let start = parse_u64(line, start)?;
        let bytes = match contents {
            [len] if len.starts_with('+') => vec![0; parse_u64(line, &len[1..])? as usize],
            words => parse_bytes(line, words)?,
        };
        image.add_region(start, bytes, kind);
    }

    for &(line, l) in sections.get("SYMBOLS").map_or(&[][..], |v| v.as_slice()) {
        let (addr, size, name) = l
            .split_whitespace()
            .collect_tuple()
            .ok_or_else(|| malformed(line, "expected `addr size name`"))?;
        image.add_symbol(name, parse_u64(line, addr)?, parse_u64(line, size)?);
    }

    let mut decoder = ListingDecoder::new();
    let mut current: Option<(Address, usize, Vec<EmittedOp>)> = None;
    for &(line, l) in section("LISTING")? {
        if l.starts_with(char::is_whitespace) {
            let (_, _, ops) = current
                .as_mut()
                .ok_or_else(|| malformed(line, "op outside of an instruction"))?;
            ops.push(parse_op(line, &spaces, l.trim())?);
            continue;
        }
        if let Some((addr, len, ops)) = current.take() {
            decoder.add_instruction(addr, len, ops);
        }
        let words: Vec<&str> = l.split_whitespace().collect();
        match words.as_slice() {
            [addr, len] => {
                let addr = Address::new(code_space, parse_u64(line, addr)?);
                current = Some((addr, parse_u64(line, len)? as usize, vec![]));
            }
            [addr, len, "unimplemented"] => {
                let addr = Address::new(code_space, parse_u64(line, addr)?);
                decoder.add_unimplemented(addr, parse_u64(line, len)? as usize);
            }
            _ => return Err(malformed(line, "expected `addr len [unimplemented]`")),
        }
    }
    if let Some((addr, len, ops)) = current.take() {
        decoder.add_instruction(addr, len, ops);
    }
    trace!("Lifted listing"; "name" => &name, "instructions" => decoder.len());

    Ok(Listing {
        name,
        arch: Architecture {
            spaces,
            code_space,
            sp,
            lr,
        },
        image,
        decoder,
    })
}

/// Convenience for tests and tools: the id of a named space in a lifted listing
pub fn space(listing: &Listing, name: &str) -> Option<SpaceId> {
    listing.arch.spaces.by_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: &str = "ARCH
name small
big_endian false
code_space ram
sp register:0x34:4

ADDRESS_SPACES
ram processor 4
register register 4
unique unique 4

IMAGE
code 0x1000 +0x10
rodata 0x2000 78563412

SYMBOLS
0x1000 0x8 main

LISTING
0x1000 4
  register:0x0:4 = COPY const:0x5:4
0x1004 4
  RETURN register:0x38:4
0x1008 4 unimplemented
";

    #[test]
    fn lifts_small_listing() {
        let l = lift_from(SMALL).unwrap();
        assert_eq!(l.name, "small");
        let ram = space(&l, "ram").unwrap();
        let reg = space(&l, "register").unwrap();
        assert_eq!(l.arch.code_space, ram);
        assert_eq!(l.arch.sp, VarnodeData::new(reg, 0x34, 4));
        assert_eq!(l.arch.lr, None);
        assert_eq!(l.decoder.len(), 3);

        let mut collector = crate::decoder::OpCollector::default();
        let len = l
            .decoder
            .one_instruction(&mut collector, Address::new(ram, 0x1000))
            .unwrap();
        assert_eq!(len, 4);
        assert_eq!(collector.ops.len(), 1);
        assert_eq!(collector.ops[0].opcode, Opcode::Copy);
        assert_eq!(
            collector.ops[0].output,
            Some(VarnodeData::new(reg, 0, 4))
        );
        assert_eq!(
            l.decoder
                .one_instruction(&mut collector, Address::new(ram, 0x1008)),
            Err(DecodeError::Unimplemented(Address::new(ram, 0x1008)))
        );
        assert_eq!(
            l.decoder
                .one_instruction(&mut collector, Address::new(ram, 0x100c)),
            Err(DecodeError::NoInstruction(Address::new(ram, 0x100c)))
        );
    }

    #[test]
    fn reports_line_of_malformed_op() {
        let bad = SMALL.replace("COPY const:0x5:4", "FROB const:0x5:4");
        match lift_from(&bad) {
            Err(ListingError::Malformed { line, message }) => {
                assert_eq!(line, 21);
                assert!(message.contains("FROB"));
            }
            r => panic!("Expected malformed listing, got {:?}", r.map(|l| l.name)),
        }
    }

    #[test]
    fn missing_listing_section() {
        let cut = &SMALL[..SMALL.find("LISTING").unwrap()];
        assert_eq!(
            lift_from(cut).map(|l| l.name),
            Err(ListingError::MissingSection("LISTING"))
        );
    }
}
