//! Access to the bytes of the binary being analysed.

use crate::error::ImageError;
use crate::il::{Address, Endian, SpaceId};

/// A named address in the image, typically a function entry point
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub addr: Address,
    /// Size in bytes, or 0 if unknown
    pub size: u64,
}

/// The binary image a session analyses
pub trait LoadImage {
    /// Read exactly `size` bytes at `addr`
    fn read_bytes(&self, addr: Address, size: usize) -> Result<Vec<u8>, ImageError>;
    /// Whether `addr` lies in an executable region
    fn is_code(&self, addr: Address) -> bool;
    /// Whether the `size` bytes at `addr` lie in a region that is never written at runtime
    fn is_readonly(&self, addr: Address, size: usize) -> bool;
    /// Symbols known to the image
    fn symbols(&self) -> Vec<Symbol> {
        vec![]
    }
}

/// Read an unsigned integer of `size` bytes at `addr`
pub fn read_value(
    image: &dyn LoadImage,
    addr: Address,
    size: usize,
    endian: Endian,
) -> Result<u64, ImageError> {
    let bytes = image.read_bytes(addr, size)?;
    if size > 8 {
        return Err(ImageError::OutOfRange { addr, size });
    }
    let fold = |acc: u64, b: &u8| (acc << 8) | u64::from(*b);
    Ok(match endian {
        Endian::Big => bytes.iter().fold(0, fold),
        Endian::Little => bytes.iter().rev().fold(0, fold),
    })
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegionKind {
    /// Executable, read-only
    Code,
    /// Read-only data (constant pools, jump tables)
    ReadOnly,
    /// Writable data
    Data,
}

#[derive(Clone, Debug)]
pub struct Region {
    pub start: u64,
    pub bytes: Vec<u8>,
    pub kind: RegionKind,
}

impl Region {
    fn contains(&self, offset: u64, size: usize) -> bool {
        offset >= self.start
            && offset
                .checked_add(size as u64)
                .map_or(false, |end| end <= self.start + self.bytes.len() as u64)
    }
}

/// An image held entirely in memory, as a set of non-overlapping regions of one address space
#[derive(Clone, Debug)]
pub struct MemoryImage {
    space: SpaceId,
    regions: Vec<Region>,
    symbols: Vec<Symbol>,
}

impl MemoryImage {
    pub fn new(space: SpaceId) -> Self {
        Self {
            space,
            regions: vec![],
            symbols: vec![],
        }
    }

    pub fn add_region(&mut self, start: u64, bytes: Vec<u8>, kind: RegionKind) {
        self.regions.push(Region { start, bytes, kind });
        self.regions.sort_by_key(|r| r.start);
    }

    pub fn add_symbol(&mut self, name: impl Into<String>, offset: u64, size: u64) {
        self.symbols.push(Symbol {
            name: name.into(),
            addr: Address::new(self.space, offset),
            size,
        });
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    fn region(&self, addr: Address, size: usize) -> Option<&Region> {
        if addr.space != self.space {
            return None;
        }
        self.regions
            .iter()
            .find(|r| r.contains(addr.offset, size.max(1)))
    }
}

impl LoadImage for MemoryImage {
    fn read_bytes(&self, addr: Address, size: usize) -> Result<Vec<u8>, ImageError> {
        let r = self
            .region(addr, size)
            .ok_or(ImageError::OutOfRange { addr, size })?;
        let start = (addr.offset - r.start) as usize;
        Ok(r.bytes[start..start + size].to_vec())
    }

    fn is_code(&self, addr: Address) -> bool {
        self.region(addr, 1)
            .map_or(false, |r| r.kind == RegionKind::Code)
    }

    fn is_readonly(&self, addr: Address, size: usize) -> bool {
        self.region(addr, size)
            .map_or(false, |r| r.kind != RegionKind::Data)
    }

    fn symbols(&self) -> Vec<Symbol> {
        self.symbols.clone()
    }
}
