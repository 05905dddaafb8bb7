// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Simulated address space holding live instances.
//!
//! A [`Heap`] is a contiguous byte arena mapped at a fixed base address. Live
//! instances are laid out in it exactly as the descriptors describe for the
//! heap's [`Format`], with reference fields holding absolute [`Address`]es
//! (zero for null). Packed data never contains addresses, only payload-relative
//! offsets; [`Reference`] keeps the two forms apart at every read.

use std::fmt;

use crate::error::DlError;
use crate::layout::{align_up, Format};

/// Absolute address inside a [`Heap`].
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Address(pub u64);

impl Address {
    /// Address `bytes` past this one.
    #[must_use]
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Byte distance from the start of a packed payload.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Offset(pub u64);

/// Decoded contents of a pointer, string, or array-data field.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Reference {
    /// No target.
    Null,
    /// Live form: a heap address.
    Absolute(Address),
    /// Packed form: an offset from the payload start.
    Relative(Offset),
}

impl Reference {
    /// Decodes a live field value; zero is null.
    #[must_use]
    pub const fn live(raw: u64) -> Self {
        if raw == 0 {
            Self::Null
        } else {
            Self::Absolute(Address(raw))
        }
    }

    /// Decodes a packed field value; the all-ones `sentinel` is null.
    #[must_use]
    pub const fn packed(raw: u64, sentinel: u64) -> Self {
        if raw == sentinel {
            Self::Null
        } else {
            Self::Relative(Offset(raw))
        }
    }

    /// The live address, if this is an absolute reference.
    #[must_use]
    pub const fn address(self) -> Option<Address> {
        match self {
            Self::Absolute(addr) => Some(addr),
            Self::Null | Self::Relative(_) => None,
        }
    }
}

/// Default base address of a fresh heap; keeps address zero free for null.
pub const HEAP_BASE: Address = Address(0x1_0000);

/// Contiguous arena of live instances in one [`Format`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Heap {
    base: Address,
    mem: Vec<u8>,
    format: Format,
}

impl Heap {
    /// Creates an empty heap for `format`.
    #[must_use]
    pub fn new(format: Format) -> Self {
        Self {
            base: HEAP_BASE,
            mem: Vec::new(),
            format,
        }
    }

    /// Maps existing bytes (for example a packed blob) at [`HEAP_BASE`].
    #[must_use]
    pub fn from_bytes(format: Format, bytes: Vec<u8>) -> Self {
        Self {
            base: HEAP_BASE,
            mem: bytes,
            format,
        }
    }

    /// Byte order and pointer width of live instances in this heap.
    #[must_use]
    pub fn format(&self) -> Format {
        self.format
    }

    /// Address of the first byte.
    #[must_use]
    pub fn base(&self) -> Address {
        self.base
    }

    /// Number of mapped bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mem.len()
    }

    /// True when nothing is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    /// All mapped bytes, starting at [`Heap::base`].
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.mem
    }

    /// Consumes the heap, returning its bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.mem
    }

    /// Allocates `size` zeroed bytes aligned to `align`.
    pub fn alloc(&mut self, size: usize, align: usize) -> Address {
        let start = align_up(self.mem.len(), align);
        // Keep distinct allocations at distinct addresses even when empty.
        let end = start + size.max(1);
        self.mem.resize(end, 0);
        self.base.add(start)
    }

    /// Allocates a copy of `bytes` aligned to `align`.
    pub fn alloc_bytes(&mut self, bytes: &[u8], align: usize) -> Address {
        let addr = self.alloc(bytes.len(), align);
        let start = self.mem.len() - bytes.len().max(1);
        self.mem[start..start + bytes.len()].copy_from_slice(bytes);
        addr
    }

    /// Allocates `text` as NUL-terminated bytes.
    pub fn alloc_str(&mut self, text: &str) -> Address {
        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(0);
        self.alloc_bytes(&bytes, 1)
    }

    fn range(&self, addr: Address, len: usize) -> Result<std::ops::Range<usize>, DlError> {
        addr.0
            .checked_sub(self.base.0)
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|start| Some(start..start.checked_add(len)?))
            .filter(|range| range.end <= self.mem.len())
            .ok_or(DlError::BadAddress { address: addr, len })
    }

    /// Borrows `len` bytes at `addr`.
    pub fn bytes(&self, addr: Address, len: usize) -> Result<&[u8], DlError> {
        let range = self.range(addr, len)?;
        Ok(&self.mem[range])
    }

    /// Mutably borrows `len` bytes at `addr`.
    pub fn bytes_mut(&mut self, addr: Address, len: usize) -> Result<&mut [u8], DlError> {
        let range = self.range(addr, len)?;
        Ok(&mut self.mem[range])
    }

    /// Reads an unsigned integer of `size` bytes in the heap's byte order.
    pub fn read_uint(&self, addr: Address, size: usize) -> Result<u64, DlError> {
        Ok(self.format.endian.decode(self.bytes(addr, size)?))
    }

    /// Writes the low `size` bytes of `value` in the heap's byte order.
    pub fn write_uint(&mut self, addr: Address, size: usize, value: u64) -> Result<(), DlError> {
        let encoded = self.format.endian.encode(value, size);
        self.bytes_mut(addr, size)?.copy_from_slice(&encoded[..size]);
        Ok(())
    }

    /// Reads a pointer-sized live reference.
    pub fn read_ref(&self, addr: Address) -> Result<Reference, DlError> {
        self.read_uint(addr, self.format.width.bytes())
            .map(Reference::live)
    }

    /// Writes a pointer-sized live reference (`None` is null).
    pub fn write_ref(&mut self, addr: Address, target: Option<Address>) -> Result<(), DlError> {
        let raw = target.map_or(0, |t| t.0);
        if raw > u64::MAX >> (64 - 8 * self.format.width.bytes()) {
            return Err(DlError::BadAddress {
                address: Address(raw),
                len: self.format.width.bytes(),
            });
        }
        self.write_uint(addr, self.format.width.bytes(), raw)
    }

    /// Borrows the NUL-terminated bytes at `addr`, without the terminator.
    pub fn c_str(&self, addr: Address) -> Result<&[u8], DlError> {
        let start = self.range(addr, 0)?.start;
        let tail = &self.mem[start..];
        let len = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(DlError::BadAddress {
                address: addr,
                len: tail.len(),
            })?;
        Ok(&tail[..len])
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::layout::{Endian, PtrWidth};

    #[test]
    fn allocations_are_aligned_and_distinct() {
        let mut heap = Heap::new(Format::new(Endian::Little, PtrWidth::Eight));
        let a = heap.alloc(3, 1);
        let b = heap.alloc(8, 8);
        let c = heap.alloc(0, 1);
        let d = heap.alloc(0, 1);
        assert_eq!(a, HEAP_BASE);
        assert_eq!(b.0 % 8, 0);
        assert!(b.0 >= a.0 + 3);
        assert_ne!(c, d);
    }

    #[test]
    fn uint_round_trips_in_heap_order() {
        let mut heap = Heap::new(Format::new(Endian::Big, PtrWidth::Four));
        let at = heap.alloc(4, 4);
        heap.write_uint(at, 4, 0x0102_0304).unwrap();
        assert_eq!(heap.bytes(at, 4).unwrap(), &[1, 2, 3, 4]);
        assert_eq!(heap.read_uint(at, 4).unwrap(), 0x0102_0304);
    }

    #[test]
    fn references_distinguish_null() {
        let mut heap = Heap::new(Format::new(Endian::Little, PtrWidth::Four));
        let slot = heap.alloc(4, 4);
        assert_eq!(heap.read_ref(slot).unwrap(), Reference::Null);
        heap.write_ref(slot, Some(slot)).unwrap();
        assert_eq!(heap.read_ref(slot).unwrap(), Reference::Absolute(slot));
        assert!(heap.write_ref(slot, Some(Address(1 << 40))).is_err());
        assert_eq!(Reference::packed(u64::from(u32::MAX), u64::from(u32::MAX)), Reference::Null);
        assert_eq!(Reference::packed(0, u64::from(u32::MAX)), Reference::Relative(Offset(0)));
    }

    #[test]
    fn strings_and_bounds() {
        let mut heap = Heap::new(Format::host());
        let s = heap.alloc_str("hi");
        assert_eq!(heap.c_str(s).unwrap(), b"hi");
        assert!(heap.bytes(Address(0), 1).is_err());
        assert!(heap.bytes(s, 100).is_err());
    }
}
