// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Packed-instance header and header inspection.
//!
//! # Layout
//!
//! | Field | Width | Notes |
//! |---|---|---|
//! | magic | 4 | `"DLDL"`; reads as the swapped value in the other byte order |
//! | version | 4 | [`INSTANCE_VERSION`] |
//! | root type | 4 | [`TypeId`] of the root struct |
//! | payload size | 4 | bytes after the header and its alignment padding |
//! | 64-bit flag | 1 (+3 pad) | 0 = 4-byte pointers, 1 = 8-byte pointers |
//!
//! All fields are written in the byte order of the instance. The payload
//! starts at [`payload_start`], the header size rounded up to the root type's
//! alignment.

use bytemuck::{Pod, Zeroable};

use crate::error::DlError;
use crate::ident::TypeId;
use crate::layout::{align_up, Endian, Format, PtrWidth};

/// Magic id `"DLDL"`.
pub const INSTANCE_MAGIC: u32 = u32::from_be_bytes(*b"DLDL");

/// Magic id as read from data of the opposite byte order.
pub const INSTANCE_MAGIC_SWAPPED: u32 = INSTANCE_MAGIC.swap_bytes();

/// Packed-instance format version written and accepted by this engine.
pub const INSTANCE_VERSION: u32 = 1;

/// Size of [`DataHeader`] in bytes.
pub const HEADER_SIZE: usize = 20;

/// Fixed-size packed-instance header (20 bytes).
///
/// Fields hold values already decoded to native integers; use
/// [`DataHeader::encode`] and [`DataHeader::decode`] to cross the byte-order
/// boundary.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct DataHeader {
    /// Magic id.
    pub id: u32,
    /// Format version.
    pub version: u32,
    /// Root type id.
    pub root_type: u32,
    /// Payload byte length.
    pub payload_size: u32,
    /// 1 when pointers are 8 bytes wide.
    pub is_64_bit_ptr: u8,
    /// Zero padding.
    pub pad: [u8; 3],
}

const _: () = assert!(std::mem::size_of::<DataHeader>() == HEADER_SIZE);

impl DataHeader {
    /// Header for a fresh instance of `root` in `width` layout.
    #[must_use]
    pub fn new(root: TypeId, payload_size: u32, width: PtrWidth) -> Self {
        Self {
            id: INSTANCE_MAGIC,
            version: INSTANCE_VERSION,
            root_type: root.raw(),
            payload_size,
            is_64_bit_ptr: u8::from(width == PtrWidth::Eight),
            pad: [0; 3],
        }
    }

    /// Encodes the header in `endian` byte order.
    #[must_use]
    pub fn encode(&self, endian: Endian) -> [u8; HEADER_SIZE] {
        let conv = |v: u32| match endian {
            Endian::Little => v.to_le(),
            Endian::Big => v.to_be(),
        };
        let raw = Self {
            id: conv(self.id),
            version: conv(self.version),
            root_type: conv(self.root_type),
            payload_size: conv(self.payload_size),
            is_64_bit_ptr: self.is_64_bit_ptr,
            pad: [0; 3],
        };
        bytemuck::cast(raw)
    }

    /// Decodes a header, detecting the byte order from the magic id.
    ///
    /// Only the magic and the pointer-width flag are validated.
    pub fn decode(data: &[u8]) -> Result<(Self, Endian), DlError> {
        let bytes = data
            .get(..HEADER_SIZE)
            .ok_or(DlError::MalformedData("data smaller than instance header"))?;
        let raw: Self = bytemuck::pod_read_unaligned(bytes);
        let endian = if u32::from_le(raw.id) == INSTANCE_MAGIC {
            Endian::Little
        } else if u32::from_be(raw.id) == INSTANCE_MAGIC {
            Endian::Big
        } else {
            return Err(DlError::MalformedData("bad instance magic"));
        };
        let conv = |v: u32| match endian {
            Endian::Little => u32::from_le(v),
            Endian::Big => u32::from_be(v),
        };
        if raw.is_64_bit_ptr > 1 {
            return Err(DlError::MalformedData("bad pointer-width flag"));
        }
        Ok((
            Self {
                id: conv(raw.id),
                version: conv(raw.version),
                root_type: conv(raw.root_type),
                payload_size: conv(raw.payload_size),
                is_64_bit_ptr: raw.is_64_bit_ptr,
                pad: raw.pad,
            },
            endian,
        ))
    }

    /// Root type id.
    #[must_use]
    pub fn root(&self) -> TypeId {
        TypeId(self.root_type)
    }

    /// Pointer width of the payload.
    #[must_use]
    pub fn width(&self) -> PtrWidth {
        if self.is_64_bit_ptr == 1 {
            PtrWidth::Eight
        } else {
            PtrWidth::Four
        }
    }
}

/// Position of the payload for a root type aligned to `root_align`.
#[must_use]
pub fn payload_start(root_align: usize) -> usize {
    align_up(HEADER_SIZE, root_align)
}

/// Summary of a packed instance's header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstanceInfo {
    /// Byte order and pointer width of the payload.
    pub format: Format,
    /// Root type id.
    pub root_type: TypeId,
    /// Payload byte length.
    pub payload_size: u32,
    /// Format version.
    pub version: u32,
}

/// Inspects a packed instance's header without validating or loading the payload.
pub fn instance_info(packed: &[u8]) -> Result<InstanceInfo, DlError> {
    let (header, endian) = DataHeader::decode(packed)?;
    Ok(InstanceInfo {
        format: Format::new(endian, header.width()),
        root_type: header.root(),
        payload_size: header.payload_size,
        version: header.version,
    })
}
