// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Platform layout parameters: byte order, pointer width, and alignment math.
//!
//! Every descriptor carries two layouts, one per [`PtrWidth`]. Byte order is
//! orthogonal to layout and only affects how multi-byte values are encoded.

use serde::{Deserialize, Serialize};

use crate::error::DlError;

/// Byte order of a packed instance or live heap.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    /// Least significant byte first.
    Little,
    /// Most significant byte first.
    Big,
}

impl Endian {
    /// Byte order of the machine running this code.
    #[must_use]
    pub const fn host() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }

    /// Returns the opposite byte order.
    #[must_use]
    pub const fn swapped(self) -> Self {
        match self {
            Self::Little => Self::Big,
            Self::Big => Self::Little,
        }
    }

    /// Decodes an unsigned integer of `bytes.len()` bytes (1, 2, 4 or 8).
    ///
    /// Other lengths decode as if zero-extended; callers only pass POD widths.
    #[must_use]
    pub fn decode(self, bytes: &[u8]) -> u64 {
        match self {
            Self::Little => bytes
                .iter()
                .rev()
                .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)),
            Self::Big => bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)),
        }
    }

    /// Encodes the low `size` bytes of `value` into the front of the returned array.
    #[must_use]
    pub fn encode(self, value: u64, size: usize) -> [u8; 8] {
        let mut out = [0u8; 8];
        let size = size.min(8);
        let le = value.to_le_bytes();
        match self {
            Self::Little => out[..size].copy_from_slice(&le[..size]),
            Self::Big => {
                for (dst, src) in out[..size].iter_mut().zip(le[..size].iter().rev()) {
                    *dst = *src;
                }
            }
        }
        out
    }
}

/// Pointer width of a layout: selects which half of each descriptor's
/// size/alignment/offset pair applies.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum PtrWidth {
    /// 4-byte pointers.
    #[serde(rename = "4")]
    Four,
    /// 8-byte pointers.
    #[serde(rename = "8")]
    Eight,
}

impl PtrWidth {
    /// Pointer width of the machine running this code.
    #[must_use]
    pub const fn host() -> Self {
        if cfg!(target_pointer_width = "64") {
            Self::Eight
        } else {
            Self::Four
        }
    }

    /// Validates a raw pointer size in bytes.
    pub fn from_bytes(bytes: usize) -> Result<Self, DlError> {
        match bytes {
            4 => Ok(Self::Four),
            8 => Ok(Self::Eight),
            other => Err(DlError::InvalidParameter(format!(
                "pointer size must be 4 or 8, got {other}"
            ))),
        }
    }

    /// Size of a pointer in bytes.
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::Four => 4,
            Self::Eight => 8,
        }
    }

    /// Index into the two-entry layout tables of descriptors.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Four => 0,
            Self::Eight => 1,
        }
    }

    /// Null sentinel used for reference fields inside packed data.
    #[must_use]
    pub const fn null_offset(self) -> u64 {
        match self {
            Self::Four => u32::MAX as u64,
            Self::Eight => u64::MAX,
        }
    }

    /// Size of an ARRAY field `{offset, count, pad}` at this width.
    #[must_use]
    pub const fn array_field_size(self) -> usize {
        match self {
            Self::Four => 8,
            Self::Eight => 16,
        }
    }
}

/// Combined byte order and pointer width of a packed instance or heap.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Format {
    /// Byte order.
    pub endian: Endian,
    /// Pointer width.
    pub width: PtrWidth,
}

impl Format {
    /// Builds a format from its parts.
    #[must_use]
    pub const fn new(endian: Endian, width: PtrWidth) -> Self {
        Self { endian, width }
    }

    /// Format of the machine running this code.
    #[must_use]
    pub const fn host() -> Self {
        Self::new(Endian::host(), PtrWidth::host())
    }
}

impl Default for Format {
    fn default() -> Self {
        Self::host()
    }
}

/// Rounds `value` up to the next multiple of `align` (an `align` of 0 or 1 is a no-op).
#[must_use]
pub const fn align_up(value: usize, align: usize) -> usize {
    if align <= 1 {
        value
    } else {
        value.next_multiple_of(align)
    }
}

/// Reads an unsigned integer of `size` bytes at `at` from packed data.
pub(crate) fn read_uint(data: &[u8], at: usize, size: usize, endian: Endian) -> Result<u64, DlError> {
    at.checked_add(size)
        .and_then(|end| data.get(at..end))
        .map(|bytes| endian.decode(bytes))
        .ok_or(DlError::MalformedData("read past end of packed data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_both_orders() {
        let le = Endian::Little.encode(0x0102_0304, 4);
        assert_eq!(&le[..4], &[4, 3, 2, 1]);
        let be = Endian::Big.encode(0x0102_0304, 4);
        assert_eq!(&be[..4], &[1, 2, 3, 4]);
        assert_eq!(Endian::Little.decode(&le[..4]), 0x0102_0304);
        assert_eq!(Endian::Big.decode(&be[..4]), 0x0102_0304);
        assert_eq!(Endian::Big.decode(&[0xff]), 0xff);
    }

    #[test]
    fn ptr_width_parameters() {
        assert_eq!(PtrWidth::Four.null_offset(), 0xffff_ffff);
        assert_eq!(PtrWidth::Eight.null_offset(), u64::MAX);
        assert_eq!(PtrWidth::Four.array_field_size(), 8);
        assert_eq!(PtrWidth::Eight.array_field_size(), 16);
        assert!(PtrWidth::from_bytes(2).is_err());
        assert_eq!(PtrWidth::from_bytes(8).ok(), Some(PtrWidth::Eight));
    }

    #[test]
    fn align_up_rounds() {
        assert_eq!(align_up(20, 8), 24);
        assert_eq!(align_up(20, 4), 20);
        assert_eq!(align_up(5, 0), 5);
        assert_eq!(align_up(0, 8), 0);
    }

    #[test]
    fn read_uint_is_bounds_checked() {
        let data = [1u8, 0, 0, 0];
        assert_eq!(read_uint(&data, 0, 4, Endian::Little).ok(), Some(1));
        assert!(read_uint(&data, 2, 4, Endian::Little).is_err());
        assert!(read_uint(&data, usize::MAX, 4, Endian::Little).is_err());
    }
}
