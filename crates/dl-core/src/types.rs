// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Descriptor model: member type words, member/type/enum descriptors.
//!
//! Sizes, alignments and offsets are stored as two-entry tables indexed by
//! [`PtrWidth::index`]: entry 0 describes the 32-bit pointer layout, entry 1
//! the 64-bit layout. String, pointer and array members change size with the
//! pointer width, which shifts every member declared after them.

use crate::error::DlError;
use crate::ident::{hash_bytes, TypeId};
use crate::layout::{align_up, Endian, PtrWidth};

/// How a member is laid out: plain value, relocated array, fixed array, or bitfield.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Atom {
    /// A single value stored in place.
    Pod = 1,
    /// `{offset, count}` pair referencing elements stored elsewhere.
    Array = 2,
    /// A fixed number of elements stored in place.
    InlineArray = 3,
    /// A bit range inside a storage word shared with neighbouring bitfields.
    Bitfield = 4,
}

impl Atom {
    /// Decodes the atom byte of a type word.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Pod),
            2 => Some(Self::Array),
            3 => Some(Self::InlineArray),
            4 => Some(Self::Bitfield),
            _ => None,
        }
    }
}

/// Underlying representation of a member or element.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Storage {
    /// Signed 8-bit integer.
    Int8 = 1,
    /// Signed 16-bit integer.
    Int16 = 2,
    /// Signed 32-bit integer.
    Int32 = 3,
    /// Signed 64-bit integer.
    Int64 = 4,
    /// Unsigned 8-bit integer.
    UInt8 = 5,
    /// Unsigned 16-bit integer.
    UInt16 = 6,
    /// Unsigned 32-bit integer.
    UInt32 = 7,
    /// Unsigned 64-bit integer.
    UInt64 = 8,
    /// 32-bit float.
    Fp32 = 9,
    /// 64-bit float.
    Fp64 = 10,
    /// Reference to NUL-terminated bytes.
    Str = 11,
    /// Reference to an instance of the sub-type.
    Ptr = 12,
    /// Sub-type embedded by value.
    Struct = 13,
    /// Enum value; width comes from the enum descriptor.
    Enum = 14,
}

impl Storage {
    /// Decodes the storage byte of a type word.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Int8),
            2 => Some(Self::Int16),
            3 => Some(Self::Int32),
            4 => Some(Self::Int64),
            5 => Some(Self::UInt8),
            6 => Some(Self::UInt16),
            7 => Some(Self::UInt32),
            8 => Some(Self::UInt64),
            9 => Some(Self::Fp32),
            10 => Some(Self::Fp64),
            11 => Some(Self::Str),
            12 => Some(Self::Ptr),
            13 => Some(Self::Struct),
            14 => Some(Self::Enum),
            _ => None,
        }
    }

    /// Size in bytes of a fixed-width numeric storage; `None` for references,
    /// structs, and enums.
    #[must_use]
    pub const fn pod_size(self) -> Option<usize> {
        match self {
            Self::Int8 | Self::UInt8 => Some(1),
            Self::Int16 | Self::UInt16 => Some(2),
            Self::Int32 | Self::UInt32 | Self::Fp32 => Some(4),
            Self::Int64 | Self::UInt64 | Self::Fp64 => Some(8),
            Self::Str | Self::Ptr | Self::Struct | Self::Enum => None,
        }
    }

    /// True for the signed integer storages.
    #[must_use]
    pub const fn is_signed(self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }

    /// True for storages that hold a relocatable reference.
    #[must_use]
    pub const fn is_reference(self) -> bool {
        matches!(self, Self::Str | Self::Ptr)
    }

    /// True for the integer storages usable as enum or bitfield backing words.
    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            Self::Int8
                | Self::Int16
                | Self::Int32
                | Self::Int64
                | Self::UInt8
                | Self::UInt16
                | Self::UInt32
                | Self::UInt64
        )
    }

    /// Smallest unsigned storage holding `bits` bits.
    #[must_use]
    pub const fn unsigned_for_bits(bits: u32) -> Self {
        match bits {
            0..=8 => Self::UInt8,
            9..=16 => Self::UInt16,
            17..=32 => Self::UInt32,
            _ => Self::UInt64,
        }
    }
}

/// Decoded member type word.
///
/// On disk the word is a `u32`: bits 0..8 atom, 8..16 storage, 16..24
/// bitfield width, 24..32 bitfield bit offset. Inline arrays reuse bits
/// 16..32 as the element count.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TypeWord {
    atom: Atom,
    storage: Storage,
    aux: u16,
}

impl TypeWord {
    /// A plain or array member of the given storage.
    #[must_use]
    pub const fn new(atom: Atom, storage: Storage) -> Self {
        Self {
            atom,
            storage,
            aux: 0,
        }
    }

    /// A bitfield member `bits` wide at little-endian bit `offset` of its word.
    #[must_use]
    pub const fn bitfield(storage: Storage, bits: u8, offset: u8) -> Self {
        Self {
            atom: Atom::Bitfield,
            storage,
            aux: (bits as u16) | ((offset as u16) << 8),
        }
    }

    /// An inline array of `count` elements.
    #[must_use]
    pub const fn inline_array(storage: Storage, count: u16) -> Self {
        Self {
            atom: Atom::InlineArray,
            storage,
            aux: count,
        }
    }

    /// Decodes a raw word, rejecting unknown atom or storage bytes.
    pub fn from_raw(raw: u32) -> Result<Self, DlError> {
        let [atom, storage, lo, hi] = raw.to_le_bytes();
        let atom = Atom::from_raw(atom).ok_or(DlError::MalformedData("unknown atom kind"))?;
        let storage =
            Storage::from_raw(storage).ok_or(DlError::MalformedData("unknown storage kind"))?;
        Ok(Self {
            atom,
            storage,
            aux: u16::from_le_bytes([lo, hi]),
        })
    }

    /// Encodes the word for a type library.
    #[must_use]
    pub const fn to_raw(self) -> u32 {
        (self.atom as u32) | ((self.storage as u32) << 8) | ((self.aux as u32) << 16)
    }

    /// Atom kind.
    #[must_use]
    pub const fn atom(self) -> Atom {
        self.atom
    }

    /// Storage kind.
    #[must_use]
    pub const fn storage(self) -> Storage {
        self.storage
    }

    /// Bitfield width in bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        (self.aux & 0xff) as u32
    }

    /// Bitfield offset in bits, counted from the least significant bit.
    #[must_use]
    pub const fn bit_offset(self) -> u32 {
        (self.aux >> 8) as u32
    }

    /// Element count of an inline array.
    #[must_use]
    pub const fn inline_count(self) -> usize {
        self.aux as usize
    }
}

/// Bit position of a bitfield inside its storage word for a given byte order.
///
/// Descriptors number bits from the least significant end; big-endian words
/// number them from the most significant end.
#[must_use]
pub const fn bitfield_shift(endian: Endian, word_bytes: usize, offset: u32, bits: u32) -> u32 {
    match endian {
        Endian::Little => offset,
        Endian::Big => (word_bytes as u32) * 8 - offset - bits,
    }
}

/// Describes one member of a type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberDesc {
    /// Member name.
    pub name: String,
    /// Atom/storage word.
    pub word: TypeWord,
    /// Referenced struct, pointee, or enum id; zero when unused.
    pub type_id: TypeId,
    /// Size in bytes per pointer width.
    pub size: [u32; 2],
    /// Alignment in bytes per pointer width.
    pub alignment: [u32; 2],
    /// Byte offset inside the owning type per pointer width.
    pub offset: [u32; 2],
    /// Offset of this member's default value in the registry's default blob.
    pub default_offset: Option<u32>,
}

impl MemberDesc {
    /// Atom kind.
    #[must_use]
    pub fn atom(&self) -> Atom {
        self.word.atom()
    }

    /// Storage kind.
    #[must_use]
    pub fn storage(&self) -> Storage {
        self.word.storage()
    }

    /// Size in bytes at `width`.
    #[must_use]
    pub fn size(&self, width: PtrWidth) -> usize {
        self.size[width.index()] as usize
    }

    /// Alignment in bytes at `width`.
    #[must_use]
    pub fn align(&self, width: PtrWidth) -> usize {
        self.alignment[width.index()] as usize
    }

    /// Byte offset inside the owning type at `width`.
    #[must_use]
    pub fn offset(&self, width: PtrWidth) -> usize {
        self.offset[width.index()] as usize
    }

    /// Union discriminant selecting this member.
    #[must_use]
    pub fn union_tag(&self) -> u32 {
        hash_bytes(self.name.as_bytes())
    }
}

/// Describes a struct or union type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeDesc {
    /// Type name.
    pub name: String,
    /// Hash of `name`.
    pub id: TypeId,
    /// Size in bytes per pointer width.
    pub size: [u32; 2],
    /// Alignment in bytes per pointer width.
    pub alignment: [u32; 2],
    /// Members in layout order.
    pub members: Vec<MemberDesc>,
    /// Members overlap and a hidden discriminant selects the live one.
    pub is_union: bool,
}

impl TypeDesc {
    /// Size in bytes at `width`.
    #[must_use]
    pub fn size(&self, width: PtrWidth) -> usize {
        self.size[width.index()] as usize
    }

    /// Alignment in bytes at `width`.
    #[must_use]
    pub fn align(&self, width: PtrWidth) -> usize {
        self.alignment[width.index()] as usize
    }

    /// Looks up a member by name.
    #[must_use]
    pub fn member(&self, name: &str) -> Option<&MemberDesc> {
        self.members.iter().find(|m| m.name == name)
    }

    /// Looks up a member by name, reporting `MemberNotFound` when absent.
    pub fn member_or_err(&self, name: &str) -> Result<&MemberDesc, DlError> {
        self.member(name).ok_or_else(|| DlError::MemberNotFound {
            ty: self.name.clone(),
            member: name.to_owned(),
        })
    }

    /// Byte offset of the hidden discriminant of a union at `width`.
    #[must_use]
    pub fn union_tag_offset(&self, width: PtrWidth) -> usize {
        let largest = self
            .members
            .iter()
            .map(|m| m.size(width))
            .max()
            .unwrap_or(0);
        align_up(largest, 4)
    }

    /// Resolves a union discriminant to the member it selects.
    pub fn union_member(&self, tag: u32) -> Result<&MemberDesc, DlError> {
        self.members
            .iter()
            .find(|m| m.union_tag() == tag)
            .ok_or_else(|| DlError::MemberNotFound {
                ty: self.name.clone(),
                member: format!("{tag:#010x}"),
            })
    }
}

/// One named value of an enum.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnumValue {
    /// Enumerator name.
    pub name: String,
    /// Enumerator value.
    pub value: i64,
}

/// Describes an enum type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnumDesc {
    /// Enum name.
    pub name: String,
    /// Hash of `name`.
    pub id: TypeId,
    /// Integer storage of the enum's values.
    pub storage: Storage,
    /// Enumerators in declaration order.
    pub values: Vec<EnumValue>,
}

impl EnumDesc {
    /// Size in bytes of one stored value.
    #[must_use]
    pub fn size(&self) -> usize {
        self.storage.pod_size().unwrap_or(4)
    }

    /// Value of the enumerator called `name`.
    #[must_use]
    pub fn value_of(&self, name: &str) -> Option<i64> {
        self.values.iter().find(|v| v.name == name).map(|v| v.value)
    }

    /// Name of the first enumerator with `value`.
    #[must_use]
    pub fn name_of(&self, value: i64) -> Option<&str> {
        self.values
            .iter()
            .find(|v| v.value == value)
            .map(|v| v.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_word_round_trips_through_raw() {
        let words = [
            TypeWord::new(Atom::Pod, Storage::Int32),
            TypeWord::new(Atom::Array, Storage::Struct),
            TypeWord::bitfield(Storage::UInt16, 3, 5),
            TypeWord::inline_array(Storage::Str, 300),
        ];
        for word in words {
            assert_eq!(TypeWord::from_raw(word.to_raw()).ok(), Some(word));
        }
        let bf = TypeWord::bitfield(Storage::UInt8, 3, 5);
        assert_eq!(bf.to_raw(), 0x0503_0504);
        assert_eq!(bf.bits(), 3);
        assert_eq!(bf.bit_offset(), 5);
    }

    #[test]
    fn unknown_bytes_are_rejected() {
        assert!(TypeWord::from_raw(0).is_err());
        assert!(TypeWord::from_raw(0x0000_0f01).is_err());
    }

    #[test]
    fn bitfield_shift_mirrors_on_big_endian() {
        assert_eq!(bitfield_shift(Endian::Little, 1, 2, 3), 2);
        assert_eq!(bitfield_shift(Endian::Big, 1, 2, 3), 3);
        assert_eq!(bitfield_shift(Endian::Big, 4, 0, 1), 31);
    }

    #[test]
    fn unsigned_for_bits_picks_smallest_word() {
        assert_eq!(Storage::unsigned_for_bits(1), Storage::UInt8);
        assert_eq!(Storage::unsigned_for_bits(9), Storage::UInt16);
        assert_eq!(Storage::unsigned_for_bits(32), Storage::UInt32);
        assert_eq!(Storage::unsigned_for_bits(33), Storage::UInt64);
    }
}
