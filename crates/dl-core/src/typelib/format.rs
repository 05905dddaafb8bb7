// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Row types of the binary type-library format.
//!
//! A type library is a header followed by fixed-size row sections and two
//! byte sections:
//!
//! 1. [`LibHeader`]
//! 2. type lookup ([`LookupRow`] per type: id, byte offset into the type rows)
//! 3. enum lookup ([`LookupRow`] per enum: id, byte offset into the enum rows)
//! 4. [`TypeRow`] per type
//! 5. [`EnumRow`] per enum
//! 6. [`MemberRow`] per member of every type
//! 7. [`EnumValueRow`] per enumerator of every enum
//! 8. default-value blob
//! 9. string table of NUL-terminated names
//!
//! All integers are little-endian. Rows are read with unaligned loads, so no
//! section padding is required.

use bytemuck::{Pod, Zeroable};

/// Magic id `"DLTL"`.
pub const TYPELIB_MAGIC: u32 = u32::from_be_bytes(*b"DLTL");

/// Type-library format version written and accepted by this engine.
pub const TYPELIB_VERSION: u32 = 1;

/// Type flag: the type is a union.
pub const TYPE_FLAG_UNION: u32 = 1;

/// Member default-offset value meaning "no default".
pub const NO_DEFAULT: u32 = u32::MAX;

/// Type-library header (32 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct LibHeader {
    /// Magic id (little-endian).
    pub id_le: u32,
    /// Format version (little-endian).
    pub version_le: u32,
    /// Number of type rows (little-endian).
    pub type_count_le: u32,
    /// Number of enum rows (little-endian).
    pub enum_count_le: u32,
    /// Number of member rows (little-endian).
    pub member_count_le: u32,
    /// Number of enum value rows (little-endian).
    pub enum_value_count_le: u32,
    /// Default blob size in bytes (little-endian).
    pub default_size_le: u32,
    /// String table size in bytes (little-endian).
    pub strings_size_le: u32,
}

const _: () = assert!(std::mem::size_of::<LibHeader>() == 32);

/// Id to row-offset lookup entry (8 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct LookupRow {
    /// Type or enum id (little-endian).
    pub id_le: u32,
    /// Byte offset of the row inside its section (little-endian).
    pub offset_le: u32,
}

const _: () = assert!(std::mem::size_of::<LookupRow>() == 8);

/// Type descriptor row (32 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct TypeRow {
    /// Name offset in the string table (little-endian).
    pub name_le: u32,
    /// `TYPE_FLAG_*` bits (little-endian).
    pub flags_le: u32,
    /// Size per pointer width (little-endian).
    pub size_le: [u32; 2],
    /// Alignment per pointer width (little-endian).
    pub alignment_le: [u32; 2],
    /// Index of the first member row (little-endian).
    pub member_start_le: u32,
    /// Number of member rows (little-endian).
    pub member_count_le: u32,
}

const _: () = assert!(std::mem::size_of::<TypeRow>() == 32);

/// Enum descriptor row (16 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct EnumRow {
    /// Name offset in the string table (little-endian).
    pub name_le: u32,
    /// Storage byte of the backing integer (little-endian).
    pub storage_le: u32,
    /// Index of the first enum value row (little-endian).
    pub value_start_le: u32,
    /// Number of enum value rows (little-endian).
    pub value_count_le: u32,
}

const _: () = assert!(std::mem::size_of::<EnumRow>() == 16);

/// Member descriptor row (40 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct MemberRow {
    /// Name offset in the string table (little-endian).
    pub name_le: u32,
    /// Packed type word (little-endian).
    pub type_word_le: u32,
    /// Referenced sub-type or enum id (little-endian).
    pub type_id_le: u32,
    /// Size per pointer width (little-endian).
    pub size_le: [u32; 2],
    /// Alignment per pointer width (little-endian).
    pub alignment_le: [u32; 2],
    /// Offset per pointer width (little-endian).
    pub offset_le: [u32; 2],
    /// Offset into the default blob or [`NO_DEFAULT`] (little-endian).
    pub default_offset_le: u32,
}

const _: () = assert!(std::mem::size_of::<MemberRow>() == 40);

/// Enumerator row (16 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct EnumValueRow {
    /// Name offset in the string table (little-endian).
    pub name_le: u32,
    /// Zero padding.
    pub reserved: u32,
    /// Value, two's complement (little-endian).
    pub value_le: u64,
}

const _: () = assert!(std::mem::size_of::<EnumValueRow>() == 16);

/// Converts a pair of little-endian words.
#[must_use]
pub(crate) fn pair_from_le(pair: [u32; 2]) -> [u32; 2] {
    [u32::from_le(pair[0]), u32::from_le(pair[1])]
}

/// Converts a pair of native words to little-endian.
#[must_use]
pub(crate) fn pair_to_le(pair: [u32; 2]) -> [u32; 2] {
    [pair[0].to_le(), pair[1].to_le()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_spells_dltl() {
        assert_eq!(TYPELIB_MAGIC.to_be_bytes(), *b"DLTL");
    }

    #[test]
    fn row_sizes_are_stable() {
        assert_eq!(std::mem::size_of::<LibHeader>(), 32);
        assert_eq!(std::mem::size_of::<LookupRow>(), 8);
        assert_eq!(std::mem::size_of::<TypeRow>(), 32);
        assert_eq!(std::mem::size_of::<EnumRow>(), 16);
        assert_eq!(std::mem::size_of::<MemberRow>(), 40);
        assert_eq!(std::mem::size_of::<EnumValueRow>(), 16);
    }
}
