// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Type-library reader.

use bytemuck::Pod;

use super::format::{
    pair_from_le, EnumRow, EnumValueRow, LibHeader, LookupRow, MemberRow, TypeRow, NO_DEFAULT,
    TYPELIB_MAGIC, TYPELIB_VERSION, TYPE_FLAG_UNION,
};
use super::TypeLibrary;
use crate::error::DlError;
use crate::ident::TypeId;
use crate::layout::PtrWidth;
use crate::types::{Atom, EnumDesc, EnumValue, MemberDesc, Storage, TypeDesc, TypeWord};

/// Byte cursor over the library sections.
struct Sections<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Sections<'a> {
    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], DlError> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or(DlError::MalformedData(what))?;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or(DlError::MalformedData(what))?;
        self.pos = end;
        Ok(bytes)
    }

    fn rows<T: Pod>(&mut self, count: u32, what: &'static str) -> Result<Vec<T>, DlError> {
        let size = std::mem::size_of::<T>();
        let len = usize::try_from(count)
            .ok()
            .and_then(|c| c.checked_mul(size))
            .ok_or(DlError::MalformedData(what))?;
        let bytes = self.take(len, what)?;
        Ok(bytes
            .chunks_exact(size)
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }
}

fn name_at(strings: &[u8], offset_le: u32) -> Result<String, DlError> {
    let start = usize::try_from(u32::from_le(offset_le))
        .map_err(|_| DlError::MalformedData("name offset out of range"))?;
    let tail = strings
        .get(start..)
        .ok_or(DlError::MalformedData("name offset out of range"))?;
    let len = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or(DlError::MalformedData("unterminated name"))?;
    String::from_utf8(tail[..len].to_vec()).map_err(|_| DlError::MalformedData("name is not UTF-8"))
}

/// Resolves a lookup entry's byte offset into a row index.
fn row_index<T>(lookup: &LookupRow, count: usize) -> Result<usize, DlError> {
    let size = std::mem::size_of::<T>();
    let offset = usize::try_from(u32::from_le(lookup.offset_le))
        .map_err(|_| DlError::MalformedData("lookup offset out of range"))?;
    let index = offset / size;
    if offset % size != 0 || index >= count {
        return Err(DlError::MalformedData("lookup offset out of range"));
    }
    Ok(index)
}

fn row_range(start_le: u32, count_le: u32, total: usize) -> Result<std::ops::Range<usize>, DlError> {
    let start = usize::try_from(u32::from_le(start_le)).unwrap_or(usize::MAX);
    let count = usize::try_from(u32::from_le(count_le)).unwrap_or(usize::MAX);
    start
        .checked_add(count)
        .filter(|&end| end <= total)
        .map(|end| start..end)
        .ok_or(DlError::MalformedData("row range out of bounds"))
}

impl TypeLibrary {
    /// Parses `DLTL` bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, DlError> {
        let mut sections = Sections { data, pos: 0 };
        let header: LibHeader = bytemuck::pod_read_unaligned(sections.take(
            std::mem::size_of::<LibHeader>(),
            "data smaller than type-library header",
        )?);
        if u32::from_le(header.id_le) != TYPELIB_MAGIC {
            return Err(DlError::MalformedData("bad type-library magic"));
        }
        let version = u32::from_le(header.version_le);
        if version != TYPELIB_VERSION {
            return Err(DlError::VersionMismatch {
                expected: TYPELIB_VERSION,
                found: version,
            });
        }

        let type_count = u32::from_le(header.type_count_le);
        let enum_count = u32::from_le(header.enum_count_le);
        let type_lookup: Vec<LookupRow> = sections.rows(type_count, "type lookup truncated")?;
        let enum_lookup: Vec<LookupRow> = sections.rows(enum_count, "enum lookup truncated")?;
        let type_rows: Vec<TypeRow> = sections.rows(type_count, "type rows truncated")?;
        let enum_rows: Vec<EnumRow> = sections.rows(enum_count, "enum rows truncated")?;
        let member_rows: Vec<MemberRow> =
            sections.rows(u32::from_le(header.member_count_le), "member rows truncated")?;
        let value_rows: Vec<EnumValueRow> =
            sections.rows(u32::from_le(header.enum_value_count_le), "enum values truncated")?;
        let default_size = usize::try_from(u32::from_le(header.default_size_le))
            .map_err(|_| DlError::MalformedData("default blob truncated"))?;
        let defaults = sections.take(default_size, "default blob truncated")?;
        let strings_size = usize::try_from(u32::from_le(header.strings_size_le))
            .map_err(|_| DlError::MalformedData("string table truncated"))?;
        let strings = sections.take(strings_size, "string table truncated")?;

        let mut types = Vec::with_capacity(type_rows.len());
        for lookup in &type_lookup {
            let row = &type_rows[row_index::<TypeRow>(lookup, type_rows.len())?];
            let range = row_range(row.member_start_le, row.member_count_le, member_rows.len())?;
            let members = member_rows[range]
                .iter()
                .map(|m| read_member(m, strings, default_size))
                .collect::<Result<Vec<_>, _>>()?;
            let desc = TypeDesc {
                name: name_at(strings, row.name_le)?,
                id: TypeId(u32::from_le(lookup.id_le)),
                size: pair_from_le(row.size_le),
                alignment: pair_from_le(row.alignment_le),
                members,
                is_union: u32::from_le(row.flags_le) & TYPE_FLAG_UNION != 0,
            };
            check_layout(&desc)?;
            types.push(desc);
        }

        let mut enums = Vec::with_capacity(enum_rows.len());
        for lookup in &enum_lookup {
            let row = &enum_rows[row_index::<EnumRow>(lookup, enum_rows.len())?];
            let storage = u8::try_from(u32::from_le(row.storage_le))
                .ok()
                .and_then(Storage::from_raw)
                .filter(|s| s.is_integer())
                .ok_or(DlError::MalformedData("enum storage is not an integer"))?;
            let range = row_range(row.value_start_le, row.value_count_le, value_rows.len())?;
            let values = value_rows[range]
                .iter()
                .map(|v| {
                    Ok(EnumValue {
                        name: name_at(strings, v.name_le)?,
                        value: u64::from_le(v.value_le).cast_signed(),
                    })
                })
                .collect::<Result<Vec<_>, DlError>>()?;
            enums.push(EnumDesc {
                name: name_at(strings, row.name_le)?,
                id: TypeId(u32::from_le(lookup.id_le)),
                storage,
                values,
            });
        }

        Ok(Self {
            types,
            enums,
            defaults: defaults.to_vec(),
        })
    }
}

/// Rejects descriptors whose layout would send pack, load, or convert outside
/// an instance.
fn check_layout(ty: &TypeDesc) -> Result<(), DlError> {
    for width in [PtrWidth::Four, PtrWidth::Eight] {
        let size = ty.size(width);
        if size == 0 {
            return Err(DlError::MalformedData("type has no storage"));
        }
        if !ty.align(width).is_power_of_two() {
            return Err(DlError::MalformedData("type alignment is not a power of two"));
        }
        if ty.is_union && ty.union_tag_offset(width) + 4 > size {
            return Err(DlError::MalformedData("union discriminant outside the type"));
        }
        for member in &ty.members {
            if !member.align(width).is_power_of_two() {
                return Err(DlError::MalformedData("member alignment is not a power of two"));
            }
            let end = member.offset(width).checked_add(member.size(width));
            if end.is_none_or(|end| end > size) {
                return Err(DlError::MalformedData("member outside the type"));
            }
            if member.atom() == Atom::Bitfield {
                let word_bits = 8 * member.size(width);
                let (bits, offset) = (member.word.bits() as usize, member.word.bit_offset() as usize);
                if !matches!(member.size(width), 1 | 2 | 4 | 8)
                    || bits == 0
                    || offset + bits > word_bits
                {
                    return Err(DlError::MalformedData("bitfield does not fit its storage word"));
                }
            }
        }
    }
    Ok(())
}

fn read_member(row: &MemberRow, strings: &[u8], default_size: usize) -> Result<MemberDesc, DlError> {
    let default_offset = match u32::from_le(row.default_offset_le) {
        NO_DEFAULT => None,
        offset if usize::try_from(offset).is_ok_and(|o| o <= default_size) => Some(offset),
        _ => return Err(DlError::MalformedData("default offset out of range")),
    };
    Ok(MemberDesc {
        name: name_at(strings, row.name_le)?,
        word: TypeWord::from_raw(u32::from_le(row.type_word_le))?,
        type_id: TypeId(u32::from_le(row.type_id_le)),
        size: pair_from_le(row.size_le),
        alignment: pair_from_le(row.alignment_le),
        offset: pair_from_le(row.offset_le),
        default_offset,
    })
}
