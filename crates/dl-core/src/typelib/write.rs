// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Type-library writer.
//!
//! Output is deterministic: descriptors are emitted in library order and the
//! string table interns each distinct name once, in first-use order.

use bytemuck::Pod;
use rustc_hash::FxHashMap;

use super::format::{
    pair_to_le, EnumRow, EnumValueRow, LibHeader, LookupRow, MemberRow, TypeRow, NO_DEFAULT,
    TYPELIB_MAGIC, TYPELIB_VERSION, TYPE_FLAG_UNION,
};
use super::TypeLibrary;

fn to_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[derive(Default)]
struct StringTable<'a> {
    bytes: Vec<u8>,
    offsets: FxHashMap<&'a str, u32>,
}

impl<'a> StringTable<'a> {
    fn intern(&mut self, name: &'a str) -> u32 {
        if let Some(&offset) = self.offsets.get(name) {
            return offset;
        }
        let offset = to_u32(self.bytes.len());
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        self.offsets.insert(name, offset);
        offset
    }
}

fn write_struct<T: Pod>(buf: &mut Vec<u8>, value: &T) {
    buf.extend_from_slice(bytemuck::bytes_of(value));
}

impl TypeLibrary {
    /// Serializes the library to `DLTL` bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut strings = StringTable::default();

        let mut type_rows = Vec::with_capacity(self.types.len());
        let mut member_rows = Vec::new();
        for ty in &self.types {
            type_rows.push(TypeRow {
                name_le: strings.intern(&ty.name).to_le(),
                flags_le: if ty.is_union { TYPE_FLAG_UNION } else { 0 }.to_le(),
                size_le: pair_to_le(ty.size),
                alignment_le: pair_to_le(ty.alignment),
                member_start_le: to_u32(member_rows.len()).to_le(),
                member_count_le: to_u32(ty.members.len()).to_le(),
            });
            for member in &ty.members {
                member_rows.push(MemberRow {
                    name_le: strings.intern(&member.name).to_le(),
                    type_word_le: member.word.to_raw().to_le(),
                    type_id_le: member.type_id.raw().to_le(),
                    size_le: pair_to_le(member.size),
                    alignment_le: pair_to_le(member.alignment),
                    offset_le: pair_to_le(member.offset),
                    default_offset_le: member.default_offset.unwrap_or(NO_DEFAULT).to_le(),
                });
            }
        }

        let mut enum_rows = Vec::with_capacity(self.enums.len());
        let mut value_rows = Vec::new();
        for en in &self.enums {
            enum_rows.push(EnumRow {
                name_le: strings.intern(&en.name).to_le(),
                storage_le: u32::from(en.storage as u8).to_le(),
                value_start_le: to_u32(value_rows.len()).to_le(),
                value_count_le: to_u32(en.values.len()).to_le(),
            });
            for value in &en.values {
                value_rows.push(EnumValueRow {
                    name_le: strings.intern(&value.name).to_le(),
                    reserved: 0,
                    value_le: value.value.cast_unsigned().to_le(),
                });
            }
        }

        let header = LibHeader {
            id_le: TYPELIB_MAGIC.to_le(),
            version_le: TYPELIB_VERSION.to_le(),
            type_count_le: to_u32(type_rows.len()).to_le(),
            enum_count_le: to_u32(enum_rows.len()).to_le(),
            member_count_le: to_u32(member_rows.len()).to_le(),
            enum_value_count_le: to_u32(value_rows.len()).to_le(),
            default_size_le: to_u32(self.defaults.len()).to_le(),
            strings_size_le: to_u32(strings.bytes.len()).to_le(),
        };

        let mut buf = Vec::new();
        write_struct(&mut buf, &header);
        for (i, ty) in self.types.iter().enumerate() {
            write_struct(
                &mut buf,
                &LookupRow {
                    id_le: ty.id.raw().to_le(),
                    offset_le: to_u32(i * std::mem::size_of::<TypeRow>()).to_le(),
                },
            );
        }
        for (i, en) in self.enums.iter().enumerate() {
            write_struct(
                &mut buf,
                &LookupRow {
                    id_le: en.id.raw().to_le(),
                    offset_le: to_u32(i * std::mem::size_of::<EnumRow>()).to_le(),
                },
            );
        }
        type_rows.iter().for_each(|row| write_struct(&mut buf, row));
        enum_rows.iter().for_each(|row| write_struct(&mut buf, row));
        member_rows.iter().for_each(|row| write_struct(&mut buf, row));
        value_rows.iter().for_each(|row| write_struct(&mut buf, row));
        buf.extend_from_slice(&self.defaults);
        buf.extend_from_slice(&strings.bytes);
        buf
    }
}
