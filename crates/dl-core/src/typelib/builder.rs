// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Programmatic type-library construction with layout computation.
//!
//! Layout rules, applied once per pointer width:
//! - numeric members are naturally aligned; strings and pointers are pointer-sized;
//! - arrays are `{offset, u32 count}` padded to 8 or 16 bytes, pointer-aligned;
//! - inline arrays repeat the element layout;
//! - consecutive bitfields share the smallest unsigned word holding all of them;
//! - structs round their size up to their largest member alignment;
//! - unions overlay members at offset 0 and append a `u32` discriminant at the
//!   first 4-byte boundary past the largest member.

use rustc_hash::{FxHashMap, FxHashSet};

use super::TypeLibrary;
use crate::error::DlError;
use crate::ident::{make_type_id, TypeId};
use crate::layout::{align_up, PtrWidth};
use crate::registry::Registry;
use crate::types::{Atom, EnumDesc, EnumValue, MemberDesc, Storage, TypeDesc, TypeWord};

const WIDTHS: [PtrWidth; 2] = [PtrWidth::Four, PtrWidth::Eight];

#[derive(Clone, Debug, PartialEq, Eq)]
enum Kind {
    Pod(Storage),
    Str,
    Ptr(String),
    Struct(String),
    Enum(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Shape {
    Single,
    Array,
    Inline(u16),
    Bits(u8),
}

/// Declaration of one member: what it stores and how it is laid out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    kind: Kind,
    shape: Shape,
    default: Option<Vec<u8>>,
}

impl Field {
    fn of(kind: Kind) -> Self {
        Self {
            kind,
            shape: Shape::Single,
            default: None,
        }
    }

    /// Signed 8-bit integer.
    #[must_use]
    pub fn int8() -> Self {
        Self::of(Kind::Pod(Storage::Int8))
    }
    /// Signed 16-bit integer.
    #[must_use]
    pub fn int16() -> Self {
        Self::of(Kind::Pod(Storage::Int16))
    }
    /// Signed 32-bit integer.
    #[must_use]
    pub fn int32() -> Self {
        Self::of(Kind::Pod(Storage::Int32))
    }
    /// Signed 64-bit integer.
    #[must_use]
    pub fn int64() -> Self {
        Self::of(Kind::Pod(Storage::Int64))
    }
    /// Unsigned 8-bit integer.
    #[must_use]
    pub fn uint8() -> Self {
        Self::of(Kind::Pod(Storage::UInt8))
    }
    /// Unsigned 16-bit integer.
    #[must_use]
    pub fn uint16() -> Self {
        Self::of(Kind::Pod(Storage::UInt16))
    }
    /// Unsigned 32-bit integer.
    #[must_use]
    pub fn uint32() -> Self {
        Self::of(Kind::Pod(Storage::UInt32))
    }
    /// Unsigned 64-bit integer.
    #[must_use]
    pub fn uint64() -> Self {
        Self::of(Kind::Pod(Storage::UInt64))
    }
    /// 32-bit float.
    #[must_use]
    pub fn float32() -> Self {
        Self::of(Kind::Pod(Storage::Fp32))
    }
    /// 64-bit float.
    #[must_use]
    pub fn float64() -> Self {
        Self::of(Kind::Pod(Storage::Fp64))
    }
    /// NUL-terminated string reference.
    #[must_use]
    pub fn string() -> Self {
        Self::of(Kind::Str)
    }
    /// Reference to an instance of struct `name`.
    #[must_use]
    pub fn pointer(name: &str) -> Self {
        Self::of(Kind::Ptr(name.to_owned()))
    }
    /// Struct `name` embedded by value.
    #[must_use]
    pub fn structure(name: &str) -> Self {
        Self::of(Kind::Struct(name.to_owned()))
    }
    /// Value of enum `name`.
    #[must_use]
    pub fn enumeration(name: &str) -> Self {
        Self::of(Kind::Enum(name.to_owned()))
    }
    /// Unsigned bitfield `bits` wide (1..=64).
    #[must_use]
    pub fn bitfield(bits: u8) -> Self {
        Self {
            kind: Kind::Pod(Storage::UInt64),
            shape: Shape::Bits(bits),
            default: None,
        }
    }

    /// Turns the field into a relocated array of its element type.
    #[must_use]
    pub fn array(mut self) -> Self {
        self.shape = Shape::Array;
        self
    }

    /// Turns the field into an inline array of `count` elements.
    #[must_use]
    pub fn inline_array(mut self, count: u16) -> Self {
        self.shape = Shape::Inline(count);
        self
    }

    /// Attaches default-value bytes, little-endian, stored in the library's default blob.
    #[must_use]
    pub fn with_default(mut self, bytes: Vec<u8>) -> Self {
        self.default = Some(bytes);
        self
    }

    fn storage(&self) -> Storage {
        match &self.kind {
            Kind::Pod(storage) => *storage,
            Kind::Str => Storage::Str,
            Kind::Ptr(_) => Storage::Ptr,
            Kind::Struct(_) => Storage::Struct,
            Kind::Enum(_) => Storage::Enum,
        }
    }

    fn sub_type(&self) -> TypeId {
        match &self.kind {
            Kind::Ptr(name) | Kind::Struct(name) | Kind::Enum(name) => make_type_id(name),
            Kind::Pod(_) | Kind::Str => TypeId(0),
        }
    }
}

/// Member list of one struct or union under construction.
#[derive(Clone, Debug, Default)]
pub struct StructBuilder {
    fields: Vec<(String, Field)>,
}

impl StructBuilder {
    /// Appends a member; declaration order is layout order.
    #[must_use]
    pub fn field(mut self, name: &str, field: Field) -> Self {
        self.fields.push((name.to_owned(), field));
        self
    }
}

#[derive(Clone, Debug)]
struct TypeDecl {
    name: String,
    fields: Vec<(String, Field)>,
    is_union: bool,
}

#[derive(Clone, Debug)]
struct EnumDecl {
    name: String,
    storage: Storage,
    values: Vec<(String, Option<i64>)>,
}

/// Collects type and enum declarations and lowers them into a [`TypeLibrary`].
#[derive(Clone, Debug, Default)]
pub struct LibraryBuilder {
    types: Vec<TypeDecl>,
    enums: Vec<EnumDecl>,
}

/// Size and alignment per pointer width.
type Layout = ([u32; 2], [u32; 2]);

fn to_u32(value: usize) -> Result<u32, DlError> {
    u32::try_from(value).map_err(|_| DlError::InvalidParameter(format!("layout value {value} exceeds u32")))
}

impl LibraryBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a struct.
    #[must_use]
    pub fn structure(self, name: &str, build: impl FnOnce(StructBuilder) -> StructBuilder) -> Self {
        self.declare(name, build, false)
    }

    /// Declares a union; exactly one member is live, selected by a hidden discriminant.
    #[must_use]
    pub fn union(self, name: &str, build: impl FnOnce(StructBuilder) -> StructBuilder) -> Self {
        self.declare(name, build, true)
    }

    fn declare(
        mut self,
        name: &str,
        build: impl FnOnce(StructBuilder) -> StructBuilder,
        is_union: bool,
    ) -> Self {
        self.types.push(TypeDecl {
            name: name.to_owned(),
            fields: build(StructBuilder::default()).fields,
            is_union,
        });
        self
    }

    /// Declares a `u32`-backed enum. Values left as `None` continue from the
    /// previous value plus one, starting at 0.
    #[must_use]
    pub fn enumeration(self, name: &str, values: &[(&str, Option<i64>)]) -> Self {
        self.enumeration_with_storage(name, Storage::UInt32, values)
    }

    /// Declares an enum backed by an explicit integer storage.
    #[must_use]
    pub fn enumeration_with_storage(
        mut self,
        name: &str,
        storage: Storage,
        values: &[(&str, Option<i64>)],
    ) -> Self {
        self.enums.push(EnumDecl {
            name: name.to_owned(),
            storage,
            values: values
                .iter()
                .map(|(n, v)| ((*n).to_owned(), *v))
                .collect(),
        });
        self
    }

    /// Computes layouts and produces the library.
    ///
    /// Struct and enum members must resolve to declarations in this builder or
    /// in `existing`; pointer members may reference types registered later.
    pub fn build(&self, existing: &Registry) -> Result<TypeLibrary, DlError> {
        let mut names = FxHashSet::default();
        for name in self.types.iter().map(|t| &t.name).chain(self.enums.iter().map(|e| &e.name)) {
            if !names.insert(name.as_str()) {
                return Err(DlError::InvalidParameter(format!("{name} declared twice")));
            }
        }

        let enums = self
            .enums
            .iter()
            .map(assign_enum_values)
            .collect::<Result<Vec<_>, _>>()?;

        let mut lowering = Lowering {
            builder: self,
            existing,
            enums: &enums,
            done: FxHashMap::default(),
            active: FxHashSet::default(),
            defaults: Vec::new(),
        };
        for decl in &self.types {
            lowering.lower(&decl.name)?;
        }
        let Lowering { mut done, defaults, .. } = lowering;
        let types = self
            .types
            .iter()
            .filter_map(|decl| done.remove(&decl.name))
            .collect();
        Ok(TypeLibrary {
            types,
            enums,
            defaults,
        })
    }
}

fn assign_enum_values(decl: &EnumDecl) -> Result<EnumDesc, DlError> {
    if !decl.storage.is_integer() {
        return Err(DlError::InvalidParameter(format!(
            "enum {} must use integer storage",
            decl.name
        )));
    }
    let mut next = 0i64;
    let mut values: Vec<EnumValue> = Vec::with_capacity(decl.values.len());
    for (name, explicit) in &decl.values {
        let value = match explicit {
            Some(v) => *v,
            None => {
                if values.iter().any(|v| v.value == next) {
                    return Err(DlError::InvalidParameter(format!(
                        "enum {}: implicit value {next} of {name} is ambiguous",
                        decl.name
                    )));
                }
                next
            }
        };
        values.push(EnumValue {
            name: name.clone(),
            value,
        });
        next = value.wrapping_add(1);
    }
    Ok(EnumDesc {
        name: decl.name.clone(),
        id: make_type_id(&decl.name),
        storage: decl.storage,
        values,
    })
}

struct Lowering<'a> {
    builder: &'a LibraryBuilder,
    existing: &'a Registry,
    enums: &'a [EnumDesc],
    done: FxHashMap<String, TypeDesc>,
    active: FxHashSet<String>,
    defaults: Vec<u8>,
}

impl Lowering<'_> {
    fn struct_layout(&mut self, name: &str) -> Result<Layout, DlError> {
        if self.builder.types.iter().any(|t| t.name == name) {
            let desc = self.lower(name)?;
            return Ok((desc.size, desc.alignment));
        }
        let id = make_type_id(name);
        let desc = self.existing.type_desc(id)?;
        Ok((desc.size, desc.alignment))
    }

    fn enum_size(&self, name: &str) -> Result<u32, DlError> {
        let id = make_type_id(name);
        let size = match self.enums.iter().find(|e| e.id == id) {
            Some(en) => en.size(),
            None => self.existing.enum_desc(id)?.size(),
        };
        to_u32(size)
    }

    /// Layout of one element (or the whole member for non-array shapes).
    fn element_layout(&mut self, field: &Field) -> Result<Layout, DlError> {
        match &field.kind {
            Kind::Pod(storage) => {
                let size = to_u32(storage.pod_size().unwrap_or(8))?;
                Ok(([size; 2], [size; 2]))
            }
            Kind::Str | Kind::Ptr(_) => Ok(([4, 8], [4, 8])),
            Kind::Struct(name) => self.struct_layout(name),
            Kind::Enum(name) => {
                let size = self.enum_size(name)?;
                Ok(([size; 2], [size; 2]))
            }
        }
    }

    fn member_layout(&mut self, field: &Field) -> Result<Layout, DlError> {
        match field.shape {
            Shape::Array => Ok(([8, 16], [4, 8])),
            Shape::Inline(count) => {
                let (size, align) = self.element_layout(field)?;
                let mut total = [0u32; 2];
                for (t, s) in total.iter_mut().zip(size) {
                    *t = s.checked_mul(u32::from(count)).ok_or_else(|| {
                        DlError::InvalidParameter(format!("inline array of {count} elements exceeds u32"))
                    })?;
                }
                Ok((total, align))
            }
            Shape::Single | Shape::Bits(_) => self.element_layout(field),
        }
    }

    fn lower(&mut self, name: &str) -> Result<TypeDesc, DlError> {
        if let Some(desc) = self.done.get(name) {
            return Ok(desc.clone());
        }
        if !self.active.insert(name.to_owned()) {
            return Err(DlError::InvalidParameter(format!(
                "{name} contains itself by value"
            )));
        }
        let builder = self.builder;
        let decl = builder
            .types
            .iter()
            .find(|t| t.name == name)
            .ok_or(DlError::TypeNotFound(make_type_id(name)))?;

        let mut members: Vec<MemberDesc> = Vec::with_capacity(decl.fields.len());
        let mut cursor = [0usize; 2];
        let mut max_align = [1usize; 2];
        let mut i = 0;
        while i < decl.fields.len() {
            let (field_name, field) = &decl.fields[i];
            if let Shape::Bits(_) = field.shape {
                if decl.is_union {
                    return Err(DlError::InvalidParameter(format!(
                        "union {name} cannot hold bitfield {field_name}"
                    )));
                }
                i = self.lower_bitfield_run(&decl.fields, i, &mut cursor, &mut max_align, &mut members)?;
                continue;
            }
            let (size, alignment) = self.member_layout(field)?;
            let mut offset = [0u32; 2];
            for w in WIDTHS {
                let idx = w.index();
                let a = alignment[idx] as usize;
                max_align[idx] = max_align[idx].max(a);
                if !decl.is_union {
                    cursor[idx] = align_up(cursor[idx], a);
                    offset[idx] = to_u32(cursor[idx])?;
                    cursor[idx] += size[idx] as usize;
                }
            }
            let word = match field.shape {
                Shape::Array => TypeWord::new(Atom::Array, field.storage()),
                Shape::Inline(count) => TypeWord::inline_array(field.storage(), count),
                Shape::Single | Shape::Bits(_) => TypeWord::new(Atom::Pod, field.storage()),
            };
            members.push(MemberDesc {
                name: field_name.clone(),
                word,
                type_id: field.sub_type(),
                size,
                alignment,
                offset,
                default_offset: self.store_default(field)?,
            });
            i += 1;
        }

        let mut size = [0u32; 2];
        for w in WIDTHS {
            let idx = w.index();
            if decl.is_union {
                max_align[idx] = max_align[idx].max(4);
                let largest = members.iter().map(|m| m.size(w)).max().unwrap_or(0);
                cursor[idx] = align_up(largest, 4) + 4;
            }
            size[idx] = to_u32(align_up(cursor[idx], max_align[idx]))?;
        }
        if size.contains(&0) {
            return Err(DlError::InvalidParameter(format!("{name} has no storage")));
        }
        let alignment = [to_u32(max_align[0])?, to_u32(max_align[1])?];

        let desc = TypeDesc {
            name: decl.name.clone(),
            id: make_type_id(&decl.name),
            size,
            alignment,
            members,
            is_union: decl.is_union,
        };
        self.active.remove(name);
        self.done.insert(name.to_owned(), desc.clone());
        Ok(desc)
    }

    /// Packs the bitfield run starting at `start` into one storage word and
    /// returns the index of the first member after the run.
    fn lower_bitfield_run(
        &mut self,
        fields: &[(String, Field)],
        start: usize,
        cursor: &mut [usize; 2],
        max_align: &mut [usize; 2],
        members: &mut Vec<MemberDesc>,
    ) -> Result<usize, DlError> {
        let mut end = start;
        let mut total = 0u32;
        while let Some((name, Field { shape: Shape::Bits(bits), .. })) = fields.get(end) {
            if *bits == 0 || *bits > 64 {
                return Err(DlError::InvalidParameter(format!(
                    "bitfield {name} must be 1..=64 bits wide"
                )));
            }
            if total + u32::from(*bits) > 64 {
                break;
            }
            total += u32::from(*bits);
            end += 1;
        }
        let storage = Storage::unsigned_for_bits(total);
        let word_size = storage.pod_size().unwrap_or(8);
        let mut offset = [0u32; 2];
        for w in WIDTHS {
            let idx = w.index();
            cursor[idx] = align_up(cursor[idx], word_size);
            offset[idx] = to_u32(cursor[idx])?;
            cursor[idx] += word_size;
            max_align[idx] = max_align[idx].max(word_size);
        }
        let mut bit = 0u8;
        for (name, field) in &fields[start..end] {
            let Shape::Bits(bits) = field.shape else {
                continue;
            };
            let word_size = to_u32(word_size)?;
            members.push(MemberDesc {
                name: name.clone(),
                word: TypeWord::bitfield(storage, bits, bit),
                type_id: TypeId(0),
                size: [word_size; 2],
                alignment: [word_size; 2],
                offset,
                default_offset: self.store_default(field)?,
            });
            bit += bits;
        }
        Ok(end)
    }

    fn store_default(&mut self, field: &Field) -> Result<Option<u32>, DlError> {
        let Some(bytes) = &field.default else {
            return Ok(None);
        };
        let offset = to_u32(self.defaults.len())?;
        self.defaults.extend_from_slice(bytes);
        Ok(Some(offset))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn find<'a>(lib: &'a TypeLibrary, name: &str) -> &'a TypeDesc {
        lib.types.iter().find(|t| t.name == name).unwrap()
    }

    #[test]
    fn pointer_width_shifts_later_members() {
        let lib = LibraryBuilder::new()
            .structure("S", |s| {
                s.field("a", Field::uint8())
                    .field("p", Field::string())
                    .field("b", Field::uint16())
                    .field("arr", Field::float32().array())
            })
            .build(&Registry::new())
            .unwrap();
        let s = find(&lib, "S");
        let offsets: Vec<[u32; 2]> = s.members.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![[0, 0], [4, 8], [8, 16], [12, 24]]);
        assert_eq!(s.size, [20, 40]);
        assert_eq!(s.alignment, [4, 8]);
    }

    #[test]
    fn bitfields_share_a_word() {
        let lib = LibraryBuilder::new()
            .structure("B", |s| {
                s.field("x", Field::bitfield(3))
                    .field("y", Field::bitfield(7))
                    .field("z", Field::uint8())
            })
            .build(&Registry::new())
            .unwrap();
        let b = find(&lib, "B");
        assert_eq!(b.members[0].word, TypeWord::bitfield(Storage::UInt16, 3, 0));
        assert_eq!(b.members[1].word, TypeWord::bitfield(Storage::UInt16, 7, 3));
        assert_eq!(b.members[0].offset, b.members[1].offset);
        assert_eq!(b.members[2].offset, [2, 2]);
        assert_eq!(b.size, [4, 4]);
    }

    #[test]
    fn union_places_discriminant_after_largest_member() {
        let lib = LibraryBuilder::new()
            .union("U", |s| s.field("i", Field::int32()).field("d", Field::float64()))
            .build(&Registry::new())
            .unwrap();
        let u = find(&lib, "U");
        assert!(u.is_union);
        assert_eq!(u.union_tag_offset(PtrWidth::Eight), 8);
        assert_eq!(u.size, [16, 16]);
        assert!(u.members.iter().all(|m| m.offset == [0, 0]));
    }

    #[test]
    fn nested_structs_and_inline_arrays() {
        let lib = LibraryBuilder::new()
            .structure("Outer", |s| {
                s.field("tag", Field::uint8())
                    .field("inner", Field::structure("Inner"))
                    .field("names", Field::string().inline_array(3))
            })
            .structure("Inner", |s| s.field("v", Field::int64()))
            .build(&Registry::new())
            .unwrap();
        let outer = find(&lib, "Outer");
        assert_eq!(outer.members[1].offset, [8, 8]);
        assert_eq!(outer.members[2].size, [12, 24]);
        assert_eq!(outer.size, [32, 40]);
    }

    #[test]
    fn enum_values_continue_from_previous() {
        let lib = LibraryBuilder::new()
            .enumeration("E", &[("A", None), ("B", Some(5)), ("C", None), ("D", Some(5))])
            .build(&Registry::new())
            .unwrap();
        let values: Vec<i64> = lib.enums[0].values.iter().map(|v| v.value).collect();
        assert_eq!(values, vec![0, 5, 6, 5]);
    }

    #[test]
    fn ambiguous_implicit_enum_value_is_rejected() {
        let err = LibraryBuilder::new()
            .enumeration("E", &[("A", Some(1)), ("B", Some(0)), ("C", None)])
            .build(&Registry::new());
        assert!(matches!(err, Err(DlError::InvalidParameter(_))));
    }

    #[test]
    fn by_value_cycles_and_missing_types_fail() {
        let cyclic = LibraryBuilder::new()
            .structure("A", |s| s.field("b", Field::structure("A")))
            .build(&Registry::new());
        assert!(matches!(cyclic, Err(DlError::InvalidParameter(_))));

        let missing = LibraryBuilder::new()
            .structure("A", |s| s.field("b", Field::structure("Nope")))
            .build(&Registry::new());
        assert!(matches!(missing, Err(DlError::TypeNotFound(_))));

        let forward_ptr = LibraryBuilder::new()
            .structure("A", |s| s.field("b", Field::pointer("Later")))
            .build(&Registry::new());
        assert!(forward_ptr.is_ok());
    }

    #[test]
    fn resolves_types_from_existing_registry() {
        let mut registry = Registry::new();
        registry.register(
            LibraryBuilder::new()
                .structure("Base", |s| s.field("v", Field::float64()))
                .build(&Registry::new())
                .unwrap(),
        );
        let lib = LibraryBuilder::new()
            .structure("Derived", |s| s.field("base", Field::structure("Base")))
            .build(&registry)
            .unwrap();
        assert_eq!(find(&lib, "Derived").size, [8, 8]);
    }

    #[test]
    fn defaults_are_appended_to_the_blob() {
        let lib = LibraryBuilder::new()
            .structure("D", |s| {
                s.field("a", Field::uint16().with_default(vec![1, 2]))
                    .field("b", Field::uint8())
                    .field("c", Field::uint8().with_default(vec![3]))
            })
            .build(&Registry::new())
            .unwrap();
        let d = find(&lib, "D");
        assert_eq!(d.members[0].default_offset, Some(0));
        assert_eq!(d.members[1].default_offset, None);
        assert_eq!(d.members[2].default_offset, Some(2));
        assert_eq!(lib.defaults, vec![1, 2, 3]);
    }

    #[test]
    fn types_without_storage_are_rejected() {
        let empty = LibraryBuilder::new().structure("Empty", |s| s).build(&Registry::new());
        assert!(matches!(empty, Err(DlError::InvalidParameter(_))));

        let zero_inline = LibraryBuilder::new()
            .structure("Z", |s| s.field("none", Field::uint32().inline_array(0)))
            .build(&Registry::new());
        assert!(matches!(zero_inline, Err(DlError::InvalidParameter(_))));
    }

    #[test]
    fn oversized_inline_arrays_are_rejected() {
        let result = LibraryBuilder::new()
            .structure("Block", |s| s.field("words", Field::uint64().inline_array(u16::MAX)))
            .structure("Huge", |s| s.field("blocks", Field::structure("Block").inline_array(u16::MAX)))
            .build(&Registry::new());
        assert!(matches!(result, Err(DlError::InvalidParameter(_))));
    }
}
