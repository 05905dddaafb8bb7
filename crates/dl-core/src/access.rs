// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Named member access on live instances.
//!
//! An [`Object`] is a typed handle into a [`Heap`]. Members are addressed by
//! name and read or written as [`Value`]s, so object graphs can be built and
//! inspected without hand-computed offsets. Setting a member of a union also
//! selects it.

use crate::error::DlError;
use crate::heap::{Address, Heap};
use crate::ident::TypeId;
use crate::layout::Endian;
use crate::registry::Registry;
use crate::types::{bitfield_shift, Atom, MemberDesc, Storage, TypeDesc};

/// Value of a scalar, string, or pointer slot.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Signed integer or enum value.
    Int(i64),
    /// Unsigned integer or bitfield value.
    UInt(u64),
    /// Floating-point value.
    Float(f64),
    /// String contents, `None` for a null string.
    Str(Option<String>),
    /// Referenced object, `None` for a null pointer.
    Ptr(Option<Object>),
}

impl Value {
    /// Integer view of `Int` and `UInt` values.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// String view of `Str` values.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => s.as_deref(),
            _ => None,
        }
    }
}

/// Typed handle to a live instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Object {
    /// Type of the instance.
    pub type_id: TypeId,
    /// Address of the instance's first byte.
    pub address: Address,
}

/// Element location: what is stored where.
#[derive(Clone, Copy)]
struct Slot {
    address: Address,
    storage: Storage,
    type_id: TypeId,
    size: usize,
}

fn sign_extend(raw: u64, size: usize) -> i64 {
    let shift = 64 - 8 * size as u32;
    (raw << shift).cast_signed() >> shift
}

fn kind_error(member: &MemberDesc, what: &str) -> DlError {
    DlError::InvalidParameter(format!("member {} {what}", member.name))
}

impl Object {
    /// Wraps an existing address.
    #[must_use]
    pub const fn new(type_id: TypeId, address: Address) -> Self {
        Self { type_id, address }
    }

    /// Allocates a zeroed instance of `type_id` and applies member defaults.
    ///
    /// Default blobs are little-endian, like the type library that carries
    /// them; each default is re-encoded in the heap's byte order. Defaults
    /// apply to plain numeric and enum members only.
    pub fn alloc(registry: &Registry, heap: &mut Heap, type_id: TypeId) -> Result<Self, DlError> {
        let width = heap.format().width;
        let ty = registry.type_desc(type_id)?;
        let address = heap.alloc(ty.size(width), ty.align(width));
        for member in &ty.members {
            let plain = member.atom() == Atom::Pod
                && (member.storage().pod_size().is_some() || member.storage() == Storage::Enum);
            if !plain {
                continue;
            }
            if let Some(bytes) = registry.default_value(member, width) {
                let value = Endian::Little.decode(bytes);
                heap.write_uint(address.add(member.offset(width)), bytes.len(), value)?;
            }
        }
        Ok(Self { type_id, address })
    }

    fn desc<'r>(&self, registry: &'r Registry) -> Result<&'r TypeDesc, DlError> {
        registry.type_desc(self.type_id)
    }

    fn member<'r>(&self, registry: &'r Registry, name: &str) -> Result<&'r MemberDesc, DlError> {
        self.desc(registry)?.member_or_err(name)
    }

    fn member_address(&self, heap: &Heap, member: &MemberDesc) -> Address {
        self.address.add(member.offset(heap.format().width))
    }

    /// Reads a plain member (number, enum, bitfield, string, or pointer).
    pub fn get(&self, registry: &Registry, heap: &Heap, name: &str) -> Result<Value, DlError> {
        let member = self.member(registry, name)?;
        let address = self.member_address(heap, member);
        match member.atom() {
            Atom::Bitfield => {
                let size = member.size(heap.format().width);
                let word = heap.read_uint(address, size)?;
                let bits = member.word.bits();
                let shift = bitfield_shift(heap.format().endian, size, member.word.bit_offset(), bits);
                Ok(Value::UInt((word >> shift) & (u64::MAX >> (64 - bits))))
            }
            Atom::Pod => read_slot(
                registry,
                heap,
                Slot {
                    address,
                    storage: member.storage(),
                    type_id: member.type_id,
                    size: member.size(heap.format().width),
                },
            ),
            Atom::Array | Atom::InlineArray => Err(kind_error(member, "is an array")),
        }
    }

    /// Writes a plain member; on a union this also selects the member.
    pub fn set(
        &self,
        registry: &Registry,
        heap: &mut Heap,
        name: &str,
        value: Value,
    ) -> Result<(), DlError> {
        let ty = self.desc(registry)?;
        let member = ty.member_or_err(name)?;
        let address = self.member_address(heap, member);
        match member.atom() {
            Atom::Bitfield => {
                let v = match value {
                    Value::UInt(v) => v,
                    Value::Int(v) => {
                        u64::try_from(v).map_err(|_| kind_error(member, "holds unsigned bits"))?
                    }
                    _ => return Err(kind_error(member, "holds unsigned bits")),
                };
                let bits = member.word.bits();
                let mask = u64::MAX >> (64 - bits);
                if v > mask {
                    return Err(kind_error(member, "cannot hold the value"));
                }
                let size = member.size(heap.format().width);
                let shift = bitfield_shift(heap.format().endian, size, member.word.bit_offset(), bits);
                let word = heap.read_uint(address, size)?;
                heap.write_uint(address, size, (word & !(mask << shift)) | (v << shift))?;
            }
            Atom::Pod => write_slot(
                registry,
                heap,
                Slot {
                    address,
                    storage: member.storage(),
                    type_id: member.type_id,
                    size: member.size(heap.format().width),
                },
                value,
            )?,
            Atom::Array | Atom::InlineArray => return Err(kind_error(member, "is an array")),
        }
        if ty.is_union {
            self.select(registry, heap, name)?;
        }
        Ok(())
    }

    /// Handle to a struct member embedded by value.
    pub fn field_object(&self, registry: &Registry, heap: &Heap, name: &str) -> Result<Self, DlError> {
        let member = self.member(registry, name)?;
        if member.atom() != Atom::Pod || member.storage() != Storage::Struct {
            return Err(kind_error(member, "is not an embedded struct"));
        }
        Ok(Self::new(member.type_id, self.member_address(heap, member)))
    }

    /// Resolves a pointer member to the object it references.
    pub fn get_ptr(&self, registry: &Registry, heap: &Heap, name: &str) -> Result<Option<Self>, DlError> {
        match self.get(registry, heap, name)? {
            Value::Ptr(target) => Ok(target),
            _ => Err(kind_error(self.member(registry, name)?, "is not a pointer")),
        }
    }

    /// Reads a string member.
    pub fn get_str(&self, registry: &Registry, heap: &Heap, name: &str) -> Result<Option<String>, DlError> {
        match self.get(registry, heap, name)? {
            Value::Str(text) => Ok(text),
            _ => Err(kind_error(self.member(registry, name)?, "is not a string")),
        }
    }

    /// Reads an enum member as the name of its enumerator.
    pub fn enum_name(&self, registry: &Registry, heap: &Heap, name: &str) -> Result<Option<String>, DlError> {
        let member = self.member(registry, name)?;
        let en = registry.enum_desc(member.type_id)?;
        let value = self
            .get(registry, heap, name)?
            .as_i64()
            .ok_or_else(|| kind_error(member, "is not an enum"))?;
        Ok(en.name_of(value).map(str::to_owned))
    }

    /// Writes an enum member by enumerator name.
    pub fn set_enum(&self, registry: &Registry, heap: &mut Heap, name: &str, value: &str) -> Result<(), DlError> {
        let member = self.member(registry, name)?;
        let en = registry.enum_desc(member.type_id)?;
        let raw = en
            .value_of(value)
            .ok_or_else(|| DlError::InvalidParameter(format!("{value} is not a value of {}", en.name)))?;
        self.set(registry, heap, name, Value::Int(raw))
    }

    /// Writes the hidden discriminant of a union so `name` becomes live.
    pub fn select(&self, registry: &Registry, heap: &mut Heap, name: &str) -> Result<(), DlError> {
        let ty = self.desc(registry)?;
        if !ty.is_union {
            return Err(DlError::InvalidParameter(format!("{} is not a union", ty.name)));
        }
        let tag = ty.member_or_err(name)?.union_tag();
        let at = self.address.add(ty.union_tag_offset(heap.format().width));
        heap.write_uint(at, 4, u64::from(tag))
    }

    /// Member currently selected by a union's discriminant.
    pub fn active_member<'r>(&self, registry: &'r Registry, heap: &Heap) -> Result<&'r MemberDesc, DlError> {
        let ty = self.desc(registry)?;
        if !ty.is_union {
            return Err(DlError::InvalidParameter(format!("{} is not a union", ty.name)));
        }
        let at = self.address.add(ty.union_tag_offset(heap.format().width));
        let tag = u32::try_from(heap.read_uint(at, 4)?).unwrap_or_default();
        ty.union_member(tag)
    }

    /// Element count of an array or inline-array member.
    pub fn len(&self, registry: &Registry, heap: &Heap, name: &str) -> Result<usize, DlError> {
        let member = self.member(registry, name)?;
        match member.atom() {
            Atom::InlineArray => Ok(member.word.inline_count()),
            Atom::Array => {
                let at = self.member_address(heap, member).add(heap.format().width.bytes());
                Ok(usize::try_from(heap.read_uint(at, 4)?).unwrap_or_default())
            }
            Atom::Pod | Atom::Bitfield => Err(kind_error(member, "is not an array")),
        }
    }

    /// Allocates zeroed storage for `count` elements of an array member and
    /// points the member at it. A count of zero stores a null array.
    pub fn alloc_array(
        &self,
        registry: &Registry,
        heap: &mut Heap,
        name: &str,
        count: usize,
    ) -> Result<(), DlError> {
        let member = self.member(registry, name)?;
        if member.atom() != Atom::Array {
            return Err(kind_error(member, "is not an array"));
        }
        let width = heap.format().width;
        let field = self.member_address(heap, member);
        let count32 = u32::try_from(count).map_err(|_| kind_error(member, "cannot hold that many elements"))?;
        let data = if count == 0 {
            None
        } else {
            let (stride, align) = registry.element_layout(member, width)?;
            Some(heap.alloc(stride * count, align))
        };
        heap.write_ref(field, data)?;
        heap.write_uint(field.add(width.bytes()), 4, u64::from(count32))
    }

    fn element_slot(
        &self,
        registry: &Registry,
        heap: &Heap,
        name: &str,
        index: usize,
    ) -> Result<Slot, DlError> {
        let member = self.member(registry, name)?;
        let width = heap.format().width;
        let field = self.member_address(heap, member);
        let (stride, _) = registry.element_layout(member, width)?;
        let (data, len) = match member.atom() {
            Atom::InlineArray => (Some(field), member.word.inline_count()),
            Atom::Array => (
                heap.read_ref(field)?.address(),
                usize::try_from(heap.read_uint(field.add(width.bytes()), 4)?).unwrap_or_default(),
            ),
            Atom::Pod | Atom::Bitfield => return Err(kind_error(member, "is not an array")),
        };
        match data {
            Some(data) if index < len => Ok(Slot {
                address: data.add(index * stride),
                storage: member.storage(),
                type_id: member.type_id,
                size: stride,
            }),
            _ => Err(DlError::InvalidParameter(format!(
                "index {index} out of bounds for {name} (len {len})"
            ))),
        }
    }

    /// Reads element `index` of an array or inline-array member.
    pub fn element(&self, registry: &Registry, heap: &Heap, name: &str, index: usize) -> Result<Value, DlError> {
        let slot = self.element_slot(registry, heap, name, index)?;
        read_slot(registry, heap, slot)
    }

    /// Writes element `index` of an array or inline-array member.
    pub fn set_element(
        &self,
        registry: &Registry,
        heap: &mut Heap,
        name: &str,
        index: usize,
        value: Value,
    ) -> Result<(), DlError> {
        let slot = self.element_slot(registry, heap, name, index)?;
        write_slot(registry, heap, slot, value)
    }

    /// Handle to struct element `index` of an array or inline-array member.
    pub fn element_object(&self, registry: &Registry, heap: &Heap, name: &str, index: usize) -> Result<Self, DlError> {
        let slot = self.element_slot(registry, heap, name, index)?;
        if slot.storage != Storage::Struct {
            return Err(DlError::InvalidParameter(format!("elements of {name} are not structs")));
        }
        Ok(Self::new(slot.type_id, slot.address))
    }
}

fn enum_is_signed(registry: &Registry, type_id: TypeId) -> Result<bool, DlError> {
    Ok(registry.enum_desc(type_id)?.storage.is_signed())
}

fn read_slot(registry: &Registry, heap: &Heap, slot: Slot) -> Result<Value, DlError> {
    match slot.storage {
        Storage::Str => match heap.read_ref(slot.address)?.address() {
            None => Ok(Value::Str(None)),
            Some(at) => String::from_utf8(heap.c_str(at)?.to_vec())
                .map(|s| Value::Str(Some(s)))
                .map_err(|_| DlError::MalformedData("string is not UTF-8")),
        },
        Storage::Ptr => Ok(Value::Ptr(
            heap.read_ref(slot.address)?
                .address()
                .map(|at| Object::new(slot.type_id, at)),
        )),
        Storage::Struct => Err(DlError::InvalidParameter(
            "struct values are accessed through object handles".to_owned(),
        )),
        Storage::Fp32 => {
            let raw = u32::try_from(heap.read_uint(slot.address, 4)?).unwrap_or_default();
            Ok(Value::Float(f64::from(f32::from_bits(raw))))
        }
        Storage::Fp64 => Ok(Value::Float(f64::from_bits(heap.read_uint(slot.address, 8)?))),
        Storage::Enum => {
            let raw = heap.read_uint(slot.address, slot.size)?;
            if enum_is_signed(registry, slot.type_id)? {
                Ok(Value::Int(sign_extend(raw, slot.size)))
            } else {
                Ok(Value::Int(raw.cast_signed()))
            }
        }
        storage if storage.is_signed() => {
            let raw = heap.read_uint(slot.address, slot.size)?;
            Ok(Value::Int(sign_extend(raw, slot.size)))
        }
        _ => Ok(Value::UInt(heap.read_uint(slot.address, slot.size)?)),
    }
}

fn write_slot(registry: &Registry, heap: &mut Heap, slot: Slot, value: Value) -> Result<(), DlError> {
    let mismatch = || {
        DlError::InvalidParameter(format!("value {value:?} does not fit {:?} storage", slot.storage))
    };
    let raw = match (slot.storage, &value) {
        (Storage::Str, Value::Str(text)) => {
            let target = text.as_deref().map(|t| heap.alloc_str(t));
            return heap.write_ref(slot.address, target);
        }
        (Storage::Ptr, Value::Ptr(target)) => {
            if let Some(obj) = target {
                if obj.type_id != slot.type_id {
                    return Err(DlError::TypeMismatch {
                        expected: slot.type_id,
                        found: obj.type_id,
                    });
                }
            }
            return heap.write_ref(slot.address, target.map(|t| t.address));
        }
        #[allow(clippy::cast_possible_truncation)]
        (Storage::Fp32, Value::Float(v)) => u64::from((*v as f32).to_bits()),
        (Storage::Fp64, Value::Float(v)) => v.to_bits(),
        (Storage::Enum, Value::Int(v)) => {
            registry.enum_desc(slot.type_id)?;
            v.cast_unsigned()
        }
        (storage, Value::Int(v)) if storage.is_integer() => v.cast_unsigned(),
        (storage, Value::UInt(v)) if storage.is_integer() => *v,
        _ => return Err(mismatch()),
    };
    heap.write_uint(slot.address, slot.size, raw)
}
