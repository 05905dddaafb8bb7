// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Pointer patcher: rewrites payload-relative offsets into live addresses.
//!
//! Each reference field is visited exactly once. Pointed-to structs and array
//! storage are tracked by their resolved address, so shared targets are
//! patched once and cyclic graphs terminate. Only the active member of a
//! union is patched.

use rustc_hash::FxHashSet;

use crate::error::DlError;
use crate::heap::{Address, Heap, Offset, Reference};
use crate::ident::TypeId;
use crate::layout::PtrWidth;
use crate::registry::Registry;
use crate::types::{Atom, MemberDesc, Storage, TypeDesc};

pub(crate) struct Patcher<'a> {
    registry: &'a Registry,
    heap: &'a mut Heap,
    width: PtrWidth,
    /// Address of payload offset 0.
    base: Address,
    /// Payload length; every offset must stay inside it.
    len: u64,
    /// Struct instances already queued, by address.
    visited: FxHashSet<Address>,
    /// Array storage already patched, by address.
    arrays: FxHashSet<Address>,
    pending: Vec<(&'a TypeDesc, Address)>,
}

impl<'a> Patcher<'a> {
    pub(crate) fn new(registry: &'a Registry, heap: &'a mut Heap, base: Address, len: usize) -> Self {
        let width = heap.format().width;
        Self {
            registry,
            heap,
            width,
            base,
            len: len as u64,
            visited: FxHashSet::default(),
            arrays: FxHashSet::default(),
            pending: Vec::new(),
        }
    }

    /// Patches the graph rooted at payload offset 0; returns the number of
    /// structs visited.
    pub(crate) fn run(mut self, root_ty: &'a TypeDesc) -> Result<usize, DlError> {
        self.visited.insert(self.base);
        self.pending.push((root_ty, self.base));
        while let Some((ty, at)) = self.pending.pop() {
            self.patch_struct(ty, at)?;
        }
        Ok(self.visited.len())
    }

    /// Rewrites one reference field; returns the live target, `None` for null.
    fn patch_ref(&mut self, field: Address, need: usize) -> Result<Option<Address>, DlError> {
        let raw = self.heap.read_uint(field, self.width.bytes())?;
        let Reference::Relative(Offset(raw)) = Reference::packed(raw, self.width.null_offset()) else {
            self.heap.write_ref(field, None)?;
            return Ok(None);
        };
        let end = raw.checked_add(need as u64);
        if end.is_none_or(|end| end > self.len) {
            return Err(DlError::MalformedData("offset points outside the payload"));
        }
        let target = Address(self.base.0 + raw);
        self.heap.write_ref(field, Some(target))?;
        Ok(Some(target))
    }

    fn patch_struct(&mut self, ty: &'a TypeDesc, at: Address) -> Result<(), DlError> {
        if ty.is_union {
            let tag = self.heap.read_uint(at.add(ty.union_tag_offset(self.width)), 4)?;
            let member = ty.union_member(u32::try_from(tag).unwrap_or_default())?;
            return self.patch_member(member, at);
        }
        for member in &ty.members {
            self.patch_member(member, at)?;
        }
        Ok(())
    }

    fn patch_member(&mut self, member: &'a MemberDesc, base: Address) -> Result<(), DlError> {
        let at = base.add(member.offset(self.width));
        match member.atom() {
            Atom::Bitfield => Ok(()),
            Atom::Pod => self.patch_value(member.storage(), member.type_id, at),
            Atom::InlineArray => {
                if !needs_patching(member.storage()) {
                    return Ok(());
                }
                let (stride, _) = self.registry.element_layout(member, self.width)?;
                for i in 0..member.word.inline_count() {
                    self.patch_value(member.storage(), member.type_id, at.add(i * stride))?;
                }
                Ok(())
            }
            Atom::Array => {
                let count = self.heap.read_uint(at.add(self.width.bytes()), 4)?;
                let len = usize::try_from(count).map_err(|_| DlError::MalformedData("array count overflows"))?;
                let (stride, _) = self.registry.element_layout(member, self.width)?;
                let need = stride
                    .checked_mul(len)
                    .ok_or(DlError::MalformedData("array count overflows"))?;
                let Some(data) = self.patch_ref(at, need)? else {
                    return Ok(());
                };
                if !needs_patching(member.storage()) || !self.arrays.insert(data) {
                    return Ok(());
                }
                for i in 0..len {
                    self.patch_value(member.storage(), member.type_id, data.add(i * stride))?;
                }
                Ok(())
            }
        }
    }

    fn patch_value(&mut self, storage: Storage, type_id: TypeId, at: Address) -> Result<(), DlError> {
        match storage {
            Storage::Str => self.patch_ref(at, 1).map(drop),
            Storage::Ptr => {
                let sub = self.registry.type_desc(type_id)?;
                if let Some(target) = self.patch_ref(at, sub.size(self.width))? {
                    if self.visited.insert(target) {
                        self.pending.push((sub, target));
                    }
                }
                Ok(())
            }
            Storage::Struct => self.patch_struct(self.registry.type_desc(type_id)?, at),
            _ => Ok(()),
        }
    }
}

/// Whether elements of this storage can hold references.
fn needs_patching(storage: Storage) -> bool {
    matches!(storage, Storage::Str | Storage::Ptr | Storage::Struct)
}
