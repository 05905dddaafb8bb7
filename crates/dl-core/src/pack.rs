// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Instance packer: live object graph to relocatable bytes.
//!
//! The packed form is written in the heap's own byte order and pointer width;
//! use [`convert`](crate::convert) to retarget it.
//!
//! Every reference becomes a payload-relative offset. Pointed-to structs are
//! reserved at the end of the output and recorded by source address before
//! their members are written, so each distinct target is emitted once and
//! cycles terminate. Strings are interned by content.

use rustc_hash::FxHashMap;
use tracing::{debug, instrument};

use crate::error::DlError;
use crate::header::{payload_start, DataHeader};
use crate::heap::{Address, Heap};
use crate::ident::TypeId;
use crate::layout::PtrWidth;
use crate::registry::Registry;
use crate::types::{Atom, MemberDesc, Storage, TypeDesc};
use crate::writer::{BufferSink, CountingSink, Sink};

struct Packer<'a, S> {
    registry: &'a Registry,
    heap: &'a Heap,
    width: PtrWidth,
    sink: S,
    /// Position of the payload inside the output.
    start: usize,
    /// Pointer targets already placed, by source address.
    placed: FxHashMap<Address, u64>,
    /// Interned strings, by content.
    strings: FxHashMap<&'a [u8], u64>,
    /// Reserved structs whose members are still to be written.
    pending: Vec<(&'a TypeDesc, Address, usize)>,
}

impl<'a, S: Sink> Packer<'a, S> {
    fn relative(&self, pos: usize) -> u64 {
        (pos - self.start) as u64
    }

    fn run(&mut self, root_ty: &'a TypeDesc, root: Address) -> Result<(), DlError> {
        self.placed.insert(root, 0);
        self.pending.push((root_ty, root, self.start));
        while let Some((ty, src, dst)) = self.pending.pop() {
            self.store_struct(ty, src, dst)?;
        }
        Ok(())
    }

    fn store_struct(&mut self, ty: &'a TypeDesc, src: Address, dst: usize) -> Result<(), DlError> {
        if ty.is_union {
            let tag_offset = ty.union_tag_offset(self.width);
            let raw = self.heap.read_uint(src.add(tag_offset), 4)?;
            let member = ty.union_member(u32::try_from(raw).unwrap_or_default())?;
            self.store_member(member, src, dst)?;
            self.sink.seek_set(dst + tag_offset);
            self.sink.write_uint(raw, 4);
            return Ok(());
        }
        for member in &ty.members {
            self.store_member(member, src, dst)?;
        }
        Ok(())
    }

    fn store_member(&mut self, member: &'a MemberDesc, base: Address, dst: usize) -> Result<(), DlError> {
        let offset = member.offset(self.width);
        let (src, dst) = (base.add(offset), dst + offset);
        match member.atom() {
            Atom::Pod | Atom::Bitfield => {
                self.store_value(member.storage(), member.type_id, src, dst, member.size(self.width))
            }
            Atom::InlineArray => {
                let (stride, _) = self.registry.element_layout(member, self.width)?;
                if member.storage().pod_size().is_some() || member.storage() == Storage::Enum {
                    return self.copy(src, dst, stride * member.word.inline_count());
                }
                for i in 0..member.word.inline_count() {
                    let at = i * stride;
                    self.store_value(member.storage(), member.type_id, src.add(at), dst + at, stride)?;
                }
                Ok(())
            }
            Atom::Array => self.store_array(member, src, dst),
        }
    }

    fn store_value(
        &mut self,
        storage: Storage,
        type_id: TypeId,
        src: Address,
        dst: usize,
        size: usize,
    ) -> Result<(), DlError> {
        match storage {
            Storage::Str => self.store_string(src, dst),
            Storage::Ptr => self.store_pointer(type_id, src, dst),
            Storage::Struct => self.store_struct(self.registry.type_desc(type_id)?, src, dst),
            _ => self.copy(src, dst, size),
        }
    }

    fn copy(&mut self, src: Address, dst: usize, len: usize) -> Result<(), DlError> {
        let bytes = self.heap.bytes(src, len)?;
        self.sink.seek_set(dst);
        self.sink.write(bytes);
        Ok(())
    }

    fn write_ref(&mut self, dst: usize, offset: Option<u64>) {
        self.sink.seek_set(dst);
        self.sink
            .write_ptr(offset.unwrap_or(self.width.null_offset()), self.width);
    }

    fn store_string(&mut self, field: Address, dst: usize) -> Result<(), DlError> {
        let Some(target) = self.heap.read_ref(field)?.address() else {
            self.write_ref(dst, None);
            return Ok(());
        };
        let bytes = self.heap.c_str(target)?;
        let offset = if let Some(&offset) = self.strings.get(bytes) {
            offset
        } else {
            self.sink.seek_end();
            let offset = self.relative(self.sink.tell());
            self.sink.write(bytes);
            self.sink.write(&[0]);
            self.strings.insert(bytes, offset);
            offset
        };
        self.write_ref(dst, Some(offset));
        Ok(())
    }

    fn store_pointer(&mut self, type_id: TypeId, field: Address, dst: usize) -> Result<(), DlError> {
        let Some(target) = self.heap.read_ref(field)?.address() else {
            self.write_ref(dst, None);
            return Ok(());
        };
        let offset = if let Some(&offset) = self.placed.get(&target) {
            offset
        } else {
            let sub = self.registry.type_desc(type_id)?;
            self.sink.seek_end();
            self.sink.align(sub.align(self.width));
            let pos = self.sink.tell();
            self.sink.reserve(sub.size(self.width));
            let offset = self.relative(pos);
            self.placed.insert(target, offset);
            self.pending.push((sub, target, pos));
            offset
        };
        self.write_ref(dst, Some(offset));
        Ok(())
    }

    fn store_array(&mut self, member: &'a MemberDesc, field: Address, dst: usize) -> Result<(), DlError> {
        let data = self.heap.read_ref(field)?.address();
        let count = self.heap.read_uint(field.add(self.width.bytes()), 4)?;
        let (data, count) = match (data, count) {
            (Some(data), 1..) => (data, count),
            _ => {
                self.write_ref(dst, None);
                self.sink.write_zero(self.width.array_field_size() - self.width.bytes());
                return Ok(());
            }
        };
        let len = usize::try_from(count).map_err(|_| DlError::MalformedData("array count overflows"))?;
        let (stride, align) = self.registry.element_layout(member, self.width)?;
        self.sink.seek_end();
        self.sink.align(align);
        let pos = self.sink.tell();
        self.sink.reserve(stride * len);
        let storage = member.storage();
        if storage.pod_size().is_some() || storage == Storage::Enum {
            self.copy(data, pos, stride * len)?;
        } else {
            for i in 0..len {
                let at = i * stride;
                self.store_value(storage, member.type_id, data.add(at), pos + at, stride)?;
            }
        }
        self.write_ref(dst, Some(self.relative(pos)));
        self.sink.write_uint(count, 4);
        self.sink.write_zero(self.width.array_field_size() - self.width.bytes() - 4);
        Ok(())
    }
}

fn pack_into<S: Sink>(
    registry: &Registry,
    root_ty: &TypeDesc,
    heap: &Heap,
    root: Address,
    sink: S,
) -> Result<(usize, S), DlError> {
    let width = heap.format().width;
    let start = payload_start(root_ty.align(width));
    let mut packer = Packer {
        registry,
        heap,
        width,
        sink,
        start,
        placed: FxHashMap::default(),
        strings: FxHashMap::default(),
        pending: Vec::new(),
    };
    packer.sink.write_zero(start);
    packer.sink.reserve(root_ty.size(width));
    packer.run(root_ty, root)?;

    let total = packer.sink.needed_size();
    let payload = u32::try_from(total - start)
        .map_err(|_| DlError::UnsupportedOperation("packed payload exceeds 4 GiB"))?;
    let header = DataHeader::new(root_ty.id, payload, width);
    packer.sink.seek_set(0);
    packer.sink.write(&header.encode(heap.format().endian));
    debug!(
        bytes = total,
        pointers = packer.placed.len(),
        strings = packer.strings.len(),
        "instance packed"
    );
    Ok((total, packer.sink))
}

/// Packs the instance of `type_id` at `root` into relocatable bytes.
///
/// With `out = None` nothing is written and the exact packed size is
/// returned. With a buffer, the buffer is overwritten from the start and the
/// packed size is returned; a buffer smaller than that fails with
/// `BufferTooSmall` and holds unspecified contents.
#[instrument(skip(registry, heap, root, out), fields(root = %root))]
pub fn pack(
    registry: &Registry,
    type_id: TypeId,
    heap: &Heap,
    root: Address,
    out: Option<&mut [u8]>,
) -> Result<usize, DlError> {
    let root_ty = registry.type_desc(type_id)?;
    let endian = heap.format().endian;
    let Some(buf) = out else {
        let (size, _) = pack_into(registry, root_ty, heap, root, CountingSink::new(endian))?;
        return Ok(size);
    };
    buf.fill(0);
    let (size, sink) = pack_into(registry, root_ty, heap, root, BufferSink::new(buf, endian))?;
    if !sink.fits() {
        return Err(DlError::BufferTooSmall {
            needed: size,
            capacity: sink.capacity(),
        });
    }
    Ok(size)
}

/// Packs into a freshly allocated buffer of the exact size.
pub fn pack_to_vec(
    registry: &Registry,
    type_id: TypeId,
    heap: &Heap,
    root: Address,
) -> Result<Vec<u8>, DlError> {
    let size = pack(registry, type_id, heap, root, None)?;
    let mut buf = vec![0; size];
    pack(registry, type_id, heap, root, Some(&mut buf))?;
    Ok(buf)
}
