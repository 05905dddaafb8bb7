// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Format converter: re-encodes packed instances for another byte order or
//! pointer width.
//!
//! Conversion works like a small relocating linker:
//!
//! 1. **Collect.** Walk the graph in the source layout and record every
//!    distinct instance (root, pointed-to structs, array storage, string
//!    bytes) keyed by its source offset.
//! 2. **Order.** Sort the instances by source offset.
//! 3. **Write.** Re-encode each instance in the target layout, appending in
//!    order. Reference fields get a placeholder plus a patch entry.
//! 4. **Patch.** Replace every placeholder with the target offset of the
//!    instance its source offset named. Target offsets are always relative
//!    to the converted payload; there is no caller-supplied base to add.
//!
//! Writing in ascending source order means the output cursor never passes
//! unread input when pointers shrink or stay the same size, which is what
//! makes [`convert_in_place`] possible.

use std::borrow::Cow;

use rustc_hash::FxHashMap;
use tracing::{debug, instrument};

use crate::error::DlError;
use crate::header::{payload_start, DataHeader, INSTANCE_VERSION};
use crate::ident::TypeId;
use crate::layout::{align_up, read_uint, Endian, Format, PtrWidth};
use crate::registry::Registry;
use crate::types::{bitfield_shift, Atom, MemberDesc, Storage, TypeDesc};
use crate::writer::{BufferSink, CountingSink, Sink};

/// What one collected instance holds.
#[derive(Clone, Copy, Debug)]
enum Shape<'r> {
    /// Struct or union elements.
    Struct(&'r TypeDesc),
    /// Numeric or enum elements of the given size.
    Pod(usize),
    /// String reference elements.
    Str,
    /// Pointer reference elements.
    Ptr(&'r TypeDesc),
    /// NUL-terminated string bytes; the count includes the terminator.
    Bytes,
}

impl Shape<'_> {
    fn stride(self, width: PtrWidth) -> usize {
        match self {
            Self::Struct(ty) => ty.size(width),
            Self::Pod(size) => size,
            Self::Str | Self::Ptr(_) => width.bytes(),
            Self::Bytes => 1,
        }
    }

    fn same_kind(self, other: Self) -> bool {
        match (self, other) {
            (Self::Struct(a), Self::Struct(b)) | (Self::Ptr(a), Self::Ptr(b)) => a.id == b.id,
            (Self::Pod(a), Self::Pod(b)) => a == b,
            (Self::Str, Self::Str) | (Self::Bytes, Self::Bytes) => true,
            _ => false,
        }
    }

    fn align(self, width: PtrWidth) -> usize {
        match self {
            Self::Struct(ty) => ty.align(width),
            Self::Pod(size) => size,
            Self::Str | Self::Ptr(_) => width.bytes(),
            Self::Bytes => 1,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Instance<'r> {
    /// Payload-relative source offset.
    src: u64,
    count: usize,
    shape: Shape<'r>,
}

/// Header facts of a source instance.
struct Source<'r> {
    format: Format,
    root_ty: &'r TypeDesc,
    start: usize,
    consumed: usize,
}

fn inspect<'r>(registry: &'r Registry, type_id: TypeId, packed: &[u8]) -> Result<Source<'r>, DlError> {
    let (header, endian) = DataHeader::decode(packed)?;
    if header.version != INSTANCE_VERSION {
        return Err(DlError::VersionMismatch {
            expected: INSTANCE_VERSION,
            found: header.version,
        });
    }
    if header.root() != type_id {
        return Err(DlError::TypeMismatch {
            expected: type_id,
            found: header.root(),
        });
    }
    let format = Format::new(endian, header.width());
    let root_ty = registry.type_desc(type_id)?;
    let start = payload_start(root_ty.align(format.width));
    let consumed = start + header.payload_size as usize;
    if consumed > packed.len() {
        return Err(DlError::BufferTooSmall {
            needed: consumed,
            capacity: packed.len(),
        });
    }
    Ok(Source {
        format,
        root_ty,
        start,
        consumed,
    })
}

struct Collector<'r, 'a> {
    registry: &'r Registry,
    payload: &'a [u8],
    endian: Endian,
    width: PtrWidth,
    index: FxHashMap<u64, usize>,
    instances: Vec<Instance<'r>>,
    queue: Vec<usize>,
}

impl<'r> Collector<'r, '_> {
    fn read(&self, at: usize, size: usize) -> Result<u64, DlError> {
        read_uint(self.payload, at, size, self.endian)
    }

    fn add(&mut self, src: u64, count: usize, shape: Shape<'r>) -> Result<(), DlError> {
        let end = usize::try_from(src)
            .ok()
            .and_then(|s| s.checked_add(count.checked_mul(shape.stride(self.width))?));
        if end.is_none_or(|end| end > self.payload.len()) {
            return Err(DlError::MalformedData("reference points outside the payload"));
        }
        if let Some(&i) = self.index.get(&src) {
            if !self.instances[i].shape.same_kind(shape) {
                return Err(DlError::MalformedData("two instances share one offset"));
            }
            // A longer view of the same storage replaces the shorter one.
            if count > self.instances[i].count {
                self.instances[i].count = count;
                self.queue.push(i);
            }
            return Ok(());
        }
        self.index.insert(src, self.instances.len());
        self.queue.push(self.instances.len());
        self.instances.push(Instance { src, count, shape });
        Ok(())
    }

    fn run(mut self) -> Result<Vec<Instance<'r>>, DlError> {
        while let Some(i) = self.queue.pop() {
            let Instance { src, count, shape } = self.instances[i];
            let stride = shape.stride(self.width);
            let base = usize::try_from(src).map_err(|_| DlError::MalformedData("offset overflows"))?;
            for n in 0..count {
                let at = base + n * stride;
                match shape {
                    Shape::Struct(ty) => self.scan_struct(ty, at)?,
                    Shape::Str => self.scan_value(Storage::Str, TypeId(0), at)?,
                    Shape::Ptr(ty) => self.scan_pointer(ty, at)?,
                    Shape::Pod(_) | Shape::Bytes => break,
                }
            }
        }
        Ok(self.instances)
    }

    fn scan_struct(&mut self, ty: &'r TypeDesc, at: usize) -> Result<(), DlError> {
        if ty.is_union {
            let tag = self.read(at + ty.union_tag_offset(self.width), 4)?;
            let member = ty.union_member(u32::try_from(tag).unwrap_or_default())?;
            return self.scan_member(member, at);
        }
        for member in &ty.members {
            self.scan_member(member, at)?;
        }
        Ok(())
    }

    fn scan_member(&mut self, member: &'r MemberDesc, base: usize) -> Result<(), DlError> {
        let at = base + member.offset(self.width);
        match member.atom() {
            Atom::Bitfield => Ok(()),
            Atom::Pod => self.scan_value(member.storage(), member.type_id, at),
            Atom::InlineArray => {
                let (stride, _) = self.registry.element_layout(member, self.width)?;
                for i in 0..member.word.inline_count() {
                    self.scan_value(member.storage(), member.type_id, at + i * stride)?;
                }
                Ok(())
            }
            Atom::Array => {
                let raw = self.read(at, self.width.bytes())?;
                let count = self.read(at + self.width.bytes(), 4)?;
                if raw == self.width.null_offset() || count == 0 {
                    return Ok(());
                }
                let shape = element_shape(self.registry, member)?;
                let count = usize::try_from(count).map_err(|_| DlError::MalformedData("array count overflows"))?;
                self.add(raw, count, shape)
            }
        }
    }

    fn scan_value(&mut self, storage: Storage, type_id: TypeId, at: usize) -> Result<(), DlError> {
        match storage {
            Storage::Str => {
                let raw = self.read(at, self.width.bytes())?;
                if raw == self.width.null_offset() {
                    return Ok(());
                }
                let len = usize::try_from(raw)
                    .ok()
                    .and_then(|start| self.payload.get(start..))
                    .and_then(|tail| tail.iter().position(|&b| b == 0))
                    .ok_or(DlError::MalformedData("unterminated string"))?;
                self.add(raw, len + 1, Shape::Bytes)
            }
            Storage::Ptr => self.scan_pointer(self.registry.type_desc(type_id)?, at),
            Storage::Struct => self.scan_struct(self.registry.type_desc(type_id)?, at),
            _ => Ok(()),
        }
    }

    fn scan_pointer(&mut self, ty: &'r TypeDesc, at: usize) -> Result<(), DlError> {
        let raw = self.read(at, self.width.bytes())?;
        if raw == self.width.null_offset() {
            return Ok(());
        }
        self.add(raw, 1, Shape::Struct(ty))
    }
}

fn element_shape<'r>(registry: &'r Registry, member: &MemberDesc) -> Result<Shape<'r>, DlError> {
    Ok(match member.storage() {
        Storage::Str => Shape::Str,
        Storage::Ptr => Shape::Ptr(registry.type_desc(member.type_id)?),
        Storage::Struct => Shape::Struct(registry.type_desc(member.type_id)?),
        Storage::Enum => Shape::Pod(registry.enum_desc(member.type_id)?.size()),
        storage => Shape::Pod(storage.pod_size().unwrap_or(8)),
    })
}

/// Where the writer reads source bytes from.
enum Input<'a> {
    /// A separate input buffer.
    Slice(&'a [u8]),
    /// The output buffer itself, read ahead of the write cursor.
    InPlace,
}

struct Writer<'r, 'a, S> {
    registry: &'r Registry,
    sink: S,
    input: Input<'a>,
    src: Format,
    dst: Format,
    src_start: usize,
    dst_start: usize,
    /// Target offset of each instance, by source offset.
    placed: FxHashMap<u64, u64>,
    /// Placeholder positions and the source offsets they referenced.
    patches: Vec<(usize, u64)>,
}

impl<'r, 'a, S: Sink> Writer<'r, 'a, S> {
    fn fetch(&self, start: usize, len: usize) -> Result<Cow<'a, [u8]>, DlError> {
        let range = start..start + len;
        match self.input {
            Input::Slice(data) => data.get(range).map(Cow::Borrowed),
            Input::InPlace => self.sink.contents().get(range).map(|b| Cow::Owned(b.to_vec())),
        }
        .ok_or(DlError::MalformedData("instance extends past end of data"))
    }

    fn read(&self, bytes: &[u8], at: usize, size: usize) -> Result<u64, DlError> {
        read_uint(bytes, at, size, self.src.endian)
    }

    fn write_instances(&mut self, instances: &[Instance<'r>]) -> Result<(), DlError> {
        self.sink.seek_set(0);
        self.sink.write_zero(self.dst_start);
        for (i, inst) in instances.iter().enumerate() {
            let src_pos = self.src_start + usize::try_from(inst.src).unwrap_or(usize::MAX);
            self.sink.seek_end();
            let dst = align_up(self.sink.tell(), inst.shape.align(self.dst.width));
            if matches!(self.input, Input::InPlace) {
                let end = dst + inst.count * inst.shape.stride(self.dst.width);
                let limit = instances
                    .get(i + 1)
                    .map_or(usize::MAX, |next| self.src_start + usize::try_from(next.src).unwrap_or(usize::MAX));
                if end > limit {
                    return Err(DlError::UnsupportedOperation(
                        "in-place conversion would overwrite unread data",
                    ));
                }
            }
            let bytes = self.fetch(src_pos, inst.count * inst.shape.stride(self.src.width))?;
            self.sink.align(inst.shape.align(self.dst.width));
            self.placed.insert(inst.src, (dst - self.dst_start) as u64);
            self.write_instance(*inst, &bytes, dst)?;
        }
        Ok(())
    }

    fn write_instance(&mut self, inst: Instance<'r>, bytes: &[u8], dst: usize) -> Result<(), DlError> {
        let (s_stride, t_stride) = (inst.shape.stride(self.src.width), inst.shape.stride(self.dst.width));
        match inst.shape {
            Shape::Bytes => self.sink.write(bytes),
            Shape::Pod(size) => {
                for chunk in bytes.chunks_exact(size) {
                    self.sink.write_uint(self.src.endian.decode(chunk), size);
                }
            }
            Shape::Str | Shape::Ptr(_) => {
                for n in 0..inst.count {
                    self.write_ref(bytes, n * s_stride, dst + n * t_stride)?;
                }
            }
            Shape::Struct(ty) => {
                for n in 0..inst.count {
                    self.write_struct(ty, bytes, n * s_stride, dst + n * t_stride)?;
                }
            }
        }
        Ok(())
    }

    fn write_ref(&mut self, bytes: &[u8], at: usize, dst: usize) -> Result<(), DlError> {
        let raw = self.read(bytes, at, self.src.width.bytes())?;
        self.sink.seek_set(dst);
        if raw == self.src.width.null_offset() {
            self.sink.write_ptr(self.dst.width.null_offset(), self.dst.width);
        } else {
            self.patches.push((dst, raw));
            self.sink.write_ptr(0, self.dst.width);
        }
        Ok(())
    }

    fn write_struct(&mut self, ty: &'r TypeDesc, bytes: &[u8], at: usize, dst: usize) -> Result<(), DlError> {
        self.sink.seek_set(dst);
        self.sink.write_zero(ty.size(self.dst.width));
        if ty.is_union {
            let tag = self.read(bytes, at + ty.union_tag_offset(self.src.width), 4)?;
            let member = ty.union_member(u32::try_from(tag).unwrap_or_default())?;
            self.write_member(member, bytes, at, dst)?;
            self.sink.seek_set(dst + ty.union_tag_offset(self.dst.width));
            self.sink.write_uint(tag, 4);
            return Ok(());
        }
        let mut i = 0;
        while i < ty.members.len() {
            let member = &ty.members[i];
            if member.atom() != Atom::Bitfield {
                self.write_member(member, bytes, at, dst)?;
                i += 1;
                continue;
            }
            let word_offset = member.offset(self.src.width);
            let run = ty.members[i..]
                .iter()
                .take_while(|m| m.atom() == Atom::Bitfield && m.offset(self.src.width) == word_offset)
                .count();
            self.write_bitfields(&ty.members[i..i + run], bytes, at, dst)?;
            i += run;
        }
        Ok(())
    }

    /// Re-packs bitfields sharing one storage word; bit numbering follows the
    /// byte order of each side.
    fn write_bitfields(&mut self, run: &[MemberDesc], bytes: &[u8], at: usize, dst: usize) -> Result<(), DlError> {
        let Some(first) = run.first() else {
            return Ok(());
        };
        let size = first.size(self.src.width);
        let word = self.read(bytes, at + first.offset(self.src.width), size)?;
        let mut out = 0u64;
        for member in run {
            let (bits, offset) = (member.word.bits(), member.word.bit_offset());
            let mask = u64::MAX >> (64 - bits);
            let value = (word >> bitfield_shift(self.src.endian, size, offset, bits)) & mask;
            out |= value << bitfield_shift(self.dst.endian, size, offset, bits);
        }
        self.sink.seek_set(dst + first.offset(self.dst.width));
        self.sink.write_uint(out, size);
        Ok(())
    }

    fn write_member(&mut self, member: &'r MemberDesc, bytes: &[u8], at: usize, dst: usize) -> Result<(), DlError> {
        let (s, d) = (at + member.offset(self.src.width), dst + member.offset(self.dst.width));
        match member.atom() {
            Atom::Bitfield => self.write_bitfields(std::slice::from_ref(member), bytes, at, dst),
            Atom::Pod => self.write_value(member.storage(), member.type_id, bytes, s, d, member.size(self.src.width)),
            Atom::InlineArray => {
                let (s_stride, _) = self.registry.element_layout(member, self.src.width)?;
                let (t_stride, _) = self.registry.element_layout(member, self.dst.width)?;
                for n in 0..member.word.inline_count() {
                    self.write_value(
                        member.storage(),
                        member.type_id,
                        bytes,
                        s + n * s_stride,
                        d + n * t_stride,
                        s_stride,
                    )?;
                }
                Ok(())
            }
            Atom::Array => {
                let raw = self.read(bytes, s, self.src.width.bytes())?;
                let count = self.read(bytes, s + self.src.width.bytes(), 4)?;
                let width = self.dst.width;
                self.sink.seek_set(d);
                if raw == self.src.width.null_offset() || count == 0 {
                    self.sink.write_ptr(width.null_offset(), width);
                    self.sink.write_zero(width.array_field_size() - width.bytes());
                } else {
                    self.patches.push((d, raw));
                    self.sink.write_ptr(0, width);
                    self.sink.write_uint(count, 4);
                    self.sink.write_zero(width.array_field_size() - width.bytes() - 4);
                }
                Ok(())
            }
        }
    }

    fn write_value(
        &mut self,
        storage: Storage,
        type_id: TypeId,
        bytes: &[u8],
        at: usize,
        dst: usize,
        size: usize,
    ) -> Result<(), DlError> {
        match storage {
            Storage::Str | Storage::Ptr => self.write_ref(bytes, at, dst),
            Storage::Struct => self.write_struct(self.registry.type_desc(type_id)?, bytes, at, dst),
            _ => {
                let value = self.read(bytes, at, size)?;
                self.sink.seek_set(dst);
                self.sink.write_uint(value, size);
                Ok(())
            }
        }
    }

    fn apply_patches(&mut self) -> Result<(), DlError> {
        for &(pos, old) in &self.patches {
            let new = self
                .placed
                .get(&old)
                .ok_or(DlError::MalformedData("reference does not start an instance"))?;
            self.sink.seek_set(pos);
            self.sink.write_ptr(*new, self.dst.width);
        }
        Ok(())
    }
}

fn collect<'r>(registry: &'r Registry, source: &Source<'r>, packed: &[u8]) -> Result<Vec<Instance<'r>>, DlError> {
    let mut collector = Collector {
        registry,
        payload: &packed[source.start..source.consumed],
        endian: source.format.endian,
        width: source.format.width,
        index: FxHashMap::default(),
        instances: Vec::new(),
        queue: Vec::new(),
    };
    collector.add(0, 1, Shape::Struct(source.root_ty))?;
    let mut instances = collector.run()?;
    instances.sort_by_key(|inst| inst.src);
    Ok(instances)
}

fn convert_into<S: Sink>(
    registry: &Registry,
    source: &Source<'_>,
    instances: &[Instance<'_>],
    input: Input<'_>,
    target: Format,
    sink: S,
) -> Result<(usize, S), DlError> {
    let dst_start = payload_start(source.root_ty.align(target.width));
    let mut writer = Writer {
        registry,
        sink,
        input,
        src: source.format,
        dst: target,
        src_start: source.start,
        dst_start,
        placed: FxHashMap::default(),
        patches: Vec::new(),
    };
    writer.write_instances(instances)?;
    writer.apply_patches()?;

    let total = writer.sink.needed_size();
    let payload = u32::try_from(total - dst_start)
        .map_err(|_| DlError::UnsupportedOperation("converted payload exceeds 4 GiB"))?;
    let header = DataHeader::new(source.root_ty.id, payload, target.width);
    writer.sink.seek_set(0);
    writer.sink.write(&header.encode(target.endian));
    debug!(
        instances = instances.len(),
        patches = writer.patches.len(),
        bytes = total,
        "instance converted"
    );
    Ok((total, writer.sink))
}

/// Converts a packed instance to the `target` byte order and pointer width.
///
/// With `out = None` only the converted size is computed. A buffer shorter
/// than the converted size fails with `BufferTooSmall`. Converting to the
/// source format copies the instance unchanged.
///
/// Offsets in the output are relative to its own payload start, the same as
/// [`pack`](crate::pack) produces. Rebasing them onto another origin is not
/// offered; loaders resolve offsets against wherever the payload lands.
#[instrument(skip(registry, packed, out), fields(len = packed.len()))]
pub fn convert(
    registry: &Registry,
    type_id: TypeId,
    packed: &[u8],
    target: Format,
    out: Option<&mut [u8]>,
) -> Result<usize, DlError> {
    let source = inspect(registry, type_id, packed)?;
    if source.format == target {
        if let Some(buf) = out {
            let capacity = buf.len();
            buf.get_mut(..source.consumed)
                .ok_or(DlError::BufferTooSmall {
                    needed: source.consumed,
                    capacity,
                })?
                .copy_from_slice(&packed[..source.consumed]);
        }
        return Ok(source.consumed);
    }
    let instances = collect(registry, &source, packed)?;
    let input = Input::Slice(packed);
    let Some(buf) = out else {
        let (size, _) = convert_into(registry, &source, &instances, input, target, CountingSink::new(target.endian))?;
        return Ok(size);
    };
    buf.fill(0);
    let (size, sink) = convert_into(
        registry,
        &source,
        &instances,
        input,
        target,
        BufferSink::new(buf, target.endian),
    )?;
    if !sink.fits() {
        return Err(DlError::BufferTooSmall {
            needed: size,
            capacity: sink.capacity(),
        });
    }
    Ok(size)
}

/// Size in bytes of `packed` once converted to `target`.
pub fn converted_size(
    registry: &Registry,
    type_id: TypeId,
    packed: &[u8],
    target: Format,
) -> Result<usize, DlError> {
    convert(registry, type_id, packed, target, None)
}

/// Converts a packed instance inside its own buffer and returns the new size.
///
/// Only conversions that keep or shrink the pointer width are possible; a
/// wider target fails with `UnsupportedOperation` before anything is written.
/// Bytes past the returned size are left as they were.
#[instrument(skip(registry, buf), fields(len = buf.len()))]
pub fn convert_in_place(
    registry: &Registry,
    type_id: TypeId,
    buf: &mut [u8],
    target: Format,
) -> Result<usize, DlError> {
    let source = inspect(registry, type_id, buf)?;
    if source.format == target {
        return Ok(source.consumed);
    }
    if target.width > source.format.width {
        return Err(DlError::UnsupportedOperation(
            "in-place conversion cannot widen pointers",
        ));
    }
    let instances = collect(registry, &source, buf)?;
    let (size, _) = convert_into(
        registry,
        &source,
        &instances,
        Input::InPlace,
        target,
        BufferSink::new(buf, target.endian),
    )?;
    Ok(size)
}
