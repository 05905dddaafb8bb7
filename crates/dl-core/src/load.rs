// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Instance loader: validates packed bytes and relocates them into a heap.
//!
//! Validation runs to completion before the destination heap is touched:
//! magic and byte order, format version, root type, pointer width, declared
//! payload length. Only then is the payload placed and patched.

use tracing::{debug, instrument};

use crate::access::Object;
use crate::error::DlError;
use crate::header::{payload_start, DataHeader, HEADER_SIZE, INSTANCE_MAGIC, INSTANCE_VERSION};
use crate::heap::{Address, Heap};
use crate::ident::TypeId;
use crate::layout::{read_uint, Format};
use crate::patch::Patcher;
use crate::registry::Registry;
use crate::types::TypeDesc;

/// Result of a successful load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Loaded {
    /// Live root instance.
    pub root: Object,
    /// Input bytes the instance occupied: header, alignment, and payload.
    pub consumed: usize,
}

/// Validated geometry of a packed instance.
struct Checked<'r> {
    root_ty: &'r TypeDesc,
    start: usize,
    consumed: usize,
}

fn check<'r>(
    registry: &'r Registry,
    type_id: TypeId,
    packed: &[u8],
    format: Format,
) -> Result<Checked<'r>, DlError> {
    if packed.len() < HEADER_SIZE {
        return Err(DlError::MalformedData("data smaller than instance header"));
    }
    let magic = read_uint(packed, 0, 4, format.endian)?;
    if magic != u64::from(INSTANCE_MAGIC) {
        if read_uint(packed, 0, 4, format.endian.swapped())? == u64::from(INSTANCE_MAGIC) {
            return Err(DlError::EndianMismatch {
                expected: format.endian,
                found: format.endian.swapped(),
            });
        }
        return Err(DlError::MalformedData("bad instance magic"));
    }
    let (header, _) = DataHeader::decode(packed)?;
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
    if header.width() != format.width {
        return Err(DlError::PtrWidthMismatch {
            expected: format.width,
            found: header.width(),
        });
    }
    let root_ty = registry.type_desc(type_id)?;
    let start = payload_start(root_ty.align(format.width));
    let payload = header.payload_size as usize;
    let consumed = start + payload;
    if consumed > packed.len() {
        return Err(DlError::BufferTooSmall {
            needed: consumed,
            capacity: packed.len(),
        });
    }
    if payload < root_ty.size(format.width) {
        return Err(DlError::MalformedData("payload smaller than root type"));
    }
    Ok(Checked {
        root_ty,
        start,
        consumed,
    })
}

/// Copies a packed instance into `heap` and patches it into a live graph.
///
/// The packed bytes must match the heap's byte order and pointer width;
/// [`convert`](crate::convert) them first otherwise. On a validation error
/// the heap is left untouched. Any later error leaves the copied payload
/// allocated but unusable.
#[instrument(skip(registry, packed, heap), fields(len = packed.len()))]
pub fn load(
    registry: &Registry,
    type_id: TypeId,
    packed: &[u8],
    heap: &mut Heap,
) -> Result<Loaded, DlError> {
    let checked = check(registry, type_id, packed, heap.format())?;
    let base = heap.alloc_bytes(&packed[checked.start..checked.consumed], 8);
    let structs = Patcher::new(registry, heap, base, checked.consumed - checked.start)
        .run(checked.root_ty)?;
    debug!(consumed = checked.consumed, structs, "instance loaded");
    Ok(Loaded {
        root: Object::new(type_id, base),
        consumed: checked.consumed,
    })
}

/// Patches a packed instance already stored in `heap` at `at`.
///
/// The `len` bytes at `at` are the packed instance; its payload is patched
/// in place and the returned root points into it.
#[instrument(skip(registry, heap), fields(at = %at))]
pub fn load_in_place(
    registry: &Registry,
    type_id: TypeId,
    heap: &mut Heap,
    at: Address,
    len: usize,
) -> Result<Loaded, DlError> {
    let checked = check(registry, type_id, heap.bytes(at, len)?, heap.format())?;
    let base = at.add(checked.start);
    let structs = Patcher::new(registry, heap, base, checked.consumed - checked.start)
        .run(checked.root_ty)?;
    debug!(consumed = checked.consumed, structs, "instance loaded in place");
    Ok(Loaded {
        root: Object::new(type_id, base),
        consumed: checked.consumed,
    })
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::access::Value;
    use crate::ident::make_type_id;
    use crate::layout::{Endian, PtrWidth};
    use crate::pack::pack_to_vec;
    use crate::typelib::{Field, LibraryBuilder};

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register(
            LibraryBuilder::new()
                .structure("Pair", |s| s.field("a", Field::int32()).field("b", Field::string()))
                .structure("Other", |s| s.field("x", Field::uint8()))
                .build(&Registry::new())
                .unwrap(),
        );
        registry
    }

    fn packed_pair(format: Format) -> (Registry, Vec<u8>) {
        let registry = registry();
        let mut heap = Heap::new(format);
        let pair = Object::alloc(&registry, &mut heap, make_type_id("Pair")).unwrap();
        pair.set(&registry, &mut heap, "a", Value::Int(7)).unwrap();
        pair.set(&registry, &mut heap, "b", Value::Str(Some("hi".into()))).unwrap();
        let bytes = pack_to_vec(&registry, make_type_id("Pair"), &heap, pair.address).unwrap();
        (registry, bytes)
    }

    #[test]
    fn copying_load_restores_fields() {
        let format = Format::new(Endian::Little, PtrWidth::Eight);
        let (registry, bytes) = packed_pair(format);
        let mut heap = Heap::new(format);
        let loaded = load(&registry, make_type_id("Pair"), &bytes, &mut heap).unwrap();
        assert_eq!(loaded.consumed, bytes.len());
        assert_eq!(loaded.root.get(&registry, &heap, "a").unwrap(), Value::Int(7));
        assert_eq!(
            loaded.root.get_str(&registry, &heap, "b").unwrap().as_deref(),
            Some("hi")
        );
    }

    #[test]
    fn in_place_load_points_into_the_blob() {
        let format = Format::new(Endian::Big, PtrWidth::Four);
        let (registry, bytes) = packed_pair(format);
        let mut heap = Heap::from_bytes(format, bytes.clone());
        let at = heap.base();
        let loaded = load_in_place(&registry, make_type_id("Pair"), &mut heap, at, bytes.len()).unwrap();
        assert_eq!(loaded.root.address, at.add(20));
        assert_eq!(
            loaded.root.get_str(&registry, &heap, "b").unwrap().as_deref(),
            Some("hi")
        );
    }

    #[test]
    fn validation_errors_leave_heap_untouched() {
        let format = Format::new(Endian::Little, PtrWidth::Eight);
        let (registry, bytes) = packed_pair(format);
        let mut heap = Heap::new(format);
        heap.alloc_str("keep");
        let before = heap.clone();

        let cases: Vec<(Vec<u8>, TypeId, Format)> = vec![
            (bytes[..10].to_vec(), make_type_id("Pair"), format),
            (bytes.clone(), make_type_id("Other"), format),
            (bytes[..bytes.len() - 1].to_vec(), make_type_id("Pair"), format),
            (bytes.clone(), make_type_id("Pair"), Format::new(Endian::Big, PtrWidth::Eight)),
            (bytes.clone(), make_type_id("Pair"), Format::new(Endian::Little, PtrWidth::Four)),
        ];
        for (data, ty, fmt) in cases {
            let mut target = Heap::new(fmt);
            target.alloc_str("keep");
            let snapshot = target.clone();
            assert!(load(&registry, ty, &data, &mut target).is_err());
            assert_eq!(target, snapshot);
        }
        assert!(matches!(
            load(&registry, make_type_id("Other"), &bytes, &mut heap),
            Err(DlError::TypeMismatch { .. })
        ));
        assert_eq!(heap, before);
    }

    #[test]
    fn error_kinds_follow_the_check_order() {
        let format = Format::new(Endian::Little, PtrWidth::Eight);
        let (registry, bytes) = packed_pair(format);
        let ty = make_type_id("Pair");

        let mut heap = Heap::new(Format::new(Endian::Big, PtrWidth::Eight));
        assert!(matches!(
            load(&registry, ty, &bytes, &mut heap),
            Err(DlError::EndianMismatch { expected: Endian::Big, found: Endian::Little })
        ));

        let mut heap = Heap::new(format);
        let mut bad = bytes.clone();
        bad[0] = b'X';
        assert!(matches!(load(&registry, ty, &bad, &mut heap), Err(DlError::MalformedData(_))));

        let mut bad = bytes.clone();
        bad[4] = 2;
        assert!(matches!(
            load(&registry, ty, &bad, &mut heap),
            Err(DlError::VersionMismatch { expected: 1, found: 2 })
        ));

        assert!(matches!(
            load(&registry, ty, &bytes[..30], &mut heap),
            Err(DlError::BufferTooSmall { needed: 43, capacity: 30 })
        ));

        let mut heap = Heap::new(Format::new(Endian::Little, PtrWidth::Four));
        assert!(matches!(
            load(&registry, ty, &bytes, &mut heap),
            Err(DlError::PtrWidthMismatch { .. })
        ));
    }

    #[test]
    fn offsets_outside_payload_are_malformed() {
        let format = Format::new(Endian::Little, PtrWidth::Eight);
        let (registry, mut bytes) = packed_pair(format);
        bytes[32..40].copy_from_slice(&100u64.to_le_bytes());
        let mut heap = Heap::new(format);
        assert!(matches!(
            load(&registry, make_type_id("Pair"), &bytes, &mut heap),
            Err(DlError::MalformedData(_))
        ));
    }
}
