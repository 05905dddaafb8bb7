// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs)]
#![allow(clippy::expect_used, clippy::unwrap_used)]
//! Conversion between every pair of byte orders and pointer widths.

mod common;

use common::{assert_matches, build, everything_id, registry, Sample, FORMATS};
use dl_core::{
    convert, convert_in_place, converted_size, instance_info, load, pack_to_vec, DlError, Endian,
    Format, Heap, PtrWidth,
};
use proptest::prelude::*;

fn sample_strategy() -> impl Strategy<Value = Sample> {
    let numbers = (
        any::<i8>(),
        0u8..8,
        0u8..16,
        any::<u16>(),
        any::<i64>(),
        -1.0e6f32..1.0e6,
        -1.0e9f64..1.0e9,
    );
    let strings = (
        proptest::option::of("[a-z]{0,8}"),
        prop::collection::vec("[a-z]{0,6}", 0..4),
        prop::collection::vec(any::<i32>(), 0..5),
        proptest::option::of("[a-z]{1,8}"),
        any::<i32>(),
        prop::collection::vec("[a-z]{1,6}", 0..4),
    );
    (numbers, strings).prop_map(
        |(
            (small, flags, mode, wide, big, ratio, precise),
            (label, tags, nums, choice_text, choice_num, node_names),
        )| Sample {
            small,
            flags,
            mode,
            wide,
            big,
            ratio,
            precise,
            label,
            tags,
            nums,
            choice_text,
            choice_num,
            node_names,
        },
    )
}

fn format_strategy() -> impl Strategy<Value = Format> {
    prop::sample::select(FORMATS.to_vec())
}

fn convert_to_vec(packed: &[u8], target: Format) -> Vec<u8> {
    let registry = registry();
    let size = converted_size(&registry, everything_id(), packed, target).unwrap();
    let mut out = vec![0; size];
    let written = convert(&registry, everything_id(), packed, target, Some(&mut out)).unwrap();
    assert_eq!(written, size);
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn converted_instances_load_and_convert_back(
        sample in sample_strategy(),
        source in format_strategy(),
        target in format_strategy(),
    ) {
        let registry = registry();
        let (heap, root) = build(&registry, source, &sample);
        let packed = pack_to_vec(&registry, everything_id(), &heap, root.address).unwrap();

        let converted = convert_to_vec(&packed, target);
        let info = instance_info(&converted).unwrap();
        prop_assert_eq!(info.format, target);
        prop_assert_eq!(info.root_type, everything_id());

        let mut live = Heap::new(target);
        let loaded = load(&registry, everything_id(), &converted, &mut live).unwrap();
        prop_assert_eq!(loaded.consumed, converted.len());
        assert_matches(&registry, &live, loaded.root, &sample);

        prop_assert_eq!(convert_to_vec(&converted, source), packed);
    }

    #[test]
    fn in_place_narrowing_matches_buffered_conversion(
        sample in sample_strategy(),
        source_endian in prop::sample::select(vec![Endian::Little, Endian::Big]),
        target in format_strategy(),
    ) {
        let registry = registry();
        let source = Format::new(source_endian, PtrWidth::Eight);
        let (heap, root) = build(&registry, source, &sample);
        let mut packed = pack_to_vec(&registry, everything_id(), &heap, root.address).unwrap();

        let expected = convert_to_vec(&packed, target);
        let size = convert_in_place(&registry, everything_id(), &mut packed, target).unwrap();
        prop_assert_eq!(size, expected.len());
        prop_assert_eq!(&packed[..size], &expected[..]);
    }
}

#[test]
fn in_place_widening_is_refused_without_writing() {
    let registry = registry();
    let (heap, root) = build(&registry, Format::new(Endian::Little, PtrWidth::Four), &Sample::default());
    let mut packed = pack_to_vec(&registry, everything_id(), &heap, root.address).unwrap();
    let before = packed.clone();

    let err = convert_in_place(
        &registry,
        everything_id(),
        &mut packed,
        Format::new(Endian::Big, PtrWidth::Eight),
    )
    .unwrap_err();
    assert!(matches!(err, DlError::UnsupportedOperation(_)));
    assert_eq!(packed, before);
}

#[test]
fn narrowing_shrinks_and_widening_grows() {
    let registry = registry();
    let wide = Format::new(Endian::Little, PtrWidth::Eight);
    let narrow = Format::new(Endian::Big, PtrWidth::Four);
    let (heap, root) = build(&registry, wide, &Sample::default());
    let packed = pack_to_vec(&registry, everything_id(), &heap, root.address).unwrap();

    let narrowed = converted_size(&registry, everything_id(), &packed, narrow).unwrap();
    assert!(narrowed < packed.len());
    let same = converted_size(&registry, everything_id(), &packed, wide).unwrap();
    assert_eq!(same, packed.len());
}

#[test]
fn short_output_buffer_is_reported() {
    let registry = registry();
    let (heap, root) = build(&registry, Format::new(Endian::Little, PtrWidth::Eight), &Sample::default());
    let packed = pack_to_vec(&registry, everything_id(), &heap, root.address).unwrap();
    let target = Format::new(Endian::Big, PtrWidth::Four);

    let size = converted_size(&registry, everything_id(), &packed, target).unwrap();
    let mut out = vec![0; size - 1];
    assert!(matches!(
        convert(&registry, everything_id(), &packed, target, Some(&mut out)),
        Err(DlError::BufferTooSmall { .. })
    ));
}
