// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs)]
#![allow(clippy::expect_used, clippy::unwrap_used)]
//! Registries assembled from several libraries, and the file-level helpers.

use std::fs;

use dl_core::config::{Context, EngineConfig};
use dl_core::typelib::{Field, LibraryBuilder, TypeLibrary};
use dl_core::{
    instance_info, load_from_file, make_type_id, pack_to_vec, DlError, Endian, Format, Heap,
    Object, PtrWidth, Registry, Storage, TypeWord, Value,
};

/// Base library with a struct and an enum.
fn base_library() -> TypeLibrary {
    LibraryBuilder::new()
        .enumeration("Shape", &[("Circle", None), ("Square", None)])
        .structure("Point", |s| s.field("x", Field::int32()).field("y", Field::int32()))
        .build(&Registry::new())
        .unwrap()
}

/// Library that embeds and points at types of the base library.
fn scene_library(existing: &Registry) -> TypeLibrary {
    LibraryBuilder::new()
        .structure("Sprite", |s| {
            s.field("at", Field::structure("Point"))
                .field("shape", Field::enumeration("Shape"))
                .field("name", Field::string())
                .field("anchor", Field::pointer("Point"))
                .field("scale", Field::uint16().with_default(3u16.to_le_bytes().to_vec()))
        })
        .build(existing)
        .unwrap()
}

fn populate(registry: &Registry, heap: &mut Heap) -> Object {
    let sprite = Object::alloc(registry, heap, make_type_id("Sprite")).unwrap();
    let at = sprite.field_object(registry, heap, "at").unwrap();
    at.set(registry, heap, "x", Value::Int(-4)).unwrap();
    at.set(registry, heap, "y", Value::Int(9)).unwrap();
    sprite.set_enum(registry, heap, "shape", "Square").unwrap();
    sprite.set(registry, heap, "name", Value::Str(Some("hero".into()))).unwrap();
    let anchor = Object::alloc(registry, heap, make_type_id("Point")).unwrap();
    anchor.set(registry, heap, "x", Value::Int(1)).unwrap();
    sprite.set(registry, heap, "anchor", Value::Ptr(Some(anchor))).unwrap();
    sprite
}

fn assert_sprite(registry: &Registry, heap: &Heap, sprite: Object) {
    let at = sprite.field_object(registry, heap, "at").unwrap();
    assert_eq!(at.get(registry, heap, "x").unwrap(), Value::Int(-4));
    assert_eq!(at.get(registry, heap, "y").unwrap(), Value::Int(9));
    assert_eq!(sprite.enum_name(registry, heap, "shape").unwrap().as_deref(), Some("Square"));
    assert_eq!(sprite.get_str(registry, heap, "name").unwrap().as_deref(), Some("hero"));
    let anchor = sprite.get_ptr(registry, heap, "anchor").unwrap().unwrap();
    assert_eq!(anchor.get(registry, heap, "x").unwrap(), Value::Int(1));
}

#[test]
fn types_resolve_across_serialized_libraries() {
    let mut staging = Registry::new();
    staging.register(base_library());
    let scene = scene_library(&staging).to_bytes();
    let base = base_library().to_bytes();

    // The scene library is registered first; its references resolve lazily.
    let mut registry = Registry::new();
    registry.load_library(&scene).unwrap();
    registry.load_library(&base).unwrap();
    assert_eq!(registry.size_of(make_type_id("Sprite"), PtrWidth::Four), Some(24));
    assert_eq!(registry.size_of(make_type_id("Sprite"), PtrWidth::Eight), Some(40));

    let format = Format::new(Endian::Little, PtrWidth::Four);
    let mut heap = Heap::new(format);
    let sprite = populate(&registry, &mut heap);
    assert_eq!(sprite.get(&registry, &heap, "scale").unwrap(), Value::UInt(3));

    let packed = pack_to_vec(&registry, make_type_id("Sprite"), &heap, sprite.address).unwrap();
    let mut target = Heap::new(format);
    let loaded = dl_core::load(&registry, make_type_id("Sprite"), &packed, &mut target).unwrap();
    assert_sprite(&registry, &target, loaded.root);
}

#[test]
fn first_registration_of_a_type_wins() {
    let mut registry = Registry::new();
    registry.register(base_library());
    registry.register(
        LibraryBuilder::new()
            .structure("Point", |s| s.field("z", Field::int64()))
            .build(&Registry::new())
            .unwrap(),
    );
    let point = registry.type_desc(make_type_id("Point")).unwrap();
    assert!(point.member("x").is_some());
    assert!(point.member("z").is_none());
}

#[test]
fn corrupt_library_registers_nothing() {
    let mut bytes = base_library().to_bytes();
    bytes.truncate(bytes.len() / 2);
    let mut registry = Registry::new();
    assert!(matches!(registry.load_library(&bytes), Err(DlError::MalformedData(_))));
    assert_eq!(registry.types().count(), 0);
    assert_eq!(registry.enums().count(), 0);
}

#[test]
fn context_loads_configured_libraries_and_files_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let base_path = dir.path().join("base.dltl");
    let scene_path = dir.path().join("scene.dltl");
    fs::write(&base_path, base_library().to_bytes()).unwrap();
    let mut staging = Registry::new();
    staging.register(base_library());
    fs::write(&scene_path, scene_library(&staging).to_bytes()).unwrap();

    let config = EngineConfig {
        host: Format::new(Endian::Little, PtrWidth::Eight),
        output: Format::new(Endian::Big, PtrWidth::Four),
        libraries: vec![base_path, scene_path],
    };
    let context = Context::from_config(&config).unwrap();
    let registry = context.registry();
    let mut heap = context.new_heap();
    let sprite = populate(registry, &mut heap);

    let out = dir.path().join("sprite.dl");
    let written = dl_core::store_to_file(
        registry,
        make_type_id("Sprite"),
        &heap,
        sprite.address,
        config.output,
        &out,
    )
    .unwrap();
    let stored = fs::read(&out).unwrap();
    assert_eq!(stored.len(), written);
    assert_eq!(instance_info(&stored).unwrap().format, config.output);

    let mut big_heap = Heap::new(config.output);
    let loaded = load_from_file(registry, make_type_id("Sprite"), &mut big_heap, &out).unwrap();
    assert_sprite(registry, &big_heap, loaded.root);

    // Widening goes through a second buffer.
    let narrow_heap = big_heap;
    let wide = dir.path().join("sprite-wide.dl");
    dl_core::store_to_file(
        registry,
        make_type_id("Sprite"),
        &narrow_heap,
        loaded.root.address,
        Format::new(Endian::Little, PtrWidth::Eight),
        &wide,
    )
    .unwrap();
    let mut wide_heap = Heap::new(Format::new(Endian::Little, PtrWidth::Eight));
    let reloaded = load_from_file(registry, make_type_id("Sprite"), &mut wide_heap, &wide).unwrap();
    assert_sprite(registry, &wide_heap, reloaded.root);
}

#[test]
fn defaults_follow_the_heap_byte_order() {
    let mut registry = Registry::new();
    registry.register(base_library());
    let scene = scene_library(&registry);
    registry.register(scene);
    for endian in [Endian::Little, Endian::Big] {
        let mut heap = Heap::new(Format::new(endian, PtrWidth::Four));
        let sprite = Object::alloc(&registry, &mut heap, make_type_id("Sprite")).unwrap();
        assert_eq!(sprite.get(&registry, &heap, "scale").unwrap(), Value::UInt(3), "{endian:?}");
    }
}

fn flags_library() -> TypeLibrary {
    LibraryBuilder::new()
        .structure("Flags", |s| s.field("lo", Field::bitfield(3)).field("hi", Field::bitfield(4)))
        .build(&Registry::new())
        .unwrap()
}

fn assert_rejected(library: &TypeLibrary) {
    let mut registry = Registry::new();
    assert!(matches!(
        registry.load_library(&library.to_bytes()),
        Err(DlError::MalformedData(_))
    ));
    assert_eq!(registry.types().count(), 0);
}

#[test]
fn inconsistent_descriptors_are_malformed() {
    let mut zero_width = flags_library();
    zero_width.types[0].members[0].word = TypeWord::bitfield(Storage::UInt8, 0, 0);
    assert_rejected(&zero_width);

    let mut past_word = flags_library();
    past_word.types[0].members[1].word = TypeWord::bitfield(Storage::UInt8, 4, 6);
    assert_rejected(&past_word);

    let mut past_type = base_library();
    let point = past_type.types.iter_mut().find(|t| t.name == "Point").unwrap();
    point.members[1].offset = [8, 8];
    assert_rejected(&past_type);

    let mut odd_align = base_library();
    let point = odd_align.types.iter_mut().find(|t| t.name == "Point").unwrap();
    point.alignment = [3, 3];
    assert_rejected(&odd_align);

    let mut registry = Registry::new();
    registry.load_library(&flags_library().to_bytes()).unwrap();
}
