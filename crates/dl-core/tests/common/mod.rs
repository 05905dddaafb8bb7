// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(dead_code)]
#![allow(clippy::expect_used, clippy::unwrap_used)]

use dl_core::typelib::{Field, LibraryBuilder};
use dl_core::{
    make_type_id, Endian, Format, Heap, Object, PtrWidth, Registry, Storage, TypeId, Value,
};

/// Every byte order and pointer width combination.
pub const FORMATS: [Format; 4] = [
    Format::new(Endian::Little, PtrWidth::Four),
    Format::new(Endian::Little, PtrWidth::Eight),
    Format::new(Endian::Big, PtrWidth::Four),
    Format::new(Endian::Big, PtrWidth::Eight),
];

pub fn everything_id() -> TypeId {
    make_type_id("Everything")
}

pub fn node_id() -> TypeId {
    make_type_id("Node")
}

/// Schema covering every member kind: numbers, bitfields, enums, strings,
/// pointers, embedded structs, unions, inline arrays, and relocated arrays.
pub fn registry() -> Registry {
    let mut registry = Registry::new();
    registry.register(
        LibraryBuilder::new()
            .enumeration_with_storage(
                "Kind",
                Storage::Int16,
                &[("Plain", None), ("Fancy", None), ("Odd", Some(-3))],
            )
            .structure("Vec2", |s| s.field("x", Field::float32()).field("y", Field::float32()))
            .structure("Node", |s| {
                s.field("id", Field::uint32())
                    .field("name", Field::string())
                    .field("next", Field::pointer("Node"))
                    .field("kind", Field::enumeration("Kind"))
            })
            .union("Choice", |s| s.field("num", Field::int32()).field("text", Field::string()))
            .structure("Everything", |s| {
                s.field("small", Field::int8())
                    .field("flags", Field::bitfield(3))
                    .field("mode", Field::bitfield(4))
                    .field("wide", Field::uint16())
                    .field("big", Field::int64())
                    .field("ratio", Field::float32())
                    .field("precise", Field::float64())
                    .field("kind", Field::enumeration("Kind"))
                    .field("label", Field::string())
                    .field("tags", Field::string().array())
                    .field("nums", Field::int32().array())
                    .field("fixed", Field::uint8().inline_array(3))
                    .field("pos", Field::structure("Vec2"))
                    .field("path", Field::structure("Vec2").array())
                    .field("choice", Field::structure("Choice"))
                    .field("head", Field::pointer("Node"))
                    .field("nodes", Field::pointer("Node").array())
            })
            .build(&Registry::new())
            .unwrap(),
    );
    registry
}

/// Values written into an `Everything` instance.
#[derive(Clone, Debug)]
pub struct Sample {
    pub small: i8,
    pub flags: u8,
    pub mode: u8,
    pub wide: u16,
    pub big: i64,
    pub ratio: f32,
    pub precise: f64,
    pub label: Option<String>,
    pub tags: Vec<String>,
    pub nums: Vec<i32>,
    pub choice_text: Option<String>,
    pub choice_num: i32,
    pub node_names: Vec<String>,
}

impl Default for Sample {
    fn default() -> Self {
        Self {
            small: -5,
            flags: 5,
            mode: 9,
            wide: 0xbeef,
            big: -1_234_567_890_123,
            ratio: 1.5,
            precise: -0.125,
            label: Some("label".into()),
            tags: vec!["alpha".into(), "beta".into(), "alpha".into()],
            nums: vec![1, -2, 3],
            choice_text: Some("chosen".into()),
            choice_num: 0,
            node_names: vec!["first".into(), "second".into()],
        }
    }
}

/// Builds an `Everything` graph in a fresh heap.
///
/// `head` points at the first node, the nodes form a ring through `next`,
/// and the `nodes` array points at every node again.
pub fn build(registry: &Registry, format: Format, sample: &Sample) -> (Heap, Object) {
    let mut heap = Heap::new(format);
    let root = Object::alloc(registry, &mut heap, everything_id()).unwrap();
    root.set(registry, &mut heap, "small", Value::Int(sample.small.into())).unwrap();
    root.set(registry, &mut heap, "flags", Value::UInt(sample.flags.into())).unwrap();
    root.set(registry, &mut heap, "mode", Value::UInt(sample.mode.into())).unwrap();
    root.set(registry, &mut heap, "wide", Value::UInt(sample.wide.into())).unwrap();
    root.set(registry, &mut heap, "big", Value::Int(sample.big)).unwrap();
    root.set(registry, &mut heap, "ratio", Value::Float(sample.ratio.into())).unwrap();
    root.set(registry, &mut heap, "precise", Value::Float(sample.precise)).unwrap();
    root.set_enum(registry, &mut heap, "kind", "Odd").unwrap();
    root.set(registry, &mut heap, "label", Value::Str(sample.label.clone())).unwrap();

    root.alloc_array(registry, &mut heap, "tags", sample.tags.len()).unwrap();
    for (i, tag) in sample.tags.iter().enumerate() {
        root.set_element(registry, &mut heap, "tags", i, Value::Str(Some(tag.clone()))).unwrap();
    }
    root.alloc_array(registry, &mut heap, "nums", sample.nums.len()).unwrap();
    for (i, n) in sample.nums.iter().enumerate() {
        root.set_element(registry, &mut heap, "nums", i, Value::Int((*n).into())).unwrap();
    }
    for i in 0..3 {
        root.set_element(registry, &mut heap, "fixed", i, Value::UInt(10 + i as u64)).unwrap();
    }

    let pos = root.field_object(registry, &heap, "pos").unwrap();
    pos.set(registry, &mut heap, "x", Value::Float(2.0)).unwrap();
    pos.set(registry, &mut heap, "y", Value::Float(-4.0)).unwrap();
    root.alloc_array(registry, &mut heap, "path", 2).unwrap();
    for (i, x) in [0.0, 1.0].into_iter().enumerate() {
        let point = root.element_object(registry, &heap, "path", i).unwrap();
        point.set(registry, &mut heap, "x", Value::Float(x)).unwrap();
        point.set(registry, &mut heap, "y", Value::Float(0.5)).unwrap();
    }

    let choice = root.field_object(registry, &heap, "choice").unwrap();
    match &sample.choice_text {
        Some(text) => choice.set(registry, &mut heap, "text", Value::Str(Some(text.clone()))).unwrap(),
        None => choice.set(registry, &mut heap, "num", Value::Int(sample.choice_num.into())).unwrap(),
    }

    let nodes: Vec<Object> = sample
        .node_names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let node = Object::alloc(registry, &mut heap, node_id()).unwrap();
            node.set(registry, &mut heap, "id", Value::UInt(i as u64 + 1)).unwrap();
            node.set(registry, &mut heap, "name", Value::Str(Some(name.clone()))).unwrap();
            node.set_enum(registry, &mut heap, "kind", "Fancy").unwrap();
            node
        })
        .collect();
    for (i, node) in nodes.iter().enumerate() {
        let next = nodes[(i + 1) % nodes.len()];
        node.set(registry, &mut heap, "next", Value::Ptr(Some(next))).unwrap();
    }
    root.set(registry, &mut heap, "head", Value::Ptr(nodes.first().copied())).unwrap();
    root.alloc_array(registry, &mut heap, "nodes", nodes.len()).unwrap();
    for (i, node) in nodes.iter().enumerate() {
        root.set_element(registry, &mut heap, "nodes", i, Value::Ptr(Some(*node))).unwrap();
    }
    (heap, root)
}

/// Asserts that `root` in `heap` holds the graph [`build`] made from `sample`.
pub fn assert_matches(registry: &Registry, heap: &Heap, root: Object, sample: &Sample) {
    let get = |name: &str| root.get(registry, heap, name).unwrap();
    assert_eq!(get("small"), Value::Int(sample.small.into()));
    assert_eq!(get("flags"), Value::UInt(sample.flags.into()));
    assert_eq!(get("mode"), Value::UInt(sample.mode.into()));
    assert_eq!(get("wide"), Value::UInt(sample.wide.into()));
    assert_eq!(get("big"), Value::Int(sample.big));
    assert_eq!(get("ratio"), Value::Float(sample.ratio.into()));
    assert_eq!(get("precise"), Value::Float(sample.precise));
    assert_eq!(root.enum_name(registry, heap, "kind").unwrap().as_deref(), Some("Odd"));
    assert_eq!(root.get_str(registry, heap, "label").unwrap(), sample.label);

    assert_eq!(root.len(registry, heap, "tags").unwrap(), sample.tags.len());
    for (i, tag) in sample.tags.iter().enumerate() {
        let value = root.element(registry, heap, "tags", i).unwrap();
        assert_eq!(value.as_str(), Some(tag.as_str()));
    }
    assert_eq!(root.len(registry, heap, "nums").unwrap(), sample.nums.len());
    for (i, n) in sample.nums.iter().enumerate() {
        assert_eq!(root.element(registry, heap, "nums", i).unwrap(), Value::Int((*n).into()));
    }
    for i in 0..3 {
        assert_eq!(root.element(registry, heap, "fixed", i).unwrap(), Value::UInt(10 + i as u64));
    }

    let pos = root.field_object(registry, heap, "pos").unwrap();
    assert_eq!(pos.get(registry, heap, "x").unwrap(), Value::Float(2.0));
    assert_eq!(pos.get(registry, heap, "y").unwrap(), Value::Float(-4.0));
    assert_eq!(root.len(registry, heap, "path").unwrap(), 2);
    for (i, x) in [0.0, 1.0].into_iter().enumerate() {
        let point = root.element_object(registry, heap, "path", i).unwrap();
        assert_eq!(point.get(registry, heap, "x").unwrap(), Value::Float(x));
        assert_eq!(point.get(registry, heap, "y").unwrap(), Value::Float(0.5));
    }

    let choice = root.field_object(registry, heap, "choice").unwrap();
    let active = choice.active_member(registry, heap).unwrap();
    match &sample.choice_text {
        Some(text) => {
            assert_eq!(active.name, "text");
            assert_eq!(choice.get_str(registry, heap, "text").unwrap().as_ref(), Some(text));
        }
        None => {
            assert_eq!(active.name, "num");
            assert_eq!(choice.get(registry, heap, "num").unwrap(), Value::Int(sample.choice_num.into()));
        }
    }

    let head = root.get_ptr(registry, heap, "head").unwrap();
    assert_eq!(root.len(registry, heap, "nodes").unwrap(), sample.node_names.len());
    let mut node = head;
    for (i, name) in sample.node_names.iter().enumerate() {
        let current = node.unwrap();
        assert_eq!(
            root.element(registry, heap, "nodes", i).unwrap(),
            Value::Ptr(Some(current))
        );
        assert_eq!(current.get(registry, heap, "id").unwrap(), Value::UInt(i as u64 + 1));
        assert_eq!(current.get_str(registry, heap, "name").unwrap().as_ref(), Some(name));
        assert_eq!(current.enum_name(registry, heap, "kind").unwrap().as_deref(), Some("Fancy"));
        node = current.get_ptr(registry, heap, "next").unwrap();
    }
    if !sample.node_names.is_empty() {
        assert_eq!(node, head);
    }
}
