// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! dl-core: schema-driven relocatable binary instances.
//!
//! Types are described by descriptors held in a [`Registry`]. A live object
//! graph in a [`Heap`] is [`pack`]ed into a self-describing blob whose
//! references are payload-relative offsets, [`load`]ed back into live form,
//! or [`convert`]ed to another byte order and pointer width.
//!
//! ```rust
//! use dl_core::typelib::{Field, LibraryBuilder};
//! use dl_core::{load, make_type_id, pack_to_vec, Format, Heap, Object, Registry, Value};
//!
//! # fn main() -> Result<(), dl_core::DlError> {
//! let mut registry = Registry::new();
//! registry.register(
//!     LibraryBuilder::new()
//!         .structure("Pair", |s| s.field("a", Field::int32()).field("b", Field::string()))
//!         .build(&registry)?,
//! );
//! let pair_id = make_type_id("Pair");
//!
//! let mut heap = Heap::new(Format::host());
//! let pair = Object::alloc(&registry, &mut heap, pair_id)?;
//! pair.set(&registry, &mut heap, "a", Value::Int(7))?;
//! pair.set(&registry, &mut heap, "b", Value::Str(Some("hi".into())))?;
//!
//! let packed = pack_to_vec(&registry, pair_id, &heap, pair.address)?;
//!
//! let mut other = Heap::new(Format::host());
//! let loaded = load(&registry, pair_id, &packed, &mut other)?;
//! assert_eq!(loaded.root.get_str(&registry, &other, "b")?.as_deref(), Some("hi"));
//! # Ok(())
//! # }
//! ```
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::use_self
)]

mod access;
/// Engine configuration and process-level context.
pub mod config;
mod convert;
mod error;
mod header;
mod heap;
mod ident;
mod layout;
mod load;
mod pack;
mod patch;
mod registry;
/// Type libraries: binary format, reader, writer, and builder.
pub mod typelib;
mod types;
mod util;
/// Seekable byte sinks used for measure-then-write output.
pub mod writer;

/// Named member access on live instances.
pub use access::{Object, Value};
/// Cross-format conversion of packed instances.
pub use convert::{convert, convert_in_place, converted_size};
pub use error::DlError;
/// Packed-instance header and inspection.
pub use header::{
    instance_info, payload_start, DataHeader, InstanceInfo, HEADER_SIZE, INSTANCE_MAGIC,
    INSTANCE_MAGIC_SWAPPED, INSTANCE_VERSION,
};
/// Simulated live address space.
pub use heap::{Address, Heap, Offset, Reference, HEAP_BASE};
pub use ident::{hash_bytes, make_type_id, TypeId};
pub use layout::{align_up, Endian, Format, PtrWidth};
pub use load::{load, load_in_place, Loaded};
pub use pack::{pack, pack_to_vec};
pub use registry::Registry;
/// Descriptor model.
pub use types::{
    bitfield_shift, Atom, EnumDesc, EnumValue, MemberDesc, Storage, TypeDesc, TypeWord,
};
/// File helpers.
pub use util::{load_from_file, store_to_file};
