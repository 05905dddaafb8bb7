// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Type libraries: immutable bundles of type and enum descriptors.
//!
//! Libraries travel as `DLTL` bytes (see [`format`]) and are registered into a
//! [`Registry`](crate::Registry). [`LibraryBuilder`] defines libraries in code
//! and computes both pointer-width layouts.
//!
//! ```rust
//! use dl_core::typelib::{Field, LibraryBuilder};
//! use dl_core::{make_type_id, PtrWidth, Registry};
//!
//! # fn main() -> Result<(), dl_core::DlError> {
//! let library = LibraryBuilder::new()
//!     .structure("Pair", |s| s.field("a", Field::int32()).field("b", Field::string()))
//!     .build(&Registry::new())?;
//!
//! let mut registry = Registry::new();
//! registry.load_library(&library.to_bytes())?;
//! assert_eq!(registry.size_of(make_type_id("Pair"), PtrWidth::Eight), Some(16));
//! # Ok(())
//! # }
//! ```

mod builder;
pub mod format;
mod read;
mod write;

pub use builder::{Field, LibraryBuilder, StructBuilder};

use crate::types::{EnumDesc, TypeDesc};

/// Descriptors of one type library.
///
/// Member default offsets index into `defaults`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TypeLibrary {
    /// Struct and union descriptors.
    pub types: Vec<TypeDesc>,
    /// Enum descriptors.
    pub enums: Vec<EnumDesc>,
    /// Default-value blob; values are little-endian.
    pub defaults: Vec<u8>,
}
