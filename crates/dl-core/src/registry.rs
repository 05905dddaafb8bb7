// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Schema registry: every type and enum descriptor known to an engine context.
//!
//! A registry is an explicitly constructed, append-only value. Libraries are
//! registered up front; afterwards the registry is only read, so it can be
//! shared by reference across concurrent pack/load/convert calls.

use rustc_hash::FxHashMap;
use tracing::{debug, instrument, warn};

use crate::error::DlError;
use crate::ident::TypeId;
use crate::layout::PtrWidth;
use crate::typelib::TypeLibrary;
use crate::types::{EnumDesc, MemberDesc, Storage, TypeDesc};

/// Registry of type and enum descriptors keyed by [`TypeId`].
#[derive(Debug, Default, Clone)]
pub struct Registry {
    types: Vec<TypeDesc>,
    type_index: FxHashMap<TypeId, usize>,
    enums: Vec<EnumDesc>,
    enum_index: FxHashMap<TypeId, usize>,
    defaults: Vec<u8>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a binary type library and registers its contents.
    ///
    /// Fails with `MalformedData` on a bad magic or truncated section and with
    /// `VersionMismatch` on a library of another format version. Nothing is
    /// registered when parsing fails.
    #[instrument(skip_all, fields(len = bytes.len()))]
    pub fn load_library(&mut self, bytes: &[u8]) -> Result<(), DlError> {
        let library = TypeLibrary::from_bytes(bytes)?;
        self.register(library);
        Ok(())
    }

    /// Registers an in-memory library.
    ///
    /// Types may reference types from libraries registered earlier or later;
    /// references are resolved lazily. An id that is already registered keeps
    /// its first descriptor.
    pub fn register(&mut self, library: TypeLibrary) {
        let TypeLibrary {
            types,
            enums,
            defaults,
        } = library;
        let rebase = u32::try_from(self.defaults.len()).unwrap_or(u32::MAX);
        self.defaults.extend_from_slice(&defaults);

        let (mut added_types, mut added_enums) = (0usize, 0usize);
        for mut ty in types {
            if self.type_index.contains_key(&ty.id) {
                warn!(name = %ty.name, id = %ty.id, "duplicate type id ignored");
                continue;
            }
            for member in &mut ty.members {
                member.default_offset = member.default_offset.map(|o| o.saturating_add(rebase));
            }
            self.type_index.insert(ty.id, self.types.len());
            self.types.push(ty);
            added_types += 1;
        }
        for en in enums {
            if self.enum_index.contains_key(&en.id) {
                warn!(name = %en.name, id = %en.id, "duplicate enum id ignored");
                continue;
            }
            self.enum_index.insert(en.id, self.enums.len());
            self.enums.push(en);
            added_enums += 1;
        }
        debug!(added_types, added_enums, "library registered");
    }

    /// Looks up a type descriptor.
    #[must_use]
    pub fn find_type(&self, id: TypeId) -> Option<&TypeDesc> {
        self.type_index.get(&id).map(|&i| &self.types[i])
    }

    /// Looks up a type descriptor, reporting `TypeNotFound` when absent.
    pub fn type_desc(&self, id: TypeId) -> Result<&TypeDesc, DlError> {
        self.find_type(id).ok_or(DlError::TypeNotFound(id))
    }

    /// Looks up an enum descriptor.
    #[must_use]
    pub fn find_enum(&self, id: TypeId) -> Option<&EnumDesc> {
        self.enum_index.get(&id).map(|&i| &self.enums[i])
    }

    /// Looks up an enum descriptor, reporting `TypeNotFound` when absent.
    pub fn enum_desc(&self, id: TypeId) -> Result<&EnumDesc, DlError> {
        self.find_enum(id).ok_or(DlError::TypeNotFound(id))
    }

    /// Looks up a member of a registered type by name.
    pub fn find_member(&self, type_id: TypeId, name: &str) -> Result<&MemberDesc, DlError> {
        self.type_desc(type_id)?.member_or_err(name)
    }

    /// Default value bytes of `member` in `width` layout, if it has one.
    #[must_use]
    pub fn default_value(&self, member: &MemberDesc, width: PtrWidth) -> Option<&[u8]> {
        let start = usize::try_from(member.default_offset?).ok()?;
        self.defaults.get(start..start + member.size(width))
    }

    /// Size of a registered type at `width`.
    #[must_use]
    pub fn size_of(&self, id: TypeId, width: PtrWidth) -> Option<usize> {
        self.find_type(id).map(|t| t.size(width))
    }

    /// Alignment of a registered type at `width`.
    #[must_use]
    pub fn align_of(&self, id: TypeId, width: PtrWidth) -> Option<usize> {
        self.find_type(id).map(|t| t.align(width))
    }

    /// Stride and alignment of one element of an array or inline-array member.
    pub fn element_layout(
        &self,
        member: &MemberDesc,
        width: PtrWidth,
    ) -> Result<(usize, usize), DlError> {
        let storage = member.storage();
        if let Some(size) = storage.pod_size() {
            return Ok((size, size));
        }
        match storage {
            Storage::Str | Storage::Ptr => Ok((width.bytes(), width.bytes())),
            Storage::Struct => {
                let sub = self.type_desc(member.type_id)?;
                Ok((sub.size(width), sub.align(width)))
            }
            _ => {
                let size = self.enum_desc(member.type_id)?.size();
                Ok((size, size))
            }
        }
    }

    /// All registered types in registration order.
    pub fn types(&self) -> impl Iterator<Item = &TypeDesc> {
        self.types.iter()
    }

    /// All registered enums in registration order.
    pub fn enums(&self) -> impl Iterator<Item = &EnumDesc> {
        self.enums.iter()
    }
}
