// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Identifier and hashing utilities.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Strongly typed identifier for a type or enum in a [`Registry`](crate::Registry).
///
/// `TypeId` values are produced by [`make_type_id`] which hashes the type's
/// name. Collisions between names are not detected; two names hashing to the
/// same id are indistinguishable to the registry.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct TypeId(pub u32);

impl TypeId {
    /// Returns the raw 32-bit value stored in packed headers and type libraries.
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Hashes `bytes` into the 32-bit id space used for type names, enum names,
/// and union discriminants.
///
/// The empty input hashes to zero.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    const SEED: u32 = 5381;
    let hash = bytes.iter().fold(SEED, |hash, &b| {
        hash.wrapping_mul(33).wrapping_add(u32::from(b))
    });
    hash.wrapping_sub(SEED)
}

/// Produces the [`TypeId`] for a type or enum `name`.
#[must_use]
pub fn make_type_id(name: &str) -> TypeId {
    TypeId(hash_bytes(name.as_bytes()))
}
