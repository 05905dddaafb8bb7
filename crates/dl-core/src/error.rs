// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Error type shared by every engine operation.

use std::io;

use thiserror::Error;

use crate::heap::Address;
use crate::ident::TypeId;
use crate::layout::{Endian, PtrWidth};

/// Errors returned by registry, pack, load, and convert operations.
///
/// A non-success result means any destination buffer holds unspecified
/// contents and must not be reused as a packed instance.
#[derive(Debug, Error)]
pub enum DlError {
    /// Bad magic, truncated data, or an offset pointing outside the payload.
    #[error("malformed data: {0}")]
    MalformedData(&'static str),

    /// Format version in the data differs from the engine's.
    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Version this engine reads and writes.
        expected: u32,
        /// Version found in the data.
        found: u32,
    },

    /// Data carries the byte-swapped magic; convert it before loading.
    #[error("endian mismatch: data is {found:?} endian, expected {expected:?}")]
    EndianMismatch {
        /// Byte order the caller can load.
        expected: Endian,
        /// Byte order of the data.
        found: Endian,
    },

    /// Data was packed with a pointer width other than the destination's.
    #[error("pointer width mismatch: data uses {found:?}, expected {expected:?}")]
    PtrWidthMismatch {
        /// Pointer width the caller can load.
        expected: PtrWidth,
        /// Pointer width of the data.
        found: PtrWidth,
    },

    /// Root type id in the data differs from the requested type.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Requested type id.
        expected: TypeId,
        /// Type id stored in the header.
        found: TypeId,
    },

    /// A type or enum id is not present in the registry.
    #[error("type {0} not found in registry")]
    TypeNotFound(TypeId),

    /// A member name or union discriminant does not match any member.
    #[error("member {member} not found in type {ty}")]
    MemberNotFound {
        /// Name of the type that was searched.
        ty: String,
        /// Member name, or the discriminant rendered as hex.
        member: String,
    },

    /// Destination buffer is smaller than the produced output.
    #[error("buffer too small: need {needed} bytes, have {capacity}")]
    BufferTooSmall {
        /// Bytes the operation requires.
        needed: usize,
        /// Bytes the caller supplied.
        capacity: usize,
    },

    /// The requested operation cannot be performed on this data.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// A caller-supplied argument is out of range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// An access through a live heap fell outside its allocations.
    #[error("address {address} out of bounds for {len} bytes")]
    BadAddress {
        /// First byte of the attempted access.
        address: Address,
        /// Length of the attempted access.
        len: usize,
    },

    /// IO error from the file utilities.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
