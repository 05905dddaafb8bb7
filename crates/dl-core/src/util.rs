// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! File helpers built on pack, convert, and load.

use std::fs;
use std::path::Path;

use tracing::{debug, instrument};

use crate::convert::{convert, convert_in_place};
use crate::error::DlError;
use crate::heap::{Address, Heap};
use crate::ident::TypeId;
use crate::layout::Format;
use crate::load::{load, Loaded};
use crate::pack::pack_to_vec;
use crate::registry::Registry;

/// Packs the instance at `root` and writes it to `path` in the `target` format.
///
/// Conversions that keep or shrink the pointer width run in the packed
/// buffer; wider targets are converted into a second buffer. Returns the
/// number of bytes written.
#[instrument(skip(registry, heap, root, path), fields(path = %path.as_ref().display()))]
pub fn store_to_file(
    registry: &Registry,
    type_id: TypeId,
    heap: &Heap,
    root: Address,
    target: Format,
    path: impl AsRef<Path>,
) -> Result<usize, DlError> {
    let mut packed = pack_to_vec(registry, type_id, heap, root)?;
    let bytes = if target.width <= heap.format().width {
        let size = convert_in_place(registry, type_id, &mut packed, target)?;
        packed.truncate(size);
        packed
    } else {
        let size = convert(registry, type_id, &packed, target, None)?;
        let mut out = vec![0; size];
        convert(registry, type_id, &packed, target, Some(&mut out))?;
        out
    };
    fs::write(path.as_ref(), &bytes)?;
    debug!(bytes = bytes.len(), "instance stored");
    Ok(bytes.len())
}

/// Reads a packed instance from `path` and loads it into `heap`.
#[instrument(skip(registry, heap, path), fields(path = %path.as_ref().display()))]
pub fn load_from_file(
    registry: &Registry,
    type_id: TypeId,
    heap: &mut Heap,
    path: impl AsRef<Path>,
) -> Result<Loaded, DlError> {
    let bytes = fs::read(path.as_ref())?;
    load(registry, type_id, &bytes, heap)
}
