// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Seekable byte sinks shared by the packer and the converter.
//!
//! Output is produced by a single traversal written against [`Sink`]. Running
//! it over a [`CountingSink`] measures the exact output size; running it over
//! a [`BufferSink`] materializes the bytes. Both track the same cursor and
//! "needed size" high-water mark, so the two passes agree byte for byte.

use crate::layout::{align_up, Endian, PtrWidth};

/// Cursor state common to every sink.
#[derive(Clone, Copy, Debug, Default)]
struct Cursor {
    pos: usize,
    needed: usize,
}

impl Cursor {
    fn advance(&mut self, len: usize) -> std::ops::Range<usize> {
        let start = self.pos;
        self.pos += len;
        self.needed = self.needed.max(self.pos);
        start..self.pos
    }
}

/// Append-mostly byte sink with a repositionable write cursor.
pub trait Sink {
    /// Byte order used by the integer helpers.
    fn endian(&self) -> Endian;

    /// Current cursor position.
    fn tell(&self) -> usize;

    /// Moves the cursor to `pos` (may be before already-written bytes).
    fn seek_set(&mut self, pos: usize);

    /// Moves the cursor to the needed-size watermark.
    fn seek_end(&mut self);

    /// Highest position written or reserved so far.
    fn needed_size(&self) -> usize;

    /// Writes `bytes` at the cursor and advances it.
    fn write(&mut self, bytes: &[u8]);

    /// Writes `len` zero bytes at the cursor and advances it.
    fn write_zero(&mut self, len: usize);

    /// Raises the watermark to cursor + `len` without writing or moving.
    fn reserve(&mut self, len: usize);

    /// Bytes materialized so far; empty for measuring sinks.
    fn contents(&self) -> &[u8];

    /// Pads with zeros up to the next multiple of `align`.
    fn align(&mut self, align: usize) {
        let pos = self.tell();
        self.write_zero(align_up(pos, align) - pos);
    }

    /// Writes the low `size` bytes of `value` in the sink's byte order.
    fn write_uint(&mut self, value: u64, size: usize) {
        let encoded = self.endian().encode(value, size);
        self.write(&encoded[..size.min(8)]);
    }

    /// Writes a `u32` in the sink's byte order.
    fn write_u32(&mut self, value: u32) {
        self.write_uint(u64::from(value), 4);
    }

    /// Writes a pointer-sized value.
    fn write_ptr(&mut self, value: u64, width: PtrWidth) {
        self.write_uint(value, width.bytes());
    }
}

/// Measuring sink: tracks positions, stores nothing.
#[derive(Clone, Debug)]
pub struct CountingSink {
    cursor: Cursor,
    endian: Endian,
}

impl CountingSink {
    /// Creates a measuring sink.
    #[must_use]
    pub fn new(endian: Endian) -> Self {
        Self {
            cursor: Cursor::default(),
            endian,
        }
    }
}

impl Sink for CountingSink {
    fn endian(&self) -> Endian {
        self.endian
    }

    fn tell(&self) -> usize {
        self.cursor.pos
    }

    fn seek_set(&mut self, pos: usize) {
        self.cursor.pos = pos;
    }

    fn seek_end(&mut self) {
        self.cursor.pos = self.cursor.needed;
    }

    fn needed_size(&self) -> usize {
        self.cursor.needed
    }

    fn write(&mut self, bytes: &[u8]) {
        self.cursor.advance(bytes.len());
    }

    fn write_zero(&mut self, len: usize) {
        self.cursor.advance(len);
    }

    fn reserve(&mut self, len: usize) {
        self.cursor.needed = self.cursor.needed.max(self.cursor.pos + len);
    }

    fn contents(&self) -> &[u8] {
        &[]
    }
}

/// Sink writing into a caller-supplied buffer.
///
/// Writes that would land past the end of the buffer are dropped while the
/// watermark keeps growing; callers compare [`Sink::needed_size`] against
/// [`BufferSink::capacity`] once the traversal is done.
#[derive(Debug)]
pub struct BufferSink<'a> {
    buf: &'a mut [u8],
    cursor: Cursor,
    endian: Endian,
}

impl<'a> BufferSink<'a> {
    /// Creates a sink over `buf`. Existing contents are left in place.
    pub fn new(buf: &'a mut [u8], endian: Endian) -> Self {
        Self {
            buf,
            cursor: Cursor::default(),
            endian,
        }
    }

    /// Size of the destination buffer.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// True when every write so far fitted in the buffer.
    #[must_use]
    pub fn fits(&self) -> bool {
        self.cursor.needed <= self.buf.len()
    }
}

impl Sink for BufferSink<'_> {
    fn endian(&self) -> Endian {
        self.endian
    }

    fn tell(&self) -> usize {
        self.cursor.pos
    }

    fn seek_set(&mut self, pos: usize) {
        self.cursor.pos = pos;
    }

    fn seek_end(&mut self) {
        self.cursor.pos = self.cursor.needed;
    }

    fn needed_size(&self) -> usize {
        self.cursor.needed
    }

    fn write(&mut self, bytes: &[u8]) {
        let range = self.cursor.advance(bytes.len());
        if let Some(dst) = self.buf.get_mut(range) {
            dst.copy_from_slice(bytes);
        }
    }

    fn write_zero(&mut self, len: usize) {
        let range = self.cursor.advance(len);
        if let Some(dst) = self.buf.get_mut(range) {
            dst.fill(0);
        }
    }

    fn reserve(&mut self, len: usize) {
        self.cursor.needed = self.cursor.needed.max(self.cursor.pos + len);
    }

    fn contents(&self) -> &[u8] {
        self.buf
    }
}
