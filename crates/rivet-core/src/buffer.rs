//! Growable byte buffer used by connections and codecs.
//!
//! Layout is three regions over one backing vector:
//!
//! ```text
//! | prependable |   readable   |   writable   |
//! 0          read_index    write_index    capacity
//! ```
//!
//! A head margin of [`CHEAP_PREPEND`] bytes is kept in front of the readable
//! region so a small prefix (a 4-byte length field) can be prepended without
//! reallocating or shifting data.

use std::cell::RefCell;
use std::io::{self, IoSliceMut, Read};

use byteorder::{BigEndian, ByteOrder};

/// Head margin reserved for prepending a length prefix.
pub const CHEAP_PREPEND: usize = 8;
/// Initial writable capacity of a fresh buffer.
pub const INITIAL_SIZE: usize = 1024;

/// Size of the per-thread auxiliary region used by [`Buffer::read_from`].
const EXTRA_READ_BUF: usize = 1024 * 1024;

thread_local! {
    // Scratch space for the scatter-read second iovec. One per thread: a
    // buffer is never shared across threads, and read_from only runs on the
    // thread owning the connection.
    static EXTRA_BUF: RefCell<Vec<u8>> = RefCell::new(vec![0u8; EXTRA_READ_BUF]);
}

/// Growable byte ring with prepend margin and network-order integer helpers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    /// Creates a buffer with the default initial capacity.
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    /// Creates a buffer with `capacity` writable bytes past the head margin.
    pub fn with_capacity(capacity: usize) -> Self {
        Buffer {
            data: vec![0u8; CHEAP_PREPEND + capacity],
            read_index: CHEAP_PREPEND,
            write_index: CHEAP_PREPEND,
        }
    }

    /// Number of bytes available to read.
    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    /// Number of bytes that can be appended without growing.
    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.write_index
    }

    /// Number of bytes in front of the readable region.
    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    /// Readable region without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_index..self.write_index]
    }

    /// Consumes `n` readable bytes.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable_bytes());
        if n < self.readable_bytes() {
            self.read_index += n;
        } else {
            self.retrieve_all();
        }
    }

    /// Consumes everything and restores the head margin.
    pub fn retrieve_all(&mut self) {
        self.read_index = CHEAP_PREPEND;
        self.write_index = CHEAP_PREPEND;
    }

    /// Consumes `n` bytes and returns them as an owned vector.
    pub fn read_bytes(&mut self, n: usize) -> Vec<u8> {
        assert!(n <= self.readable_bytes());
        let bytes = self.peek()[..n].to_vec();
        self.retrieve(n);
        bytes
    }

    /// Consumes `n` bytes and returns them as a string (lossy on invalid UTF-8).
    pub fn read_as_string(&mut self, n: usize) -> String {
        let bytes = self.read_bytes(n);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Appends a byte slice, growing the backing storage if needed.
    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure_writable(bytes.len());
        let start = self.write_index;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.write_index += bytes.len();
    }

    /// Guarantees at least `n` writable bytes.
    ///
    /// Compaction is tried first: if the prependable slack plus the writable
    /// tail can hold `n` bytes, the readable region is copied back to the
    /// head margin. Only when that is insufficient does the backing vector
    /// grow.
    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() >= n {
            return;
        }
        if self.writable_bytes() + self.prependable_bytes() < n + CHEAP_PREPEND {
            self.data.resize(self.write_index + n, 0);
        } else {
            let readable = self.readable_bytes();
            self.data.copy_within(self.read_index..self.write_index, CHEAP_PREPEND);
            self.read_index = CHEAP_PREPEND;
            self.write_index = CHEAP_PREPEND + readable;
        }
        debug_assert!(self.writable_bytes() >= n);
    }

    /// Writes bytes in front of the readable region, into the head margin.
    pub fn prepend(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.prependable_bytes());
        self.read_index -= bytes.len();
        let start = self.read_index;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Peeks one byte.
    pub fn peek_i8(&self) -> i8 {
        assert!(self.readable_bytes() >= 1);
        self.peek()[0] as i8
    }

    /// Peeks a big-endian i16.
    pub fn peek_i16(&self) -> i16 {
        assert!(self.readable_bytes() >= 2);
        BigEndian::read_i16(self.peek())
    }

    /// Peeks a big-endian i32.
    pub fn peek_i32(&self) -> i32 {
        assert!(self.readable_bytes() >= 4);
        BigEndian::read_i32(self.peek())
    }

    /// Peeks a big-endian i64.
    pub fn peek_i64(&self) -> i64 {
        assert!(self.readable_bytes() >= 8);
        BigEndian::read_i64(self.peek())
    }

    /// Reads one byte.
    pub fn read_i8(&mut self) -> i8 {
        let v = self.peek_i8();
        self.retrieve(1);
        v
    }

    /// Reads a big-endian i16.
    pub fn read_i16(&mut self) -> i16 {
        let v = self.peek_i16();
        self.retrieve(2);
        v
    }

    /// Reads a big-endian i32.
    pub fn read_i32(&mut self) -> i32 {
        let v = self.peek_i32();
        self.retrieve(4);
        v
    }

    /// Reads a big-endian i64.
    pub fn read_i64(&mut self) -> i64 {
        let v = self.peek_i64();
        self.retrieve(8);
        v
    }

    /// Appends one byte.
    pub fn append_i8(&mut self, v: i8) {
        self.append(&[v as u8]);
    }

    /// Appends a big-endian i16.
    pub fn append_i16(&mut self, v: i16) {
        let mut tmp = [0u8; 2];
        BigEndian::write_i16(&mut tmp, v);
        self.append(&tmp);
    }

    /// Appends a big-endian i32.
    pub fn append_i32(&mut self, v: i32) {
        let mut tmp = [0u8; 4];
        BigEndian::write_i32(&mut tmp, v);
        self.append(&tmp);
    }

    /// Appends a big-endian i64.
    pub fn append_i64(&mut self, v: i64) {
        let mut tmp = [0u8; 8];
        BigEndian::write_i64(&mut tmp, v);
        self.append(&tmp);
    }

    /// Prepends one byte into the head margin.
    pub fn prepend_i8(&mut self, v: i8) {
        self.prepend(&[v as u8]);
    }

    /// Prepends a big-endian i16 into the head margin.
    pub fn prepend_i16(&mut self, v: i16) {
        let mut tmp = [0u8; 2];
        BigEndian::write_i16(&mut tmp, v);
        self.prepend(&tmp);
    }

    /// Prepends a big-endian i32 into the head margin.
    pub fn prepend_i32(&mut self, v: i32) {
        let mut tmp = [0u8; 4];
        BigEndian::write_i32(&mut tmp, v);
        self.prepend(&tmp);
    }

    /// Prepends a big-endian i64 into the head margin.
    pub fn prepend_i64(&mut self, v: i64) {
        let mut tmp = [0u8; 8];
        BigEndian::write_i64(&mut tmp, v);
        self.prepend(&tmp);
    }

    /// Fills the buffer from `reader` with one scatter read.
    ///
    /// The writable region is the first destination and the per-thread
    /// auxiliary region the second, so a single syscall can absorb a burst
    /// larger than the current writable tail. Any overflow that landed in
    /// the auxiliary region is appended afterwards, growing the buffer once.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        EXTRA_BUF.with(|extra| {
            let mut extra = extra.borrow_mut();
            let writable = self.writable_bytes();
            let n = {
                let wi = self.write_index;
                let mut iovs =
                    [IoSliceMut::new(&mut self.data[wi..]), IoSliceMut::new(&mut extra)];
                reader.read_vectored(&mut iovs)?
            };
            if n <= writable {
                self.write_index += n;
            } else {
                self.write_index = self.data.len();
                self.append(&extra[..n - writable]);
            }
            Ok(n)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_retrieve_roundtrip() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);

        buf.append(b"hello world");
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.peek(), b"hello world");

        assert_eq!(buf.read_as_string(5), "hello");
        assert_eq!(buf.peek(), b" world");

        buf.retrieve_all();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn test_grow_preserves_content_and_margin() {
        let mut buf = Buffer::with_capacity(16);
        let payload: Vec<u8> = (0..200u8).collect();
        buf.append(&payload);
        assert_eq!(buf.peek(), &payload[..]);
        // Growth never eats the head margin.
        assert!(buf.prependable_bytes() >= CHEAP_PREPEND || buf.read_index == CHEAP_PREPEND);
    }

    #[test]
    fn test_compaction_before_growth() {
        let mut buf = Buffer::with_capacity(32);
        buf.append(&[1u8; 24]);
        buf.retrieve(22);
        // 2 readable, 8 writable, 30 prependable: room for 30 via compaction.
        let len_before = buf.writable_bytes() + buf.prependable_bytes() + buf.readable_bytes();
        buf.append(&[2u8; 30]);
        let len_after = buf.writable_bytes() + buf.prependable_bytes() + buf.readable_bytes();
        assert_eq!(len_before, len_after, "compaction must not reallocate");
        assert_eq!(buf.readable_bytes(), 32);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn test_prepend_uses_head_margin() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend_i32(7);
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.read_i32(), 7);
        assert_eq!(buf.peek(), b"payload");
    }

    #[test]
    fn test_integer_endianness() {
        let mut buf = Buffer::new();
        buf.append_i32(0x0102_0304);
        assert_eq!(buf.peek(), &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(buf.read_i32(), 0x0102_0304);

        buf.append_i64(-1);
        assert_eq!(buf.peek(), &[0xff; 8]);
        assert_eq!(buf.read_i64(), -1);

        buf.append_i16(0x1234);
        assert_eq!(buf.peek(), &[0x12, 0x34]);
        assert_eq!(buf.peek_i16(), 0x1234);
        assert_eq!(buf.read_i16(), 0x1234);

        buf.append_i8(-2);
        assert_eq!(buf.read_i8(), -2);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut buf = Buffer::new();
        buf.append_i32(42);
        assert_eq!(buf.peek_i32(), 42);
        assert_eq!(buf.peek_i32(), 42);
        assert_eq!(buf.readable_bytes(), 4);
        assert_eq!(buf.read_i32(), 42);
        assert_eq!(buf.readable_bytes(), 0);
    }

    /// Reader that services vectored reads across both destinations, to
    /// exercise the auxiliary-overflow path deterministically.
    struct ChunkReader {
        data: Vec<u8>,
        pos: usize,
    }

    impl Read for ChunkReader {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            let n = out.len().min(self.data.len() - self.pos);
            out[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }

        fn read_vectored(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
            let mut total = 0;
            for buf in bufs {
                total += self.read(buf)?;
            }
            Ok(total)
        }
    }

    #[test]
    fn test_read_from_fits_writable() {
        let mut buf = Buffer::new();
        let mut reader = ChunkReader { data: b"abcdef".to_vec(), pos: 0 };
        let n = buf.read_from(&mut reader).unwrap();
        assert_eq!(n, 6);
        assert_eq!(buf.peek(), b"abcdef");
    }

    #[test]
    fn test_read_from_overflows_into_auxiliary() {
        let mut buf = Buffer::with_capacity(8);
        let payload: Vec<u8> = (0..64).map(|i| i as u8).collect();
        let mut reader = ChunkReader { data: payload.clone(), pos: 0 };
        let n = buf.read_from(&mut reader).unwrap();
        assert_eq!(n, 64);
        assert_eq!(buf.readable_bytes(), 64);
        assert_eq!(buf.peek(), &payload[..]);
    }

    #[test]
    fn test_interleaved_operations_preserve_order() {
        let mut buf = Buffer::new();
        let mut emitted = Vec::new();
        buf.append(b"one");
        buf.append(b"two");
        emitted.extend(buf.read_bytes(4));
        buf.append(b"three");
        emitted.extend(buf.read_bytes(buf.readable_bytes()));
        assert_eq!(emitted, b"onetwothree");
    }
}
