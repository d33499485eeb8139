//! Single-producer / single-consumer byte ring.
//!
//! Head (producer cursor) and tail (consumer cursor) are virtual positions:
//! monotonically increasing `u64` counters that are never reduced modulo the
//! capacity. The backing offset is computed at access time as
//! `position & (capacity - 1)`, so the capacity must be a power of two.
//!
//! All cursor mutation happens on the owning connection's loop; there is no
//! cross-thread access and therefore no atomics. The *remote* side of each
//! ring is driven by RDMA and acks, not by shared-memory cursors.

use std::cell::Cell;
use std::io;
use std::slice;

use crate::mem::MappedBuffer;

pub struct RingBuffer {
    buf: MappedBuffer,
    /// Producer cursor (virtual, monotonically increasing).
    head: Cell<u64>,
    /// Consumer cursor (virtual, monotonically increasing).
    tail: Cell<u64>,
}

impl RingBuffer {
    /// Allocate a ring of `capacity` bytes (power of two), page-aligned.
    pub fn new(capacity: usize) -> io::Result<Self> {
        assert!(
            capacity.is_power_of_two(),
            "ring capacity must be a power of two"
        );
        Ok(Self {
            buf: MappedBuffer::new(capacity)?,
            head: Cell::new(0),
            tail: Cell::new(0),
        })
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.buf.len() as u64
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.buf.as_ptr()
    }

    #[inline]
    pub fn head(&self) -> u64 {
        self.head.get()
    }

    #[inline]
    pub fn tail(&self) -> u64 {
        self.tail.get()
    }

    /// Bytes currently stored.
    #[inline]
    pub fn used(&self) -> u64 {
        self.head.get() - self.tail.get()
    }

    /// Bytes of free space.
    #[inline]
    pub fn free(&self) -> u64 {
        self.capacity() - self.used()
    }

    /// Advance the head directly, without a producer view.
    ///
    /// Valid only for the sole producer; used when the bytes were placed by
    /// the remote NIC rather than by local code.
    #[inline]
    pub fn advance_head(&self, n: u64) {
        debug_assert!(self.used() + n <= self.capacity());
        self.head.set(self.head.get() + n);
    }

    /// Advance the tail directly, without a consumer transaction.
    ///
    /// Valid only for the sole consumer; used when the bytes were consumed by
    /// the remote side (acked) rather than by local code.
    #[inline]
    pub fn advance_tail(&self, n: u64) {
        debug_assert!(n <= self.used());
        self.tail.set(self.tail.get() + n);
    }

    #[inline]
    fn offset(&self, pos: u64) -> usize {
        (pos & (self.capacity() - 1)) as usize
    }

    pub fn producer(&self) -> Producer<'_> {
        Producer { rb: self }
    }

    /// Open a consumer transaction. Dropping it without `commit` aborts:
    /// the tail is left untouched.
    pub fn consumer(&self) -> Consumer<'_> {
        Consumer {
            rb: self,
            cursor: self.tail.get(),
        }
    }
}

/// Producer view: reserve contiguous space (split at the wrap) and commit.
pub struct Producer<'a> {
    rb: &'a RingBuffer,
}

impl Producer<'_> {
    /// Bytes of free space available to write.
    #[inline]
    pub fn writable(&self) -> u64 {
        self.rb.free()
    }

    /// Map `n` bytes of free space starting at the head as one or two
    /// mutable slices (the second is empty unless the range wraps).
    pub fn map(&mut self, n: u64) -> (&mut [u8], &mut [u8]) {
        debug_assert!(n <= self.writable());
        let start = self.rb.offset(self.rb.head.get());
        let cap = self.rb.capacity() as usize;
        let n = n as usize;
        let first_len = n.min(cap - start);
        unsafe {
            let base = self.rb.as_ptr();
            (
                slice::from_raw_parts_mut(base.add(start), first_len),
                slice::from_raw_parts_mut(base, n - first_len),
            )
        }
    }

    /// Advance the head past `n` written bytes.
    #[inline]
    pub fn commit(&mut self, n: u64) {
        self.rb.advance_head(n);
    }
}

/// Consumer transaction: peek at stored bytes with relative addressing,
/// then either commit a consumed count or drop to abort.
pub struct Consumer<'a> {
    rb: &'a RingBuffer,
    /// tail + skipped bytes; relative addressing that never moves the tail.
    cursor: u64,
}

impl Consumer<'_> {
    /// Bytes readable from the current cursor.
    #[inline]
    pub fn readable(&self) -> u64 {
        self.rb.head.get() - self.cursor
    }

    /// Bytes readable from the cursor without crossing the wrap boundary.
    #[inline]
    pub fn contiguous(&self) -> u64 {
        let to_wrap = self.rb.capacity() - self.rb.offset(self.cursor) as u64;
        self.readable().min(to_wrap)
    }

    /// Skip `n` bytes without consuming them. The tail does not move; the
    /// skipped range stays owned by earlier, still-pending consumption
    /// (in-flight transmission on the outbox path).
    #[inline]
    pub fn skip(&mut self, n: u64) {
        debug_assert!(n <= self.readable());
        self.cursor += n;
    }

    /// Map `n` readable bytes starting at the cursor as one or two slices
    /// (the second is empty unless the range wraps).
    pub fn map(&self, n: u64) -> (&[u8], &[u8]) {
        debug_assert!(n <= self.readable());
        let start = self.rb.offset(self.cursor);
        let cap = self.rb.capacity() as usize;
        let n = n as usize;
        let first_len = n.min(cap - start);
        unsafe {
            let base = self.rb.as_ptr();
            (
                slice::from_raw_parts(base.add(start), first_len),
                slice::from_raw_parts(base, n - first_len),
            )
        }
    }

    /// Consume `n` bytes: advance the tail and end the transaction.
    ///
    /// `n` is counted from the tail, independent of any `skip`.
    pub fn commit(self, n: u64) {
        self.rb.advance_tail(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(cap: usize) -> RingBuffer {
        RingBuffer::new(cap).expect("mmap failed")
    }

    fn produce(rb: &RingBuffer, data: &[u8]) {
        let mut p = rb.producer();
        assert!(p.writable() >= data.len() as u64);
        let (a, b) = p.map(data.len() as u64);
        let split = a.len();
        a.copy_from_slice(&data[..split]);
        b.copy_from_slice(&data[split..]);
        p.commit(data.len() as u64);
    }

    fn consume(rb: &RingBuffer, n: u64) -> Vec<u8> {
        let c = rb.consumer();
        assert!(c.readable() >= n);
        let (a, b) = c.map(n);
        let mut out = a.to_vec();
        out.extend_from_slice(b);
        c.commit(n);
        out
    }

    #[test]
    fn fill_and_drain() {
        let rb = ring(64);
        assert_eq!(rb.free(), 64);

        produce(&rb, b"hello");
        assert_eq!(rb.used(), 5);
        assert_eq!(consume(&rb, 5), b"hello");
        assert_eq!(rb.used(), 0);
        assert_eq!(rb.head(), 5);
        assert_eq!(rb.tail(), 5);
    }

    #[test]
    fn wrap_splits_into_two_slices() {
        let rb = ring(16);

        produce(&rb, &[0u8; 12]);
        consume(&rb, 12);

        // 12 bytes in with 4 before the boundary: must split 4 + 8.
        let data: Vec<u8> = (0..12).collect();
        produce(&rb, &data);

        let c = rb.consumer();
        assert_eq!(c.contiguous(), 4);
        let (a, b) = c.map(12);
        assert_eq!(a, &data[..4]);
        assert_eq!(b, &data[4..]);
        c.commit(12);
        assert_eq!(rb.used(), 0);
    }

    #[test]
    fn skip_leaves_tail_in_place() {
        let rb = ring(32);
        produce(&rb, b"aaaabbbbcccc");

        let mut c = rb.consumer();
        c.skip(4);
        assert_eq!(c.readable(), 8);
        let (a, _) = c.map(4);
        assert_eq!(a, b"bbbb");
        drop(c); // abort

        assert_eq!(rb.tail(), 0);
        assert_eq!(rb.used(), 12);
    }

    #[test]
    fn abort_does_not_consume() {
        let rb = ring(32);
        produce(&rb, b"xyz");

        {
            let c = rb.consumer();
            let (a, _) = c.map(3);
            assert_eq!(a, b"xyz");
        }
        assert_eq!(rb.used(), 3);
        assert_eq!(consume(&rb, 3), b"xyz");
    }

    #[test]
    fn direct_advances() {
        let rb = ring(16);
        rb.advance_head(10);
        assert_eq!(rb.used(), 10);
        rb.advance_tail(4);
        assert_eq!(rb.used(), 6);
        assert_eq!(rb.free(), 10);
    }

    #[test]
    fn backpressure_at_capacity() {
        let rb = ring(16);
        produce(&rb, &[7u8; 16]);
        assert_eq!(rb.free(), 0);
        assert_eq!(rb.producer().writable(), 0);

        rb.advance_tail(4);
        assert_eq!(rb.producer().writable(), 4);
    }
}
