//! Fixed-capacity circular byte buffer.
//!
//! Each session owns two of these: one for bytes arriving from the
//! socket and one for response bytes waiting to drain. Peek and consume
//! are separate operations so the parser can inspect buffered bytes
//! without committing to them, and all copies are wrap-aware.
//!
//! One slot is reserved as a sentinel, so a buffer of capacity `C`
//! holds at most `C - 1` readable bytes and
//! `readable + writable == C - 1` at all times.

/// Circular byte buffer with separate peek/consume.
pub struct RingBuffer {
    buf: Vec<u8>,
    /// Next write position.
    head: usize,
    /// Next read position.
    tail: usize,
}

impl RingBuffer {
    /// Create a buffer that can hold `capacity - 1` bytes.
    ///
    /// # Panics
    /// Panics if `capacity < 2`.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity >= 2, "ring buffer capacity must be at least 2");
        Self {
            buf: vec![0u8; capacity],
            head: 0,
            tail: 0,
        }
    }

    /// Total slot count, including the sentinel slot.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes available to read.
    pub fn readable(&self) -> usize {
        let cap = self.buf.len();
        (self.head + cap - self.tail) % cap
    }

    /// Bytes that can still be written.
    pub fn writable(&self) -> usize {
        self.buf.len() - 1 - self.readable()
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        self.writable() == 0
    }

    /// Append bytes, clamped to the writable space.
    ///
    /// Returns the number of bytes actually written. Never allocates.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.writable());
        let cap = self.buf.len();
        let first = n.min(cap - self.head);
        self.buf[self.head..self.head + first].copy_from_slice(&src[..first]);
        let rest = n - first;
        if rest > 0 {
            self.buf[..rest].copy_from_slice(&src[first..n]);
        }
        self.head = (self.head + n) % cap;
        n
    }

    /// Copy up to `dst.len()` readable bytes into `dst` without
    /// advancing the read position.
    ///
    /// Returns the number of bytes copied.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.readable());
        let cap = self.buf.len();
        let first = n.min(cap - self.tail);
        dst[..first].copy_from_slice(&self.buf[self.tail..self.tail + first]);
        let rest = n - first;
        if rest > 0 {
            dst[first..n].copy_from_slice(&self.buf[..rest]);
        }
        n
    }

    /// Advance the read position by up to `n` bytes.
    ///
    /// Returns the number of bytes consumed.
    pub fn consume(&mut self, n: usize) -> usize {
        let n = n.min(self.readable());
        self.tail = (self.tail + n) % self.buf.len();
        n
    }

    /// Peek and consume in one step.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = self.peek(dst);
        self.consume(n);
        n
    }

    /// Byte offset (from the read position) of the first occurrence of
    /// `pattern` in the readable bytes, or `None`.
    pub fn find(&self, pattern: &[u8]) -> Option<usize> {
        let readable = self.readable();
        if pattern.is_empty() || pattern.len() > readable {
            return None;
        }
        let cap = self.buf.len();
        'outer: for i in 0..=readable - pattern.len() {
            for (j, &p) in pattern.iter().enumerate() {
                if self.buf[(self.tail + i + j) % cap] != p {
                    continue 'outer;
                }
            }
            return Some(i);
        }
        None
    }

    /// Move up to `n` bytes into `other`, clamped to what is readable
    /// here and writable there.
    ///
    /// Returns the number of bytes transferred.
    pub fn transfer_to(&mut self, other: &mut RingBuffer, n: usize) -> usize {
        let mut remaining = n.min(self.readable()).min(other.writable());
        let total = remaining;
        let mut chunk = [0u8; 512];
        while remaining > 0 {
            let take = remaining.min(chunk.len());
            let got = self.peek(&mut chunk[..take]);
            self.consume(got);
            other.write(&chunk[..got]);
            remaining -= got;
        }
        total
    }

    /// The readable bytes as up to two contiguous slices, in order.
    ///
    /// The second slice is empty unless the readable region wraps.
    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        let readable = self.readable();
        let cap = self.buf.len();
        let first = readable.min(cap - self.tail);
        (
            &self.buf[self.tail..self.tail + first],
            &self.buf[..readable - first],
        )
    }

    /// Grow the buffer to `new_capacity` slots, preserving buffered
    /// bytes. Shrinking is not supported; smaller values are ignored.
    pub fn reserve(&mut self, new_capacity: usize) {
        if new_capacity <= self.buf.len() {
            return;
        }
        let readable = self.readable();
        let mut grown = vec![0u8; new_capacity];
        self.peek(&mut grown[..readable]);
        self.buf = grown;
        self.tail = 0;
        self.head = readable;
    }

    /// Discard all buffered bytes.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invariant(ring: &RingBuffer) {
        assert_eq!(ring.readable() + ring.writable() + 1, ring.capacity());
    }

    #[test]
    fn test_write_read_round_trip() {
        let mut ring = RingBuffer::with_capacity(16);
        invariant(&ring);

        assert_eq!(ring.write(b"hello"), 5);
        assert_eq!(ring.readable(), 5);
        invariant(&ring);

        let mut out = [0u8; 5];
        assert_eq!(ring.read(&mut out), 5);
        assert_eq!(&out, b"hello");
        assert!(ring.is_empty());
        invariant(&ring);
    }

    #[test]
    fn test_peek_is_non_destructive() {
        let mut ring = RingBuffer::with_capacity(16);
        ring.write(b"abc");

        let mut a = [0u8; 3];
        let mut b = [0u8; 3];
        assert_eq!(ring.peek(&mut a), 3);
        assert_eq!(ring.peek(&mut b), 3);
        assert_eq!(a, b);
        assert_eq!(ring.readable(), 3);
    }

    #[test]
    fn test_write_clamps_to_writable() {
        let mut ring = RingBuffer::with_capacity(8);
        // 7 usable slots
        assert_eq!(ring.write(b"0123456789"), 7);
        assert!(ring.is_full());
        assert_eq!(ring.write(b"x"), 0);
        invariant(&ring);
    }

    #[test]
    fn test_wrap_around() {
        let mut ring = RingBuffer::with_capacity(8);
        let mut out = [0u8; 8];

        // Interleave writes and consumes so the region wraps repeatedly.
        for round in 0..20u8 {
            let data = [round, round.wrapping_add(1), round.wrapping_add(2)];
            assert_eq!(ring.write(&data), 3);
            invariant(&ring);
            let n = ring.read(&mut out[..3]);
            assert_eq!(n, 3);
            assert_eq!(&out[..3], &data);
            invariant(&ring);
        }
    }

    #[test]
    fn test_find_across_wrap() {
        let mut ring = RingBuffer::with_capacity(8);
        // Push the tail forward so the next write wraps.
        ring.write(b"xxxxx");
        ring.consume(5);
        ring.write(b"ab\r\nc");

        assert_eq!(ring.find(b"\r\n"), Some(2));
        assert_eq!(ring.find(b"c"), Some(4));
        assert_eq!(ring.find(b"zz"), None);
    }

    #[test]
    fn test_find_empty_and_oversized_patterns() {
        let mut ring = RingBuffer::with_capacity(8);
        ring.write(b"ab");
        assert_eq!(ring.find(b""), None);
        assert_eq!(ring.find(b"abc"), None);
    }

    #[test]
    fn test_transfer_to() {
        let mut src = RingBuffer::with_capacity(16);
        let mut dst = RingBuffer::with_capacity(8);
        src.write(b"0123456789");

        // Clamped by dst's writable space (7).
        assert_eq!(src.transfer_to(&mut dst, 100), 7);
        assert_eq!(src.readable(), 3);

        let mut out = [0u8; 7];
        dst.read(&mut out);
        assert_eq!(&out, b"0123456");
    }

    #[test]
    fn test_reserve_preserves_contents() {
        let mut ring = RingBuffer::with_capacity(8);
        ring.write(b"xxx");
        ring.consume(3);
        ring.write(b"abcde"); // wraps

        ring.reserve(32);
        assert_eq!(ring.capacity(), 32);
        assert_eq!(ring.readable(), 5);

        let mut out = [0u8; 5];
        ring.read(&mut out);
        assert_eq!(&out, b"abcde");
    }

    #[test]
    fn test_as_slices_spans_wrap() {
        let mut ring = RingBuffer::with_capacity(8);
        ring.write(b"xxxxxx");
        ring.consume(6);
        ring.write(b"abcd"); // two bytes at the end, two at the start

        let (first, second) = ring.as_slices();
        let mut joined = first.to_vec();
        joined.extend_from_slice(second);
        assert_eq!(&joined, b"abcd");
        assert!(!second.is_empty());
    }
}
