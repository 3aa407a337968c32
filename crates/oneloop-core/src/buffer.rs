//! Byte buffers for the socket read and write paths.
//!
//! `FifoBuffer` is a flat head/tail window over a `Vec<u8>`. Reads append
//! at the tail, frame decoding consumes from the head, and the window is
//! compacted to the front when tail room runs out. `WriteChunk` is one
//! queued `write()` remainder with the original call length kept for the
//! completion callback.

/// Growable FIFO byte window.
#[derive(Debug, Default)]
pub struct FifoBuffer {
    data: Vec<u8>,
    head: usize,
    tail: usize,
}

impl FifoBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            data: vec![0; cap],
            head: 0,
            tail: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The buffered bytes, oldest first.
    #[inline]
    pub fn slice(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    /// Drop `n` bytes from the head. Resets the window when it empties.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.head += n;
        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }
    }

    /// Move the window to the front of the allocation.
    pub fn compact(&mut self) {
        if self.head == 0 {
            return;
        }
        self.data.copy_within(self.head..self.tail, 0);
        self.tail -= self.head;
        self.head = 0;
    }

    /// Ensure at least `need` writable bytes after the tail, compacting
    /// first and doubling the allocation if that is not enough.
    pub fn reserve_tail(&mut self, need: usize) {
        if self.data.len() - self.tail >= need {
            return;
        }
        self.compact();
        if self.data.len() - self.tail >= need {
            return;
        }
        let mut cap = if self.data.is_empty() { 64 } else { self.data.len() };
        while cap - self.tail < need {
            cap *= 2;
        }
        self.data.resize(cap, 0);
    }

    /// Writable tail room. Call `reserve_tail` first.
    #[inline]
    pub fn spare(&mut self) -> &mut [u8] {
        &mut self.data[self.tail..]
    }

    /// Commit `n` bytes appended into `spare()`.
    pub fn advance_tail(&mut self, n: usize) {
        debug_assert!(self.tail + n <= self.data.len());
        self.tail += n;
    }

    /// Append a byte slice, growing as needed.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.reserve_tail(bytes.len());
        self.data[self.tail..self.tail + bytes.len()].copy_from_slice(bytes);
        self.tail += bytes.len();
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Take the buffered bytes out as an owned Vec, emptying the window.
    pub fn take_bytes(&mut self) -> Vec<u8> {
        let out = self.slice().to_vec();
        self.clear();
        out
    }
}

/// One queued write remainder.
#[derive(Debug)]
pub struct WriteChunk {
    data: Vec<u8>,
    off: usize,
    /// Length of the original `write()` call, including bytes that were
    /// sent immediately before the remainder was queued.
    total: usize,
}

impl WriteChunk {
    pub fn new(remainder: Vec<u8>, total: usize) -> Self {
        Self {
            data: remainder,
            off: 0,
            total,
        }
    }

    #[inline]
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.off..]
    }

    #[inline]
    pub fn remaining_len(&self) -> usize {
        self.data.len() - self.off
    }

    #[inline]
    pub fn total_len(&self) -> usize {
        self.total
    }

    /// Account `n` bytes as sent. Returns true when the chunk is drained.
    pub fn advance(&mut self, n: usize) -> bool {
        debug_assert!(self.off + n <= self.data.len());
        self.off += n;
        self.off == self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_and_consume() {
        let mut buf = FifoBuffer::new();
        buf.extend(b"hello");
        buf.extend(b" world");
        assert_eq!(buf.slice(), b"hello world");
        buf.consume(6);
        assert_eq!(buf.slice(), b"world");
        buf.consume(5);
        assert!(buf.is_empty());
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_window_resets_when_empty() {
        let mut buf = FifoBuffer::with_capacity(8);
        buf.extend(b"abcd");
        buf.consume(4);
        buf.extend(b"efgh");
        assert_eq!(buf.slice(), b"efgh");
        assert_eq!(buf.capacity(), 8);
    }

    #[test]
    fn test_compact_makes_tail_room() {
        let mut buf = FifoBuffer::with_capacity(8);
        buf.extend(b"abcdef");
        buf.consume(4);
        buf.reserve_tail(6);
        assert_eq!(buf.slice(), b"ef");
        buf.extend(b"ghijkl");
        assert_eq!(buf.slice(), b"efghijkl");
    }

    #[test]
    fn test_growth_doubles() {
        let mut buf = FifoBuffer::with_capacity(4);
        buf.extend(b"0123456789");
        assert!(buf.capacity() >= 10);
        assert_eq!(buf.slice(), b"0123456789");
    }

    #[test]
    fn test_spare_and_advance_tail() {
        let mut buf = FifoBuffer::new();
        buf.reserve_tail(4);
        buf.spare()[..4].copy_from_slice(b"data");
        buf.advance_tail(4);
        assert_eq!(buf.slice(), b"data");
    }

    #[test]
    fn test_write_chunk_accounting() {
        let mut chunk = WriteChunk::new(b"remainder".to_vec(), 100);
        assert_eq!(chunk.total_len(), 100);
        assert!(!chunk.advance(4));
        assert_eq!(chunk.remaining(), b"inder");
        assert!(chunk.advance(5));
        assert_eq!(chunk.remaining_len(), 0);
    }
}
