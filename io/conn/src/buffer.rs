//! Growable byte buffer with a consumed-prefix cursor.
//!
//! Unlike a fixed-capacity receive buffer, this buffer grows on append
//! and reclaims the consumed prefix lazily: `consume` only advances a
//! cursor, and the caller decides when moving the remaining bytes is
//! worth it (`compact`). That keeps the common append/consume cycle free
//! of copying while bounding waste.

/// An appendable byte buffer whose front is consumed through a cursor.
///
/// Unread data lives in `data[start..]`; `start <= data.len()` always
/// holds.
#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    /// Start of unconsumed data.
    start: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            start: 0,
        }
    }

    /// Number of unconsumed bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.data.len()
    }

    /// Bytes consumed but not yet reclaimed.
    #[inline]
    pub fn consumed(&self) -> usize {
        self.start
    }

    /// Total length including the consumed prefix.
    #[inline]
    pub fn total(&self) -> usize {
        self.data.len()
    }

    /// The unconsumed bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..]
    }

    /// Append bytes at the end.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Advance the cursor past `n` unconsumed bytes.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the unconsumed length.
    pub fn consume(&mut self, n: usize) {
        assert!(
            n <= self.len(),
            "consume({n}) exceeds unconsumed bytes ({})",
            self.len()
        );
        self.start += n;
    }

    /// Copy out the next `n` bytes and consume them.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the unconsumed length.
    pub fn take(&mut self, n: usize) -> Vec<u8> {
        assert!(
            n <= self.len(),
            "take({n}) exceeds unconsumed bytes ({})",
            self.len()
        );
        let out = self.data[self.start..self.start + n].to_vec();
        self.start += n;
        out
    }

    /// Find `byte` in the unconsumed data at or after relative offset
    /// `from`. Returns the offset relative to the unconsumed start.
    pub fn find(&self, byte: u8, from: usize) -> Option<usize> {
        let haystack = self.as_slice();
        if from >= haystack.len() {
            return None;
        }
        haystack[from..]
            .iter()
            .position(|&b| b == byte)
            .map(|pos| from + pos)
    }

    /// Discard the consumed prefix, moving the remaining bytes to the
    /// front of the allocation.
    pub fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        self.data.drain(..self.start);
        self.start = 0;
    }

    /// Drop everything, consumed and unconsumed alike.
    pub fn clear(&mut self) {
        self.data.clear();
        self.start = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_consume_take() {
        let mut buf = Buffer::new();
        assert!(buf.is_empty());

        buf.append(b"hello world");
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.as_slice(), b"hello world");

        buf.consume(6);
        assert_eq!(buf.as_slice(), b"world");
        assert_eq!(buf.consumed(), 6);

        assert_eq!(buf.take(5), b"world");
        assert!(buf.is_empty());
        assert_eq!(buf.total(), 11);
    }

    #[test]
    fn compact_reclaims_prefix() {
        let mut buf = Buffer::new();
        buf.append(b"abcdef");
        buf.consume(4);
        buf.compact();
        assert_eq!(buf.consumed(), 0);
        assert_eq!(buf.total(), 2);
        assert_eq!(buf.as_slice(), b"ef");
    }

    #[test]
    fn find_is_relative_to_cursor() {
        let mut buf = Buffer::new();
        buf.append(b"xx\nyy\n");
        buf.consume(2);
        assert_eq!(buf.find(b'\n', 0), Some(0));
        assert_eq!(buf.find(b'\n', 1), Some(3));
        assert_eq!(buf.find(b'\n', 4), None);
        assert_eq!(buf.find(b'z', 0), None);
    }

    #[test]
    fn find_past_end_is_none() {
        let buf = Buffer::new();
        assert_eq!(buf.find(b'a', 0), None);
        let mut buf = Buffer::new();
        buf.append(b"a");
        assert_eq!(buf.find(b'a', 5), None);
    }

    #[test]
    #[should_panic(expected = "exceeds unconsumed bytes")]
    fn overconsume_panics() {
        let mut buf = Buffer::new();
        buf.append(b"ab");
        buf.consume(3);
    }

    #[test]
    fn take_zero_is_empty() {
        let mut buf = Buffer::new();
        buf.append(b"ab");
        assert_eq!(buf.take(0), Vec::<u8>::new());
        assert_eq!(buf.len(), 2);
    }
}
