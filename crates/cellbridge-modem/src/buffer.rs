//! Bounded accumulator for modem output.

use bytes::{Buf, BytesMut};
use cellbridge_uart::SerialPort;

/// Response buffer size, including one byte reserved for a terminator.
pub const RESPONSE_BUFFER_SIZE: usize = 512;

/// Maximum length of a diagnostic snapshot.
pub const SNAPSHOT_LEN: usize = 127;

/// Find `needle` in `haystack`, starting the search at `from`.
pub fn find_from(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    if needle.is_empty() {
        return Some(from);
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

/// Find `needle` in `haystack`.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    find_from(haystack, 0, needle)
}

/// Modem output collected since the last clear.
///
/// Holds at most `RESPONSE_BUFFER_SIZE - 1` bytes; reads beyond that are left
/// in the UART until space is made.
#[derive(Debug)]
pub struct ResponseBuffer {
    data: BytesMut,
}

impl ResponseBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        ResponseBuffer {
            data: BytesMut::with_capacity(RESPONSE_BUFFER_SIZE),
        }
    }

    /// Drop everything collected so far.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Bytes that still fit.
    pub fn space(&self) -> usize {
        RESPONSE_BUFFER_SIZE - 1 - self.data.len()
    }

    /// Whether no more bytes fit.
    pub fn is_full(&self) -> bool {
        self.space() == 0
    }

    /// Number of bytes held.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw contents.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Append as much of `bytes` as fits. Returns the number appended.
    pub fn extend(&mut self, bytes: &[u8]) -> usize {
        let count = bytes.len().min(self.space());
        self.data.extend_from_slice(&bytes[..count]);
        count
    }

    /// Move whatever the port has (bounded by free space) into the buffer.
    pub fn fill_from<P: SerialPort>(&mut self, port: &mut P) -> usize {
        let count = port.available().min(self.space());
        if count == 0 {
            return 0;
        }
        let start = self.data.len();
        self.data.resize(start + count, 0);
        let read = port.read(&mut self.data[start..]);
        self.data.truncate(start + read);
        read
    }

    /// Position of `needle`, if present.
    pub fn find(&self, needle: &str) -> Option<usize> {
        find(&self.data, needle.as_bytes())
    }

    /// Whether `needle` is present.
    pub fn contains(&self, needle: &str) -> bool {
        self.find(needle).is_some()
    }

    /// Drop the first `count` bytes.
    pub fn consume(&mut self, count: usize) {
        self.data.advance(count.min(self.data.len()));
    }

    /// Drop the bytes in `start..end`, keeping what surrounds them.
    pub fn remove(&mut self, start: usize, end: usize) {
        let end = end.min(self.data.len());
        if start >= end {
            return;
        }
        let tail = self.data.split_off(end);
        self.data.truncate(start);
        self.data.unsplit(tail);
    }

    /// Contents as text, lossy.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// Printable excerpt for diagnostics, at most [`SNAPSHOT_LEN`] bytes.
    pub fn snapshot(&self) -> String {
        let mut text = self.text();
        if text.len() > SNAPSHOT_LEN {
            let mut cut = SNAPSHOT_LEN;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }
        text
    }
}

impl Default for ResponseBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_from() {
        assert_eq!(find(b"\r\nOK\r\n", b"OK"), Some(2));
        assert_eq!(find_from(b"OK OK", 1, b"OK"), Some(3));
        assert_eq!(find(b"short", b"longer needle"), None);
        assert_eq!(find_from(b"abc", 4, b"a"), None);
        assert_eq!(find(b"abc", b""), Some(0));
    }

    #[test]
    fn test_extend_is_bounded() {
        let mut buf = ResponseBuffer::new();
        let big = vec![b'x'; RESPONSE_BUFFER_SIZE * 2];
        assert_eq!(buf.extend(&big), RESPONSE_BUFFER_SIZE - 1);
        assert!(buf.is_full());
        assert_eq!(buf.extend(b"more"), 0);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.space(), RESPONSE_BUFFER_SIZE - 1);
    }

    #[test]
    fn test_consume_and_search() {
        let mut buf = ResponseBuffer::new();
        buf.extend(b"+CSQ: 20,99\r\nOK\r\n");
        assert!(buf.contains("OK"));
        assert_eq!(buf.find("+CSQ:"), Some(0));
        buf.consume(13);
        assert_eq!(buf.as_bytes(), b"OK\r\n");
        buf.consume(100);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_remove_range() {
        let mut buf = ResponseBuffer::new();
        buf.extend(b"\r\n>+URC\r\nOK");
        buf.remove(3, 9);
        assert_eq!(buf.as_bytes(), b"\r\n>OK");
        buf.remove(4, 100);
        assert_eq!(buf.as_bytes(), b"\r\n>O");
        buf.remove(2, 2);
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_snapshot_truncates() {
        let mut buf = ResponseBuffer::new();
        buf.extend(&[b'E'; 300]);
        assert_eq!(buf.snapshot().len(), SNAPSHOT_LEN);
        buf.clear();
        buf.extend(b"\r\nERROR\r\n");
        assert_eq!(buf.snapshot(), "\r\nERROR\r\n");
    }
}
