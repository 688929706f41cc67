//! Frame synchronisation over a continuous byte stream.
//!
//! Telemetry arrives as an unframed byte stream that may start mid-frame,
//! carry line noise, or stall halfway through a frame. [`FrameAssembler`]
//! accumulates bytes and cuts complete frames out of them:
//!
//! 1. A leading byte that is not [`MAGIC`] is dropped.
//! 2. With fewer than three bytes the length is unknown; wait.
//! 3. A frame longer than [`MAX_FRAME_LEN`] means the magic was a false
//!    positive; drop it and resynchronise on the next byte.
//! 4. A partial frame waits for more bytes, unless the stream has been quiet
//!    for longer than the frame timeout, in which case everything held is
//!    discarded.

use bytes::{Buf, Bytes, BytesMut};
use cellbridge_uart::SerialPort;
use log::{debug, trace};

use crate::frame::{announced_len, LENGTH_PREFIX_LEN, MAGIC, MAX_FRAME_LEN};

/// Accumulation buffer size.
pub const ASSEMBLY_BUFFER_SIZE: usize = 512;

/// Quiet time after which a partial frame is abandoned.
pub const FRAME_TIMEOUT_MS: u64 = 50;

/// Counters kept by a [`FrameAssembler`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    /// Complete frames extracted.
    pub frames: u64,
    /// Bytes dropped while searching for a frame start.
    pub resync_bytes: u64,
    /// Partial frames abandoned after the timeout.
    pub timeouts: u64,
    /// Bytes discarded by those timeouts.
    pub timeout_bytes: u64,
}

/// Accumulates stream bytes and extracts complete MAVLink v2 frames.
#[derive(Debug)]
pub struct FrameAssembler {
    buf: BytesMut,
    capacity: usize,
    max_frame_len: usize,
    timeout_ms: u64,
    last_activity_ms: u64,
    stats: AssemblerStats,
}

impl FrameAssembler {
    /// Create an assembler with the default limits.
    pub fn new() -> Self {
        Self::with_limits(ASSEMBLY_BUFFER_SIZE, MAX_FRAME_LEN, FRAME_TIMEOUT_MS)
    }

    /// Create an assembler holding at most `capacity` bytes and rejecting
    /// frames longer than `max_frame_len`.
    pub fn with_limits(capacity: usize, max_frame_len: usize, timeout_ms: u64) -> Self {
        FrameAssembler {
            buf: BytesMut::with_capacity(capacity),
            capacity,
            max_frame_len: max_frame_len.min(capacity),
            timeout_ms,
            last_activity_ms: 0,
            stats: AssemblerStats::default(),
        }
    }

    /// Bytes that can still be accepted.
    pub fn space(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Bytes held.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is held.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Held bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Counters so far.
    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    /// Append as much of `bytes` as fits. Returns the number taken.
    pub fn push(&mut self, bytes: &[u8], now_ms: u64) -> usize {
        let take = bytes.len().min(self.space());
        if take > 0 {
            self.buf.extend_from_slice(&bytes[..take]);
            self.last_activity_ms = now_ms;
        }
        take
    }

    /// Drain what `port` has received, bounded by free space.
    pub fn fill_from<P: SerialPort>(&mut self, port: &mut P, now_ms: u64) -> usize {
        let want = port.available().min(self.space());
        if want == 0 {
            return 0;
        }
        let start = self.buf.len();
        self.buf.resize(start + want, 0);
        let read = port.read(&mut self.buf[start..]);
        self.buf.truncate(start + read);
        if read > 0 {
            self.last_activity_ms = now_ms;
        }
        read
    }

    /// Discard a partial frame if the stream has been quiet too long.
    ///
    /// Returns the number of bytes discarded.
    pub fn expire(&mut self, now_ms: u64) -> usize {
        if self.buf.is_empty() || now_ms.saturating_sub(self.last_activity_ms) <= self.timeout_ms {
            return 0;
        }
        let dropped = self.buf.len();
        debug!(
            "Discarding {} stale bytes after {} ms without data",
            dropped,
            now_ms.saturating_sub(self.last_activity_ms)
        );
        self.buf.clear();
        self.stats.timeouts += 1;
        self.stats.timeout_bytes += dropped as u64;
        dropped
    }

    /// Cut the next complete frame out of the buffer.
    ///
    /// Returns `None` when the buffer is empty or holds only the start of a
    /// frame. Garbage ahead of a frame is dropped along the way.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            let first = *self.buf.first()?;
            if first != MAGIC {
                self.skip_byte();
                continue;
            }
            if self.buf.len() < LENGTH_PREFIX_LEN {
                return None;
            }
            let total = announced_len(&self.buf)?;
            if total > self.max_frame_len {
                trace!("Frame length {} exceeds {}, resyncing", total, self.max_frame_len);
                self.skip_byte();
                continue;
            }
            if self.buf.len() < total {
                return None;
            }
            self.stats.frames += 1;
            return Some(self.buf.split_to(total).freeze());
        }
    }

    fn skip_byte(&mut self) {
        self.buf.advance(1);
        self.stats.resync_bytes += 1;
    }

    /// Drop everything held.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_bounded_by_space() {
        let mut asm = FrameAssembler::with_limits(8, 8, FRAME_TIMEOUT_MS);
        assert_eq!(asm.push(&[1, 2, 3, 4, 5], 0), 5);
        assert_eq!(asm.push(&[6, 7, 8, 9, 10], 0), 3);
        assert_eq!(asm.space(), 0);
        assert_eq!(asm.push(&[11], 0), 0);
    }

    #[test]
    fn test_garbage_only() {
        let mut asm = FrameAssembler::new();
        asm.push(&[0x00, 0x55, 0xFE], 0);
        assert_eq!(asm.next_frame(), None);
        assert!(asm.is_empty());
        assert_eq!(asm.stats().resync_bytes, 3);
    }

    #[test]
    fn test_waits_for_length() {
        let mut asm = FrameAssembler::new();
        asm.push(&[MAGIC, 9], 0);
        assert_eq!(asm.next_frame(), None);
        assert_eq!(asm.len(), 2);
    }

    #[test]
    fn test_ceiling_drops_false_magic() {
        let mut asm = FrameAssembler::with_limits(64, 20, FRAME_TIMEOUT_MS);
        // Announces 21 bytes, one more than allowed.
        asm.push(&[MAGIC, 9, 0, 0x11, 0x22], 0);
        assert_eq!(asm.next_frame(), None);
        assert!(asm.is_empty());
        assert_eq!(asm.stats().resync_bytes, 5);
    }

    #[test]
    fn test_expire_boundary() {
        let mut asm = FrameAssembler::new();
        asm.push(&[MAGIC, 9, 0], 100);
        assert_eq!(asm.expire(150), 0);
        assert_eq!(asm.expire(151), 3);
        assert!(asm.is_empty());
        assert_eq!(asm.stats().timeouts, 1);
        assert_eq!(asm.expire(1000), 0);
    }
}
