//! Circular receive buffer shared between a DMA producer and the application.
//!
//! The storage is a fixed array of atomic bytes and a single atomic write
//! position. The producer stores the bytes first and publishes the new
//! position with release ordering; the consumer loads the position with
//! acquire ordering before copying, so it never observes a position ahead of
//! the data.
//!
//! Overruns are not detected: if the producer laps the consumer the unread
//! bytes are overwritten and `available()` wraps, exactly as a circular DMA
//! transfer behaves.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Default receive buffer size.
pub const RX_BUFFER_SIZE: usize = 512;

/// Hardware side of a circular receive buffer.
///
/// Implemented by the DMA peripheral binding. The consumer only needs to read
/// the remaining-transfer counter and copy bytes out of the region.
pub trait RxDma {
    /// Size of the circular region in bytes.
    fn capacity(&self) -> usize;

    /// Transfers left before the DMA wraps, as the counter register reports
    /// it. Counts down from `capacity()` and reloads after reaching zero.
    fn remaining(&self) -> usize;

    /// Copy `out.len()` bytes starting at `offset`.
    ///
    /// The caller guarantees `offset + out.len() <= capacity()`.
    fn copy_out(&self, offset: usize, out: &mut [u8]);
}

struct DmaMemory {
    storage: Box<[AtomicU8]>,
    position: AtomicUsize,
}

/// Create an in-memory DMA region and the writer that feeds it.
///
/// The [`DmaWriter`] plays the role of the DMA engine; the [`DmaRegion`] is
/// handed to an [`RxRing`] (usually through a [`crate::UartDma`]).
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn dma_channel(capacity: usize) -> (DmaWriter, DmaRegion) {
    assert!(capacity > 0, "DMA region capacity must be non-zero");
    let storage = (0..capacity).map(|_| AtomicU8::new(0)).collect::<Vec<_>>();
    let memory = Arc::new(DmaMemory {
        storage: storage.into_boxed_slice(),
        position: AtomicUsize::new(0),
    });
    (
        DmaWriter {
            memory: Arc::clone(&memory),
        },
        DmaRegion { memory },
    )
}

/// Producer half of an in-memory DMA region.
///
/// There must be exactly one writer per region; it is deliberately not
/// `Clone`. Share it behind a mutex if several parties need to inject bytes.
pub struct DmaWriter {
    memory: Arc<DmaMemory>,
}

impl DmaWriter {
    /// Write bytes at the current position and advance it, wrapping at the
    /// end of the region.
    pub fn push(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let cap = self.memory.storage.len();
        let mut pos = self.memory.position.load(Ordering::Relaxed);
        for &byte in data {
            self.memory.storage[pos].store(byte, Ordering::Relaxed);
            pos = (pos + 1) % cap;
        }
        self.memory.position.store(pos, Ordering::Release);
    }

    /// Current write position.
    pub fn position(&self) -> usize {
        self.memory.position.load(Ordering::Relaxed)
    }

    /// Region capacity.
    pub fn capacity(&self) -> usize {
        self.memory.storage.len()
    }
}

impl std::fmt::Debug for DmaWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaWriter")
            .field("capacity", &self.capacity())
            .field("position", &self.position())
            .finish()
    }
}

/// Hardware-facing view of an in-memory DMA region.
pub struct DmaRegion {
    memory: Arc<DmaMemory>,
}

impl RxDma for DmaRegion {
    fn capacity(&self) -> usize {
        self.memory.storage.len()
    }

    fn remaining(&self) -> usize {
        self.capacity() - self.memory.position.load(Ordering::Acquire)
    }

    fn copy_out(&self, offset: usize, out: &mut [u8]) {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.memory.storage[offset + i].load(Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaRegion")
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Consumer side of a circular DMA receive buffer.
///
/// Holds the software read cursor. All methods are non-blocking.
#[derive(Debug)]
pub struct RxRing<D: RxDma> {
    dma: D,
    read_pos: usize,
}

impl<D: RxDma> RxRing<D> {
    /// Wrap a DMA region. The read cursor starts at zero, matching a transfer
    /// that was just started.
    pub fn new(dma: D) -> Self {
        RxRing { dma, read_pos: 0 }
    }

    /// Region capacity.
    pub fn capacity(&self) -> usize {
        self.dma.capacity()
    }

    /// Current hardware write position.
    pub fn write_pos(&self) -> usize {
        let cap = self.dma.capacity();
        (cap - self.dma.remaining().min(cap)) % cap
    }

    /// Current software read position.
    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    /// Number of bytes ready to read.
    pub fn available(&self) -> usize {
        let write = self.write_pos();
        if write >= self.read_pos {
            write - self.read_pos
        } else {
            self.capacity() - self.read_pos + write
        }
    }

    /// Copy up to `out.len()` available bytes and advance the read cursor by
    /// the amount copied.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let cap = self.capacity();
        let count = out.len().min(self.available());
        if count == 0 {
            return 0;
        }

        let first = count.min(cap - self.read_pos);
        self.dma.copy_out(self.read_pos, &mut out[..first]);
        if count > first {
            self.dma.copy_out(0, &mut out[first..count]);
        }

        self.read_pos = (self.read_pos + count) % cap;
        count
    }

    /// Read a single byte, if one is available.
    pub fn read_byte(&mut self) -> Option<u8> {
        let mut byte = [0u8; 1];
        (self.read(&mut byte) == 1).then_some(byte[0])
    }

    /// Discard all unread bytes by moving the read cursor to the write cursor.
    pub fn flush(&mut self) {
        self.read_pos = self.write_pos();
    }
}
