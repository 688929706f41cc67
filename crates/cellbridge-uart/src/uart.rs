//! UART handle combining the DMA receive ring with a single-shot transmit path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{trace, warn};

use crate::error::{UartError, UartResult};
use crate::ring::{RxDma, RxRing};

/// Transmit buffer size. Longer writes are truncated.
pub const TX_BUFFER_SIZE: usize = 512;

/// Hardware side of the transmit path.
///
/// `start` kicks off a transfer of `data` and returns immediately. The
/// implementation must call [`TxComplete::signal`] once the transfer has
/// finished (typically from the transfer-complete interrupt).
pub trait TxDma {
    /// Start transmitting `data`.
    fn start(&mut self, data: &[u8], done: TxComplete) -> UartResult<()>;
}

/// Completion signal for an in-flight transmission.
///
/// Cloned into whatever context observes the end of the transfer.
#[derive(Debug, Clone)]
pub struct TxComplete {
    busy: Arc<AtomicBool>,
}

impl TxComplete {
    /// Mark the transmit path as free.
    pub fn signal(&self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Byte-stream operations the upper layers rely on.
///
/// Implemented by [`UartDma`]; tests and host backends can provide their own.
pub trait SerialPort {
    /// Number of received bytes ready to read.
    fn available(&self) -> usize;

    /// Read up to `buf.len()` bytes. Never blocks.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Read one byte, if available.
    fn read_byte(&mut self) -> Option<u8>;

    /// Start transmitting `data`. Returns the number of bytes accepted.
    fn transmit(&mut self, data: &[u8]) -> UartResult<usize>;

    /// Whether a transmission is still in flight.
    fn is_tx_busy(&self) -> bool;

    /// Discard all unread received bytes.
    fn flush(&mut self);
}

/// DMA-driven UART.
///
/// Receive: circular DMA into an [`RxRing`], drained by [`SerialPort::read`].
/// Transmit: bytes are copied into an owned TX buffer and handed to the
/// [`TxDma`]; only one transfer may be in flight.
pub struct UartDma<D: RxDma, T: TxDma> {
    rx: RxRing<D>,
    tx: T,
    tx_buffer: Vec<u8>,
    tx_busy: Arc<AtomicBool>,
    idle_events: AtomicU64,
}

impl<D: RxDma, T: TxDma> UartDma<D, T> {
    /// Create a UART from its receive region and transmit engine.
    pub fn new(rx: D, tx: T) -> Self {
        UartDma {
            rx: RxRing::new(rx),
            tx,
            tx_buffer: Vec::with_capacity(TX_BUFFER_SIZE),
            tx_busy: Arc::new(AtomicBool::new(false)),
            idle_events: AtomicU64::new(0),
        }
    }

    /// Completion handle for the transmit path.
    pub fn tx_complete_handle(&self) -> TxComplete {
        TxComplete {
            busy: Arc::clone(&self.tx_busy),
        }
    }

    /// Idle-line interrupt hook.
    ///
    /// Data is already in the ring when the line goes idle, so this only
    /// records the event.
    pub fn on_idle_line(&self) {
        let count = self.idle_events.fetch_add(1, Ordering::Relaxed) + 1;
        trace!("UART idle line ({} pending bytes, event #{})", self.rx.available(), count);
    }

    /// Number of idle-line events seen.
    pub fn idle_events(&self) -> u64 {
        self.idle_events.load(Ordering::Relaxed)
    }

    /// Receive ring (for diagnostics).
    pub fn rx_ring(&self) -> &RxRing<D> {
        &self.rx
    }

    /// Transmit engine.
    pub fn tx_engine(&self) -> &T {
        &self.tx
    }

    /// Mutable access to the transmit engine.
    pub fn tx_engine_mut(&mut self) -> &mut T {
        &mut self.tx
    }
}

impl<D: RxDma, T: TxDma> SerialPort for UartDma<D, T> {
    fn available(&self) -> usize {
        self.rx.available()
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        self.rx.read(buf)
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.rx.read_byte()
    }

    fn transmit(&mut self, data: &[u8]) -> UartResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        if self.tx_busy.load(Ordering::Acquire) {
            return Err(UartError::Busy);
        }

        let len = data.len().min(TX_BUFFER_SIZE);
        if len < data.len() {
            warn!(
                "UART transmit truncated: {} bytes requested, {} fit the TX buffer",
                data.len(),
                TX_BUFFER_SIZE
            );
        }

        self.tx_buffer.clear();
        self.tx_buffer.extend_from_slice(&data[..len]);

        self.tx_busy.store(true, Ordering::Release);
        let done = self.tx_complete_handle();
        if let Err(err) = self.tx.start(&self.tx_buffer, done) {
            self.tx_busy.store(false, Ordering::Release);
            return Err(err);
        }

        Ok(len)
    }

    fn is_tx_busy(&self) -> bool {
        self.tx_busy.load(Ordering::Acquire)
    }

    fn flush(&mut self) {
        self.rx.flush();
    }
}

impl<D: RxDma + std::fmt::Debug, T: TxDma> std::fmt::Debug for UartDma<D, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UartDma")
            .field("rx", &self.rx)
            .field("tx_busy", &self.is_tx_busy())
            .finish()
    }
}
