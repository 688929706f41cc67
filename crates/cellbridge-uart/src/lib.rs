//! DMA-backed UART byte stream.
//!
//! This crate provides the lowest layer of the bridge: a circular receive
//! buffer that a DMA peripheral fills on its own, drained by application code,
//! plus a single-shot transmit path guarded by a busy flag.
//!
//! # Model
//!
//! ```text
//!           DMA engine (producer)                 application (consumer)
//!   bytes ──► storage[write_pos] ──► write_pos ──► available() / read()
//!                                                  read_pos advances
//! ```
//!
//! - The **write cursor** belongs to the hardware. Software only ever observes
//!   it through the remaining-count register (`position = capacity - remaining`).
//! - The **read cursor** belongs to software.
//! - `available = (write - read) mod capacity`. Neither side takes a lock.
//!
//! The hardware boundary is expressed by the [`RxDma`] and [`TxDma`] traits.
//! [`dma_channel`] builds an in-memory DMA region that a host thread or a
//! simulator can feed, which is how the host runner and the tests drive the
//! stack.
//!
//! # Example
//!
//! ```rust,ignore
//! use cellbridge_uart::{dma_channel, SerialPort, UartDma};
//!
//! let (writer, region) = dma_channel(512);
//! let mut uart = UartDma::new(region, my_tx);
//!
//! writer.push(b"OK\r\n");
//! let mut buf = [0u8; 16];
//! let n = uart.read(&mut buf);
//! ```

mod clock;
mod error;
mod ring;
mod uart;

pub use clock::*;
pub use error::*;
pub use ring::*;
pub use uart::*;
