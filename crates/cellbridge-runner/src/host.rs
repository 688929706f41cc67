//! Host-side stand-ins for the UART peripherals.
//!
//! A [`TcpLink`] carries a raw serial stream over TCP (for example a
//! `ser2net` port in front of the real modem). Its receive "DMA" is a reader
//! thread copying socket bytes into the ring; its transmit engine hands each
//! transfer to a writer thread that signals completion once the bytes are on
//! the socket.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::thread::{self, JoinHandle};

use cellbridge_modem::sim::{sim_uart, SimHandle, SimUart};
use cellbridge_uart::{
    dma_channel, DmaRegion, DmaWriter, SerialPort, TxComplete, TxDma, UartDma, UartError,
    UartResult, RX_BUFFER_SIZE,
};
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::config::LinkSpec;
use crate::error::{RunnerError, RunnerResult};
use crate::telemetry::{sim_telemetry, HeartbeatSource, SimTelemetryUart, HEARTBEAT_INTERVAL_MS};

/// Socket read size for the receive thread.
const READ_CHUNK: usize = 256;

type Transfer = (Vec<u8>, TxComplete);

/// Transmit engine feeding the writer thread of a [`TcpLink`].
#[derive(Debug)]
pub struct TcpTx {
    transfers: Sender<Transfer>,
}

impl TxDma for TcpTx {
    fn start(&mut self, data: &[u8], done: TxComplete) -> UartResult<()> {
        self.transfers
            .send((data.to_vec(), done))
            .map_err(|_| UartError::Closed)
    }
}

/// A UART whose far end is a TCP socket.
pub type TcpUart = UartDma<DmaRegion, TcpTx>;

/// The threads and socket behind a [`TcpUart`].
#[derive(Debug)]
pub struct TcpLink {
    name: String,
    stream: TcpStream,
    stop: Option<Sender<()>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl TcpLink {
    /// Connect to `addr` and start the I/O threads.
    pub fn connect(name: &str, addr: &str) -> RunnerResult<(TcpUart, TcpLink)> {
        let stream = TcpStream::connect(addr).map_err(|e| RunnerError::Link {
            name: name.to_string(),
            message: format!("connect to {}: {}", addr, e),
        })?;
        stream.set_nodelay(true)?;
        info!("{} link connected to {}", name, addr);

        let (dma, region) = dma_channel(RX_BUFFER_SIZE);
        let (transfers_tx, transfers_rx) = unbounded::<Transfer>();
        let (stop_tx, stop_rx) = unbounded::<()>();

        let read_stream = stream.try_clone()?;
        let reader_name = name.to_string();
        let reader = thread::Builder::new()
            .name(format!("{}-rx", name))
            .spawn(move || reader_main(reader_name, read_stream, dma))?;

        let write_stream = stream.try_clone()?;
        let writer_name = name.to_string();
        let writer = thread::Builder::new()
            .name(format!("{}-tx", name))
            .spawn(move || writer_main(writer_name, write_stream, transfers_rx, stop_rx))?;

        let uart = UartDma::new(
            region,
            TcpTx {
                transfers: transfers_tx,
            },
        );
        let link = TcpLink {
            name: name.to_string(),
            stream,
            stop: Some(stop_tx),
            reader: Some(reader),
            writer: Some(writer),
        };
        Ok((uart, link))
    }

    /// Whether the receive thread has exited.
    pub fn is_closed(&self) -> bool {
        self.reader.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Close the socket and join both threads.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        self.stop.take();
        for handle in [self.reader.take(), self.writer.take()].into_iter().flatten() {
            if handle.join().is_err() {
                warn!("{} link thread panicked", self.name);
            }
        }
        debug!("{} link closed", self.name);
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        if self.reader.is_some() || self.writer.is_some() {
            self.close();
        }
    }
}

fn reader_main(name: String, mut stream: TcpStream, dma: DmaWriter) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => {
                info!("{} link closed by peer", name);
                break;
            }
            Ok(n) => dma.push(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("{} link read ended: {}", name, e);
                break;
            }
        }
    }
}

fn writer_main(
    name: String,
    mut stream: TcpStream,
    transfers: Receiver<Transfer>,
    stop: Receiver<()>,
) {
    loop {
        select! {
            recv(transfers) -> msg => {
                let Ok((data, done)) = msg else { break };
                let result = stream.write_all(&data).and_then(|_| stream.flush());
                done.signal();
                if let Err(e) = result {
                    warn!("{} link write failed: {}", name, e);
                    break;
                }
            }
            recv(stop) -> _ => break,
        }
    }
}

/// Any of the ports the runner can drive.
#[derive(Debug)]
pub enum HostPort {
    /// Serial stream over TCP.
    Tcp(TcpUart),
    /// Simulated A7600.
    SimModem(SimUart),
    /// Simulated flight controller.
    SimTelemetry(SimTelemetryUart),
}

impl SerialPort for HostPort {
    fn available(&self) -> usize {
        match self {
            HostPort::Tcp(p) => p.available(),
            HostPort::SimModem(p) => p.available(),
            HostPort::SimTelemetry(p) => p.available(),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        match self {
            HostPort::Tcp(p) => p.read(buf),
            HostPort::SimModem(p) => p.read(buf),
            HostPort::SimTelemetry(p) => p.read(buf),
        }
    }

    fn read_byte(&mut self) -> Option<u8> {
        match self {
            HostPort::Tcp(p) => p.read_byte(),
            HostPort::SimModem(p) => p.read_byte(),
            HostPort::SimTelemetry(p) => p.read_byte(),
        }
    }

    fn transmit(&mut self, data: &[u8]) -> UartResult<usize> {
        match self {
            HostPort::Tcp(p) => p.transmit(data),
            HostPort::SimModem(p) => p.transmit(data),
            HostPort::SimTelemetry(p) => p.transmit(data),
        }
    }

    fn is_tx_busy(&self) -> bool {
        match self {
            HostPort::Tcp(p) => p.is_tx_busy(),
            HostPort::SimModem(p) => p.is_tx_busy(),
            HostPort::SimTelemetry(p) => p.is_tx_busy(),
        }
    }

    fn flush(&mut self) {
        match self {
            HostPort::Tcp(p) => p.flush(),
            HostPort::SimModem(p) => p.flush(),
            HostPort::SimTelemetry(p) => p.flush(),
        }
    }
}

/// What keeps an opened link alive.
#[derive(Debug)]
pub enum LinkGuard {
    /// Socket threads.
    Tcp(TcpLink),
    /// Simulated modem (answers on its own).
    SimModem(SimHandle),
    /// Simulated flight controller; needs ticking.
    SimTelemetry(HeartbeatSource),
}

impl LinkGuard {
    /// Drive any simulated producer behind the link.
    pub fn tick(&mut self, now_ms: u64) {
        if let LinkGuard::SimTelemetry(source) = self {
            source.tick(now_ms);
        }
    }

    /// Release the link.
    pub fn shutdown(self) {
        if let LinkGuard::Tcp(link) = self {
            link.shutdown();
        }
    }
}

/// Open the modem link.
pub fn open_modem(spec: &LinkSpec) -> RunnerResult<(HostPort, LinkGuard)> {
    match spec {
        LinkSpec::Sim => {
            info!("Modem link: simulated A7600");
            let (uart, handle) = sim_uart();
            Ok((HostPort::SimModem(uart), LinkGuard::SimModem(handle)))
        }
        LinkSpec::Tcp(addr) => {
            let (uart, link) = TcpLink::connect("modem", addr)?;
            Ok((HostPort::Tcp(uart), LinkGuard::Tcp(link)))
        }
    }
}

/// Open the telemetry link.
pub fn open_telemetry(spec: &LinkSpec) -> RunnerResult<(HostPort, LinkGuard)> {
    match spec {
        LinkSpec::Sim => {
            info!(
                "Telemetry link: simulated heartbeats every {} ms",
                HEARTBEAT_INTERVAL_MS
            );
            let (uart, source) = sim_telemetry(HEARTBEAT_INTERVAL_MS);
            Ok((
                HostPort::SimTelemetry(uart),
                LinkGuard::SimTelemetry(source),
            ))
        }
        LinkSpec::Tcp(addr) => {
            let (uart, link) = TcpLink::connect("telemetry", addr)?;
            Ok((HostPort::Tcp(uart), LinkGuard::Tcp(link)))
        }
    }
}
