/*! The transport boundary: a byte-stream socket to a CAN gateway.

spec.md §6 specifies the contract abstractly (`connect`/`send`/
`receive`/`close`, `receive` signalling EOF with `ConnectionBroken`).
[`Transport`] is that contract as a trait; [`TcpTransport`] is the one
concrete implementation this crate ships, over `std::net::TcpStream` —
grounded on `tcp_source.rs`'s blocking-connect-then-read idiom.

[`IoThread`] is the thread-plus-channel handoff from spec.md §5's
single dedicated I/O task to the single-threaded `Node` above it,
grounded on `mtgraph.rs`'s reader-thread/exit-monitor pattern: one
thread blocks in `Transport::receive`, forwarding chunks (or the
closed signal) over an `mpsc` channel that `Node::tick` drains
non-blockingly.
*/
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::thread;

use log::{info, warn};

use crate::error::Error;

/// A byte-stream connection to a CAN gateway.
pub trait Transport: Send {
    /// Send bytes to the gateway.
    fn send(&mut self, bytes: &[u8]) -> Result<(), Error>;

    /// Block until at least one byte is available, or the connection
    /// closes (`Err(Error::ConnectionBroken)`).
    fn receive(&mut self) -> Result<Vec<u8>, Error>;

    /// Close the connection. Idempotent.
    fn close(&mut self) -> Result<(), Error>;
}

/// A blocking TCP transport.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Connect to a CAN-over-TCP gateway.
    pub fn connect(host: &str, port: u16) -> Result<Self, Error> {
        let stream = TcpStream::connect((host, port)).map_err(|e| {
            warn!("transport: connect to {host}:{port} failed: {e}");
            Error::ConnectionBroken
        })?;
        Ok(Self { stream })
    }

    /// Clone the underlying socket so the read and write halves can be
    /// driven from different threads (the read half typically lives in
    /// an [`IoThread`]).
    pub fn try_clone(&self) -> Result<Self, Error> {
        let stream = self.stream.try_clone().map_err(|_| Error::ConnectionBroken)?;
        Ok(Self { stream })
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.stream.write_all(bytes).map_err(|_| Error::ConnectionBroken)
    }

    fn receive(&mut self) -> Result<Vec<u8>, Error> {
        let mut buf = [0u8; 4096];
        match self.stream.read(&mut buf) {
            Ok(0) => Err(Error::ConnectionBroken),
            Ok(n) => Ok(buf[..n].to_vec()),
            Err(e) => {
                warn!("transport: read failed: {e}");
                Err(Error::ConnectionBroken)
            }
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        match self.stream.shutdown(std::net::Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(_) => Err(Error::ConnectionBroken),
        }
    }
}

/// An event the I/O thread hands to the single-threaded consumer.
pub enum IoEvent {
    /// Bytes read from the transport.
    Data(Vec<u8>),
    /// The transport reported `ConnectionBroken`; the thread has
    /// already exited.
    Closed,
}

/// Owns the dedicated reader thread for one [`Transport`].
pub struct IoThread {
    handle: Option<thread::JoinHandle<()>>,
    rx: mpsc::Receiver<IoEvent>,
}

impl IoThread {
    /// Spawn a thread that blocks in `transport.receive()` in a loop,
    /// forwarding each chunk until the transport closes.
    pub fn spawn<T: Transport + 'static>(mut transport: T) -> Self {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("lcc-io".into())
            .spawn(move || {
                loop {
                    match transport.receive() {
                        Ok(bytes) => {
                            if tx.send(IoEvent::Data(bytes)).is_err() {
                                break;
                            }
                        }
                        Err(_) => {
                            info!("lcc-io: transport closed");
                            let _ = tx.send(IoEvent::Closed);
                            break;
                        }
                    }
                }
            })
            .expect("spawn lcc-io thread");
        Self {
            handle: Some(handle),
            rx,
        }
    }

    /// Drain every event queued so far without blocking.
    pub fn drain(&self) -> Vec<IoEvent> {
        self.rx.try_iter().collect()
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}
