//! Peer connection seam
//!
//! The sync machinery (trysync, sender, heartbeat) talks to peers
//! through `PeerTransport` so tests can substitute an in-memory double.
//! `TcpTransport` is the production implementation over blocking
//! `std::net` sockets with configured timeouts.

use std::io::{BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::{self, Reply};

/// One established connection to a peer.
pub trait PeerTransport: Send {
    /// Write a fully encoded command (or batch of commands).
    fn send(&mut self, buf: &[u8]) -> Result<()>;

    /// Read one reply.
    fn recv_reply(&mut self) -> Result<Reply>;
}

/// Dials peers. Shared by every worker thread.
pub trait TransportFactory: Send + Sync + 'static {
    fn connect(&self, ip: &str, port: u16, timeout: Duration) -> Result<Box<dyn PeerTransport>>;
}

/// Blocking TCP connection with read/write timeouts.
pub struct TcpTransport {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl TcpTransport {
    pub fn connect(ip: &str, port: u16, connect_timeout: Duration, io_timeout: Duration) -> Result<Self> {
        let addr = (ip, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::protocol(format!("cannot resolve {}:{}", ip, port)))?;
        let stream = TcpStream::connect_timeout(&addr, connect_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(io_timeout))?;
        stream.set_write_timeout(Some(io_timeout))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self { stream, reader })
    }
}

impl PeerTransport for TcpTransport {
    fn send(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf)?;
        Ok(())
    }

    fn recv_reply(&mut self) -> Result<Reply> {
        protocol::read_reply(&mut self.reader)
    }
}

/// Factory for `TcpTransport` connections.
pub struct TcpTransportFactory {
    io_timeout: Duration,
}

impl TcpTransportFactory {
    pub fn new(io_timeout: Duration) -> Self {
        Self { io_timeout }
    }
}

impl TransportFactory for TcpTransportFactory {
    fn connect(&self, ip: &str, port: u16, timeout: Duration) -> Result<Box<dyn PeerTransport>> {
        Ok(Box::new(TcpTransport::connect(
            ip,
            port,
            timeout,
            self.io_timeout,
        )?))
    }
}
