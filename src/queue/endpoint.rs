//! The seam between the queue core and the descriptor it drives.

use super::Category;
use crate::error::{Error, Result};
use std::io::{self, IoSlice};
use std::net::SocketAddr;

/// The most slices an endpoint hands to the kernel in one vectored write.
///
/// A stream frame with more slices goes out over several writes. A datagram frame cannot be split,
/// so it is flattened into one buffer first.
pub const MAX_IOVECS: usize = 1024;

/// How the underlying descriptor delivers bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// An ordered byte stream: frames may arrive split across any number of reads.
    Stream,
    /// Whole messages: one receive yields one complete frame.
    Datagram,
}

/// A non-blocking descriptor that a [`Queue`](super::Queue) moves frames over.
///
/// Every I/O method must return [`io::ErrorKind::WouldBlock`] instead of blocking. The queue treats
/// that as "retry later" and leaves the request untouched; any other error is fatal to the request
/// that hit it.
///
/// The setup methods default to [`Error::WrongCategory`], so an endpoint only implements the ones
/// that make sense for it.
pub trait Endpoint {
    /// The delivery model of this endpoint.
    fn transport(&self) -> Transport;

    /// The backend category this endpoint belongs to.
    fn category(&self) -> Category;

    /// Reads up to `buf.len()` bytes.
    ///
    /// On a stream, `Ok(0)` for a non-empty `buf` means the peer closed the connection.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Receives one whole message, along with the sender's address if the transport has one.
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)> {
        self.read(buf).map(|n| (n, None))
    }

    /// Writes the given slices, in order, as a single vectored write.
    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Whether the endpoint is associated with a peer.
    ///
    /// A datagram endpoint that is not connected is connected to the destination of the first
    /// array pushed on it.
    fn is_connected(&self) -> bool {
        true
    }

    /// Associates the endpoint with a peer.
    fn connect(&mut self, _addr: SocketAddr) -> Result<()> {
        Err(Error::WrongCategory)
    }

    /// Binds the endpoint to a local address.
    fn bind(&mut self, _addr: SocketAddr) -> Result<()> {
        Err(Error::WrongCategory)
    }

    /// Marks the endpoint as accepting connections.
    fn listen(&mut self, _backlog: i32) -> Result<()> {
        Err(Error::WrongCategory)
    }

    /// Accepts one incoming connection.
    fn accept(&mut self) -> Result<(Self, SocketAddr)>
    where
        Self: Sized,
    {
        Err(Error::WrongCategory)
    }

    /// Returns the local address the endpoint is bound to.
    fn local_addr(&self) -> Result<SocketAddr> {
        Err(Error::WrongCategory)
    }

    /// Releases the underlying descriptor.
    fn close(&mut self) -> Result<()>;
}
