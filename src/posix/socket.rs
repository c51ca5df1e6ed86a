//! The standard socket endpoint.

use super::{addr, check, set_nonblocking, MAX_IOVECS};
use crate::error::{Error, Result};
use crate::queue::endpoint::{Endpoint, Transport};
use crate::queue::Category;
use std::io::{self, IoSlice};
use std::mem::size_of;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use tracing::{debug, warn};

/// A non-blocking OS socket.
#[derive(Debug)]
pub struct PosixSocket {
    /// The socket descriptor.
    fd: RawFd,
    /// Whether this is a stream or a datagram socket.
    transport: Transport,
    /// Whether the socket is associated with a peer.
    connected: bool,
    /// Set once the descriptor has been released.
    closed: bool,
}

impl PosixSocket {
    /// Creates a socket.
    ///
    /// Stream sockets get `TCP_NODELAY`, so small frames are not held back. Datagram sockets get
    /// `SO_REUSEADDR`, `SO_REUSEPORT` and are made non-blocking right away, since there is no
    /// connection handshake to defer that to. Failing to set an option is logged, not fatal.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the socket cannot be created, or `ESOCKTNOSUPPORT` for a socket type
    /// other than `SOCK_STREAM` or `SOCK_DGRAM`.
    pub fn new(domain: i32, ty: i32, protocol: i32) -> Result<Self> {
        let transport = match ty & !(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC) {
            libc::SOCK_STREAM => Transport::Stream,
            libc::SOCK_DGRAM => Transport::Datagram,
            _ => return Err(Error::Os(libc::ESOCKTNOSUPPORT)),
        };

        // Safety: `socket` has no memory-safety preconditions.
        let fd = check(unsafe { libc::socket(domain, ty, protocol) })?;
        let socket = Self {
            fd,
            transport,
            connected: false,
            closed: false,
        };

        match transport {
            Transport::Stream => socket.set_nodelay(),
            Transport::Datagram => {
                if let Err(err) = set_nonblocking(fd) {
                    warn!("Failed to set O_NONBLOCK on datagram socket {fd}: {err}");
                }
                for (name, option) in [
                    ("SO_REUSEADDR", libc::SO_REUSEADDR),
                    ("SO_REUSEPORT", libc::SO_REUSEPORT),
                ] {
                    if let Err(err) = socket.set_option(libc::SOL_SOCKET, option, 1) {
                        warn!("Failed to set {name} on datagram socket {fd}: {err}");
                    }
                }
            }
        }

        debug!("Created {transport:?} socket {fd}");
        Ok(socket)
    }

    /// Disables Nagle's algorithm, logging on failure.
    fn set_nodelay(&self) {
        if let Err(err) = self.set_option(libc::IPPROTO_TCP, libc::TCP_NODELAY, 1) {
            warn!("Failed to set TCP_NODELAY on socket {}: {err}", self.fd);
        }
    }

    /// Sets an integer socket option.
    fn set_option(&self, level: i32, name: i32, value: libc::c_int) -> io::Result<()> {
        // Safety: the option value points to a live `c_int` of the given size.
        let res = unsafe {
            libc::setsockopt(
                self.fd,
                level,
                name,
                &value as *const _ as *const libc::c_void,
                size_of::<libc::c_int>() as libc::socklen_t,
            )
        };

        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Endpoint for PosixSocket {
    fn transport(&self) -> Transport {
        self.transport
    }

    fn category(&self) -> Category {
        Category::Posix
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // Safety: `buf` is valid for writes of `buf.len()` bytes.
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)> {
        // Safety: `sockaddr_storage` is plain old data.
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        // Safety: `buf` is valid for writes of `buf.len()` bytes, and `storage` and `len` describe
        // a valid, writable address buffer.
        let n = unsafe {
            libc::recvfrom(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok((n as usize, addr::from_raw(&storage)))
    }

    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let count = bufs.len().min(MAX_IOVECS);

        // Safety: `msghdr` is plain old data.
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        // `IoSlice` is guaranteed to be ABI compatible with `iovec` on Unix.
        msg.msg_iov = bufs.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = count as _;

        // Safety: every `iovec` points into a live buffer borrowed for the duration of the call,
        // and the kernel only reads from them.
        let n = unsafe { libc::sendmsg(self.fd, &msg, libc::MSG_NOSIGNAL) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<()> {
        let (storage, len) = addr::to_raw(&addr);

        // Safety: `storage` holds a valid address of `len` bytes.
        check(unsafe {
            libc::connect(self.fd, &storage as *const _ as *const libc::sockaddr, len)
        })?;

        if let Err(err) = set_nonblocking(self.fd) {
            warn!("Failed to set O_NONBLOCK on socket {}: {err}", self.fd);
        }
        self.connected = true;

        debug!("Socket {} connected to {addr}", self.fd);
        Ok(())
    }

    fn bind(&mut self, addr: SocketAddr) -> Result<()> {
        let (storage, len) = addr::to_raw(&addr);

        // Safety: `storage` holds a valid address of `len` bytes.
        check(unsafe { libc::bind(self.fd, &storage as *const _ as *const libc::sockaddr, len) })?;

        debug!("Socket {} bound to {addr}", self.fd);
        Ok(())
    }

    fn listen(&mut self, backlog: i32) -> Result<()> {
        // Safety: `listen` has no memory-safety preconditions.
        check(unsafe { libc::listen(self.fd, backlog) })?;
        Ok(())
    }

    fn accept(&mut self) -> Result<(Self, SocketAddr)> {
        // Safety: `sockaddr_storage` is plain old data.
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        // Safety: `storage` and `len` describe a valid, writable address buffer.
        let fd = check(unsafe {
            libc::accept(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        })?;

        let socket = Self {
            fd,
            transport: Transport::Stream,
            connected: true,
            closed: false,
        };
        socket.set_nodelay();
        if let Err(err) = set_nonblocking(fd) {
            warn!("Failed to set O_NONBLOCK on accepted socket {fd}: {err}");
        }

        let peer = addr::from_raw(&storage).ok_or(Error::Os(libc::EAFNOSUPPORT))?;
        debug!("Socket {} accepted {peer} as socket {fd}", self.fd);
        Ok((socket, peer))
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;

        // Safety: the descriptor is owned by this socket and is not used again.
        check(unsafe { libc::close(self.fd) })?;
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        // Safety: `sockaddr_storage` is plain old data.
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        // Safety: `storage` and `len` describe a valid, writable address buffer.
        check(unsafe {
            libc::getsockname(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        })?;

        addr::from_raw(&storage).ok_or(Error::Os(libc::EAFNOSUPPORT))
    }
}

impl AsRawFd for PosixSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for PosixSocket {
    fn drop(&mut self) {
        if !self.closed {
            // Safety: the descriptor is owned by this socket and was never closed.
            unsafe { libc::close(self.fd) };
        }
    }
}
