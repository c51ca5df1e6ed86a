//! The standard-socket backend: OS sockets and files driven in non-blocking mode.

pub(crate) mod addr;
mod file;
mod socket;

pub use file::PosixFile;
pub use socket::PosixSocket;

use crate::error::{Error, Result};
use crate::queue::Queue;
use std::io;
use std::os::fd::RawFd;

pub(crate) use crate::queue::endpoint::MAX_IOVECS;

/// A queue over an OS socket.
pub type SocketQueue = Queue<PosixSocket>;

/// A queue over an OS file.
pub type FileQueue = Queue<PosixFile>;

/// Turns a negative libc return value into the current `errno`.
pub(crate) fn check(res: libc::c_int) -> Result<libc::c_int> {
    if res < 0 {
        return Err(Error::last_os_error());
    }
    Ok(res)
}

/// Adds `O_NONBLOCK` to the descriptor's status flags.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // Safety: `fcntl` with `F_GETFL` / `F_SETFL` has no memory-safety preconditions.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
