//! The standard file endpoint.

use super::{check, MAX_IOVECS};
use crate::error::{Error, Result};
use crate::queue::endpoint::{Endpoint, Transport};
use crate::queue::Category;
use std::ffi::CString;
use std::io::{self, IoSlice};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tracing::debug;

/// An open OS file, read and written sequentially as a stream of frames.
#[derive(Debug)]
pub struct PosixFile {
    /// The file descriptor.
    fd: RawFd,
    /// Set once the descriptor has been released.
    closed: bool,
}

impl PosixFile {
    /// Opens `path` with the given `open(2)` flags, and `mode` if the file may be created.
    ///
    /// # Errors
    ///
    /// Returns the OS error from `open`, or `EINVAL` if the path contains a NUL byte.
    pub fn open(path: &Path, flags: i32, mode: Option<libc::mode_t>) -> Result<Self> {
        let cpath = c_path(path)?;

        // Safety: `cpath` is a valid NUL-terminated string for the duration of the call.
        let fd = check(unsafe {
            match mode {
                Some(mode) => libc::open(cpath.as_ptr(), flags, mode as libc::c_uint),
                None => libc::open(cpath.as_ptr(), flags),
            }
        })?;

        debug!("Opened {} as file {fd}", path.display());
        Ok(Self { fd, closed: false })
    }

    /// Creates (or truncates) `path` for writing.
    ///
    /// # Errors
    ///
    /// Returns the OS error from `creat`, or `EINVAL` if the path contains a NUL byte.
    pub fn creat(path: &Path, mode: libc::mode_t) -> Result<Self> {
        let cpath = c_path(path)?;

        // Safety: `cpath` is a valid NUL-terminated string for the duration of the call.
        let fd = check(unsafe { libc::creat(cpath.as_ptr(), mode) })?;

        debug!("Created {} as file {fd}", path.display());
        Ok(Self { fd, closed: false })
    }
}

/// Converts a path into a C string.
fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::Os(libc::EINVAL))
}

impl Endpoint for PosixFile {
    fn transport(&self) -> Transport {
        Transport::Stream
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

    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let count = bufs.len().min(MAX_IOVECS);

        // Safety: `IoSlice` is ABI compatible with `iovec` on Unix, and every slice points into a
        // live buffer borrowed for the duration of the call.
        let n = unsafe {
            libc::writev(
                self.fd,
                bufs.as_ptr() as *const libc::iovec,
                count as libc::c_int,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;

        // Safety: the descriptor is owned by this file and is not used again.
        check(unsafe { libc::close(self.fd) })?;
        Ok(())
    }
}

impl AsRawFd for PosixFile {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for PosixFile {
    fn drop(&mut self) {
        if !self.closed {
            // Safety: the descriptor is owned by this file and was never closed.
            unsafe { libc::close(self.fd) };
        }
    }
}
