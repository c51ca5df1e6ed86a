//! The error type shared by every queue backend.
//!
//! Queue operations follow an OS-style contract: each failure corresponds to a POSIX error code,
//! available through [`Error::errno`] (positive) or [`Error::code`] (negative). Errors are cheap to
//! clone so that a request that has reached its terminal state can report the same failure on
//! every subsequent [`poll`](crate::queue::IoQueue::poll).

use crate::token::{QDesc, QToken};
use std::io;
use thiserror::Error;

/// A specialized `Result` type for queue operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by queue setup and completion operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// An OS-level call failed with the given `errno`.
    #[error("os error {0}")]
    Os(i32),
    /// An incoming frame did not start with the protocol magic number.
    #[error("bad frame magic {0:#018x}")]
    BadMagic(u64),
    /// An incoming frame was structurally invalid.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    /// An incoming frame announced a payload larger than the configured maximum.
    #[error("frame payload of {0} bytes exceeds the configured maximum")]
    FrameTooLarge(u64),
    /// A staging buffer could not be allocated.
    #[error("unable to allocate a staging buffer")]
    OutOfMemory,
    /// A kernel-bypass queue was requested before the bypass context was initialized.
    #[error("kernel-bypass backends have not been initialized")]
    Uninitialized,
    /// The process-wide bypass context was initialized a second time.
    #[error("kernel-bypass backends were already initialized")]
    AlreadyInitialized,
    /// The operation does not apply to this category of queue.
    #[error("operation is not supported by this queue category")]
    WrongCategory,
    /// A push was issued with a pop token, or the other way around.
    #[error("token {0} has the wrong direction for this operation")]
    WrongDirection(QToken),
    /// No request is registered for this token.
    #[error("no request is registered for token {0}")]
    UnknownToken(QToken),
    /// The request for this token has not completed yet.
    #[error("request for token {0} is still pending")]
    StillPending(QToken),
    /// No queue is registered under this descriptor.
    #[error("no queue is registered under {0}")]
    BadDescriptor(QDesc),
    /// A datagram was pushed on an unconnected queue without a destination address.
    #[error("no destination address for datagram")]
    NoDestination,
    /// The peer closed a stream connection mid-frame.
    #[error("connection closed by peer")]
    ConnectionClosed,
}

impl Error {
    /// Returns the positive POSIX error code corresponding to this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Os(errno) => *errno,
            Self::BadMagic(_) => libc::EPROTO,
            Self::Malformed(_) => libc::EBADMSG,
            Self::FrameTooLarge(_) => libc::EMSGSIZE,
            Self::OutOfMemory => libc::ENOMEM,
            Self::Uninitialized => libc::EPERM,
            Self::AlreadyInitialized => libc::EEXIST,
            Self::WrongCategory => libc::EINVAL,
            Self::WrongDirection(_) => libc::EINVAL,
            Self::UnknownToken(_) => libc::EINVAL,
            Self::StillPending(_) => libc::EBUSY,
            Self::BadDescriptor(_) => libc::EBADF,
            Self::NoDestination => libc::EDESTADDRREQ,
            Self::ConnectionClosed => libc::ECONNRESET,
        }
    }

    /// Returns the negative OS-style result code for this error.
    pub fn code(&self) -> i64 {
        -(self.errno() as i64)
    }

    /// Captures `errno` after a failed libc call.
    pub(crate) fn last_os_error() -> Self {
        io::Error::last_os_error().into()
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => Self::Os(errno),
            None => match err.kind() {
                io::ErrorKind::WouldBlock => Self::Os(libc::EAGAIN),
                io::ErrorKind::UnexpectedEof => Self::ConnectionClosed,
                io::ErrorKind::OutOfMemory => Self::OutOfMemory,
                _ => Self::Os(libc::EIO),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_their_os_code() {
        let err: Error = io::Error::from_raw_os_error(libc::ECONNREFUSED).into();
        assert_eq!(err, Error::Os(libc::ECONNREFUSED));
        assert_eq!(err.code(), -(libc::ECONNREFUSED as i64));

        let err: Error = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err.errno(), libc::EAGAIN);
    }

    #[test]
    fn precondition_errors_use_posix_classes() {
        assert_eq!(Error::Uninitialized.errno(), libc::EPERM);
        assert_eq!(Error::WrongCategory.errno(), libc::EINVAL);
        assert_eq!(Error::UnknownToken(QToken::pop(3)).errno(), libc::EINVAL);
    }
}
