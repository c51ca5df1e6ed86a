//! Queue descriptors and operation tokens.

use std::fmt::Display;

/// An opaque handle identifying one queue instance inside a [`LibOs`](crate::LibOs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QDesc {
    /// Index into the queue table.
    inner: usize,
}

impl QDesc {
    /// Creates a `QDesc` from a raw table index.
    pub(crate) fn new(index: usize) -> Self {
        Self { inner: index }
    }

    /// Returns the raw table index.
    pub fn as_usize(self) -> usize {
        self.inner
    }
}

impl Display for QDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "qd {}", self.inner)
    }
}

/// The bit of a [`QToken`] that marks it as a push (send) operation.
const PUSH_BIT: u64 = 1;

/// An opaque, caller-supplied identifier for one asynchronous operation on a queue.
///
/// The lowest bit is the direction bit: set for a push (send), clear for a pop (receive). Queues
/// rely on it to choose between the encode and the decode path, so tokens must be built with
/// [`QToken::push`] or [`QToken::pop`], or carry the bit correctly when made with
/// [`QToken::from_raw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QToken {
    /// The raw token, direction bit included.
    inner: u64,
}

impl QToken {
    /// Creates a push token from a caller-chosen sequence number.
    pub fn push(seq: u64) -> Self {
        Self {
            inner: (seq << 1) | PUSH_BIT,
        }
    }

    /// Creates a pop token from a caller-chosen sequence number.
    pub fn pop(seq: u64) -> Self {
        Self { inner: seq << 1 }
    }

    /// Wraps a raw 64-bit token, whose lowest bit must already encode the direction.
    pub fn from_raw(raw: u64) -> Self {
        Self { inner: raw }
    }

    /// Returns `true` if this token names a push (send) operation.
    pub fn is_push(self) -> bool {
        self.inner & PUSH_BIT == PUSH_BIT
    }

    /// Returns the raw 64-bit value of this token.
    pub fn as_u64(self) -> u64 {
        self.inner
    }
}

impl Display for QToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let direction = if self.is_push() { "push" } else { "pop" };
        write!(f, "{}#{}", direction, self.inner >> 1)
    }
}

/// A `QToken` must always be convertible into a unique 64-bit integer.
impl From<QToken> for u64 {
    fn from(value: QToken) -> Self {
        value.as_u64()
    }
}
