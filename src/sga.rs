//! The scatter-gather array, the unit of user data moved by a queue.

use bytes::Bytes;
use std::net::SocketAddr;

/// An ordered sequence of buffers plus an optional peer address.
///
/// The buffer count is always `segments.len()`, and the total length is the sum of the segment
/// lengths. Segments are reference-counted [`Bytes`], so an outgoing array can be cloned cheaply
/// while its buffers are pinned for a transfer, and an incoming array can hand out zero-copy
/// slices of the buffer the frame was received into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SgArray {
    /// The buffers, in order.
    pub segments: Vec<Bytes>,

    /// The peer address.
    ///
    /// On a push over a datagram queue this is the destination; on a pop from a datagram queue it
    /// is filled in with the sender's address.
    pub addr: Option<SocketAddr>,
}

impl SgArray {
    /// Creates an empty array with no peer address.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an array from a list of segments.
    pub fn from_segments<I, B>(segments: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
            addr: None,
        }
    }

    /// Sets the peer address of this array.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    /// Appends a segment.
    pub fn push_segment(&mut self, segment: impl Into<Bytes>) {
        self.segments.push(segment.into());
    }

    /// Returns the number of buffers in this array.
    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    /// Returns the sum of all segment lengths.
    pub fn total_len(&self) -> usize {
        self.segments.iter().map(Bytes::len).sum()
    }

    /// Returns `true` if the array has no segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}
