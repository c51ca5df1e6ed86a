//! The wire format that frames a scatter-gather array over a byte stream or a datagram.
//!
//! ```text
//! header:  magic (u64) | total_len (u64) | num_segments (u64)
//! payload: num_segments x ( segment_len (u64) | segment bytes )
//! ```
//!
//! All integers are little-endian. `total_len` counts the payload only, length prefixes
//! included, and never the header itself.

use crate::error::{Error, Result};
use crate::sga::SgArray;
use bytes::Bytes;
use std::io::IoSlice;

/// The constant every frame starts with.
pub const MAGIC: u64 = 0x5a45_5553_5347_4131;

/// The size of an encoded [`Header`].
pub const HEADER_SIZE: usize = 3 * LEN_SIZE;

/// The size of one segment length prefix.
pub const LEN_SIZE: usize = std::mem::size_of::<u64>();

/// The fixed-size header at the start of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Always [`MAGIC`] on a valid frame.
    pub magic: u64,
    /// Payload bytes following the header, length prefixes included.
    pub total_len: u64,
    /// The number of segments encoded in the payload.
    pub num_segments: u64,
}

impl Header {
    /// Computes the header describing `sga`.
    pub fn for_sga(sga: &SgArray) -> Self {
        let total_len = sga
            .segments
            .iter()
            .map(|segment| (LEN_SIZE + segment.len()) as u64)
            .sum();

        Self {
            magic: MAGIC,
            total_len,
            num_segments: sga.num_segments() as u64,
        }
    }

    /// Serializes this header.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..8].copy_from_slice(&self.magic.to_le_bytes());
        buf[8..16].copy_from_slice(&self.total_len.to_le_bytes());
        buf[16..].copy_from_slice(&self.num_segments.to_le_bytes());
        buf
    }

    /// Parses and validates a header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadMagic`] if the first word is not [`MAGIC`], and [`Error::Malformed`]
    /// if the segment count cannot fit in the announced payload.
    pub fn parse(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let header = Self {
            magic: read_u64(&buf[..8]),
            total_len: read_u64(&buf[8..16]),
            num_segments: read_u64(&buf[16..]),
        };

        if header.magic != MAGIC {
            return Err(Error::BadMagic(header.magic));
        }

        match header.num_segments.checked_mul(LEN_SIZE as u64) {
            Some(prefixes) if prefixes <= header.total_len => Ok(header),
            _ => Err(Error::Malformed("segment count exceeds payload length")),
        }
    }

    /// The number of user bytes carried by the frame, excluding length prefixes.
    ///
    /// This is the result value reported for a completed pop.
    pub fn payload_len(&self) -> usize {
        (self.total_len - self.num_segments * LEN_SIZE as u64) as usize
    }
}

/// Reads a little-endian `u64` from an 8-byte slice.
fn read_u64(bytes: &[u8]) -> u64 {
    let mut word = [0u8; LEN_SIZE];
    word.copy_from_slice(bytes);
    u64::from_le_bytes(word)
}

/// An encoded outgoing frame, written with vectored I/O.
///
/// The frame keeps its own clones of the segments, so it can be resumed from any byte offset after
/// a partial write.
#[derive(Debug)]
pub struct OutgoingFrame {
    /// The encoded header.
    header: [u8; HEADER_SIZE],
    /// One encoded length prefix per segment.
    prefixes: Vec<[u8; LEN_SIZE]>,
    /// The segment data.
    segments: Vec<Bytes>,
}

impl OutgoingFrame {
    /// Encodes `sga` into a frame.
    pub fn encode(sga: &SgArray) -> Self {
        Self {
            header: Header::for_sga(sga).to_bytes(),
            prefixes: sga
                .segments
                .iter()
                .map(|segment| (segment.len() as u64).to_le_bytes())
                .collect(),
            segments: sga.segments.clone(),
        }
    }

    /// The size of the whole frame on the wire, header included.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.prefixes.len() * LEN_SIZE + self.data_len()
    }

    /// The number of user bytes in the frame, which is the result of a completed push.
    pub fn data_len(&self) -> usize {
        self.segments.iter().map(Bytes::len).sum()
    }

    /// Returns the parts of the frame that remain after the first `offset` bytes, in wire order.
    pub fn slices_from(&self, offset: usize) -> Vec<IoSlice<'_>> {
        let mut parts: Vec<&[u8]> = Vec::with_capacity(1 + 2 * self.segments.len());
        parts.push(&self.header);
        for (prefix, segment) in self.prefixes.iter().zip(&self.segments) {
            parts.push(prefix);
            parts.push(segment);
        }

        let mut skip = offset;
        let mut slices = Vec::with_capacity(parts.len());
        for part in parts {
            if skip >= part.len() {
                skip -= part.len();
                continue;
            }
            slices.push(IoSlice::new(&part[skip..]));
            skip = 0;
        }

        slices
    }

    /// Flattens the frame into one contiguous buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_len());
        for slice in self.slices_from(0) {
            buf.extend_from_slice(&slice);
        }
        buf
    }
}

/// Splits a received payload into the segments announced by `header`.
///
/// Segments are zero-copy slices of `payload`.
///
/// # Errors
///
/// Returns [`Error::Malformed`] if a length prefix or a segment runs past the end of the payload,
/// or if bytes are left over after the last segment.
pub fn decode_segments(header: &Header, payload: Bytes) -> Result<Vec<Bytes>> {
    if payload.len() as u64 != header.total_len {
        return Err(Error::Malformed("payload length does not match header"));
    }

    let mut segments = Vec::with_capacity(header.num_segments as usize);
    let mut cursor = 0usize;

    for _ in 0..header.num_segments {
        let Some(prefix) = payload.get(cursor..cursor + LEN_SIZE) else {
            return Err(Error::Malformed("truncated segment length"));
        };
        cursor += LEN_SIZE;

        let len = read_u64(prefix);
        let end = match usize::try_from(len).ok().and_then(|len| cursor.checked_add(len)) {
            Some(end) if end <= payload.len() => end,
            _ => return Err(Error::Malformed("segment runs past the payload")),
        };

        segments.push(payload.slice(cursor..end));
        cursor = end;
    }

    if cursor != payload.len() {
        return Err(Error::Malformed("trailing bytes after the last segment"));
    }

    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_sga() -> SgArray {
        SgArray::from_segments([&b"abc"[..], &b"xy"[..]])
    }

    #[test]
    fn header_counts_prefixes_but_not_itself() {
        let header = Header::for_sga(&scenario_sga());
        assert_eq!(header.magic, MAGIC);
        assert_eq!(header.num_segments, 2);
        assert_eq!(header.total_len, 2 * 8 + 5);
        assert_eq!(header.payload_len(), 5);
    }

    #[test]
    fn frame_layout() {
        let frame = OutgoingFrame::encode(&scenario_sga());
        let wire = frame.to_vec();
        assert_eq!(wire.len(), frame.wire_len());
        assert_eq!(frame.data_len(), 5);

        assert_eq!(&wire[..8], &MAGIC.to_le_bytes());
        assert_eq!(&wire[24..32], &3u64.to_le_bytes());
        assert_eq!(&wire[32..35], b"abc");
        assert_eq!(&wire[35..43], &2u64.to_le_bytes());
        assert_eq!(&wire[43..], b"xy");
    }

    #[test]
    fn resumed_slices_skip_written_bytes() {
        let frame = OutgoingFrame::encode(&scenario_sga());
        let wire = frame.to_vec();

        for offset in 0..=wire.len() {
            let rest: Vec<u8> = frame
                .slices_from(offset)
                .iter()
                .flat_map(|slice| slice.iter().copied())
                .collect();
            assert_eq!(rest, &wire[offset..], "offset {offset}");
        }
    }

    #[test]
    fn decode_splits_segments() {
        let frame = OutgoingFrame::encode(&scenario_sga()).to_vec();
        let header = Header::parse(frame[..HEADER_SIZE].try_into().unwrap()).unwrap();
        let segments = decode_segments(&header, Bytes::copy_from_slice(&frame[HEADER_SIZE..]))
            .unwrap();

        assert_eq!(segments, vec![Bytes::from_static(b"abc"), Bytes::from_static(b"xy")]);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut frame = OutgoingFrame::encode(&scenario_sga()).to_vec();
        frame[0] ^= 0xff;
        let err = Header::parse(frame[..HEADER_SIZE].try_into().unwrap()).unwrap_err();
        assert!(matches!(err, Error::BadMagic(_)));
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        let header = Header {
            magic: MAGIC,
            total_len: 10,
            num_segments: 1,
        };

        // Segment claims 5 bytes but only 2 follow its prefix.
        let mut payload = 5u64.to_le_bytes().to_vec();
        payload.extend_from_slice(b"ab");
        assert_eq!(
            decode_segments(&header, Bytes::from(payload)),
            Err(Error::Malformed("segment runs past the payload"))
        );

        // Segment claims 1 byte and one byte is left over.
        let mut payload = 1u64.to_le_bytes().to_vec();
        payload.extend_from_slice(b"ab");
        assert_eq!(
            decode_segments(&header, Bytes::from(payload)),
            Err(Error::Malformed("trailing bytes after the last segment"))
        );
    }

    #[test]
    fn impossible_segment_count() {
        let header = Header {
            magic: MAGIC,
            total_len: 8,
            num_segments: 2,
        };
        assert!(matches!(
            Header::parse(&header.to_bytes()),
            Err(Error::Malformed(_))
        ));
    }
}
