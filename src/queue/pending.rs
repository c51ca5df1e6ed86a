//! The per-token state machine that resumes a partially transferred frame.
//!
//! A receive on a stream moves through `HeaderPending -> PayloadPending -> Done`, a receive on a
//! datagram goes straight from `HeaderPending` to `Done`, and a send is `Sending -> Done`. A step
//! that would block leaves the state untouched; any other failure jumps to `Done` with the error.

use super::endpoint::{Endpoint, Transport, MAX_IOVECS};
use super::OpResult;
use crate::codec::{decode_segments, Header, OutgoingFrame, HEADER_SIZE};
use crate::config::QueueConfig;
use crate::error::Error;
use crate::pin::{PinGuard, PinTable};
use crate::sga::SgArray;
use bytes::Bytes;
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use tracing::{debug, trace, warn};

/// The state of one outstanding operation.
#[derive(Debug)]
enum State {
    /// Waiting for the frame header.
    ///
    /// On a stream the header is accumulated in `header`; on a datagram the whole message is
    /// received at once into `staging`, which is allocated on the first attempt.
    HeaderPending {
        /// Header bytes read so far.
        header: [u8; HEADER_SIZE],
        /// How many bytes of `header` are valid.
        filled: usize,
        /// Receive buffer for a whole datagram; empty until the first attempt.
        staging: Vec<u8>,
    },
    /// The header has been validated and the payload is being accumulated (streams only).
    PayloadPending {
        /// The validated header.
        header: Header,
        /// The payload buffer, sized from `header.total_len`.
        payload: Vec<u8>,
        /// How many bytes of `payload` are valid.
        filled: usize,
    },
    /// An encoded frame is being written.
    Sending {
        /// The encoded frame.
        frame: OutgoingFrame,
        /// Bytes of the frame already accepted by the endpoint.
        written: usize,
        /// Destination for an unconnected datagram endpoint.
        addr: Option<SocketAddr>,
        /// Held until the state is replaced, which unpins the array on every way out.
        _pins: PinGuard,
    },
    /// Terminal; never changes again.
    Done(OpResult),
}

/// An outstanding push or pop.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    /// Where the request is in its transfer.
    state: State,
}

impl PendingRequest {
    /// Creates a request that receives one frame.
    pub(crate) fn receive() -> Self {
        Self {
            state: State::HeaderPending {
                header: [0; HEADER_SIZE],
                filled: 0,
                staging: Vec::new(),
            },
        }
    }

    /// Creates a request that sends `sga` as one frame, pinning its buffers until the frame has
    /// been written or the request fails.
    pub(crate) fn send(sga: SgArray, pins: &PinTable) -> Self {
        Self {
            state: State::Sending {
                frame: OutgoingFrame::encode(&sga),
                written: 0,
                addr: sga.addr,
                _pins: pins.pin(&sga),
            },
        }
    }

    /// Returns `true` once the request has reached its terminal state.
    pub(crate) fn is_done(&self) -> bool {
        matches!(self.state, State::Done(_))
    }

    /// The current result: [`OpResult::Pending`] until the request is done.
    pub(crate) fn status(&self) -> OpResult {
        match &self.state {
            State::Done(result) => result.clone(),
            _ => OpResult::Pending,
        }
    }

    /// Consumes the request, returning its result.
    pub(crate) fn into_status(self) -> OpResult {
        match self.state {
            State::Done(result) => result,
            _ => OpResult::Pending,
        }
    }

    /// Advances the request by one increment against `io`.
    ///
    /// Completing a stream header immediately attempts the first payload read, so a frame that is
    /// already buffered in the kernel is received in a single increment.
    pub(crate) fn advance<E>(&mut self, io: &mut E, config: &QueueConfig)
    where
        E: Endpoint + ?Sized,
    {
        let Some(next) = self.step(io, config) else {
            return;
        };

        let read_payload = matches!(next, State::PayloadPending { .. });
        self.state = next;

        if read_payload {
            if let Some(next) = self.step(io, config) {
                self.state = next;
            }
        }
    }

    /// Performs one I/O attempt, returning the next state if the state changes.
    fn step<E>(&mut self, io: &mut E, config: &QueueConfig) -> Option<State>
    where
        E: Endpoint + ?Sized,
    {
        match &mut self.state {
            State::Done(_) => None,
            State::HeaderPending {
                header,
                filled,
                staging,
            } => match io.transport() {
                Transport::Stream => read_header(io, header, filled, config),
                Transport::Datagram => recv_datagram(io, staging, config),
            },
            State::PayloadPending {
                header,
                payload,
                filled,
            } => read_payload(io, header, payload, filled),
            State::Sending {
                frame,
                written,
                addr,
                ..
            } => write_frame(io, frame, written, *addr),
        }
    }
}

/// Accumulates the stream header, validating it once all of its bytes are present.
fn read_header<E>(
    io: &mut E,
    header: &mut [u8; HEADER_SIZE],
    filled: &mut usize,
    config: &QueueConfig,
) -> Option<State>
where
    E: Endpoint + ?Sized,
{
    match io.read(&mut header[*filled..]) {
        Ok(0) => Some(failed(Error::ConnectionClosed)),
        Ok(n) => {
            *filled += n;
            trace!("Read {n} header bytes, {}/{HEADER_SIZE}", *filled);

            if *filled < HEADER_SIZE {
                return None;
            }

            Some(match Header::parse(header) {
                Ok(header) => start_payload(header, config),
                Err(err) => failed(err),
            })
        }
        Err(err) => io_failure(err),
    }
}

/// Moves a validated stream header into the payload state, allocating the staging buffer.
fn start_payload(header: Header, config: &QueueConfig) -> State {
    if header.total_len > config.max_payload_len {
        return failed(Error::FrameTooLarge(header.total_len));
    }

    if header.total_len == 0 {
        return finish(header, Bytes::new(), None);
    }

    let len = header.total_len as usize;
    let mut payload = Vec::new();
    if payload.try_reserve_exact(len).is_err() {
        return failed(Error::OutOfMemory);
    }
    payload.resize(len, 0);

    State::PayloadPending {
        header,
        payload,
        filled: 0,
    }
}

/// Accumulates stream payload bytes until the whole payload is present.
fn read_payload<E>(
    io: &mut E,
    header: &Header,
    payload: &mut Vec<u8>,
    filled: &mut usize,
) -> Option<State>
where
    E: Endpoint + ?Sized,
{
    match io.read(&mut payload[*filled..]) {
        Ok(0) => Some(failed(Error::ConnectionClosed)),
        Ok(n) => {
            *filled += n;
            trace!("Read {n} payload bytes, {}/{}", *filled, payload.len());

            if *filled < payload.len() {
                return None;
            }

            let payload = Bytes::from(std::mem::take(payload));
            Some(finish(*header, payload, None))
        }
        Err(err) => io_failure(err),
    }
}

/// Receives a whole datagram frame and captures the sender's address.
fn recv_datagram<E>(io: &mut E, staging: &mut Vec<u8>, config: &QueueConfig) -> Option<State>
where
    E: Endpoint + ?Sized,
{
    if staging.is_empty() {
        if staging.try_reserve_exact(config.max_datagram_size).is_err() {
            return Some(failed(Error::OutOfMemory));
        }
        staging.resize(config.max_datagram_size, 0);
    }

    let (n, addr) = match io.recv_from(staging) {
        Ok(received) => received,
        Err(err) => return io_failure(err),
    };
    trace!("Received a {n} byte datagram from {addr:?}");

    if n < HEADER_SIZE {
        return Some(failed(Error::Malformed("datagram is shorter than a frame header")));
    }

    let mut raw = [0u8; HEADER_SIZE];
    raw.copy_from_slice(&staging[..HEADER_SIZE]);
    let header = match Header::parse(&raw) {
        Ok(header) => header,
        Err(err) => return Some(failed(err)),
    };

    if header.total_len > config.max_payload_len {
        return Some(failed(Error::FrameTooLarge(header.total_len)));
    }

    let message = Bytes::from(trim_message(std::mem::take(staging), n));
    Some(finish(header, message.slice(HEADER_SIZE..), addr))
}

/// Cuts a received datagram down to its length, so the popped segments do not keep the whole
/// staging buffer alive.
fn trim_message(mut staging: Vec<u8>, n: usize) -> Vec<u8> {
    staging.truncate(n);
    staging.shrink_to_fit();
    staging
}

/// Writes as much of the remaining frame as the endpoint accepts.
///
/// A datagram frame goes out in exactly one write. If the endpoint takes less than all of it, the
/// receiver would see a truncated message, so the request fails with `EMSGSIZE` instead.
fn write_frame<E>(
    io: &mut E,
    frame: &OutgoingFrame,
    written: &mut usize,
    addr: Option<SocketAddr>,
) -> Option<State>
where
    E: Endpoint + ?Sized,
{
    if *written == 0 && io.transport() == Transport::Datagram && !io.is_connected() {
        let Some(addr) = addr else {
            return Some(failed(Error::NoDestination));
        };

        if let Err(err) = io.connect(addr) {
            warn!("Could not connect to outgoing address {addr}: {err}");
            return Some(failed(err));
        }
    }

    let datagram = io.transport() == Transport::Datagram;
    let flat;
    let mut slices = frame.slices_from(*written);
    if datagram && slices.len() > MAX_IOVECS {
        trace!("Flattening a {} slice datagram frame", slices.len());
        flat = frame.to_vec();
        slices = vec![IoSlice::new(&flat)];
    }

    match io.writev(&slices) {
        Ok(n) if datagram && n < frame.wire_len() => {
            warn!("Datagram write took {n} of {} bytes", frame.wire_len());
            Some(failed(Error::Os(libc::EMSGSIZE)))
        }
        Ok(n) => {
            *written += n;
            trace!("Wrote {n} bytes, {}/{}", *written, frame.wire_len());

            if *written < frame.wire_len() {
                return None;
            }

            debug!("Sent a {} byte frame", frame.wire_len());
            Some(State::Done(OpResult::Pushed {
                nbytes: frame.data_len(),
            }))
        }
        Err(err) => io_failure(err),
    }
}

/// Splits a complete payload into the caller's array.
fn finish(header: Header, payload: Bytes, addr: Option<SocketAddr>) -> State {
    match decode_segments(&header, payload) {
        Ok(segments) => {
            let nbytes = header.payload_len();
            debug!(
                "Received a frame of {} segments, {nbytes} bytes",
                segments.len()
            );

            State::Done(OpResult::Popped {
                sga: SgArray { segments, addr },
                nbytes,
            })
        }
        Err(err) => failed(err),
    }
}

/// Maps an I/O error to either "retry later" or a failed request.
fn io_failure(err: io::Error) -> Option<State> {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => None,
        _ => Some(failed(err.into())),
    }
}

/// The terminal state for a failed request.
fn failed(err: Error) -> State {
    warn!("Request failed: {err}");
    State::Done(OpResult::Failed(err))
}
