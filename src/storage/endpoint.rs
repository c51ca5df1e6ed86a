//! Implementation of the [`DeviceEndpoint`] type.

use super::device::{DeviceCompletion, DeviceRequest, DeviceShared};
use crate::error::Result;
use crate::queue::endpoint::{Endpoint, Transport};
use crate::queue::Category;
use async_channel::{Receiver, Sender, TryRecvError};
use std::io::{self, IoSlice};
use std::rc::Rc;
use tracing::{trace, warn};

/// The request a [`DeviceEndpoint`] is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inflight {
    /// A read at `read_offset`.
    Read,
    /// An append.
    Write,
}

/// A storage queue's view of the [`StorageDevice`](super::StorageDevice), as a non-blocking stream.
///
/// Frames are appended at the end of the target and read back from the start, in order. Every
/// read or write is first submitted to the worker and reported as would-block; the queue retries,
/// and the retry that finds the completion returns its result.
///
/// At most one request per endpoint is in flight. A queue only services its head-of-line request,
/// but `peek` can leave a read behind, so a write first waits for that read and keeps its bytes.
#[derive(Debug)]
pub struct DeviceEndpoint {
    /// The device this endpoint submits to.
    device: Rc<DeviceShared>,

    /// The offset of the next byte this endpoint reads.
    read_offset: u64,

    /// Bytes read from the device but not yet handed to the queue.
    buffered: Vec<u8>,

    /// How much of `buffered` has been handed out.
    consumed: usize,

    /// The outstanding request, if any.
    inflight: Option<Inflight>,

    /// The channel completions for this endpoint arrive on.
    completions: (Sender<DeviceCompletion>, Receiver<DeviceCompletion>),
}

impl DeviceEndpoint {
    /// Creates an endpoint reading from the start of the device.
    pub(crate) fn new(device: Rc<DeviceShared>) -> Self {
        Self {
            device,
            read_offset: 0,
            buffered: Vec::new(),
            consumed: 0,
            inflight: None,
            completions: async_channel::unbounded(),
        }
    }

    /// Picks up the completion of the outstanding request, if it has arrived.
    fn try_complete(&mut self) -> io::Result<DeviceCompletion> {
        match self.completions.1.try_recv() {
            Ok(completion) => {
                self.inflight = None;
                Ok(completion)
            }
            Err(TryRecvError::Empty) => Err(io::ErrorKind::WouldBlock.into()),
            Err(TryRecvError::Closed) => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    /// Keeps the bytes a read brought back, after whatever is still unread.
    fn stash(&mut self, data: Vec<u8>) {
        trace!("Read {} bytes at offset {}", data.len(), self.read_offset);
        self.read_offset += data.len() as u64;
        self.buffered.drain(..self.consumed);
        self.consumed = 0;
        self.buffered.extend(data);
    }

    /// Copies buffered bytes into `buf`.
    fn drain_into(&mut self, buf: &mut [u8]) -> usize {
        let available = &self.buffered[self.consumed..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consumed += n;
        n
    }
}

impl Endpoint for DeviceEndpoint {
    fn transport(&self) -> Transport {
        Transport::Stream
    }

    fn category(&self) -> Category {
        Category::BypassStorage
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.consumed < self.buffered.len() {
            return Ok(self.drain_into(buf));
        }

        match self.inflight {
            None => {
                self.device.submit(DeviceRequest::Read {
                    offset: self.read_offset,
                    len: buf.len(),
                    reply: self.completions.0.clone(),
                })?;
                self.inflight = Some(Inflight::Read);
                Err(io::ErrorKind::WouldBlock.into())
            }
            Some(Inflight::Write) => Err(io::ErrorKind::WouldBlock.into()),
            Some(Inflight::Read) => match self.try_complete()? {
                // Nothing has been appended past our cursor yet.
                DeviceCompletion::Read(Ok(data)) if data.is_empty() => {
                    Err(io::ErrorKind::WouldBlock.into())
                }
                DeviceCompletion::Read(Ok(data)) => {
                    self.stash(data);
                    Ok(self.drain_into(buf))
                }
                DeviceCompletion::Read(Err(err)) => Err(err),
                DeviceCompletion::Written(_) => {
                    unreachable!("Received a write completion for an outstanding read")
                }
            },
        }
    }

    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match self.inflight {
            None => {}
            Some(Inflight::Read) => match self.try_complete()? {
                DeviceCompletion::Read(Ok(data)) => self.stash(data),
                DeviceCompletion::Read(Err(err)) => {
                    warn!("Dropping a failed read at offset {}: {err}", self.read_offset);
                }
                DeviceCompletion::Written(_) => {
                    unreachable!("Received a write completion for an outstanding read")
                }
            },
            Some(Inflight::Write) => {
                return match self.try_complete()? {
                    DeviceCompletion::Written(res) => res,
                    DeviceCompletion::Read(_) => {
                        unreachable!("Received a read completion for an outstanding write")
                    }
                };
            }
        }

        let data: Vec<u8> = bufs.iter().flat_map(|slice| slice.iter().copied()).collect();
        let offset = self.device.reserve(data.len());

        trace!("Submitting a {} byte write at offset {offset}", data.len());
        self.device.submit(DeviceRequest::Write {
            offset,
            data,
            reply: self.completions.0.clone(),
        })?;
        self.inflight = Some(Inflight::Write);
        Err(io::ErrorKind::WouldBlock.into())
    }

    fn close(&mut self) -> Result<()> {
        // The device outlives its queues; there is nothing to release here.
        Ok(())
    }
}
