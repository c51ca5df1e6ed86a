//! This module contains the definition and implementation of [`StorageDevice`], the single
//! implicit storage target that every storage queue reads frames from and appends frames to.
//!
//! The device is served by one dedicated worker thread running a `tokio-uring` runtime. Queues
//! live on the caller's thread and never block: they hand owned buffers to the worker over an
//! [`async_channel`] and pick up the completions later with non-blocking receives.

use crate::config::StorageConfig;
use crate::error::Result;
use async_channel::{Receiver, Sender};
use std::cell::Cell;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::thread::{self, JoinHandle};
use tokio_uring::fs::File;
use tracing::{debug, error, trace, warn};

/// A request sent to the storage worker.
#[derive(Debug)]
pub(crate) enum DeviceRequest {
    /// Read up to `len` bytes at `offset`.
    Read {
        /// Where to read from.
        offset: u64,
        /// The most bytes to read.
        len: usize,
        /// Where the completion goes.
        reply: Sender<DeviceCompletion>,
    },
    /// Write all of `data` at `offset`.
    Write {
        /// Where to write to, reserved with [`DeviceShared::reserve`].
        offset: u64,
        /// The encoded frame.
        data: Vec<u8>,
        /// Where the completion goes.
        reply: Sender<DeviceCompletion>,
    },
}

/// The worker's answer to one [`DeviceRequest`].
#[derive(Debug)]
pub(crate) enum DeviceCompletion {
    /// The bytes read; empty at end of file.
    Read(io::Result<Vec<u8>>),
    /// The number of bytes written.
    Written(io::Result<usize>),
}

/// The part of the device shared with every storage queue.
#[derive(Debug)]
pub(crate) struct DeviceShared {
    /// Where requests to the worker go.
    requests: Sender<DeviceRequest>,

    /// The offset the next appended frame is written at.
    ///
    /// Space is reserved when a write is submitted, so concurrent writers never overlap.
    write_offset: Cell<u64>,
}

impl DeviceShared {
    /// Reserves `len` bytes at the end of the target, returning their offset.
    pub(crate) fn reserve(&self, len: usize) -> u64 {
        let offset = self.write_offset.get();
        self.write_offset.set(offset + len as u64);
        offset
    }

    /// Hands a request to the worker.
    ///
    /// # Errors
    ///
    /// Returns a `BrokenPipe` error if the worker is no longer running.
    pub(crate) fn submit(&self, request: DeviceRequest) -> io::Result<()> {
        self.requests.try_send(request).map_err(|_| {
            error!("The storage worker is not running");
            io::Error::from(io::ErrorKind::BrokenPipe)
        })
    }
}

/// The storage target and the worker thread serving it.
#[derive(Debug)]
pub struct StorageDevice {
    /// The path of the target file.
    path: PathBuf,

    /// State shared with the storage queues.
    shared: Rc<DeviceShared>,

    /// The worker thread, joined when the device is dropped.
    worker: Option<JoinHandle<()>>,
}

impl StorageDevice {
    /// Opens the target at `path` and starts the worker thread dedicated to it.
    ///
    /// The file is opened for reading and writing; `O_CREAT` and `O_TRUNC` in `flags` are honored,
    /// and `mode` applies if the file is created.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the worker thread cannot be spawned.
    pub fn start(path: &Path, flags: i32, mode: u32, config: &StorageConfig) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(flags & libc::O_CREAT != 0)
            .truncate(flags & libc::O_TRUNC != 0)
            .mode(mode)
            .open(path)?;
        let len = file.metadata()?.len();

        let (tx, rx) = async_channel::unbounded();
        let core = config.worker_core;
        let entries = config.ring_entries;

        let worker = thread::Builder::new()
            .name("storage-worker".to_string())
            .spawn(move || {
                if let Some(id) = core {
                    if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
                        warn!("Unable to pin the storage worker to core {id}");
                    }
                }

                tokio_uring::builder()
                    .entries(entries)
                    .start(serve(File::from_std(file), rx));
            })?;

        debug!("Started storage worker for {} ({len} bytes)", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            shared: Rc::new(DeviceShared {
                requests: tx,
                write_offset: Cell::new(len),
            }),
            worker: Some(worker),
        })
    }

    /// Returns the path of the target file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the state shared with storage queues.
    pub(crate) fn shared(&self) -> Rc<DeviceShared> {
        self.shared.clone()
    }
}

impl Drop for StorageDevice {
    fn drop(&mut self) {
        self.shared.requests.close();

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("The storage worker for {} panicked", self.path.display());
            }
        }
    }
}

/// The worker's main loop: serves every request concurrently until the channel closes.
async fn serve(file: File, requests: Receiver<DeviceRequest>) {
    let file = Rc::new(file);

    while let Ok(request) = requests.recv().await {
        tokio_uring::spawn(handle(file.clone(), request));
    }

    trace!("Storage worker shutting down");
}

/// Carries out one request and sends the completion back to the queue that issued it.
async fn handle(file: Rc<File>, request: DeviceRequest) {
    match request {
        DeviceRequest::Read { offset, len, reply } => {
            let (res, buf) = file.read_at(Vec::with_capacity(len), offset).await;
            trace!("Read at offset {offset}: {res:?}");

            // The receiving queue may have been closed in the meantime.
            let _ = reply.try_send(DeviceCompletion::Read(res.map(|_| buf)));
        }
        DeviceRequest::Write {
            offset,
            data,
            reply,
        } => {
            let len = data.len();
            let (res, _) = file.write_all_at(data, offset).await;
            trace!("Wrote {len} bytes at offset {offset}: {res:?}");

            let _ = reply.try_send(DeviceCompletion::Written(res.map(|()| len)));
        }
    }
}
